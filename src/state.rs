use std::fmt::Display;

use crate::errors::TimerError;

/// Lifecycle state of a [`Timer`](crate::Timer).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerState {
    Init,
    Running,
    Cancelled,
    Paused,
    Resumed,
    Deleted,
}

impl TimerState {
    /// Human readable label of the state.
    pub fn describe(&self) -> &'static str {
        match self {
            Self::Init => "TIMER_INIT",
            Self::Running => "TIMER_RUNNING",
            Self::Cancelled => "TIMER_CANCELLED",
            Self::Paused => "TIMER_PAUSED",
            Self::Resumed => "TIMER_RESUMED",
            Self::Deleted => "TIMER_DELETED",
        }
    }
    /// The os timer is armed in these states.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running | Self::Resumed)
    }
}

impl Display for TimerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.describe())
    }
}

/// Everything that can move a timer from one state to another.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Start,
    Pause,
    Resume,
    Cancel,
    Restart,
    Reschedule,
    Delete,
    /// An expiration delivered by the notification context.
    Expire,
    /// The expiration that crosses the invocation threshold.
    ThresholdReached,
    /// Dropping the user data owned by the timer. Leaves the state untouched.
    ReleaseUserData,
}

impl Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Cancel => "cancel",
            Self::Restart => "restart",
            Self::Reschedule => "reschedule",
            Self::Delete => "delete",
            Self::Expire => "expire",
            Self::ThresholdReached => "auto-cancel",
            Self::ReleaseUserData => "release the user data of",
        };
        write!(f, "{}", label)
    }
}

/// Outcome of a valid transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// Perform the operation, ending in the given state.
    To(TimerState),
    /// Accepted, but nothing to do.
    Noop,
}

/// The transition table. Every lifecycle command consults it before touching the os timer.
pub fn transition(state: TimerState, op: Operation) -> Result<Transition, TimerError> {
    use Operation as O;
    use TimerState as S;
    use Transition::{Noop, To};

    let next = match (state, op) {
        (S::Deleted, _) => None,

        (_, O::Start) => Some(To(S::Running)),

        (S::Running | S::Resumed, O::Pause) => Some(To(S::Paused)),
        (S::Paused, O::Pause) => Some(Noop),
        (S::Init | S::Cancelled, O::Pause) => None,

        (S::Paused, O::Resume) => Some(To(S::Resumed)),
        (_, O::Resume) => None,

        (S::Init | S::Cancelled, O::Cancel) => Some(Noop),
        (S::Running | S::Paused | S::Resumed, O::Cancel) => Some(To(S::Cancelled)),

        (_, O::Restart) => Some(To(S::Running)),
        (_, O::Reschedule) => Some(To(S::Running)),
        (_, O::Delete) => Some(To(S::Deleted)),

        (S::Running | S::Resumed, O::Expire) => Some(To(S::Running)),
        (S::Running | S::Resumed, O::ThresholdReached) => Some(To(S::Cancelled)),
        (S::Init | S::Paused | S::Cancelled, O::Expire | O::ThresholdReached) => None,

        (_, O::ReleaseUserData) => Some(Noop),
    };

    next.ok_or(TimerError::InvalidTransition { op, state })
}
