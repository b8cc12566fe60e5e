use std::fmt::Display;

use crate::state::{Operation, TimerState};

#[derive(Debug)]
pub enum TimerError {
    BuildErrorNoCallbackSet,
    InvalidTransition { op: Operation, state: TimerState },
    OsResource(std::io::Error),
}

impl Display for TimerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimerError::BuildErrorNoCallbackSet => {
                write!(f, "Timer : Build error  No expiration callback set !")
            }
            TimerError::InvalidTransition { op, state } => {
                write!(f, "Timer : cannot {} a timer in state {}", op, state)
            }
            TimerError::OsResource(e) => {
                write!(f, "Os timer resource error [{:?}]", e.to_string())
            }
        }
    }
}

impl std::error::Error for TimerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TimerError::OsResource(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TimerError {
    fn from(value: std::io::Error) -> Self {
        TimerError::OsResource(value)
    }
}

impl From<nix::errno::Errno> for TimerError {
    fn from(value: nix::errno::Errno) -> Self {
        TimerError::OsResource(value.into())
    }
}
