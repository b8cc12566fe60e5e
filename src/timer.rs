pub use handle::{ExpirationCallback, Timer, TimerBuilder};
pub(crate) use handle::TimerInner;

mod handle {
    use std::{
        fmt::Display,
        sync::{
            Arc, Mutex, MutexGuard, PoisonError,
            atomic::{AtomicU64, Ordering},
        },
        time::Duration,
    };

    use crate::{
        config::TimerConfig,
        dispatcher::Dispatcher,
        errors::TimerError,
        os_timer::{OsTimer, Schedule},
        state::TimerState,
        user_data::{Borrowed, Owned, UserData},
    };

    use super::timer_core::TimerCore;

    static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

    /// Callback invoked on every expiration below the threshold, outside of the caller's thread.
    pub type ExpirationCallback<D> =
        Arc<dyn Fn(&Timer<D>, Option<Arc<<D as UserData>::Value>>) + Send + Sync + 'static>;

    pub struct TimerBuilder<D: UserData> {
        config: TimerConfig,
        expiration_event_call_back: Option<ExpirationCallback<D>>,
        user_data: Option<D>,
    }

    impl<D: UserData> TimerBuilder<D> {
        pub fn set_expiration_event(
            &mut self,
            event: impl Fn(&Timer<D>, Option<Arc<D::Value>>) + Send + Sync + 'static,
        ) -> &mut Self {
            self.expiration_event_call_back = Some(Arc::new(event));
            self
        }
        pub fn set_config(&mut self, config: TimerConfig) -> &mut Self {
            self.config = config;
            self
        }
        /// Creates the timer and its os resource. The timer is left in [`TimerState::Init`],
        /// nothing is armed before [`Timer::start`].
        pub fn build(&mut self) -> Result<Timer<D>, TimerError> {
            let Some(callback) = self.expiration_event_call_back.take() else {
                return Err(TimerError::BuildErrorNoCallbackSet);
            };
            let id = NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed);
            let config = self.config;

            let (notify, expirations) = crossbeam_channel::unbounded();
            let os_timer = OsTimer::create(format!("timer-{}", id), notify)?;

            let inner = Arc::new(TimerInner {
                id,
                config,
                callback,
                user_data: self.user_data.take(),
                core: Mutex::new(TimerCore::new(&config, os_timer)),
            });
            Dispatcher::spawn(id, Arc::downgrade(&inner), expirations)?;

            log::debug!("timer [{}] created ({})", id, TimerCore::initial_schedule(&config));
            Ok(Timer { inner })
        }
    }

    pub(crate) struct TimerInner<D: UserData> {
        pub(crate) id: u64,
        pub(crate) config: TimerConfig,
        pub(crate) callback: ExpirationCallback<D>,
        pub(crate) user_data: Option<D>,
        pub(crate) core: Mutex<TimerCore>,
    }

    impl<D: UserData> TimerInner<D> {
        pub(crate) fn lock(&self) -> MutexGuard<'_, TimerCore> {
            self.core.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// Handle to a controllable timer.
    ///
    /// Cloning the handle shares the same timer. Expirations are delivered on a dedicated
    /// notification thread that runs the callback with a handle of its own, so the callback
    /// can drive the timer (cancel, reschedule, delete...) like any other caller.
    ///
    /// Every command is serialized with the notification thread by a per-timer lock, which is
    /// released while the user callback runs.
    pub struct Timer<D: UserData = Borrowed<()>> {
        pub(crate) inner: Arc<TimerInner<D>>,
    }

    impl<D: UserData> Clone for Timer<D> {
        fn clone(&self) -> Self {
            Self {
                inner: self.inner.clone(),
            }
        }
    }

    impl Timer<Borrowed<()>> {
        ///
        /// Creates a new [`TimerBuilder`] for a timer without user data.
        ///
        /// ### Example
        /// ```rust
        /// use sand_timer::{Timer, TimerConfig};
        ///
        /// let timer = Timer::new(TimerConfig::from_millis(5000, 10_000))
        ///     .set_expiration_event(|timer, _| {
        ///         println!("fired {} times", timer.invocation_count());
        ///     })
        ///     .build()
        ///     .unwrap();
        /// timer.start().unwrap();
        /// ```
        pub fn new(config: TimerConfig) -> TimerBuilder<Borrowed<()>> {
            TimerBuilder {
                config,
                expiration_event_call_back: None,
                user_data: None,
            }
        }
    }

    impl<D: UserData> Timer<D> {
        /// Creates a new [`TimerBuilder`] whose callback receives `user_data`.
        ///
        /// Pass a [`Borrowed`] to keep ownership on the caller side, an [`Owned`] to hand it to
        /// the timer.
        pub fn with_user_data(config: TimerConfig, user_data: D) -> TimerBuilder<D> {
            TimerBuilder {
                config,
                expiration_event_call_back: None,
                user_data: Some(user_data),
            }
        }

        /// Arms the timer with its current schedule.
        pub fn start(&self) -> Result<(), TimerError> {
            self.inner.lock().start(self.inner.id, &self.inner.config)
        }
        /// Snapshots the remaining time and disarms. No-op when already paused.
        pub fn pause(&self) -> Result<(), TimerError> {
            self.inner.lock().pause(self.inner.id)
        }
        /// Rearms a paused timer with the time that was left when it was paused.
        pub fn resume(&self) -> Result<(), TimerError> {
            self.inner.lock().resume(self.inner.id, &self.inner.config)
        }
        /// Disarms and resets the invocation counter.
        ///
        /// An expiration already queued for delivery is discarded, a callback already running
        /// completes but does not rearm.
        pub fn cancel(&self) -> Result<(), TimerError> {
            self.inner.lock().cancel(self.inner.id)
        }
        /// Starts over from the configured schedule with a zeroed counter.
        pub fn restart(&self) -> Result<(), TimerError> {
            self.inner.lock().restart(self.inner.id, &self.inner.config)
        }
        /// Arms a new schedule, keeping the invocation counter.
        pub fn reschedule(&self, initial_delay: Duration, interval: Duration) -> Result<(), TimerError> {
            self.inner
                .lock()
                .reschedule(self.inner.id, &self.inner.config, initial_delay, interval)
        }
        /// Releases the os resource. Every later command is rejected.
        ///
        /// User data is not released: see [`Timer::release_user_data`].
        pub fn delete(&self) -> Result<(), TimerError> {
            self.inner.lock().delete(self.inner.id)
        }

        /// Time left before the next expiration, `None` once cancelled or deleted.
        pub fn remaining_time(&self) -> Option<Duration> {
            self.inner.lock().remaining_time(self.inner.id)
        }
        pub fn state(&self) -> TimerState {
            self.inner.lock().state()
        }
        pub fn is_running(&self) -> bool {
            self.state().is_running()
        }
        /// Expirations delivered since creation or the last cancel or restart.
        pub fn invocation_count(&self) -> u32 {
            self.inner.lock().invocation_count()
        }
        /// Schedule currently programmed into the os timer.
        pub fn schedule(&self) -> Schedule {
            self.inner.lock().schedule()
        }
        /// Current one-shot delay of a backoff timer, zero otherwise.
        pub fn backoff_interval(&self) -> Duration {
            self.inner.lock().backoff_interval()
        }
        pub fn config(&self) -> &TimerConfig {
            &self.inner.config
        }
        pub fn id(&self) -> u64 {
            self.inner.id
        }
    }

    impl<T: Send + Sync + 'static> Timer<Owned<T>> {
        /// Releases the user data owned by the timer. Returns `false` when it was already released.
        ///
        /// Release it before [`Timer::delete`]: a deleted timer rejects it like any other command.
        pub fn release_user_data(&self) -> Result<bool, TimerError> {
            self.inner.lock().release_user_data(self.inner.id, || match &self.inner.user_data {
                Some(data) => data.release(),
                None => false,
            })
        }
    }

    impl<D: UserData> Display for Timer<D> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            let remaining = match self.remaining_time() {
                Some(remaining) => format!("{}ms", remaining.as_millis()),
                None => "n/a".to_string(),
            };
            write!(
                f,
                "Counter = {}, time remaining = {}, state = {}",
                self.invocation_count(),
                remaining,
                self.state()
            )
        }
    }
}

mod timer_core {
    use std::time::Duration;

    use crate::{
        config::TimerConfig,
        errors::TimerError,
        os_timer::{OsTimer, Schedule},
        state::{Operation, TimerState, Transition, transition},
    };

    /// Shortest delay a timer is ever rearmed with, a zero delay would disarm it.
    const MIN_REARM_DELAY: Duration = Duration::from_millis(1);

    /// Dynamic state of a timer. Always accessed under the timer lock.
    pub(crate) struct TimerCore {
        state: TimerState,
        invocation_counter: u32,
        remaining: Duration,
        backoff_interval: Duration,
        schedule: Schedule,
        generation: u64,
        os_timer: Option<OsTimer>,
    }

    impl TimerCore {
        pub(crate) fn new(config: &TimerConfig, os_timer: OsTimer) -> Self {
            Self {
                state: TimerState::Init,
                invocation_counter: 0,
                remaining: Duration::ZERO,
                backoff_interval: Self::initial_backoff(config),
                schedule: Self::initial_schedule(config),
                generation: 0,
                os_timer: Some(os_timer),
            }
        }

        /// Schedule a timer starts from. Backoff timers never carry an interval.
        pub(crate) fn initial_schedule(config: &TimerConfig) -> Schedule {
            if config.is_exponential_backoff() {
                Schedule::new(config.get_initial_delay(), Duration::ZERO)
            } else {
                Schedule::new(config.get_initial_delay(), config.get_interval())
            }
        }

        fn initial_backoff(config: &TimerConfig) -> Duration {
            if config.is_exponential_backoff() {
                config.get_initial_delay()
            } else {
                Duration::ZERO
            }
        }

        fn check(&self, id: u64, op: Operation) -> Result<Transition, TimerError> {
            transition(self.state, op).inspect_err(|e| log::warn!("timer [{}] {}", id, e))
        }

        /// Programs the os timer. On failure the timer can no longer be trusted to fire, so it
        /// ends up cancelled.
        fn program(&mut self, id: u64, schedule: Schedule) -> Result<(), TimerError> {
            let armed = match &self.os_timer {
                Some(os_timer) => os_timer.arm(schedule),
                None => Err(TimerError::OsResource(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "os timer already destroyed",
                ))),
            };
            match armed {
                Ok(generation) => {
                    self.generation = generation;
                    self.schedule = schedule;
                    log::debug!("timer [{}] armed {}", id, schedule);
                    Ok(())
                }
                Err(e) => Err(self.fail(id, e)),
            }
        }

        fn fail(&mut self, id: u64, e: TimerError) -> TimerError {
            log::error!("timer [{}] {}", id, e);
            if self.state != TimerState::Deleted {
                self.state = TimerState::Cancelled;
            }
            if let Some(Ok(generation)) = self.os_timer.as_ref().map(|os| os.arm(Schedule::DISARMED)) {
                self.generation = generation;
            }
            self.schedule = Schedule::DISARMED;
            self.remaining = Duration::ZERO;
            self.invocation_counter = 0;
            e
        }

        fn enter(&mut self, id: u64, next: TimerState) {
            if self.state != next {
                log::debug!("timer [{}] {} -> {}", id, self.state, next);
            }
            self.state = next;
        }

        pub(crate) fn start(&mut self, id: u64, config: &TimerConfig) -> Result<(), TimerError> {
            let Transition::To(next) = self.check(id, Operation::Start)? else {
                return Ok(());
            };
            // paused or cancelled timers lost their schedule, start them over.
            if self.schedule.is_disarmed() {
                self.schedule = Self::initial_schedule(config);
                self.backoff_interval = Self::initial_backoff(config);
            }
            self.remaining = Duration::ZERO;
            self.program(id, self.schedule)?;
            self.enter(id, next);
            Ok(())
        }

        pub(crate) fn pause(&mut self, id: u64) -> Result<(), TimerError> {
            let Transition::To(next) = self.check(id, Operation::Pause)? else {
                return Ok(());
            };
            let remaining = self.query(id)?;
            self.program(id, Schedule::DISARMED)?;
            self.remaining = remaining;
            self.enter(id, next);
            Ok(())
        }

        pub(crate) fn resume(&mut self, id: u64, config: &TimerConfig) -> Result<(), TimerError> {
            let Transition::To(next) = self.check(id, Operation::Resume)? else {
                return Ok(());
            };
            let interval = if config.is_exponential_backoff() {
                Duration::ZERO
            } else {
                config.get_interval()
            };
            let delay = self.remaining.max(MIN_REARM_DELAY);
            self.program(id, Schedule::new(delay, interval))?;
            self.remaining = Duration::ZERO;
            self.enter(id, next);
            Ok(())
        }

        pub(crate) fn cancel(&mut self, id: u64) -> Result<(), TimerError> {
            self.cancel_as(id, Operation::Cancel)
        }

        /// Cancellation forced by the notification context once the threshold is crossed.
        pub(crate) fn cancel_on_threshold(&mut self, id: u64) -> Result<(), TimerError> {
            self.cancel_as(id, Operation::ThresholdReached)
        }

        fn cancel_as(&mut self, id: u64, op: Operation) -> Result<(), TimerError> {
            let Transition::To(next) = self.check(id, op)? else {
                return Ok(());
            };
            self.program(id, Schedule::DISARMED)?;
            self.remaining = Duration::ZERO;
            self.invocation_counter = 0;
            self.enter(id, next);
            Ok(())
        }

        pub(crate) fn restart(&mut self, id: u64, config: &TimerConfig) -> Result<(), TimerError> {
            let Transition::To(next) = self.check(id, Operation::Restart)? else {
                return Ok(());
            };
            self.cancel(id)?;
            self.invocation_counter = 0;
            self.remaining = Duration::ZERO;
            self.backoff_interval = Self::initial_backoff(config);
            self.program(id, Self::initial_schedule(config))?;
            self.enter(id, next);
            Ok(())
        }

        pub(crate) fn reschedule(
            &mut self,
            id: u64,
            config: &TimerConfig,
            initial_delay: Duration,
            interval: Duration,
        ) -> Result<(), TimerError> {
            let Transition::To(next) = self.check(id, Operation::Reschedule)? else {
                return Ok(());
            };
            let invocation_counter = self.invocation_counter;
            if self.state != TimerState::Cancelled {
                self.cancel(id)?;
            }
            self.invocation_counter = invocation_counter;

            let schedule = if config.is_exponential_backoff() {
                self.backoff_interval = initial_delay;
                Schedule::new(initial_delay, Duration::ZERO)
            } else {
                self.backoff_interval = Duration::ZERO;
                Schedule::new(initial_delay, interval)
            };
            self.remaining = Duration::ZERO;
            self.program(id, schedule)?;
            self.enter(id, next);
            Ok(())
        }

        pub(crate) fn release_user_data(
            &self,
            id: u64,
            release: impl FnOnce() -> bool,
        ) -> Result<bool, TimerError> {
            self.check(id, Operation::ReleaseUserData)?;
            Ok(release())
        }

        pub(crate) fn delete(&mut self, id: u64) -> Result<(), TimerError> {
            let Transition::To(next) = self.check(id, Operation::Delete)? else {
                return Ok(());
            };
            self.enter(id, next);
            self.schedule = Schedule::DISARMED;
            self.remaining = Duration::ZERO;
            match self.os_timer.take() {
                Some(os_timer) => os_timer.destroy().inspect_err(|e| log::error!("timer [{}] {}", id, e)),
                None => Ok(()),
            }
        }

        /// Counts one delivered expiration. Returns `false` when the expiration is stale: the
        /// timer was rearmed, disarmed or deleted since it was programmed.
        pub(crate) fn expire(&mut self, id: u64, generation: u64) -> bool {
            if generation != self.generation {
                log::trace!("timer [{}] dropping stale expiration", id);
                return false;
            }
            let Ok(Transition::To(next)) = transition(self.state, Operation::Expire) else {
                log::trace!("timer [{}] dropping expiration while {}", id, self.state);
                return false;
            };
            self.invocation_counter = self.invocation_counter.saturating_add(1);
            self.enter(id, next);
            true
        }

        fn query(&mut self, id: u64) -> Result<Duration, TimerError> {
            let queried = match &self.os_timer {
                Some(os_timer) => os_timer.query(),
                None => Ok(Duration::ZERO),
            };
            queried.map_err(|e| self.fail(id, e))
        }

        pub(crate) fn remaining_time(&mut self, id: u64) -> Option<Duration> {
            if matches!(self.state, TimerState::Cancelled | TimerState::Deleted) {
                return None;
            }
            self.query(id).ok()
        }

        pub(crate) fn state(&self) -> TimerState {
            self.state
        }
        pub(crate) fn invocation_count(&self) -> u32 {
            self.invocation_counter
        }
        pub(crate) fn schedule(&self) -> Schedule {
            self.schedule
        }
        pub(crate) fn backoff_interval(&self) -> Duration {
            self.backoff_interval
        }
        pub(crate) fn generation(&self) -> u64 {
            self.generation
        }
    }
}
