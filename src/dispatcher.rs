use crossbeam_channel::Receiver;
use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Weak,
    time::Duration,
};

use crate::{
    backoff::next_backoff,
    errors::TimerError,
    os_timer::Expiration,
    timer::{Timer, TimerInner},
    user_data::UserData,
};

/// Notification context of a timer.
///
/// Runs on its own thread and receives the expirations of one os timer. Each expiration is
/// handled under the timer lock, except for the user callback itself.
pub(crate) struct Dispatcher;

impl Dispatcher {
    /// The thread ends once the os timer is destroyed or the timer dropped.
    pub(crate) fn spawn<D: UserData>(
        id: u64,
        timer: Weak<TimerInner<D>>,
        expirations: Receiver<Expiration>,
    ) -> Result<(), TimerError> {
        std::thread::Builder::new()
            .name(format!("timer-{}-notify", id))
            .spawn(move || {
                for expiration in expirations.iter() {
                    let Some(inner) = timer.upgrade() else {
                        break;
                    };
                    Timer { inner }.dispatch(expiration);
                }
                log::trace!("timer [{}] notification thread exited", id);
            })?;
        Ok(())
    }
}

impl<D: UserData> Timer<D> {
    pub(crate) fn dispatch(&self, expiration: Expiration) {
        let id = self.inner.id;
        let config = &self.inner.config;

        let generation = {
            let mut core = self.inner.lock();
            if !core.expire(id, expiration.generation) {
                return;
            }
            let threshold = config.get_threshold();
            if threshold != 0 && core.invocation_count() > threshold {
                log::debug!("timer [{}] reached its threshold of {}", id, threshold);
                if let Err(e) = core.cancel_on_threshold(id) {
                    log::error!("timer [{}] auto-cancel failed: {}", id, e);
                }
                return;
            }
            core.generation()
        };

        let user_data = self.inner.user_data.as_ref().and_then(|data| data.get());
        let outcome = catch_unwind(AssertUnwindSafe(|| (self.inner.callback)(self, user_data)));

        let mut core = self.inner.lock();
        if outcome.is_err() {
            log::error!("timer [{}] expiration callback panicked, cancelling", id);
            if let Err(e) = core.cancel(id) {
                log::error!("timer [{}] {}", id, e);
            }
            return;
        }
        // a command went through while the callback ran, it has the last word.
        if core.generation() != generation || !core.state().is_running() {
            return;
        }

        let rearmed = if config.is_exponential_backoff() {
            if core.backoff_interval() == Duration::ZERO {
                log::debug!("timer [{}] backoff interval is zero, not rearming", id);
                return;
            }
            let next = next_backoff(core.backoff_interval());
            core.reschedule(id, config, next, Duration::ZERO)
        } else {
            core.reschedule(id, config, config.get_initial_delay(), config.get_interval())
        };
        // `reschedule` leaves the timer cancelled when rearming fails.
        if let Err(e) = rearmed {
            log::error!("timer [{}] rearm failed: {}", id, e);
        }
    }
}
