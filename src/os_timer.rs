use crossbeam_channel::Sender;
use nix::{
    errno::Errno,
    poll::{PollFd, PollFlags, poll},
    sys::{
        time::{TimeSpec, TimeValLike},
        timer::Expiration as FdExpiration,
        timerfd::{ClockId, TimerFd, TimerFlags, TimerSetTimeFlags},
    },
};
use std::{
    fmt::Display,
    os::unix::prelude::AsRawFd,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread::JoinHandle,
    time::Duration,
};

use crate::{config::truncate_to_millis, errors::TimerError};

/// `(initial_delay, interval)` pair programmed into an [`OsTimer`].
///
/// A zero initial delay disarms the timer, a zero interval makes it one-shot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Schedule {
    pub initial_delay: Duration,
    pub interval: Duration,
}

impl Schedule {
    pub const DISARMED: Schedule = Schedule {
        initial_delay: Duration::ZERO,
        interval: Duration::ZERO,
    };

    pub fn new(initial_delay: Duration, interval: Duration) -> Self {
        Self {
            initial_delay: truncate_to_millis(initial_delay),
            interval: truncate_to_millis(interval),
        }
    }
    pub fn from_millis(initial_delay_ms: u64, interval_ms: u64) -> Self {
        Self::new(
            Duration::from_millis(initial_delay_ms),
            Duration::from_millis(interval_ms),
        )
    }
    pub fn is_disarmed(&self) -> bool {
        self.initial_delay.is_zero()
    }
}

impl Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "exp_time={}ms interval={}ms",
            self.initial_delay.as_millis(),
            self.interval.as_millis()
        )
    }
}

/// Longest delay the kernel timer accepts, about 292 years.
pub const MAX_ARM_DELAY: Duration = Duration::from_millis((i64::MAX / 1_000_000) as u64);

/// Notification sent by the reader thread each time the kernel timer expires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Expiration {
    /// Arm generation the expiration belongs to. Stale once the timer has been rearmed.
    pub generation: u64,
}

struct Shared {
    timer: TimerFd,
    generation: u64,
    shutdown: bool,
}

/// Thin binding over a Linux `timerfd`.
///
/// The kernel timer is armed, disarmed and queried under a lock. A reader thread polls the
/// descriptor and, under the same lock, consumes pending expirations before forwarding them
/// to the notification target given at creation. Since `timerfd_settime` clears pending
/// expirations, whatever the reader consumes belongs to the generation it tags it with.
/// No policy lives here: rearming, counting and state are the caller's business.
pub struct OsTimer {
    shared: Arc<Mutex<Shared>>,
    reader: Option<JoinHandle<()>>,
}

impl OsTimer {
    /// Creates a disarmed timer bound to `notify`.
    pub fn create(name: String, notify: Sender<Expiration>) -> Result<Self, TimerError> {
        let timer = TimerFd::new(
            ClockId::CLOCK_MONOTONIC,
            TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC,
        )?;
        let fd = timer.as_raw_fd();
        let shared = Arc::new(Mutex::new(Shared {
            timer,
            generation: 0,
            shutdown: false,
        }));

        let reader_shared = shared.clone();
        let reader = std::thread::Builder::new().name(name).spawn(move || {
            loop {
                let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
                match poll(&mut fds, -1) {
                    Ok(_) | Err(Errno::EINTR) => {}
                    Err(e) => {
                        log::error!("os timer poll failed: {}", e);
                        break;
                    }
                }

                let fired = {
                    let shared = lock(&reader_shared);
                    if shared.shutdown {
                        break;
                    }
                    match shared.timer.wait() {
                        Ok(()) => Some(Expiration {
                            generation: shared.generation,
                        }),
                        // rearmed or disarmed since poll returned.
                        Err(Errno::EAGAIN) => None,
                        Err(e) => {
                            log::error!("os timer read failed: {}", e);
                            break;
                        }
                    }
                };
                if let Some(expiration) = fired {
                    if notify.send(expiration).is_err() {
                        // nobody listens anymore.
                        break;
                    }
                }
            }
            log::trace!("os timer reader exited");
        })?;

        Ok(Self {
            shared,
            reader: Some(reader),
        })
    }

    /// Programs `schedule`, replacing whatever was armed. Returns the new arm generation.
    pub fn arm(&self, schedule: Schedule) -> Result<u64, TimerError> {
        if self.reader.as_ref().is_none_or(|r| r.is_finished()) {
            return Err(reader_gone());
        }
        let expiration = if schedule.is_disarmed() {
            None
        } else if schedule.interval.is_zero() {
            Some(FdExpiration::OneShot(to_timespec(schedule.initial_delay)?))
        } else {
            Some(FdExpiration::IntervalDelayed(
                to_timespec(schedule.initial_delay)?,
                to_timespec(schedule.interval)?,
            ))
        };

        let mut shared = lock(&self.shared);
        match expiration {
            Some(expiration) => shared.timer.set(expiration, TimerSetTimeFlags::empty())?,
            None => shared.timer.unset()?,
        }
        shared.generation = shared.generation.wrapping_add(1);
        Ok(shared.generation)
    }

    /// Time left until the next expiration, zero when disarmed.
    pub fn query(&self) -> Result<Duration, TimerError> {
        let remaining = match lock(&self.shared).timer.get()? {
            None => Duration::ZERO,
            Some(FdExpiration::OneShot(value))
            | Some(FdExpiration::IntervalDelayed(value, _))
            | Some(FdExpiration::Interval(value)) => {
                Duration::from_millis(u64::try_from(value.num_milliseconds()).unwrap_or(0))
            }
        };
        Ok(remaining)
    }

    /// Closes the kernel timer once the reader thread is gone.
    pub fn destroy(mut self) -> Result<(), TimerError> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<(), TimerError> {
        let Some(reader) = self.reader.take() else {
            return Ok(());
        };
        {
            let mut shared = lock(&self.shared);
            shared.shutdown = true;
            // fire right away so the reader leaves poll.
            shared.timer.set(
                FdExpiration::OneShot(TimeSpec::nanoseconds(1)),
                TimerSetTimeFlags::empty(),
            )?;
        }
        reader.join().map_err(|_| {
            TimerError::OsResource(std::io::Error::other("os timer reader panicked"))
        })
    }
}

impl Drop for OsTimer {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("{}", e);
        }
    }
}

fn to_timespec(duration: Duration) -> Result<TimeSpec, TimerError> {
    if duration > MAX_ARM_DELAY {
        return Err(TimerError::OsResource(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("delay of {}ms is out of range", duration.as_millis()),
        )));
    }
    let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX / 1_000_000);
    Ok(TimeSpec::milliseconds(millis))
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

fn reader_gone() -> TimerError {
    TimerError::OsResource(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "os timer reader is not running",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_shot_fires_once() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let timer = OsTimer::create("os-timer-test".into(), tx).unwrap();
        let generation = timer.arm(Schedule::from_millis(30, 0)).unwrap();

        let expiration = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(expiration.generation, generation);
        assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());
        assert_eq!(timer.query().unwrap(), Duration::ZERO);
        timer.destroy().unwrap();
    }

    #[test]
    fn periodic_keeps_firing() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let timer = OsTimer::create("os-timer-test".into(), tx).unwrap();
        timer.arm(Schedule::from_millis(20, 20)).unwrap();

        for _ in 0..3 {
            rx.recv_timeout(Duration::from_secs(2)).unwrap();
        }
        timer.arm(Schedule::DISARMED).unwrap();
        while rx.try_recv().is_ok() {}
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn query_reports_remaining_time() {
        let (tx, _rx) = crossbeam_channel::unbounded();
        let timer = OsTimer::create("os-timer-test".into(), tx).unwrap();
        timer.arm(Schedule::from_millis(5_000, 0)).unwrap();

        let remaining = timer.query().unwrap();
        assert!(remaining <= Duration::from_millis(5_000));
        assert!(remaining > Duration::from_millis(4_000));
    }

    #[test]
    fn rearm_bumps_generation() {
        let (tx, _rx) = crossbeam_channel::unbounded();
        let timer = OsTimer::create("os-timer-test".into(), tx).unwrap();
        let first = timer.arm(Schedule::from_millis(1_000, 0)).unwrap();
        let second = timer.arm(Schedule::DISARMED).unwrap();
        assert_ne!(first, second);
        assert_eq!(timer.query().unwrap(), Duration::ZERO);
    }

    #[test]
    fn out_of_range_delay_is_rejected() {
        let (tx, _rx) = crossbeam_channel::unbounded();
        let timer = OsTimer::create("os-timer-test".into(), tx).unwrap();
        let generation = timer.arm(Schedule::from_millis(1_000, 0)).unwrap();

        let too_long = Schedule::new(MAX_ARM_DELAY + Duration::from_secs(1), Duration::ZERO);
        assert!(matches!(timer.arm(too_long), Err(TimerError::OsResource(_))));
        // the previous arm is untouched.
        assert!(timer.query().unwrap() > Duration::ZERO);
        assert_eq!(timer.arm(Schedule::DISARMED).unwrap(), generation + 1);
    }
}
