mod backoff;
mod config;
mod dispatcher;
mod errors;
mod os_timer;
pub mod route_table;
mod state;
#[cfg(test)]
mod test;
mod timer;
mod user_data;

pub use backoff::next_backoff;
pub use config::TimerConfig;
pub use errors::TimerError;
pub use os_timer::{Expiration, MAX_ARM_DELAY, OsTimer, Schedule};
pub use state::{Operation, Transition, TimerState, transition};
pub use timer::{ExpirationCallback, Timer, TimerBuilder};
pub use user_data::{Borrowed, Owned, UserData};

pub mod prelude {
    pub use super::{
        Borrowed, Owned, Schedule, Timer, TimerConfig, TimerError, TimerState, UserData,
    };
}
