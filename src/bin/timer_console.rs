use std::{
    io::{BufRead, Write},
    time::{SystemTime, UNIX_EPOCH},
};

use sand_timer::{Owned, Timer, TimerConfig};

struct ConsoleLogger;

impl log::Log for ConsoleLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let module_path = record.module_path().unwrap_or("unknown");
        println!("{:<5} {} {}", record.level(), module_path, record.args());
    }

    fn flush(&self) {}
}

static LOGGER: ConsoleLogger = ConsoleLogger;

const MENU: &str = "1. Pause timer
2. Resume timer
3. Restart timer
4. Reschedule timer
5. Cancel timer
6. Delete timer
7. Get remaining time
8. Print timer state";

fn main() {
    let level = match std::env::var("TIMER_LOG").as_deref() {
        Ok("trace") => log::LevelFilter::Trace,
        Ok("debug") => log::LevelFilter::Debug,
        Ok("warn") => log::LevelFilter::Warn,
        _ => log::LevelFilter::Info,
    };
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }

    let config = TimerConfig::from_millis(5000, 10_000);
    let timer = match Timer::with_user_data(config, Owned::new(String::from("subbu")))
        .set_expiration_event(|timer, name| {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default();
            println!(
                "[{}] expiration: name={} counter={} threshold={} {}",
                now,
                name.as_deref().map(String::as_str).unwrap_or("-"),
                timer.invocation_count(),
                timer.config().get_threshold(),
                timer.schedule()
            );
        })
        .build()
    {
        Ok(timer) => timer,
        Err(e) => {
            log::error!("Failed to initialize the timer: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = timer.start() {
        log::error!("{}", e);
        std::process::exit(1);
    }

    println!("{}", MENU);
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else {
            break;
        };
        let result = match line.trim().parse::<u8>() {
            Ok(1) => timer.pause(),
            Ok(2) => timer.resume(),
            Ok(3) => timer.restart(),
            Ok(4) => timer.reschedule(config.get_initial_delay(), config.get_interval()),
            Ok(5) => timer.cancel(),
            Ok(6) => {
                if let Err(e) = timer.release_user_data() {
                    println!("{}", e);
                }
                match timer.delete() {
                    Ok(()) => {
                        println!("Timer deleted");
                        return;
                    }
                    Err(e) => Err(e),
                }
            }
            Ok(7) => {
                match timer.remaining_time() {
                    Some(remaining) => println!("Remaining time = {}", remaining.as_millis()),
                    None => println!("Remaining time = n/a"),
                }
                Ok(())
            }
            Ok(8) => {
                println!("{}", timer);
                Ok(())
            }
            _ => {
                println!("Wrong choice: Pls enter choice between 1-8");
                Ok(())
            }
        };
        if let Err(e) = result {
            println!("{}", e);
        }
        let _ = std::io::stdout().flush();
    }
}
