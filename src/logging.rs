use std::io::Write;
use std::time::{Duration, Instant};

use lazy_static::lazy_static;

lazy_static! {
    static ref START_TIME: Instant = Instant::now();
}

pub fn elapsed() -> Duration {
    START_TIME.elapsed()
}

/// Installs an stderr logger prefixing records with the elapsed run time
/// as `[HH:MM:SS] LEVEL: message`.
///
/// Verbose runs log at Info, others at Warn; `RUST_LOG` still applies on
/// top. Calling it twice is harmless.
pub fn init_logger(verbose: bool) {
    lazy_static::initialize(&START_TIME);

    let level = if verbose {
        log::LevelFilter::Info
    } else {
        log::LevelFilter::Warn
    };

    let _ = env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format(|buf, record| {
            let secs = elapsed().as_secs();
            writeln!(
                buf,
                "[{:02}:{:02}:{:02}] {}: {}",
                secs / 3600,
                (secs % 3600) / 60,
                secs % 60,
                record.level(),
                record.args()
            )
        })
        .target(env_logger::Target::Stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice() {
        init_logger(false);
        init_logger(true);
        log::warn!("logger initialized");
        assert!(elapsed() < Duration::from_secs(3600));
    }
}
