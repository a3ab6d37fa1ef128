//! Logger configuration with structured, aligned output.
//!
//! Format: `timestamp [LEVEL] target file:line  message`. Colors follow the
//! level and are suppressed when `NO_COLOR` is set or stdout is not a TTY
//! (env_logger's own detection).

use chrono::Local;
use env_logger::Builder;
use log::LevelFilter;
use std::env;
use std::io::Write;

/// Configures the process-wide logger.
///
/// `RUST_LOG` selects the filter (default `info`); `NO_COLOR` disables
/// colored level tags. Safe to call once at startup; later calls are
/// ignored by `env_logger`.
pub fn configure_logger() {
    let filter = env::var("RUST_LOG")
        .ok()
        .and_then(|v| v.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info);

    let color = env::var("NO_COLOR").is_err();

    let mut builder = Builder::new();
    builder
        .filter_level(filter)
        .format(move |buf, record| {
            let ts = Local::now().format("%Y-%m-%dT%H:%M:%S%.3f");
            let level = record.level();
            let tag = if color {
                match level {
                    log::Level::Error => format!("\x1b[31m{:<5}\x1b[0m", level),
                    log::Level::Warn => format!("\x1b[33m{:<5}\x1b[0m", level),
                    log::Level::Info => format!("\x1b[32m{:<5}\x1b[0m", level),
                    log::Level::Debug => format!("\x1b[36m{:<5}\x1b[0m", level),
                    log::Level::Trace => format!("{:<5}", level),
                }
            } else {
                format!("{:<5}", level)
            };
            writeln!(
                buf,
                "{} [{}] {} {}:{}  {}",
                ts,
                tag,
                record.target(),
                record.file().unwrap_or("?"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .try_init()
        .ok();
}
