//! Logging setup for the binary: coloured records on stderr, plain ones in an
//! optional log file. Library code only ever touches the `log` macros.

use std::io::stderr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;

use chrono::Local;
use fern::colors::Color::{Blue, Green, Magenta, Red, Yellow};
use fern::colors::ColoredLevelConfig;
use fern::Dispatch;
use log::{info, warn, LevelFilter, Record};

use crate::error::LoggerError;

static INIT_LOGGER_ONCE: Once = Once::new();
static LOGGER_ALREADY_CALLED: AtomicBool = AtomicBool::new(false);

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Install the global logger. Later calls log a warning and return `Ok`.
///
/// stdout is left alone: the console front-end prints events there.
pub fn initialize(level: LevelFilter, log_file: Option<&Path>) -> Result<(), LoggerError> {
    if LOGGER_ALREADY_CALLED.swap(true, Ordering::SeqCst) {
        warn!("logger already initialized");
        return Ok(());
    }

    let mut result = Ok(());
    INIT_LOGGER_ONCE.call_once(|| {
        result = build(level, log_file)
            .and_then(|dispatch| dispatch.apply().map_err(LoggerError::from));
        if result.is_ok() {
            info!("logger initialized with level {level}");
        }
    });
    result
}

fn build(level: LevelFilter, log_file: Option<&Path>) -> Result<Dispatch, LoggerError> {
    let colors = ColoredLevelConfig::new()
        .debug(Blue)
        .info(Green)
        .warn(Yellow)
        .error(Red)
        .trace(Magenta);

    let console = Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "{}",
                format_record(colors.color(record.level()), message, record)
            ))
        })
        .chain(stderr());

    let mut dispatch = Dispatch::new().level(level).chain(console);

    if let Some(path) = log_file {
        let file = Dispatch::new()
            .format(|out, message, record| {
                out.finish(format_args!(
                    "{}",
                    format_record(record.level(), message, record)
                ))
            })
            .chain(fern::log_file(path)?);
        dispatch = dispatch.chain(file);
    }

    Ok(dispatch)
}

fn format_record(
    level: impl std::fmt::Display,
    message: &std::fmt::Arguments<'_>,
    record: &Record<'_>,
) -> String {
    format!(
        "[{date} {level} {target}] {message}",
        date = Local::now().format(TIMESTAMP_FORMAT),
        target = record.target(),
    )
}
