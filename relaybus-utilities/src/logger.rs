use std::time::SystemTime;

use colored::Colorize;
use log::{Level, LevelFilter};
use relaybus_models::errors::SendableError;

fn colored_level(level: Level) -> String {
    match level {
        Level::Error => level.as_str().red().to_string(),
        Level::Warn => level.as_str().yellow().to_string(),
        Level::Info => level.as_str().green().to_string(),
        Level::Debug => level.as_str().blue().to_string(),
        Level::Trace => level.as_str().dimmed().to_string(),
    }
}

/// Install the process logger: colored stdout plus an optional plain log file.
pub fn setup_logger(level: LevelFilter, log_file: Option<&str>) -> Result<(), SendableError> {
    let stdout = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339_seconds(SystemTime::now()),
                colored_level(record.level()),
                record.target(),
                message
            ))
        })
        .chain(std::io::stdout());

    let mut dispatch = fern::Dispatch::new().level(level).chain(stdout);

    if let Some(path) = log_file {
        let file = fern::Dispatch::new()
            .format(|out, message, record| {
                out.finish(format_args!(
                    "[{} {} {}] {}",
                    humantime::format_rfc3339_seconds(SystemTime::now()),
                    record.level(),
                    record.target(),
                    message
                ))
            })
            .chain(fern::log_file(path)?);
        dispatch = dispatch.chain(file);
    }

    dispatch.apply()?;
    Ok(())
}
