use log::{info, LevelFilter};
use relaybus_models::errors::SendableError;

use crate::logger;

pub fn startup(name: &str, level: LevelFilter, log_file: Option<&str>) -> Result<(), SendableError> {
    logger::setup_logger(level, log_file)?;
    log_panics::init();

    info!("--- {} ---", name);
    let cwd = std::env::current_dir()?;
    info!("The current directory is {}", cwd.display());

    Ok(())
}
