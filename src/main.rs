use std::env::consts::{ARCH, FAMILY, OS};
use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use tracing::{error, trace};

use e621dl::config_loader::ConfigManager;
use e621dl::logger::init_logger;
use e621dl::program::Program;

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config_dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("./config"));

    let config = ConfigManager::load(&config_dir)
        .with_context(|| format!("Failed to load configuration from {}", config_dir.display()))?;

    let app = config.app_config();
    let _guard = init_logger(&app.logging, Path::new(&app.paths.log_directory))?;
    log_system_information();

    let program = Program::new(config);
    if let Err(e) = program.run().await {
        error!("{:#}", e);
        return Err(e);
    }
    Ok(())
}

/// Logs important information about the system being used.
fn log_system_information() {
    trace!("ARCH:   \"{}\"", ARCH);
    trace!("FAMILY: \"{}\"", FAMILY);
    trace!("OS:     \"{}\"", OS);
}
