pub mod database;
pub mod migrations;

pub use database::{AcademyDb, Course, Material};

use std::path::PathBuf;

/// Returns `~/.config/pluvia[-dev]/` based on PLUVIA_ENV.
///
/// Set PLUVIA_ENV=dev to use a development data directory.
///
/// # Errors
/// Returns an error if the home directory cannot be determined or if
/// creating the config directory fails.
pub fn data_dir() -> Result<PathBuf, Box<dyn std::error::Error>> {
    let base_dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config");

    let env = std::env::var("PLUVIA_ENV").unwrap_or_else(|_| "production".to_string());

    let dir = if env == "dev" {
        base_dir.join("pluvia-dev")
    } else {
        base_dir.join("pluvia")
    };

    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
