//! Configuration bootstrap.

use std::path::Path;

use crate::config::{self, Config, ConfigError};

/// Write the default configuration to `path`, or to the OS config directory.
pub fn cmd_init_config(path: Option<&Path>, force: bool) -> anyhow::Result<()> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => config::config_path().ok_or(ConfigError::NoConfigDir)?,
    };
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }

    config::save(&Config::default(), &path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}
