//! Config command implementations

use std::path::Path;

use anyhow::{Context, Result};

use cvdr_core::config::CvdrConfig;

use crate::output::{print_info, print_warning};

/// Show the effective configuration
pub fn config_show(config: &CvdrConfig, path: &Path) -> Result<()> {
    if path.exists() {
        print_info(&format!("Configuration file: {:?}", path));
    } else {
        print_warning(&format!(
            "No configuration file at {:?}, showing defaults",
            path
        ));
    }
    println!();

    let content =
        toml::to_string_pretty(config).context("Failed to render configuration")?;
    println!("{}", content);
    Ok(())
}

/// Print the configuration file path
pub fn config_path(path: &Path) {
    println!("{}", path.display());
}

/// Print one setting; unset settings print nothing
pub fn config_get(config: &CvdrConfig, key: &str) -> Result<()> {
    if !CvdrConfig::keys().contains(&key) {
        anyhow::bail!(
            "Unknown config key {:?} (known keys: {})",
            key,
            CvdrConfig::keys().join(", ")
        );
    }

    if let Some(value) = config.get(key)? {
        println!("{}", value);
    }
    Ok(())
}
