//! Config command handlers

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use gatecode_core::Config;

use crate::output::{Output, OutputFormat};

/// Show current configuration
pub fn show(config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    let config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    match output.format {
        OutputFormat::Json => output.json(&config),
        OutputFormat::Quiet => {
            println!("{}", config.data_dir.display());
        }
        OutputFormat::Human => {
            let effective_path = config_path
                .cloned()
                .unwrap_or_else(Config::config_file_path);
            println!("Configuration:");
            println!("  data_dir:           {}", config.data_dir.display());
            println!(
                "  remote_url:         {}",
                config.remote_url.as_deref().unwrap_or("(not set)")
            );
            println!("  sync_enabled:       {}", config.sync_enabled);
            println!("  poll_interval_secs: {}", config.poll_interval_secs);
            println!("  fast_poll_secs:     {}", config.fast_poll_interval_secs);
            println!(
                "  log_file:           {}",
                config
                    .log_file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(not set)".to_string())
            );
            println!();
            println!("Config file: {}", effective_path.display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(
    key: String,
    value: String,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    let mut config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    apply(&mut config, &key, &value)?;

    let save_path = config_path
        .cloned()
        .unwrap_or_else(Config::config_file_path);
    config
        .save_to(&save_path)
        .context("Failed to save configuration")?;

    output.success(&format!("Set {} = {}", key, value));

    Ok(())
}

fn apply(config: &mut Config, key: &str, value: &str) -> Result<()> {
    let unset = value.is_empty() || value == "none";

    match key {
        "data_dir" => {
            config.data_dir = value.into();
        }
        "remote_url" => {
            config.remote_url = if unset { None } else { Some(value.to_string()) };
        }
        "sync_enabled" => {
            config.sync_enabled = value
                .parse()
                .context("Invalid value for sync_enabled. Use 'true' or 'false'.")?;
        }
        "poll_interval_secs" => {
            config.poll_interval_secs = value
                .parse()
                .context("Invalid value for poll_interval_secs. Use a whole number of seconds.")?;
        }
        "fast_poll_interval_secs" => {
            config.fast_poll_interval_secs = value.parse().context(
                "Invalid value for fast_poll_interval_secs. Use a whole number of seconds.",
            )?;
        }
        "log_file" => {
            config.log_file = if unset { None } else { Some(value.into()) };
        }
        _ => {
            bail!(
                "Unknown configuration key: '{}'\n\
                 Valid keys: data_dir, remote_url, sync_enabled, poll_interval_secs, \
                 fast_poll_interval_secs, log_file",
                key
            );
        }
    }

    Ok(())
}
