//! Status command handler

use anyhow::Result;

use gatecode_core::SyncEngine;

use crate::output::{Output, OutputFormat};

/// Show status information
pub async fn show(engine: &SyncEngine, output: &Output) -> Result<()> {
    let status = engine.status().await;
    let config = engine.config();

    match output.format {
        OutputFormat::Json => output.json(&status),
        OutputFormat::Quiet => {
            println!("{}", status.state);
        }
        OutputFormat::Human => {
            println!("Gatecode Status");
            println!("===============");
            println!();
            println!("Device:");
            println!("  ID:       {}", status.device.id);
            println!("  Platform: {}", status.device.platform);
            println!();
            println!("Sync:");
            println!("  State:  {}", status.state);
            println!(
                "  Remote: {}",
                status.remote.as_deref().unwrap_or("(local only)")
            );
            println!(
                "  Last:   {}",
                status.sync_timestamp.as_deref().unwrap_or("(never)")
            );
            if !status.devices.is_empty() {
                println!("  Devices seen:");
                for device in &status.devices {
                    println!(
                        "    {} ({}) last seen {}",
                        device.device_id, device.platform, device.last_seen
                    );
                }
            }
            println!();
            println!("Storage:");
            println!("  Location: {}", config.data_dir.display());
            println!("  Size:     {}", human_size(status.storage.total_size()));
            println!();
            println!("Codes:");
            println!("  Total:  {}", status.codes.total);
            println!("  Unused: {}", status.codes.unused);
            println!("  Used:   {}", status.codes.used);
        }
    }

    Ok(())
}

fn human_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;

    if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}
