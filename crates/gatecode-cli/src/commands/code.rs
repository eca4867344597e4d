//! Code command handlers

use std::io::{self, Read, Write};

use anyhow::{bail, Context, Result};

use gatecode_core::SyncEngine;

use crate::output::{Output, OutputFormat};

/// Generate `count` random codes
pub async fn generate(engine: &SyncEngine, count: usize, output: &Output) -> Result<()> {
    let mut created = Vec::with_capacity(count);
    for _ in 0..count.max(1) {
        created.push(engine.generate_code().await?);
    }

    if created.len() == 1 {
        output.print_code(&created[0]);
    } else {
        output.print_codes(&created);
    }
    Ok(())
}

/// Add a custom code
pub async fn create(engine: &SyncEngine, code: String, output: &Output) -> Result<()> {
    let record = engine.create_code(&code).await?;
    output.print_code(&record);
    Ok(())
}

/// Redeem a code; returns whether access was granted
pub async fn verify(engine: &SyncEngine, code: String, output: &Output) -> Result<bool> {
    let outcome = engine.verify_code(&code).await;
    output.print_verify(&outcome);
    Ok(outcome.success)
}

/// List codes, optionally only one status
pub async fn list(
    engine: &SyncEngine,
    unused: bool,
    used: bool,
    output: &Output,
) -> Result<()> {
    let records: Vec<_> = engine
        .list_codes()
        .await
        .into_iter()
        .filter(|r| (!unused || !r.used) && (!used || r.used))
        .collect();

    output.print_codes(&records);
    Ok(())
}

/// Delete a code by its local id
pub async fn delete(engine: &SyncEngine, id: u64, output: &Output) -> Result<()> {
    let record = engine.delete_code(id).await?;
    output.success(&format!("Deleted code {}", record.code));
    Ok(())
}

/// Delete every code, asking first unless `yes`
pub async fn clear(engine: &SyncEngine, yes: bool, output: &Output) -> Result<()> {
    if !yes && output.should_prompt() {
        let total = engine.stats().await.total;
        if total == 0 {
            output.message("No codes to delete.");
            return Ok(());
        }

        print!("Delete all {} code(s) on every device? [y/N] ", total);
        io::stdout().flush()?;
        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        if !matches!(input.trim(), "y" | "Y" | "yes") {
            output.message("Cancelled.");
            return Ok(());
        }
    }

    let removed = engine.delete_all().await?;
    output.success(&format!("Deleted {} code(s)", removed));
    Ok(())
}

/// Print the export blob of all unused codes
pub async fn export(engine: &SyncEngine, output: &Output) -> Result<()> {
    let blob = engine.export_unused().await?;
    match output.format {
        OutputFormat::Json => println!("{}", serde_json::json!({ "export": blob })),
        OutputFormat::Human | OutputFormat::Quiet => println!("{}", blob),
    }
    Ok(())
}

/// Import a blob given on the command line, or read from stdin for `-`
pub async fn import(engine: &SyncEngine, blob: String, output: &Output) -> Result<()> {
    let blob = if blob == "-" {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read export from stdin")?;
        buf
    } else {
        blob
    };

    if blob.trim().is_empty() {
        bail!("Nothing to import");
    }

    let summary = engine.import_codes(blob.trim()).await?;
    output.print_import(&summary);
    Ok(())
}
