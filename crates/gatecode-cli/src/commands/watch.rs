//! Watch command handler
//!
//! Keeps the engine running and prints every change until interrupted.

use anyhow::Result;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use gatecode_core::{EngineEvent, SyncEngine};

use crate::output::{Output, OutputFormat};

/// Print broadcast messages and engine events until ctrl-c
pub async fn run(engine: &SyncEngine, output: &Output) -> Result<()> {
    let mut changes = engine.broadcast().subscribe();
    let mut events = engine.subscribe_events();

    output.message(&format!(
        "Watching for changes on {} ({}). Press Ctrl-C to stop.",
        engine.device().id,
        engine.state()
    ));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            msg = changes.recv() => match msg {
                Ok(msg) => match output.format {
                    OutputFormat::Json => output.json(&msg),
                    OutputFormat::Human => println!("[{}] {}", msg.timestamp, msg.action),
                    OutputFormat::Quiet => {}
                },
                Err(RecvError::Lagged(n)) => warn!("Missed {} change notification(s)", n),
                Err(RecvError::Closed) => break,
            },
            event = events.recv() => match event {
                Ok(EngineEvent::StateChanged(state)) => {
                    output.message(&format!("sync state: {}", state));
                }
                Ok(EngineEvent::CodesChanged { timestamp, count }) => {
                    output.message(&format!(
                        "[{}] {} code(s) on this device",
                        timestamp.as_deref().unwrap_or("-"),
                        count
                    ));
                }
                Err(RecvError::Lagged(n)) => warn!("Missed {} engine event(s)", n),
                Err(RecvError::Closed) => break,
            },
        }
    }

    Ok(())
}
