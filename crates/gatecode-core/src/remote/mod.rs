//! Remote replica
//!
//! Client for the shared realtime store every device replicates through.
//!
//! ## Layers
//!
//! - [`RemoteTransport`]: raw key/value access (set, get, list, subscribe)
//! - [`MemoryTransport`]: in-process store shared by several engines
//! - [`WsTransport`]: WebSocket client speaking a CBOR request protocol
//! - [`RemoteClient`]: snapshot, usage and presence layout on top of a
//!   transport, with retries on every write
//!
//! ## Usage
//!
//! ```ignore
//! let transport = Arc::new(WsTransport::spawn(WsConfig::new("ws://localhost:3030")));
//! let client = RemoteClient::new(transport, Device::generate());
//! client.push_snapshot(&records).await?;
//! ```

mod client;
mod error;
mod memory;
mod message;
mod retry;
mod transport;
mod ws;

pub use client::{
    DevicePresence, DeviceSnapshot, RemoteClient, RemoteState, RemoteUpdate, Subscription,
};
pub use error::{RemoteError, RemoteResult};
pub use memory::MemoryTransport;
pub use retry::RetryPolicy;
pub use transport::{RemoteEvent, RemoteTransport};
pub use ws::{ConnectionStatus, WsConfig, WsTransport};
