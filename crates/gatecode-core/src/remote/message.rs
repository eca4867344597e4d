//! Wire messages for the WebSocket remote store
//!
//! Messages are CBOR maps tagged by `type`. Values travel as JSON-encoded
//! byte strings so the server never needs to understand them.

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use serde_json::Value;

use super::error::{RemoteError, RemoteResult};

/// Correlates a reply with its request
pub type RequestId = u64;

/// Messages sent to the remote store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    Set {
        #[serde(rename = "requestId")]
        request_id: RequestId,
        path: String,
        data: ByteBuf,
    },
    Get {
        #[serde(rename = "requestId")]
        request_id: RequestId,
        path: String,
    },
    List {
        #[serde(rename = "requestId")]
        request_id: RequestId,
        prefix: String,
    },
    Subscribe {
        #[serde(rename = "requestId")]
        request_id: RequestId,
        prefix: String,
    },
}

/// One entry of a `list` reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEntry {
    pub path: String,
    pub data: ByteBuf,
}

/// Messages received from the remote store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// A `set` or `subscribe` was accepted
    Ack {
        #[serde(rename = "requestId")]
        request_id: RequestId,
    },

    /// Reply to `get`; no data when the path is empty
    Value {
        #[serde(rename = "requestId")]
        request_id: RequestId,
        #[serde(default)]
        data: Option<ByteBuf>,
    },

    /// Reply to `list`
    Entries {
        #[serde(rename = "requestId")]
        request_id: RequestId,
        entries: Vec<WireEntry>,
    },

    /// A change under a subscribed prefix
    Event { path: String, data: ByteBuf },

    /// The request failed; unsolicited when no request id is given
    Error {
        #[serde(rename = "requestId", default)]
        request_id: Option<RequestId>,
        message: String,
    },
}

impl ClientMessage {
    pub fn set(request_id: RequestId, path: &str, value: &Value) -> RemoteResult<Self> {
        Ok(ClientMessage::Set {
            request_id,
            path: path.to_string(),
            data: ByteBuf::from(serde_json::to_vec(value)?),
        })
    }

    pub fn get(request_id: RequestId, path: &str) -> Self {
        ClientMessage::Get {
            request_id,
            path: path.to_string(),
        }
    }

    pub fn list(request_id: RequestId, prefix: &str) -> Self {
        ClientMessage::List {
            request_id,
            prefix: prefix.to_string(),
        }
    }

    pub fn subscribe(request_id: RequestId, prefix: &str) -> Self {
        ClientMessage::Subscribe {
            request_id,
            prefix: prefix.to_string(),
        }
    }

    pub fn request_id(&self) -> RequestId {
        match self {
            ClientMessage::Set { request_id, .. }
            | ClientMessage::Get { request_id, .. }
            | ClientMessage::List { request_id, .. }
            | ClientMessage::Subscribe { request_id, .. } => *request_id,
        }
    }

    /// Encode message to CBOR bytes
    pub fn encode(&self) -> RemoteResult<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .map_err(|e| RemoteError::Encoding(e.to_string()))?;
        Ok(bytes)
    }
}

impl ServerMessage {
    /// Decode message from CBOR bytes
    pub fn decode(bytes: &[u8]) -> RemoteResult<Self> {
        ciborium::from_reader(bytes).map_err(|e| RemoteError::Encoding(e.to_string()))
    }

    /// Request this message answers, if any
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            ServerMessage::Ack { request_id }
            | ServerMessage::Value { request_id, .. }
            | ServerMessage::Entries { request_id, .. } => Some(*request_id),
            ServerMessage::Error { request_id, .. } => *request_id,
            ServerMessage::Event { .. } => None,
        }
    }
}

/// Decode a JSON payload carried in a byte string
pub fn decode_value(data: &[u8]) -> RemoteResult<Value> {
    Ok(serde_json::from_slice(data)?)
}
