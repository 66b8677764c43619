//! Remote tool server client: transport negotiation, the legacy event-stream
//! session, the JSON-RPC handshake, and the tool source that feeds remote
//! tools into the dispatcher.

pub mod client;
pub mod jsonrpc;
pub mod source;
pub mod sse;
pub mod transport;

pub use client::McpClient;
pub use source::{McpStatus, McpToolSource};
pub use transport::{detect_transport, Confidence, TransportProbe};

use serde::{Deserialize, Serialize};

/// Requested transport; `Auto` runs negotiation on connect.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TransportMode {
    #[default]
    Auto,
    StreamableHttp,
    SseLegacy,
}

impl TransportMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "streamable-http" | "streamable_http" | "http" => Some(Self::StreamableHttp),
            "sse" | "sse-legacy" | "sse_legacy" | "legacy" => Some(Self::SseLegacy),
            _ => None,
        }
    }

    pub fn fixed(self) -> Option<Transport> {
        match self {
            Self::Auto => None,
            Self::StreamableHttp => Some(Transport::StreamableHttp),
            Self::SseLegacy => Some(Transport::SseLegacy),
        }
    }
}

/// A concrete wire transport.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Transport {
    /// Single POST per request; JSON or one-payload event-stream replies.
    StreamableHttp,
    /// Long-lived GET event stream plus POSTs to an announced endpoint.
    SseLegacy,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::StreamableHttp => f.write_str("streamable-http"),
            Transport::SseLegacy => f.write_str("sse-legacy"),
        }
    }
}
