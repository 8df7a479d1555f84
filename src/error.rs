//! Error taxonomy.
//!
//! Only [`ImportError`] and socket setup failures are fatal to a component. Routing misses,
//! malformed frames and updates without a close match are absorbed where they occur and
//! surface as diagnostics.

use std::path::PathBuf;

use thiserror::Error;

/// Catalog import failure. Aborts startup of the interpreter.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("failed to open catalog source {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed catalog header: {0}")]
    Header(String),

    #[error("malformed catalog row at line {line}: {reason}")]
    Row { line: u64, reason: String },

    #[error("duplicate object identifier {0:?}")]
    DuplicateId(String),

    #[error("attachment {path} for object {id:?} cannot be read: {source}")]
    Attachment {
        id: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("catalog source is not valid delimited text: {0}")]
    Csv(#[from] csv_async::Error),
}

/// A frame that cannot be decoded or parsed. Non-fatal: the frame is ignored.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame exceeds {limit} bytes")]
    TooLong { limit: usize },

    #[error("payload contains the frame sentinel '$'")]
    SentinelInPayload,

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FrameError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed(reason.into())
    }
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("unknown endpoint {0:?}")]
    UnknownEndpoint(String),

    #[error("connection closed before handshake")]
    HandshakeClosed,

    #[error("handshake not completed within {0:?}")]
    HandshakeTimeout(std::time::Duration),

    #[error("failed to bind broker on {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("router task is gone")]
    RouterGone,

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("failed to connect to broker at {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("link to broker is closed")]
    Closed,

    #[error(transparent)]
    Frame(#[from] FrameError),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sled(#[from] sled::Error),

    #[error("failed to (de)serialize stored object: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("store contents are inconsistent: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid broker address {0:?} (expected tcp://host:port or local:<name>)")]
    Address(String),
}

/// Top-level error for the orchestrator.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error(transparent)]
    Import(#[from] ImportError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no catalog source configured and the store is empty")]
    NoCatalog,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
