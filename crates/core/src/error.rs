use serde::{Deserialize, Serialize};

/// Why a list or watch ended.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum WatchError {
    /// The server ended the stream; resume from the current checkpoint.
    #[error("watch stream closed")]
    StreamClosed,
    /// The checkpoint is no longer served (HTTP 410); a full relist is required.
    #[error("resource version too old: {0}")]
    ResourceVersionTooOld(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("transient: {0}")]
    Transient(String),
    /// Bad selector, missing namespace and the like.
    #[error("config: {0}")]
    Config(String),
    /// A single undecodable event or object.
    #[error("malformed: {0}")]
    Malformed(String),
}

impl WatchError {
    /// Fatal errors stop the reflector and are never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, WatchError::Unauthorized(_) | WatchError::Forbidden(_) | WatchError::Config(_))
    }

    /// Short stable label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            WatchError::StreamClosed => "stream_closed",
            WatchError::ResourceVersionTooOld(_) => "too_old",
            WatchError::Unauthorized(_) => "unauthorized",
            WatchError::Forbidden(_) => "forbidden",
            WatchError::Transient(_) => "transient",
            WatchError::Config(_) => "config",
            WatchError::Malformed(_) => "malformed",
        }
    }
}
