//! Centralized error types for the spotihifi core library.
//!
//! The taxonomy mirrors how failures surface at runtime:
//! - protocol errors are answered on the wire and the connection survives
//! - transport errors drop the offending client, nothing else
//! - session errors are logged; session *creation* failures kill the
//!   engine instance
//! - device errors are retried or recovered inside the audio sink

use thiserror::Error;

use crate::session::SessionError;

/// Application-wide error type for the spotihifi daemon.
#[derive(Debug, Error)]
pub enum SpotihifiError {
    /// Framing or JSON-RPC violation from a client.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Socket-level failure on a client connection.
    #[error("transport failure: {0}")]
    Transport(#[from] std::io::Error),

    /// Non-OK result from a streaming-service session call.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Audio device could not be opened or configured.
    #[error("audio device error: {0}")]
    Device(String),
}

/// Convenience alias used throughout the library.
pub type SpotihifiResult<T> = Result<T, SpotihifiError>;
