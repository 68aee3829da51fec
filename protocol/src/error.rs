// Copyright 2025 framelink Authors
// SPDX-License-Identifier: Apache-2.0

//! Error types shared across the transport.
//!
//! Nothing here ever crosses the IPC boundary: every failure becomes a
//! local retry, a counted drop, or a connection teardown on the side that
//! observed it. Transient I/O (short reads, `WouldBlock`) is retried inside
//! the reader/writer loops and never surfaces as a `LinkError`.

use std::io;

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, LinkError>;

/// Transport error kinds.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// Bad magic, unsupported version, size mismatch, rejected geometry.
    /// Fatal at startup; the shipper refuses to run.
    #[error("configuration rejected: {0}")]
    Config(String),

    /// EOF, connection reset, or a region-level shutdown request. The
    /// receiver returns to listening; the shipper retries on next submit.
    #[error("peer gone: {0}")]
    PeerGone(String),

    /// Compression session creation, submit, or property-set failure.
    #[error("encoder failure: {0}")]
    Encoder(String),

    /// Impossible frame header or payload size on the wire. Tears down the
    /// connection.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl LinkError {
    /// Whether the receiving loop should tear down the connection and go
    /// back to listening rather than retry in place.
    pub fn tears_down_connection(&self) -> bool {
        matches!(self, LinkError::PeerGone(_) | LinkError::Protocol(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn teardown_classification() {
        assert!(LinkError::PeerGone("reset".into()).tears_down_connection());
        assert!(LinkError::Protocol("bad size".into()).tears_down_connection());
        assert!(!LinkError::Config("bad magic".into()).tears_down_connection());
        assert!(!LinkError::Encoder("submit".into()).tears_down_connection());
    }

    #[test]
    fn io_error_converts() {
        let err: LinkError = io::Error::new(io::ErrorKind::BrokenPipe, "pipe").into();
        assert!(matches!(err, LinkError::Io(_)));
    }
}
