//! Connection and call error types.

use muxwire_proto::{ErrorCode, Opcode, ProtocolError};

use crate::{connection::ConnectionState, peer_heap::CallOutcome};

/// Connection-fatal errors.
///
/// Any of these ends the connection: the driver passes it to
/// [`Connection::fail`](crate::Connection::fail), which fails every
/// outstanding call with [`CallError::ConnectionClosed`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// Operation not valid in the current state.
    #[error("invalid state {state:?} for {operation}")]
    InvalidState {
        /// Current state.
        state: ConnectionState,
        /// Attempted operation.
        operation: String,
    },

    /// Frame type not allowed in the current state.
    #[error("unexpected {opcode:?} frame in state {state:?}")]
    UnexpectedFrame {
        /// State when the frame arrived.
        state: ConnectionState,
        /// Offending message type.
        opcode: Opcode,
    },

    /// Init exchange failed or timed out.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Byte stream could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Remote sent a fatal connection-level error.
    #[error("remote closed connection with {code:?}: {message}")]
    Remote {
        /// Error class.
        code: ErrorCode,
        /// Remote's description.
        message: String,
    },

    /// Underlying stream failed or reached end of file.
    #[error("transport error: {0}")]
    Transport(String),
}

impl ConnectionError {
    /// Whether the remote should be told why the connection is going away.
    pub fn notifies_remote(&self) -> bool {
        matches!(
            self,
            Self::UnexpectedFrame { .. } | Self::HandshakeFailed(_) | Self::Protocol(_)
        )
    }
}

/// Why one call failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    /// Response arguments failed checksum verification.
    #[error("response checksum mismatch")]
    ChecksumMismatch,

    /// Deadline passed before the response completed.
    #[error("call timed out")]
    Timeout,

    /// Connection closed before the response completed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Connection never completed its handshake.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The service has no peers to choose from.
    #[error("no peers available for service '{0}'")]
    NoPeersAvailable(String),

    /// Call parameters were rejected before anything was sent.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Connection is not yet established.
    #[error("connection not established")]
    NotEstablished,

    /// Caller cancelled the call.
    #[error("call cancelled")]
    Cancelled,

    /// Remote answered with an error frame.
    #[error("remote error {code:?}: {message}")]
    Remote {
        /// Error class.
        code: ErrorCode,
        /// Remote's description.
        message: String,
    },

    /// Response frames for this call were malformed.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Transport could not reach the peer.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// Every message id is in use on this connection.
    #[error("message ids exhausted")]
    IdsExhausted,
}

impl CallError {
    /// Whether the failure says something about the peer's health, as
    /// opposed to the caller's own actions.
    pub fn counts_against_peer(&self) -> bool {
        !matches!(
            self,
            Self::Cancelled
                | Self::InvalidArgument(_)
                | Self::NoPeersAvailable(_)
                | Self::Remote { code: ErrorCode::BadRequest | ErrorCode::Cancelled, .. }
        )
    }

    /// Effect of this failure on the peer that served the call.
    pub fn outcome(&self) -> CallOutcome {
        if self.counts_against_peer() { CallOutcome::Failure } else { CallOutcome::Abandoned }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_local_protocol_faults_notify_remote() {
        assert!(ConnectionError::HandshakeFailed("bad version".into()).notifies_remote());
        assert!(!ConnectionError::Transport("eof".into()).notifies_remote());
        let remote =
            ConnectionError::Remote { code: ErrorCode::FatalProtocol, message: "bye".into() };
        assert!(!remote.notifies_remote());
    }

    #[test]
    fn caller_faults_do_not_count_against_peer() {
        assert!(!CallError::Cancelled.counts_against_peer());
        assert!(!CallError::InvalidArgument("ttl".into()).counts_against_peer());
        assert!(CallError::Timeout.counts_against_peer());
        assert!(CallError::ConnectionClosed.counts_against_peer());

        let bad = CallError::Remote { code: ErrorCode::BadRequest, message: "nope".into() };
        assert_eq!(bad.outcome(), CallOutcome::Abandoned);
        let busy = CallError::Remote { code: ErrorCode::Busy, message: "later".into() };
        assert_eq!(busy.outcome(), CallOutcome::Failure);
    }
}
