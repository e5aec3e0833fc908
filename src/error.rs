//! Error types for AGI sessions

use thiserror::Error;

/// Result alias used throughout the crate.
pub type AgiResult<T> = Result<T, AgiError>;

/// Errors produced by AGI sessions and the FastAGI listener.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AgiError {
    /// Read or write failure on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the stream.
    #[error("connection closed")]
    ConnectionClosed,

    /// The session is already closed.
    #[error("session is not connected")]
    NotConnected,

    /// No reply arrived within the command timeout.
    #[error("timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// A reply line did not match the AGI reply grammar.
    #[error("failed to parse result: {line}")]
    MalformedReply { line: String },

    /// Invalid command text supplied by the caller; nothing was sent.
    #[error("protocol error: {message}")]
    ProtocolError { message: String },

    /// Inbound stream broke framing (over-long line or unclosed block).
    #[error("framing error: {message}")]
    FramingError { message: String },

    /// Well-formed reply with a non-200 status.
    #[error("non-200 status code {status}: {reply}")]
    CommandFailed { status: u16, reply: String },

    /// The stream ended before the handshake's terminating blank line.
    #[error("stream ended before the AGI handshake completed")]
    HandshakeIncomplete,

    /// A successful reply carried a result the caller could not decode.
    #[error("unexpected result for {command}: {result}")]
    UnexpectedResult { command: String, result: String },

    /// The FastAGI listener could not bind.
    #[error("failed to bind server on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The FastAGI listener failed to accept a connection.
    #[error("failed to accept TCP connection: {0}")]
    Accept(#[source] std::io::Error),
}

impl AgiError {
    /// Create a protocol error
    pub fn protocol_error(message: impl Into<String>) -> Self {
        Self::ProtocolError {
            message: message.into(),
        }
    }

    /// Create a framing error
    pub fn framing_error(message: impl Into<String>) -> Self {
        Self::FramingError {
            message: message.into(),
        }
    }

    /// Transport and parse failures leave the stream in an unknown position;
    /// the session should be closed.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            AgiError::Io(_)
                | AgiError::ConnectionClosed
                | AgiError::NotConnected
                | AgiError::MalformedReply { .. }
                | AgiError::FramingError { .. }
                | AgiError::HandshakeIncomplete
        )
    }

    /// Whether this is a command timeout.
    ///
    /// The command may still complete on the switch, and its reply may be
    /// read as the reply to the next command on the same session.
    pub fn is_timeout(&self) -> bool {
        matches!(self, AgiError::Timeout { .. })
    }

    /// Whether the switch understood the command but rejected it. The
    /// session stays usable.
    pub fn is_command_failure(&self) -> bool {
        matches!(self, AgiError::CommandFailed { .. })
    }

    /// Status code of a rejected command.
    pub fn status(&self) -> Option<u16> {
        match self {
            AgiError::CommandFailed { status, .. } => Some(*status),
            _ => None,
        }
    }
}
