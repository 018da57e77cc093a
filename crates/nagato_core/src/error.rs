use thiserror::Error;

/// Errors that cross a component boundary inside a single session.
///
/// `EndOfStream` and `Io` are both recovered the same way at the session
/// level: close both sockets and exit cleanly. `Protocol` means the peer
/// sent something the parser cannot make sense of; the session closes
/// the client without sending a response.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("end of stream")]
    EndOfStream,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl SessionError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        SessionError::Protocol(msg.into())
    }

    /// Whether this error should be treated as a quiet session close
    /// rather than something worth a warn-level log line.
    pub fn is_quiet(&self) -> bool {
        matches!(self, SessionError::EndOfStream | SessionError::Io(_))
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
