//! Error taxonomy for the XMPP core.
//!
//! Every failure surfaced by this crate is an [`XmppError`] tagged with an
//! [`ErrorKind`]: transport failures (socket/IO, always connection-fatal),
//! malformed streams (the XML can no longer be trusted) and SASL failures
//! (distinguishable from transport errors so hosts can tell "wrong password"
//! from "network down").

use std::fmt;

/// Broad failure class of an [`XmppError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Socket or IO level failure. The connection is gone.
    Transport,
    /// Structural XML/XMPP violation. The stream cannot be resynchronized.
    Malformed,
    /// Authentication failed or no usable mechanism was offered.
    Sasl,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Transport => f.write_str("transport"),
            ErrorKind::Malformed => f.write_str("malformed stream"),
            ErrorKind::Sasl => f.write_str("sasl"),
        }
    }
}

/// A protocol or transport failure, always connection-fatal.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct XmppError {
    kind: ErrorKind,
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl XmppError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Malformed, message)
    }

    pub fn sasl(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Sasl, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_transport(&self) -> bool {
        self.kind == ErrorKind::Transport
    }

    pub fn is_malformed(&self) -> bool {
        self.kind == ErrorKind::Malformed
    }

    pub fn is_sasl(&self) -> bool {
        self.kind == ErrorKind::Sasl
    }
}

impl From<std::io::Error> for XmppError {
    fn from(e: std::io::Error) -> Self {
        Self::with_source(ErrorKind::Transport, "io error", e)
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, XmppError>;
