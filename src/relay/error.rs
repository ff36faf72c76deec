use super::{codec::CodecError, envelope::EnvelopeError};
use crate::{BoxError, conv::ConversationError};
use derive_more::Display;
use thiserror::Error;

/// The error returned by relay transport calls.
#[derive(Debug, Error)]
#[error("relay error: {kind}")]
pub struct RelayError {
    kind: RelayErrorKind,
    #[source]
    source: Option<BoxError>,
}

impl RelayError {
    /// Creates a new relay error
    pub fn new<E>(kind: RelayErrorKind, error: E) -> RelayError
    where
        E: Into<BoxError>,
    {
        RelayError {
            kind,
            source: Some(error.into()),
        }
    }

    /// The category of the failure
    pub fn kind(&self) -> RelayErrorKind {
        self.kind
    }
}

impl From<RelayErrorKind> for RelayError {
    fn from(kind: RelayErrorKind) -> RelayError {
        RelayError { kind, source: None }
    }
}

impl From<CodecError> for RelayError {
    fn from(err: CodecError) -> RelayError {
        RelayError::new(RelayErrorKind::Codec, err)
    }
}

impl From<EnvelopeError> for RelayError {
    fn from(err: EnvelopeError) -> RelayError {
        RelayError::new(RelayErrorKind::Envelope, err)
    }
}

impl From<ConversationError> for RelayError {
    fn from(err: ConversationError) -> RelayError {
        RelayError::new(RelayErrorKind::Conversation, err)
    }
}

/// Categories of [`RelayError`]s.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display)]
pub enum RelayErrorKind {
    /// Protocol negotiation with the peer failed
    #[display("protocol initialization failed")]
    Handshake,
    /// The binary prompt itself failed
    #[display("conversation failed")]
    Conversation,
    /// The peer's message could not be unframed
    #[display("malformed relay message")]
    Codec,
    /// The peer's envelope is invalid, or ours could not be built
    #[display("invalid envelope")]
    Envelope,
    /// The peer answered with an envelope that does not fit the request
    #[display("unexpected reply")]
    UnexpectedReply,
}
