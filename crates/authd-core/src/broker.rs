//! The service provider interface (SPI) for brokers

use crate::{
    BoxError,
    types::{AuthMode, AuthResponse, AuthenticationItem, BrokerInfo, SessionInfo, UiLayout},
};
use async_trait::async_trait;
use derive_more::Display;
use std::fmt::Debug;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Defines the requirements for broker implementations.
///
/// Every method maps to one RPC of the broker service. Calls made for one session are never
/// issued concurrently by the PAM side, with the exception of [`Broker::end_session`] which may
/// race an in-flight [`Broker::submit_authentication`] that was just cancelled.
#[async_trait]
pub trait Broker: Send + Sync + Debug {
    /// Lists the brokers that can be selected.
    async fn list_brokers(&self) -> Result<Vec<BrokerInfo>, BrokerError>;

    /// Returns the broker the given user authenticated with last time, if any.
    async fn previous_broker(&self, username: &str) -> Result<Option<String>, BrokerError>;

    /// Starts an authentication session for `username` on the broker `broker_id`.
    async fn start_session(&self, broker_id: &str, username: &str, lang: &str) -> Result<SessionInfo, BrokerError>;

    /// Lists the authentication modes the session can use, given the UI layouts the front-end is able to render.
    async fn list_auth_modes(&self, session_id: &str, supported_layouts: &[UiLayout]) -> Result<Vec<AuthMode>, BrokerError>;

    /// Selects an authentication mode and returns the UI layout the user should be presented with.
    async fn select_auth_mode(&self, session_id: &str, auth_mode_id: &str) -> Result<Option<UiLayout>, BrokerError>;

    /// Submits authentication data. A challenge is always encrypted with the session key.
    ///
    /// Implementations must return promptly once `cancel` fires, either with a `cancelled`
    /// access or with a [`BrokerErrorKind::Cancelled`] error.
    async fn submit_authentication(
        &self,
        session_id: &str,
        item: &AuthenticationItem,
        cancel: CancellationToken,
    ) -> Result<AuthResponse, BrokerError>;

    /// Ends the session. Pending calls for the session should be aborted.
    async fn end_session(&self, session_id: &str) -> Result<(), BrokerError>;

    /// Remembers `broker_id` as the default broker of `username`.
    async fn set_default_broker(&self, broker_id: &str, username: &str) -> Result<(), BrokerError>;
}

/// The error returned by [`Broker`] implementations.
#[derive(Debug, Error)]
#[error("broker error: {kind}")]
pub struct BrokerError {
    kind: BrokerErrorKind,
    #[source]
    source: Option<BoxError>,
}

impl BrokerError {
    /// Creates a new broker error
    pub fn new<E>(kind: BrokerErrorKind, error: E) -> BrokerError
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        BrokerError {
            kind,
            source: Some(error.into()),
        }
    }

    /// The category of the failure
    pub fn kind(&self) -> BrokerErrorKind {
        self.kind
    }
}

impl From<BrokerErrorKind> for BrokerError {
    fn from(kind: BrokerErrorKind) -> BrokerError {
        BrokerError { kind, source: None }
    }
}

/// The `BrokerErrorKind` variants that can be produced by [`Broker`] implementations.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display)]
pub enum BrokerErrorKind {
    /// The broker could not be reached or did not answer.
    #[display("broker unavailable")]
    Unavailable,
    /// An argument was rejected, e.g. an unknown session or authentication mode.
    #[display("invalid argument")]
    InvalidArgument,
    /// The call conflicts with the current state of the session.
    #[display("invalid session state")]
    InvalidState,
    /// The call was aborted through its cancellation token.
    #[display("cancelled")]
    Cancelled,
    /// Any other failure inside the broker.
    #[display("internal error")]
    Internal,
}
