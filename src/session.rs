//! Broker calls scoped to an authentication session.

use crate::BoxError;
use authd_core::{
    Access, AuthMode, AuthenticationItem, Broker, BrokerError, BrokerErrorKind, BrokerInfo, LOCAL_BROKER_ID, UiLayout,
};
use base64::{Engine, engine::general_purpose::STANDARD};
use derive_more::Display;
use rsa::{Oaep, RsaPublicKey, pkcs8::DecodePublicKey};
use sha2::Sha512;
use std::{fmt, sync::Arc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// The UI layout types a session can hand out.
pub const KNOWN_LAYOUTS: &[&str] = &["form", "qrcode", "newpassword"];

/// A started broker session.
#[derive(Clone)]
pub struct Session {
    broker_id: String,
    session_id: String,
    encryption_key: RsaPublicKey,
}

impl Session {
    /// The broker the session was started with
    pub fn broker_id(&self) -> &str {
        &self.broker_id
    }

    /// The broker assigned session identifier
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn encrypt(&self, secret: &str) -> Result<String, SessionError> {
        let ciphertext = self
            .encryption_key
            .encrypt(&mut rand::rngs::OsRng, Oaep::new::<Sha512>(), secret.as_bytes())
            .map_err(|e| SessionError::new(SessionErrorKind::Encryption, e))?;
        Ok(STANDARD.encode(ciphertext))
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("broker_id", &self.broker_id)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

/// The result of [`BrokerClient::start_session`].
#[derive(Debug)]
pub enum SessionStart {
    /// A broker session is running.
    Started(Session),
    /// The local broker was selected: authentication is left to the next PAM module.
    Local,
}

/// A parsed authentication reply. `msg` is still the broker's raw JSON.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthReply {
    /// The broker verdict
    pub access: Access,
    /// Empty, or `{"message": "..."}`
    pub msg: String,
}

/// The error type for session calls.
#[derive(Debug, Error)]
#[error("session error: {kind}")]
pub struct SessionError {
    kind: SessionErrorKind,
    #[source]
    source: Option<BoxError>,
}

impl SessionError {
    /// Creates a new session error
    pub fn new<E>(kind: SessionErrorKind, error: E) -> SessionError
    where
        E: Into<BoxError>,
    {
        SessionError {
            kind,
            source: Some(error.into()),
        }
    }

    /// The category of the failure
    pub fn kind(&self) -> SessionErrorKind {
        self.kind
    }
}

impl From<SessionErrorKind> for SessionError {
    fn from(kind: SessionErrorKind) -> SessionError {
        SessionError { kind, source: None }
    }
}

impl From<BrokerError> for SessionError {
    fn from(err: BrokerError) -> SessionError {
        SessionError::new(SessionErrorKind::Broker, err)
    }
}

/// Categories of [`SessionError`]s.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display)]
pub enum SessionErrorKind {
    /// The broker call itself failed
    #[display("broker call failed")]
    Broker,
    /// The broker started a session without identifier
    #[display("no session ID returned by broker")]
    NoSessionId,
    /// The session key is missing or not an RSA public key
    #[display("invalid encryption key returned by broker")]
    InvalidEncryptionKey,
    /// No authentication mode can be used
    #[display("no authentication modes available")]
    NoAuthModes,
    /// The layout is missing or of an unknown type
    #[display("invalid UI layout returned by broker")]
    InvalidLayout,
    /// The challenge could not be encrypted
    #[display("could not encrypt challenge")]
    Encryption,
    /// The authentication reply could not be understood
    #[display("invalid authentication reply from broker")]
    InvalidReply,
}

/// Broker access for commands. Cheap to clone.
#[derive(Clone, Debug)]
pub struct BrokerClient {
    broker: Arc<dyn Broker>,
    logger: slog::Logger,
}

impl BrokerClient {
    /// Creates a client for `broker`.
    pub fn new(broker: Arc<dyn Broker>, logger: slog::Logger) -> Self {
        BrokerClient { broker, logger }
    }

    /// Lists the selectable brokers.
    #[tracing_attributes::instrument(skip(self))]
    pub async fn list_brokers(&self) -> Result<Vec<BrokerInfo>, SessionError> {
        Ok(self.broker.list_brokers().await?)
    }

    /// The broker `username` used last time.
    #[tracing_attributes::instrument(skip(self))]
    pub async fn previous_broker(&self, username: &str) -> Result<Option<String>, SessionError> {
        Ok(self.broker.previous_broker(username).await?.filter(|id| !id.is_empty()))
    }

    /// Starts a session. The local broker never reaches the broker service.
    #[tracing_attributes::instrument(skip(self))]
    pub async fn start_session(&self, broker_id: &str, username: &str, lang: &str) -> Result<SessionStart, SessionError> {
        if broker_id == LOCAL_BROKER_ID {
            return Ok(SessionStart::Local);
        }

        let info = self.broker.start_session(broker_id, username, lang).await?;
        if info.session_id.is_empty() {
            return Err(SessionErrorKind::NoSessionId.into());
        }
        let encryption_key = parse_encryption_key(&info.encryption_key)?;
        slog::debug!(self.logger, "Session started"; "broker" => broker_id, "session" => &info.session_id);
        Ok(SessionStart::Started(Session {
            broker_id: broker_id.to_string(),
            session_id: info.session_id,
            encryption_key,
        }))
    }

    /// Lists the authentication modes of the session. An empty list is an error.
    #[tracing_attributes::instrument(skip(self, supported_layouts))]
    pub async fn list_auth_modes(&self, session: &Session, supported_layouts: &[UiLayout]) -> Result<Vec<AuthMode>, SessionError> {
        let modes = self.broker.list_auth_modes(&session.session_id, supported_layouts).await?;
        if modes.is_empty() {
            return Err(SessionErrorKind::NoAuthModes.into());
        }
        Ok(modes)
    }

    /// Selects an authentication mode and returns its layout.
    #[tracing_attributes::instrument(skip(self))]
    pub async fn select_auth_mode(&self, session: &Session, auth_mode_id: &str) -> Result<UiLayout, SessionError> {
        let layout = self
            .broker
            .select_auth_mode(&session.session_id, auth_mode_id)
            .await?
            .ok_or_else(|| SessionError::new(SessionErrorKind::InvalidLayout, "invalid empty UI Layout information from broker"))?;
        if !KNOWN_LAYOUTS.contains(&layout.kind.as_str()) {
            return Err(SessionError::new(
                SessionErrorKind::InvalidLayout,
                format!("unknown layout type: {:?}", layout.kind),
            ));
        }
        Ok(layout)
    }

    /// Submits authentication data. Challenges are encrypted with the session key first.
    ///
    /// A call aborted through `cancel` resolves to [`Access::Cancelled`].
    #[tracing_attributes::instrument(skip(self, item, cancel))]
    pub async fn submit_authentication(
        &self,
        session: &Session,
        item: AuthenticationItem,
        cancel: CancellationToken,
    ) -> Result<AuthReply, SessionError> {
        let item = match item {
            AuthenticationItem::Challenge(secret) => AuthenticationItem::Challenge(session.encrypt(&secret)?),
            other => other,
        };

        let response = match self.broker.submit_authentication(&session.session_id, &item, cancel).await {
            Ok(response) => response,
            Err(e) if e.kind() == BrokerErrorKind::Cancelled => {
                return Ok(AuthReply {
                    access: Access::Cancelled,
                    msg: String::new(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let access = response
            .access
            .parse::<Access>()
            .map_err(|e| SessionError::new(SessionErrorKind::InvalidReply, e))?;
        Ok(AuthReply { access, msg: response.msg })
    }

    /// Ends the session. Failures are logged and otherwise ignored.
    #[tracing_attributes::instrument(skip(self))]
    pub async fn end_session(&self, session: &Session) {
        if let Err(e) = self.broker.end_session(&session.session_id).await {
            slog::warn!(self.logger, "Could not end session {:?}, considering already done: {}", session.session_id, e);
        }
    }

    /// Records the broker `username` authenticated with.
    #[tracing_attributes::instrument(skip(self))]
    pub async fn set_default_broker(&self, broker_id: &str, username: &str) -> Result<(), SessionError> {
        Ok(self.broker.set_default_broker(broker_id, username).await?)
    }
}

fn parse_encryption_key(encoded: &str) -> Result<RsaPublicKey, SessionError> {
    if encoded.is_empty() {
        return Err(SessionError::new(SessionErrorKind::InvalidEncryptionKey, "no encryption key returned by broker"));
    }
    let der = STANDARD
        .decode(encoded)
        .map_err(|e| SessionError::new(SessionErrorKind::InvalidEncryptionKey, e))?;
    RsaPublicKey::from_public_key_der(&der).map_err(|e| SessionError::new(SessionErrorKind::InvalidEncryptionKey, e))
}

/// The language to start sessions with, from `LC_ALL`, `LC_MESSAGES` or `LANG`.
pub fn locale_from_env() -> String {
    resolve_locale(|name| std::env::var(name).ok())
}

fn resolve_locale(lookup: impl Fn(&str) -> Option<String>) -> String {
    let lang = ["LC_ALL", "LC_MESSAGES", "LANG"]
        .into_iter()
        .filter_map(|name| lookup(name))
        .find(|value| !value.is_empty())
        .unwrap_or_else(|| "C".to_string());
    lang.trim_end_matches(".UTF-8").trim_end_matches(".utf8").to_string()
}
