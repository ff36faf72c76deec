use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// The identifier of the synthetic broker that hands authentication back to the next PAM module.
pub const LOCAL_BROKER_ID: &str = "local";

/// A selectable broker.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerInfo {
    /// Unique broker identifier
    pub id: String,
    /// Human readable name
    pub name: String,
    /// Path to an icon the UI may show next to the name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brand_icon: Option<String>,
}

impl BrokerInfo {
    /// Creates a broker entry without icon.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        BrokerInfo {
            id: id.into(),
            name: name.into(),
            brand_icon: None,
        }
    }
}

/// An authentication mode offered by a broker for a session.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthMode {
    /// Mode identifier, unique within the session
    pub id: String,
    /// Human readable label
    pub label: String,
}

impl AuthMode {
    /// Creates a new authentication mode.
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        AuthMode {
            id: id.into(),
            label: label.into(),
        }
    }
}

/// Describes what the front-end should render for the selected authentication mode.
///
/// The same shape doubles as a capability description when a front-end announces the layouts it
/// supports, in which case the optional fields carry `required:`/`optional:` value lists such as
/// `optional:chars,chars_password`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiLayout {
    /// The layout type, e.g. `form`, `qrcode` or `newpassword`
    #[serde(rename = "type")]
    pub kind: String,
    /// Text shown above the entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Label of an optional button that submits an empty wait request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub button: Option<String>,
    /// `"true"` when the layout completes out-of-band
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait: Option<String>,
    /// Kind of entry, e.g. `chars_password` or `digits`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<String>,
    /// Content to render, e.g. the payload of a QR code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// A code the user can type instead of scanning the content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl UiLayout {
    /// Creates a layout of the given type with no optional field set.
    pub fn new(kind: impl Into<String>) -> Self {
        UiLayout {
            kind: kind.into(),
            ..Default::default()
        }
    }

    /// Whether the layout asks the front-end to wait for out-of-band completion.
    pub fn waits(&self) -> bool {
        self.wait.as_deref() == Some("true")
    }
}

/// One authentication request. Exactly one variant is sent per request.
///
/// On the wire this is an object with a single key: `{"challenge": "..."}`, `{"wait": "true"}` or
/// `{"skip": "true"}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthenticationItem {
    /// The user provided secret. Encrypted with the session key before it reaches a broker.
    Challenge(String),
    /// Waits for an out-of-band completion, `"true"` or `"false"`.
    Wait(String),
    /// Skips the current step, `"true"` or `"false"`.
    Skip(String),
}

/// The verdict of a broker on submitted authentication data.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    /// The user is authenticated.
    #[display("granted")]
    Granted,
    /// Authentication failed and may not be retried.
    #[display("denied")]
    Denied,
    /// Authentication failed but may be retried with the same mode.
    #[display("retry")]
    Retry,
    /// This step succeeded and another authentication mode is needed.
    #[display("next")]
    Next,
    /// The request was cancelled before it completed.
    #[display("cancelled")]
    Cancelled,
}

/// Error returned when parsing an unknown [`Access`] value.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown access value {0:?}")]
pub struct UnknownAccess(pub String);

impl FromStr for Access {
    type Err = UnknownAccess;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "granted" => Ok(Access::Granted),
            "denied" => Ok(Access::Denied),
            "retry" => Ok(Access::Retry),
            "next" => Ok(Access::Next),
            "cancelled" => Ok(Access::Cancelled),
            other => Err(UnknownAccess(other.to_string())),
        }
    }
}

/// The raw reply of a broker to [`crate::Broker::submit_authentication`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResponse {
    /// One of the [`Access`] values, as text
    pub access: String,
    /// Empty, or a JSON object of the form `{"message": "..."}`
    #[serde(default)]
    pub msg: String,
}

impl AuthResponse {
    /// Creates a new response.
    pub fn new(access: impl Into<String>, msg: impl Into<String>) -> Self {
        AuthResponse {
            access: access.into(),
            msg: msg.into(),
        }
    }
}

/// The reply of a broker to [`crate::Broker::start_session`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionInfo {
    /// The session identifier used by all further calls
    pub session_id: String,
    /// Base64 encoded DER public key that challenges must be encrypted with
    pub encryption_key: String,
}
