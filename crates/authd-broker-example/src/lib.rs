//! An in-memory [`Broker`] for tests and demos.
//!
//! [`ExampleBroker`] behaves like a small identity provider: it hands out an RSA session key,
//! decrypts the challenges it receives and knows a fixed set of authentication modes:
//!
//! | mode          | layout        | accepts                               |
//! |---------------|---------------|---------------------------------------|
//! | `password`    | `form`        | [`PASSWORD`]                          |
//! | `pincode`     | `form`        | [`PIN`]                               |
//! | `phoneack`    | `form`, wait  | a wait request, after a short delay   |
//! | `qrcode`      | `qrcode`      | a wait request, after a short delay   |
//! | `newpassword` | `newpassword` | any non-empty password, or a skip     |
//!
//! Users whose name starts with [`MFA_USER_PREFIX`] must pass a second factor (`pincode`) after the
//! first one. Users whose name starts with [`RESET_USER_PREFIX`] must choose a new password.

use async_trait::async_trait;
use authd_core::{
    AuthMode, AuthResponse, AuthenticationItem, Broker, BrokerError, BrokerErrorKind, BrokerInfo, LOCAL_BROKER_ID, SessionInfo,
    UiLayout,
};
use base64::{Engine, engine::general_purpose::STANDARD};
use lazy_static::lazy_static;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey, pkcs8::EncodePublicKey};
use sha2::Sha512;
use std::{
    collections::HashMap,
    fmt,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio_util::sync::CancellationToken;

/// The id of the example broker itself.
pub const BROKER_ID: &str = "example";
/// The secret of the `password` mode.
pub const PASSWORD: &str = "goodpass";
/// The secret of the `pincode` mode.
pub const PIN: &str = "4242";
/// Wrong answers a session may give before access is denied.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
/// Users with this name prefix need a second factor.
pub const MFA_USER_PREFIX: &str = "user-mfa";
/// Users with this name prefix must change their password.
pub const RESET_USER_PREFIX: &str = "user-needs-reset";

const DEFAULT_ACK_DELAY: Duration = Duration::from_millis(50);
const FIRST_FACTOR_MODES: &[&str] = &["password", "pincode", "phoneack", "qrcode"];
const SECOND_FACTOR_MODES: &[&str] = &["pincode"];
const RESET_MODES: &[&str] = &["newpassword"];

lazy_static! {
    // Generating a key is slow, every broker of the process shares this one.
    static ref PRIVATE_KEY: Result<RsaPrivateKey, String> =
        RsaPrivateKey::new(&mut rand::rngs::OsRng, 2048).map_err(|e| e.to_string());
}

/// How a mode decides.
#[derive(Clone, Debug)]
enum Check {
    Secret(&'static str),
    Ack,
    NewPassword,
}

#[derive(Clone, Debug)]
struct ModeEntry {
    mode: AuthMode,
    layout: UiLayout,
    check: Check,
}

fn catalog() -> Vec<ModeEntry> {
    let form = |label: &str, entry: Option<&str>, wait: bool| UiLayout {
        label: Some(label.to_string()),
        entry: entry.map(str::to_string),
        wait: wait.then(|| "true".to_string()),
        ..UiLayout::new("form")
    };
    vec![
        ModeEntry {
            mode: AuthMode::new("password", "Password authentication"),
            layout: form("Gimme your password", Some("chars_password"), false),
            check: Check::Secret(PASSWORD),
        },
        ModeEntry {
            mode: AuthMode::new("pincode", "Pin code"),
            layout: form("Enter your pin code", Some("digits_password"), false),
            check: Check::Secret(PIN),
        },
        ModeEntry {
            mode: AuthMode::new("phoneack", "Use your phone"),
            layout: form("Unlock your phone or accept the request", None, true),
            check: Check::Ack,
        },
        ModeEntry {
            mode: AuthMode::new("qrcode", "Use a login code"),
            layout: UiLayout {
                label: Some("Scan the QR code or enter the code in the login page".into()),
                content: Some("https://login.example.com/device".into()),
                code: Some("1337".into()),
                wait: Some("true".into()),
                button: Some("Regenerate code".into()),
                ..UiLayout::new("qrcode")
            },
            check: Check::Ack,
        },
        ModeEntry {
            mode: AuthMode::new("newpassword", "Define your new password"),
            layout: UiLayout {
                label: Some("Enter your new password".into()),
                entry: Some("chars_password".into()),
                ..UiLayout::new("newpassword")
            },
            check: Check::NewPassword,
        },
    ]
}

/// Where a session is in its authentication.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Factor {
    First,
    Second,
    Reset,
}

#[derive(Debug)]
struct SessionState {
    username: String,
    factor: Factor,
    mode: Option<String>,
    attempts: u32,
    running: bool,
}

#[derive(Debug, Default)]
struct State {
    sessions: HashMap<String, SessionState>,
    next_session: u64,
    previous: HashMap<String, String>,
    defaults: Vec<(String, String)>,
    ended: Vec<String>,
    running: usize,
    max_running: usize,
}

/// The outcome of checking one submission, before the session budget is applied.
enum Verdict {
    Cancelled,
    Passed,
    Failed,
    Retry(String),
}

/// An in-memory broker. See the crate documentation for the modes it offers.
pub struct ExampleBroker {
    key: RsaPrivateKey,
    brokers: Vec<BrokerInfo>,
    first_factor: Vec<String>,
    max_attempts: u32,
    challenge_delay: Duration,
    ack_delay: Duration,
    catalog: Vec<ModeEntry>,
    state: Mutex<State>,
}

impl fmt::Debug for ExampleBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExampleBroker")
            .field("brokers", &self.brokers)
            .field("first_factor", &self.first_factor)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl ExampleBroker {
    /// Creates the broker. Lists itself and the local broker.
    pub fn new() -> Result<Self, BrokerError> {
        let key = PRIVATE_KEY
            .as_ref()
            .map_err(|e| BrokerError::new(BrokerErrorKind::Internal, format!("could not generate key: {e}")))?
            .clone();
        Ok(ExampleBroker {
            key,
            brokers: vec![BrokerInfo::new(BROKER_ID, "ExampleBroker"), BrokerInfo::new(LOCAL_BROKER_ID, "Local")],
            first_factor: FIRST_FACTOR_MODES.iter().map(|m| m.to_string()).collect(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            challenge_delay: Duration::ZERO,
            ack_delay: DEFAULT_ACK_DELAY,
            catalog: catalog(),
            state: Mutex::new(State::default()),
        })
    }

    /// Replaces the listed brokers. Sessions can only be started on listed ones.
    pub fn with_brokers(mut self, brokers: Vec<BrokerInfo>) -> Self {
        self.brokers = brokers;
        self
    }

    /// Restricts the first factor to the given modes, in that order.
    pub fn with_modes(mut self, modes: &[&str]) -> Self {
        self.first_factor = modes.iter().map(|m| m.to_string()).collect();
        self
    }

    /// Sets how many wrong answers a session may give.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Remembers `broker_id` as the broker `username` used last time.
    pub fn with_previous_broker(self, username: &str, broker_id: &str) -> Self {
        self.state().previous.insert(username.to_string(), broker_id.to_string());
        self
    }

    /// Delays every challenge check, so tests can race them.
    pub fn with_challenge_delay(mut self, delay: Duration) -> Self {
        self.challenge_delay = delay;
        self
    }

    /// Sets how long waiting modes take to be acknowledged.
    pub fn with_ack_delay(mut self, delay: Duration) -> Self {
        self.ack_delay = delay;
        self
    }

    /// The sessions ended so far, in order.
    pub fn ended_sessions(&self) -> Vec<String> {
        self.state().ended.clone()
    }

    /// The sessions started and not ended yet.
    pub fn active_sessions(&self) -> usize {
        self.state().sessions.len()
    }

    /// The `(broker, user)` pairs recorded as defaults, in order.
    pub fn default_brokers(&self) -> Vec<(String, String)> {
        self.state().defaults.clone()
    }

    /// The highest number of authentication checks that ever ran at the same time.
    pub fn max_concurrent_submissions(&self) -> usize {
        self.state().max_running
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn entry(&self, auth_mode_id: &str) -> Option<&ModeEntry> {
        self.catalog.iter().find(|entry| entry.mode.id == auth_mode_id)
    }

    fn offered(&self, factor: Factor) -> Vec<&ModeEntry> {
        let ids: Vec<&str> = match factor {
            Factor::First => self.first_factor.iter().map(String::as_str).collect(),
            Factor::Second => SECOND_FACTOR_MODES.to_vec(),
            Factor::Reset => RESET_MODES.to_vec(),
        };
        ids.into_iter().filter_map(|id| self.entry(id)).collect()
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String, BrokerError> {
        let bytes = STANDARD
            .decode(ciphertext)
            .map_err(|e| BrokerError::new(BrokerErrorKind::InvalidArgument, format!("challenge is not base64: {e}")))?;
        let plain = self
            .key
            .decrypt(Oaep::new::<Sha512>(), &bytes)
            .map_err(|e| BrokerError::new(BrokerErrorKind::InvalidArgument, format!("could not decrypt challenge: {e}")))?;
        String::from_utf8(plain).map_err(|e| BrokerError::new(BrokerErrorKind::InvalidArgument, e))
    }

    async fn check(&self, check: &Check, item: &AuthenticationItem, cancel: &CancellationToken) -> Result<Verdict, BrokerError> {
        let delay = match check {
            Check::Ack => self.ack_delay,
            Check::Secret(_) | Check::NewPassword => self.challenge_delay,
        };
        if pause(delay, cancel).await {
            return Ok(Verdict::Cancelled);
        }

        match (check, item) {
            (Check::Secret(expected), AuthenticationItem::Challenge(ciphertext)) => {
                if self.decrypt(ciphertext)? == *expected {
                    Ok(Verdict::Passed)
                } else {
                    Ok(Verdict::Failed)
                }
            }
            (Check::NewPassword, AuthenticationItem::Challenge(ciphertext)) => {
                if self.decrypt(ciphertext)?.is_empty() {
                    Ok(Verdict::Retry("The new password can't be empty".to_string()))
                } else {
                    Ok(Verdict::Passed)
                }
            }
            (Check::NewPassword, AuthenticationItem::Skip(_)) | (Check::Ack, AuthenticationItem::Wait(_)) => Ok(Verdict::Passed),
            (_, item) => Err(BrokerError::new(
                BrokerErrorKind::InvalidArgument,
                format!("authentication data {item:?} does not fit the selected mode"),
            )),
        }
    }

    /// Applies the verdict to the session and builds the reply.
    fn conclude(&self, session: &mut SessionState, verdict: Verdict) -> AuthResponse {
        match verdict {
            Verdict::Cancelled => AuthResponse::new("cancelled", ""),
            Verdict::Retry(message) => AuthResponse::new("retry", message_json(&message)),
            Verdict::Failed => {
                session.attempts += 1;
                if session.attempts >= self.max_attempts {
                    return AuthResponse::new("denied", "");
                }
                let left = self.max_attempts - session.attempts;
                AuthResponse::new("retry", message_json(&format!("Invalid secret, {left} attempts left")))
            }
            Verdict::Passed if session.factor == Factor::First && session.username.starts_with(MFA_USER_PREFIX) => {
                session.factor = Factor::Second;
                session.mode = None;
                AuthResponse::new("next", message_json("A second factor is required"))
            }
            Verdict::Passed if session.factor == Factor::First && session.username.starts_with(RESET_USER_PREFIX) => {
                session.factor = Factor::Reset;
                session.mode = None;
                AuthResponse::new("next", message_json("Your password has expired, please choose a new one"))
            }
            Verdict::Passed => AuthResponse::new("granted", message_json(&format!("Welcome, {}", session.username))),
        }
    }
}

fn message_json(message: &str) -> String {
    serde_json::json!({ "message": message }).to_string()
}

/// Waits `delay` unless cancelled first. Returns whether the wait was cancelled.
async fn pause(delay: Duration, cancel: &CancellationToken) -> bool {
    if cancel.is_cancelled() {
        return true;
    }
    if delay.is_zero() {
        return false;
    }
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

fn unknown_session(session_id: &str) -> BrokerError {
    BrokerError::new(BrokerErrorKind::InvalidArgument, format!("unknown session {session_id:?}"))
}

#[async_trait]
impl Broker for ExampleBroker {
    async fn list_brokers(&self) -> Result<Vec<BrokerInfo>, BrokerError> {
        Ok(self.brokers.clone())
    }

    async fn previous_broker(&self, username: &str) -> Result<Option<String>, BrokerError> {
        Ok(self.state().previous.get(username).cloned())
    }

    #[tracing_attributes::instrument]
    async fn start_session(&self, broker_id: &str, username: &str, lang: &str) -> Result<SessionInfo, BrokerError> {
        if broker_id == LOCAL_BROKER_ID || !self.brokers.iter().any(|b| b.id == broker_id) {
            return Err(BrokerError::new(BrokerErrorKind::InvalidArgument, format!("unknown broker {broker_id:?}")));
        }
        let public_key = RsaPublicKey::from(&self.key)
            .to_public_key_der()
            .map_err(|e| BrokerError::new(BrokerErrorKind::Internal, e.to_string()))?;

        let mut state = self.state();
        state.next_session += 1;
        let session_id = format!("{broker_id}-{}", state.next_session);
        state.sessions.insert(
            session_id.clone(),
            SessionState {
                username: username.to_string(),
                factor: Factor::First,
                mode: None,
                attempts: 0,
                running: false,
            },
        );
        Ok(SessionInfo {
            session_id,
            encryption_key: STANDARD.encode(public_key.as_bytes()),
        })
    }

    async fn list_auth_modes(&self, session_id: &str, supported_layouts: &[UiLayout]) -> Result<Vec<AuthMode>, BrokerError> {
        let factor = self.state().sessions.get(session_id).map(|s| s.factor).ok_or_else(|| unknown_session(session_id))?;
        Ok(self
            .offered(factor)
            .into_iter()
            .filter(|entry| supported_layouts.iter().any(|l| l.kind == entry.layout.kind))
            .map(|entry| entry.mode.clone())
            .collect())
    }

    async fn select_auth_mode(&self, session_id: &str, auth_mode_id: &str) -> Result<Option<UiLayout>, BrokerError> {
        let mut state = self.state();
        let session = state.sessions.get_mut(session_id).ok_or_else(|| unknown_session(session_id))?;
        let entry = self
            .offered(session.factor)
            .into_iter()
            .find(|entry| entry.mode.id == auth_mode_id)
            .ok_or_else(|| BrokerError::new(BrokerErrorKind::InvalidArgument, format!("unknown authentication mode {auth_mode_id:?}")))?;
        session.mode = Some(auth_mode_id.to_string());
        Ok(Some(entry.layout.clone()))
    }

    #[tracing_attributes::instrument(skip(item, cancel))]
    async fn submit_authentication(
        &self,
        session_id: &str,
        item: &AuthenticationItem,
        cancel: CancellationToken,
    ) -> Result<AuthResponse, BrokerError> {
        let check = {
            let mut state = self.state();
            let session = state.sessions.get_mut(session_id).ok_or_else(|| unknown_session(session_id))?;
            let mode = session
                .mode
                .as_deref()
                .ok_or_else(|| BrokerError::new(BrokerErrorKind::InvalidState, "no authentication mode selected"))?;
            let check = self
                .entry(mode)
                .map(|entry| entry.check.clone())
                .ok_or_else(|| BrokerError::new(BrokerErrorKind::InvalidArgument, format!("unknown authentication mode {mode:?}")))?;
            if session.running {
                return Err(BrokerError::new(
                    BrokerErrorKind::InvalidState,
                    format!("IsAuthenticated already running for session {session_id:?}"),
                ));
            }
            session.running = true;
            state.running += 1;
            state.max_running = state.max_running.max(state.running);
            check
        };

        let verdict = self.check(&check, item, &cancel).await;

        let mut state = self.state();
        state.running -= 1;
        let Some(session) = state.sessions.get_mut(session_id) else {
            // Ended while the check ran.
            return Ok(AuthResponse::new("cancelled", ""));
        };
        session.running = false;
        Ok(self.conclude(session, verdict?))
    }

    async fn end_session(&self, session_id: &str) -> Result<(), BrokerError> {
        let mut state = self.state();
        if state.sessions.remove(session_id).is_none() {
            return Err(unknown_session(session_id));
        }
        state.ended.push(session_id.to_string());
        Ok(())
    }

    async fn set_default_broker(&self, broker_id: &str, username: &str) -> Result<(), BrokerError> {
        let mut state = self.state();
        state.defaults.push((broker_id.to_string(), username.to_string()));
        state.previous.insert(username.to_string(), broker_id.to_string());
        Ok(())
    }
}
