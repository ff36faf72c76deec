use derive_more::Display;
use std::error::Error;

/// The PAM return codes an authentication can end with. Values are the Linux-PAM ones.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display)]
pub enum PamStatus {
    /// `PAM_SUCCESS`
    #[display("success")]
    Success,
    /// `PAM_SYSTEM_ERR`
    #[display("system error")]
    SystemErr,
    /// `PAM_AUTH_ERR`
    #[display("authentication failure")]
    AuthErr,
    /// `PAM_CRED_UNAVAIL`
    #[display("credentials unavailable")]
    CredUnavail,
    /// `PAM_IGNORE`
    #[display("ignore")]
    Ignore,
    /// `PAM_ABORT`
    #[display("abort")]
    Abort,
}

impl PamStatus {
    /// The numeric PAM code.
    pub fn code(self) -> i32 {
        match self {
            PamStatus::Success => 0,
            PamStatus::SystemErr => 4,
            PamStatus::AuthErr => 7,
            PamStatus::CredUnavail => 15,
            PamStatus::Ignore => 25,
            PamStatus::Abort => 26,
        }
    }
}

/// How an authentication ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PamOutcome {
    /// The user is authenticated.
    Success {
        /// The broker that granted access
        broker_id: String,
        /// The authenticated user
        username: String,
        /// What the broker had to say, if anything
        message: Option<String>,
    },
    /// Authentication failed with a PAM error the stack can act on.
    Error {
        /// The PAM code to return
        status: PamStatus,
        /// Why it failed, for the user
        message: String,
    },
    /// The local broker was selected: the next module in the stack should authenticate.
    Ignore {
        /// Always the local broker id
        broker_id: String,
    },
}

impl PamOutcome {
    pub(crate) fn error(status: PamStatus, message: impl Into<String>) -> Self {
        PamOutcome::Error {
            status,
            message: message.into(),
        }
    }

    /// The outcome of a PAM call that never got anywhere.
    pub(crate) fn initial() -> Self {
        PamOutcome::error(PamStatus::SystemErr, "model did not return anything")
    }

    /// The PAM code to return.
    pub fn status(&self) -> PamStatus {
        match self {
            PamOutcome::Success { .. } => PamStatus::Success,
            PamOutcome::Error { status, .. } => *status,
            PamOutcome::Ignore { .. } => PamStatus::Ignore,
        }
    }

    /// The message to show the user before returning, if any.
    pub fn message(&self) -> Option<&str> {
        match self {
            PamOutcome::Success { message, .. } => message.as_deref().filter(|m| !m.is_empty()),
            PamOutcome::Error { message, .. } => Some(message.as_str()).filter(|m| !m.is_empty()),
            PamOutcome::Ignore { .. } => None,
        }
    }
}

/// Renders an error with all of its sources, `outer: inner: innermost`.
pub(crate) fn error_chain(err: &dyn Error) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{RelayError, RelayErrorKind};
    use pretty_assertions::assert_eq;

    #[test]
    fn codes_match_linux_pam() {
        let codes: Vec<i32> = [
            PamStatus::Success,
            PamStatus::SystemErr,
            PamStatus::AuthErr,
            PamStatus::CredUnavail,
            PamStatus::Ignore,
            PamStatus::Abort,
        ]
        .into_iter()
        .map(PamStatus::code)
        .collect();
        assert_eq!(codes, vec![0, 4, 7, 15, 25, 26]);
    }

    #[test]
    fn empty_messages_are_not_shown() {
        let success = PamOutcome::Success {
            broker_id: "b".into(),
            username: "alice".into(),
            message: Some(String::new()),
        };
        assert_eq!(success.message(), None);
        assert_eq!(PamOutcome::error(PamStatus::AuthErr, "").message(), None);
        assert_eq!(PamOutcome::initial().message(), Some("model did not return anything"));
    }

    #[test]
    fn chain_includes_sources() {
        let err = RelayError::new(RelayErrorKind::Handshake, "protocol version mismatch: got 9999, expected 1");
        assert_eq!(
            error_chain(&err),
            "relay error: protocol initialization failed: protocol version mismatch: got 9999, expected 1"
        );
    }
}
