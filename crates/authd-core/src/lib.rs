//! Core traits and types for authd brokers.
//!
//! A broker owns the identity-provider specific part of a login: it lists the authentication
//! modes it offers for a user, hands out the UI layout for the selected mode and finally decides
//! whether the submitted secret grants access. The PAM side only ever talks to a broker through
//! the [`Broker`] trait defined here.
//!
//! To plug in your own broker:
//!
//! 1. Declare dependencies on async-trait, tokio-util and authd-core
//!
//! ```toml
//! async-trait = "0.1.88"
//! tokio-util = "0.7.18"
//! authd-core = { path = "../path/to/authd-core" }
//! ```
//!
//! 2. Implement the [`Broker`] trait:
//!
//! ```no_run
//! use async_trait::async_trait;
//! use authd_core::{
//!     AuthMode, AuthResponse, AuthenticationItem, Broker, BrokerError, BrokerErrorKind, BrokerInfo, SessionInfo, UiLayout,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! #[derive(Debug)]
//! struct StubBroker;
//!
//! #[async_trait]
//! impl Broker for StubBroker {
//!     async fn list_brokers(&self) -> Result<Vec<BrokerInfo>, BrokerError> {
//!         Ok(vec![BrokerInfo::new("stub", "Stub broker")])
//!     }
//!
//!     async fn previous_broker(&self, _username: &str) -> Result<Option<String>, BrokerError> {
//!         Ok(None)
//!     }
//!
//!     async fn start_session(&self, _broker_id: &str, _username: &str, _lang: &str) -> Result<SessionInfo, BrokerError> {
//!         Err(BrokerErrorKind::Unavailable.into())
//!     }
//!
//!     async fn list_auth_modes(&self, _session_id: &str, _supported: &[UiLayout]) -> Result<Vec<AuthMode>, BrokerError> {
//!         Ok(vec![])
//!     }
//!
//!     async fn select_auth_mode(&self, _session_id: &str, _auth_mode_id: &str) -> Result<Option<UiLayout>, BrokerError> {
//!         Ok(None)
//!     }
//!
//!     async fn submit_authentication(
//!         &self,
//!         _session_id: &str,
//!         _item: &AuthenticationItem,
//!         _cancel: CancellationToken,
//!     ) -> Result<AuthResponse, BrokerError> {
//!         Ok(AuthResponse::new("denied", ""))
//!     }
//!
//!     async fn end_session(&self, _session_id: &str) -> Result<(), BrokerError> {
//!         Ok(())
//!     }
//!
//!     async fn set_default_broker(&self, _broker_id: &str, _username: &str) -> Result<(), BrokerError> {
//!         Ok(())
//!     }
//! }
//! ```

mod broker;
pub use broker::{Broker, BrokerError, BrokerErrorKind};

mod types;
pub use types::{Access, AuthMode, AuthResponse, AuthenticationItem, BrokerInfo, LOCAL_BROKER_ID, SessionInfo, UiLayout, UnknownAccess};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
