//! authd-pam drives a broker-backed login from inside a PAM module.
//!
//! One call to [`Authenticator::authenticate`] walks the user through four stages: pick a user,
//! pick a broker, pick an authentication mode and answer its challenge. The conversation with the
//! user either happens as plain PAM text prompts, or is relayed as JSON [`relay::Envelope`]s to a
//! graphical login manager that renders the UI itself.
//!
//! Brokers plug in through the [`Broker`] trait of the `authd-core` crate.
//!
//! # Example
//!
//! ```no_run
//! use authd_pam::{Authenticator, PamStatus, conv::Conversation, relay::SupportedExtensions};
//! use authd_pam::options::ModuleOptions;
//! use std::sync::Arc;
//!
//! async fn login(broker: Arc<dyn authd_pam::Broker>, conversation: Arc<dyn Conversation>) -> bool {
//!     let options = ModuleOptions::from_args(["debug", "poll_interval_ms=32"]).unwrap();
//!     let outcome = Authenticator::new(broker)
//!         .options(options)
//!         .authenticate(conversation, Some("alice".to_string()), &SupportedExtensions::from_env())
//!         .await;
//!     outcome.status() == PamStatus::Success
//! }
//! ```

pub mod conv;
pub mod options;
pub mod relay;
pub mod session;
pub mod stage;

mod driver;
mod model;

pub use authd_core::{Broker, BrokerError, BrokerErrorKind};
pub use driver::Authenticator;
pub use model::{PamOutcome, PamStatus};

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
