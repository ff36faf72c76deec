//! Contains code pertaining to the arguments a PAM service file passes to the module.
//!
//! Arguments are either bare flags or `key=value` pairs:
//!
//! ```text
//! auth [success=ok default=die] pam_authd.so socket=/run/authd.sock debug poll_interval_ms=32
//! ```

use std::{path::PathBuf, time::Duration};
use thiserror::Error;

pub(crate) const DEFAULT_POLL_INTERVAL_MS: u64 = 16;
pub(crate) const DEFAULT_SOCKET_PATH: &str = "/run/authd.sock";

/// The parsed module arguments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleOptions {
    /// Where the broker service listens.
    ///
    /// The authenticator never reads it: the embedding module uses it to connect the [`Broker`]
    /// handed to [`Authenticator::new`].
    ///
    /// [`Broker`]: crate::Broker
    /// [`Authenticator::new`]: crate::Authenticator::new
    pub socket: PathBuf,
    /// Log debug messages with the default logger.
    pub debug: bool,
    /// How long to wait between two polls of a relay peer.
    pub poll_interval: Duration,
    /// Prompt on the text conversation even when a relay peer is advertised.
    pub force_terminal: bool,
}

impl Default for ModuleOptions {
    fn default() -> Self {
        ModuleOptions {
            socket: PathBuf::from(DEFAULT_SOCKET_PATH),
            debug: false,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            force_terminal: false,
        }
    }
}

/// The error returned for arguments the module does not understand.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OptionsError {
    /// Neither a known flag nor a known key
    #[error("unknown module argument {0:?}")]
    UnknownArgument(String),
    /// A known key with a value that can't be used
    #[error("invalid value {value:?} for module argument {name:?}")]
    InvalidValue {
        /// The argument key
        name: String,
        /// The rejected value
        value: String,
    },
}

impl ModuleOptions {
    /// Parses the module arguments. Later arguments override earlier ones.
    pub fn from_args<I, S>(args: I) -> Result<Self, OptionsError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut options = ModuleOptions::default();
        for arg in args {
            let arg = arg.as_ref();
            match arg.split_once('=') {
                None => match arg {
                    "debug" => options.debug = true,
                    "force_terminal" => options.force_terminal = true,
                    other => return Err(OptionsError::UnknownArgument(other.to_string())),
                },
                Some(("socket", path)) if !path.is_empty() => options.socket = PathBuf::from(path),
                Some(("poll_interval_ms", millis)) => {
                    let millis: u64 = millis.parse().map_err(|_| OptionsError::InvalidValue {
                        name: "poll_interval_ms".to_string(),
                        value: millis.to_string(),
                    })?;
                    options.poll_interval = Duration::from_millis(millis);
                }
                Some((name @ "socket", value)) => {
                    return Err(OptionsError::InvalidValue {
                        name: name.to_string(),
                        value: value.to_string(),
                    });
                }
                Some(_) => return Err(OptionsError::UnknownArgument(arg.to_string())),
            }
        }
        Ok(options)
    }
}
