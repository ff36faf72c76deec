use crate::{
    conv::{Conversation, ConversationChannel, PromptStyle},
    model::{Frontend, Model, PamOutcome, PamStatus, RelayModel, TerminalModel, control_loop},
    options::ModuleOptions,
    relay::{JSON_EXTENSION, JSON_PROTOCOL, RelayClient, RelayCodec, SupportedExtensions},
    session::{BrokerClient, locale_from_env},
};
use authd_core::{Broker, LOCAL_BROKER_ID};
use slog::Drain;
use std::sync::Arc;

/// Runs broker-backed authentications.
///
/// An `Authenticator` is built once per PAM handle and configured with the builder methods below.
/// Each [`Authenticator::authenticate`] call then runs one complete login and returns the PAM
/// verdict. Calls must be made from within a tokio runtime.
///
/// # Example
///
/// ```no_run
/// use authd_pam::{Authenticator, options::ModuleOptions};
/// use std::sync::Arc;
///
/// # fn build(broker: Arc<dyn authd_pam::Broker>) {
/// let authenticator = Authenticator::new(broker)
///     .logger(slog::Logger::root(slog::Discard, slog::o!()))
///     .options(ModuleOptions::default());
/// # }
/// ```
#[derive(Debug)]
pub struct Authenticator {
    broker: Arc<dyn Broker>,
    logger: Option<slog::Logger>,
    options: ModuleOptions,
    lang: Option<String>,
}

impl Authenticator {
    /// Creates an authenticator asking `broker`, with default options.
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Authenticator {
            broker,
            logger: None,
            options: ModuleOptions::default(),
            lang: None,
        }
    }

    /// Sets the structured logger. Without one, records go to the `log` crate.
    pub fn logger<L: Into<Option<slog::Logger>>>(mut self, logger: L) -> Self {
        self.logger = logger.into();
        self
    }

    /// Sets the module options.
    pub fn options(mut self, options: ModuleOptions) -> Self {
        self.options = options;
        self
    }

    /// Overrides the session language, which otherwise comes from the locale environment.
    pub fn lang<S: Into<String>>(mut self, lang: S) -> Self {
        self.lang = Some(lang.into());
        self
    }

    fn resolve_logger(&self) -> slog::Logger {
        match &self.logger {
            Some(logger) => logger.clone(),
            None => {
                let level = if self.options.debug { slog::Level::Debug } else { slog::Level::Info };
                slog::Logger::root(slog::LevelFilter::new(slog_stdlog::StdLog, level).fuse(), slog::o!())
            }
        }
    }

    /// Authenticates `user`, or a user asked for, over `conversation`.
    ///
    /// The graphical relay is used when `extensions` advertises the JSON extension, plain prompts
    /// otherwise. The outcome's message is shown to the user before returning.
    pub async fn authenticate(
        &self,
        conversation: Arc<dyn Conversation>,
        user: Option<String>,
        extensions: &SupportedExtensions,
    ) -> PamOutcome {
        let logger = self.resolve_logger();
        let channel = ConversationChannel::spawn(conversation);
        let client = BrokerClient::new(self.broker.clone(), logger.new(slog::o!("component" => "broker")));

        let frontend = match extensions.extension_type(JSON_EXTENSION) {
            Some(type_byte) if !self.options.force_terminal => {
                let logger = logger.new(slog::o!("frontend" => "relay"));
                let relay = RelayClient::new(channel.clone(), RelayCodec::new(JSON_PROTOCOL, type_byte), logger.clone());
                Frontend::Relay(RelayModel::new(relay, self.options.poll_interval, logger))
            }
            _ => Frontend::Terminal(TerminalModel::new(channel.clone(), logger.new(slog::o!("frontend" => "terminal")))),
        };
        slog::debug!(logger, "Starting authentication"; "frontend" => frontend_name(&frontend), "user" => ?user);

        let lang = self.lang.clone().unwrap_or_else(locale_from_env);
        let model = Model::new(client, frontend, logger.clone(), lang, user);
        let outcome = control_loop::run(model).await;

        if let Some(message) = outcome.message() {
            let style = match outcome {
                PamOutcome::Error { .. } => PromptStyle::ErrorMsg,
                PamOutcome::Success { .. } | PamOutcome::Ignore { .. } => PromptStyle::TextInfo,
            };
            if let Err(e) = channel.prompt(style, message).await {
                slog::warn!(logger, "Could not show the final message: {}", e);
            }
        }
        channel.close();

        slog::debug!(logger, "Authentication done"; "status" => %outcome.status());
        outcome
    }

    /// Account management: remembers the broker that granted `outcome` as the user's default.
    ///
    /// Outcomes that did not go through a broker are left to the next module.
    pub async fn account_management(&self, outcome: &PamOutcome) -> PamStatus {
        let PamOutcome::Success { broker_id, username, .. } = outcome else {
            return PamStatus::Ignore;
        };
        if broker_id.is_empty() || broker_id == LOCAL_BROKER_ID {
            return PamStatus::Ignore;
        }

        let logger = self.resolve_logger();
        let client = BrokerClient::new(self.broker.clone(), logger.new(slog::o!("component" => "broker")));
        match client.set_default_broker(broker_id, username).await {
            Ok(()) => PamStatus::Success,
            Err(e) => {
                slog::error!(logger, "Could not set default broker"; "broker" => broker_id, "user" => username, "error" => %e);
                PamStatus::SystemErr
            }
        }
    }
}

fn frontend_name(frontend: &Frontend) -> &'static str {
    match frontend {
        Frontend::Relay(_) => "relay",
        Frontend::Terminal(_) => "terminal",
    }
}
