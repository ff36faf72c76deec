//! The authentication state machine.
//!
//! [`Model`] owns the stage, the broker session and one sub-model per stage. It never blocks:
//! every broker or conversation call is returned as a [`Cmd`] that runs outside the handler and
//! reports back with a [`Msg`]. What the user sees is left to a [`Frontend`], either the relay
//! to a graphical login manager or plain terminal prompts.

mod authentication;
mod cmd;
pub(crate) mod control_loop;
mod msg;
mod outcome;
mod relay;
mod selection;
mod terminal;

pub(crate) use cmd::Cmd;
pub(crate) use msg::Msg;
pub(crate) use outcome::error_chain;
pub use outcome::{PamOutcome, PamStatus};
pub(crate) use relay::RelayModel;
pub(crate) use terminal::TerminalModel;

use crate::{
    relay::Event,
    session::{AuthReply, BrokerClient, Session, SessionStart},
    stage::Stage,
};
use authd_core::{Access, LOCAL_BROKER_ID};
use authentication::{Authentication, Submitted, decode_message};
use selection::{AuthModeSelection, BrokerSelection, UserSelection};
use std::sync::Arc;

/// The active user interface.
#[derive(Debug)]
pub(crate) enum Frontend {
    Relay(RelayModel),
    Terminal(TerminalModel),
}

impl Frontend {
    /// Prepares the front-end, resolving to [`Msg::FrontendReady`] or an exit.
    fn init(&self) -> Cmd {
        match self {
            Frontend::Relay(relay) => relay.init(),
            Frontend::Terminal(_) => Msg::FrontendReady.into(),
        }
    }

    /// Announces the supported layouts and starts any background activity.
    fn start(&self) -> Cmd {
        match self {
            Frontend::Relay(relay) => relay.start(),
            Frontend::Terminal(terminal) => terminal.start(),
        }
    }

    /// Lets the front-end react to a message, before the orchestrator handles it.
    fn update(&mut self, msg: &Msg) -> Cmd {
        match self {
            Frontend::Relay(relay) => relay.update(msg),
            Frontend::Terminal(terminal) => terminal.update(msg),
        }
    }

    fn stage_changed(&mut self, stage: Stage) -> Cmd {
        match self {
            Frontend::Relay(relay) => relay.stage_changed(stage),
            Frontend::Terminal(terminal) => terminal.stage_changed(stage),
        }
    }

    fn authentication_result(&mut self, reply: &AuthReply, message: Option<&str>) -> Cmd {
        match self {
            Frontend::Relay(relay) => relay.authentication_result(reply),
            Frontend::Terminal(terminal) => terminal.authentication_result(reply, message),
        }
    }

    fn polled(&mut self, events: Vec<Event>) -> Cmd {
        match self {
            Frontend::Relay(relay) => relay.polled(events),
            Frontend::Terminal(_) => Cmd::None,
        }
    }
}

/// The orchestrator.
#[derive(Debug)]
pub(crate) struct Model {
    logger: slog::Logger,
    client: BrokerClient,
    frontend: Frontend,
    lang: String,
    initial_user: Option<String>,

    stage: Stage,
    session: Option<Arc<Session>>,
    user: UserSelection,
    brokers: BrokerSelection,
    auth_modes: AuthModeSelection,
    authentication: Authentication,

    exit: Option<PamOutcome>,
}

impl Model {
    /// `user` is the user PAM already knows about, if any.
    pub(crate) fn new(client: BrokerClient, frontend: Frontend, logger: slog::Logger, lang: String, user: Option<String>) -> Self {
        Model {
            authentication: Authentication::new(logger.new(slog::o!("model" => "authentication"))),
            logger,
            client,
            frontend,
            lang,
            initial_user: user,
            stage: Stage::default(),
            session: None,
            user: UserSelection::default(),
            brokers: BrokerSelection::default(),
            auth_modes: AuthModeSelection::default(),
            exit: None,
        }
    }

    pub(crate) fn logger(&self) -> &slog::Logger {
        &self.logger
    }

    pub(crate) fn stage(&self) -> Stage {
        self.stage
    }

    /// The outcome to hand back to PAM.
    pub(crate) fn exit_status(&self) -> PamOutcome {
        self.exit.clone().unwrap_or_else(PamOutcome::initial)
    }

    pub(crate) fn init(&mut self) -> Cmd {
        self.frontend.init()
    }

    pub(crate) fn update(&mut self, msg: Msg) -> Cmd {
        if self.exit.is_some() {
            // The outstanding submission still holds back the exit clean up.
            if let Msg::AuthenticationSubmitted { generation, result } = msg {
                let (released, _) = self.authentication.submitted(generation, result, None, &self.client);
                return released;
            }
            slog::debug!(self.logger, "Exiting, message dropped"; "msg" => msg.kind());
            return Cmd::None;
        }
        if let Msg::RelayPolled { events } = msg {
            return self.frontend.polled(events);
        }

        let observed = self.frontend.update(&msg);
        let handled = self.handle(msg);
        Cmd::sequence([observed, handled])
    }

    fn handle(&mut self, msg: Msg) -> Cmd {
        match msg {
            Msg::Exit(outcome) => self.exit(outcome),

            Msg::FrontendReady => {
                let user = match self.initial_user.take() {
                    Some(username) if !username.is_empty() => Msg::UserSelected { username }.into(),
                    _ => Msg::UserRequired.into(),
                };
                let stage = self.frontend.stage_changed(self.stage);
                Cmd::batch([user, self.fetch_brokers(), stage, self.frontend.start()])
            }

            Msg::UserSelected { username } => {
                if username.is_empty() {
                    return Cmd::None;
                }
                self.user.select(username);
                Msg::UsernameOrBrokerListReceived.into()
            }

            Msg::BrokersListReceived { brokers } => {
                if brokers.is_empty() {
                    return Cmd::exit(PamStatus::SystemErr, "No brokers available");
                }
                self.brokers.set_available(brokers);
                Msg::UsernameOrBrokerListReceived.into()
            }

            Msg::UsernameOrBrokerListReceived => {
                if self.stage != Stage::UserSelection {
                    return Cmd::None;
                }
                let Some(username) = self.user.username().map(str::to_string) else {
                    return Cmd::None;
                };
                if self.brokers.available().is_none() {
                    return Cmd::None;
                }
                Cmd::sequence([self.change_stage(Stage::BrokerSelection), self.auto_select_broker(username)])
            }

            Msg::BrokerSelected { broker_id } => self.select_broker(broker_id),

            Msg::SessionStarted(session) => {
                if self.stage != Stage::BrokerSelection || self.brokers.selected() != Some(session.broker_id()) {
                    slog::debug!(self.logger, "Session started for a stale selection, ending it"; "session" => session.session_id());
                    return self.end_session(session);
                }
                self.session = Some(session);
                Msg::AuthModesRequested.into()
            }

            Msg::SupportedUiLayoutsReceived { layouts } => {
                self.auth_modes.set_supported_layouts(layouts);
                Msg::AuthModesRequested.into()
            }

            Msg::AuthModesRequested => self.list_auth_modes(),

            Msg::AuthModesReceived { modes } => {
                self.auth_modes.set_modes(modes);
                Cmd::None
            }

            Msg::AuthModeSelected { id } => self.select_auth_mode(id),

            Msg::UiLayoutReceived { layout } => {
                if self.session.is_none() {
                    return Cmd::None;
                }
                self.authentication.compose(layout);
                Cmd::sequence([self.change_stage(Stage::Challenge), Msg::StartAuthentication.into()])
            }

            Msg::ChangeStage(stage) => self.change_stage(stage),

            Msg::AuthenticationRequested { item } => {
                let Some(session) = self.session.clone() else {
                    slog::debug!(self.logger, "Authentication requested without session, dropped");
                    return Cmd::None;
                };
                if let Err(message) = self.authentication.check_quality(&item) {
                    return self.authentication_result(AuthReply {
                        access: Access::Retry,
                        msg: serde_json::json!({ "message": message }).to_string(),
                    });
                }
                self.authentication.request(item, &session, &self.client)
            }

            Msg::AuthenticationSubmitted { generation, result } => {
                let (released, submitted) =
                    self.authentication.submitted(generation, result, self.session.as_ref(), &self.client);
                let next = match submitted {
                    Submitted::Stale => Cmd::None,
                    Submitted::Superseded(cmd) => cmd,
                    Submitted::Finished(Ok(reply)) => self.authentication_result(reply),
                    Submitted::Finished(Err(e)) => {
                        Cmd::exit(PamStatus::SystemErr, format!("authentication status failure: {}", error_chain(&e)))
                    }
                };
                Cmd::sequence([released, next])
            }

            Msg::AuthenticationCancelled => {
                self.authentication.cancel();
                Cmd::None
            }

            Msg::ReselectAuthMode => {
                self.authentication.cancel();
                Msg::AuthModeSelected { id: None }.into()
            }

            Msg::Quit
            | Msg::UserRequired
            | Msg::BrokerSelectionRequired
            | Msg::SessionEnded
            | Msg::StartAuthentication
            | Msg::GoBack
            | Msg::RelayPolled { .. }
            | Msg::RelayPollDone => Cmd::None,
        }
    }

    fn exit(&mut self, outcome: PamOutcome) -> Cmd {
        match &outcome {
            PamOutcome::Error { status, message } => {
                slog::error!(self.logger, "Authentication failed"; "status" => %status, "reason" => message);
            }
            PamOutcome::Success { broker_id, username, .. } => {
                slog::debug!(self.logger, "Authentication granted"; "broker" => broker_id, "user" => username);
            }
            PamOutcome::Ignore { broker_id } => {
                slog::debug!(self.logger, "Local broker selected"; "broker" => broker_id);
            }
        }
        self.exit = Some(outcome);
        self.authentication.cancel();
        let end = match self.session.take() {
            Some(session) => self.end_session(session),
            None => Cmd::None,
        };
        self.authentication.after_in_flight(Cmd::sequence([end, Cmd::Quit]))
    }

    /// Moves to `stage`, blurring the others and resetting what the target stage invalidates.
    fn change_stage(&mut self, stage: Stage) -> Cmd {
        if stage == self.stage {
            return Cmd::None;
        }
        let previous = std::mem::replace(&mut self.stage, stage);
        slog::debug!(self.logger, "Changing stage"; "from" => %previous, "to" => %stage);

        if previous == Stage::Challenge {
            self.authentication.cancel();
        }

        let mut end = Cmd::None;
        match stage {
            Stage::UserSelection | Stage::BrokerSelection => {
                if stage == Stage::UserSelection {
                    self.user.reset();
                }
                self.brokers.reset();
                self.auth_modes.reset();
                self.authentication.end();
                if let Some(session) = self.session.take() {
                    end = self.end_session(session);
                    end = self.authentication.after_in_flight(end);
                }
            }
            Stage::AuthModeSelection => self.authentication.reset(),
            Stage::Challenge => {}
        }

        Cmd::sequence([end, self.frontend.stage_changed(stage)])
    }

    fn fetch_brokers(&self) -> Cmd {
        let client = self.client.clone();
        Cmd::task(async move {
            match client.list_brokers().await {
                Ok(brokers) => Msg::BrokersListReceived { brokers }.into(),
                Err(e) => Cmd::exit(PamStatus::SystemErr, format!("could not get current available brokers: {}", error_chain(&e))),
            }
        })
    }

    fn auto_select_broker(&self, username: String) -> Cmd {
        let client = self.client.clone();
        let known: Vec<String> = self.brokers.available().unwrap_or_default().iter().map(|b| b.id.clone()).collect();
        Cmd::task(async move {
            match client.previous_broker(&username).await {
                Ok(Some(broker_id)) if known.contains(&broker_id) => Msg::BrokerSelected { broker_id }.into(),
                Ok(_) => Msg::BrokerSelectionRequired.into(),
                Err(e) => Cmd::exit(PamStatus::SystemErr, format!("can't get previous broker: {}", error_chain(&e))),
            }
        })
    }

    fn select_broker(&mut self, broker_id: String) -> Cmd {
        let Some(username) = self.user.username().map(str::to_string) else {
            slog::debug!(self.logger, "Broker selected before user, dropped"; "broker" => &broker_id);
            return Cmd::None;
        };
        if !self.brokers.contains(&broker_id) {
            return Cmd::exit(PamStatus::SystemErr, format!("unknown broker: {broker_id:?}"));
        }
        // A peer may pick the broker before the user stage was left.
        let stage = match self.stage {
            Stage::UserSelection => self.change_stage(Stage::BrokerSelection),
            _ => Cmd::None,
        };
        self.brokers.select(&broker_id);
        let end = match self.session.take() {
            Some(session) => {
                self.authentication.end();
                let end = self.end_session(session);
                self.authentication.after_in_flight(end)
            }
            None => Cmd::None,
        };

        let client = self.client.clone();
        let lang = self.lang.clone();
        let start = Cmd::task(async move {
            match client.start_session(&broker_id, &username, &lang).await {
                Ok(SessionStart::Started(session)) => Msg::SessionStarted(Arc::new(session)).into(),
                Ok(SessionStart::Local) => Msg::Exit(PamOutcome::Ignore {
                    broker_id: LOCAL_BROKER_ID.to_string(),
                })
                .into(),
                Err(e) => Cmd::exit(PamStatus::SystemErr, format!("can't select broker: {}", error_chain(&e))),
            }
        });
        Cmd::sequence([stage, end, start])
    }

    fn end_session(&self, session: Arc<Session>) -> Cmd {
        let client = self.client.clone();
        Cmd::task(async move {
            client.end_session(&session).await;
            Msg::SessionEnded.into()
        })
    }

    fn list_auth_modes(&mut self) -> Cmd {
        let (Some(session), Some(layouts)) = (self.session.clone(), self.auth_modes.supported_layouts()) else {
            return Cmd::None;
        };
        let layouts = layouts.to_vec();
        let client = self.client.clone();
        let list = Cmd::task(async move {
            match client.list_auth_modes(&session, &layouts).await {
                Ok(modes) => Msg::AuthModesReceived { modes }.into(),
                Err(e) => Cmd::exit(PamStatus::SystemErr, format!("can't get authentication modes: {}", error_chain(&e))),
            }
        });
        Cmd::sequence([self.change_stage(Stage::AuthModeSelection), list])
    }

    fn select_auth_mode(&mut self, id: Option<String>) -> Cmd {
        let Some(session) = self.session.clone() else {
            return Cmd::None;
        };
        let Some(id) = id.or_else(|| self.auth_modes.current().map(str::to_string)) else {
            return Cmd::exit(PamStatus::SystemErr, "reselection of current auth mode without current ID");
        };
        if !self.auth_modes.contains(&id) {
            return Cmd::exit(PamStatus::SystemErr, format!("unknown authentication mode: {id:?}"));
        }
        self.auth_modes.select(&id);

        let client = self.client.clone();
        Cmd::task(async move {
            match client.select_auth_mode(&session, &id).await {
                Ok(layout) => Msg::UiLayoutReceived { layout }.into(),
                Err(e) => Cmd::exit(PamStatus::SystemErr, format!("can't select authentication mode: {}", error_chain(&e))),
            }
        })
    }

    /// Maps a broker verdict to the next step. Front-ends are told first.
    fn authentication_result(&mut self, reply: AuthReply) -> Cmd {
        if reply.access == Access::Cancelled {
            return Cmd::None;
        }
        let message = match decode_message(&reply.msg) {
            Ok(message) => message,
            Err(e) => return Cmd::exit(PamStatus::SystemErr, e),
        };
        let notify = self.frontend.authentication_result(&reply, message.as_deref());

        let next = match reply.access {
            Access::Granted => {
                let broker_id = self
                    .session
                    .as_ref()
                    .map(|s| s.broker_id().to_string())
                    .or_else(|| self.brokers.selected().map(str::to_string))
                    .unwrap_or_default();
                Msg::Exit(PamOutcome::Success {
                    broker_id,
                    username: self.user.username().unwrap_or_default().to_string(),
                    message,
                })
                .into()
            }
            Access::Retry => Msg::StartAuthentication.into(),
            Access::Denied => Cmd::exit(PamStatus::AuthErr, message.unwrap_or_else(|| "Access denied".to_string())),
            Access::Next => Msg::AuthModesRequested.into(),
            Access::Cancelled => Cmd::None,
        };
        Cmd::sequence([notify, next])
    }
}
