use super::PamOutcome;
use crate::{
    relay::Event,
    session::{AuthReply, Session, SessionError},
    stage::Stage,
};
use authd_core::{AuthMode, AuthenticationItem, BrokerInfo, UiLayout};
use std::sync::Arc;

/// Everything the orchestrator reacts to. Messages are handled one at a time, in arrival order.
#[derive(Debug)]
pub(crate) enum Msg {
    /// Leave the state machine with this outcome.
    Exit(PamOutcome),
    /// Stop the message loop. Sent once the exit clean up is done.
    Quit,
    /// The front-end is initialized and the flow can start.
    FrontendReady,

    /// No username is known yet, the front-end should ask for one.
    UserRequired,
    UserSelected {
        username: String,
    },
    BrokersListReceived {
        brokers: Vec<BrokerInfo>,
    },
    /// Sent when either the username or the broker list arrives. Acts once both are known.
    UsernameOrBrokerListReceived,
    /// No previous broker applies, the front-end should pick one.
    BrokerSelectionRequired,
    BrokerSelected {
        broker_id: String,
    },
    SessionStarted(Arc<Session>),
    SessionEnded,

    SupportedUiLayoutsReceived {
        layouts: Vec<UiLayout>,
    },
    /// Lists the authentication modes once both a session and the supported layouts are known.
    AuthModesRequested,
    AuthModesReceived {
        modes: Vec<AuthMode>,
    },
    /// `None` reselects the current mode.
    AuthModeSelected {
        id: Option<String>,
    },
    UiLayoutReceived {
        layout: UiLayout,
    },

    ChangeStage(Stage),

    StartAuthentication,
    AuthenticationRequested {
        item: AuthenticationItem,
    },
    /// Raw result of a submission, tagged with the submission it belongs to.
    AuthenticationSubmitted {
        generation: u64,
        result: Result<AuthReply, SessionError>,
    },
    AuthenticationCancelled,
    ReselectAuthMode,

    /// The terminal user asked to go one stage back.
    GoBack,
    RelayPolled {
        events: Vec<Event>,
    },
    RelayPollDone,
}

impl Msg {
    /// A short name for logging. Never includes the payload, which may carry secrets.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Msg::Exit(_) => "Exit",
            Msg::Quit => "Quit",
            Msg::FrontendReady => "FrontendReady",
            Msg::UserRequired => "UserRequired",
            Msg::UserSelected { .. } => "UserSelected",
            Msg::BrokersListReceived { .. } => "BrokersListReceived",
            Msg::UsernameOrBrokerListReceived => "UsernameOrBrokerListReceived",
            Msg::BrokerSelectionRequired => "BrokerSelectionRequired",
            Msg::BrokerSelected { .. } => "BrokerSelected",
            Msg::SessionStarted(_) => "SessionStarted",
            Msg::SessionEnded => "SessionEnded",
            Msg::SupportedUiLayoutsReceived { .. } => "SupportedUiLayoutsReceived",
            Msg::AuthModesRequested => "AuthModesRequested",
            Msg::AuthModesReceived { .. } => "AuthModesReceived",
            Msg::AuthModeSelected { .. } => "AuthModeSelected",
            Msg::UiLayoutReceived { .. } => "UiLayoutReceived",
            Msg::ChangeStage(_) => "ChangeStage",
            Msg::StartAuthentication => "StartAuthentication",
            Msg::AuthenticationRequested { .. } => "AuthenticationRequested",
            Msg::AuthenticationSubmitted { .. } => "AuthenticationSubmitted",
            Msg::AuthenticationCancelled => "AuthenticationCancelled",
            Msg::ReselectAuthMode => "ReselectAuthMode",
            Msg::GoBack => "GoBack",
            Msg::RelayPolled { .. } => "RelayPolled",
            Msg::RelayPollDone => "RelayPollDone",
        }
    }
}
