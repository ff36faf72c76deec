use super::{Cmd, Msg, PamStatus, error_chain};
use crate::{
    relay::{Event, RelayClient, Request, Response},
    session::AuthReply,
    stage::Stage,
};
use authd_core::{Access, AuthResponse};
use std::time::Duration;

/// The front-end for a graphical login manager, reached through the relay protocol.
///
/// Everything the orchestrator decides is mirrored to the peer as events, and the peer's own
/// events are fetched by polling.
#[derive(Debug)]
pub(crate) struct RelayModel {
    client: RelayClient,
    poll_interval: Duration,
    peer_stage: Option<Stage>,
    logger: slog::Logger,
}

impl RelayModel {
    pub(crate) fn new(client: RelayClient, poll_interval: Duration, logger: slog::Logger) -> Self {
        RelayModel {
            client,
            poll_interval,
            peer_stage: None,
            logger,
        }
    }

    pub(super) fn init(&self) -> Cmd {
        let client = self.client.clone();
        Cmd::task(async move {
            match client.handshake().await {
                Ok(_) => Msg::FrontendReady.into(),
                Err(e) => Cmd::exit(
                    PamStatus::CredUnavail,
                    format!("relay protocol initialization failed: {}", error_chain(&e)),
                ),
            }
        })
    }

    /// Asks for the peer's layouts, then starts polling.
    pub(super) fn start(&self) -> Cmd {
        let client = self.client.clone();
        let capabilities = Cmd::task(async move {
            match client.request(Request::UiLayoutCapabilities {}).await {
                Ok(Response::UiLayoutCapabilities { supported_ui_layouts }) => Msg::SupportedUiLayoutsReceived {
                    layouts: supported_ui_layouts,
                }
                .into(),
                Ok(other) => Cmd::exit(
                    PamStatus::SystemErr,
                    format!("unexpected {} response to UI layout capabilities request", other.response_type()),
                ),
                Err(e) => Cmd::exit(PamStatus::SystemErr, format!("sending relay request failed: {}", error_chain(&e))),
            }
        });
        Cmd::sequence([capabilities, self.poll()])
    }

    fn poll(&self) -> Cmd {
        let client = self.client.clone();
        Cmd::task(async move {
            match client.poll().await {
                Ok(events) => Msg::RelayPolled { events }.into(),
                Err(e) => Cmd::exit(PamStatus::SystemErr, format!("sending relay poll failed: {}", error_chain(&e))),
            }
        })
    }

    fn emit(&self, event: Event) -> Cmd {
        let client = self.client.clone();
        let logger = self.logger.clone();
        Cmd::task(async move {
            let kind = event.event_type();
            match client.emit_event(event).await {
                Ok(()) => {
                    slog::debug!(logger, "Event sent to relay peer"; "event" => kind);
                    Cmd::None
                }
                Err(e) => Cmd::exit(PamStatus::SystemErr, format!("sending relay event failed: {}", error_chain(&e))),
            }
        })
    }

    pub(super) fn update(&mut self, msg: &Msg) -> Cmd {
        match msg {
            Msg::RelayPollDone => Cmd::after(self.poll_interval, self.poll()),

            Msg::UserSelected { username } => self.emit(Event::UserSelected {
                user_id: username.clone(),
            }),
            Msg::BrokersListReceived { brokers } => self.emit(Event::BrokersReceived {
                brokers_infos: brokers.clone(),
            }),
            Msg::BrokerSelected { broker_id } => self.emit(Event::BrokerSelected {
                broker_id: broker_id.clone(),
            }),
            Msg::AuthModesReceived { modes } => {
                let emitted = self.emit(Event::AuthModesReceived {
                    auth_modes: modes.clone(),
                });
                // The peer may override this choice with its own authModeSelected event.
                let first = match modes.first() {
                    Some(mode) => Msg::AuthModeSelected {
                        id: Some(mode.id.clone()),
                    }
                    .into(),
                    None => Cmd::None,
                };
                Cmd::sequence([emitted, first])
            }
            Msg::AuthModeSelected { id: Some(id) } => self.emit(Event::AuthModeSelected {
                auth_mode_id: id.clone(),
            }),
            Msg::UiLayoutReceived { layout } => self.emit(Event::UiLayoutReceived {
                ui_layout: layout.clone(),
            }),
            Msg::StartAuthentication => self.emit(Event::StartAuthentication {}),
            _ => Cmd::None,
        }
    }

    /// Translates the polled peer events, in order, and schedules the next poll after them.
    pub(super) fn polled(&mut self, events: Vec<Event>) -> Cmd {
        let mut cmds = Vec::with_capacity(events.len() + 1);
        for event in events {
            slog::debug!(self.logger, "Event received from relay peer"; "event" => event.event_type());
            let cmd = match event {
                Event::UserSelected { user_id } => Msg::UserSelected { username: user_id }.into(),
                Event::BrokerSelected { broker_id } => Msg::BrokerSelected { broker_id }.into(),
                Event::AuthModeSelected { auth_mode_id } => Msg::AuthModeSelected { id: Some(auth_mode_id) }.into(),
                Event::ReselectAuthMode {} => Msg::ReselectAuthMode.into(),
                Event::IsAuthenticatedRequested { authentication_data } => Msg::AuthenticationRequested {
                    item: authentication_data,
                }
                .into(),
                Event::IsAuthenticatedCancelled {} => Msg::AuthenticationCancelled.into(),
                Event::StageChanged { stage } => {
                    self.peer_stage = Some(stage);
                    let cancel = if stage != Stage::Challenge {
                        Msg::AuthenticationCancelled.into()
                    } else {
                        Cmd::None
                    };
                    Cmd::sequence([cancel, Msg::ChangeStage(stage).into()])
                }
                other => {
                    slog::debug!(self.logger, "Ignoring event the peer is not expected to send"; "event" => other.event_type());
                    Cmd::None
                }
            };
            cmds.push(cmd);
        }
        cmds.push(Msg::RelayPollDone.into());
        Cmd::sequence(cmds)
    }

    /// Tells the peer about a stage it did not initiate.
    pub(super) fn stage_changed(&mut self, stage: Stage) -> Cmd {
        if self.peer_stage == Some(stage) {
            return Cmd::None;
        }
        self.peer_stage = Some(stage);

        let client = self.client.clone();
        let logger = self.logger.clone();
        Cmd::task(async move {
            match client.request(Request::ChangeStage { stage }).await {
                Ok(_) => {
                    slog::debug!(logger, "Stage change sent to relay peer"; "stage" => %stage);
                    Cmd::None
                }
                Err(e) => Cmd::exit(PamStatus::SystemErr, format!("changing relay stage failed: {}", error_chain(&e))),
            }
        })
    }

    pub(super) fn authentication_result(&mut self, reply: &AuthReply) -> Cmd {
        if reply.access == Access::Cancelled {
            return Cmd::None;
        }
        self.emit(Event::AuthEvent {
            response: AuthResponse::new(reply.access.to_string(), reply.msg.clone()),
        })
    }
}
