#![allow(dead_code)]

use authd_broker_example::ExampleBroker;
use authd_pam::{
    Authenticator, PamOutcome,
    conv::{Conversation, ConversationError, ConversationErrorKind, PromptStyle},
    relay::{BinaryMessage, Envelope, Event, JSON_EXTENSION, JSON_PROTOCOL, PROTOCOL_VERSION, RelayCodec, Request, Response, SupportedExtensions},
    stage::Stage,
};
use authd_core::{AuthenticationItem, UiLayout};
use slog::Drain;
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

pub fn logger() -> slog::Logger {
    let decorator = slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    slog::Logger::root(drain, slog::o!())
}

pub fn authenticator(broker: &Arc<ExampleBroker>) -> Authenticator {
    authenticator_for(broker.clone())
}

pub fn authenticator_for(broker: Arc<dyn authd_pam::Broker>) -> Authenticator {
    Authenticator::new(broker).logger(logger()).lang("C")
}

/// Runs one authentication, failing the test instead of hanging.
pub async fn authenticate(
    authenticator: &Authenticator,
    conversation: Arc<dyn Conversation>,
    user: Option<&str>,
    extensions: &SupportedExtensions,
) -> PamOutcome {
    let login = authenticator.authenticate(conversation, user.map(str::to_string), extensions);
    tokio::time::timeout(Duration::from_secs(20), login).await.expect("authentication hung")
}

/// A text conversation replaying answers to echo prompts. Running out of answers aborts.
#[derive(Debug)]
pub struct Script {
    answers: Mutex<VecDeque<String>>,
    shown: Mutex<Vec<(PromptStyle, String)>>,
}

impl Script {
    pub fn new(answers: &[&str]) -> Arc<Self> {
        Arc::new(Script {
            answers: Mutex::new(answers.iter().map(|a| a.to_string()).collect()),
            shown: Mutex::new(vec![]),
        })
    }

    pub fn shown(&self) -> Vec<(PromptStyle, String)> {
        self.shown.lock().unwrap().clone()
    }

    pub fn shown_with(&self, style: PromptStyle) -> Vec<String> {
        self.shown().into_iter().filter(|(s, _)| *s == style).map(|(_, text)| text).collect()
    }

    pub fn unanswered(&self) -> usize {
        self.answers.lock().unwrap().len()
    }
}

impl Conversation for Script {
    fn prompt(&self, style: PromptStyle, text: &str) -> Result<String, ConversationError> {
        self.shown.lock().unwrap().push((style, text.to_string()));
        match style {
            PromptStyle::EchoOn | PromptStyle::EchoOff => {
                self.answers.lock().unwrap().pop_front().ok_or_else(|| ConversationErrorKind::Aborted.into())
            }
            PromptStyle::ErrorMsg | PromptStyle::TextInfo => Ok(String::new()),
        }
    }

    fn binary_prompt(&self, _message: &BinaryMessage) -> Result<BinaryMessage, ConversationError> {
        Err(ConversationErrorKind::Failed(19).into())
    }
}

/// A login manager speaking the relay protocol.
///
/// It picks `broker` once the brokers are announced, and answers every `startAuthentication`
/// with the next batch of items, followed by the next batch of extra events if any.
#[derive(Debug)]
pub struct RelayPeer {
    codec: RelayCodec,
    version: u32,
    layouts: Vec<UiLayout>,
    broker: Option<String>,
    state: Mutex<PeerState>,
}

#[derive(Debug, Default)]
struct PeerState {
    batches: VecDeque<Vec<AuthenticationItem>>,
    after_batches: VecDeque<Vec<Event>>,
    queued: Vec<Event>,
    received: Vec<Event>,
    stages: Vec<Stage>,
    texts: Vec<(PromptStyle, String)>,
}

impl RelayPeer {
    pub fn new(broker: &str, batches: Vec<Vec<AuthenticationItem>>) -> Self {
        RelayPeer {
            codec: RelayCodec::new(JSON_PROTOCOL, 1),
            version: PROTOCOL_VERSION,
            layouts: vec![UiLayout::new("form"), UiLayout::new("newpassword")],
            broker: Some(broker.to_string()),
            state: Mutex::new(PeerState {
                batches: batches.into(),
                ..PeerState::default()
            }),
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Sends `events` right after the next batch of items.
    pub fn then(self, events: Vec<Event>) -> Self {
        self.state.lock().unwrap().after_batches.push_back(events);
        self
    }

    /// Queues events for the next poll.
    pub fn queue(&self, events: impl IntoIterator<Item = Event>) {
        self.state.lock().unwrap().queued.extend(events);
    }

    pub fn extensions() -> SupportedExtensions {
        SupportedExtensions::new([JSON_EXTENSION])
    }

    pub fn received(&self) -> Vec<Event> {
        self.state.lock().unwrap().received.clone()
    }

    pub fn received_types(&self) -> Vec<&'static str> {
        self.received().iter().map(Event::event_type).collect()
    }

    pub fn stages(&self) -> Vec<Stage> {
        self.state.lock().unwrap().stages.clone()
    }

    pub fn texts(&self) -> Vec<(PromptStyle, String)> {
        self.state.lock().unwrap().texts.clone()
    }

    fn answer(&self, envelope: Envelope) -> Envelope {
        let mut state = self.state.lock().unwrap();
        match envelope {
            Envelope::Hello { .. } => Envelope::Hello {
                version: Some(self.version),
            },
            Envelope::Request(Request::UiLayoutCapabilities {}) => Envelope::Response(Response::UiLayoutCapabilities {
                supported_ui_layouts: self.layouts.clone(),
            }),
            Envelope::Request(Request::ChangeStage { stage }) => {
                state.stages.push(stage);
                Envelope::Response(Response::ChangeStage {})
            }
            Envelope::Poll => Envelope::PollResponse(std::mem::take(&mut state.queued)),
            Envelope::Event(event) => {
                match &event {
                    Event::BrokersReceived { .. } => {
                        if let Some(broker_id) = self.broker.clone() {
                            state.queued.push(Event::BrokerSelected { broker_id });
                        }
                    }
                    Event::StartAuthentication {} => {
                        let batch = state.batches.pop_front().unwrap_or_default();
                        state.queued.extend(batch.into_iter().map(|item| Event::IsAuthenticatedRequested {
                            authentication_data: item,
                        }));
                        let extra = state.after_batches.pop_front().unwrap_or_default();
                        state.queued.extend(extra);
                    }
                    _ => {}
                }
                state.received.push(event);
                Envelope::EventAck
            }
            other => panic!("peer can't answer {other:?}"),
        }
    }
}

impl Conversation for RelayPeer {
    fn prompt(&self, style: PromptStyle, text: &str) -> Result<String, ConversationError> {
        self.state.lock().unwrap().texts.push((style, text.to_string()));
        Ok(String::new())
    }

    fn binary_prompt(&self, message: &BinaryMessage) -> Result<BinaryMessage, ConversationError> {
        let payload = self.codec.decode(message).unwrap().expect("envelope payload");
        let reply = self.answer(Envelope::unmarshal(&payload).unwrap());
        let bytes = reply.marshal().unwrap();
        Ok(self.codec.encode(Some(bytes.as_slice())).unwrap())
    }
}
