//! The JSON envelopes carried inside relay messages.
//!
//! Every envelope is an object with a `type` key and the companion fields of that type:
//!
//! | type           | fields                                        |
//! |----------------|-----------------------------------------------|
//! | `hello`        | `helloData` (optional)                        |
//! | `request`      | `requestType`, `requestData` (optional)       |
//! | `response`     | `responseType`, `responseData` (optional)     |
//! | `event`        | `eventType`, `eventData`                      |
//! | `eventAck`     |                                               |
//! | `poll`         |                                               |
//! | `pollResponse` | `pollResponseData` (list of `event` envelopes) |
//!
//! Fields of another type are rejected, not ignored. List fields with no elements are left out of
//! the JSON, and an absent list field decodes as an empty list.

use crate::stage::Stage;
use authd_core::{Access, AuthMode, AuthResponse, AuthenticationItem, BrokerInfo, UiLayout};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use thiserror::Error;

/// Version exchanged in the `hello` handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// One relay protocol message.
#[derive(Clone, Debug, PartialEq)]
pub enum Envelope {
    /// Protocol negotiation
    Hello {
        /// The sender's protocol version
        version: Option<u32>,
    },
    /// A request expecting a [`Envelope::Response`] of the same type
    Request(Request),
    /// The answer to a request
    Response(Response),
    /// Asks the peer for queued events
    Poll,
    /// The events queued since the last poll, oldest first
    PollResponse(Vec<Event>),
    /// A notification
    Event(Event),
    /// Acknowledges an event
    EventAck,
}

/// Requests the plugin sends to its peer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "requestType",
    content = "requestData",
    rename_all = "camelCase",
    rename_all_fields = "camelCase",
    deny_unknown_fields
)]
pub enum Request {
    /// Asks which UI layouts the peer can render
    UiLayoutCapabilities {},
    /// Tells the peer the flow moved to another stage
    ChangeStage {
        /// The stage now focused
        stage: Stage,
    },
}

/// Responses to [`Request`]s.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "responseType",
    content = "responseData",
    rename_all = "camelCase",
    rename_all_fields = "camelCase",
    deny_unknown_fields
)]
pub enum Response {
    /// The layouts the peer can render
    UiLayoutCapabilities {
        /// Capability descriptions, see [`UiLayout`]
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        supported_ui_layouts: Vec<UiLayout>,
    },
    /// Acknowledges a stage change
    ChangeStage {},
}

/// Notifications exchanged in both directions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "eventType",
    content = "eventData",
    rename_all = "camelCase",
    rename_all_fields = "camelCase",
    deny_unknown_fields
)]
pub enum Event {
    /// The user to authenticate was chosen
    UserSelected {
        /// The username
        user_id: String,
    },
    /// The brokers that can be selected
    BrokersReceived {
        /// Available brokers
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        brokers_infos: Vec<BrokerInfo>,
    },
    /// A broker was chosen
    BrokerSelected {
        /// The broker id
        broker_id: String,
    },
    /// The authentication modes of the session
    AuthModesReceived {
        /// Available modes
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        auth_modes: Vec<AuthMode>,
    },
    /// An authentication mode was chosen
    AuthModeSelected {
        /// The mode id
        auth_mode_id: String,
    },
    /// The user wants to pick another authentication mode
    ReselectAuthMode {},
    /// The broker answered an authentication request
    AuthEvent {
        /// The broker verdict
        response: AuthResponse,
    },
    /// The layout of the selected mode
    UiLayoutReceived {
        /// Layout to render
        ui_layout: UiLayout,
    },
    /// The challenge can be shown
    StartAuthentication {},
    /// The user submitted authentication data
    IsAuthenticatedRequested {
        /// The submitted item, in plain text
        authentication_data: AuthenticationItem,
    },
    /// The pending authentication request should be dropped
    IsAuthenticatedCancelled {},
    /// The peer moved to another stage
    StageChanged {
        /// The stage now focused
        stage: Stage,
    },
}

const REQUEST_TYPES: &[&str] = &["uiLayoutCapabilities", "changeStage"];

const EVENT_TYPES: &[&str] = &[
    "userSelected",
    "brokersReceived",
    "brokerSelected",
    "authModesReceived",
    "authModeSelected",
    "reselectAuthMode",
    "authEvent",
    "uiLayoutReceived",
    "startAuthentication",
    "isAuthenticatedRequested",
    "isAuthenticatedCancelled",
    "stageChanged",
];

/// The reasons an envelope is rejected.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// Not JSON, or JSON of the wrong shape
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),
    /// The `type` is not one of the envelope types, or not allowed here
    #[error("unexpected type {0:?}")]
    UnexpectedType(String),
    /// A request or event type is unknown
    #[error("unexpected {field} {value:?}")]
    UnexpectedKind {
        /// `requestType`, `responseType` or `eventType`
        field: &'static str,
        /// The unknown value
        value: String,
    },
    /// A required field is absent
    #[error("missing {0}")]
    MissingField(&'static str),
    /// A field of another envelope type is present
    #[error("field {0} should not be defined")]
    ForeignField(&'static str),
    /// A field holds an unacceptable value
    #[error("invalid {field}: {reason}")]
    InvalidField {
        /// The offending field
        field: &'static str,
        /// Why it was rejected
        reason: String,
    },
    /// A member of a poll response is not a valid event
    #[error("poll response data member {index} invalid: {source}")]
    PollMember {
        /// Position of the member
        index: usize,
        /// What is wrong with it
        #[source]
        source: Box<EnvelopeError>,
    },
}

impl EnvelopeError {
    /// The wire field the error is about, if it is about a single one.
    pub fn field(&self) -> Option<&'static str> {
        match self {
            EnvelopeError::UnexpectedType(_) => Some("type"),
            EnvelopeError::UnexpectedKind { field, .. } | EnvelopeError::InvalidField { field, .. } => Some(field),
            EnvelopeError::MissingField(field) | EnvelopeError::ForeignField(field) => Some(field),
            EnvelopeError::PollMember { .. } => Some("pollResponseData"),
            EnvelopeError::Json(_) => None,
        }
    }
}

impl Envelope {
    /// The wire name of the envelope type.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Hello { .. } => "hello",
            Envelope::Request(_) => "request",
            Envelope::Response(_) => "response",
            Envelope::Poll => "poll",
            Envelope::PollResponse(_) => "pollResponse",
            Envelope::Event(_) => "event",
            Envelope::EventAck => "eventAck",
        }
    }

    /// Serializes the envelope after checking it against the same rules [`Envelope::unmarshal`] applies.
    pub fn marshal(&self) -> Result<Vec<u8>, EnvelopeError> {
        let wire = WireEnvelope::from_envelope(self)?;
        wire.clone().into_envelope()?;
        Ok(serde_json::to_vec(&wire)?)
    }

    /// Parses and validates an envelope.
    pub fn unmarshal(bytes: &[u8]) -> Result<Envelope, EnvelopeError> {
        let wire: WireEnvelope = serde_json::from_slice(bytes)?;
        wire.into_envelope()
    }
}

impl Request {
    /// The wire name of the request type.
    pub fn request_type(&self) -> &'static str {
        match self {
            Request::UiLayoutCapabilities {} => "uiLayoutCapabilities",
            Request::ChangeStage { .. } => "changeStage",
        }
    }
}

impl Response {
    /// The wire name of the response type. Equals the type of the request it answers.
    pub fn response_type(&self) -> &'static str {
        match self {
            Response::UiLayoutCapabilities { .. } => "uiLayoutCapabilities",
            Response::ChangeStage {} => "changeStage",
        }
    }
}

impl Event {
    /// The wire name of the event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Event::UserSelected { .. } => "userSelected",
            Event::BrokersReceived { .. } => "brokersReceived",
            Event::BrokerSelected { .. } => "brokerSelected",
            Event::AuthModesReceived { .. } => "authModesReceived",
            Event::AuthModeSelected { .. } => "authModeSelected",
            Event::ReselectAuthMode {} => "reselectAuthMode",
            Event::AuthEvent { .. } => "authEvent",
            Event::UiLayoutReceived { .. } => "uiLayoutReceived",
            Event::StartAuthentication {} => "startAuthentication",
            Event::IsAuthenticatedRequested { .. } => "isAuthenticatedRequested",
            Event::IsAuthenticatedCancelled {} => "isAuthenticatedCancelled",
            Event::StageChanged { .. } => "stageChanged",
        }
    }

    fn validate(&self) -> Result<(), EnvelopeError> {
        let invalid = |field, reason: &str| {
            Err(EnvelopeError::InvalidField {
                field,
                reason: reason.to_string(),
            })
        };
        match self {
            Event::BrokerSelected { broker_id } if broker_id.is_empty() => invalid("brokerId", "must not be empty"),
            Event::AuthModeSelected { auth_mode_id } if auth_mode_id.is_empty() => invalid("authModeId", "must not be empty"),
            Event::UiLayoutReceived { ui_layout } if ui_layout.kind.is_empty() => invalid("uiLayout", "layout type must not be empty"),
            Event::AuthEvent { response } => match response.access.parse::<Access>() {
                Ok(_) => Ok(()),
                Err(e) => invalid("response", &e.to_string()),
            },
            Event::IsAuthenticatedRequested {
                authentication_data: AuthenticationItem::Wait(value) | AuthenticationItem::Skip(value),
            } if value != "true" && value != "false" => invalid("authenticationData", &format!("{value:?} is not a boolean")),
            _ => Ok(()),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct HelloData {
    version: u32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct WireEnvelope {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hello_data: Option<HelloData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    request_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    request_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    response_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    response_data: Option<Value>,
    #[serde(default, skip_serializing_if = "is_none_or_empty")]
    poll_response_data: Option<Vec<WireEnvelope>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    event_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    event_data: Option<Value>,
}

fn is_none_or_empty(list: &Option<Vec<WireEnvelope>>) -> bool {
    list.as_ref().is_none_or(Vec::is_empty)
}

impl WireEnvelope {
    fn from_envelope(envelope: &Envelope) -> Result<WireEnvelope, EnvelopeError> {
        let mut wire = WireEnvelope {
            kind: Some(envelope.kind().to_string()),
            ..Default::default()
        };
        match envelope {
            Envelope::Hello { version } => wire.hello_data = version.map(|version| HelloData { version }),
            Envelope::Request(request) => {
                let (kind, data) = split_tagged(request, "requestType", "requestData")?;
                wire.request_type = Some(kind);
                wire.request_data = data;
            }
            Envelope::Response(response) => {
                let (kind, data) = split_tagged(response, "responseType", "responseData")?;
                wire.response_type = Some(kind);
                wire.response_data = data;
            }
            Envelope::Event(event) => wire.set_event(event)?,
            Envelope::PollResponse(events) if !events.is_empty() => {
                let members = events
                    .iter()
                    .map(|event| {
                        let mut member = WireEnvelope {
                            kind: Some("event".to_string()),
                            ..Default::default()
                        };
                        member.set_event(event).map(|_| member)
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                wire.poll_response_data = Some(members);
            }
            Envelope::PollResponse(_) | Envelope::Poll | Envelope::EventAck => {}
        }
        Ok(wire)
    }

    fn set_event(&mut self, event: &Event) -> Result<(), EnvelopeError> {
        let (kind, data) = split_tagged(event, "eventType", "eventData")?;
        self.event_type = Some(kind);
        self.event_data = data;
        Ok(())
    }

    fn present_fields(&self) -> impl Iterator<Item = &'static str> {
        [
            ("helloData", self.hello_data.is_some()),
            ("requestType", self.request_type.is_some()),
            ("requestData", self.request_data.is_some()),
            ("responseType", self.response_type.is_some()),
            ("responseData", self.response_data.is_some()),
            ("pollResponseData", !is_none_or_empty(&self.poll_response_data)),
            ("eventType", self.event_type.is_some()),
            ("eventData", self.event_data.is_some()),
        ]
        .into_iter()
        .filter_map(|(name, present)| present.then_some(name))
    }

    fn only(&self, allowed: &[&str]) -> Result<(), EnvelopeError> {
        match self.present_fields().find(|field| !allowed.contains(field)) {
            Some(field) => Err(EnvelopeError::ForeignField(field)),
            None => Ok(()),
        }
    }

    fn into_envelope(self) -> Result<Envelope, EnvelopeError> {
        let kind = self.kind.clone().ok_or(EnvelopeError::MissingField("type"))?;
        match kind.as_str() {
            "hello" => {
                self.only(&["helloData"])?;
                Ok(Envelope::Hello {
                    version: self.hello_data.map(|h| h.version),
                })
            }
            "request" => {
                self.only(&["requestType", "requestData"])?;
                let request_type = known_kind(self.request_type, "requestType", REQUEST_TYPES)?;
                let data = self.request_data.unwrap_or_else(empty_object);
                Ok(Envelope::Request(join_tagged(request_type, data, "requestType", "requestData")?))
            }
            "response" => {
                self.only(&["responseType", "responseData"])?;
                let response_type = known_kind(self.response_type, "responseType", REQUEST_TYPES)?;
                let data = self.response_data.unwrap_or_else(empty_object);
                Ok(Envelope::Response(join_tagged(response_type, data, "responseType", "responseData")?))
            }
            "event" => {
                self.only(&["eventType", "eventData"])?;
                let event_type = known_kind(self.event_type, "eventType", EVENT_TYPES)?;
                let data = self.event_data.ok_or(EnvelopeError::MissingField("eventData"))?;
                let event: Event = join_tagged(event_type, data, "eventType", "eventData")?;
                event.validate()?;
                Ok(Envelope::Event(event))
            }
            "eventAck" => {
                self.only(&[])?;
                Ok(Envelope::EventAck)
            }
            "poll" => {
                self.only(&[])?;
                Ok(Envelope::Poll)
            }
            "pollResponse" => {
                self.only(&["pollResponseData"])?;
                let events = self
                    .poll_response_data
                    .unwrap_or_default()
                    .into_iter()
                    .enumerate()
                    .map(|(index, member)| {
                        member.into_event().map_err(|e| EnvelopeError::PollMember {
                            index,
                            source: Box::new(e),
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Envelope::PollResponse(events))
            }
            _ => Err(EnvelopeError::UnexpectedType(kind)),
        }
    }

    fn into_event(self) -> Result<Event, EnvelopeError> {
        match self.into_envelope()? {
            Envelope::Event(event) => Ok(event),
            other => Err(EnvelopeError::UnexpectedType(other.kind().to_string())),
        }
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn known_kind(value: Option<String>, field: &'static str, known: &[&str]) -> Result<String, EnvelopeError> {
    let value = value.ok_or(EnvelopeError::MissingField(field))?;
    if !known.contains(&value.as_str()) {
        return Err(EnvelopeError::UnexpectedKind { field, value });
    }
    Ok(value)
}

fn split_tagged<T: Serialize>(value: &T, tag: &'static str, content: &'static str) -> Result<(String, Option<Value>), EnvelopeError> {
    let Value::Object(mut map) = serde_json::to_value(value)? else {
        return Err(EnvelopeError::MissingField(tag));
    };
    let kind = match map.remove(tag) {
        Some(Value::String(kind)) => kind,
        _ => return Err(EnvelopeError::MissingField(tag)),
    };
    Ok((kind, map.remove(content)))
}

fn join_tagged<T: DeserializeOwned>(kind: String, data: Value, tag: &'static str, content: &'static str) -> Result<T, EnvelopeError> {
    let mut map = Map::new();
    map.insert(tag.to_string(), Value::String(kind));
    map.insert(content.to_string(), data);
    T::deserialize(Value::Object(map)).map_err(|e| EnvelopeError::InvalidField {
        field: content,
        reason: e.to_string(),
    })
}
