use super::{
    codec::{ProtocolInfo, RelayCodec},
    envelope::{Envelope, Event, PROTOCOL_VERSION, Request, Response},
    error::{RelayError, RelayErrorKind},
};
use crate::conv::{Conversation, ConversationChannel};

/// Exchanges envelopes with the relay peer over a conversation.
///
/// Every call sends one envelope and blocks until the single reply envelope arrives. There is no
/// pipelining and no timeout.
pub struct RelayTransport<'c> {
    conversation: &'c dyn Conversation,
    codec: RelayCodec,
    logger: slog::Logger,
}

impl<'c> RelayTransport<'c> {
    /// Creates a transport over `conversation`.
    pub fn new(conversation: &'c dyn Conversation, codec: RelayCodec, logger: slog::Logger) -> Self {
        RelayTransport {
            conversation,
            codec,
            logger,
        }
    }

    /// Sends `envelope` and returns the peer's reply.
    pub fn send(&self, envelope: &Envelope) -> Result<Envelope, RelayError> {
        let payload = envelope.marshal()?;
        let request = self.codec.encode(Some(payload.as_slice()))?;
        slog::debug!(self.logger, "Sending to relay peer"; "type" => envelope.kind());

        let reply = self.conversation.binary_prompt(&request)?;
        let payload = self
            .codec
            .decode(&reply)?
            .ok_or_else(|| RelayError::new(RelayErrorKind::UnexpectedReply, "reply carries no payload"))?;
        let reply = Envelope::unmarshal(&payload)?;
        slog::debug!(self.logger, "Received from relay peer"; "type" => reply.kind());
        Ok(reply)
    }

    /// Negotiates the protocol version with the peer.
    pub fn handshake(&self) -> Result<ProtocolInfo, RelayError> {
        let reply = self
            .send(&Envelope::Hello {
                version: Some(PROTOCOL_VERSION),
            })
            .map_err(|e| RelayError::new(RelayErrorKind::Handshake, e))?;
        match reply {
            Envelope::Hello {
                version: Some(PROTOCOL_VERSION),
            } => Ok(self.codec.protocol()),
            Envelope::Hello { version } => Err(RelayError::new(
                RelayErrorKind::Handshake,
                format!(
                    "protocol version mismatch: got {}, expected {PROTOCOL_VERSION}",
                    version.map_or_else(|| "none".to_string(), |v| v.to_string())
                ),
            )),
            other => Err(RelayError::new(
                RelayErrorKind::Handshake,
                format!("unexpected {} reply to hello", other.kind()),
            )),
        }
    }

    /// Sends a request and returns the response of the same type.
    pub fn request(&self, request: Request) -> Result<Response, RelayError> {
        let request_type = request.request_type();
        match self.send(&Envelope::Request(request))? {
            Envelope::Response(response) if response.response_type() == request_type => Ok(response),
            Envelope::Response(response) => Err(RelayError::new(
                RelayErrorKind::UnexpectedReply,
                format!("{} response to {request_type} request", response.response_type()),
            )),
            other => Err(RelayError::new(
                RelayErrorKind::UnexpectedReply,
                format!("{} reply to {request_type} request", other.kind()),
            )),
        }
    }

    /// Fetches the events queued by the peer.
    pub fn poll(&self) -> Result<Vec<Event>, RelayError> {
        match self.send(&Envelope::Poll)? {
            Envelope::PollResponse(events) => Ok(events),
            other => Err(RelayError::new(
                RelayErrorKind::UnexpectedReply,
                format!("{} reply to poll", other.kind()),
            )),
        }
    }

    /// Notifies the peer. The content of the reply is not inspected.
    pub fn emit_event(&self, event: Event) -> Result<(), RelayError> {
        self.send(&Envelope::Event(event))?;
        Ok(())
    }
}

/// Async access to the relay for commands, running each call on the conversation worker.
#[derive(Clone, Debug)]
pub(crate) struct RelayClient {
    channel: ConversationChannel,
    codec: RelayCodec,
    logger: slog::Logger,
}

impl RelayClient {
    pub(crate) fn new(channel: ConversationChannel, codec: RelayCodec, logger: slog::Logger) -> Self {
        RelayClient { channel, codec, logger }
    }

    async fn call<R, F>(&self, call: F) -> Result<R, RelayError>
    where
        F: FnOnce(&RelayTransport<'_>) -> Result<R, RelayError> + Send + 'static,
        R: Send + 'static,
    {
        let codec = self.codec;
        let logger = self.logger.clone();
        self.channel
            .run(move |conversation| call(&RelayTransport::new(conversation, codec, logger)))
            .await
    }

    pub(crate) async fn handshake(&self) -> Result<ProtocolInfo, RelayError> {
        self.call(|transport| transport.handshake()).await
    }

    pub(crate) async fn request(&self, request: Request) -> Result<Response, RelayError> {
        self.call(move |transport| transport.request(request)).await
    }

    pub(crate) async fn poll(&self) -> Result<Vec<Event>, RelayError> {
        self.call(|transport| transport.poll()).await
    }

    pub(crate) async fn emit_event(&self, event: Event) -> Result<(), RelayError> {
        self.call(move |transport| transport.emit_event(event)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        conv::{ConversationError, ConversationErrorKind, PromptStyle},
        relay::{BinaryMessage, JSON_PROTOCOL},
        stage::Stage,
    };
    use authd_core::UiLayout;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    /// Answers each binary prompt with the next scripted reply and records the requests.
    #[derive(Debug)]
    struct ScriptedPeer {
        codec: RelayCodec,
        replies: Mutex<Vec<String>>,
        requests: Mutex<Vec<Envelope>>,
    }

    impl ScriptedPeer {
        fn new(replies: &[&str]) -> Self {
            ScriptedPeer {
                codec: RelayCodec::new(JSON_PROTOCOL, 1),
                replies: Mutex::new(replies.iter().rev().map(|r| r.to_string()).collect()),
                requests: Mutex::new(vec![]),
            }
        }
    }

    impl Conversation for ScriptedPeer {
        fn prompt(&self, _style: PromptStyle, _text: &str) -> Result<String, ConversationError> {
            Ok(String::new())
        }

        fn binary_prompt(&self, message: &BinaryMessage) -> Result<BinaryMessage, ConversationError> {
            let payload = self.codec.decode(message).unwrap().unwrap();
            self.requests.lock().unwrap().push(Envelope::unmarshal(&payload).unwrap());
            let reply = self.replies.lock().unwrap().pop().ok_or(ConversationErrorKind::NoResponse)?;
            Ok(self.codec.encode(Some(reply.as_bytes())).unwrap())
        }
    }

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn transport(peer: &ScriptedPeer) -> RelayTransport<'_> {
        RelayTransport::new(peer, RelayCodec::new(JSON_PROTOCOL, 1), logger())
    }

    #[test]
    fn handshake_accepts_same_version() {
        let peer = ScriptedPeer::new(&[r#"{"type":"hello","helloData":{"version":1}}"#]);
        assert_eq!(transport(&peer).handshake().unwrap(), JSON_PROTOCOL);
        assert_eq!(
            *peer.requests.lock().unwrap(),
            vec![Envelope::Hello {
                version: Some(PROTOCOL_VERSION)
            }]
        );
    }

    #[test]
    fn handshake_rejects_other_version() {
        let peer = ScriptedPeer::new(&[r#"{"type":"hello","helloData":{"version":9999}}"#]);
        let err = transport(&peer).handshake().unwrap_err();
        assert_eq!(err.kind(), RelayErrorKind::Handshake);
        assert_eq!(
            std::error::Error::source(&err).map(|s| s.to_string()),
            Some("protocol version mismatch: got 9999, expected 1".to_string())
        );
    }

    #[test]
    fn handshake_rejects_non_hello() {
        let peer = ScriptedPeer::new(&[r#"{"type":"eventAck"}"#]);
        assert_eq!(transport(&peer).handshake().unwrap_err().kind(), RelayErrorKind::Handshake);
    }

    #[test]
    fn request_checks_the_response_type() {
        let peer = ScriptedPeer::new(&[
            r#"{"type":"response","responseType":"uiLayoutCapabilities","responseData":{"supportedUiLayouts":[{"type":"form"}]}}"#,
            r#"{"type":"response","responseType":"uiLayoutCapabilities"}"#,
        ]);
        let transport = transport(&peer);

        let response = transport.request(Request::UiLayoutCapabilities {}).unwrap();
        assert_eq!(
            response,
            Response::UiLayoutCapabilities {
                supported_ui_layouts: vec![UiLayout::new("form")]
            }
        );

        let err = transport
            .request(Request::ChangeStage {
                stage: Stage::Challenge,
            })
            .unwrap_err();
        assert_eq!(err.kind(), RelayErrorKind::UnexpectedReply);
    }

    #[test]
    fn poll_returns_events_in_order() {
        let peer = ScriptedPeer::new(&[
            r#"{"type":"pollResponse","pollResponseData":[{"type":"event","eventType":"userSelected","eventData":{"userId":"alice"}},{"type":"event","eventType":"brokerSelected","eventData":{"brokerId":"example"}}]}"#,
        ]);
        let events = transport(&peer).poll().unwrap();
        assert_eq!(
            events,
            vec![
                Event::UserSelected { user_id: "alice".into() },
                Event::BrokerSelected {
                    broker_id: "example".into()
                },
            ]
        );
    }

    #[test]
    fn invalid_poll_member_fails_the_whole_poll() {
        let peer = ScriptedPeer::new(&[
            r#"{"type":"pollResponse","pollResponseData":[{"type":"event","eventType":"userSelected","eventData":{"userId":"alice"}},{"type":"event","eventType":"brokerSelected"}]}"#,
        ]);
        assert_eq!(transport(&peer).poll().unwrap_err().kind(), RelayErrorKind::Envelope);
    }

    #[test]
    fn emit_event_ignores_the_reply_content() {
        let peer = ScriptedPeer::new(&[r#"{"type":"eventAck"}"#]);
        transport(&peer).emit_event(Event::StartAuthentication {}).unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn client_runs_calls_on_the_worker() {
        let peer = std::sync::Arc::new(ScriptedPeer::new(&[r#"{"type":"pollResponse"}"#]));
        let channel = ConversationChannel::spawn(peer.clone());
        let client = RelayClient::new(channel, RelayCodec::new(JSON_PROTOCOL, 1), logger());
        assert_eq!(client.poll().await.unwrap(), vec![]);
        assert_eq!(*peer.requests.lock().unwrap(), vec![Envelope::Poll]);
    }
}
