use super::{Cmd, Msg};
use crate::session::{AuthReply, BrokerClient, Session, SessionError};
use authd_core::{Access, AuthenticationItem, UiLayout};
use std::{collections::HashMap, sync::Arc};
use tokio_util::sync::CancellationToken;

/// The layout type asking for a new password.
const NEW_PASSWORD_LAYOUT: &str = "newpassword";

/// Tracks the challenge/response cycle of the challenge stage.
///
/// At most one submission is outstanding. A request that arrives while one is in flight cancels
/// it and is only sent once the broker returned from the cancelled call, so two results can never
/// race. Only the latest superseding request is kept. Work that must not overtake the outstanding
/// call, such as ending its session, is parked the same way.
#[derive(Debug)]
pub(crate) struct Authentication {
    logger: slog::Logger,
    layout: Option<UiLayout>,
    generation: u64,
    in_flight: Option<InFlight>,
    pending: Option<AuthenticationItem>,
    parked: Vec<Cmd>,
    current_challenge: Option<String>,
}

#[derive(Debug)]
struct InFlight {
    generation: u64,
    cancel: CancellationToken,
}

/// What became of a submission result.
#[derive(Debug)]
pub(crate) enum Submitted {
    /// Not the outstanding submission; dropped.
    Stale,
    /// A superseding request was waiting and has now been sent.
    Superseded(Cmd),
    /// The result stands. Cancelled calls always resolve to [`Access::Cancelled`].
    Finished(Result<AuthReply, SessionError>),
}

impl Authentication {
    pub(crate) fn new(logger: slog::Logger) -> Self {
        Authentication {
            logger,
            layout: None,
            generation: 0,
            in_flight: None,
            pending: None,
            parked: vec![],
            current_challenge: None,
        }
    }

    /// Installs the layout of the selected mode.
    pub(crate) fn compose(&mut self, layout: UiLayout) {
        self.layout = Some(layout);
    }

    #[cfg(test)]
    pub(crate) fn layout(&self) -> Option<&UiLayout> {
        self.layout.as_ref()
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Submits `item`, or queues it behind the outstanding submission after cancelling that one.
    pub(crate) fn request(&mut self, item: AuthenticationItem, session: &Arc<Session>, client: &BrokerClient) -> Cmd {
        if let Some(in_flight) = &self.in_flight {
            slog::debug!(self.logger, "Authentication in progress, cancelling it first"; "generation" => in_flight.generation);
            in_flight.cancel.cancel();
            self.pending = Some(item);
            return Cmd::None;
        }
        self.submit(item, session, client)
    }

    /// Rejects a new password that repeats the challenge the user authenticated with.
    pub(crate) fn check_quality(&self, item: &AuthenticationItem) -> Result<(), String> {
        let AuthenticationItem::Challenge(challenge) = item else {
            return Ok(());
        };
        let new_password = self.layout.as_ref().is_some_and(|l| l.kind == NEW_PASSWORD_LAYOUT);
        if new_password && !challenge.is_empty() && self.current_challenge.as_deref() == Some(challenge.as_str()) {
            return Err("The new password must be different from the current one".to_string());
        }
        Ok(())
    }

    fn submit(&mut self, item: AuthenticationItem, session: &Arc<Session>, client: &BrokerClient) -> Cmd {
        self.generation += 1;
        let generation = self.generation;
        let cancel = CancellationToken::new();
        self.in_flight = Some(InFlight {
            generation,
            cancel: cancel.clone(),
        });
        self.current_challenge = match &item {
            AuthenticationItem::Challenge(challenge) => Some(challenge.clone()),
            _ => None,
        };

        let session = session.clone();
        let client = client.clone();
        Cmd::task(async move {
            let result = client.submit_authentication(&session, item, cancel).await;
            Msg::AuthenticationSubmitted { generation, result }.into()
        })
    }

    /// Holds `cmd` back until the outstanding submission returned, or passes it on if there is none.
    pub(crate) fn after_in_flight(&mut self, cmd: Cmd) -> Cmd {
        if cmd.is_none() || self.in_flight.is_none() {
            return cmd;
        }
        slog::debug!(self.logger, "Waiting for the outstanding authentication before proceeding");
        self.parked.push(cmd);
        Cmd::None
    }

    /// Accepts the result of submission `generation`.
    ///
    /// `session` is the current one: a waiting request is dropped when there is none anymore.
    /// Returns the parked commands, which run before anything the result leads to, along with
    /// the fate of the result.
    pub(crate) fn submitted(
        &mut self,
        generation: u64,
        result: Result<AuthReply, SessionError>,
        session: Option<&Arc<Session>>,
        client: &BrokerClient,
    ) -> (Cmd, Submitted) {
        let in_flight = match self.in_flight.take() {
            Some(in_flight) if in_flight.generation == generation => in_flight,
            other => {
                self.in_flight = other;
                return (Cmd::None, Submitted::Stale);
            }
        };
        let released = Cmd::sequence(self.parked.drain(..));

        if let Some(item) = self.pending.take() {
            let submitted = match session {
                Some(session) => Submitted::Superseded(self.submit(item, session, client)),
                None => Submitted::Finished(Ok(cancelled())),
            };
            return (released, submitted);
        }

        let result = if in_flight.cancel.is_cancelled() { Ok(cancelled()) } else { result };
        if !matches!(&result, Ok(reply) if matches!(reply.access, Access::Granted | Access::Next)) {
            self.current_challenge = None;
        }
        (released, Submitted::Finished(result))
    }

    /// Cancels the outstanding submission and drops any waiting one. The broker's answer to the
    /// cancelled call is still awaited before anything else is sent.
    pub(crate) fn cancel(&mut self) {
        if let Some(in_flight) = &self.in_flight {
            in_flight.cancel.cancel();
        }
        self.pending = None;
    }

    /// Forgets the layout and cancels any submission.
    pub(crate) fn reset(&mut self) {
        self.cancel();
        self.layout = None;
    }

    /// Forgets everything tied to the session, on top of [`Authentication::reset`].
    pub(crate) fn end(&mut self) {
        self.reset();
        self.current_challenge = None;
    }
}

fn cancelled() -> AuthReply {
    AuthReply {
        access: Access::Cancelled,
        msg: String::new(),
    }
}

/// Extracts the human readable part of a broker message: nothing for an empty string, otherwise
/// the `message` entry of a JSON object of strings.
pub(crate) fn decode_message(data: &str) -> Result<Option<String>, String> {
    if data.is_empty() {
        return Ok(None);
    }
    let entries: HashMap<String, String> =
        serde_json::from_str(data).map_err(|e| format!("invalid message from provider: {e}"))?;
    if entries.is_empty() {
        return Ok(None);
    }
    match entries.get("message") {
        Some(message) if message.is_empty() => Ok(None),
        Some(message) => Ok(Some(message.clone())),
        None => Err("invalid message from provider: no message entry".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionStart;
    use authd_broker_example::ExampleBroker;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    async fn session(client: &BrokerClient) -> Arc<Session> {
        match client.start_session("example", "alice", "C").await.unwrap() {
            SessionStart::Started(session) => Arc::new(session),
            SessionStart::Local => unreachable!(),
        }
    }

    async fn run(cmd: Cmd) -> (u64, Result<AuthReply, SessionError>) {
        match cmd {
            Cmd::Task(task) => match task.await {
                Cmd::Msg(Msg::AuthenticationSubmitted { generation, result }) => (generation, result),
                other => panic!("unexpected {other:?}"),
            },
            other => panic!("expected a task, got {other:?}"),
        }
    }

    #[rstest]
    #[case::empty("", Ok(None))]
    #[case::empty_object("{}", Ok(None))]
    #[case::message(r#"{"message":"welcome"}"#, Ok(Some("welcome".to_string())))]
    #[case::empty_message(r#"{"message":""}"#, Ok(None))]
    #[case::no_message(r#"{"other":"x"}"#, Err("invalid message from provider: no message entry".to_string()))]
    fn messages_are_decoded(#[case] data: &str, #[case] expected: Result<Option<String>, String>) {
        assert_eq!(decode_message(data), expected);
    }

    #[test]
    fn invalid_json_is_rejected() {
        assert!(decode_message("not json").unwrap_err().starts_with("invalid message from provider"));
        assert!(decode_message(r#"{"message": 3}"#).is_err());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn newer_request_supersedes_the_outstanding_one() {
        let broker = Arc::new(ExampleBroker::new().unwrap());
        let client = BrokerClient::new(broker.clone(), logger());
        let session = session(&client).await;
        client.select_auth_mode(&session, "password").await.unwrap();
        let mut auth = Authentication::new(logger());

        let first = auth.request(AuthenticationItem::Challenge("wrongpass".into()), &session, &client);
        assert!(auth.request(AuthenticationItem::Challenge("goodpass".into()), &session, &client).is_none());

        let (generation, result) = run(first).await;
        let second = match auth.submitted(generation, result, Some(&session), &client).1 {
            Submitted::Superseded(cmd) => cmd,
            other => panic!("expected the waiting request to be sent, got {other:?}"),
        };
        assert!(auth.in_flight());

        let (generation, result) = run(second).await;
        match auth.submitted(generation, result, Some(&session), &client).1 {
            Submitted::Finished(Ok(reply)) => assert_eq!(reply.access, Access::Granted),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!auth.in_flight());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn cancelled_results_never_surface() {
        let broker = Arc::new(ExampleBroker::new().unwrap());
        let client = BrokerClient::new(broker, logger());
        let session = session(&client).await;
        client.select_auth_mode(&session, "password").await.unwrap();
        let mut auth = Authentication::new(logger());
        auth.compose(UiLayout::new("form"));

        let cmd = auth.request(AuthenticationItem::Challenge("wrongpass".into()), &session, &client);
        auth.reset();
        assert!(auth.layout().is_none());

        let (generation, result) = run(cmd).await;
        assert!(matches!(auth.submitted(generation + 1, Ok(cancelled()), Some(&session), &client).1, Submitted::Stale));
        match auth.submitted(generation, result, Some(&session), &client).1 {
            Submitted::Finished(Ok(reply)) => assert_eq!(reply.access, Access::Cancelled),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn parked_work_waits_for_the_cancelled_call() {
        let broker = Arc::new(ExampleBroker::new().unwrap());
        let client = BrokerClient::new(broker, logger());
        let session = session(&client).await;
        client.select_auth_mode(&session, "password").await.unwrap();
        let mut auth = Authentication::new(logger());

        assert!(matches!(auth.after_in_flight(Msg::SessionEnded.into()), Cmd::Msg(Msg::SessionEnded)));

        let cmd = auth.request(AuthenticationItem::Challenge("goodpass".into()), &session, &client);
        auth.cancel();
        assert!(auth.after_in_flight(Msg::SessionEnded.into()).is_none());
        assert!(auth.after_in_flight(Cmd::Quit).is_none());

        let (generation, result) = run(cmd).await;
        let (released, submitted) = auth.submitted(generation, result, None, &client);
        match released {
            Cmd::Sequence(cmds) => {
                assert!(matches!(cmds[0], Cmd::Msg(Msg::SessionEnded)));
                assert!(matches!(cmds[1], Cmd::Quit));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(submitted, Submitted::Finished(Ok(AuthReply { access: Access::Cancelled, .. }))));
        assert!(!auth.after_in_flight(Cmd::Quit).is_none());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn new_password_must_differ_from_the_current_one() {
        let broker = Arc::new(ExampleBroker::new().unwrap());
        let client = BrokerClient::new(broker, logger());
        let session = match client.start_session("example", "user-needs-reset-carol", "C").await.unwrap() {
            SessionStart::Started(session) => Arc::new(session),
            SessionStart::Local => unreachable!(),
        };
        client.select_auth_mode(&session, "password").await.unwrap();
        let mut auth = Authentication::new(logger());
        let current = AuthenticationItem::Challenge("goodpass".into());

        let (generation, result) = run(auth.request(current.clone(), &session, &client)).await;
        match auth.submitted(generation, result, Some(&session), &client).1 {
            Submitted::Finished(Ok(reply)) => assert_eq!(reply.access, Access::Next),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(auth.check_quality(&current), Ok(()));

        auth.reset();
        auth.compose(UiLayout::new("newpassword"));
        assert_eq!(
            auth.check_quality(&current),
            Err("The new password must be different from the current one".to_string())
        );
        assert_eq!(auth.check_quality(&AuthenticationItem::Challenge("new-secret".into())), Ok(()));
        assert_eq!(auth.check_quality(&AuthenticationItem::Skip("true".into())), Ok(()));

        auth.end();
        auth.compose(UiLayout::new("newpassword"));
        assert_eq!(auth.check_quality(&current), Ok(()));
    }
}
