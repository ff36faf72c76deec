//! The PAM conversation: the only way a module can talk to the user, or to a graphical login
//! manager acting on behalf of the user.
//!
//! [`Conversation`] abstracts over the `pam_conv` callback so the flow can be driven by a real PAM
//! stack ([`PamConversation`]) as well as by in-memory peers. Every conversation call blocks until
//! the application answers, so the async side never calls into a [`Conversation`] directly but
//! goes through a [`ConversationChannel`], which runs the calls one at a time on a blocking worker.

#[allow(unsafe_code)]
mod pam;
pub use pam::{PamConversation, RawPamConv};

use crate::{BoxError, relay::BinaryMessage};
use derive_more::Display;
use std::{
    fmt::Debug,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// The ways a text prompt can be presented.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display)]
pub enum PromptStyle {
    /// Ask for a secret, without echoing the input
    #[display("echo off")]
    EchoOff,
    /// Ask for a value, echoing the input
    #[display("echo on")]
    EchoOn,
    /// Show an error message
    #[display("error message")]
    ErrorMsg,
    /// Show an informational message
    #[display("text info")]
    TextInfo,
}

/// A channel to the user.
pub trait Conversation: Send + Sync + Debug {
    /// Shows `text` and, for the echo styles, returns what the user typed. Message styles return an empty string.
    fn prompt(&self, style: PromptStyle, text: &str) -> Result<String, ConversationError>;

    /// Exchanges a binary message with the application. The reply is owned by the caller.
    fn binary_prompt(&self, message: &BinaryMessage) -> Result<BinaryMessage, ConversationError>;
}

/// The error returned by [`Conversation`] calls.
#[derive(Debug, Error)]
#[error("conversation error: {kind}")]
pub struct ConversationError {
    kind: ConversationErrorKind,
    #[source]
    source: Option<BoxError>,
}

impl ConversationError {
    /// Creates a new conversation error
    pub fn new<E>(kind: ConversationErrorKind, error: E) -> ConversationError
    where
        E: Into<BoxError>,
    {
        ConversationError {
            kind,
            source: Some(error.into()),
        }
    }

    /// The category of the failure
    pub fn kind(&self) -> ConversationErrorKind {
        self.kind
    }
}

impl From<ConversationErrorKind> for ConversationError {
    fn from(kind: ConversationErrorKind) -> ConversationError {
        ConversationError { kind, source: None }
    }
}

/// Categories of [`ConversationError`]s.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display)]
pub enum ConversationErrorKind {
    /// The application returned a non-success PAM code
    #[display("conversation failed with PAM code {_0}")]
    Failed(i32),
    /// The user or the application aborted the conversation
    #[display("conversation aborted")]
    Aborted,
    /// The application answered without a response
    #[display("no response")]
    NoResponse,
    /// Text could not be passed across the C boundary
    #[display("invalid text")]
    InvalidText,
    /// The application does not support binary prompts
    #[display("binary prompts are not supported")]
    Unsupported,
    /// The conversation worker has stopped
    #[display("conversation closed")]
    Closed,
}

type Job = Box<dyn FnOnce(&dyn Conversation) + Send>;

/// Serializes conversation calls onto a single blocking worker.
///
/// The conversation is half-duplex: a call must return before the next one is made. Jobs are run
/// strictly in submission order. The worker stops once every clone of the channel is dropped.
/// After [`ConversationChannel::close`] no job reaches the conversation anymore.
#[derive(Clone, Debug)]
pub(crate) struct ConversationChannel {
    jobs: mpsc::UnboundedSender<Job>,
    closed: Arc<AtomicBool>,
}

impl ConversationChannel {
    /// Starts the worker. Must be called from within a tokio runtime.
    pub(crate) fn spawn(conversation: Arc<dyn Conversation>) -> Self {
        let (jobs, mut rx) = mpsc::unbounded_channel::<Job>();
        let closed = Arc::new(AtomicBool::new(false));
        let worker_closed = closed.clone();
        tokio::task::spawn_blocking(move || {
            while let Some(job) = rx.blocking_recv() {
                // Dropping the job fails its caller with `Closed`.
                if !worker_closed.load(Ordering::Acquire) {
                    job(conversation.as_ref());
                }
            }
        });
        ConversationChannel { jobs, closed }
    }

    /// Stops passing jobs to the conversation. The conversation may be gone once PAM got its answer.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Runs `call` on the worker and waits for its result.
    pub(crate) async fn run<R, E, F>(&self, call: F) -> Result<R, E>
    where
        F: FnOnce(&dyn Conversation) -> Result<R, E> + Send + 'static,
        R: Send + 'static,
        E: From<ConversationError> + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job = Box::new(move |conversation| {
            let _ = reply_tx.send(call(conversation));
        });
        self.jobs
            .send(job)
            .map_err(|_| E::from(ConversationError::from(ConversationErrorKind::Closed)))?;
        reply_rx.await.map_err(|_| E::from(ConversationError::from(ConversationErrorKind::Closed)))?
    }

    /// Shows a message or asks a question.
    pub(crate) async fn prompt(&self, style: PromptStyle, text: impl Into<String>) -> Result<String, ConversationError> {
        let text = text.into();
        self.run(move |conversation| conversation.prompt(style, &text)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl Conversation for Recorder {
        fn prompt(&self, style: PromptStyle, text: &str) -> Result<String, ConversationError> {
            self.seen.lock().unwrap().push(format!("{style}: {text}"));
            match style {
                PromptStyle::EchoOn | PromptStyle::EchoOff => Ok(text.to_uppercase()),
                _ => Ok(String::new()),
            }
        }

        fn binary_prompt(&self, _message: &BinaryMessage) -> Result<BinaryMessage, ConversationError> {
            Err(ConversationErrorKind::Unsupported.into())
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn calls_run_in_submission_order() {
        let recorder = Arc::new(Recorder::default());
        let channel = ConversationChannel::spawn(recorder.clone());

        let first = channel.prompt(PromptStyle::EchoOn, "first");
        let second = channel.prompt(PromptStyle::TextInfo, "second");
        let (first, second) = tokio::join!(first, second);

        assert_eq!(first.unwrap(), "FIRST");
        assert_eq!(second.unwrap(), "");
        assert_eq!(
            *recorder.seen.lock().unwrap(),
            vec!["echo on: first".to_string(), "text info: second".to_string()]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn closed_channel_rejects_calls() {
        let recorder = Arc::new(Recorder::default());
        let channel = ConversationChannel::spawn(recorder.clone());
        channel.close();
        let err = channel.prompt(PromptStyle::TextInfo, "late").await.unwrap_err();
        assert_eq!(err.kind(), ConversationErrorKind::Closed);
        assert!(recorder.seen.lock().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn errors_come_back_to_the_caller() {
        let channel = ConversationChannel::spawn(Arc::new(Recorder::default()));
        let codec = crate::relay::RelayCodec::new(crate::relay::JSON_PROTOCOL, 1);
        let err = channel
            .run(move |conversation| {
                let message = codec.encode(None).map_err(|e| ConversationError::new(ConversationErrorKind::InvalidText, e))?;
                conversation.binary_prompt(&message)
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ConversationErrorKind::Unsupported);
    }
}
