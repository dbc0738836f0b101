use std::future::Future;
use std::pin::Pin;

use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};

use super::packet::ResponsePacket;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub api_key: String,
    pub endpoint: String,
    pub default_model: Option<String>,
}

impl ProviderConfig {
    pub fn new(
        provider_id: impl Into<String>,
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
        default_model: Option<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into().trim().to_string(),
            api_key: api_key.into().trim().to_string(),
            endpoint: endpoint.into().trim().to_string(),
            default_model,
        }
    }
}

/// Monotonic token identifying one generation run.
///
/// Every send mints a new token so late events from a superseded run can be rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GenerationToken(pub u64);

impl GenerationToken {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Routing key attached to every event of one generation run.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GenerationTarget {
    pub conversation: String,
    pub token: GenerationToken,
}

impl GenerationTarget {
    pub fn new(conversation: impl Into<String>, token: GenerationToken) -> Self {
        Self {
            conversation: conversation.into(),
            token,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderMessage {
    pub role: Role,
    pub content: String,
}

impl ProviderMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub target: GenerationTarget,
    pub model_id: Option<String>,
    pub messages: Vec<ProviderMessage>,
    pub preamble: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
}

impl GenerationRequest {
    pub fn new(target: GenerationTarget, messages: Vec<ProviderMessage>) -> Self {
        Self {
            target,
            model_id: None,
            messages,
            preamble: None,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    pub fn with_preamble(mut self, preamble: impl Into<String>) -> Self {
        self.preamble = Some(preamble.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn last_user_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == Role::User)
            .map(|message| message.content.as_str())
    }
}

/// Provider-agnostic generation event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationEvent {
    /// Answer text delta, appended to the running answer.
    Partial(String),
    /// Status-only update; replaces the previous status line.
    Status(String),
    /// Intermediate reasoning fragment, kept for generation metrics.
    Reasoning(String),
    /// Finalized response packets.
    Final(Vec<ResponsePacket>),
    /// Stream completed without explicit packets; the accumulated answer is final.
    Done,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationEventMapped {
    pub target: GenerationTarget,
    pub payload: GenerationEvent,
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type ProviderWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProviderError {
    #[snafu(display("missing API key for provider '{provider_id}'"))]
    MissingApiKey {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("provider '{provider_id}' is not supported"))]
    UnsupportedProvider {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("generation request for {target:?} has no messages"))]
    EmptyMessageSet {
        stage: &'static str,
        target: GenerationTarget,
    },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
    #[snafu(display("generation rejected on `{stage}`: {details}"))]
    Rejected {
        stage: &'static str,
        details: String,
    },
}

pub struct ProviderEventStream {
    target: GenerationTarget,
    events: mpsc::UnboundedReceiver<GenerationEventMapped>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

pub struct ProviderStreamHandle {
    pub stream: ProviderEventStream,
    pub worker: ProviderWorker,
}

/// A generation either streams events or answers in one piece.
pub enum GenerationReply {
    Stream(ProviderStreamHandle),
    Complete(Vec<ResponsePacket>),
}

impl ProviderEventStream {
    pub(crate) fn new(
        target: GenerationTarget,
        events: mpsc::UnboundedReceiver<GenerationEventMapped>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            target,
            events,
            cancel_tx: Some(cancel_tx),
        }
    }

    pub fn target(&self) -> &GenerationTarget {
        &self.target
    }

    pub async fn recv(&mut self) -> Option<GenerationEventMapped> {
        self.events.recv().await
    }

    pub fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }
}

impl Drop for ProviderEventStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

pub trait GenerationService: Send + Sync {
    fn id(&self) -> &str;
    fn generate<'a>(
        &'a self,
        request: GenerationRequest,
    ) -> BoxFuture<'a, ProviderResult<GenerationReply>>;
}

pub(crate) fn make_event_stream(
    target: GenerationTarget,
) -> (
    mpsc::UnboundedSender<GenerationEventMapped>,
    ProviderEventStream,
    oneshot::Receiver<()>,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        event_tx,
        ProviderEventStream::new(target, event_rx, cancel_tx),
        cancel_rx,
    )
}
