use futures::StreamExt;
use rig::completion::{CompletionModel, Message as RigMessage};
use rig::prelude::CompletionClient;
use rig::providers::openai;
use rig::streaming::StreamedAssistantContent;
use snafu::{OptionExt, ResultExt, ensure};
use tokio::sync::{mpsc, oneshot};

use super::provider::{
    BoxFuture, CompletionsFailedSnafu, EmptyMessageSetSnafu, GenerationEvent,
    GenerationEventMapped, GenerationReply, GenerationRequest, GenerationService,
    GenerationTarget, HttpClientSnafu, MissingApiKeySnafu, ProviderConfig, ProviderError,
    ProviderMessage, ProviderResult, ProviderStreamHandle, ProviderWorker, Role,
    make_event_stream,
};

pub const RIG_OPENAI_PROVIDER_ID: &str = "openai";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

const TOOL_CALL_STATUS: &str = "calling tool";
const GENERATING_STATUS: &str = "generating";

type OpenAiStream = rig::streaming::StreamingCompletionResponse<
    rig::providers::openai::responses_api::streaming::StreamingCompletionResponse,
>;

/// Conversation turns reshaped for rig: one preamble, prior turns, and the prompt.
struct PreparedTurn {
    preamble: Option<String>,
    history: Vec<RigMessage>,
    prompt: RigMessage,
}

impl PreparedTurn {
    fn from_request(request: &GenerationRequest) -> ProviderResult<Self> {
        let mut history = request
            .messages
            .iter()
            .filter_map(chat_turn)
            .collect::<Vec<_>>();
        let prompt = history.pop().context(EmptyMessageSetSnafu {
            stage: "prepare-turn-prompt",
            target: request.target.clone(),
        })?;

        Ok(Self {
            preamble: folded_preamble(request),
            history,
            prompt,
        })
    }
}

fn chat_turn(message: &ProviderMessage) -> Option<RigMessage> {
    match message.role {
        Role::System => None,
        Role::User => Some(RigMessage::user(message.content.clone())),
        Role::Assistant => Some(RigMessage::assistant(message.content.clone())),
    }
}

/// Rig takes a single preamble; system turns are appended to the request preamble.
fn folded_preamble(request: &GenerationRequest) -> Option<String> {
    let sections = request
        .preamble
        .iter()
        .map(String::as_str)
        .chain(
            request
                .messages
                .iter()
                .filter(|message| message.role == Role::System)
                .map(|message| message.content.as_str()),
        )
        .filter(|section| !section.trim().is_empty())
        .collect::<Vec<_>>();

    (!sections.is_empty()).then(|| sections.join("\n\n"))
}

fn translate_chunk<R>(chunk: StreamedAssistantContent<R>) -> Option<GenerationEvent>
where
    R: Clone + Unpin,
{
    match chunk {
        StreamedAssistantContent::Text(text) => Some(GenerationEvent::Partial(text.text)),
        StreamedAssistantContent::Reasoning(reasoning) => {
            let fragment = reasoning.reasoning.concat();
            (!fragment.is_empty()).then_some(GenerationEvent::Reasoning(fragment))
        }
        StreamedAssistantContent::ReasoningDelta { reasoning, .. } => {
            (!reasoning.is_empty()).then_some(GenerationEvent::Reasoning(reasoning))
        }
        StreamedAssistantContent::ToolCall { .. }
        | StreamedAssistantContent::ToolCallDelta { .. } => {
            Some(GenerationEvent::Status(TOOL_CALL_STATUS.to_string()))
        }
        StreamedAssistantContent::Final(_) => None,
    }
}

/// Tags events with their generation and reports whether anyone is still listening.
struct EventSink {
    target: GenerationTarget,
    events: mpsc::UnboundedSender<GenerationEventMapped>,
}

impl EventSink {
    fn emit(&self, payload: GenerationEvent) -> bool {
        self.events
            .send(GenerationEventMapped {
                target: self.target.clone(),
                payload,
            })
            .is_ok()
    }

    fn fail(&self, error: &ProviderError) {
        let _ = self.emit(GenerationEvent::Error(error.to_string()));
    }
}

enum StreamEnd {
    Exhausted,
    Cancelled,
    Failed,
    Detached,
}

/// Streams completions from an OpenAI-compatible endpoint through rig.
pub struct RigGenerationService {
    config: ProviderConfig,
}

impl RigGenerationService {
    pub fn new(config: ProviderConfig) -> ProviderResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "rig-generation-service-new",
                provider_id: config.provider_id.clone(),
            }
        );

        Ok(Self { config })
    }

    fn resolve_model(config: &ProviderConfig, request: &GenerationRequest) -> String {
        request
            .model_id
            .as_deref()
            .or(config.default_model.as_deref())
            .unwrap_or(DEFAULT_OPENAI_MODEL)
            .to_string()
    }

    fn client(config: &ProviderConfig) -> ProviderResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(config.api_key.as_str());
        if !config.endpoint.is_empty() {
            builder = builder.base_url(config.endpoint.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "rig-client-build",
        })
    }

    async fn start(config: &ProviderConfig, request: &GenerationRequest) -> ProviderResult<OpenAiStream> {
        let turn = PreparedTurn::from_request(request)?;
        let model = Self::client(config)?.completion_model(Self::resolve_model(config, request));

        let mut builder = model.completion_request(turn.prompt).messages(turn.history);
        if let Some(preamble) = turn.preamble {
            builder = builder.preamble(preamble);
        }
        if let Some(temperature) = request.temperature {
            builder = builder.temperature(temperature);
        }
        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(max_tokens);
        }

        builder.stream().await.context(CompletionsFailedSnafu {
            stage: "rig-stream-start",
        })
    }

    async fn pump(
        stream: &mut OpenAiStream,
        sink: &EventSink,
        cancel_rx: &mut oneshot::Receiver<()>,
    ) -> StreamEnd {
        loop {
            tokio::select! {
                _ = &mut *cancel_rx => {
                    stream.cancel();
                    return StreamEnd::Cancelled;
                }
                chunk = stream.next() => match chunk {
                    Some(Ok(chunk)) => {
                        if let Some(event) = translate_chunk(chunk)
                            && !sink.emit(event)
                        {
                            return StreamEnd::Detached;
                        }
                    }
                    Some(Err(source)) => {
                        tracing::warn!(
                            conversation = %sink.target.conversation,
                            error = %source,
                            "rig stream yielded an error chunk"
                        );
                        sink.fail(&ProviderError::CompletionsFailed {
                            stage: "rig-stream-chunk",
                            source,
                        });
                        return StreamEnd::Failed;
                    }
                    None => return StreamEnd::Exhausted,
                }
            }
        }
    }

    async fn drive(
        config: ProviderConfig,
        request: GenerationRequest,
        sink: EventSink,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let mut stream = match Self::start(&config, &request).await {
            Ok(stream) => stream,
            Err(error) => {
                tracing::error!(
                    conversation = %sink.target.conversation,
                    provider_id = %config.provider_id,
                    error = %error,
                    "rig stream could not be opened"
                );
                sink.fail(&error);
                return;
            }
        };

        if !sink.emit(GenerationEvent::Status(GENERATING_STATUS.to_string())) {
            return;
        }

        match Self::pump(&mut stream, &sink, &mut cancel_rx).await {
            StreamEnd::Exhausted => {
                let _ = sink.emit(GenerationEvent::Done);
            }
            StreamEnd::Cancelled => {
                tracing::debug!(conversation = %sink.target.conversation, "rig stream cancelled");
            }
            StreamEnd::Failed | StreamEnd::Detached => {}
        }
    }
}

impl GenerationService for RigGenerationService {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn generate<'a>(
        &'a self,
        request: GenerationRequest,
    ) -> BoxFuture<'a, ProviderResult<GenerationReply>> {
        Box::pin(async move {
            ensure!(
                !request.messages.is_empty(),
                EmptyMessageSetSnafu {
                    stage: "rig-generate",
                    target: request.target.clone(),
                }
            );

            let (events, stream, cancel_rx) = make_event_stream(request.target.clone());
            let sink = EventSink {
                target: request.target.clone(),
                events,
            };
            let worker: ProviderWorker =
                Box::pin(Self::drive(self.config.clone(), request, sink, cancel_rx));

            Ok(GenerationReply::Stream(ProviderStreamHandle { stream, worker }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::GenerationToken;

    fn request(messages: Vec<ProviderMessage>) -> GenerationRequest {
        GenerationRequest::new(
            GenerationTarget::new("thread-1", GenerationToken::new(7)),
            messages,
        )
    }

    #[test]
    fn new_requires_an_api_key() {
        let config = ProviderConfig::new("openai", "  ", "", None);
        assert!(matches!(
            RigGenerationService::new(config),
            Err(ProviderError::MissingApiKey { .. })
        ));
    }

    #[test]
    fn system_turns_fold_into_the_preamble() {
        let request = request(vec![
            ProviderMessage::new(Role::System, "You are Zen."),
            ProviderMessage::new(Role::User, "hello"),
        ])
        .with_preamble("Answer briefly.");

        assert_eq!(
            folded_preamble(&request).as_deref(),
            Some("Answer briefly.\n\nYou are Zen.")
        );
    }

    #[test]
    fn system_only_requests_have_no_prompt() {
        let request = request(vec![ProviderMessage::new(Role::System, "You are Zen.")]);
        assert!(matches!(
            PreparedTurn::from_request(&request),
            Err(ProviderError::EmptyMessageSet { .. })
        ));
    }

    #[test]
    fn request_model_overrides_configured_default() {
        let config = ProviderConfig::new("openai", "key", "", Some("gpt-4.1".to_string()));
        let plain = request(vec![ProviderMessage::new(Role::User, "hi")]);
        let pinned = plain.clone().with_model("o3");
        let fallback = ProviderConfig::new("openai", "key", "", None);

        assert_eq!(RigGenerationService::resolve_model(&config, &plain), "gpt-4.1");
        assert_eq!(RigGenerationService::resolve_model(&config, &pinned), "o3");
        assert_eq!(
            RigGenerationService::resolve_model(&fallback, &plain),
            DEFAULT_OPENAI_MODEL
        );
    }
}
