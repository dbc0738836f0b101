use std::collections::VecDeque;

use tokio::sync::{Mutex, mpsc, oneshot};

use super::packet::ResponsePacket;
use super::provider::{
    BoxFuture, GenerationEvent, GenerationEventMapped, GenerationReply, GenerationRequest,
    GenerationService, GenerationTarget, ProviderResult, ProviderStreamHandle, ProviderWorker,
    RejectedSnafu, make_event_stream,
};

pub const SCRIPTED_PROVIDER_ID: &str = "scripted";

/// One queued answer of a [`ScriptedGenerator`].
pub enum ScriptedReply {
    /// Streams the events in order.
    Stream(Vec<GenerationEvent>),
    /// Streams whatever the paired sender delivers, once it delivers.
    Deferred(oneshot::Receiver<Vec<GenerationEvent>>),
    /// Answers without streaming.
    Complete(Vec<ResponsePacket>),
    /// Refuses the request before any event is produced.
    Reject(String),
}

/// Offline generation service that replays queued replies and echoes when the queue is
/// empty.
#[derive(Default)]
pub struct ScriptedGenerator {
    replies: Mutex<VecDeque<ScriptedReply>>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, reply: ScriptedReply) {
        self.replies.lock().await.push_back(reply);
    }

    /// Queues a deferred stream and returns the sender that releases it.
    pub async fn defer(&self) -> oneshot::Sender<Vec<GenerationEvent>> {
        let (events_tx, events_rx) = oneshot::channel();
        self.push(ScriptedReply::Deferred(events_rx)).await;
        events_tx
    }

    /// Requests received so far, oldest first.
    pub async fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().await.clone()
    }

    fn echo_events(request: &GenerationRequest) -> Vec<GenerationEvent> {
        let prompt = request.last_user_text().unwrap_or_default().trim().to_string();
        vec![
            GenerationEvent::Status("generating".to_string()),
            GenerationEvent::Partial("You said: ".to_string()),
            GenerationEvent::Partial(prompt),
            GenerationEvent::Done,
        ]
    }

    fn stream_handle(target: GenerationTarget, source: EventSource) -> ProviderStreamHandle {
        let (event_tx, stream, cancel_rx) = make_event_stream(target.clone());
        let worker: ProviderWorker = Box::pin(Self::run_stream_worker(
            target, source, event_tx, cancel_rx,
        ));
        ProviderStreamHandle { stream, worker }
    }

    async fn run_stream_worker(
        target: GenerationTarget,
        source: EventSource,
        event_tx: mpsc::UnboundedSender<GenerationEventMapped>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let events = match source {
            EventSource::Ready(events) => events,
            EventSource::Deferred(events_rx) => {
                tokio::select! {
                    _ = &mut cancel_rx => {
                        tracing::debug!(generation = ?target, "scripted stream cancelled before release");
                        return;
                    }
                    released = events_rx => match released {
                        Ok(events) => events,
                        Err(_) => {
                            tracing::debug!(generation = ?target, "scripted stream sender dropped");
                            return;
                        }
                    },
                }
            }
        };

        for payload in events {
            if cancel_rx.try_recv().is_ok() {
                tracing::debug!(generation = ?target, "scripted stream cancelled");
                return;
            }
            let mapped = GenerationEventMapped {
                target: target.clone(),
                payload,
            };
            if event_tx.send(mapped).is_err() {
                return;
            }
            tokio::task::yield_now().await;
        }
    }
}

enum EventSource {
    Ready(Vec<GenerationEvent>),
    Deferred(oneshot::Receiver<Vec<GenerationEvent>>),
}

impl GenerationService for ScriptedGenerator {
    fn id(&self) -> &str {
        SCRIPTED_PROVIDER_ID
    }

    fn generate<'a>(
        &'a self,
        request: GenerationRequest,
    ) -> BoxFuture<'a, ProviderResult<GenerationReply>> {
        Box::pin(async move {
            self.requests.lock().await.push(request.clone());
            let next = self.replies.lock().await.pop_front();
            let target = request.target.clone();

            match next {
                Some(ScriptedReply::Stream(events)) => Ok(GenerationReply::Stream(
                    Self::stream_handle(target, EventSource::Ready(events)),
                )),
                Some(ScriptedReply::Deferred(events_rx)) => Ok(GenerationReply::Stream(
                    Self::stream_handle(target, EventSource::Deferred(events_rx)),
                )),
                Some(ScriptedReply::Complete(packets)) => Ok(GenerationReply::Complete(packets)),
                Some(ScriptedReply::Reject(details)) => RejectedSnafu {
                    stage: "scripted-generate",
                    details,
                }
                .fail(),
                None => Ok(GenerationReply::Stream(Self::stream_handle(
                    target,
                    EventSource::Ready(Self::echo_events(&request)),
                ))),
            }
        })
    }
}
