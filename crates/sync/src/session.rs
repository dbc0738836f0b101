use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use snafu::{ResultExt, ensure};
use threadline_llm::{
    GenerationEvent, GenerationReply, GenerationRequest, GenerationService, GenerationTarget,
    GenerationToken, ProviderStreamHandle, ResponsePacket,
};
use threadline_storage::{
    ConversationGateway, ConversationPatch, ConversationRecord, MessageId, NewConversation,
    StorageError, ThreadId,
};
use tokio::sync::{Mutex, watch};
use tokio::task::AbortHandle;

use super::bootstrap::{
    BootstrapReport, BootstrapSource, emergency_thread, load_records, prepare,
};
use super::canonical::{
    find_canonical, next_canonical_thread_id, resolve_canonical, transient_canonical,
};
use super::codec::{DecodeStats, decode_thread, encode_message};
use super::config::SyncSettings;
use super::error::{
    CreateThreadSnafu, SendRejectedSnafu, StorageSnafu, SyncResult, UnknownThreadSnafu,
    ValidationSnafu,
};
use super::local::{RuntimeSelectionStore, SnapshotStore};
use super::model::{Delivery, GenerationMetrics, Thread};
use super::now_unix_ms;
use super::pipeline::{
    self, Draft, FinalizeOutcome, OptimisticSend, PipelineState, SUPERSEDED_NOTICE,
    StreamAccumulator, apply_progress, rollback_optimistic, show_optimistic, validate_draft,
};
use super::reconcile::{CanonicalSeed, merge, sort_threads};
use super::runtime::{IdentityKey, RuntimeDescriptor, resolve_identity_key};

const STREAM_ENDED_EARLY: &str = "generation stream ended before a terminal event";

/// How the assistant side of a send ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// The reply was shown and written to the archive.
    Completed,
    /// The placeholder was replaced by a synthetic error notice.
    GenerationFailed(String),
    /// The reply is visible but its append failed; it is not retried.
    FinalizeNotPersisted(String),
    /// A newer send on the same thread, or a deletion, took over.
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub thread_id: ThreadId,
    pub user_message_id: MessageId,
    pub assistant_message_id: MessageId,
    pub outcome: SendOutcome,
}

struct ActiveGeneration {
    token: GenerationToken,
    placeholder_id: MessageId,
    stage: PipelineState,
    abort: Option<AbortHandle>,
}

struct SessionState {
    runtime: RuntimeDescriptor,
    identity_key: IdentityKey,
    threads: Vec<Thread>,
    tombstones: HashSet<ThreadId>,
    reload_token: u64,
    next_generation: u64,
    active: HashMap<ThreadId, ActiveGeneration>,
}

impl SessionState {
    fn thread(&self, thread_id: &ThreadId) -> Option<&Thread> {
        self.threads.iter().find(|thread| &thread.id == thread_id)
    }

    fn thread_mut(&mut self, thread_id: &ThreadId) -> Option<&mut Thread> {
        self.threads.iter_mut().find(|thread| &thread.id == thread_id)
    }

    fn is_current(&self, thread_id: &ThreadId, token: GenerationToken) -> bool {
        self.active
            .get(thread_id)
            .is_some_and(|active| active.token == token)
    }

    /// Moves the current send on `thread_id` to `next`. Stale tokens and out-of-order steps
    /// are refused.
    fn advance(&mut self, thread_id: &ThreadId, token: GenerationToken, next: PipelineState) -> bool {
        let Some(active) = self
            .active
            .get_mut(thread_id)
            .filter(|active| active.token == token)
        else {
            return false;
        };
        if !active.stage.can_advance_to(next) {
            tracing::warn!(
                thread_id = %thread_id,
                from = ?active.stage,
                to = ?next,
                "refusing out-of-order pipeline step"
            );
            return false;
        }
        tracing::trace!(thread_id = %thread_id, from = ?active.stage, to = ?next, "pipeline step");
        active.stage = next;
        true
    }

    fn ensure_local_canonical(&mut self, now_ms: u64) {
        if find_canonical(&self.threads, &self.identity_key).is_none() {
            let thread = emergency_thread(&self.identity_key, &self.tombstones, now_ms);
            tracing::warn!(
                thread_id = %thread.id,
                identity_key = %self.identity_key,
                "using a local emergency thread"
            );
            self.threads.push(thread);
        }
    }
}

struct EngineInner {
    owner_key: String,
    gateway: Arc<dyn ConversationGateway>,
    generator: Arc<dyn GenerationService>,
    settings: Arc<SyncSettings>,
    snapshots: Option<SnapshotStore>,
    selection: Option<RuntimeSelectionStore>,
    state: Mutex<SessionState>,
    published: watch::Sender<Vec<Thread>>,
}

pub struct SessionEngineBuilder {
    owner_key: String,
    gateway: Arc<dyn ConversationGateway>,
    generator: Arc<dyn GenerationService>,
    settings: Arc<SyncSettings>,
    snapshots: Option<SnapshotStore>,
    selection: Option<RuntimeSelectionStore>,
}

impl SessionEngineBuilder {
    pub fn settings(mut self, settings: Arc<SyncSettings>) -> Self {
        self.settings = settings;
        self
    }

    pub fn snapshots(mut self, store: SnapshotStore) -> Self {
        self.snapshots = Some(store);
        self
    }

    pub fn runtime_selection(mut self, store: RuntimeSelectionStore) -> Self {
        self.selection = Some(store);
        self
    }

    pub fn build(self) -> SessionEngine {
        let runtime = self.settings.default_runtime.clone();
        let identity_key = resolve_identity_key(&runtime);
        let (published, _) = watch::channel(Vec::new());

        SessionEngine {
            inner: Arc::new(EngineInner {
                owner_key: self.owner_key,
                gateway: self.gateway,
                generator: self.generator,
                settings: self.settings,
                snapshots: self.snapshots,
                selection: self.selection,
                state: Mutex::new(SessionState {
                    runtime,
                    identity_key,
                    threads: Vec::new(),
                    tombstones: HashSet::new(),
                    reload_token: 0,
                    next_generation: 0,
                    active: HashMap::new(),
                }),
                published,
            }),
        }
    }
}

/// Store object owning one user's thread set.
///
/// Every mutation goes through the methods below and is published to subscribers. The
/// state lock is never held across an archive or generation call.
#[derive(Clone)]
pub struct SessionEngine {
    inner: Arc<EngineInner>,
}

impl SessionEngine {
    pub fn builder(
        owner_key: impl Into<String>,
        gateway: Arc<dyn ConversationGateway>,
        generator: Arc<dyn GenerationService>,
    ) -> SessionEngineBuilder {
        SessionEngineBuilder {
            owner_key: owner_key.into(),
            gateway,
            generator,
            settings: Arc::new(SyncSettings::default()),
            snapshots: None,
            selection: None,
        }
    }

    pub fn owner_key(&self) -> &str {
        &self.inner.owner_key
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Thread>> {
        self.inner.published.subscribe()
    }

    pub async fn identity_key(&self) -> IdentityKey {
        self.inner.state.lock().await.identity_key.clone()
    }

    pub async fn active_runtime(&self) -> RuntimeDescriptor {
        self.inner.state.lock().await.runtime.clone()
    }

    /// Non-archived threads of the active identity, canonical first.
    pub async fn visible_threads(&self) -> Vec<Thread> {
        let state = self.inner.state.lock().await;
        state
            .threads
            .iter()
            .filter(|thread| thread.belongs_to(&state.identity_key) && !thread.archived)
            .cloned()
            .collect()
    }

    pub async fn archived_threads(&self) -> Vec<Thread> {
        let state = self.inner.state.lock().await;
        state
            .threads
            .iter()
            .filter(|thread| thread.belongs_to(&state.identity_key) && thread.archived)
            .cloned()
            .collect()
    }

    /// Every thread held in memory, whatever its identity.
    pub async fn threads(&self) -> Vec<Thread> {
        self.inner.state.lock().await.threads.clone()
    }

    pub async fn thread(&self, thread_id: &ThreadId) -> Option<Thread> {
        self.inner.state.lock().await.thread(thread_id).cloned()
    }

    /// Where the in-flight send on `thread_id` currently is, if one is running.
    pub async fn pipeline_state(&self, thread_id: &ThreadId) -> Option<PipelineState> {
        let state = self.inner.state.lock().await;
        state.active.get(thread_id).map(|active| active.stage)
    }

    pub async fn canonical_thread(&self) -> Option<Thread> {
        let state = self.inner.state.lock().await;
        find_canonical(&state.threads, &state.identity_key).cloned()
    }

    /// Restores the persisted runtime selection (or the configured default) and loads.
    pub async fn bootstrap(&self) -> BootstrapReport {
        let default_runtime = self.inner.settings.default_runtime.clone();
        let runtime = match &self.inner.selection {
            Some(store) => match store.load() {
                Ok(Some(runtime)) => runtime,
                Ok(None) => default_runtime,
                Err(error) => {
                    tracing::warn!(error = %error, "failed to read runtime selection, using default");
                    default_runtime
                }
            },
            None => default_runtime,
        };

        {
            let mut state = self.inner.state.lock().await;
            state.identity_key = resolve_identity_key(&runtime);
            state.runtime = runtime;
        }
        self.reload().await
    }

    /// Switches the active runtime, remembers it locally and reloads its threads.
    pub async fn select_runtime(&self, runtime: RuntimeDescriptor) -> BootstrapReport {
        if let Some(store) = &self.inner.selection
            && let Err(error) = store.save(&runtime)
        {
            tracing::warn!(error = %error, "failed to remember runtime selection");
        }

        {
            let mut state = self.inner.state.lock().await;
            let identity_key = resolve_identity_key(&runtime);
            tracing::info!(
                runtime_id = %runtime.id,
                identity_key = %identity_key,
                "switching runtime"
            );
            state.identity_key = identity_key;
            state.runtime = runtime;
            self.commit(&mut state, true);
        }
        self.reload().await
    }

    /// Loads the archive and merges it for the active identity.
    ///
    /// Each call takes a new reload token; a result that arrives after a newer reload
    /// started is discarded. Load failures degrade to memory, the snapshot, or an
    /// emergency thread and are reported rather than returned as errors.
    pub async fn reload(&self) -> BootstrapReport {
        let (token, identity_key) = {
            let mut state = self.inner.state.lock().await;
            state.reload_token += 1;
            (state.reload_token, state.identity_key.clone())
        };

        let (loaded, attempts) = load_records(
            self.inner.gateway.as_ref(),
            &self.inner.owner_key,
            &self.inner.settings,
        )
        .await;

        let mut report = match loaded {
            Ok(records) => self.apply_remote(token, &identity_key, records).await,
            Err(error) => self.apply_load_failure(token, &identity_key, error).await,
        };
        report.attempts = attempts;
        report
    }

    async fn apply_remote(
        &self,
        token: u64,
        identity_key: &IdentityKey,
        records: Vec<ConversationRecord>,
    ) -> BootstrapReport {
        let mut view = prepare(records, identity_key);
        let mut report = BootstrapReport::new(BootstrapSource::Remote, identity_key.clone());
        report.loaded_threads = view.threads.len();
        report.skipped_tombstones = view.tombstones.len();
        report.repaired_messages = view.repaired_messages;

        if !identity_key.is_default() && find_canonical(&view.threads, identity_key).is_none() {
            let (known_canonical, tombstones) = {
                let state = self.inner.state.lock().await;
                if state.reload_token != token {
                    return self.stale(identity_key);
                }
                let mut tombstones = state.tombstones.clone();
                tombstones.extend(view.tombstones.iter().cloned());
                (
                    find_canonical(&state.threads, identity_key).is_some(),
                    tombstones,
                )
            };

            if !known_canonical {
                let canonical = resolve_canonical(
                    self.inner.gateway.as_ref(),
                    &self.inner.owner_key,
                    identity_key,
                    &[],
                    &tombstones,
                )
                .await
                .unwrap_or_else(|| transient_canonical(identity_key, &tombstones, now_unix_ms()));
                view.threads.push(canonical);
            }
        }

        let mut state = self.inner.state.lock().await;
        if state.reload_token != token {
            return self.stale(identity_key);
        }

        state.tombstones.extend(view.tombstones);
        let seed = CanonicalSeed {
            thread_id: next_canonical_thread_id(identity_key, &state.tombstones),
            now_ms: now_unix_ms(),
        };
        let current = std::mem::take(&mut state.threads)
            .into_iter()
            .filter(|thread| !state.tombstones.contains(&thread.id))
            .collect::<Vec<_>>();
        state.threads = merge(&current, view.threads, identity_key, seed);
        self.commit(&mut state, true);

        tracing::info!(
            identity_key = %identity_key,
            loaded = report.loaded_threads,
            tombstones = report.skipped_tombstones,
            "reloaded conversations"
        );
        report
    }

    async fn apply_load_failure(
        &self,
        token: u64,
        identity_key: &IdentityKey,
        error: StorageError,
    ) -> BootstrapReport {
        tracing::warn!(
            owner_key = %self.inner.owner_key,
            identity_key = %identity_key,
            error = %error,
            "failed to load conversations"
        );
        let snapshot_threads = self.snapshot_threads(identity_key);

        let mut state = self.inner.state.lock().await;
        if state.reload_token != token {
            return self.stale(identity_key);
        }

        let mut report = BootstrapReport::new(BootstrapSource::Retained, identity_key.clone());
        report.error = Some(error.to_string());
        let now_ms = now_unix_ms();

        let has_threads = state
            .threads
            .iter()
            .any(|thread| thread.belongs_to(identity_key));
        if !has_threads && snapshot_threads.is_empty() {
            report.source = BootstrapSource::Emergency;
        } else if !has_threads {
            report.source = BootstrapSource::Snapshot;
            report.loaded_threads = snapshot_threads.len();
            let seed = CanonicalSeed {
                thread_id: next_canonical_thread_id(identity_key, &state.tombstones),
                now_ms,
            };
            let merged = merge(&state.threads, snapshot_threads, identity_key, seed);
            state.threads = merged;
        }

        state.ensure_local_canonical(now_ms);
        self.commit(&mut state, true);
        report
    }

    fn snapshot_threads(&self, identity_key: &IdentityKey) -> Vec<Thread> {
        let Some(store) = &self.inner.snapshots else {
            return Vec::new();
        };
        match store.load(&self.inner.owner_key) {
            Ok(Some(snapshot)) => snapshot
                .threads
                .into_iter()
                .filter(|thread| thread.belongs_to(identity_key))
                .collect(),
            Ok(None) => Vec::new(),
            Err(error) => {
                tracing::warn!(error = %error, "failed to read local snapshot");
                Vec::new()
            }
        }
    }

    fn stale(&self, identity_key: &IdentityKey) -> BootstrapReport {
        tracing::debug!(identity_key = %identity_key, "discarding stale reload result");
        BootstrapReport::new(BootstrapSource::Stale, identity_key.clone())
    }

    /// Sends a message on `thread_id` and drives the reply to completion.
    ///
    /// Validation failures leave the thread untouched. A failed user append rolls the
    /// optimistic insert back and returns the text inside the error. Everything after the
    /// user append is reported through [`SendOutcome`].
    pub async fn send(&self, thread_id: &ThreadId, draft: Draft) -> SyncResult<SendReceipt> {
        validate_draft(&draft, &self.inner.settings)?;
        let now_ms = now_unix_ms();

        let (optimistic, token, materialize, user_record, retitle) = {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            let Some(position) = state.threads.iter().position(|thread| &thread.id == thread_id)
            else {
                return UnknownThreadSnafu {
                    stage: "send-find-thread",
                    thread_id: thread_id.clone(),
                }
                .fail();
            };

            if let Some(previous) = state.active.remove(thread_id) {
                if let Some(abort) = &previous.abort {
                    abort.abort();
                }
                pipeline::fail(
                    &mut state.threads[position],
                    &previous.placeholder_id,
                    ResponsePacket::error(SUPERSEDED_NOTICE),
                    now_ms,
                );
                tracing::info!(thread_id = %thread_id, "superseded in-flight generation");
            }

            let thread = &mut state.threads[position];
            let optimistic =
                show_optimistic(thread, &draft, now_ms, self.inner.settings.title_max_chars);
            let materialize = (!thread.persisted).then(|| {
                let mut input = NewConversation::new(&self.inner.owner_key, thread.title.clone())
                    .with_thread_id(thread.id.clone());
                if let Some(key) = &thread.identity_key {
                    input = input.with_identity_key(key.as_str());
                }
                if thread.is_canonical {
                    input = input.canonical();
                }
                input
            });
            let retitle = (thread.persisted && optimistic.previous_title.is_some())
                .then(|| thread.title.clone());
            let user_record = thread
                .message(&optimistic.user_message_id)
                .map(encode_message)
                .transpose();

            let user_record = match user_record {
                Ok(Some(record)) => record,
                Ok(None) => {
                    rollback_optimistic(thread, &optimistic);
                    return UnknownThreadSnafu {
                        stage: "send-encode-user-message",
                        thread_id: thread_id.clone(),
                    }
                    .fail();
                }
                Err(error) => {
                    rollback_optimistic(thread, &optimistic);
                    return Err(error);
                }
            };

            state.next_generation += 1;
            let token = GenerationToken::new(state.next_generation);
            state.active.insert(
                thread_id.clone(),
                ActiveGeneration {
                    token,
                    placeholder_id: optimistic.placeholder_id.clone(),
                    stage: PipelineState::OptimisticallyShown,
                    abort: None,
                },
            );
            state.advance(thread_id, token, PipelineState::PersistingUser);
            self.commit(state, true);
            (optimistic, token, materialize, user_record, retitle)
        };

        if let Some(input) = materialize {
            if let Err(source) = self.inner.gateway.create_conversation(input).await {
                self.rollback_send(thread_id, &optimistic, token).await;
                return Err(source).context(SendRejectedSnafu {
                    stage: "send-create-thread",
                    input: draft.text,
                });
            }
            let mut state = self.inner.state.lock().await;
            if let Some(thread) = state.thread_mut(thread_id) {
                thread.persisted = true;
            }
        }

        if let Err(source) = self
            .inner
            .gateway
            .append_message(&self.inner.owner_key, thread_id, user_record)
            .await
        {
            self.rollback_send(thread_id, &optimistic, token).await;
            return Err(source).context(SendRejectedSnafu {
                stage: "send-append-user-message",
                input: draft.text,
            });
        }

        {
            let mut state = self.inner.state.lock().await;
            if let Some(thread) = state.thread_mut(thread_id) {
                pipeline::mark_delivery(thread, &optimistic.user_message_id, Delivery::Persisted);
            }
            state.advance(thread_id, token, PipelineState::Generating);
            self.commit(&mut state, true);
        }

        if let Some(title) = retitle {
            let patch = ConversationPatch {
                title: Some(title),
                archived: None,
            };
            if let Err(error) = self
                .inner
                .gateway
                .update_conversation(&self.inner.owner_key, thread_id, patch)
                .await
            {
                tracing::warn!(thread_id = %thread_id, error = %error, "failed to store auto title");
            }
        }

        let outcome = self.generate_reply(thread_id, &optimistic, token).await;
        Ok(SendReceipt {
            thread_id: thread_id.clone(),
            user_message_id: optimistic.user_message_id,
            assistant_message_id: optimistic.placeholder_id,
            outcome,
        })
    }

    async fn generate_reply(
        &self,
        thread_id: &ThreadId,
        optimistic: &OptimisticSend,
        token: GenerationToken,
    ) -> SendOutcome {
        let request = {
            let state = self.inner.state.lock().await;
            if !state.is_current(thread_id, token) {
                return SendOutcome::Superseded;
            }
            let Some(thread) = state.thread(thread_id) else {
                return SendOutcome::Superseded;
            };
            self.build_request(thread, &state.runtime, token)
        };

        let engine = self.clone();
        let task_thread_id = thread_id.clone();
        let placeholder_id = optimistic.placeholder_id.clone();
        let submitted_at_ms = optimistic.submitted_at_ms;
        let task = tokio::spawn(async move {
            engine
                .run_generation(task_thread_id, placeholder_id, token, submitted_at_ms, request)
                .await
        });

        {
            let mut state = self.inner.state.lock().await;
            match state.active.get_mut(thread_id) {
                Some(active) if active.token == token => {
                    active.abort = Some(task.abort_handle());
                }
                _ => task.abort(),
            }
        }

        match task.await {
            Ok(outcome) => outcome,
            Err(error) if error.is_cancelled() => SendOutcome::Superseded,
            Err(error) => {
                let message = format!("generation task failed: {error}");
                self.fail_generation(thread_id, &optimistic.placeholder_id, token, message)
                    .await
            }
        }
    }

    fn build_request(
        &self,
        thread: &Thread,
        runtime: &RuntimeDescriptor,
        token: GenerationToken,
    ) -> GenerationRequest {
        let settings = &self.inner.settings;
        let mut request = GenerationRequest::new(
            GenerationTarget::new(thread.id.as_str(), token),
            pipeline::history(thread, settings.history_window),
        );
        if let Some(model_id) = &settings.model_id {
            request = request.with_model(model_id.clone());
        }
        if let Some(temperature) = settings.temperature {
            request = request.with_temperature(temperature);
        }
        if let Some(max_tokens) = settings.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }
        if let Some(prompt) = runtime.system_prompt() {
            request = request.with_preamble(prompt);
        }
        request
    }

    async fn run_generation(
        self,
        thread_id: ThreadId,
        placeholder_id: MessageId,
        token: GenerationToken,
        submitted_at_ms: u64,
        request: GenerationRequest,
    ) -> SendOutcome {
        let reply = match self.inner.generator.generate(request).await {
            Ok(reply) => reply,
            Err(error) => {
                return self
                    .fail_generation(&thread_id, &placeholder_id, token, error.to_string())
                    .await;
            }
        };

        let mut accumulator = StreamAccumulator::default();
        let packets = match reply {
            GenerationReply::Complete(packets) => packets,
            GenerationReply::Stream(ProviderStreamHandle { mut stream, worker }) => {
                tokio::spawn(worker);
                tracing::debug!(
                    conversation = %stream.target().conversation,
                    token = token.0,
                    "streaming generation"
                );
                loop {
                    let Some(event) = stream.recv().await else {
                        return self
                            .fail_generation(
                                &thread_id,
                                &placeholder_id,
                                token,
                                STREAM_ENDED_EARLY.to_string(),
                            )
                            .await;
                    };
                    if event.target.token != token {
                        continue;
                    }

                    match event.payload {
                        GenerationEvent::Final(packets) => break packets,
                        GenerationEvent::Done => break accumulator.final_packets(),
                        GenerationEvent::Error(message) => {
                            return self
                                .fail_generation(&thread_id, &placeholder_id, token, message)
                                .await;
                        }
                        progress => {
                            let mut state = self.inner.state.lock().await;
                            if !state.advance(&thread_id, token, PipelineState::Streaming) {
                                stream.cancel();
                                return SendOutcome::Superseded;
                            }
                            if let Some(thread) = state.thread_mut(&thread_id) {
                                apply_progress(thread, &placeholder_id, &progress, &mut accumulator);
                            }
                            self.commit(&mut state, false);
                        }
                    }
                }
            }
        };

        self.finalize_generation(
            &thread_id,
            &placeholder_id,
            token,
            submitted_at_ms,
            packets,
            accumulator.reasoning_trace(),
        )
        .await
    }

    async fn finalize_generation(
        &self,
        thread_id: &ThreadId,
        placeholder_id: &MessageId,
        token: GenerationToken,
        submitted_at_ms: u64,
        packets: Vec<ResponsePacket>,
        reasoning_trace: Option<String>,
    ) -> SendOutcome {
        let record = {
            let mut state = self.inner.state.lock().await;
            if !state.advance(thread_id, token, PipelineState::Finalizing) {
                tracing::debug!(thread_id = %thread_id, "dropping late generation result");
                return SendOutcome::Superseded;
            }
            state.active.remove(thread_id);

            let now_ms = now_unix_ms();
            let Some(thread) = state.thread_mut(thread_id) else {
                return SendOutcome::Superseded;
            };
            let metrics = GenerationMetrics {
                elapsed_ms: now_ms.saturating_sub(submitted_at_ms),
                reasoning_trace,
            };
            if pipeline::finalize(thread, placeholder_id, packets, metrics, now_ms)
                == FinalizeOutcome::Appended
            {
                tracing::warn!(
                    thread_id = %thread_id,
                    message_id = %placeholder_id,
                    "placeholder was gone; reply appended at the end"
                );
            }
            let record = thread.message(placeholder_id).map(encode_message);
            self.commit(&mut state, true);
            record
        };

        let append_error = match record {
            Some(Ok(record)) => self
                .inner
                .gateway
                .append_message(&self.inner.owner_key, thread_id, record)
                .await
                .err()
                .map(|error| error.to_string()),
            Some(Err(error)) => Some(error.to_string()),
            None => Some(format!("message {placeholder_id} vanished before it was stored")),
        };

        let delivery = if append_error.is_some() {
            Delivery::Failed
        } else {
            Delivery::Persisted
        };
        {
            let mut state = self.inner.state.lock().await;
            if let Some(thread) = state.thread_mut(thread_id) {
                pipeline::mark_delivery(thread, placeholder_id, delivery);
            }
            self.commit(&mut state, true);
        }

        match append_error {
            None => SendOutcome::Completed,
            Some(error) => {
                tracing::warn!(
                    thread_id = %thread_id,
                    message_id = %placeholder_id,
                    error = %error,
                    "assistant reply is shown but was not stored"
                );
                SendOutcome::FinalizeNotPersisted(error)
            }
        }
    }

    async fn fail_generation(
        &self,
        thread_id: &ThreadId,
        placeholder_id: &MessageId,
        token: GenerationToken,
        message: String,
    ) -> SendOutcome {
        let mut state = self.inner.state.lock().await;
        if !state.advance(thread_id, token, PipelineState::Failed) {
            return SendOutcome::Superseded;
        }
        state.active.remove(thread_id);
        if let Some(thread) = state.thread_mut(thread_id) {
            pipeline::fail(
                thread,
                placeholder_id,
                ResponsePacket::error(message.clone()),
                now_unix_ms(),
            );
        }
        self.commit(&mut state, true);
        tracing::warn!(thread_id = %thread_id, error = %message, "generation failed");
        SendOutcome::GenerationFailed(message)
    }

    async fn rollback_send(
        &self,
        thread_id: &ThreadId,
        optimistic: &OptimisticSend,
        token: GenerationToken,
    ) {
        let mut state = self.inner.state.lock().await;
        if state.advance(thread_id, token, PipelineState::Failed) {
            state.active.remove(thread_id);
        }
        if let Some(thread) = state.thread_mut(thread_id) {
            rollback_optimistic(thread, optimistic);
        }
        self.commit(&mut state, true);
        tracing::warn!(thread_id = %thread_id, "rolled back unsaved message");
    }

    /// Creates a non-canonical thread for the active identity.
    pub async fn new_thread(&self, title: Option<String>) -> SyncResult<Thread> {
        let identity_key = self.identity_key().await;
        let input = NewConversation::new(&self.inner.owner_key, title.unwrap_or_default())
            .with_identity_key(identity_key.as_str());
        let record = self
            .inner
            .gateway
            .create_conversation(input)
            .await
            .context(CreateThreadSnafu {
                stage: "new-thread",
            })?;

        let mut stats = DecodeStats::default();
        let thread = decode_thread(record, Some(identity_key), &mut stats);
        let mut state = self.inner.state.lock().await;
        state.threads.push(thread.clone());
        self.commit(&mut state, true);
        Ok(thread)
    }

    pub async fn rename_thread(&self, thread_id: &ThreadId, title: &str) -> SyncResult<()> {
        let title = title.trim().to_string();
        ensure!(
            !title.is_empty(),
            ValidationSnafu {
                stage: "rename-thread",
                reason: "title is empty".to_string(),
            }
        );
        let patch = ConversationPatch {
            title: Some(title.clone()),
            archived: None,
        };
        self.patch_thread(thread_id, patch, "rename-thread", |thread| thread.title = title)
            .await
    }

    pub async fn set_archived(&self, thread_id: &ThreadId, archived: bool) -> SyncResult<()> {
        let patch = ConversationPatch {
            title: None,
            archived: Some(archived),
        };
        self.patch_thread(thread_id, patch, "set-archived", |thread| {
            thread.archived = archived;
        })
        .await
    }

    async fn patch_thread(
        &self,
        thread_id: &ThreadId,
        patch: ConversationPatch,
        stage: &'static str,
        apply: impl FnOnce(&mut Thread),
    ) -> SyncResult<()> {
        let persisted = self.persisted_flag(thread_id, stage).await?;
        if persisted {
            self.inner
                .gateway
                .update_conversation(&self.inner.owner_key, thread_id, patch)
                .await
                .context(StorageSnafu { stage })?;
        }

        let mut state = self.inner.state.lock().await;
        if let Some(thread) = state.thread_mut(thread_id) {
            apply(thread);
            thread.touch(now_unix_ms());
        }
        self.commit(&mut state, true);
        Ok(())
    }

    /// Writes a tombstone and drops the thread from memory. A deleted canonical thread is
    /// replaced under the next canonical id.
    pub async fn delete_thread(&self, thread_id: &ThreadId) -> SyncResult<()> {
        let persisted = self.persisted_flag(thread_id, "delete-thread").await?;
        if persisted {
            self.inner
                .gateway
                .tombstone_conversation(&self.inner.owner_key, thread_id)
                .await
                .context(StorageSnafu {
                    stage: "delete-thread",
                })?;
        }

        let replace_canonical = {
            let mut state = self.inner.state.lock().await;
            state.tombstones.insert(thread_id.clone());
            if let Some(active) = state.active.remove(thread_id)
                && let Some(abort) = active.abort
            {
                abort.abort();
            }
            let removed = state
                .threads
                .iter()
                .position(|thread| &thread.id == thread_id)
                .map(|position| state.threads.remove(position));
            let identity_key = state.identity_key.clone();
            self.commit(&mut state, true);
            removed
                .filter(|thread| thread.is_canonical_for(&identity_key))
                .map(|_| identity_key)
        };

        if let Some(identity_key) = replace_canonical {
            self.ensure_canonical(&identity_key).await;
        }
        Ok(())
    }

    async fn ensure_canonical(&self, identity_key: &IdentityKey) {
        let tombstones = {
            let state = self.inner.state.lock().await;
            if find_canonical(&state.threads, identity_key).is_some() {
                return;
            }
            state.tombstones.clone()
        };

        let canonical = if identity_key.is_default() {
            transient_canonical(identity_key, &tombstones, now_unix_ms())
        } else {
            resolve_canonical(
                self.inner.gateway.as_ref(),
                &self.inner.owner_key,
                identity_key,
                &[],
                &tombstones,
            )
            .await
            .unwrap_or_else(|| transient_canonical(identity_key, &tombstones, now_unix_ms()))
        };

        let mut state = self.inner.state.lock().await;
        if find_canonical(&state.threads, identity_key).is_none() {
            state.threads.push(canonical);
            self.commit(&mut state, true);
        }
    }

    async fn persisted_flag(&self, thread_id: &ThreadId, stage: &'static str) -> SyncResult<bool> {
        let state = self.inner.state.lock().await;
        match state.thread(thread_id) {
            Some(thread) => Ok(thread.persisted),
            None => UnknownThreadSnafu {
                stage,
                thread_id: thread_id.clone(),
            }
            .fail(),
        }
    }

    /// Writes the local snapshot now, for page-hide or shutdown.
    pub async fn flush_snapshot(&self) -> SyncResult<()> {
        let Some(store) = &self.inner.snapshots else {
            return Ok(());
        };
        let state = self.inner.state.lock().await;
        store.save(&self.inner.owner_key, &state.threads, now_unix_ms())
    }

    fn commit(&self, state: &mut SessionState, write_snapshot: bool) {
        sort_threads(&mut state.threads, &state.identity_key);
        self.inner.published.send_replace(state.threads.clone());

        if write_snapshot
            && let Some(store) = &self.inner.snapshots
            && let Err(error) = store.save(&self.inner.owner_key, &state.threads, now_unix_ms())
        {
            tracing::warn!(error = %error, "failed to write local snapshot");
        }
    }
}
