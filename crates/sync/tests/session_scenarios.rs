use std::sync::Arc;

use threadline_llm::{GenerationEvent, ResponsePacket, ScriptedGenerator, ScriptedReply};
use threadline_storage::{
    ConversationGateway, ConversationRecord, GatewayOp, MemoryGateway, MessageId, MessageRecord,
    MessageRole, StorageErrorKind, ThreadId,
};
use threadline_sync::pipeline::SUPERSEDED_NOTICE;
use threadline_sync::{
    BootstrapSource, Content, Delivery, Draft, EMERGENCY_GREETING, RuntimeDescriptor,
    RuntimeSelectionStore, SendOutcome, SessionEngine, SnapshotStore, SyncSettings,
};

const OWNER: &str = "owner-1";

fn engine_over(gateway: Arc<MemoryGateway>, generator: Arc<ScriptedGenerator>) -> SessionEngine {
    SessionEngine::builder(OWNER, gateway, generator).build()
}

fn legacy_record(id: &str, identity_key: Option<&str>, content: &str) -> ConversationRecord {
    ConversationRecord {
        id: ThreadId::parse(id).expect("thread id"),
        owner_key: OWNER.to_string(),
        title: "Earlier chat".to_string(),
        identity_key: identity_key.map(str::to_string),
        construct_id: None,
        is_canonical: false,
        archived: false,
        created_at_ms: 10,
        updated_at_ms: 20,
        deleted_at_ms: None,
        messages: vec![MessageRecord {
            id: MessageId::new_v7(),
            role: MessageRole::Assistant,
            content: content.to_string(),
            packets_json: None,
            timestamp_ms: 20,
            attachments: Vec::new(),
            metrics: None,
        }],
    }
}

async fn wait_for_calls(gateway: &MemoryGateway, op: GatewayOp, expected: usize) {
    while gateway.calls(op).await < expected {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn hello_on_the_core_runtime_is_stored_with_its_reply() {
    let gateway = Arc::new(MemoryGateway::new());
    let engine = engine_over(gateway.clone(), Arc::new(ScriptedGenerator::new()));
    engine.bootstrap().await;
    let canonical = engine.canonical_thread().await.expect("canonical thread");

    let receipt = engine
        .send(&canonical.id, Draft::text("hello"))
        .await
        .expect("send succeeds");

    assert_eq!(receipt.outcome, SendOutcome::Completed);
    let thread = engine.thread(&canonical.id).await.expect("thread");
    assert_eq!(thread.title, "hello");
    assert_eq!(thread.messages.len(), 2);
    assert!(
        thread
            .messages
            .iter()
            .all(|message| message.delivery == Delivery::Persisted && !message.is_typing())
    );

    let stored = gateway.record(OWNER, &canonical.id).await.expect("stored thread");
    assert!(stored.is_canonical);
    assert_eq!(stored.messages.len(), 2);
}

#[tokio::test]
async fn failed_user_append_hands_the_draft_back() {
    let gateway = Arc::new(MemoryGateway::new());
    let engine = engine_over(gateway.clone(), Arc::new(ScriptedGenerator::new()));
    engine.bootstrap().await;
    let canonical = engine.canonical_thread().await.expect("canonical thread");

    gateway
        .fail_next(GatewayOp::Append, StorageErrorKind::Transient)
        .await;
    let error = engine
        .send(&canonical.id, Draft::text("hello"))
        .await
        .expect_err("append fails");

    assert_eq!(error.restored_input(), Some("hello"));
    let thread = engine.thread(&canonical.id).await.expect("thread");
    assert!(thread.messages.is_empty());
    assert!(thread.has_default_title());
}

#[tokio::test]
async fn reload_during_a_send_keeps_the_optimistic_messages() {
    let gateway = Arc::new(MemoryGateway::new());
    let engine = engine_over(gateway.clone(), Arc::new(ScriptedGenerator::new()));
    engine.bootstrap().await;
    let canonical = engine.canonical_thread().await.expect("canonical thread");
    engine
        .send(&canonical.id, Draft::text("first"))
        .await
        .expect("first send");

    let release = gateway.pause_next(GatewayOp::Append).await;
    let sender = engine.clone();
    let thread_id = canonical.id.clone();
    let pending = tokio::spawn(async move { sender.send(&thread_id, Draft::text("second")).await });
    wait_for_calls(&gateway, GatewayOp::Append, 3).await;

    let report = engine.reload().await;
    assert_eq!(report.source, BootstrapSource::Remote);
    let during = engine.thread(&canonical.id).await.expect("thread");
    assert_eq!(during.messages.len(), 4);
    assert!(during.messages.iter().any(|message| message.text() == "second"));
    assert!(during.messages.iter().any(|message| message.is_typing()));

    let _ = release.send(());
    let receipt = pending.await.expect("join").expect("second send");
    assert_eq!(receipt.outcome, SendOutcome::Completed);

    let after = engine.thread(&canonical.id).await.expect("thread");
    assert_eq!(after.messages.len(), 4);
    assert_eq!(
        gateway
            .record(OWNER, &canonical.id)
            .await
            .expect("stored")
            .messages
            .len(),
        4
    );
}

#[tokio::test]
async fn repeated_reloads_keep_one_canonical_thread_per_identity() {
    let gateway = Arc::new(MemoryGateway::new());
    let engine = engine_over(gateway.clone(), Arc::new(ScriptedGenerator::new()));
    engine.bootstrap().await;
    let canonical = engine.canonical_thread().await.expect("canonical thread");
    engine
        .send(&canonical.id, Draft::text("hello"))
        .await
        .expect("send");

    for _ in 0..3 {
        engine.reload().await;
    }
    let canonical_count = engine
        .visible_threads()
        .await
        .iter()
        .filter(|thread| thread.is_canonical)
        .count();
    assert_eq!(canonical_count, 1);

    engine
        .select_runtime(RuntimeDescriptor::new("lin-001", "Lin", "openai"))
        .await;
    engine.reload().await;
    engine.reload().await;

    let visible = engine.visible_threads().await;
    assert_eq!(visible.iter().filter(|thread| thread.is_canonical).count(), 1);
    let stored = gateway
        .list_conversations(OWNER)
        .await
        .expect("list")
        .into_iter()
        .filter(|record| record.is_canonical && record.identity_key.as_deref() == Some("lin-001"))
        .count();
    assert_eq!(stored, 1);
}

#[tokio::test]
async fn streamed_fragments_collapse_into_one_reply() {
    let gateway = Arc::new(MemoryGateway::new());
    let generator = Arc::new(ScriptedGenerator::new());
    generator
        .push(ScriptedReply::Stream(vec![
            GenerationEvent::Status("thinking".to_string()),
            GenerationEvent::Partial("Hel".to_string()),
            GenerationEvent::Partial("lo".to_string()),
            GenerationEvent::Partial(" there".to_string()),
            GenerationEvent::Final(vec![ResponsePacket::answer("Hello there")]),
        ]))
        .await;
    let engine = engine_over(gateway.clone(), generator);
    engine.bootstrap().await;
    let canonical = engine.canonical_thread().await.expect("canonical thread");

    let receipt = engine
        .send(&canonical.id, Draft::text("hi"))
        .await
        .expect("send");

    assert_eq!(receipt.outcome, SendOutcome::Completed);
    let thread = engine.thread(&canonical.id).await.expect("thread");
    let replies = thread
        .messages
        .iter()
        .filter(|message| message.role == MessageRole::Assistant)
        .collect::<Vec<_>>();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].id, receipt.assistant_message_id);
    assert_eq!(replies[0].text(), "Hello there");
    assert!(!replies[0].is_typing());

    let stored = gateway.record(OWNER, &canonical.id).await.expect("stored");
    assert_eq!(stored.messages.len(), 2);
}

#[tokio::test]
async fn runtime_switch_mid_generation_finishes_in_the_original_thread() {
    let gateway = Arc::new(MemoryGateway::new());
    let generator = Arc::new(ScriptedGenerator::new());
    let engine = engine_over(gateway.clone(), generator.clone());
    engine.bootstrap().await;
    let canonical = engine.canonical_thread().await.expect("canonical thread");

    let release = generator.defer().await;
    let sender = engine.clone();
    let thread_id = canonical.id.clone();
    let pending = tokio::spawn(async move { sender.send(&thread_id, Draft::text("hello")).await });
    while generator.requests().await.is_empty() {
        tokio::task::yield_now().await;
    }

    engine
        .select_runtime(RuntimeDescriptor::new("lin-001", "Lin", "openai"))
        .await;
    let lin_canonical = engine.canonical_thread().await.expect("lin canonical");
    assert_ne!(lin_canonical.id, canonical.id);

    let _ = release.send(vec![GenerationEvent::Final(vec![ResponsePacket::answer(
        "late answer",
    )])]);
    let receipt = pending.await.expect("join").expect("send");
    assert_eq!(receipt.outcome, SendOutcome::Completed);

    let stored = gateway.record(OWNER, &canonical.id).await.expect("stored");
    assert!(stored.messages.iter().any(|message| message.content == "late answer"));
    let lin_thread = engine.thread(&lin_canonical.id).await.expect("lin thread");
    assert!(lin_thread.messages.is_empty());
    assert!(
        engine
            .visible_threads()
            .await
            .iter()
            .all(|thread| thread.id != canonical.id)
    );
}

#[tokio::test]
async fn empty_default_bootstrap_converges_on_one_thread() {
    let gateway = Arc::new(MemoryGateway::new());
    let first = engine_over(gateway.clone(), Arc::new(ScriptedGenerator::new()));
    let second = engine_over(gateway.clone(), Arc::new(ScriptedGenerator::new()));

    let report = first.bootstrap().await;
    second.bootstrap().await;
    first.reload().await;

    assert_eq!(report.source, BootstrapSource::Remote);
    let first_visible = first.visible_threads().await;
    assert_eq!(first_visible.len(), 1);
    assert!(first_visible[0].is_canonical);
    assert_eq!(
        first.canonical_thread().await.map(|thread| thread.id),
        second.canonical_thread().await.map(|thread| thread.id)
    );
    assert_eq!(gateway.calls(GatewayOp::Create).await, 0);
}

#[tokio::test]
async fn archive_outage_restores_the_local_snapshot() {
    let directory = tempfile::tempdir().expect("tempdir");
    let gateway = Arc::new(MemoryGateway::new());
    let online = SessionEngine::builder(OWNER, gateway, Arc::new(ScriptedGenerator::new()))
        .snapshots(SnapshotStore::new(directory.path()))
        .build();
    online.bootstrap().await;
    let canonical = online.canonical_thread().await.expect("canonical thread");
    online
        .send(&canonical.id, Draft::text("remember me"))
        .await
        .expect("send");
    online.flush_snapshot().await.expect("flush");

    let unreachable = Arc::new(MemoryGateway::new());
    unreachable
        .fail_next(GatewayOp::List, StorageErrorKind::Rejected)
        .await;
    let offline = SessionEngine::builder(OWNER, unreachable, Arc::new(ScriptedGenerator::new()))
        .snapshots(SnapshotStore::new(directory.path()))
        .build();
    let report = offline.bootstrap().await;

    assert_eq!(report.source, BootstrapSource::Snapshot);
    assert!(report.error.is_some());
    let restored = offline.canonical_thread().await.expect("canonical thread");
    assert_eq!(restored.id, canonical.id);
    assert_eq!(restored.messages.len(), 2);
    assert_eq!(restored.messages[0].text(), "remember me");
}

#[tokio::test]
async fn archive_outage_without_snapshot_shows_an_emergency_thread() {
    let gateway = Arc::new(MemoryGateway::new());
    for _ in 0..2 {
        gateway
            .fail_next(GatewayOp::List, StorageErrorKind::Transient)
            .await;
    }
    let engine = engine_over(gateway, Arc::new(ScriptedGenerator::new()));

    let report = engine.bootstrap().await;

    assert_eq!(report.source, BootstrapSource::Emergency);
    assert_eq!(report.attempts, 2);
    let thread = engine.canonical_thread().await.expect("emergency thread");
    assert_eq!(thread.messages.len(), 1);
    assert_eq!(thread.messages[0].delivery, Delivery::Synthetic);
    assert_eq!(thread.messages[0].text(), EMERGENCY_GREETING);
}

#[tokio::test]
async fn transient_list_failure_is_retried_once() {
    let gateway = Arc::new(MemoryGateway::new());
    gateway
        .fail_next(GatewayOp::List, StorageErrorKind::Transient)
        .await;
    let engine = engine_over(gateway.clone(), Arc::new(ScriptedGenerator::new()));

    let report = engine.bootstrap().await;

    assert_eq!(report.source, BootstrapSource::Remote);
    assert_eq!(report.attempts, 2);
    assert_eq!(gateway.calls(GatewayOp::List).await, 2);
}

#[tokio::test]
async fn legacy_assistant_text_is_wrapped_on_load() {
    let gateway = Arc::new(MemoryGateway::new());
    gateway
        .insert_record(legacy_record("t-legacy", Some("zen-001"), "old reply"))
        .await;
    let engine = engine_over(gateway, Arc::new(ScriptedGenerator::new()));

    let report = engine.bootstrap().await;

    assert_eq!(report.repaired_messages, 1);
    let thread = engine
        .thread(&ThreadId::parse("t-legacy").expect("id"))
        .await
        .expect("legacy thread");
    assert_eq!(
        thread.messages[0].content,
        Content::Packets(vec![ResponsePacket::answer("old reply")])
    );
}

#[tokio::test]
async fn tombstoned_and_foreign_threads_stay_hidden() {
    let gateway = Arc::new(MemoryGateway::new());
    let mut deleted = legacy_record("t-deleted", Some("zen-001"), "gone");
    deleted.deleted_at_ms = Some(30);
    gateway.insert_record(deleted).await;
    gateway
        .insert_record(legacy_record("t-lin", Some("lin-001"), "other runtime"))
        .await;
    let engine = engine_over(gateway, Arc::new(ScriptedGenerator::new()));

    let report = engine.bootstrap().await;

    assert_eq!(report.skipped_tombstones, 1);
    let visible = engine.visible_threads().await;
    assert_eq!(visible.len(), 1);
    assert!(visible[0].is_canonical);
}

#[tokio::test]
async fn settings_limits_reject_oversized_drafts() {
    let gateway = Arc::new(MemoryGateway::new());
    let settings = SyncSettings {
        max_message_bytes: 4,
        ..SyncSettings::default()
    };
    let engine = SessionEngine::builder(OWNER, gateway.clone(), Arc::new(ScriptedGenerator::new()))
        .settings(Arc::new(settings))
        .build();
    engine.bootstrap().await;
    let canonical = engine.canonical_thread().await.expect("canonical thread");

    let result = engine.send(&canonical.id, Draft::text("too long")).await;

    assert!(result.is_err());
    assert_eq!(gateway.calls(GatewayOp::Append).await, 0);
}

#[tokio::test]
async fn owners_sharing_an_archive_each_get_their_canonical_thread() {
    let gateway = Arc::new(MemoryGateway::new());
    let alice = SessionEngine::builder("alice", gateway.clone(), Arc::new(ScriptedGenerator::new()))
        .build();
    let bob = SessionEngine::builder("bob", gateway.clone(), Arc::new(ScriptedGenerator::new()))
        .build();
    alice.bootstrap().await;
    bob.bootstrap().await;
    let alice_thread = alice.canonical_thread().await.expect("alice canonical");
    let bob_thread = bob.canonical_thread().await.expect("bob canonical");
    assert_eq!(alice_thread.id, bob_thread.id);

    let alice_receipt = alice
        .send(&alice_thread.id, Draft::text("hi from alice"))
        .await
        .expect("alice send");
    let bob_receipt = bob
        .send(&bob_thread.id, Draft::text("hi from bob"))
        .await
        .expect("bob send");

    assert_eq!(alice_receipt.outcome, SendOutcome::Completed);
    assert_eq!(bob_receipt.outcome, SendOutcome::Completed);
    let alice_row = gateway.record("alice", &alice_thread.id).await.expect("alice row");
    let bob_row = gateway.record("bob", &bob_thread.id).await.expect("bob row");
    assert_eq!(alice_row.messages.len(), 2);
    assert_eq!(bob_row.messages.len(), 2);
    assert_eq!(alice_row.messages[0].content, "hi from alice");
    assert_eq!(bob_row.messages[0].content, "hi from bob");
}

#[tokio::test]
async fn an_older_reload_finishing_late_is_discarded() {
    let gateway = Arc::new(MemoryGateway::new());
    let engine = engine_over(gateway.clone(), Arc::new(ScriptedGenerator::new()));
    engine.bootstrap().await;

    let release = gateway.pause_next(GatewayOp::List).await;
    let reloader = engine.clone();
    let older = tokio::spawn(async move { reloader.reload().await });
    wait_for_calls(&gateway, GatewayOp::List, 2).await;

    let newer = engine.reload().await;
    assert_eq!(newer.source, BootstrapSource::Remote);

    gateway
        .insert_record(legacy_record("t-arrived-late", Some("zen-001"), "late row"))
        .await;
    let _ = release.send(());
    let report = older.await.expect("join");

    assert_eq!(report.source, BootstrapSource::Stale);
    assert!(
        engine
            .thread(&ThreadId::parse("t-arrived-late").expect("id"))
            .await
            .is_none()
    );
}

#[tokio::test]
async fn a_second_send_on_the_same_thread_supersedes_the_first() {
    let gateway = Arc::new(MemoryGateway::new());
    let generator = Arc::new(ScriptedGenerator::new());
    let engine = engine_over(gateway.clone(), generator.clone());
    engine.bootstrap().await;
    let canonical = engine.canonical_thread().await.expect("canonical thread");

    let release = generator.defer().await;
    let sender = engine.clone();
    let thread_id = canonical.id.clone();
    let first = tokio::spawn(async move { sender.send(&thread_id, Draft::text("first")).await });
    while generator.requests().await.is_empty() {
        tokio::task::yield_now().await;
    }

    let second = engine
        .send(&canonical.id, Draft::text("second"))
        .await
        .expect("second send");
    let _ = release.send(vec![GenerationEvent::Final(vec![ResponsePacket::answer(
        "late",
    )])]);
    let first = first.await.expect("join").expect("first send");

    assert_eq!(first.outcome, SendOutcome::Superseded);
    assert_eq!(second.outcome, SendOutcome::Completed);

    let thread = engine.thread(&canonical.id).await.expect("thread");
    let notice = thread
        .message(&first.assistant_message_id)
        .expect("first placeholder");
    assert_eq!(notice.delivery, Delivery::Synthetic);
    assert_eq!(
        notice.content,
        Content::Packets(vec![ResponsePacket::error(SUPERSEDED_NOTICE)])
    );
    assert!(!notice.is_typing());
    assert!(thread.messages.iter().all(|message| message.text() != "late"));

    let stored = gateway.record(OWNER, &canonical.id).await.expect("stored");
    assert_eq!(stored.messages.len(), 3);
    assert!(stored.messages.iter().all(|message| message.content != "late"));
}

#[tokio::test]
async fn the_selected_runtime_is_restored_on_the_next_bootstrap() {
    let directory = tempfile::tempdir().expect("tempdir");
    let gateway = Arc::new(MemoryGateway::new());
    let first = SessionEngine::builder(OWNER, gateway.clone(), Arc::new(ScriptedGenerator::new()))
        .runtime_selection(RuntimeSelectionStore::in_directory(directory.path()))
        .build();
    first.bootstrap().await;
    assert_eq!(first.active_runtime().await, RuntimeDescriptor::core());

    let lin = RuntimeDescriptor::new("lin-001", "Lin", "openai");
    first.select_runtime(lin.clone()).await;

    let restarted =
        SessionEngine::builder(OWNER, gateway, Arc::new(ScriptedGenerator::new()))
            .runtime_selection(RuntimeSelectionStore::in_directory(directory.path()))
            .build();
    let report = restarted.bootstrap().await;

    assert_eq!(restarted.active_runtime().await, lin);
    assert_eq!(restarted.identity_key().await.as_str(), "lin-001");
    assert_eq!(report.source, BootstrapSource::Remote);
    let canonical = restarted.canonical_thread().await.expect("lin canonical");
    assert_eq!(canonical.identity_key.as_ref().map(|key| key.as_str()), Some("lin-001"));
}
