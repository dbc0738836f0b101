use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use snafu::{OptionExt, ResultExt, Snafu};
use threadline_llm::{GenerationEvent, ResponsePacket, ScriptedGenerator};
use threadline_storage::{
    ConversationGateway, ConversationRecord, GatewayOp, MemoryGateway, MessageId, MessageRecord,
    MessageRole, SqliteGateway, StorageError, StorageErrorKind, ThreadId,
};
use threadline_sync::{
    BootstrapSource, Content, Draft, RuntimeDescriptor, SendOutcome, SessionEngine,
    SettingsError, SettingsStore, SnapshotStore, SyncError, SyncSettings,
};
use tracing_subscriber::EnvFilter;

const OWNER_KEY: &str = "qa-owner";

#[derive(Debug, Clone)]
struct RunnerArgs {
    scenario: Scenario,
    db_path: Option<String>,
    config_path: Option<PathBuf>,
    snapshot_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy)]
enum Scenario {
    SendHello,
    UserAppendFailure,
    RuntimeSwitchInflight,
    EmptyBootstrap,
    LegacyRepair,
    SnapshotRestore,
    All,
}

impl Scenario {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "send_hello" => Some(Self::SendHello),
            "user_append_failure" => Some(Self::UserAppendFailure),
            "runtime_switch_inflight" => Some(Self::RuntimeSwitchInflight),
            "empty_bootstrap" => Some(Self::EmptyBootstrap),
            "legacy_repair" => Some(Self::LegacyRepair),
            "snapshot_restore" => Some(Self::SnapshotRestore),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::SendHello => "send_hello",
            Self::UserAppendFailure => "user_append_failure",
            Self::RuntimeSwitchInflight => "runtime_switch_inflight",
            Self::EmptyBootstrap => "empty_bootstrap",
            Self::LegacyRepair => "legacy_repair",
            Self::SnapshotRestore => "snapshot_restore",
            Self::All => "all",
        }
    }
}

#[derive(Debug, Snafu)]
enum RunnerError {
    #[snafu(display("missing required --scenario argument"))]
    MissingScenario { stage: &'static str },
    #[snafu(display("missing value for argument '{arg}'"))]
    MissingArgumentValue {
        stage: &'static str,
        arg: &'static str,
    },
    #[snafu(display("unknown scenario '{raw}'"))]
    UnknownScenario { stage: &'static str, raw: String },
    #[snafu(display("unknown argument '{raw}'"))]
    UnknownArgument { stage: &'static str, raw: String },
    #[snafu(display("storage setup failed: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("settings could not be applied: {source}"))]
    Settings {
        stage: &'static str,
        source: SettingsError,
    },
    #[snafu(display("session call failed: {source}"))]
    Session {
        stage: &'static str,
        source: SyncError,
    },
    #[snafu(display("background send task failed: {source}"))]
    Join {
        stage: &'static str,
        source: tokio::task::JoinError,
    },
    #[snafu(display("scenario '{scenario}' failed: {reason}"))]
    ScenarioFailed {
        stage: &'static str,
        scenario: &'static str,
        reason: String,
    },
    #[snafu(display("file operation failed at '{path}': {source}"))]
    FileIo {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
}

type RunnerResult<T> = Result<T, RunnerError>;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run().await {
        println!("runner_ok=false");
        eprintln!("runner_error={error}");
        std::process::exit(1);
    }
}

async fn run() -> RunnerResult<()> {
    let args = parse_args(env::args().skip(1))?;
    println!("scenario={}", args.scenario.name());
    if let Some(db_path) = args.db_path.as_deref() {
        println!("db_path={db_path}");
    }

    let settings = load_settings(&args)?;
    let db_path = args.db_path.as_deref();
    match args.scenario {
        Scenario::SendHello => run_send_hello(&settings, db_path).await,
        Scenario::UserAppendFailure => run_user_append_failure(&settings).await,
        Scenario::RuntimeSwitchInflight => run_runtime_switch_inflight(&settings, db_path).await,
        Scenario::EmptyBootstrap => run_empty_bootstrap(&settings, db_path).await,
        Scenario::LegacyRepair => run_legacy_repair(&settings).await,
        Scenario::SnapshotRestore => run_snapshot_restore(&settings).await,
        Scenario::All => run_all(&settings, db_path).await,
    }?;

    println!("runner_ok=true");
    Ok(())
}

fn parse_args(args: impl IntoIterator<Item = String>) -> RunnerResult<RunnerArgs> {
    let mut scenario = None;
    let mut db_path = None;
    let mut config_path = None;
    let mut snapshot_dir = None;
    let mut pending = args.into_iter();

    while let Some(argument) = pending.next() {
        match argument.as_str() {
            "--scenario" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-scenario-value",
                    arg: "--scenario",
                })?;

                let parsed = Scenario::parse(&value).context(UnknownScenarioSnafu {
                    stage: "parse-args-scenario",
                    raw: value,
                })?;
                scenario = Some(parsed);
            }
            "--db" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-db-value",
                    arg: "--db",
                })?;
                db_path = Some(value);
            }
            "--config" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-config-value",
                    arg: "--config",
                })?;
                config_path = Some(PathBuf::from(value));
            }
            "--snapshot-dir" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-snapshot-dir-value",
                    arg: "--snapshot-dir",
                })?;
                snapshot_dir = Some(PathBuf::from(value));
            }
            _ => {
                return UnknownArgumentSnafu {
                    stage: "parse-args",
                    raw: argument,
                }
                .fail();
            }
        }
    }

    Ok(RunnerArgs {
        scenario: scenario.context(MissingScenarioSnafu {
            stage: "parse-args-scenario-required",
        })?,
        db_path,
        config_path,
        snapshot_dir,
    })
}

/// Opens the settings file; `--snapshot-dir` is written back so later runs reuse it.
fn load_settings(args: &RunnerArgs) -> RunnerResult<Arc<SyncSettings>> {
    let store = SettingsStore::open(
        args.config_path
            .clone()
            .unwrap_or_else(SettingsStore::default_path),
    );
    println!("config_path={}", store.path().display());

    let settings = match &args.snapshot_dir {
        Some(directory) => store
            .update(|settings| settings.snapshot_dir = Some(directory.clone()))
            .context(SettingsSnafu {
                stage: "runner-remember-snapshot-dir",
            })?,
        None => store.current(),
    };
    println!("snapshot_dir={}", settings.snapshot_dir().display());
    Ok(settings)
}

async fn run_all(settings: &Arc<SyncSettings>, db_path: Option<&str>) -> RunnerResult<()> {
    run_send_hello(settings, db_path).await?;
    run_user_append_failure(settings).await?;
    run_runtime_switch_inflight(settings, db_path).await?;
    run_empty_bootstrap(settings, db_path).await?;
    run_legacy_repair(settings).await?;
    run_snapshot_restore(settings).await?;
    println!("all_passed=true");
    Ok(())
}

/// Opens a fresh SQLite archive when a path is given, an in-memory one otherwise.
async fn open_gateway(db_path: Option<&str>) -> RunnerResult<Arc<dyn ConversationGateway>> {
    match db_path {
        Some(path) => {
            reset_sqlite_files(path)?;
            let gateway = SqliteGateway::open(path).await.context(StorageSnafu {
                stage: "open-sqlite-gateway",
            })?;
            println!("backend=sqlite");
            Ok(Arc::new(gateway))
        }
        None => {
            println!("backend=memory");
            Ok(Arc::new(MemoryGateway::new()))
        }
    }
}

fn engine(
    settings: &Arc<SyncSettings>,
    gateway: Arc<dyn ConversationGateway>,
    generator: Arc<ScriptedGenerator>,
) -> SessionEngine {
    SessionEngine::builder(OWNER_KEY, gateway, generator)
        .settings(settings.clone())
        .snapshots(SnapshotStore::new(settings.snapshot_dir()))
        .build()
}

async fn run_send_hello(settings: &Arc<SyncSettings>, db_path: Option<&str>) -> RunnerResult<()> {
    const SCENARIO: &str = "send_hello";
    let gateway = open_gateway(db_path).await?;
    let engine = engine(settings, gateway.clone(), Arc::new(ScriptedGenerator::new()));
    engine.bootstrap().await;

    let canonical = require(engine.canonical_thread().await, SCENARIO, "no canonical thread")?;
    let receipt = engine
        .send(&canonical.id, Draft::text("hello"))
        .await
        .context(SessionSnafu {
            stage: "scenario-send-hello-send",
        })?;
    let thread = require(engine.thread(&canonical.id).await, SCENARIO, "thread vanished")?;

    println!("message_count={}", thread.messages.len());
    println!("title={}", thread.title);
    check(
        SCENARIO,
        receipt.outcome == SendOutcome::Completed,
        format!("unexpected outcome {:?}", receipt.outcome),
    )?;
    check(
        SCENARIO,
        thread.messages.len() == 2 && thread.title == "hello",
        "expected two messages and the title 'hello'",
    )?;

    let stored = gateway
        .list_conversations(OWNER_KEY)
        .await
        .context(StorageSnafu {
            stage: "scenario-send-hello-list",
        })?;
    let stored_messages = stored
        .iter()
        .find(|record| record.id == canonical.id)
        .map(|record| record.messages.len())
        .unwrap_or(0);
    println!("stored_message_count={stored_messages}");
    check(SCENARIO, stored_messages == 2, "both messages should be stored")?;
    println!("{SCENARIO}=true");
    Ok(())
}

async fn run_user_append_failure(settings: &Arc<SyncSettings>) -> RunnerResult<()> {
    const SCENARIO: &str = "user_append_failure";
    let gateway = Arc::new(MemoryGateway::new());
    let engine = engine(settings, gateway.clone(), Arc::new(ScriptedGenerator::new()));
    engine.bootstrap().await;
    let canonical = require(engine.canonical_thread().await, SCENARIO, "no canonical thread")?;

    gateway
        .fail_next(GatewayOp::Append, StorageErrorKind::Transient)
        .await;
    let result = engine.send(&canonical.id, Draft::text("hello")).await;
    let thread = require(engine.thread(&canonical.id).await, SCENARIO, "thread vanished")?;

    let restored = result
        .as_ref()
        .err()
        .and_then(SyncError::restored_input)
        .map(str::to_string);
    println!("message_count={}", thread.messages.len());
    println!("restored_input={}", restored.as_deref().unwrap_or(""));
    check(
        SCENARIO,
        thread.messages.is_empty() && restored.as_deref() == Some("hello"),
        "the thread should be empty and the input restored",
    )?;
    println!("{SCENARIO}=true");
    Ok(())
}

async fn run_runtime_switch_inflight(
    settings: &Arc<SyncSettings>,
    db_path: Option<&str>,
) -> RunnerResult<()> {
    const SCENARIO: &str = "runtime_switch_inflight";
    let gateway = open_gateway(db_path).await?;
    let generator = Arc::new(ScriptedGenerator::new());
    let engine = engine(settings, gateway, generator.clone());
    engine.bootstrap().await;
    let canonical = require(engine.canonical_thread().await, SCENARIO, "no canonical thread")?;

    let release = generator.defer().await;
    let sender = engine.clone();
    let thread_id = canonical.id.clone();
    let send = tokio::spawn(async move { sender.send(&thread_id, Draft::text("hello")).await });
    while generator.requests().await.is_empty() {
        tokio::task::yield_now().await;
    }

    let report = engine
        .select_runtime(RuntimeDescriptor::new("lin-001", "Lin", "openai"))
        .await;
    println!("switch_source={:?}", report.source);
    let _ = release.send(vec![GenerationEvent::Final(vec![ResponsePacket::answer(
        "finalized after the switch",
    )])]);

    let receipt = send
        .await
        .context(JoinSnafu {
            stage: "scenario-runtime-switch-join",
        })?
        .context(SessionSnafu {
            stage: "scenario-runtime-switch-send",
        })?;
    let thread = require(engine.thread(&canonical.id).await, SCENARIO, "thread vanished")?;
    let reply = thread
        .message(&receipt.assistant_message_id)
        .map(|message| message.text())
        .unwrap_or_default();

    println!("outcome={:?}", receipt.outcome);
    println!("reply={reply}");
    check(
        SCENARIO,
        receipt.outcome == SendOutcome::Completed && reply == "finalized after the switch",
        "the in-flight reply should land in the first runtime's thread",
    )?;
    println!("{SCENARIO}=true");
    Ok(())
}

async fn run_empty_bootstrap(settings: &Arc<SyncSettings>, db_path: Option<&str>) -> RunnerResult<()> {
    const SCENARIO: &str = "empty_bootstrap";
    let gateway = open_gateway(db_path).await?;

    let first = engine(settings, gateway.clone(), Arc::new(ScriptedGenerator::new()));
    let report = first.bootstrap().await;
    let canonical_count = first
        .visible_threads()
        .await
        .iter()
        .filter(|thread| thread.is_canonical)
        .count();
    println!("first_source={:?}", report.source);
    println!("canonical_count={canonical_count}");
    check(
        SCENARIO,
        report.source == BootstrapSource::Remote && canonical_count == 1,
        "expected exactly one synthesized canonical thread",
    )?;

    let second = engine(settings, gateway.clone(), Arc::new(ScriptedGenerator::new()));
    second.bootstrap().await;
    let first_id = first.canonical_thread().await.map(|thread| thread.id);
    let second_id = second.canonical_thread().await.map(|thread| thread.id);
    let stored = gateway
        .list_conversations(OWNER_KEY)
        .await
        .context(StorageSnafu {
            stage: "scenario-empty-bootstrap-list",
        })?;
    println!("stored_threads={}", stored.len());
    check(
        SCENARIO,
        first_id.is_some() && first_id == second_id && stored.is_empty(),
        "a second bootstrap should converge on the same unsaved canonical thread",
    )?;
    println!("{SCENARIO}=true");
    Ok(())
}

async fn run_legacy_repair(settings: &Arc<SyncSettings>) -> RunnerResult<()> {
    const SCENARIO: &str = "legacy_repair";
    let gateway = Arc::new(MemoryGateway::new());
    let thread_id = ThreadId::parse("zen-001_chat_with_zen-001").context(StorageSnafu {
        stage: "scenario-legacy-repair-id",
    })?;
    gateway
        .insert_record(ConversationRecord {
            id: thread_id.clone(),
            owner_key: OWNER_KEY.to_string(),
            title: "Old chat".to_string(),
            identity_key: None,
            construct_id: None,
            is_canonical: false,
            archived: false,
            created_at_ms: 1,
            updated_at_ms: 2,
            deleted_at_ms: None,
            messages: vec![MessageRecord {
                id: MessageId::new_v7(),
                role: MessageRole::Assistant,
                content: "bare legacy text".to_string(),
                packets_json: None,
                timestamp_ms: 2,
                attachments: Vec::new(),
                metrics: None,
            }],
        })
        .await;

    let engine = engine(settings, gateway, Arc::new(ScriptedGenerator::new()));
    let report = engine.bootstrap().await;
    let thread = require(engine.thread(&thread_id).await, SCENARIO, "legacy thread not loaded")?;
    let repaired = matches!(
        thread.messages.first().map(|message| &message.content),
        Some(Content::Packets(packets)) if packets == &vec![ResponsePacket::answer("bare legacy text")]
    );

    println!("repaired_messages={}", report.repaired_messages);
    check(
        SCENARIO,
        repaired && report.repaired_messages == 1,
        "legacy text should be wrapped in one answer packet",
    )?;
    println!("{SCENARIO}=true");
    Ok(())
}

async fn run_snapshot_restore(settings: &Arc<SyncSettings>) -> RunnerResult<()> {
    const SCENARIO: &str = "snapshot_restore";
    let online = engine(
        settings,
        Arc::new(MemoryGateway::new()),
        Arc::new(ScriptedGenerator::new()),
    );
    online.bootstrap().await;
    let canonical = require(online.canonical_thread().await, SCENARIO, "no canonical thread")?;
    online
        .send(&canonical.id, Draft::text("remember me"))
        .await
        .context(SessionSnafu {
            stage: "scenario-snapshot-restore-send",
        })?;
    online.flush_snapshot().await.context(SessionSnafu {
        stage: "scenario-snapshot-restore-flush",
    })?;

    let unreachable = Arc::new(MemoryGateway::new());
    unreachable
        .fail_next(GatewayOp::List, StorageErrorKind::Rejected)
        .await;
    let offline = engine(settings, unreachable, Arc::new(ScriptedGenerator::new()));
    let report = offline.bootstrap().await;
    let restored = require(offline.canonical_thread().await, SCENARIO, "no restored thread")?;

    println!("restore_source={:?}", report.source);
    println!("restored_message_count={}", restored.messages.len());
    check(
        SCENARIO,
        report.source == BootstrapSource::Snapshot
            && restored.id == canonical.id
            && restored.messages.len() == 2,
        "the offline bootstrap should restore the flushed thread",
    )?;
    println!("{SCENARIO}=true");
    Ok(())
}

fn require<T>(value: Option<T>, scenario: &'static str, reason: &str) -> RunnerResult<T> {
    value.context(ScenarioFailedSnafu {
        stage: "scenario-require",
        scenario,
        reason: reason.to_string(),
    })
}

fn check(scenario: &'static str, passed: bool, reason: impl Into<String>) -> RunnerResult<()> {
    if passed {
        return Ok(());
    }
    ScenarioFailedSnafu {
        stage: "scenario-check",
        scenario,
        reason: reason.into(),
    }
    .fail()
}

fn reset_sqlite_files(db_path: &str) -> RunnerResult<()> {
    remove_file_if_exists(Path::new(db_path), "scenario-reset-sqlite-db")?;
    let wal_path = format!("{db_path}-wal");
    remove_file_if_exists(Path::new(&wal_path), "scenario-reset-sqlite-wal")?;
    let shm_path = format!("{db_path}-shm");
    remove_file_if_exists(Path::new(&shm_path), "scenario-reset-sqlite-shm")?;
    Ok(())
}

fn remove_file_if_exists(path: &Path, stage: &'static str) -> RunnerResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(RunnerError::FileIo {
            stage,
            path: path.display().to_string(),
            source,
        }),
    }
}
