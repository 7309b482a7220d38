//! Integration tests for dispensad
//!
//! These drive a running service over its Unix socket.

use dispensa_api::{
    Command, ErrorCode, EventPayload, Response, ResponsePayload, ResponseResult, SessionStatus,
    SessionStatusView,
};
use dispensa_config::parse_config;
use dispensa_ipc::IpcClient;
use dispensa_store::{SqliteStore, Store};
use dispensa_util::{CaseId, ManualClock, OwnerId, SessionId, SubjectId, TaskId};
use dispensad::Service;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const CATALOG: &str = r#"
config_version = 1

[service]
max_recovery_tokens = 2
scheduler_poll_ms = 20

[[cases]]
id = "uti-adult"
label = "Adult UTI"
duration_seconds = 300
dispense = ["nitrofurantoin-100", "paracetamol-500"]

[[cases]]
id = "otc-advice"
label = "Over-the-counter advice"
duration_seconds = 120
dispense = []
"#;

struct Harness {
    _dir: TempDir,
    socket_path: PathBuf,
    clock: Arc<ManualClock>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl Harness {
    async fn start() -> Self {
        let dir = tempdir().unwrap();
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
        Self::start_with(dir, store).await
    }

    async fn start_with(dir: TempDir, store: Arc<dyn Store>) -> Self {
        let socket_path = dir.path().join("dispensad.sock");
        let clock = Arc::new(ManualClock::new());
        let catalog = parse_config(CATALOG).unwrap();

        let service = Service::new(catalog, &socket_path, store, clock.clone())
            .await
            .unwrap();

        let (shutdown, stop) = oneshot::channel::<()>();
        let task = tokio::spawn(service.run(async move {
            let _ = stop.await;
        }));

        Self {
            _dir: dir,
            socket_path,
            clock,
            shutdown,
            task,
        }
    }

    async fn client(&self) -> IpcClient {
        IpcClient::connect(&self.socket_path).await.unwrap()
    }

    async fn stop(self) -> TempDir {
        let _ = self.shutdown.send(());
        self.task.await.unwrap().unwrap();
        self._dir
    }
}

fn status(response: Response) -> SessionStatusView {
    match response.result {
        ResponseResult::Ok(ResponsePayload::Status(view)) => view,
        other => panic!("expected status, got {:?}", other),
    }
}

fn error_code(response: Response) -> ErrorCode {
    match response.result {
        ResponseResult::Err(info) => info.code,
        other => panic!("expected error, got {:?}", other),
    }
}

async fn create(client: &mut IpcClient, owner: &str, case: &str) -> SessionId {
    let payload = client
        .request(Command::CreateSession {
            owner_id: OwnerId::new(owner),
            subject_id: SubjectId::new("subject-7"),
            case_id: CaseId::new(case),
        })
        .await
        .unwrap();

    match payload {
        ResponsePayload::SessionCreated { session_id } => session_id,
        other => panic!("expected session id, got {:?}", other),
    }
}

async fn raw_line(socket_path: &Path, line: &str) -> Response {
    let stream = UnixStream::connect(socket_path).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    write_half.write_all(line.as_bytes()).await.unwrap();

    let mut reader = BufReader::new(read_half);
    let mut reply = String::new();
    reader.read_line(&mut reply).await.unwrap();
    serde_json::from_str(reply.trim()).unwrap()
}

#[tokio::test]
async fn test_full_session_is_recovered() {
    let harness = Harness::start().await;
    let mut client = harness.client().await;

    let session_id = create(&mut client, "student-1", "uti-adult").await;

    let view = status(client.send(Command::Start { session_id }).await.unwrap());
    assert_eq!(view.status, SessionStatus::Active);
    assert_eq!(view.attempt, 1);
    assert_eq!(view.required_tasks.len(), 4);

    for item in ["nitrofurantoin-100", "paracetamol-500"] {
        let view = status(
            client
                .send(Command::CompleteTask {
                    session_id,
                    task_id: TaskId::new(format!("dispense:{}", item)),
                })
                .await
                .unwrap(),
        );
        assert_eq!(view.status, SessionStatus::Active);
    }

    let view = status(
        client
            .send(Command::Counsel {
                session_id,
                instructions: vec!["Take with food".into()],
            })
            .await
            .unwrap(),
    );
    assert_eq!(view.outstanding_tasks(), vec![&TaskId::new("billing")]);

    harness.clock.advance(Duration::from_secs(60));

    let view = status(
        client
            .send(Command::CompleteTask {
                session_id,
                task_id: TaskId::new("billing"),
            })
            .await
            .unwrap(),
    );
    assert_eq!(view.status, SessionStatus::Recovered);
    assert_eq!(view.elapsed, Duration::from_secs(60));

    // Terminal: the deadline passing changes nothing
    harness.clock.advance(Duration::from_secs(600));
    let view = status(client.send(Command::GetStatus { session_id }).await.unwrap());
    assert_eq!(view.status, SessionStatus::Recovered);

    harness.stop().await;
}

#[tokio::test]
async fn test_lost_session_recovery_budget() {
    let harness = Harness::start().await;
    let mut client = harness.client().await;

    let session_id = create(&mut client, "student-1", "otc-advice").await;
    client.request(Command::Start { session_id }).await.unwrap();

    harness.clock.advance(Duration::from_secs(121));

    let view = status(client.send(Command::GetStatus { session_id }).await.unwrap());
    assert_eq!(view.status, SessionStatus::Lost);
    assert_eq!(view.remaining, Duration::ZERO);

    let view = status(client.send(Command::Recover { session_id }).await.unwrap());
    assert_eq!(view.status, SessionStatus::Active);
    assert_eq!(view.attempt, 2);
    assert_eq!(view.recovery_tokens_remaining, 1);

    // Only lost sessions can be recovered
    let code = error_code(client.send(Command::Recover { session_id }).await.unwrap());
    assert_eq!(code, ErrorCode::NotLost);

    harness.clock.advance(Duration::from_secs(121));
    client.request(Command::GetStatus { session_id }).await.unwrap();
    client.request(Command::Recover { session_id }).await.unwrap();

    harness.clock.advance(Duration::from_secs(121));
    client.request(Command::GetStatus { session_id }).await.unwrap();
    let code = error_code(client.send(Command::Recover { session_id }).await.unwrap());
    assert_eq!(code, ErrorCode::RecoveryDenied);

    let budget = client
        .request(Command::GetRecoveryBudget {
            owner_id: OwnerId::new("student-1"),
        })
        .await
        .unwrap();
    assert!(matches!(
        budget,
        ResponsePayload::RecoveryBudget(b) if b.remaining == 0 && b.max_tokens == 2
    ));

    harness.stop().await;
}

#[tokio::test]
async fn test_subscriber_sees_scheduler_loss() {
    let harness = Harness::start().await;
    let mut events = harness.client().await.subscribe().await.unwrap();
    let mut client = harness.client().await;

    let session_id = create(&mut client, "student-2", "otc-advice").await;
    client.request(Command::Start { session_id }).await.unwrap();

    harness.clock.advance(Duration::from_secs(121));

    // No status call: the scheduler alone must end the attempt
    let lost = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.next().await.unwrap();
            if let EventPayload::SessionLost { session_id: id, .. } = event.payload {
                break id;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(lost, session_id);

    harness.stop().await;
}

#[tokio::test]
async fn test_rejected_requests() {
    let harness = Harness::start().await;
    let mut client = harness.client().await;

    let response = client
        .send(Command::CreateSession {
            owner_id: OwnerId::new("student-1"),
            subject_id: SubjectId::new("subject-7"),
            case_id: CaseId::new("no-such-case"),
        })
        .await
        .unwrap();
    assert_eq!(error_code(response), ErrorCode::UnknownCase);

    let response = client
        .send(Command::GetStatus {
            session_id: SessionId::new(),
        })
        .await
        .unwrap();
    assert_eq!(error_code(response), ErrorCode::UnknownSession);

    let session_id = create(&mut client, "student-1", "uti-adult").await;
    let response = client
        .send(Command::CompleteTask {
            session_id,
            task_id: TaskId::new("billing"),
        })
        .await
        .unwrap();
    assert_eq!(error_code(response), ErrorCode::SessionNotActive);

    client.request(Command::Start { session_id }).await.unwrap();
    let response = client.send(Command::Start { session_id }).await.unwrap();
    assert_eq!(error_code(response), ErrorCode::AlreadyStarted);

    let response = client
        .send(Command::Counsel {
            session_id,
            instructions: vec!["none".into(), "Take with food".into()],
        })
        .await
        .unwrap();
    assert_eq!(error_code(response), ErrorCode::InvalidCounselling);

    // Counselling cannot be ticked off without instructions
    let response = client
        .send(Command::CompleteTask {
            session_id,
            task_id: TaskId::new("counsel"),
        })
        .await
        .unwrap();
    assert_eq!(error_code(response), ErrorCode::InvalidCounselling);
    let view = status(client.send(Command::GetStatus { session_id }).await.unwrap());
    assert!(view.completed_tasks.is_empty());

    let response = raw_line(&harness.socket_path, "not json\n").await;
    assert_eq!(response.request_id, 0);
    assert_eq!(error_code(response), ErrorCode::InvalidRequest);

    harness.stop().await;
}

#[tokio::test]
async fn test_catalog_and_health() {
    let harness = Harness::start().await;
    let mut client = harness.client().await;

    match client.request(Command::ListCases).await.unwrap() {
        ResponsePayload::Cases(cases) => {
            assert_eq!(cases.len(), 2);
            assert_eq!(cases[1].case_id, CaseId::new("otc-advice"));
            assert_eq!(cases[1].duration_budget, Duration::from_secs(120));
        }
        other => panic!("expected cases, got {:?}", other),
    }

    let session_id = create(&mut client, "student-1", "uti-adult").await;
    client.request(Command::Start { session_id }).await.unwrap();

    match client.request(Command::GetHealth).await.unwrap() {
        ResponsePayload::Health(health) => {
            assert!(health.live);
            assert!(health.ready);
            assert!(health.catalog_loaded);
            assert_eq!(health.pending_deadlines, 1);
        }
        other => panic!("expected health, got {:?}", other),
    }

    assert!(matches!(
        client.request(Command::Ping).await.unwrap(),
        ResponsePayload::Pong
    ));

    harness.stop().await;
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("dispensad.db");

    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&db_path).unwrap());
    let harness = Harness::start_with(dir, store).await;
    let mut client = harness.client().await;

    let session_id = create(&mut client, "student-3", "otc-advice").await;
    client.request(Command::Start { session_id }).await.unwrap();
    harness.clock.advance(Duration::from_secs(121));
    client.request(Command::GetStatus { session_id }).await.unwrap();
    client.request(Command::Recover { session_id }).await.unwrap();
    drop(client);

    let dir = harness.stop().await;

    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&db_path).unwrap());
    let harness = Harness::start_with(dir, store).await;
    let mut client = harness.client().await;

    let view = status(client.send(Command::GetStatus { session_id }).await.unwrap());
    assert_eq!(view.attempt, 2);
    assert_eq!(view.recovery_tokens_remaining, 1);

    harness.stop().await;
}
