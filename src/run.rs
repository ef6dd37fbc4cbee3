//! The `run` subcommand's network front door: a minimal newline-delimited
//! JSON protocol over TCP wiring external producers to the judge pool and
//! session registry (SPEC_FULL.md §0). Not the web surface — no HTML, no
//! file upload, no localization; just enough to accept jobs and stream
//! verdicts back out.

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use arbiter_judge::lang::Language;
use arbiter_judge::model::{CustomTest, Submission};
use arbiter_judge::pool::Pool;
use arbiter_judge::session::{spawn_verdict_router, SessionRegistry};
use arbiter_judge::store::TestStore;

use crate::etc::Cfg;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Spec §3: `Submission.code` is bounded to 1 MiB.
const MAX_CODE_BYTES: usize = 1 << 20;

#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ClientMessage {
    Hello {
        session_id: String,
        password: String,
    },
    Submit {
        task: String,
        language: Language,
        code: String,
        key: String,
    },
    CustomTest {
        label: String,
        language: Language,
        code: String,
        input: String,
    },
    Logout,
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ServerMessage<'a> {
    Authenticated,
    Verdict { verdict: &'a arbiter_judge::verdict::TaskVerdict },
    Error { message: String },
}

pub async fn run(cfg: Cfg) -> Result<(), Box<dyn Error>> {
    let store = Arc::new(TestStore::open(std::path::Path::new(&cfg.contests))?);
    let pool = Pool::start(cfg.workers, cfg.sandbox.clone(), store.clone());
    let registry = SessionRegistry::new();
    spawn_verdict_router(registry.clone(), pool.clone());

    let addr = if cfg.addr.starts_with(':') {
        format!("0.0.0.0{}", cfg.addr)
    } else {
        cfg.addr.clone()
    };
    let listener = TcpListener::bind(&addr).await?;
    info!("listening on {addr}");

    loop {
        let (socket, peer) = listener.accept().await?;
        info!("accepted connection from {peer}");
        let pool = pool.clone();
        let registry = registry.clone();
        let store = store.clone();
        let testing = cfg.testing;
        tokio::spawn(async move {
            if let Err(e) = handle_connection(socket, pool, registry, store, testing).await {
                warn!("connection from {peer} ended: {e}");
            }
        });
    }
}

type WriteHalf = Arc<tokio::sync::Mutex<tokio::net::tcp::OwnedWriteHalf>>;

async fn handle_connection(
    socket: TcpStream,
    pool: Arc<Pool>,
    registry: Arc<SessionRegistry>,
    store: Arc<TestStore>,
    testing: bool,
) -> Result<(), Box<dyn Error>> {
    let (read_half, write_half) = socket.into_split();
    let write_half: WriteHalf = Arc::new(tokio::sync::Mutex::new(write_half));
    let mut lines = BufReader::new(read_half).lines();

    let session_id = loop {
        let Some(line) = lines.next_line().await? else {
            return Ok(());
        };
        match serde_json::from_str::<ClientMessage>(&line) {
            Ok(ClientMessage::Hello { session_id, password }) => {
                if testing || store.authenticate(&password).unwrap_or(false) {
                    send(&write_half, &ServerMessage::Authenticated).await?;
                    break session_id;
                }
                send(&write_half, &ServerMessage::Error { message: "authentication failed".into() }).await?;
            }
            Ok(_) => {
                send(&write_half, &ServerMessage::Error { message: "expected hello".into() }).await?;
            }
            Err(e) => {
                send(&write_half, &ServerMessage::Error { message: e.to_string() }).await?;
            }
        }
    };

    registry.session(&session_id);
    let streamer = tokio::spawn(stream_verdicts(session_id.clone(), registry.clone(), write_half.clone()));

    while let Some(line) = lines.next_line().await? {
        let message: ClientMessage = match serde_json::from_str(&line) {
            Ok(m) => m,
            Err(e) => {
                error!("malformed client message from session {session_id}: {e}");
                continue;
            }
        };

        match message {
            ClientMessage::Hello { .. } => {}
            ClientMessage::Submit { task, language, code, key } => {
                if code.len() > MAX_CODE_BYTES {
                    send(
                        &write_half,
                        &ServerMessage::Error { message: format!("code exceeds {MAX_CODE_BYTES} bytes") },
                    )
                    .await?;
                    continue;
                }
                let submission = Submission {
                    id: 0,
                    session_id: session_id.clone(),
                    when: std::time::SystemTime::now(),
                    task_ref: task,
                    code: code.into_bytes(),
                    language,
                    key: key.into_bytes(),
                };
                let _ = pool.submit(submission).await;
            }
            ClientMessage::CustomTest { label, language, code, input } => {
                if code.len() > MAX_CODE_BYTES {
                    send(
                        &write_half,
                        &ServerMessage::Error { message: format!("code exceeds {MAX_CODE_BYTES} bytes") },
                    )
                    .await?;
                    continue;
                }
                let test = CustomTest {
                    id: 0,
                    session_id: session_id.clone(),
                    when: std::time::SystemTime::now(),
                    label,
                    code: code.into_bytes(),
                    language,
                    input: input.into_bytes(),
                };
                let _ = pool.submit_custom_test(test).await;
            }
            ClientMessage::Logout => {
                registry.logout(&session_id);
                break;
            }
        }
    }

    streamer.abort();
    Ok(())
}

/// Polls the session's accumulated verdict lists and forwards anything new
/// to the client; `Session` only exposes read-only snapshots, so this is
/// simpler than threading a notification channel through the registry.
async fn stream_verdicts(session_id: String, registry: Arc<SessionRegistry>, write_half: WriteHalf) {
    let mut sent_submissions = 0usize;
    let mut sent_custom_tests = 0usize;

    loop {
        tokio::time::sleep(POLL_INTERVAL).await;
        let session = registry.session(&session_id);
        let session = session.lock().expect("session poisoned");

        for verdict in session.submissions().iter().skip(sent_submissions) {
            if send(&write_half, &ServerMessage::Verdict { verdict }).await.is_err() {
                return;
            }
        }
        sent_submissions = session.submissions().len();

        for verdict in session.custom_tests().iter().skip(sent_custom_tests) {
            if send(&write_half, &ServerMessage::Verdict { verdict }).await.is_err() {
                return;
            }
        }
        sent_custom_tests = session.custom_tests().len();
    }
}

async fn send(write_half: &WriteHalf, message: &ServerMessage<'_>) -> Result<(), Box<dyn Error>> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    write_half.lock().await.write_all(&line).await?;
    Ok(())
}
