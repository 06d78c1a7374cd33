use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use warden_shared::{Error, Result};

use super::{Reason, Request, Response, ServiceState, UserState};

#[derive(Default)]
struct Shared {
    users: Mutex<HashMap<String, UserEntry>>,
    reasons: Mutex<HashMap<String, Reason>>,
    global_lock: Arc<Mutex<()>>,
}

struct UserEntry {
    state: UserState,
    lock: Arc<Mutex<()>>,
}

impl UserEntry {
    fn new(state: UserState) -> Self {
        Self {
            state,
            lock: Arc::new(Mutex::new(())),
        }
    }
}

/// The synchronizer server. Exactly one per deployment binds the socket;
/// its lifetime is owned by the process that started it.
pub struct StateServer {
    socket_path: PathBuf,
    accept_task: JoinHandle<()>,
}

impl StateServer {
    /// Binds the socket (unlinking a stale one from a previous session)
    /// and starts serving.
    pub async fn start(socket_path: PathBuf, key: String) -> Result<Self> {
        if socket_path.exists() {
            std::fs::remove_file(&socket_path).map_err(Error::unexpected)?;
            info!("removed the synchronizer socket from the previous session");
        }
        let listener = UnixListener::bind(&socket_path).map_err(Error::unexpected)?;
        let shared = Arc::new(Shared::default());

        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let shared = Arc::clone(&shared);
                        let key = key.clone();
                        tokio::spawn(async move {
                            if let Err(error) = handle_connection(stream, shared, &key).await {
                                debug!("synchronizer connection ended: {error}");
                            }
                        });
                    }
                    Err(error) => error!("synchronizer accept failed: {error}"),
                }
            }
        });

        debug!("the state synchronizer server is started");
        Ok(Self {
            socket_path,
            accept_task,
        })
    }

    /// Stops serving and removes the socket.
    pub fn close(&self) {
        self.accept_task.abort();
        let _ = std::fs::remove_file(&self.socket_path);
        debug!("the state synchronizer server is stopped");
    }
}

async fn handle_connection(
    stream: UnixStream,
    shared: Arc<Shared>,
    key: &str,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    // The first frame must carry the shared secret.
    if reader.read_line(&mut line).await? == 0 {
        return Ok(());
    }
    let presented: serde_json::Value = serde_json::from_str(line.trim()).unwrap_or_default();
    if presented.get("key").and_then(|value| value.as_str()) != Some(key) {
        warn!("a synchronizer peer presented a wrong key");
        write_response(
            &mut writer,
            &Response::Error {
                message: "authentication failed".into(),
            },
        )
        .await?;
        return Ok(());
    }
    write_response(&mut writer, &Response::Ok).await?;

    // Lock leases granted on this connection live until it closes.
    let mut leases: Vec<OwnedMutexGuard<()>> = Vec::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(trimmed) {
            Ok(request) => handle_request(request, &shared, &mut leases).await,
            Err(error) => Response::Error {
                message: format!("malformed request: {error}"),
            },
        };
        write_response(&mut writer, &response).await?;
    }
}

async fn write_response(
    writer: &mut (impl AsyncWriteExt + Unpin),
    response: &Response,
) -> std::io::Result<()> {
    let mut payload = serde_json::to_vec(response).unwrap_or_default();
    payload.push(b'\n');
    writer.write_all(&payload).await?;
    writer.flush().await
}

async fn handle_request(
    request: Request,
    shared: &Shared,
    leases: &mut Vec<OwnedMutexGuard<()>>,
) -> Response {
    match request {
        Request::Ping => Response::Ok,
        Request::LockGlobal => {
            let lock = Arc::clone(&shared.global_lock);
            leases.push(lock.lock_owned().await);
            Response::Locked
        }
        Request::LockUser { username } => {
            let lock = {
                let mut users = shared.users.lock().await;
                Arc::clone(
                    &users
                        .entry(username)
                        .or_insert_with(|| UserEntry::new(UserState::default()))
                        .lock,
                )
            };
            leases.push(lock.lock_owned().await);
            Response::Locked
        }
        Request::GetUser { username } => {
            let users = shared.users.lock().await;
            Response::User {
                state: users.get(&username).map(|entry| entry.state.clone()),
            }
        }
        Request::EnsureUser {
            username,
            synced,
            has_active_plan,
        } => {
            let mut users = shared.users.lock().await;
            users.entry(username).or_insert_with(|| {
                UserEntry::new(UserState {
                    synced,
                    has_active_plan,
                    services: HashMap::new(),
                })
            });
            Response::Ok
        }
        Request::SetSynced {
            username,
            synced,
            has_active_plan,
        } => {
            let mut users = shared.users.lock().await;
            let entry = users
                .entry(username)
                .or_insert_with(|| UserEntry::new(UserState::default()));
            entry.state.synced = synced;
            if let Some(has_active_plan) = has_active_plan {
                entry.state.has_active_plan = has_active_plan;
            }
            Response::Ok
        }
        Request::SetServiceState {
            username,
            service,
            state,
        } => {
            let mut users = shared.users.lock().await;
            let entry = users
                .entry(username)
                .or_insert_with(|| UserEntry::new(UserState::default()));
            match state {
                ServiceState::Unknown => entry.state.services.remove(&service),
                _ => entry.state.services.insert(service, state),
            };
            Response::Ok
        }
        Request::RemoveUser { username } => {
            shared.users.lock().await.remove(&username);
            shared.reasons.lock().await.remove(&username);
            Response::Ok
        }
        Request::ListUsers => {
            let users = shared.users.lock().await;
            Response::Users {
                users: users
                    .iter()
                    .map(|(username, entry)| (username.clone(), entry.state.clone()))
                    .collect(),
            }
        }
        Request::GetReason { username } => Response::Reason {
            reason: shared.reasons.lock().await.get(&username).copied(),
        },
        Request::SetReason { username, reason } => {
            shared.reasons.lock().await.insert(username, reason);
            Response::Ok
        }
        Request::TakeReason { username } => Response::Reason {
            reason: shared.reasons.lock().await.remove(&username),
        },
    }
}
