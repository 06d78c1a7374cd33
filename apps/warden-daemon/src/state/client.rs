use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{
    unix::{OwnedReadHalf, OwnedWriteHalf},
    UnixStream,
};
use tracing::debug;

use warden_shared::{Error, Result};

use super::{Reason, Request, Response, ServiceState, UserState};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(10);
const CALL_TIMEOUT: Duration = Duration::from_secs(3);

/// Client of the state synchronizer server.
///
/// Every operation takes a `silent` flag: when the synchronizer is
/// unreachable a silent call quietly does nothing (returning `None`)
/// instead of raising `StateSynchronizerTimeout`. This is what lets a
/// peer keep serving read-only work while the owning daemon is down.
#[derive(Debug, Clone)]
pub struct StateHandle {
    socket_path: PathBuf,
    key: String,
    connected: Arc<AtomicBool>,
}

/// A held cross-process lock. The lease is the connection itself, so
/// dropping the guard (or dying with it) releases the lock.
#[derive(Debug)]
pub struct StateLock {
    _reader: OwnedReadHalf,
    _writer: OwnedWriteHalf,
}

impl StateHandle {
    pub fn new(socket_path: PathBuf, key: String) -> Self {
        Self {
            socket_path,
            key,
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Establishes the connection, retrying for up to `timeout` unless
    /// `skip_retry` asks for a single attempt and a quiet degrade.
    pub async fn connect(&self, timeout: Duration, skip_retry: bool) -> Result<()> {
        if self.connected() {
            return Ok(());
        }
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.call(&Request::Ping).await {
                Ok(_) => {
                    self.connected.store(true, Ordering::Relaxed);
                    debug!("connected to the state synchronizer server");
                    return Ok(());
                }
                Err(error) => {
                    if skip_retry {
                        debug!("retrying to connect to the state synchronizer server is skipped");
                        return Ok(());
                    }
                    if tokio::time::Instant::now() >= deadline {
                        return Err(error);
                    }
                    tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                }
            }
        }
    }

    async fn open(&self) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
        let connect = async {
            let stream = UnixStream::connect(&self.socket_path).await?;
            let (reader, mut writer) = stream.into_split();
            let mut reader = BufReader::new(reader);

            let mut auth = serde_json::to_vec(&serde_json::json!({ "key": self.key }))
                .unwrap_or_default();
            auth.push(b'\n');
            writer.write_all(&auth).await?;
            writer.flush().await?;
            let mut line = String::new();
            reader.read_line(&mut line).await?;
            Ok::<_, std::io::Error>((reader, writer, line))
        };
        let (reader, writer, line) = tokio::time::timeout(CONNECT_TIMEOUT, connect)
            .await
            .map_err(|_| Error::StateSynchronizerTimeout)?
            .map_err(|_| Error::StateSynchronizerTimeout)?;
        match serde_json::from_str::<Response>(line.trim()) {
            Ok(Response::Ok) => Ok((reader, writer)),
            Ok(Response::Error { message }) => Err(Error::Unexpected(format!(
                "the state synchronizer rejected the connection: {message}"
            ))),
            _ => Err(Error::StateSynchronizerTimeout),
        }
    }

    async fn call(&self, request: &Request) -> Result<Response> {
        let (mut reader, mut writer) = self.open().await?;
        let exchange = async {
            let mut payload = serde_json::to_vec(request).unwrap_or_default();
            payload.push(b'\n');
            writer.write_all(&payload).await?;
            writer.flush().await?;
            let mut line = String::new();
            reader.read_line(&mut line).await?;
            Ok::<_, std::io::Error>(line)
        };
        let line = tokio::time::timeout(CALL_TIMEOUT, exchange)
            .await
            .map_err(|_| Error::StateSynchronizerTimeout)?
            .map_err(|_| Error::StateSynchronizerTimeout)?;
        match serde_json::from_str::<Response>(line.trim()) {
            Ok(Response::Error { message }) => Err(Error::Unexpected(message)),
            Ok(response) => Ok(response),
            Err(_) => Err(Error::StateSynchronizerTimeout),
        }
    }

    /// Runs a request with the silent-degrade contract applied.
    async fn op(&self, request: Request, silent: bool) -> Result<Option<Response>> {
        if !self.connected() {
            if silent {
                return Ok(None);
            }
            return Err(Error::StateSynchronizerTimeout);
        }
        match self.call(&request).await {
            Ok(response) => Ok(Some(response)),
            Err(_) if silent => Ok(None),
            Err(error) => Err(error),
        }
    }

    /// Acquires the user's cross-process lock. The caller must already
    /// hold the matching in-process lock.
    pub async fn lock_user(&self, username: &str, silent: bool) -> Result<Option<StateLock>> {
        self.lock(
            Request::LockUser {
                username: username.to_owned(),
            },
            silent,
        )
        .await
    }

    /// Acquires the global lock guarding users-map extension.
    pub async fn lock_global(&self, silent: bool) -> Result<Option<StateLock>> {
        self.lock(Request::LockGlobal, silent).await
    }

    async fn lock(&self, request: Request, silent: bool) -> Result<Option<StateLock>> {
        if !self.connected() {
            if silent {
                return Ok(None);
            }
            return Err(Error::StateSynchronizerTimeout);
        }
        let acquire = async {
            let (mut reader, mut writer) = self.open().await?;
            let mut payload = serde_json::to_vec(&request).unwrap_or_default();
            payload.push(b'\n');
            writer
                .write_all(&payload)
                .await
                .map_err(|_| Error::StateSynchronizerTimeout)?;
            writer
                .flush()
                .await
                .map_err(|_| Error::StateSynchronizerTimeout)?;
            // No deadline here: lock acquisition legitimately waits for
            // the current holder.
            let mut line = String::new();
            reader
                .read_line(&mut line)
                .await
                .map_err(|_| Error::StateSynchronizerTimeout)?;
            match serde_json::from_str::<Response>(line.trim()) {
                Ok(Response::Locked) => Ok(StateLock {
                    _reader: reader.into_inner(),
                    _writer: writer,
                }),
                _ => Err(Error::StateSynchronizerTimeout),
            }
        };
        match acquire.await {
            Ok(lock) => Ok(Some(lock)),
            Err(_) if silent => Ok(None),
            Err(error) => Err(error),
        }
    }

    pub async fn get_user(&self, username: &str, silent: bool) -> Result<Option<UserState>> {
        match self
            .op(
                Request::GetUser {
                    username: username.to_owned(),
                },
                silent,
            )
            .await?
        {
            Some(Response::User { state }) => Ok(state),
            _ => Ok(None),
        }
    }

    pub async fn ensure_user(
        &self,
        username: &str,
        synced: bool,
        has_active_plan: bool,
        silent: bool,
    ) -> Result<()> {
        self.op(
            Request::EnsureUser {
                username: username.to_owned(),
                synced,
                has_active_plan,
            },
            silent,
        )
        .await?;
        Ok(())
    }

    pub async fn set_synced(
        &self,
        username: &str,
        synced: bool,
        has_active_plan: Option<bool>,
        silent: bool,
    ) -> Result<()> {
        self.op(
            Request::SetSynced {
                username: username.to_owned(),
                synced,
                has_active_plan,
            },
            silent,
        )
        .await?;
        Ok(())
    }

    pub async fn set_service_state(
        &self,
        username: &str,
        service: &str,
        state: ServiceState,
        silent: bool,
    ) -> Result<()> {
        self.op(
            Request::SetServiceState {
                username: username.to_owned(),
                service: service.to_owned(),
                state,
            },
            silent,
        )
        .await?;
        Ok(())
    }

    pub async fn remove_user(&self, username: &str, silent: bool) -> Result<()> {
        self.op(
            Request::RemoveUser {
                username: username.to_owned(),
            },
            silent,
        )
        .await?;
        Ok(())
    }

    pub async fn list_users(&self, silent: bool) -> Result<Option<HashMap<String, UserState>>> {
        match self.op(Request::ListUsers, silent).await? {
            Some(Response::Users { users }) => Ok(Some(users)),
            _ => Ok(None),
        }
    }

    pub async fn get_reason(&self, username: &str, silent: bool) -> Result<Option<Reason>> {
        match self
            .op(
                Request::GetReason {
                    username: username.to_owned(),
                },
                silent,
            )
            .await?
        {
            Some(Response::Reason { reason }) => Ok(reason),
            _ => Ok(None),
        }
    }

    pub async fn set_reason(&self, username: &str, reason: Reason, silent: bool) -> Result<()> {
        self.op(
            Request::SetReason {
                username: username.to_owned(),
                reason,
            },
            silent,
        )
        .await?;
        Ok(())
    }

    pub async fn take_reason(&self, username: &str, silent: bool) -> Result<Option<Reason>> {
        match self
            .op(
                Request::TakeReason {
                    username: username.to_owned(),
                },
                silent,
            )
            .await?
        {
            Some(Response::Reason { reason }) => Ok(reason),
            _ => Ok(None),
        }
    }
}
