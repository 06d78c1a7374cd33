use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use warden_shared::{Error, Result, Traffic};

use crate::config::Config;
use crate::services::Service;

// Exit codes of the broker protocol.
const EXIT_OK: u8 = b'0';
const EXIT_USER_EXIST: u8 = b'3';
const EXIT_USER_NOT_EXIST: u8 = b'4';

#[derive(Default)]
struct Counters {
    loaded: bool,
    last_boot: Option<i64>,
    previous: HashMap<String, Traffic>,
}

/// Adapter for the VPN data plane, speaking the line command protocol of
/// its adjunct broker: one UNIX stream per command, a single exit-code
/// byte back, then an optional JSON payload.
///
/// The VPN cannot reset its counters, so the adapter remembers the last
/// absolute counters per user and reports deltas; the memory is dropped
/// whenever the broker reports a different boot time.
pub struct VpnService {
    socket_path: PathBuf,
    timeout: Duration,
    counters: Mutex<Counters>,
}

impl VpnService {
    pub fn new(config: &Config) -> Self {
        Self::with_socket(
            config.main.vpn_broker_socket_path.clone(),
            Duration::from_secs(config.main.service_timeout),
        )
    }

    pub(crate) fn with_socket(socket_path: PathBuf, timeout: Duration) -> Self {
        Self {
            socket_path,
            timeout,
            counters: Mutex::new(Counters::default()),
        }
    }

    /// Sends one command to the broker. EOF before the exit-code byte is
    /// a timeout; exit codes 3 and 4 are the membership errors.
    async fn exec(&self, command: &str, username: &str) -> Result<Option<Value>> {
        let exchange = async {
            let mut stream = loop {
                match UnixStream::connect(&self.socket_path).await {
                    Ok(stream) => break stream,
                    Err(error)
                        if matches!(
                            error.kind(),
                            std::io::ErrorKind::NotFound
                                | std::io::ErrorKind::ConnectionRefused
                                | std::io::ErrorKind::WouldBlock
                        ) =>
                    {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                    Err(error) => return Err(Error::unexpected(error)),
                }
            };
            stream
                .write_all(command.as_bytes())
                .await
                .map_err(|_| Error::VpnTimeout)?;
            // Half-close to signal the end of the command.
            stream.shutdown().await.map_err(|_| Error::VpnTimeout)?;

            let mut exit_code = [0u8; 1];
            if stream.read_exact(&mut exit_code).await.is_err() {
                return Err(Error::VpnTimeout);
            }
            match exit_code[0] {
                EXIT_OK => {
                    let mut output = Vec::new();
                    stream
                        .read_to_end(&mut output)
                        .await
                        .map_err(|_| Error::VpnTimeout)?;
                    if output.is_empty() {
                        Ok(None)
                    } else {
                        serde_json::from_slice(&output)
                            .map(Some)
                            .map_err(Error::unexpected)
                    }
                }
                EXIT_USER_EXIST => Err(Error::UserExist(username.to_owned())),
                EXIT_USER_NOT_EXIST => Err(Error::UserNotExist(username.to_owned())),
                other => Err(Error::Unexpected(format!(
                    "the VPN broker returned unknown exit code {}",
                    other as char
                ))),
            }
        };
        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| Error::VpnTimeout)?
    }

    /// Whether the VPN was restarted since the previous check. `None` on
    /// the very first observation.
    async fn is_restarted(&self, counters: &mut Counters) -> Result<Option<bool>> {
        let Some(status) = self.exec("show_status", "").await? else {
            return Ok(None);
        };
        let Some(current_boot) = status.get("raw_up_since").and_then(Value::as_i64) else {
            return Ok(None);
        };
        match counters.last_boot {
            None => {
                counters.last_boot = Some(current_boot);
                Ok(None)
            }
            Some(last_boot) if last_boot != current_boot => {
                counters.last_boot = Some(current_boot);
                Ok(Some(true))
            }
            Some(_) => Ok(Some(false)),
        }
    }

    async fn read_sessions(&self) -> Result<HashMap<String, Traffic>> {
        let mut absolute: HashMap<String, Traffic> = HashMap::new();
        let sessions = self.exec("show_users", "").await?;
        for session in sessions.as_ref().and_then(Value::as_array).into_iter().flatten() {
            // The username is not assigned until authentication finishes.
            if session.get("State").and_then(Value::as_str) == Some("pre-auth") {
                continue;
            }
            let Some(username) = session.get("Username").and_then(Value::as_str) else {
                continue;
            };
            let entry = absolute.entry(username.to_owned()).or_default();
            entry.uplink += json_int(session.get("TX"));
            entry.downlink += json_int(session.get("RX"));
        }
        Ok(absolute)
    }

    async fn collect(&self, counters: &mut Counters, reset: bool) -> Result<HashMap<String, Traffic>> {
        let absolute = self.read_sessions().await?;
        let mut traffic = HashMap::with_capacity(absolute.len());
        for (username, current) in absolute {
            let reported = match counters.previous.entry(username.clone()) {
                Entry::Vacant(entry) => {
                    entry.insert(if reset { current } else { Traffic::default() });
                    current
                }
                Entry::Occupied(mut entry) => {
                    let previous = entry.get_mut();
                    let mut uplink = current.uplink - previous.uplink;
                    let mut downlink = current.downlink - previous.downlink;
                    // A negative delta means the client reconnected and
                    // the absolute counter started over.
                    if uplink < 0 {
                        uplink = current.uplink;
                    }
                    if downlink < 0 {
                        downlink = current.downlink;
                    }
                    if reset {
                        *previous = current;
                    }
                    Traffic { uplink, downlink }
                }
            };
            traffic.insert(username, reported);
        }
        Ok(traffic)
    }
}

fn json_int(value: Option<&Value>) -> i64 {
    match value {
        Some(Value::Number(number)) => number.as_i64().unwrap_or(0),
        Some(Value::String(text)) => text.parse().unwrap_or(0),
        _ => 0,
    }
}

#[async_trait]
impl Service for VpnService {
    fn name(&self) -> &'static str {
        "vpn"
    }

    fn alias(&self) -> &'static str {
        "VPN server"
    }

    fn timeout_error(&self) -> Error {
        Error::VpnTimeout
    }

    async fn add_user(&self, username: &str, uuid: &Uuid) -> Result<()> {
        self.exec(&format!("add_user {username} {uuid}"), username)
            .await?;
        debug!("user '{username}' is added to the VPN");
        Ok(())
    }

    async fn delete_user(&self, username: &str) -> Result<()> {
        self.exec(&format!("delete_user {username}"), username)
            .await?;
        debug!("user '{username}' is deleted from the VPN");
        Ok(())
    }

    async fn users_traffic_usage(&self, reset: bool) -> Result<HashMap<String, Traffic>> {
        let mut counters = self.counters.lock().await;
        if !counters.loaded {
            counters.loaded = true;
            if reset {
                // The first read only primes the counter memory so stats
                // recorded before this point are not charged to anyone.
                if let Err(error) = self.collect(&mut counters, reset).await {
                    counters.loaded = false;
                    return Err(error);
                }
            }
        } else if self.is_restarted(&mut counters).await? == Some(true) {
            counters.previous.clear();
        }
        self.collect(&mut counters, reset).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_counters_accept_numbers_and_strings() {
        assert_eq!(json_int(Some(&serde_json::json!(42))), 42);
        assert_eq!(json_int(Some(&serde_json::json!("42"))), 42);
        assert_eq!(json_int(Some(&serde_json::json!(null))), 0);
        assert_eq!(json_int(None), 0);
    }
}
