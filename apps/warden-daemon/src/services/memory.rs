//! In-memory stand-in for a data plane, used by the reconciliation and
//! monitoring tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use warden_shared::{Error, Result, Traffic};

use crate::services::Service;

#[derive(Default)]
struct Inner {
    members: HashMap<String, Uuid>,
    pending_traffic: HashMap<String, Traffic>,
    calls: Vec<String>,
    fail_with_timeout: bool,
}

pub struct MemoryService {
    name: &'static str,
    timeout_error: Error,
    stale_traffic: bool,
    inner: Mutex<Inner>,
}

impl MemoryService {
    pub fn proxy() -> Self {
        Self {
            name: "proxy",
            timeout_error: Error::ProxyTimeout,
            stale_traffic: true,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn vpn() -> Self {
        Self {
            name: "vpn",
            timeout_error: Error::VpnTimeout,
            stale_traffic: false,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Makes every subsequent call fail with this service's timeout.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.lock().unwrap().fail_with_timeout = unreachable;
    }

    /// Queues traffic to be reported by the next `users_traffic_usage`.
    pub fn report_traffic(&self, username: &str, uplink: i64, downlink: i64) {
        self.inner
            .lock()
            .unwrap()
            .pending_traffic
            .insert(username.to_owned(), Traffic { uplink, downlink });
    }

    pub fn has_member(&self, username: &str) -> bool {
        self.inner.lock().unwrap().members.contains_key(username)
    }

    /// Every mutating call in order, e.g. `add alice` / `delete ghost`.
    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().calls.clone()
    }
}

#[async_trait]
impl Service for MemoryService {
    fn name(&self) -> &'static str {
        self.name
    }

    fn alias(&self) -> &'static str {
        self.name
    }

    fn reports_stale_traffic(&self) -> bool {
        self.stale_traffic
    }

    fn timeout_error(&self) -> Error {
        self.timeout_error.clone()
    }

    async fn add_user(&self, username: &str, uuid: &Uuid) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_with_timeout {
            return Err(self.timeout_error.clone());
        }
        inner.calls.push(format!("add {username}"));
        if inner.members.contains_key(username) {
            return Err(Error::UserExist(username.to_owned()));
        }
        inner.members.insert(username.to_owned(), *uuid);
        Ok(())
    }

    async fn delete_user(&self, username: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_with_timeout {
            return Err(self.timeout_error.clone());
        }
        inner.calls.push(format!("delete {username}"));
        if inner.members.remove(username).is_none() {
            return Err(Error::UserNotExist(username.to_owned()));
        }
        Ok(())
    }

    async fn users_traffic_usage(&self, _reset: bool) -> Result<HashMap<String, Traffic>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_with_timeout {
            return Err(self.timeout_error.clone());
        }
        Ok(std::mem::take(&mut inner.pending_traffic))
    }
}
