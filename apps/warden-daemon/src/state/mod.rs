//! Cross-process reconciliation state, shared through a synchronizer
//! server owned by the main daemon.
//!
//! The server task owns the map and serves newline-delimited JSON over
//! `<temp_path>/manager.sock`; peers authenticate with the deployment's
//! API key. Lock leases are tied to the connection that acquired them,
//! so a dying peer can never wedge the others.

mod client;
mod server;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub use client::{StateHandle, StateLock};
pub use server::StateServer;

/// Why the next desired transition for a user exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    UpdatedPlan,
    ExpiredPlan,
    ReservedPlan,
    Synchronization,
    ZombieUser,
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Reason::UpdatedPlan => "updated plan",
            Reason::ExpiredPlan => "expired plan",
            Reason::ReservedPlan => "reserved plan activation",
            Reason::Synchronization => "catalog synchronization",
            Reason::ZombieUser => "user doesn't exist in the catalog",
        })
    }
}

/// Last-observed result of the most recent transition against a service,
/// not a desire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    #[default]
    Unknown,
    Deleted,
    Added,
}

/// Per-user reconciliation record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserState {
    pub synced: bool,
    pub has_active_plan: bool,
    #[serde(default)]
    pub services: HashMap<String, ServiceState>,
}

impl UserState {
    pub fn service(&self, name: &str) -> ServiceState {
        self.services.get(name).copied().unwrap_or_default()
    }
}

/// Wire requests understood by the synchronizer server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request {
    Ping,
    /// Blocks until the global lock is granted; released when the
    /// connection closes.
    LockGlobal,
    /// Blocks until the user's lock is granted; released when the
    /// connection closes.
    LockUser {
        username: String,
    },
    GetUser {
        username: String,
    },
    /// Creates the user's record if absent.
    EnsureUser {
        username: String,
        synced: bool,
        has_active_plan: bool,
    },
    SetSynced {
        username: String,
        synced: bool,
        has_active_plan: Option<bool>,
    },
    SetServiceState {
        username: String,
        service: String,
        state: ServiceState,
    },
    RemoveUser {
        username: String,
    },
    ListUsers,
    GetReason {
        username: String,
    },
    SetReason {
        username: String,
        reason: Reason,
    },
    TakeReason {
        username: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
enum Response {
    Ok,
    Locked,
    User { state: Option<UserState> },
    Users { users: HashMap<String, UserState> },
    Reason { reason: Option<Reason> },
    Error { message: String },
}
