use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use warden_db::models::{Snapshot, SnapshotReservedPlan};
use warden_db::{validate_username, Catalog, PlanUpdate};
use warden_shared::{Credentials, Error, Result};

use crate::services::Service;
use crate::state::{Reason, ServiceState, StateHandle, StateLock};

/// Brings live service membership in line with the catalog.
///
/// This is the only component that touches both the services and the
/// state table. Per-user mutations run under two locks taken in order:
/// the in-process cooperative lock first, then the cross-process lock.
pub struct Reconciler {
    catalog: Catalog,
    services: Vec<Arc<dyn Service>>,
    state: StateHandle,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// A plan mutation requested by a caller, applied to the catalog and
/// then reflected to the services.
#[derive(Debug, Clone, Default)]
pub struct PlanChange {
    pub id: Option<i64>,
    pub start_date: Option<DateTime<Utc>>,
    pub duration: Option<i64>,
    pub traffic: Option<i64>,
    pub extra_traffic: Option<i64>,
    pub reset_extra_traffic: bool,
    pub preserve_traffic_usage: bool,
}

impl PlanChange {
    fn sets_extra_traffic(&self) -> bool {
        self.extra_traffic.is_some() || self.reset_extra_traffic
    }

    fn sets_plan_fields(&self) -> bool {
        self.start_date.is_some()
            || self.duration.is_some()
            || self.traffic.is_some()
            || self.preserve_traffic_usage
    }
}

/// Scoped pair of per-user locks. Field order matters: the
/// cross-process lease is released before the in-process lock.
struct UserGuard {
    _remote: Option<StateLock>,
    _local: OwnedMutexGuard<()>,
}

impl Reconciler {
    pub fn new(catalog: Catalog, services: Vec<Arc<dyn Service>>, state: StateHandle) -> Self {
        Self {
            catalog,
            services,
            state,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn services(&self) -> &[Arc<dyn Service>] {
        &self.services
    }

    pub fn state(&self) -> &StateHandle {
        &self.state
    }

    /// Acquires the user's in-process lock, then the cross-process one.
    /// Holders must limit themselves to the planned catalog and service
    /// operations; any other suspendable call risks lock inversion.
    async fn lock_user(&self, username: &str, silent: bool) -> Result<UserGuard> {
        let lock = {
            let mut locks = self.locks.lock().unwrap();
            Arc::clone(locks.entry(username.to_owned()).or_default())
        };
        let local = lock.lock_owned().await;
        let remote = self.state.lock_user(username, silent).await?;
        Ok(UserGuard {
            _remote: remote,
            _local: local,
        })
    }

    async fn add_by_service(
        &self,
        service: &Arc<dyn Service>,
        username: &str,
        uuid: &Uuid,
        reason: Option<Reason>,
        quiet: bool,
        known: ServiceState,
    ) -> Result<()> {
        if known != ServiceState::Added {
            match service.add_user(username, uuid).await {
                Ok(()) => {
                    if let Some(reason) = reason {
                        info!("added user '{username}' to '{}' due to {reason}", service.alias());
                    }
                }
                // The user already being there is the desired outcome.
                Err(Error::UserExist(_)) => {
                    if !quiet {
                        debug!("tried to add existent user '{username}' to '{}'", service.alias());
                    }
                }
                Err(error) => return Err(error),
            }
        }
        self.state
            .set_service_state(username, service.name(), ServiceState::Added, true)
            .await
    }

    async fn delete_by_service(
        &self,
        service: &Arc<dyn Service>,
        username: &str,
        reason: Option<Reason>,
        quiet: bool,
        known: ServiceState,
    ) -> Result<()> {
        if known != ServiceState::Deleted {
            match service.delete_user(username).await {
                Ok(()) => {
                    if let Some(reason) = reason {
                        info!(
                            "removed user '{username}' from '{}' due to {reason}",
                            service.alias()
                        );
                    }
                }
                Err(Error::UserNotExist(_)) => {
                    if !quiet {
                        debug!(
                            "tried to remove non-existent user '{username}' from '{}'",
                            service.alias()
                        );
                    }
                }
                Err(error) => return Err(error),
            }
        }
        self.state
            .set_service_state(username, service.name(), ServiceState::Deleted, true)
            .await
    }

    /// Adds the user to every enabled service under locks, recording the
    /// outcome in the state table.
    pub async fn add(
        &self,
        username: &str,
        uuid: &Uuid,
        reason: Option<Reason>,
        silent: bool,
    ) -> Result<()> {
        // Without a reachable synchronizer (a client that connected with
        // skip_retry) the state bookkeeping quietly degrades while the
        // service transitions still run.
        let quiet_state = silent || !self.state.connected();
        let _guard = self.lock_user(username, quiet_state).await?;
        self.state
            .ensure_user(username, false, false, quiet_state)
            .await?;
        let known = self
            .state
            .get_user(username, quiet_state)
            .await?
            .unwrap_or_default();

        let results = join_all(self.services.iter().map(|service| {
            self.add_by_service(
                service,
                username,
                uuid,
                reason,
                silent,
                known.service(service.name()),
            )
        }))
        .await;
        let causes: Vec<Error> = results.into_iter().filter_map(Result::err).collect();
        if !causes.is_empty() {
            self.state.set_synced(username, false, None, true).await?;
            if let Some(reason) = reason {
                self.state.set_reason(username, reason, true).await?;
            }
            return Err(Error::aggregate(
                format!("failed to add user '{username}' to the services"),
                causes,
                None,
            ));
        }

        self.state
            .set_synced(username, true, Some(true), true)
            .await?;
        self.state.take_reason(username, true).await?;
        Ok(())
    }

    /// Deletes the user from every enabled service under locks. With
    /// `permanently`, the state and reason entries are dropped as well.
    pub async fn delete(
        &self,
        username: &str,
        reason: Option<Reason>,
        silent: bool,
        permanently: bool,
    ) -> Result<()> {
        let quiet_state = silent || !self.state.connected();
        let _guard = self.lock_user(username, quiet_state).await?;
        let known = self
            .state
            .get_user(username, quiet_state)
            .await?
            .unwrap_or_default();

        let results = join_all(self.services.iter().map(|service| {
            self.delete_by_service(
                service,
                username,
                reason,
                silent,
                known.service(service.name()),
            )
        }))
        .await;
        let causes: Vec<Error> = results.into_iter().filter_map(Result::err).collect();
        if !causes.is_empty() {
            self.state.set_synced(username, false, None, true).await?;
            if let Some(reason) = reason {
                self.state.set_reason(username, reason, true).await?;
            }
            return Err(Error::aggregate(
                format!("failed to delete user '{username}' from the services"),
                causes,
                None,
            ));
        }

        if permanently {
            self.state.remove_user(username, true).await?;
        } else {
            self.state
                .set_synced(username, true, Some(false), true)
                .await?;
            self.state.take_reason(username, true).await?;
        }
        Ok(())
    }

    /// Deletes a user the catalog does not know from a single service.
    /// No locks: zombies have no state entry to serialize on.
    pub async fn delete_zombie(&self, service: &Arc<dyn Service>, username: &str) -> Result<()> {
        let quiet = service.reports_stale_traffic();
        match service.delete_user(username).await {
            Ok(()) => {
                info!(
                    "removed user '{username}' from '{}' due to {}",
                    service.alias(),
                    Reason::ZombieUser
                );
                Ok(())
            }
            Err(Error::UserNotExist(_)) => {
                if !quiet {
                    debug!(
                        "tried to remove non-existent user '{username}' from '{}'",
                        service.alias()
                    );
                }
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    /// Deletes an expired user from a single service, under locks.
    pub async fn expire_from_service(
        &self,
        service: &Arc<dyn Service>,
        username: &str,
        quiet: bool,
    ) -> Result<()> {
        let _guard = self.lock_user(username, true).await?;
        let known = self
            .state
            .get_user(username, true)
            .await?
            .unwrap_or_default();
        self.delete_by_service(
            service,
            username,
            Some(Reason::ExpiredPlan),
            quiet,
            known.service(service.name()),
        )
        .await
    }

    /// Creates the user in the catalog, then adds it to the services.
    ///
    /// Without `force` a service failure rolls the catalog row back and
    /// the original aggregate propagates. With `force` the row is kept
    /// and the raised `SynchronizationError` carries the credentials in
    /// its payload so the caller can still record them.
    pub async fn add_user(&self, username: &str, force: bool) -> Result<Credentials> {
        let credentials = self.catalog.add_user(username).await?;
        match self
            .add(&credentials.username, &credentials.uuid, None, false)
            .await
        {
            Ok(()) => {
                info!("user '{}' is created", credentials.username);
                Ok(credentials)
            }
            Err(cause) if force => {
                let error = Error::aggregate(
                    format!(
                        "failed to add user '{}' to the services",
                        credentials.username
                    ),
                    vec![cause],
                    serde_json::to_value(&credentials).ok(),
                );
                warn!("{error}");
                info!("user '{}' is created", credentials.username);
                Err(error)
            }
            Err(cause) => {
                if let Err(rollback) = self.catalog.delete_user(&credentials.username).await {
                    error!(
                        "failed to roll back the catalog row for user '{}': {rollback}",
                        credentials.username
                    );
                }
                let _ = self
                    .delete(&credentials.username, None, true, true)
                    .await;
                error!("failed to create user '{}'", credentials.username);
                Err(cause)
            }
        }
    }

    /// Deletes the user from the catalog, then from the services.
    ///
    /// Without `force` a service failure restores the catalog row (and
    /// its reserved plan and history) and the aggregate propagates.
    pub async fn delete_user(&self, username: &str, force: bool) -> Result<()> {
        let username = validate_username(username)?;
        let user = self.catalog.get_user(&username).await?;
        let reserved = self.catalog.get_reserved_plan(&username).await?;
        let history = self.catalog.get_plan_history(&username).await?;

        self.catalog.delete_user(&username).await?;
        match self.delete(&username, None, false, true).await {
            Ok(()) => {
                info!("user '{username}' is deleted");
                Ok(())
            }
            Err(cause) if force => {
                let error = Error::aggregate(
                    format!("failed to delete user '{username}' from the services"),
                    vec![cause],
                    None,
                );
                warn!("{error}");
                info!("user '{username}' is deleted");
                Err(error)
            }
            Err(cause) => {
                let snapshot = Snapshot {
                    users: vec![user],
                    reserved_plans: reserved
                        .map(|plan| {
                            vec![SnapshotReservedPlan {
                                username: username.clone(),
                                plan,
                            }]
                        })
                        .unwrap_or_default(),
                    history,
                };
                if let Err(rollback) = self.catalog.restore(&snapshot).await {
                    error!("failed to restore the catalog row for user '{username}': {rollback}");
                }
                error!("failed to delete user '{username}'");
                Err(cause)
            }
        }
    }

    /// Updates the user's plan in the catalog and reflects the change to
    /// the services. The catalog change is always retained: flattening
    /// consumes the previous plan, so there is no opposite operation to
    /// roll back with; the passive loop repairs any drift instead.
    pub async fn update_plan(&self, username: &str, change: PlanChange) -> Result<()> {
        let username = validate_username(username)?;
        let had_active_plan = self.catalog.has_active_plan(&username).await?;

        if !(change.sets_extra_traffic() && !change.sets_plan_fields()) {
            self.catalog
                .set_plan(
                    &username,
                    PlanUpdate {
                        id: change.id,
                        start_date: change.start_date,
                        duration: change.duration,
                        traffic: change.traffic,
                        preserve_traffic_usage: change.preserve_traffic_usage,
                    },
                )
                .await?;
        }
        if change.sets_extra_traffic() {
            self.catalog
                .set_plan_extra_traffic(
                    &username,
                    change.id,
                    if change.reset_extra_traffic {
                        None
                    } else {
                        change.extra_traffic
                    },
                )
                .await?;
        }

        let has_active_plan = self.catalog.has_active_plan(&username).await?;
        let reflected = if had_active_plan && !has_active_plan {
            self.delete(&username, Some(Reason::ExpiredPlan), true, false)
                .await
                .map(|_| true)
        } else if !had_active_plan && has_active_plan {
            let credentials = self.catalog.get_credentials(&username).await?;
            self.add(&username, &credentials.uuid, Some(Reason::UpdatedPlan), true)
                .await
                .map(|_| true)
        } else {
            Ok(false)
        };

        match reflected {
            Ok(changed) => {
                info!(
                    "plan is updated for user '{username}'{}",
                    if changed {
                        ""
                    } else {
                        " and currently no changes are required to be reflected to the services"
                    }
                );
                Ok(())
            }
            Err(cause) => {
                let error = Error::aggregate(
                    format!("failed to reflect the plan update to the services for user '{username}'"),
                    vec![cause],
                    None,
                );
                warn!("{error}");
                Err(error)
            }
        }
    }

    /// Seeds the state table with every catalog user and its current
    /// activity, under the global lock. Run once at daemon startup.
    pub async fn load_state(&self) -> Result<()> {
        let _global = self.state.lock_global(true).await?;
        for username in self.catalog.usernames().await? {
            let has_active_plan = self.catalog.has_active_plan(&username).await?;
            self.state
                .ensure_user(&username, true, has_active_plan, true)
                .await?;
        }
        Ok(())
    }

    /// Full reconciliation of the services against the catalog. Returns
    /// whether any transition fired; the user list is regenerated when
    /// one did.
    pub async fn sync(&self) -> Result<bool> {
        self.sync_inner().await.map_err(|cause| {
            Error::aggregate(
                "failed to reflect the catalog changes to the services",
                vec![cause],
                None,
            )
        })
    }

    async fn sync_inner(&self) -> Result<bool> {
        let mut synced = false;
        let state_users = self.state.list_users(true).await?.unwrap_or_default();
        let usernames = self.catalog.usernames().await?;

        for username in state_users.keys() {
            if !usernames.contains(username) {
                // The catalog row is gone; drop the user everywhere.
                self.delete(username, Some(Reason::Synchronization), true, true)
                    .await?;
                synced = true;
            }
        }

        for username in &usernames {
            let has_active_plan = self.catalog.has_active_plan(username).await?;
            match state_users.get(username) {
                Some(known) if known.synced => {
                    if known.has_active_plan && !has_active_plan {
                        if self.catalog.activate_reserved_plan(username).await? {
                            let credentials = self.catalog.get_credentials(username).await?;
                            self.add(username, &credentials.uuid, Some(Reason::ReservedPlan), true)
                                .await?;
                        } else {
                            self.delete(username, Some(Reason::ExpiredPlan), true, false)
                                .await?;
                        }
                        synced = true;
                    } else if !known.has_active_plan && has_active_plan {
                        let reason = self
                            .state
                            .get_reason(username, true)
                            .await?
                            .unwrap_or(Reason::UpdatedPlan);
                        let credentials = self.catalog.get_credentials(username).await?;
                        self.add(username, &credentials.uuid, Some(reason), true)
                            .await?;
                        synced = true;
                    } else if !known.has_active_plan
                        && !has_active_plan
                        && self.catalog.activate_reserved_plan(username).await?
                    {
                        let credentials = self.catalog.get_credentials(username).await?;
                        self.add(username, &credentials.uuid, Some(Reason::ReservedPlan), true)
                            .await?;
                        synced = true;
                    }
                }
                known => {
                    // Never observed (or a previous transition failed):
                    // treat as newly added.
                    if has_active_plan {
                        let reason = self
                            .state
                            .get_reason(username, true)
                            .await?
                            .unwrap_or(Reason::Synchronization);
                        let credentials = self.catalog.get_credentials(username).await?;
                        self.add(username, &credentials.uuid, Some(reason), true)
                            .await?;
                        synced = true;
                    } else if self.catalog.activate_reserved_plan(username).await? {
                        let credentials = self.catalog.get_credentials(username).await?;
                        self.add(username, &credentials.uuid, Some(Reason::ReservedPlan), true)
                            .await?;
                        synced = true;
                    } else if known.is_some() {
                        // A delete went through partially; retry it.
                        let reason = self
                            .state
                            .get_reason(username, true)
                            .await?
                            .unwrap_or(Reason::ExpiredPlan);
                        self.delete(username, Some(reason), true, false).await?;
                        synced = true;
                    } else {
                        // Observe the inactive user without a transition.
                        self.state.ensure_user(username, true, false, true).await?;
                    }
                }
            }
        }

        if synced {
            self.catalog.generate_list().await?;
        }
        Ok(synced)
    }

    pub async fn close(&self) {
        for service in &self.services {
            service.close().await;
        }
    }
}
