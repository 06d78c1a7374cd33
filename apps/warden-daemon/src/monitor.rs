use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::join_all;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use warden_shared::{current_time, Error, Result};

use crate::reconciler::Reconciler;
use crate::services::Service;

/// Tracks the services by polling traffic counters, debiting plans and
/// expiring users (the active loop), and periodically re-running a full
/// reconciliation (the passive loop). One timer tick drives both.
pub struct Monitor {
    reconciler: Arc<Reconciler>,
    interval: Duration,
    /// Passive loop period in ticks; non-positive disables it.
    steps: i64,
    monitor_zombies: bool,
    counted_steps: AtomicI64,
    idle: AtomicBool,
    stopping: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
    statuses: Mutex<HashMap<&'static str, ServiceStatus>>,
}

#[derive(Default)]
struct ServiceStatus {
    disconnected_since: Option<Instant>,
}

impl Monitor {
    pub fn new(
        reconciler: Arc<Reconciler>,
        interval: Duration,
        steps: i64,
        monitor_zombies: bool,
    ) -> Result<Self> {
        if interval.is_zero() {
            return Err(Error::Unexpected(
                "the monitor interval should be greater than zero".into(),
            ));
        }
        if steps <= 0 {
            info!("the services and catalog synchronization procedure is disabled");
        }
        Ok(Self {
            reconciler,
            interval,
            steps,
            monitor_zombies,
            counted_steps: AtomicI64::new(0),
            idle: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            task: Mutex::new(None),
            statuses: Mutex::new(HashMap::new()),
        })
    }

    /// Starts the monitor procedure on its own task.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut slot = self.task.lock().unwrap();
        if slot.is_some() || self.stopping.load(Ordering::Relaxed) {
            return Err(Error::Unexpected(
                "the monitor procedure is already running or was stopped".into(),
            ));
        }
        let monitor = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            monitor.run().await;
        }));
        info!("the monitor procedure is started");
        Ok(())
    }

    /// Stops the monitor. Cancels immediately when idle or forced,
    /// otherwise lets the current tick drain first.
    pub async fn stop(&self, force: bool) {
        let Some(task) = self.task.lock().unwrap().take() else {
            return;
        };
        self.stopping.store(true, Ordering::Relaxed);
        if self.idle.load(Ordering::Relaxed) || force {
            task.abort();
        } else if let Err(error) = task.await {
            if !error.is_cancelled() {
                error!("the monitor task failed: {error}");
            }
        }
        self.counted_steps.store(0, Ordering::Relaxed);
        self.reconciler.close().await;
        info!("the monitor procedure is stopped");
    }

    async fn run(&self) {
        loop {
            if self.stopping.load(Ordering::Relaxed) {
                return;
            }
            self.idle.store(true, Ordering::Relaxed);
            tokio::time::sleep(self.interval).await;
            self.idle.store(false, Ordering::Relaxed);
            if self.stopping.load(Ordering::Relaxed) {
                return;
            }
            self.tick().await;
        }
    }

    /// One monitor iteration: every enabled active loop plus the passive
    /// loop run in parallel; their failures are flattened and logged.
    /// The loop itself never dies.
    pub async fn tick(&self) {
        let mut tasks: Vec<BoxFuture<'_, Result<()>>> = self
            .reconciler
            .services()
            .iter()
            .map(|service| self.active_monitor(service).boxed())
            .collect();
        if self.steps > 0 {
            tasks.push(self.passive_monitor().boxed());
        }

        let mut causes = Vec::new();
        for result in join_all(tasks).await {
            match result {
                Ok(()) => {}
                Err(Error::Synchronization { causes: nested, .. }) => causes.extend(nested),
                Err(error) => causes.push(error),
            }
        }
        for cause in causes {
            match cause {
                Error::ProxyTimeout | Error::VpnTimeout => warn!("{cause}"),
                Error::StateSynchronizerTimeout => warn!("{cause}"),
                other => error!("monitor iteration failed: {other}"),
            }
        }
    }

    /// Polls one service's counters, debits the plans and expires users
    /// that no longer have an active one.
    async fn active_monitor(&self, service: &Arc<dyn Service>) -> Result<()> {
        let quiet = service.reports_stale_traffic();
        let usage = match service.users_traffic_usage(true).await {
            Ok(usage) => {
                self.mark_connected(service);
                usage
            }
            Err(error) => {
                if error == service.timeout_error() {
                    self.mark_disconnected(service);
                }
                return Err(error);
            }
        };

        let catalog = self.reconciler.catalog();
        for (username, traffic) in usage {
            let mut plan = match catalog.get_plan(&username).await {
                Ok(plan) => plan,
                Err(Error::UserNotExist(_)) => {
                    if !quiet {
                        warn!(
                            "user '{username}' is active on '{}' but does not exist in the catalog",
                            service.alias()
                        );
                    }
                    if self.monitor_zombies
                        && self
                            .reconciler
                            .state()
                            .get_user(&username, true)
                            .await?
                            .is_none()
                    {
                        self.reconciler.delete_zombie(service, &username).await?;
                    }
                    continue;
                }
                Err(error) => return Err(error),
            };

            let session_usage = traffic.total();
            if session_usage > 0 {
                let mut added_usage = 0;
                let mut added_extra_usage = 0;
                if let Some(limit) = plan.plan_traffic {
                    let previous_usage = plan.plan_traffic_usage;
                    added_usage = session_usage;
                    plan.plan_traffic_usage += added_usage;
                    if plan.plan_traffic_usage > limit {
                        // The session crossed the plan limit: the usage
                        // clamps there and any overflow goes to the
                        // extra traffic allowance.
                        added_usage = (limit - previous_usage).max(0);
                        plan.plan_traffic_usage = limit;
                        if plan.plan_extra_traffic > 0 {
                            added_extra_usage = session_usage - added_usage;
                            plan.plan_extra_traffic_usage += added_extra_usage;
                        }
                    }
                }
                // Persisted before any service await, so a cancelled
                // tick never loses the debit.
                catalog
                    .update_traffic(
                        &username,
                        added_usage,
                        added_extra_usage,
                        traffic.uplink,
                        traffic.downlink,
                    )
                    .await?;
            }

            if !plan.is_active_at(current_time())
                && !catalog.activate_reserved_plan(&username).await?
            {
                self.reconciler
                    .expire_from_service(service, &username, quiet)
                    .await?;
            }
        }
        Ok(())
    }

    /// Runs the full reconciliation every `steps` ticks.
    async fn passive_monitor(&self) -> Result<()> {
        let counted = self.counted_steps.fetch_add(1, Ordering::Relaxed) + 1;
        if self.steps > 1 && counted < self.steps {
            return Ok(());
        }
        self.counted_steps.store(0, Ordering::Relaxed);
        self.reconciler.sync().await?;
        Ok(())
    }

    fn mark_disconnected(&self, service: &Arc<dyn Service>) {
        let mut statuses = self.statuses.lock().unwrap();
        let status = statuses.entry(service.name()).or_default();
        if status.disconnected_since.is_none() {
            status.disconnected_since = Some(Instant::now());
        }
    }

    fn mark_connected(&self, service: &Arc<dyn Service>) {
        let mut statuses = self.statuses.lock().unwrap();
        let status = statuses.entry(service.name()).or_default();
        if let Some(since) = status.disconnected_since.take() {
            info!(
                "'{}' is reachable again after {:?} of outage",
                service.alias(),
                since.elapsed()
            );
        }
    }
}
