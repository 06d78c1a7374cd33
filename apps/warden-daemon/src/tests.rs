use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;

use warden_db::{Catalog, CatalogConfig, PlanUpdate};
use warden_shared::{current_time, Error, PlanUpdateAction};

use crate::monitor::Monitor;
use crate::reconciler::{PlanChange, Reconciler};
use crate::services::memory::MemoryService;
use crate::services::{Service, VpnService};
use crate::state::{ServiceState, StateHandle, StateServer};

struct Harness {
    _temp: TempDir,
    temp_path: PathBuf,
    catalog: Catalog,
    _server: StateServer,
    state: StateHandle,
    proxy: Arc<MemoryService>,
    vpn: Arc<MemoryService>,
    reconciler: Arc<Reconciler>,
}

async fn harness() -> Harness {
    let temp = TempDir::new().unwrap();
    let socket = temp.path().join("manager.sock");
    let server = StateServer::start(socket.clone(), "secret".into())
        .await
        .unwrap();
    let state = StateHandle::new(socket, "secret".into());
    state.connect(Duration::from_secs(3), false).await.unwrap();

    let catalog = Catalog::open(CatalogConfig {
        path: None,
        temp_path: temp.path().to_path_buf(),
        max_users: 0,
        max_active_users: 0,
        backup_interval: 0,
    })
    .await
    .unwrap();

    let proxy = Arc::new(MemoryService::proxy());
    let vpn = Arc::new(MemoryService::vpn());
    let services: Vec<Arc<dyn Service>> = vec![proxy.clone(), vpn.clone()];
    let reconciler = Arc::new(Reconciler::new(catalog.clone(), services, state.clone()));

    Harness {
        temp_path: temp.path().to_path_buf(),
        _temp: temp,
        catalog,
        _server: server,
        state,
        proxy,
        vpn,
        reconciler,
    }
}

fn monitor(harness: &Harness, zombies: bool) -> Arc<Monitor> {
    Arc::new(
        Monitor::new(
            Arc::clone(&harness.reconciler),
            Duration::from_secs(60),
            0,
            zombies,
        )
        .unwrap(),
    )
}

fn service_calls(harness: &Harness) -> usize {
    harness.proxy.calls().len() + harness.vpn.calls().len()
}

#[tokio::test]
async fn add_marks_every_service_added() {
    let harness = harness().await;
    let credentials = harness.reconciler.add_user("alice", false).await.unwrap();

    assert!(harness.proxy.has_member("alice"));
    assert!(harness.vpn.has_member("alice"));
    assert!(harness.catalog.is_exist("alice").await.unwrap());

    let state = harness
        .state
        .get_user("alice", false)
        .await
        .unwrap()
        .unwrap();
    assert!(state.synced);
    assert!(state.has_active_plan);
    assert_eq!(state.service("proxy"), ServiceState::Added);
    assert_eq!(state.service("vpn"), ServiceState::Added);

    // Re-adding is a no-op success thanks to the recorded state.
    let calls = service_calls(&harness);
    harness
        .reconciler
        .add(&credentials.username, &credentials.uuid, None, false)
        .await
        .unwrap();
    assert_eq!(service_calls(&harness), calls);
}

#[tokio::test]
async fn add_and_expire_by_time() {
    let harness = harness().await;
    harness.reconciler.add_user("alice", false).await.unwrap();

    // A plan that ended long ago: active until second 59, expired at 60.
    harness
        .catalog
        .set_plan(
            "alice",
            PlanUpdate {
                start_date: Some(warden_db::parse_date("2024-01-01T00:00:00Z").unwrap()),
                duration: Some(60),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(!harness.catalog.has_active_plan("alice").await.unwrap());

    assert!(harness.reconciler.sync().await.unwrap());
    assert!(!harness.proxy.has_member("alice"));
    assert!(!harness.vpn.has_member("alice"));

    let state = harness
        .state
        .get_user("alice", false)
        .await
        .unwrap()
        .unwrap();
    assert!(state.synced);
    assert!(!state.has_active_plan);

    // Nothing changed since: no transitions, no service calls.
    let calls = service_calls(&harness);
    assert!(!harness.reconciler.sync().await.unwrap());
    assert_eq!(service_calls(&harness), calls);
}

#[tokio::test]
async fn traffic_debit_splits_into_extra_traffic() {
    let harness = harness().await;
    harness.reconciler.add_user("alice", false).await.unwrap();
    harness
        .catalog
        .set_plan(
            "alice",
            PlanUpdate {
                traffic: Some(1_000),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    harness
        .catalog
        .set_plan_extra_traffic("alice", None, Some(500))
        .await
        .unwrap();

    harness.proxy.report_traffic("alice", 700, 600);
    monitor(&harness, false).tick().await;

    let plan = harness.catalog.get_plan("alice").await.unwrap();
    assert_eq!(plan.plan_traffic_usage, 1_000);
    assert_eq!(plan.plan_extra_traffic_usage, 300);
    assert!(plan.is_active_at(current_time()));
    // Still active: no expiry delete was issued.
    assert!(harness.proxy.has_member("alice"));

    let totals = harness.catalog.get_total_traffic("alice").await.unwrap();
    assert_eq!(totals.uplink, 700);
    assert_eq!(totals.downlink, 600);
}

#[tokio::test]
async fn exhausted_plan_is_expired_from_the_reporting_service() {
    let harness = harness().await;
    harness.reconciler.add_user("alice", false).await.unwrap();
    harness
        .catalog
        .set_plan(
            "alice",
            PlanUpdate {
                traffic: Some(1_000),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    harness.vpn.report_traffic("alice", 600, 500);
    monitor(&harness, false).tick().await;

    // The debit clamps at the limit and the user leaves the VPN.
    let plan = harness.catalog.get_plan("alice").await.unwrap();
    assert_eq!(plan.plan_traffic_usage, 1_000);
    assert!(!harness.vpn.has_member("alice"));
    assert!(harness.proxy.has_member("alice"));
}

#[tokio::test]
async fn force_add_keeps_the_catalog_row_and_returns_credentials() {
    let harness = harness().await;
    harness.proxy.set_unreachable(true);

    let error = harness
        .reconciler
        .add_user("bob", true)
        .await
        .expect_err("the proxy is down");
    let Error::Synchronization {
        causes, payload, ..
    } = &error
    else {
        panic!("expected an aggregate, got {error:?}");
    };
    assert!(causes.contains(&Error::ProxyTimeout));

    let payload = payload.as_ref().unwrap();
    assert_eq!(payload["username"], "bob");
    let credentials = harness.catalog.get_credentials("bob").await.unwrap();
    assert_eq!(payload["uuid"], credentials.uuid.to_string());

    // The reachable service still got the user.
    assert!(harness.vpn.has_member("bob"));
}

#[tokio::test]
async fn failed_add_without_force_rolls_the_catalog_back() {
    let harness = harness().await;
    harness.proxy.set_unreachable(true);

    let error = harness
        .reconciler
        .add_user("carol", false)
        .await
        .expect_err("the proxy is down");
    assert!(matches!(error, Error::Synchronization { .. }));
    assert!(!harness.catalog.is_exist("carol").await.unwrap());
}

#[tokio::test]
async fn failed_delete_without_force_restores_the_catalog_row() {
    let harness = harness().await;
    harness.reconciler.add_user("alice", false).await.unwrap();
    harness.vpn.set_unreachable(true);

    let error = harness
        .reconciler
        .delete_user("alice", false)
        .await
        .expect_err("the VPN is down");
    assert!(matches!(error, Error::Synchronization { .. }));
    assert!(harness.catalog.is_exist("alice").await.unwrap());

    // With force the row goes away despite the outage.
    let error = harness
        .reconciler
        .delete_user("alice", true)
        .await
        .expect_err("the VPN is still down");
    assert!(matches!(error, Error::Synchronization { .. }));
    assert!(!harness.catalog.is_exist("alice").await.unwrap());
}

#[tokio::test]
async fn zombie_users_are_deleted_only_when_enabled() {
    let harness = harness().await;

    harness.proxy.report_traffic("ghost", 10, 10);
    monitor(&harness, false).tick().await;
    assert!(!harness.proxy.calls().contains(&"delete ghost".to_owned()));

    harness.proxy.report_traffic("ghost", 10, 10);
    monitor(&harness, true).tick().await;
    assert!(harness.proxy.calls().contains(&"delete ghost".to_owned()));
    // Only the reporting service is touched.
    assert!(!harness.vpn.calls().contains(&"delete ghost".to_owned()));
}

#[tokio::test]
async fn known_users_are_not_zombies() {
    let harness = harness().await;
    harness.reconciler.add_user("alice", false).await.unwrap();

    let calls = harness.proxy.calls().len();
    harness.proxy.report_traffic("alice", 1, 1);
    monitor(&harness, true).tick().await;
    assert_eq!(harness.proxy.calls().len(), calls);
    assert!(harness.proxy.has_member("alice"));
}

#[tokio::test]
async fn reserved_plan_activates_on_sync() {
    let harness = harness().await;
    harness.reconciler.add_user("alice", false).await.unwrap();
    harness
        .catalog
        .set_plan(
            "alice",
            PlanUpdate {
                traffic: Some(1_000),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    harness
        .catalog
        .set_reserved_plan("alice", None, Some(3_600), Some(5_000))
        .await
        .unwrap();

    // Force-expire the current plan.
    harness
        .catalog
        .update_traffic("alice", 1_000, 0, 500, 500)
        .await
        .unwrap();
    assert!(!harness.catalog.has_active_plan("alice").await.unwrap());

    assert!(harness.reconciler.sync().await.unwrap());

    // The reserved plan replaced the expired one and alice stayed in.
    assert!(harness.proxy.has_member("alice"));
    assert!(harness.vpn.has_member("alice"));
    assert!(harness.catalog.has_active_plan("alice").await.unwrap());
    assert!(harness
        .catalog
        .get_reserved_plan("alice")
        .await
        .unwrap()
        .is_none());
    let plan = harness.catalog.get_plan("alice").await.unwrap();
    assert_eq!(plan.plan_traffic, Some(5_000));
    assert_eq!(plan.plan_duration, Some(3_600));

    let history = harness.catalog.get_plan_history("alice").await.unwrap();
    assert!(history
        .iter()
        .any(|entry| entry.action == PlanUpdateAction::UpdateReservedPlan));

    // The regenerated user list still carries alice.
    let list = std::fs::read_to_string(harness.temp_path.join("users")).unwrap();
    assert!(list.starts_with("alice "));
}

#[tokio::test]
async fn deleted_catalog_rows_are_swept_by_sync() {
    let harness = harness().await;
    harness.reconciler.add_user("alice", false).await.unwrap();

    // An out-of-band deletion the reconciler never saw.
    harness.catalog.delete_user("alice").await.unwrap();

    assert!(harness.reconciler.sync().await.unwrap());
    assert!(!harness.proxy.has_member("alice"));
    assert!(!harness.vpn.has_member("alice"));
    assert!(harness
        .state
        .get_user("alice", false)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn update_plan_reflects_activation_to_the_services() {
    let harness = harness().await;
    harness.reconciler.add_user("alice", false).await.unwrap();

    // Expire by plan update: the services drop alice.
    harness
        .reconciler
        .update_plan(
            "alice",
            PlanChange {
                start_date: Some(warden_db::parse_date("2024-01-01T00:00:00Z").unwrap()),
                duration: Some(60),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(!harness.proxy.has_member("alice"));

    // An unlimited plan brings alice back.
    harness
        .reconciler
        .update_plan("alice", PlanChange::default())
        .await
        .unwrap();
    assert!(harness.proxy.has_member("alice"));
    assert!(harness.vpn.has_member("alice"));
}

mod state_table {
    use super::*;

    #[tokio::test]
    async fn user_locks_are_exclusive_until_released() {
        let temp = TempDir::new().unwrap();
        let socket = temp.path().join("manager.sock");
        let _server = StateServer::start(socket.clone(), "secret".into())
            .await
            .unwrap();
        let state = StateHandle::new(socket, "secret".into());
        state.connect(Duration::from_secs(3), false).await.unwrap();

        let held = state.lock_user("alice", false).await.unwrap().unwrap();

        let contender = state.clone();
        let waiting = tokio::spawn(async move {
            contender.lock_user("alice", false).await.unwrap();
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiting.is_finished());

        drop(held);
        tokio::time::timeout(Duration::from_secs(2), waiting)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn wrong_key_is_rejected() {
        let temp = TempDir::new().unwrap();
        let socket = temp.path().join("manager.sock");
        let _server = StateServer::start(socket.clone(), "secret".into())
            .await
            .unwrap();

        let state = StateHandle::new(socket, "wrong".into());
        assert!(state
            .connect(Duration::from_millis(200), false)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn silent_operations_degrade_without_a_server() {
        let temp = TempDir::new().unwrap();
        let state = StateHandle::new(temp.path().join("missing.sock"), "secret".into());

        // skip_retry degrades quietly.
        state.connect(Duration::from_secs(3), true).await.unwrap();
        assert!(!state.connected());

        assert_eq!(state.get_user("alice", true).await.unwrap(), None);
        assert!(state.lock_user("alice", true).await.unwrap().is_none());
        assert!(matches!(
            state.get_user("alice", false).await,
            Err(Error::StateSynchronizerTimeout)
        ));
    }

    #[tokio::test]
    async fn records_round_trip() {
        let temp = TempDir::new().unwrap();
        let socket = temp.path().join("manager.sock");
        let _server = StateServer::start(socket.clone(), "secret".into())
            .await
            .unwrap();
        let state = StateHandle::new(socket, "secret".into());
        state.connect(Duration::from_secs(3), false).await.unwrap();

        state.ensure_user("alice", true, true, false).await.unwrap();
        state
            .set_service_state("alice", "proxy", ServiceState::Added, false)
            .await
            .unwrap();
        let record = state.get_user("alice", false).await.unwrap().unwrap();
        assert!(record.synced);
        assert_eq!(record.service("proxy"), ServiceState::Added);
        assert_eq!(record.service("vpn"), ServiceState::Unknown);

        state
            .set_reason("alice", crate::state::Reason::UpdatedPlan, false)
            .await
            .unwrap();
        assert_eq!(
            state.take_reason("alice", false).await.unwrap(),
            Some(crate::state::Reason::UpdatedPlan)
        );
        assert_eq!(state.take_reason("alice", false).await.unwrap(), None);

        state.remove_user("alice", false).await.unwrap();
        assert!(state.get_user("alice", false).await.unwrap().is_none());
        assert!(state.list_users(false).await.unwrap().unwrap().is_empty());
    }
}

mod vpn_broker {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixListener;

    #[derive(Default)]
    struct BrokerState {
        up_since: i64,
        sessions: Vec<serde_json::Value>,
        add_exit_code: Option<u8>,
    }

    fn spawn_broker(socket: PathBuf, state: Arc<Mutex<BrokerState>>) {
        let listener = UnixListener::bind(&socket).unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let mut command = Vec::new();
                    if stream.read_to_end(&mut command).await.is_err() {
                        return;
                    }
                    let command = String::from_utf8_lossy(&command).into_owned();
                    let response = {
                        let state = state.lock().unwrap();
                        if command.starts_with("show_status") {
                            format!("0{}", serde_json::json!({ "raw_up_since": state.up_since }))
                        } else if command.starts_with("show_users") {
                            format!("0{}", serde_json::Value::Array(state.sessions.clone()))
                        } else if command.starts_with("add_user") {
                            match state.add_exit_code {
                                Some(code) => (code as char).to_string(),
                                None => "0".to_owned(),
                            }
                        } else {
                            "0".to_owned()
                        }
                    };
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
    }

    fn session(username: &str, tx: i64, rx: i64) -> serde_json::Value {
        serde_json::json!({ "Username": username, "State": "connected", "TX": tx.to_string(), "RX": rx })
    }

    #[tokio::test]
    async fn counter_memory_is_cleared_on_restart() {
        let temp = TempDir::new().unwrap();
        let socket = temp.path().join("broker.sock");
        let broker = Arc::new(Mutex::new(BrokerState {
            up_since: 1_000,
            ..Default::default()
        }));
        spawn_broker(socket.clone(), Arc::clone(&broker));
        let vpn = VpnService::with_socket(socket, Duration::from_secs(3));

        // First call primes the counter memory.
        assert!(vpn.users_traffic_usage(true).await.unwrap().is_empty());

        const MIB: i64 = 1 << 20;
        broker.lock().unwrap().sessions = vec![session("alice", MIB, 0)];
        let usage = vpn.users_traffic_usage(true).await.unwrap();
        assert_eq!(usage["alice"].uplink, MIB);

        // Same boot: plain delta.
        broker.lock().unwrap().sessions = vec![session("alice", MIB + 300, 0)];
        let usage = vpn.users_traffic_usage(true).await.unwrap();
        assert_eq!(usage["alice"].uplink, 300);

        // The VPN bounced: the next value is the absolute counter, not
        // `current - previous`.
        {
            let mut broker = broker.lock().unwrap();
            broker.up_since = 2_000;
            broker.sessions = vec![session("alice", 200, 0)];
        }
        let usage = vpn.users_traffic_usage(true).await.unwrap();
        assert_eq!(usage["alice"].uplink, 200);
    }

    #[tokio::test]
    async fn reconnects_fall_back_to_the_absolute_counter() {
        let temp = TempDir::new().unwrap();
        let socket = temp.path().join("broker.sock");
        let broker = Arc::new(Mutex::new(BrokerState {
            up_since: 1_000,
            ..Default::default()
        }));
        spawn_broker(socket.clone(), Arc::clone(&broker));
        let vpn = VpnService::with_socket(socket, Duration::from_secs(3));

        vpn.users_traffic_usage(true).await.unwrap();
        broker.lock().unwrap().sessions = vec![session("alice", 500, 0)];
        vpn.users_traffic_usage(true).await.unwrap();

        // Same boot, but the client reconnected and its counter reset.
        broker.lock().unwrap().sessions = vec![session("alice", 100, 0)];
        let usage = vpn.users_traffic_usage(true).await.unwrap();
        assert_eq!(usage["alice"].uplink, 100);
    }

    #[tokio::test]
    async fn pre_auth_sessions_are_skipped() {
        let temp = TempDir::new().unwrap();
        let socket = temp.path().join("broker.sock");
        let broker = Arc::new(Mutex::new(BrokerState {
            up_since: 1_000,
            sessions: vec![serde_json::json!({ "State": "pre-auth", "TX": 10, "RX": 10 })],
            ..Default::default()
        }));
        spawn_broker(socket.clone(), Arc::clone(&broker));
        let vpn = VpnService::with_socket(socket, Duration::from_secs(3));

        assert!(vpn.users_traffic_usage(true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn broker_exit_codes_map_to_membership_errors() {
        let temp = TempDir::new().unwrap();
        let socket = temp.path().join("broker.sock");
        let broker = Arc::new(Mutex::new(BrokerState {
            add_exit_code: Some(b'3'),
            ..Default::default()
        }));
        spawn_broker(socket.clone(), Arc::clone(&broker));
        let vpn = VpnService::with_socket(socket, Duration::from_secs(3));

        let uuid = uuid::Uuid::new_v4();
        assert!(matches!(
            vpn.add_user("alice", &uuid).await,
            Err(Error::UserExist(_))
        ));
        broker.lock().unwrap().add_exit_code = None;
        vpn.add_user("alice", &uuid).await.unwrap();
    }

    #[tokio::test]
    async fn an_absent_broker_is_a_timeout() {
        let temp = TempDir::new().unwrap();
        let vpn = VpnService::with_socket(
            temp.path().join("missing.sock"),
            Duration::from_millis(300),
        );
        assert!(matches!(
            vpn.users_traffic_usage(true).await,
            Err(Error::VpnTimeout)
        ));
    }
}
