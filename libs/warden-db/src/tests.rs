use chrono::TimeDelta;
use tempfile::TempDir;

use warden_shared::{current_time, Credentials, Error, PlanUpdateAction};

use crate::catalog::{parse_date, validate_username, Catalog, CatalogConfig, PlanUpdate};

fn config(temp: &TempDir) -> CatalogConfig {
    CatalogConfig {
        path: None,
        temp_path: temp.path().to_path_buf(),
        max_users: 0,
        max_active_users: 0,
        backup_interval: 0,
    }
}

async fn open_catalog(temp: &TempDir) -> Catalog {
    Catalog::open(config(temp)).await.unwrap()
}

#[test]
fn username_validation() {
    assert_eq!(validate_username("Alice_01").unwrap(), "alice_01");
    assert!(validate_username("").is_err());
    assert!(validate_username(&"a".repeat(65)).is_err());
    assert!(validate_username(&"a".repeat(64)).is_ok());
    assert!(validate_username("no-dashes").is_err());
    assert!(validate_username("no spaces").is_err());
    assert!(validate_username("Σ").is_err());
}

#[test]
fn date_parsing() {
    let iso = parse_date("2024-01-01T00:00:00Z").unwrap();
    let unix = parse_date(&iso.timestamp().to_string()).unwrap();
    assert_eq!(iso, unix);
    // Offsets normalize to UTC, sub-second precision is dropped.
    assert_eq!(parse_date("2024-01-01T02:30:00.750+02:30").unwrap(), iso);
    assert!(parse_date("yesterday").is_err());
}

#[tokio::test]
async fn add_and_delete_user() {
    let temp = TempDir::new().unwrap();
    let catalog = open_catalog(&temp).await;

    let credentials = catalog.add_user("Alice").await.unwrap();
    assert_eq!(credentials.username, "alice");
    assert!(catalog.is_exist("alice").await.unwrap());
    assert!(catalog.validate_credentials(&credentials).await.unwrap());
    assert!(
        !catalog
            .validate_credentials(&Credentials {
                username: "alice".into(),
                uuid: uuid::Uuid::new_v4(),
            })
            .await
            .unwrap()
    );

    assert!(matches!(
        catalog.add_user("alice").await,
        Err(Error::UserExist(_))
    ));

    catalog.delete_user("alice").await.unwrap();
    assert!(!catalog.is_exist("alice").await.unwrap());
    assert!(matches!(
        catalog.delete_user("alice").await,
        Err(Error::UserNotExist(_))
    ));
}

#[tokio::test]
async fn deleting_a_user_cascades() {
    let temp = TempDir::new().unwrap();
    let catalog = open_catalog(&temp).await;

    catalog.add_user("alice").await.unwrap();
    catalog
        .set_plan(
            "alice",
            PlanUpdate {
                traffic: Some(1_000),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    catalog
        .set_reserved_plan("alice", None, Some(3_600), Some(5_000))
        .await
        .unwrap();

    catalog.delete_user("alice").await.unwrap();
    let snapshot = catalog.dump().await.unwrap();
    assert!(snapshot.users.is_empty());
    assert!(snapshot.reserved_plans.is_empty());
    assert!(snapshot.history.is_empty());
}

#[tokio::test]
async fn capacity_limits() {
    let temp = TempDir::new().unwrap();
    let catalog = Catalog::open(CatalogConfig {
        max_users: 1,
        ..config(&temp)
    })
    .await
    .unwrap();

    catalog.add_user("alice").await.unwrap();
    assert!(catalog.has_no_capacity().await.unwrap());
    assert!(matches!(
        catalog.add_user("bob").await,
        Err(Error::UsersCapacity)
    ));
}

#[tokio::test]
async fn active_capacity_limit() {
    let temp = TempDir::new().unwrap();
    let catalog = Catalog::open(CatalogConfig {
        max_active_users: 1,
        ..config(&temp)
    })
    .await
    .unwrap();

    // A fresh user has the default unlimited plan, which is active.
    catalog.add_user("alice").await.unwrap();
    assert!(catalog.has_active_plan("alice").await.unwrap());
    assert!(matches!(
        catalog.add_user("bob").await,
        Err(Error::ActiveUsersCapacity)
    ));
}

#[tokio::test]
async fn plan_validation_boundaries() {
    let temp = TempDir::new().unwrap();
    let catalog = open_catalog(&temp).await;
    catalog.add_user("alice").await.unwrap();

    let start_without_duration = PlanUpdate {
        start_date: Some(current_time()),
        ..Default::default()
    };
    assert!(catalog.set_plan("alice", start_without_duration).await.is_err());

    let duration_without_start = PlanUpdate {
        duration: Some(60),
        ..Default::default()
    };
    assert!(catalog.set_plan("alice", duration_without_start).await.is_err());

    let negative_duration = PlanUpdate {
        start_date: Some(current_time()),
        duration: Some(0),
        ..Default::default()
    };
    assert!(catalog.set_plan("alice", negative_duration).await.is_err());

    let zero_traffic = PlanUpdate {
        traffic: Some(0),
        ..Default::default()
    };
    assert!(catalog.set_plan("alice", zero_traffic).await.is_err());
}

#[tokio::test]
async fn plan_change_resets_usage_and_flattens_extra_traffic() {
    let temp = TempDir::new().unwrap();
    let catalog = open_catalog(&temp).await;
    catalog.add_user("alice").await.unwrap();

    catalog
        .set_plan(
            "alice",
            PlanUpdate {
                traffic: Some(1_000),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    catalog
        .set_plan_extra_traffic("alice", None, Some(500))
        .await
        .unwrap();
    catalog.update_traffic("alice", 1_000, 300, 800, 500).await.unwrap();

    let plan = catalog.get_plan("alice").await.unwrap();
    assert_eq!(plan.plan_traffic_usage, 1_000);
    assert_eq!(plan.plan_extra_traffic, 500);
    assert_eq!(plan.plan_extra_traffic_usage, 300);

    // New plan: usage resets, the 200 unconsumed extra bytes carry over.
    catalog
        .set_plan(
            "alice",
            PlanUpdate {
                traffic: Some(2_000),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let plan = catalog.get_plan("alice").await.unwrap();
    assert_eq!(plan.plan_traffic, Some(2_000));
    assert_eq!(plan.plan_traffic_usage, 0);
    assert_eq!(plan.plan_extra_traffic, 200);
    assert_eq!(plan.plan_extra_traffic_usage, 0);
}

#[tokio::test]
async fn plan_change_can_preserve_usage() {
    let temp = TempDir::new().unwrap();
    let catalog = open_catalog(&temp).await;
    catalog.add_user("alice").await.unwrap();

    catalog
        .set_plan(
            "alice",
            PlanUpdate {
                traffic: Some(1_000),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    catalog.update_traffic("alice", 400, 0, 400, 0).await.unwrap();
    catalog
        .set_plan(
            "alice",
            PlanUpdate {
                traffic: Some(2_000),
                preserve_traffic_usage: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(catalog.get_plan("alice").await.unwrap().plan_traffic_usage, 400);
}

#[tokio::test]
async fn extra_traffic_requires_a_traffic_limit() {
    let temp = TempDir::new().unwrap();
    let catalog = open_catalog(&temp).await;
    catalog.add_user("alice").await.unwrap();

    assert!(matches!(
        catalog.set_plan_extra_traffic("alice", None, Some(500)).await,
        Err(Error::NoTrafficLimit(_))
    ));
    assert!(catalog
        .set_plan_extra_traffic("alice", None, Some(0))
        .await
        .is_err());
    // A reset is fine even on an unlimited plan.
    catalog
        .set_plan_extra_traffic("alice", None, None)
        .await
        .unwrap();
}

#[tokio::test]
async fn reserved_plan_lifecycle() {
    let temp = TempDir::new().unwrap();
    let catalog = open_catalog(&temp).await;
    catalog.add_user("alice").await.unwrap();
    catalog
        .set_plan(
            "alice",
            PlanUpdate {
                traffic: Some(1_000),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    catalog
        .set_reserved_plan("alice", Some(7), Some(3_600), Some(5_000))
        .await
        .unwrap();
    let reserved = catalog.get_reserved_plan("alice").await.unwrap().unwrap();
    assert_eq!(reserved.plan_duration, Some(3_600));
    assert_eq!(reserved.plan_traffic, Some(5_000));

    // Exhaust the plan, then activate the reserved one.
    catalog.update_traffic("alice", 1_000, 0, 500, 500).await.unwrap();
    assert!(!catalog.has_active_plan("alice").await.unwrap());
    assert!(catalog.activate_reserved_plan("alice").await.unwrap());
    assert!(catalog.get_reserved_plan("alice").await.unwrap().is_none());

    let plan = catalog.get_plan("alice").await.unwrap();
    assert_eq!(plan.plan_traffic, Some(5_000));
    assert_eq!(plan.plan_duration, Some(3_600));
    assert_eq!(plan.plan_traffic_usage, 0);
    assert!(catalog.has_active_plan("alice").await.unwrap());

    // Activating again is a no-op.
    assert!(!catalog.activate_reserved_plan("alice").await.unwrap());

    let history = catalog.get_plan_history("alice").await.unwrap();
    let actions: Vec<_> = history.iter().map(|entry| entry.action).collect();
    assert!(actions.contains(&PlanUpdateAction::UpdateReservedPlan));
    assert_eq!(history.iter().find(|e| e.id == Some(7)).unwrap().action, PlanUpdateAction::UpdateReservedPlan);
}

#[tokio::test]
async fn reserved_plan_requires_an_active_plan() {
    let temp = TempDir::new().unwrap();
    let catalog = open_catalog(&temp).await;
    catalog.add_user("alice").await.unwrap();
    catalog
        .set_plan(
            "alice",
            PlanUpdate {
                traffic: Some(100),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    catalog.update_traffic("alice", 100, 0, 100, 0).await.unwrap();

    assert!(matches!(
        catalog.set_reserved_plan("alice", None, None, Some(1_000)).await,
        Err(Error::NoActivePlan(_))
    ));
}

#[tokio::test]
async fn total_traffic_accumulates_and_resets() {
    let temp = TempDir::new().unwrap();
    let catalog = open_catalog(&temp).await;
    catalog.add_user("alice").await.unwrap();

    catalog.update_traffic("alice", 0, 0, 700, 600).await.unwrap();
    catalog.update_traffic("alice", 0, 0, 300, 400).await.unwrap();
    let total = catalog.get_total_traffic("alice").await.unwrap();
    assert_eq!(total.uplink, 1_000);
    assert_eq!(total.downlink, 1_000);

    catalog.reset_total_traffic("alice").await.unwrap();
    let total = catalog.get_total_traffic("alice").await.unwrap();
    assert_eq!(total.total(), 0);
}

#[tokio::test]
async fn latest_activity_round_trip() {
    let temp = TempDir::new().unwrap();
    let catalog = open_catalog(&temp).await;
    catalog.add_user("alice").await.unwrap();
    catalog.add_user("bob").await.unwrap();

    assert!(catalog.get_latest_activity("alice").await.unwrap().is_none());
    let now = current_time();
    catalog.record_activity("alice", now).await.unwrap();
    assert_eq!(catalog.get_latest_activity("alice").await.unwrap(), Some(now));

    let activities = catalog.get_latest_activities(None).await.unwrap();
    assert_eq!(activities, vec![("alice".into(), now)]);
    let recent = catalog
        .get_latest_activities(Some(now + TimeDelta::seconds(1)))
        .await
        .unwrap();
    assert!(recent.is_empty());
}

#[tokio::test]
async fn dump_restore_round_trip() {
    let temp = TempDir::new().unwrap();
    let catalog = open_catalog(&temp).await;

    catalog.add_user("alice").await.unwrap();
    catalog.add_user("bob").await.unwrap();
    catalog
        .set_plan(
            "alice",
            PlanUpdate {
                id: Some(1),
                start_date: Some(current_time()),
                duration: Some(3_600),
                traffic: Some(1_000),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    catalog
        .set_reserved_plan("alice", Some(2), Some(7_200), None)
        .await
        .unwrap();
    catalog.update_traffic("bob", 0, 0, 10, 20).await.unwrap();

    let snapshot = catalog.dump().await.unwrap();
    let restored = open_catalog(&temp).await;
    restored.restore(&snapshot).await.unwrap();
    assert_eq!(restored.dump().await.unwrap(), snapshot);
}

#[tokio::test]
async fn generated_list_contains_only_active_users() {
    let temp = TempDir::new().unwrap();
    let catalog = open_catalog(&temp).await;

    let alice = catalog.add_user("alice").await.unwrap();
    catalog.add_user("bob").await.unwrap();
    // Expire bob by exhausting a finite plan.
    catalog
        .set_plan(
            "bob",
            PlanUpdate {
                traffic: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    catalog.update_traffic("bob", 1, 0, 1, 0).await.unwrap();

    catalog.generate_list().await.unwrap();
    let list = std::fs::read_to_string(temp.path().join("users")).unwrap();
    assert_eq!(list, format!("alice {}\n", alice.uuid));
    let marker = std::fs::read_to_string(temp.path().join("last-generate")).unwrap();
    assert!(marker.parse::<i64>().unwrap() > 0);
}

#[tokio::test]
async fn backup_writes_a_queryable_copy() {
    let temp = TempDir::new().unwrap();
    let catalog = Catalog::open(CatalogConfig {
        path: Some(temp.path().join("warden.db")),
        ..config(&temp)
    })
    .await
    .unwrap();
    catalog.add_user("alice").await.unwrap();

    let target = catalog.backup(Some(".test.bak")).await.unwrap();
    assert!(target.ends_with("backup/warden.db.test.bak"));

    let copy = Catalog::open(CatalogConfig {
        path: Some(target),
        ..config(&temp)
    })
    .await
    .unwrap();
    assert!(copy.is_exist("alice").await.unwrap());
}
