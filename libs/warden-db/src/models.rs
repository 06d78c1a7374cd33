use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use warden_shared::{PlanUpdateAction, Traffic};

/// A user's current plan. Nullable limits mean "unlimited"; whether a plan
/// is expired is always computed against a clock, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Plan {
    pub plan_start_date: Option<DateTime<Utc>>,
    pub plan_duration: Option<i64>,
    pub plan_traffic: Option<i64>,
    pub plan_traffic_usage: i64,
    pub plan_extra_traffic: i64,
    pub plan_extra_traffic_usage: i64,
}

impl Plan {
    pub fn is_unlimited_time(&self) -> bool {
        self.plan_start_date.is_none() || self.plan_duration.is_none()
    }

    pub fn is_unlimited_traffic(&self) -> bool {
        self.plan_traffic.is_none()
    }

    /// Whether the plan still has time left at `now`.
    pub fn has_time_at(&self, now: DateTime<Utc>) -> bool {
        match (self.plan_start_date, self.plan_duration) {
            (Some(start), Some(duration)) => now < start + TimeDelta::seconds(duration),
            _ => true,
        }
    }

    /// Whether the plan still has unconsumed traffic.
    pub fn has_traffic(&self) -> bool {
        match self.plan_traffic {
            None => true,
            Some(traffic) => {
                self.plan_traffic_usage < traffic
                    || self.plan_extra_traffic_usage < self.plan_extra_traffic
            }
        }
    }

    /// A plan is active when it has both remaining time and traffic.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.has_time_at(now) && self.has_traffic()
    }
}

/// A catalog row, credentials and plan embedded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub uuid: Uuid,
    pub user_creation_date: Option<DateTime<Utc>>,
    pub latest_activity: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub plan: Plan,
    pub total_upload: i64,
    pub total_download: i64,
}

impl User {
    pub fn total_traffic(&self) -> Traffic {
        Traffic {
            uplink: self.total_upload,
            downlink: self.total_download,
        }
    }
}

/// A plan queued to replace the current one once it goes inactive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct ReservedPlan {
    pub plan_reserved_date: DateTime<Utc>,
    pub plan_duration: Option<i64>,
    pub plan_traffic: Option<i64>,
}

/// One row of the append-only plan history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: Option<i64>,
    pub date: DateTime<Utc>,
    pub action: PlanUpdateAction,
    pub username: String,
    pub plan_start_date: Option<DateTime<Utc>>,
    pub plan_duration: Option<i64>,
    pub plan_traffic: Option<i64>,
    pub plan_extra_traffic: Option<i64>,
}

/// Full catalog content, as produced by `Catalog::dump` and consumed by
/// `Catalog::restore`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub users: Vec<User>,
    pub reserved_plans: Vec<SnapshotReservedPlan>,
    pub history: Vec<HistoryEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotReservedPlan {
    pub username: String,
    #[serde(flatten)]
    pub plan: ReservedPlan,
}
