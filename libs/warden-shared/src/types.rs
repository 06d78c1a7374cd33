use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Traffic counters in bytes, as reported by a data plane or accumulated
/// in the catalog totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Traffic {
    pub uplink: i64,
    pub downlink: i64,
}

impl Traffic {
    pub fn total(&self) -> i64 {
        self.uplink + self.downlink
    }
}

/// What a user needs to connect to the data planes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub uuid: Uuid,
}

/// The action recorded with every plan-history row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanUpdateAction {
    UpdatePlan,
    UpdatePlanExtraTraffic,
    UpdateReservedPlan,
}

impl PlanUpdateAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UpdatePlan => "update_plan",
            Self::UpdatePlanExtraTraffic => "update_plan_extra_traffic",
            Self::UpdateReservedPlan => "update_reserved_plan",
        }
    }
}

impl std::str::FromStr for PlanUpdateAction {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "update_plan" => Ok(Self::UpdatePlan),
            "update_plan_extra_traffic" => Ok(Self::UpdatePlanExtraTraffic),
            "update_reserved_plan" => Ok(Self::UpdateReservedPlan),
            other => Err(format!("unknown plan update action '{other}'")),
        }
    }
}

impl std::fmt::Display for PlanUpdateAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
