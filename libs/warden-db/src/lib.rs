pub mod catalog;
pub mod models;

#[cfg(test)]
mod tests;

pub use catalog::{parse_date, validate_username, Catalog, CatalogConfig, PlanUpdate};
pub use models::{HistoryEntry, Plan, ReservedPlan, Snapshot, User};
