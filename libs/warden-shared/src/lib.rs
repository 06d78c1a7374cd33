pub mod error;
pub mod fmt;
pub mod types;

pub use error::{Error, Result, SerializedError};
pub use types::{Credentials, PlanUpdateAction, Traffic};

use chrono::{DateTime, SubsecRound, Utc};

/// Current UTC time truncated to whole seconds, the precision every
/// date stored in the catalog carries.
pub fn current_time() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}
