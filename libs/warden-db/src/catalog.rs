use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use warden_shared::fmt::{human_duration, human_size};
use warden_shared::{current_time, Credentials, Error, PlanUpdateAction, Result, Traffic};

use crate::models::{HistoryEntry, Plan, ReservedPlan, Snapshot, SnapshotReservedPlan, User};

pub const USERNAME_MIN_LENGTH: usize = 1;
pub const USERNAME_MAX_LENGTH: usize = 64;

// SQLite extended result codes surfaced by the driver on constraint failures.
const SQLITE_CONSTRAINT_PRIMARYKEY: &str = "1555";
const SQLITE_CONSTRAINT_UNIQUE: &str = "2067";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS users (
        username VARCHAR(64),
        uuid TEXT UNIQUE NOT NULL,
        user_creation_date TEXT,
        latest_activity TEXT,
        plan_start_date TEXT,
        plan_duration INT, /* in seconds */
        plan_traffic BIGINT, /* in bytes */
        plan_traffic_usage BIGINT DEFAULT 0, /* in bytes */
        plan_extra_traffic BIGINT DEFAULT 0, /* in bytes */
        plan_extra_traffic_usage BIGINT DEFAULT 0, /* in bytes */
        total_upload BIGINT DEFAULT 0, /* in bytes */
        total_download BIGINT DEFAULT 0, /* in bytes */
        PRIMARY KEY (username)
    );
    CREATE TABLE IF NOT EXISTS reserved_plans (
        username VARCHAR(64) PRIMARY KEY,
        plan_reserved_date TEXT,
        plan_duration INT, /* in seconds */
        plan_traffic BIGINT, /* in bytes */
        FOREIGN KEY (username) REFERENCES users (username) ON DELETE CASCADE
    );
    CREATE TABLE IF NOT EXISTS history (
        id INTEGER UNIQUE,
        date TEXT,
        action TEXT,
        username VARCHAR(64),
        plan_start_date TEXT,
        plan_duration INT, /* in seconds */
        plan_traffic BIGINT, /* in bytes */
        plan_extra_traffic BIGINT, /* in bytes */
        FOREIGN KEY (username) REFERENCES users (username) ON DELETE CASCADE
    );
";

#[derive(Debug, Clone)]
pub struct CatalogConfig {
    /// Database file location; `None` opens an in-memory catalog
    /// (no backups, used by tests).
    pub path: Option<PathBuf>,
    /// Directory for the generated user list and its timestamp marker.
    pub temp_path: PathBuf,
    /// Hard cap on user rows; 0 means unlimited.
    pub max_users: i64,
    /// Hard cap on users with an active plan; 0 means unlimited.
    pub max_active_users: i64,
    /// Seconds between periodic backups; 0 disables them.
    pub backup_interval: u64,
}

/// Changes applied by [`Catalog::set_plan`].
#[derive(Debug, Clone, Default)]
pub struct PlanUpdate {
    /// Caller-supplied identifier stored with the history row.
    pub id: Option<i64>,
    pub start_date: Option<DateTime<Utc>>,
    pub duration: Option<i64>,
    pub traffic: Option<i64>,
    /// Keep the recorded traffic usage from the previous plan.
    pub preserve_traffic_usage: bool,
}

/// The persistent store of users, plans, reserved plans and history.
///
/// Every process opens its own connection; write-ahead journaling makes
/// concurrent readers plus a single writer safe across processes.
#[derive(Debug, Clone)]
pub struct Catalog {
    pool: SqlitePool,
    config: CatalogConfig,
    backup_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

/// Parses a plan start date given as ISO-8601 or Unix seconds,
/// normalized to UTC with seconds precision.
pub fn parse_date(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(seconds) = value.parse::<i64>() {
        return DateTime::<Utc>::from_timestamp(seconds, 0)
            .ok_or_else(|| Error::Unexpected(format!("timestamp '{seconds}' is out of range")));
    }
    DateTime::parse_from_rfc3339(value)
        .map(|date| date.with_timezone(&Utc) - chrono::TimeDelta::nanoseconds(date.timestamp_subsec_nanos() as i64))
        .map_err(|_| Error::Unexpected(format!("'{value}' is not an ISO-8601 date or Unix timestamp")))
}

/// Validates the username charset and length, returning it lower-cased.
pub fn validate_username(username: &str) -> Result<String> {
    let length = username.len();
    if !(USERNAME_MIN_LENGTH..=USERNAME_MAX_LENGTH).contains(&length)
        || !username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(Error::InvalidUsername(username.to_owned()));
    }
    Ok(username.to_ascii_lowercase())
}

fn unexpected(error: sqlx::Error) -> Error {
    Error::Unexpected(format!("database failure: {error}"))
}

fn row_to_user(row: &SqliteRow) -> Result<User> {
    let uuid: String = row.try_get("uuid").map_err(unexpected)?;
    Ok(User {
        username: row.try_get("username").map_err(unexpected)?,
        uuid: Uuid::parse_str(&uuid).map_err(Error::unexpected)?,
        user_creation_date: row.try_get("user_creation_date").map_err(unexpected)?,
        latest_activity: row.try_get("latest_activity").map_err(unexpected)?,
        plan: Plan {
            plan_start_date: row.try_get("plan_start_date").map_err(unexpected)?,
            plan_duration: row.try_get("plan_duration").map_err(unexpected)?,
            plan_traffic: row.try_get("plan_traffic").map_err(unexpected)?,
            plan_traffic_usage: row.try_get("plan_traffic_usage").map_err(unexpected)?,
            plan_extra_traffic: row.try_get("plan_extra_traffic").map_err(unexpected)?,
            plan_extra_traffic_usage: row
                .try_get("plan_extra_traffic_usage")
                .map_err(unexpected)?,
        },
        total_upload: row.try_get("total_upload").map_err(unexpected)?,
        total_download: row.try_get("total_download").map_err(unexpected)?,
    })
}

fn row_to_history(row: &SqliteRow) -> Result<HistoryEntry> {
    let action: String = row.try_get("action").map_err(unexpected)?;
    Ok(HistoryEntry {
        id: row.try_get("id").map_err(unexpected)?,
        date: row.try_get("date").map_err(unexpected)?,
        action: PlanUpdateAction::from_str(&action).map_err(Error::Unexpected)?,
        username: row.try_get("username").map_err(unexpected)?,
        plan_start_date: row.try_get("plan_start_date").map_err(unexpected)?,
        plan_duration: row.try_get("plan_duration").map_err(unexpected)?,
        plan_traffic: row.try_get("plan_traffic").map_err(unexpected)?,
        plan_extra_traffic: row.try_get("plan_extra_traffic").map_err(unexpected)?,
    })
}

impl Catalog {
    /// Opens (and initializes if missing) the catalog database.
    pub async fn open(config: CatalogConfig) -> Result<Self> {
        let options = match &config.path {
            Some(path) => SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true),
            None => SqliteConnectOptions::new().in_memory(true),
        }
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect_with(options)
            .await
            .map_err(unexpected)?;

        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .map_err(unexpected)?;

        if config.backup_interval == 0 {
            debug!("the catalog backup procedure is disabled");
        }

        Ok(Self {
            pool,
            config,
            backup_task: Arc::new(Mutex::new(None)),
        })
    }

    pub async fn close(&self) {
        self.stop_backup();
        self.pool.close().await;
    }

    pub async fn is_exist(&self, username: &str) -> Result<bool> {
        let username = validate_username(username)?;
        let exist: i64 =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE username = ?)")
                .bind(&username)
                .fetch_one(&self.pool)
                .await
                .map_err(unexpected)?;
        Ok(exist != 0)
    }

    /// Whether the credentials exist in the catalog as given.
    pub async fn validate_credentials(&self, credentials: &Credentials) -> Result<bool> {
        let username = validate_username(&credentials.username)?;
        let exist: i64 = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM users WHERE username = ? AND uuid = ?)",
        )
        .bind(&username)
        .bind(credentials.uuid.to_string())
        .fetch_one(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(exist != 0)
    }

    /// Adds the user, generating a fresh identifier. Retries identifier
    /// collisions up to three times before giving up.
    pub async fn add_user(&self, username: &str) -> Result<Credentials> {
        let username = validate_username(username)?;
        if self.has_no_capacity().await? {
            return Err(Error::UsersCapacity);
        } else if self.has_no_active_capacity().await? {
            return Err(Error::ActiveUsersCapacity);
        }

        for retry in 0..3 {
            let uuid = Uuid::new_v4();
            let inserted = sqlx::query(
                "INSERT INTO users (username, uuid, user_creation_date) VALUES (?, ?, ?)",
            )
            .bind(&username)
            .bind(uuid.to_string())
            .bind(current_time())
            .execute(&self.pool)
            .await;

            match inserted {
                Ok(_) => {
                    debug!("user '{username}' is added to the catalog");
                    return Ok(Credentials { username, uuid });
                }
                Err(error) => {
                    let code = error
                        .as_database_error()
                        .and_then(|db| db.code())
                        .map(|code| code.into_owned());
                    match code.as_deref() {
                        Some(SQLITE_CONSTRAINT_PRIMARYKEY) => {
                            return Err(Error::UserExist(username));
                        }
                        Some(SQLITE_CONSTRAINT_UNIQUE) if retry < 2 => continue,
                        Some(SQLITE_CONSTRAINT_UNIQUE) => return Err(Error::UuidOverlap),
                        _ => return Err(unexpected(error)),
                    }
                }
            }
        }
        Err(Error::UuidOverlap)
    }

    /// Deletes the user; the reserved plan and history rows cascade.
    pub async fn delete_user(&self, username: &str) -> Result<()> {
        let username = validate_username(username)?;
        let result = sqlx::query("DELETE FROM users WHERE username = ?")
            .bind(&username)
            .execute(&self.pool)
            .await
            .map_err(unexpected)?;
        if result.rows_affected() == 0 {
            return Err(Error::UserNotExist(username));
        }
        debug!("user '{username}' is deleted from the catalog");
        Ok(())
    }

    pub async fn get_credentials(&self, username: &str) -> Result<Credentials> {
        let username = validate_username(username)?;
        let row = sqlx::query("SELECT username, uuid FROM users WHERE username = ?")
            .bind(&username)
            .fetch_optional(&self.pool)
            .await
            .map_err(unexpected)?
            .ok_or(Error::UserNotExist(username))?;
        let uuid: String = row.try_get("uuid").map_err(unexpected)?;
        Ok(Credentials {
            username: row.try_get("username").map_err(unexpected)?,
            uuid: Uuid::parse_str(&uuid).map_err(Error::unexpected)?,
        })
    }

    pub async fn get_user(&self, username: &str) -> Result<User> {
        let username = validate_username(username)?;
        let row = sqlx::query("SELECT * FROM users WHERE username = ?")
            .bind(&username)
            .fetch_optional(&self.pool)
            .await
            .map_err(unexpected)?
            .ok_or(Error::UserNotExist(username))?;
        row_to_user(&row)
    }

    pub async fn get_plan(&self, username: &str) -> Result<Plan> {
        let username = validate_username(username)?;
        sqlx::query_as::<_, Plan>(
            "SELECT plan_start_date, plan_duration, plan_traffic, plan_traffic_usage, \
             plan_extra_traffic, plan_extra_traffic_usage FROM users WHERE username = ?",
        )
        .bind(&username)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?
        .ok_or(Error::UserNotExist(username))
    }

    pub async fn get_reserved_plan(&self, username: &str) -> Result<Option<ReservedPlan>> {
        let username = validate_username(username)?;
        if !self.is_exist(&username).await? {
            return Err(Error::UserNotExist(username));
        }
        sqlx::query_as::<_, ReservedPlan>(
            "SELECT plan_reserved_date, plan_duration, plan_traffic \
             FROM reserved_plans WHERE username = ?",
        )
        .bind(&username)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)
    }

    pub async fn get_total_traffic(&self, username: &str) -> Result<Traffic> {
        let username = validate_username(username)?;
        let row =
            sqlx::query("SELECT total_upload, total_download FROM users WHERE username = ?")
                .bind(&username)
                .fetch_optional(&self.pool)
                .await
                .map_err(unexpected)?
                .ok_or(Error::UserNotExist(username))?;
        Ok(Traffic {
            uplink: row.try_get("total_upload").map_err(unexpected)?,
            downlink: row.try_get("total_download").map_err(unexpected)?,
        })
    }

    pub async fn get_latest_activity(&self, username: &str) -> Result<Option<DateTime<Utc>>> {
        let username = validate_username(username)?;
        sqlx::query_scalar("SELECT latest_activity FROM users WHERE username = ?")
            .bind(&username)
            .fetch_optional(&self.pool)
            .await
            .map_err(unexpected)?
            .ok_or(Error::UserNotExist(username))
    }

    /// Users with a recorded activity, optionally only those active
    /// since `from`.
    pub async fn get_latest_activities(
        &self,
        from: Option<DateTime<Utc>>,
    ) -> Result<Vec<(String, DateTime<Utc>)>> {
        let rows = match from {
            Some(from) => sqlx::query(
                "SELECT username, latest_activity FROM users \
                 WHERE latest_activity IS NOT NULL AND latest_activity >= ? ORDER BY username",
            )
            .bind(from)
            .fetch_all(&self.pool)
            .await,
            None => sqlx::query(
                "SELECT username, latest_activity FROM users \
                 WHERE latest_activity IS NOT NULL ORDER BY username",
            )
            .fetch_all(&self.pool)
            .await,
        }
        .map_err(unexpected)?;

        rows.iter()
            .map(|row| {
                Ok((
                    row.try_get("username").map_err(unexpected)?,
                    row.try_get("latest_activity").map_err(unexpected)?,
                ))
            })
            .collect()
    }

    /// Records a session observation for the user. Called by the data
    /// planes' per-session reporter, not by the control plane itself.
    pub async fn record_activity(&self, username: &str, when: DateTime<Utc>) -> Result<()> {
        let username = validate_username(username)?;
        let result = sqlx::query("UPDATE users SET latest_activity = ? WHERE username = ?")
            .bind(when)
            .bind(&username)
            .execute(&self.pool)
            .await
            .map_err(unexpected)?;
        if result.rows_affected() == 0 {
            return Err(Error::UserNotExist(username));
        }
        Ok(())
    }

    /// Replaces the user's plan, appending a history row in the same
    /// transaction. Remaining extra traffic is flattened into the new
    /// plan; recorded usage resets unless preserved.
    pub async fn set_plan(&self, username: &str, update: PlanUpdate) -> Result<()> {
        self.set_plan_inner(username, update, false).await
    }

    async fn set_plan_inner(
        &self,
        username: &str,
        update: PlanUpdate,
        unset_reserved: bool,
    ) -> Result<()> {
        let username = validate_username(username)?;
        match (update.start_date, update.duration) {
            (Some(_), None) => {
                return Err(Error::Unexpected(
                    "the 'duration' parameter must be specified".into(),
                ));
            }
            (None, Some(_)) => {
                return Err(Error::Unexpected(
                    "the 'start_date' parameter must be specified".into(),
                ));
            }
            _ => {}
        }
        if update.duration.is_some_and(|duration| duration <= 0) {
            return Err(Error::Unexpected(
                "the 'duration' parameter should be greater than zero".into(),
            ));
        }
        if update.traffic.is_some_and(|traffic| traffic <= 0) {
            return Err(Error::Unexpected(
                "the 'traffic' parameter should be greater than zero".into(),
            ));
        }

        let start_date = update
            .start_date
            .map(|date| date - chrono::TimeDelta::nanoseconds(date.timestamp_subsec_nanos() as i64));
        // Usage survives a plan change only when explicitly preserved on
        // a plan that still has a traffic limit.
        let usage_reset: Option<i64> = match update.traffic {
            Some(_) if update.preserve_traffic_usage => None,
            Some(_) => Some(0),
            None => None,
        };

        let mut tx = self.pool.begin().await.map_err(unexpected)?;
        let result = sqlx::query(
            "UPDATE users SET \
                plan_start_date = ?, \
                plan_duration = ?, \
                plan_traffic = ?, \
                plan_traffic_usage = IFNULL(?, plan_traffic_usage), \
                /* flattening the remaining traffic and ignoring the negative values */ \
                plan_extra_traffic = MAX(plan_extra_traffic - plan_extra_traffic_usage, 0), \
                plan_extra_traffic_usage = 0 \
             WHERE username = ?",
        )
        .bind(start_date)
        .bind(update.duration)
        .bind(update.traffic)
        .bind(usage_reset)
        .bind(&username)
        .execute(&mut *tx)
        .await
        .map_err(unexpected)?;
        if result.rows_affected() == 0 {
            return Err(Error::UserNotExist(username));
        }

        sqlx::query(
            "INSERT INTO history (id, date, action, username, plan_start_date, plan_duration, plan_traffic) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(update.id)
        .bind(current_time())
        .bind(PlanUpdateAction::UpdatePlan.as_str())
        .bind(&username)
        .bind(start_date)
        .bind(update.duration)
        .bind(update.traffic)
        .execute(&mut *tx)
        .await
        .map_err(unexpected)?;

        if unset_reserved {
            sqlx::query("DELETE FROM reserved_plans WHERE username = ?")
                .bind(&username)
                .execute(&mut *tx)
                .await
                .map_err(unexpected)?;
        }
        tx.commit().await.map_err(unexpected)?;

        debug!(
            "plan is updated for user '{}' {}with '{}' time and '{}' traffic",
            username,
            start_date
                .map(|date| format!("starting from '{date}' "))
                .unwrap_or_default(),
            update
                .duration
                .map(human_duration)
                .unwrap_or_else(|| "unlimited".into()),
            update
                .traffic
                .map(human_size)
                .unwrap_or_else(|| "unlimited".into()),
        );
        Ok(())
    }

    /// Appends to (or resets, when `extra_traffic` is `None`) the plan's
    /// extra traffic limit.
    pub async fn set_plan_extra_traffic(
        &self,
        username: &str,
        id: Option<i64>,
        extra_traffic: Option<i64>,
    ) -> Result<()> {
        let username = validate_username(username)?;
        if let Some(extra) = extra_traffic {
            if extra <= 0 {
                return Err(Error::Unexpected(
                    "the 'extra_traffic' parameter should be greater than zero".into(),
                ));
            }
            if self.get_plan(&username).await?.is_unlimited_traffic() {
                return Err(Error::NoTrafficLimit(username));
            }
        }

        let mut tx = self.pool.begin().await.map_err(unexpected)?;
        let result = sqlx::query(
            "UPDATE users SET \
                /* flattening the remaining traffic and ignoring the negative values */ \
                plan_extra_traffic = MAX(IFNULL(plan_extra_traffic + ? - plan_extra_traffic_usage, 0), 0), \
                plan_extra_traffic_usage = 0 \
             WHERE username = ?",
        )
        .bind(extra_traffic)
        .bind(&username)
        .execute(&mut *tx)
        .await
        .map_err(unexpected)?;
        if result.rows_affected() == 0 {
            return Err(Error::UserNotExist(username));
        }

        sqlx::query(
            "INSERT INTO history (id, date, action, username, plan_extra_traffic) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(current_time())
        .bind(PlanUpdateAction::UpdatePlanExtraTraffic.as_str())
        .bind(&username)
        .bind(extra_traffic)
        .execute(&mut *tx)
        .await
        .map_err(unexpected)?;
        tx.commit().await.map_err(unexpected)?;

        debug!(
            "{} plan extra traffic for user '{username}'",
            extra_traffic
                .map(|extra| format!("appended '{}'", human_size(extra)))
                .unwrap_or_else(|| "reset the".into()),
        );
        Ok(())
    }

    /// Creates or replaces the user's reserved plan. The user must
    /// currently have an active plan.
    pub async fn set_reserved_plan(
        &self,
        username: &str,
        id: Option<i64>,
        duration: Option<i64>,
        traffic: Option<i64>,
    ) -> Result<()> {
        let username = validate_username(username)?;
        if duration.is_some_and(|duration| duration <= 0) {
            return Err(Error::Unexpected(
                "the 'duration' parameter should be greater than zero".into(),
            ));
        }
        if traffic.is_some_and(|traffic| traffic <= 0) {
            return Err(Error::Unexpected(
                "the 'traffic' parameter should be greater than zero".into(),
            ));
        }
        if !self.has_active_plan(&username).await? {
            return Err(Error::NoActivePlan(username));
        }

        let reserved_date = current_time();
        let mut tx = self.pool.begin().await.map_err(unexpected)?;
        sqlx::query(
            "INSERT INTO reserved_plans (username, plan_reserved_date, plan_duration, plan_traffic) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT (username) DO UPDATE SET \
                plan_reserved_date = ?, plan_duration = ?, plan_traffic = ?",
        )
        .bind(&username)
        .bind(reserved_date)
        .bind(duration)
        .bind(traffic)
        .bind(reserved_date)
        .bind(duration)
        .bind(traffic)
        .execute(&mut *tx)
        .await
        .map_err(unexpected)?;

        sqlx::query(
            "INSERT INTO history (id, date, action, username, plan_duration, plan_traffic) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(current_time())
        .bind(PlanUpdateAction::UpdateReservedPlan.as_str())
        .bind(&username)
        .bind(duration)
        .bind(traffic)
        .execute(&mut *tx)
        .await
        .map_err(unexpected)?;
        tx.commit().await.map_err(unexpected)?;

        info!(
            "reserved plan is updated for user '{username}' with '{}' time and '{}' traffic",
            duration.map(human_duration).unwrap_or_else(|| "unlimited".into()),
            traffic.map(human_size).unwrap_or_else(|| "unlimited".into()),
        );
        Ok(())
    }

    pub async fn unset_reserved_plan(&self, username: &str) -> Result<()> {
        let username = validate_username(username)?;
        if !self.is_exist(&username).await? {
            return Err(Error::UserNotExist(username));
        }
        let result = sqlx::query("DELETE FROM reserved_plans WHERE username = ?")
            .bind(&username)
            .execute(&self.pool)
            .await
            .map_err(unexpected)?;
        if result.rows_affected() > 0 {
            info!("reserved plan is removed for user '{username}'");
        }
        Ok(())
    }

    /// Replaces the current plan with the reserved one, removing the
    /// reserved row in the same transaction. Returns whether a reserved
    /// plan existed to activate.
    pub async fn activate_reserved_plan(&self, username: &str) -> Result<bool> {
        let Some(reserved) = self.get_reserved_plan(username).await? else {
            return Ok(false);
        };
        let update = PlanUpdate {
            id: None,
            start_date: reserved.plan_duration.map(|_| current_time()),
            duration: reserved.plan_duration,
            traffic: reserved.plan_traffic,
            preserve_traffic_usage: false,
        };
        self.set_plan_inner(username, update, true).await?;
        info!("reserved plan is activated for user '{username}'");
        Ok(true)
    }

    pub async fn reset_total_traffic(&self, username: &str) -> Result<()> {
        let username = validate_username(username)?;
        let result =
            sqlx::query("UPDATE users SET total_upload = 0, total_download = 0 WHERE username = ?")
                .bind(&username)
                .execute(&self.pool)
                .await
                .map_err(unexpected)?;
        if result.rows_affected() == 0 {
            return Err(Error::UserNotExist(username));
        }
        info!("the total consumed traffic is reset for user '{username}'");
        Ok(())
    }

    /// Appends the user's traffic counters by the given deltas.
    pub async fn update_traffic(
        &self,
        username: &str,
        traffic_usage: i64,
        extra_traffic_usage: i64,
        upload: i64,
        download: i64,
    ) -> Result<()> {
        let username = validate_username(username)?;
        sqlx::query(
            "UPDATE users SET \
                plan_traffic_usage = plan_traffic_usage + ?, \
                plan_extra_traffic_usage = plan_extra_traffic_usage + ?, \
                total_upload = total_upload + ?, \
                total_download = total_download + ? \
             WHERE username = ?",
        )
        .bind(traffic_usage)
        .bind(extra_traffic_usage)
        .bind(upload)
        .bind(download)
        .bind(&username)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(())
    }

    pub async fn has_active_plan(&self, username: &str) -> Result<bool> {
        Ok(self.get_plan(username).await?.is_active_at(current_time()))
    }

    pub async fn has_active_plan_time(&self, username: &str) -> Result<bool> {
        Ok(self.get_plan(username).await?.has_time_at(current_time()))
    }

    pub async fn has_active_plan_traffic(&self, username: &str) -> Result<bool> {
        Ok(self.get_plan(username).await?.has_traffic())
    }

    pub async fn has_unlimited_time_plan(&self, username: &str) -> Result<bool> {
        Ok(self.get_plan(username).await?.is_unlimited_time())
    }

    pub async fn has_unlimited_traffic_plan(&self, username: &str) -> Result<bool> {
        Ok(self.get_plan(username).await?.is_unlimited_traffic())
    }

    pub async fn usernames(&self) -> Result<Vec<String>> {
        sqlx::query_scalar("SELECT username FROM users ORDER BY username")
            .fetch_all(&self.pool)
            .await
            .map_err(unexpected)
    }

    /// The count of all users.
    pub async fn capacity(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool)
            .await
            .map_err(unexpected)
    }

    /// The count of users with an active plan.
    pub async fn active_capacity(&self) -> Result<i64> {
        let now = current_time();
        let plans = sqlx::query_as::<_, Plan>(
            "SELECT plan_start_date, plan_duration, plan_traffic, plan_traffic_usage, \
             plan_extra_traffic, plan_extra_traffic_usage FROM users",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(plans.iter().filter(|plan| plan.is_active_at(now)).count() as i64)
    }

    pub async fn has_no_capacity(&self) -> Result<bool> {
        Ok(self.config.max_users > 0 && self.capacity().await? >= self.config.max_users)
    }

    pub async fn has_no_active_capacity(&self) -> Result<bool> {
        Ok(self.config.max_active_users > 0
            && self.active_capacity().await? >= self.config.max_active_users)
    }

    pub async fn get_plan_history(&self, username: &str) -> Result<Vec<HistoryEntry>> {
        let username = validate_username(username)?;
        let rows = sqlx::query("SELECT * FROM history WHERE username = ? ORDER BY rowid")
            .bind(&username)
            .fetch_all(&self.pool)
            .await
            .map_err(unexpected)?;
        rows.iter().map(row_to_history).collect()
    }

    /// Writes the credentials of every user with an active plan to
    /// `<temp_path>/users`, then stamps `<temp_path>/last-generate`.
    /// The data planes block on this list at their own boot.
    pub async fn generate_list(&self) -> Result<()> {
        let last_generate = self.config.temp_path.join("last-generate");
        tokio::fs::write(&last_generate, "")
            .await
            .map_err(Error::unexpected)?;

        let now = current_time();
        let rows = sqlx::query("SELECT * FROM users ORDER BY username")
            .fetch_all(&self.pool)
            .await
            .map_err(unexpected)?;
        let mut list = String::new();
        for row in &rows {
            let user = row_to_user(row)?;
            if user.plan.is_active_at(now) {
                list.push_str(&format!("{} {}\n", user.username, user.uuid));
            }
        }

        tokio::fs::write(self.config.temp_path.join("users"), list)
            .await
            .map_err(Error::unexpected)?;
        tokio::fs::write(&last_generate, now.timestamp().to_string())
            .await
            .map_err(Error::unexpected)?;
        debug!("the users list is generated");
        Ok(())
    }

    /// The current state of the catalog.
    pub async fn dump(&self) -> Result<Snapshot> {
        let users = sqlx::query("SELECT * FROM users ORDER BY username")
            .fetch_all(&self.pool)
            .await
            .map_err(unexpected)?
            .iter()
            .map(row_to_user)
            .collect::<Result<Vec<_>>>()?;

        let reserved = sqlx::query("SELECT * FROM reserved_plans ORDER BY username")
            .fetch_all(&self.pool)
            .await
            .map_err(unexpected)?;
        let mut reserved_plans = Vec::with_capacity(reserved.len());
        for row in &reserved {
            reserved_plans.push(SnapshotReservedPlan {
                username: row.try_get("username").map_err(unexpected)?,
                plan: ReservedPlan {
                    plan_reserved_date: row.try_get("plan_reserved_date").map_err(unexpected)?,
                    plan_duration: row.try_get("plan_duration").map_err(unexpected)?,
                    plan_traffic: row.try_get("plan_traffic").map_err(unexpected)?,
                },
            });
        }

        let history = sqlx::query("SELECT * FROM history ORDER BY rowid")
            .fetch_all(&self.pool)
            .await
            .map_err(unexpected)?
            .iter()
            .map(row_to_history)
            .collect::<Result<Vec<_>>>()?;

        Ok(Snapshot {
            users,
            reserved_plans,
            history,
        })
    }

    /// Loads a snapshot into the catalog. Intended for restoring into an
    /// empty database.
    pub async fn restore(&self, snapshot: &Snapshot) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(unexpected)?;
        for user in &snapshot.users {
            sqlx::query(
                "INSERT INTO users (username, uuid, user_creation_date, latest_activity, \
                    plan_start_date, plan_duration, plan_traffic, plan_traffic_usage, \
                    plan_extra_traffic, plan_extra_traffic_usage, total_upload, total_download) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&user.username)
            .bind(user.uuid.to_string())
            .bind(user.user_creation_date)
            .bind(user.latest_activity)
            .bind(user.plan.plan_start_date)
            .bind(user.plan.plan_duration)
            .bind(user.plan.plan_traffic)
            .bind(user.plan.plan_traffic_usage)
            .bind(user.plan.plan_extra_traffic)
            .bind(user.plan.plan_extra_traffic_usage)
            .bind(user.total_upload)
            .bind(user.total_download)
            .execute(&mut *tx)
            .await
            .map_err(unexpected)?;
        }
        for reserved in &snapshot.reserved_plans {
            sqlx::query(
                "INSERT INTO reserved_plans (username, plan_reserved_date, plan_duration, plan_traffic) \
                 VALUES (?, ?, ?, ?)",
            )
            .bind(&reserved.username)
            .bind(reserved.plan.plan_reserved_date)
            .bind(reserved.plan.plan_duration)
            .bind(reserved.plan.plan_traffic)
            .execute(&mut *tx)
            .await
            .map_err(unexpected)?;
        }
        for entry in &snapshot.history {
            sqlx::query(
                "INSERT INTO history (id, date, action, username, plan_start_date, \
                    plan_duration, plan_traffic, plan_extra_traffic) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(entry.id)
            .bind(entry.date)
            .bind(entry.action.as_str())
            .bind(&entry.username)
            .bind(entry.plan_start_date)
            .bind(entry.plan_duration)
            .bind(entry.plan_traffic)
            .bind(entry.plan_extra_traffic)
            .execute(&mut *tx)
            .await
            .map_err(unexpected)?;
        }
        tx.commit().await.map_err(unexpected)?;
        info!(
            "restored {} users into the catalog",
            snapshot.users.len()
        );
        Ok(())
    }

    /// Copies the database into the backup directory with `VACUUM INTO`,
    /// which compacts pages without blocking writers.
    pub async fn backup(&self, suffix: Option<&str>) -> Result<PathBuf> {
        let Some(path) = &self.config.path else {
            return Err(Error::Unexpected(
                "cannot back up an in-memory catalog".into(),
            ));
        };
        let suffix = match suffix {
            Some(suffix) => suffix.to_owned(),
            None => current_time().format(".%Y%m%d%H%M%S.bak").to_string(),
        };
        let backup_dir = path.with_file_name("backup");
        tokio::fs::create_dir_all(&backup_dir)
            .await
            .map_err(Error::unexpected)?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "catalog.db".into());
        let target = backup_dir.join(format!("{file_name}{suffix}"));

        sqlx::query("VACUUM INTO ?")
            .bind(target.to_string_lossy().into_owned())
            .execute(&self.pool)
            .await
            .map_err(unexpected)?;
        info!("the catalog is backed up to '{}'", target.display());
        Ok(target)
    }

    /// Starts the periodic backup task. A no-op when the configured
    /// interval is zero or the task is already running.
    pub fn start_backup(&self) {
        if self.config.backup_interval == 0 {
            return;
        }
        let mut slot = self.backup_task.lock().unwrap();
        if slot.is_some() {
            warn!("the catalog backup procedure is already running");
            return;
        }
        let catalog = self.clone();
        let interval = Duration::from_secs(self.config.backup_interval);
        *slot = Some(tokio::spawn(async move {
            info!("the catalog backup procedure is started");
            loop {
                tokio::time::sleep(interval).await;
                if let Err(error) = catalog.backup(None).await {
                    error!("the catalog backup failed: {error}");
                }
            }
        }));
    }

    pub fn stop_backup(&self) {
        if let Some(task) = self.backup_task.lock().unwrap().take() {
            task.abort();
            info!("the catalog backup procedure is stopped");
        }
    }
}
