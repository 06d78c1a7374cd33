use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use warden_db::{parse_date, Catalog, CatalogConfig};
use warden_shared::{Error, Result};

use crate::config::Config;
use crate::reconciler::{PlanChange, Reconciler};
use crate::services;
use crate::state::StateHandle;

#[derive(Debug, Parser)]
#[command(
    name = "warden",
    version,
    about = "User-lifecycle control plane for the proxy and VPN data planes",
    after_help = "Run 'warden COMMAND --help' for more information on a command"
)]
pub struct Cli {
    /// Show more log
    #[arg(long, global = true)]
    pub debug: bool,

    /// Configuration file (defaults to the CONFIG_PATH environment variable)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Manage the users
    User(UserArgs),
    /// Update the user's plan
    Plan(PlanArgs),
    /// Update the user's reserved plan
    ReservedPlan(ReservedPlanArgs),
    /// Get the users' info
    Info(InfoArgs),
    /// Manage the catalog database
    Database(DatabaseArgs),
    /// Administrative API worker entry (spawned by the daemon)
    #[command(hide = true)]
    Worker,
}

#[derive(Debug, Args)]
pub struct UserArgs {
    /// The user's username. Multiple usernames could be specified
    #[arg(required = true)]
    pub usernames: Vec<String>,
    /// Add a user
    #[arg(short, long)]
    pub add: bool,
    /// Delete a user
    #[arg(short, long, conflicts_with = "add")]
    pub delete: bool,
    /// Reset the user's total traffic consumption
    #[arg(long)]
    pub reset_total_traffic: bool,
    /// Ignore failures to reflect the changes to the services and
    /// perform the action anyway
    #[arg(long)]
    pub force: bool,
}

#[derive(Debug, Args)]
pub struct PlanArgs {
    /// The user's username. Multiple usernames could be specified
    #[arg(required = true)]
    pub usernames: Vec<String>,
    /// Plan start date as ISO-8601 or Unix seconds
    #[arg(long)]
    pub start_date: Option<String>,
    /// Plan duration in seconds
    #[arg(long)]
    pub duration: Option<i64>,
    /// Plan traffic limit in bytes
    #[arg(long)]
    pub traffic: Option<i64>,
    /// Plan extra traffic limit in bytes
    #[arg(long)]
    pub extra_traffic: Option<i64>,
    /// Reset the plan extra traffic limit
    #[arg(long, conflicts_with = "extra_traffic")]
    pub reset_extra_traffic: bool,
    /// Keep the recorded traffic usage from the previous plan
    #[arg(long)]
    pub preserve_traffic: bool,
    /// Identifier stored with the plan history rows
    #[arg(long)]
    pub id: Option<i64>,
}

#[derive(Debug, Args)]
pub struct ReservedPlanArgs {
    /// The user's username. Multiple usernames could be specified
    #[arg(required = true)]
    pub usernames: Vec<String>,
    /// Reserved plan duration in seconds
    #[arg(long)]
    pub duration: Option<i64>,
    /// Reserved plan traffic limit in bytes
    #[arg(long)]
    pub traffic: Option<i64>,
    /// Remove the reserved plan
    #[arg(long)]
    pub remove: bool,
    /// Identifier stored with the plan history rows
    #[arg(long)]
    pub id: Option<i64>,
}

#[derive(Debug, Args)]
pub struct InfoArgs {
    /// The user's username. Multiple usernames could be specified
    pub usernames: Vec<String>,
    /// List all the users
    #[arg(long)]
    pub users: bool,
    /// The count of all the users
    #[arg(long)]
    pub capacity: bool,
    /// The count of the users that have an active plan
    #[arg(long)]
    pub active_capacity: bool,
    /// The user's credentials
    #[arg(long)]
    pub credentials: bool,
    /// The user's plan
    #[arg(long)]
    pub plan: bool,
    /// The user's reserved plan
    #[arg(long)]
    pub reserved_plan: bool,
    /// The user's plan history
    #[arg(long)]
    pub plan_history: bool,
    /// The user's total traffic consumption
    #[arg(long)]
    pub total_traffic: bool,
    /// The user's latest activity time
    #[arg(long)]
    pub latest_activity: bool,
    /// All the users' latest activity times
    #[arg(long)]
    pub latest_activities: bool,
    /// Only activities at or after this date (with --latest-activities)
    #[arg(long)]
    pub from: Option<String>,
    /// Whether the user exists
    #[arg(long)]
    pub is_exist: bool,
    /// Whether the user has an active plan
    #[arg(long)]
    pub has_active_plan: bool,
    /// Whether the user's plan has remaining time
    #[arg(long)]
    pub has_active_plan_time: bool,
    /// Whether the user's plan has remaining traffic
    #[arg(long)]
    pub has_active_plan_traffic: bool,
    /// Whether the user's plan has no time limit
    #[arg(long)]
    pub has_unlimited_time: bool,
    /// Whether the user's plan has no traffic limit
    #[arg(long)]
    pub has_unlimited_traffic: bool,
    /// Whether the user capacity limit is reached
    #[arg(long)]
    pub has_no_capacity: bool,
    /// Whether the active user capacity limit is reached
    #[arg(long)]
    pub has_no_active_capacity: bool,
    /// The user's subscription URLs
    #[arg(long)]
    pub subscription: bool,
}

#[derive(Debug, Args)]
pub struct DatabaseArgs {
    /// Synchronize the services with the catalog
    #[arg(long)]
    pub sync: bool,
    /// Print the catalog content as JSON
    #[arg(long)]
    pub dump: bool,
    /// Back the catalog up, with an optional file name suffix
    #[arg(long, num_args = 0..=1, default_missing_value = "")]
    pub backup: Option<String>,
}

/// Runs a subcommand to completion. Returns the process exit code:
/// 0 on success, 1 on any handled error.
pub async fn execute(command: Command, config: &Config) -> i32 {
    match run(command, config).await {
        Ok(()) => 0,
        Err(error) => {
            eprintln!("{}", render(&error));
            1
        }
    }
}

async fn run(command: Command, config: &Config) -> Result<()> {
    let catalog = open_catalog(config).await?;
    let result = match command {
        Command::User(args) => user(args, config, &catalog).await,
        Command::Plan(args) => plan(args, config, &catalog).await,
        Command::ReservedPlan(args) => reserved_plan(args, &catalog).await,
        Command::Info(args) => info(args, config, &catalog).await,
        Command::Database(args) => database(args, config, &catalog).await,
        Command::Worker => unreachable!("the worker runs through its own entry point"),
    };
    catalog.close().await;
    result
}

async fn open_catalog(config: &Config) -> Result<Catalog> {
    Catalog::open(CatalogConfig {
        path: Some(config.database.path.clone()),
        temp_path: config.main.temp_path.clone(),
        max_users: config.main.max_users,
        max_active_users: config.main.max_active_users,
        backup_interval: config.database.backup_interval.max(0) as u64,
    })
    .await
}

/// Builds a reconciler whose state client degrades quietly when the
/// daemon (and thus the synchronizer) is not running.
async fn build_reconciler(config: &Config, catalog: &Catalog) -> Result<Arc<Reconciler>> {
    let state = StateHandle::new(config.state_socket_path(), config.api.key.clone());
    state.connect(Duration::from_secs(3), true).await?;
    let services = services::build(config)?;
    Ok(Arc::new(Reconciler::new(
        catalog.clone(),
        services,
        state,
    )))
}

fn unique(usernames: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    usernames
        .into_iter()
        .filter(|username| seen.insert(username.clone()))
        .collect()
}

async fn user(args: UserArgs, config: &Config, catalog: &Catalog) -> Result<()> {
    if !args.add && !args.delete && !args.reset_total_traffic {
        return Err(Error::Unexpected(
            "no action specified; use --add, --delete or --reset-total-traffic".into(),
        ));
    }

    let mut failed = false;
    let reconciler = if args.add || args.delete {
        Some(build_reconciler(config, catalog).await?)
    } else {
        None
    };

    for username in unique(args.usernames) {
        let result = async {
            if args.add {
                let reconciler = reconciler.as_ref().expect("built for --add");
                match reconciler.add_user(&username, args.force).await {
                    Ok(credentials) => {
                        println!("{} {}", credentials.username, credentials.uuid);
                        Ok(())
                    }
                    Err(error) => {
                        // A forced add still hands the credentials back.
                        if let Error::Synchronization {
                            payload: Some(payload),
                            ..
                        } = &error
                        {
                            if let (Some(username), Some(uuid)) = (
                                payload.get("username").and_then(|v| v.as_str()),
                                payload.get("uuid").and_then(|v| v.as_str()),
                            ) {
                                println!("{username} {uuid}");
                            }
                        }
                        Err(error)
                    }
                }
            } else if args.delete {
                let reconciler = reconciler.as_ref().expect("built for --delete");
                reconciler.delete_user(&username, args.force).await
            } else {
                catalog.reset_total_traffic(&username).await
            }
        }
        .await;

        if let Err(error) = result {
            eprintln!("{}", render(&error));
            failed = true;
        }
    }
    if failed {
        // The individual failures were already printed.
        return Err(Error::Unexpected("not all operations succeeded".into()));
    }
    Ok(())
}

async fn plan(args: PlanArgs, config: &Config, catalog: &Catalog) -> Result<()> {
    let reconciler = build_reconciler(config, catalog).await?;
    let start_date = args
        .start_date
        .as_deref()
        .map(parse_date)
        .transpose()?;

    let mut failed = false;
    for username in unique(args.usernames) {
        let change = PlanChange {
            id: args.id,
            start_date,
            duration: args.duration,
            traffic: args.traffic,
            extra_traffic: args.extra_traffic,
            reset_extra_traffic: args.reset_extra_traffic,
            preserve_traffic_usage: args.preserve_traffic,
        };
        if let Err(error) = reconciler.update_plan(&username, change).await {
            eprintln!("{}", render(&error));
            failed = true;
        }
    }
    if failed {
        return Err(Error::Unexpected("not all operations succeeded".into()));
    }
    Ok(())
}

async fn reserved_plan(args: ReservedPlanArgs, catalog: &Catalog) -> Result<()> {
    let mut failed = false;
    for username in unique(args.usernames) {
        let result = if args.remove {
            catalog.unset_reserved_plan(&username).await
        } else {
            catalog
                .set_reserved_plan(&username, args.id, args.duration, args.traffic)
                .await
        };
        if let Err(error) = result {
            eprintln!("{}", render(&error));
            failed = true;
        }
    }
    if failed {
        return Err(Error::Unexpected("not all operations succeeded".into()));
    }
    Ok(())
}

async fn info(args: InfoArgs, config: &Config, catalog: &Catalog) -> Result<()> {
    if args.users {
        for username in catalog.usernames().await? {
            println!("{username}");
        }
    }
    if args.capacity {
        println!("{}", catalog.capacity().await?);
    }
    if args.active_capacity {
        println!("{}", catalog.active_capacity().await?);
    }
    if args.has_no_capacity {
        println!("{}", catalog.has_no_capacity().await?);
    }
    if args.has_no_active_capacity {
        println!("{}", catalog.has_no_active_capacity().await?);
    }
    if args.latest_activities {
        let from = args.from.as_deref().map(parse_date).transpose()?;
        for (username, activity) in catalog.get_latest_activities(from).await? {
            println!("{username} {}", activity.to_rfc3339());
        }
    }

    for username in unique(args.usernames) {
        if args.is_exist {
            println!("{}", catalog.is_exist(&username).await?);
        }
        if args.credentials {
            let credentials = catalog.get_credentials(&username).await?;
            println!("{} {}", credentials.username, credentials.uuid);
        }
        if args.plan {
            let plan = catalog.get_plan(&username).await?;
            println!("{}", serde_json::to_string_pretty(&plan).unwrap_or_default());
        }
        if args.reserved_plan {
            match catalog.get_reserved_plan(&username).await? {
                Some(reserved) => println!(
                    "{}",
                    serde_json::to_string_pretty(&reserved).unwrap_or_default()
                ),
                None => println!("null"),
            }
        }
        if args.plan_history {
            let history = catalog.get_plan_history(&username).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&history).unwrap_or_default()
            );
        }
        if args.total_traffic {
            let traffic = catalog.get_total_traffic(&username).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&traffic).unwrap_or_default()
            );
        }
        if args.latest_activity {
            match catalog.get_latest_activity(&username).await? {
                Some(activity) => println!("{}", activity.to_rfc3339()),
                None => println!("null"),
            }
        }
        if args.has_active_plan {
            println!("{}", catalog.has_active_plan(&username).await?);
        }
        if args.has_active_plan_time {
            println!("{}", catalog.has_active_plan_time(&username).await?);
        }
        if args.has_active_plan_traffic {
            println!("{}", catalog.has_active_plan_traffic(&username).await?);
        }
        if args.has_unlimited_time {
            println!("{}", catalog.has_unlimited_time_plan(&username).await?);
        }
        if args.has_unlimited_traffic {
            println!("{}", catalog.has_unlimited_traffic_plan(&username).await?);
        }
        if args.subscription {
            let credentials = catalog.get_credentials(&username).await?;
            print!(
                "{}",
                services::subscription_urls(&config.environment, &credentials.uuid)
            );
        }
    }
    Ok(())
}

async fn database(args: DatabaseArgs, config: &Config, catalog: &Catalog) -> Result<()> {
    if args.sync {
        let reconciler = build_reconciler(config, catalog).await?;
        let synced = reconciler.sync().await?;
        println!(
            "{}",
            if synced {
                "the services are synchronized with the catalog"
            } else {
                "the services are already in sync"
            }
        );
    }
    if args.dump {
        let snapshot = catalog.dump().await?;
        println!(
            "{}",
            serde_json::to_string_pretty(&snapshot).unwrap_or_default()
        );
    }
    if let Some(suffix) = &args.backup {
        let suffix = (!suffix.is_empty()).then_some(suffix.as_str());
        let target = catalog.backup(suffix).await?;
        println!("{}", target.display());
    }
    Ok(())
}

/// Formats an error with its cause chain for terminal output.
fn render(error: &Error) -> String {
    match error {
        Error::Synchronization { causes, .. } if !causes.is_empty() => {
            let mut out = format!("{error} due to:\n");
            for cause in causes {
                out.push_str(&format!("  - {cause}\n"));
            }
            out.trim_end().to_owned()
        }
        _ => error.to_string(),
    }
}
