//! Offline administration for a property ledger store.
//!
//! Works directly on the sled directory, so the server must not be running
//! against the same path.

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde::Serialize;

use property_ledger::clock::SystemClock;
use property_ledger::config::Settings;
use property_ledger::logging::init_cli_logging;
use property_ledger::models::{PublicUser, User, UserRole};
use property_ledger::query::{params_from_pairs, Query};
use property_ledger::registry::Registry;
use property_ledger::storage::Storage;

#[derive(Parser)]
#[command(name = "ledger-cli")]
#[command(about = "Offline administration for the property ledger", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Store directory (defaults to DATABASE_PATH)
    #[arg(short, long)]
    data: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Persist expired contracts and overdue payments
    Reconcile {
        /// Reconcile as of this date instead of today
        #[arg(long)]
        today: Option<NaiveDate>,
    },
    /// List payments, filtered with key=value pairs
    ListPayments {
        #[arg(short, long = "filter")]
        filters: Vec<String>,
    },
    /// Payments past their due date
    Overdue,
    /// Active contracts ending soon
    Expiring {
        #[arg(long)]
        days: Option<i64>,
    },
    /// Pending payments falling due soon
    Upcoming {
        #[arg(long)]
        days: Option<i64>,
    },
    /// Maintenance requests left pending too long
    Stale {
        /// Minimum age in days
        #[arg(long)]
        days: Option<i64>,
    },
    /// Create an admin account
    CreateAdmin {
        #[arg(short, long)]
        email: String,
        #[arg(short, long)]
        password: String,
    },
}

/// Queries run with the rights of the oldest active admin
fn acting_admin(registry: &Registry) -> Result<User, Box<dyn Error>> {
    registry
        .storage()
        .scan::<User>()?
        .into_iter()
        .filter(|u| u.role == UserRole::Admin && u.is_active)
        .min_by_key(|u| u.id)
        .ok_or_else(|| "no active admin account; run `ledger-cli create-admin` first".into())
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let settings = Settings::from_env()?;
    init_cli_logging(&std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".to_string()))
        .map_err(|e| e.to_string())?;

    let path = cli.data.unwrap_or_else(|| settings.database_path.clone());
    let storage = Storage::open(&path)?;
    let registry = Registry::new(storage, Arc::new(SystemClock), settings.policy());

    match cli.command {
        Commands::Reconcile { today } => {
            let report = registry.reconcile_on(today.unwrap_or_else(|| registry.today()))?;
            println!("{}", report);
        }
        Commands::ListPayments { filters } => {
            let admin = acting_admin(&registry)?;
            let query = Query::parse(&params_from_pairs(&filters)?)?;
            print_json(&registry.list_payments(&admin, &query)?)?;
        }
        Commands::Overdue => {
            let admin = acting_admin(&registry)?;
            print_json(&registry.overdue_payments(&admin)?)?;
        }
        Commands::Expiring { days } => {
            let admin = acting_admin(&registry)?;
            print_json(&registry.expiring_contracts(&admin, days)?)?;
        }
        Commands::Upcoming { days } => {
            let admin = acting_admin(&registry)?;
            print_json(&registry.upcoming_payments(&admin, days)?)?;
        }
        Commands::Stale { days } => {
            let admin = acting_admin(&registry)?;
            print_json(&registry.stale_requests(&admin, days)?)?;
        }
        Commands::CreateAdmin { email, password } => {
            let admin = registry.bootstrap_admin(&email, &password)?;
            print_json(&PublicUser::from(admin))?;
        }
    }

    registry.storage().flush()?;
    Ok(())
}
