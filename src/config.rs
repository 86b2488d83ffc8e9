//! Runtime settings, read from the environment (and `.env` via dotenvy).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::registry::Policy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} is not valid: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("JWT_SECRET must be set to serve the API")]
    MissingSecret,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("expected pretty or json, got '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_path: PathBuf,
    pub rest_addr: SocketAddr,
    pub jwt_secret: Option<String>,
    pub token_ttl_minutes: i64,
    pub bcrypt_cost: u32,
    pub early_payment_days: i64,
    pub renewal_notice_days: i64,
    pub payment_reminder_days: i64,
    pub stale_request_days: i64,
    /// 0 disables the background pass
    pub reconcile_interval_secs: u64,
    pub log_filter: String,
    pub log_format: LogFormat,
    pub log_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("ledger_data"),
            rest_addr: SocketAddr::from(([0, 0, 0, 0], 11111)),
            jwt_secret: None,
            token_ttl_minutes: 30,
            bcrypt_cost: bcrypt::DEFAULT_COST,
            early_payment_days: 31,
            renewal_notice_days: 30,
            payment_reminder_days: 7,
            stale_request_days: 1,
            reconcile_interval_secs: 3600,
            log_filter: "info,property_ledger=debug".to_string(),
            log_format: LogFormat::Pretty,
            log_dir: PathBuf::from("logs"),
        }
    }
}

fn parse<T>(key: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: ToString,
{
    match raw {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
        }),
    }
}

impl Settings {
    /// Load `.env` if present, then read the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Settings::default();
        let settings = Settings {
            database_path: parse("DATABASE_PATH", get("DATABASE_PATH"), d.database_path)?,
            rest_addr: parse("REST_ADDR", get("REST_ADDR"), d.rest_addr)?,
            jwt_secret: get("JWT_SECRET").filter(|s| !s.is_empty()),
            token_ttl_minutes: parse(
                "TOKEN_TTL_MINUTES",
                get("TOKEN_TTL_MINUTES"),
                d.token_ttl_minutes,
            )?,
            bcrypt_cost: parse("BCRYPT_COST", get("BCRYPT_COST"), d.bcrypt_cost)?,
            early_payment_days: parse(
                "EARLY_PAYMENT_DAYS",
                get("EARLY_PAYMENT_DAYS"),
                d.early_payment_days,
            )?,
            renewal_notice_days: parse(
                "CONTRACT_RENEWAL_NOTICE_DAYS",
                get("CONTRACT_RENEWAL_NOTICE_DAYS"),
                d.renewal_notice_days,
            )?,
            payment_reminder_days: parse(
                "PAYMENT_REMINDER_DAYS",
                get("PAYMENT_REMINDER_DAYS"),
                d.payment_reminder_days,
            )?,
            stale_request_days: parse(
                "MAINTENANCE_STALE_DAYS",
                get("MAINTENANCE_STALE_DAYS"),
                d.stale_request_days,
            )?,
            reconcile_interval_secs: parse(
                "RECONCILE_INTERVAL_SECS",
                get("RECONCILE_INTERVAL_SECS"),
                d.reconcile_interval_secs,
            )?,
            log_filter: get("RUST_LOG").filter(|s| !s.is_empty()).unwrap_or(d.log_filter),
            log_format: parse("LOG_FORMAT", get("LOG_FORMAT"), d.log_format)?,
            log_dir: parse("LOG_DIR", get("LOG_DIR"), d.log_dir)?,
        };
        settings.check()?;
        Ok(settings)
    }

    fn check(&self) -> Result<(), ConfigError> {
        if self.token_ttl_minutes <= 0 {
            return Err(ConfigError::Invalid {
                key: "TOKEN_TTL_MINUTES",
                reason: "must be positive".to_string(),
            });
        }
        if !(4..=31).contains(&self.bcrypt_cost) {
            return Err(ConfigError::Invalid {
                key: "BCRYPT_COST",
                reason: "must be between 4 and 31".to_string(),
            });
        }
        if self.early_payment_days < 0 {
            return Err(ConfigError::Invalid {
                key: "EARLY_PAYMENT_DAYS",
                reason: "must be >= 0".to_string(),
            });
        }
        let windows = [
            ("CONTRACT_RENEWAL_NOTICE_DAYS", self.renewal_notice_days),
            ("PAYMENT_REMINDER_DAYS", self.payment_reminder_days),
            ("MAINTENANCE_STALE_DAYS", self.stale_request_days),
        ];
        for (key, days) in windows {
            if days < 0 {
                return Err(ConfigError::Invalid {
                    key,
                    reason: "must be >= 0".to_string(),
                });
            }
        }
        Ok(())
    }

    /// The signing secret, required by the API server only
    pub fn require_secret(&self) -> Result<&str, ConfigError> {
        match self.jwt_secret.as_deref() {
            None => Err(ConfigError::MissingSecret),
            Some(s) if s.len() < 16 => Err(ConfigError::Invalid {
                key: "JWT_SECRET",
                reason: "must be at least 16 bytes".to_string(),
            }),
            Some(s) => Ok(s),
        }
    }

    pub fn policy(&self) -> Policy {
        Policy {
            early_payment_days: self.early_payment_days,
            renewal_notice_days: self.renewal_notice_days,
            payment_reminder_days: self.payment_reminder_days,
            stale_request_days: self.stale_request_days,
            bcrypt_cost: self.bcrypt_cost,
        }
    }

    pub fn reconcile_interval(&self) -> Option<Duration> {
        (self.reconcile_interval_secs > 0)
            .then(|| Duration::from_secs(self.reconcile_interval_secs))
    }
}
