//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. The database URL is wrapped in secrecy::SecretString to
//! prevent log leaks.

use secrecy::SecretString;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::WorkerOptions;
use crate::error::{Error, Result};

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// Queue list in priority order; `*` means every known queue.
    pub queues: Vec<String>,
    pub interval: Duration,
    pub blocking: bool,
    pub statistics_file: Option<PathBuf>,
    pub handlers_dir: PathBuf,
    pub group_count: u32,
    pub group_index: u32,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let database_url = var("DATABASE_URL").ok_or_else(|| {
            Error::InvalidConfiguration(
                "required environment variable DATABASE_URL is not set".to_string(),
            )
        })?;

        let queues = parse_queues(var("WORKQ_QUEUES").as_deref().unwrap_or("*"))?;
        let interval = parse_var::<u64>("WORKQ_INTERVAL", var("WORKQ_INTERVAL"))?.unwrap_or(5);
        let blocking = match var("WORKQ_BLOCKING") {
            Some(raw) => parse_bool("WORKQ_BLOCKING", &raw)?,
            None => false,
        };

        let config = Self {
            database_url: SecretString::from(database_url),
            otel_endpoint: var("OTEL_ENDPOINT"),
            log_level: var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            queues,
            interval: Duration::from_secs(interval),
            blocking,
            statistics_file: var("WORKQ_STATISTICS_FILE").map(PathBuf::from),
            handlers_dir: var("WORKQ_HANDLERS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("handlers")),
            group_count: parse_var("WORKQ_GROUP_COUNT", var("WORKQ_GROUP_COUNT"))?.unwrap_or(1),
            group_index: parse_var("WORKQ_GROUP_INDEX", var("WORKQ_GROUP_INDEX"))?.unwrap_or(0),
        };
        config.worker_options().validate()?;
        Ok(config)
    }

    /// Worker options derived from this configuration.
    pub fn worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            blocking: self.blocking,
            group_count: self.group_count,
            group_index: self.group_index,
            statistics_file: self.statistics_file.clone(),
            ..WorkerOptions::default()
        }
    }
}

/// Split a comma-separated queue list, dropping blanks.
pub fn parse_queues(raw: &str) -> Result<Vec<String>> {
    let queues: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .map(str::to_string)
        .collect();
    if queues.is_empty() {
        return Err(Error::InvalidConfiguration(
            "queue list is empty".to_string(),
        ));
    }
    if let Some(bad) = queues.iter().find(|q| q.contains(':')) {
        return Err(Error::InvalidConfiguration(format!(
            "queue name may not contain ':': {bad}"
        )));
    }
    Ok(queues)
}

fn parse_var<T: FromStr>(name: &str, raw: Option<String>) -> Result<Option<T>> {
    raw.map(|raw| {
        raw.trim().parse().map_err(|_| {
            Error::InvalidConfiguration(format!("{name} has invalid value {raw:?}"))
        })
    })
    .transpose()
}

fn parse_bool(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::InvalidConfiguration(format!(
            "{name} has invalid value {raw:?}"
        ))),
    }
}
