use crate::error::{AppError, Result};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub source: SourceConfig,
    #[serde(default)]
    pub loader: LoaderConfig,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    #[serde(default = "default_db_port", deserialize_with = "deserialize_port")]
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_db_port() -> u16 {
    5432
}

fn default_max_connections() -> u32 {
    5
}

/// Custom deserializer that handles port as both number and string
///
/// Accepts:
/// - `port: 5432` (number)
/// - `port: "5432"` (string that parses to number)
/// - `port: ${DB_PORT}` (env var substituted to either)
fn deserialize_port<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PortValue {
        Number(u16),
        String(String),
    }

    match PortValue::deserialize(deserializer)? {
        PortValue::Number(n) => Ok(n),
        PortValue::String(s) => s
            .parse::<u16>()
            .map_err(|_| serde::de::Error::custom(format!("Invalid port number: '{}'", s))),
    }
}

impl DatabaseConfig {
    pub fn connection_string(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.name
        )
    }
}

/// Remote station API and CSV export settings.
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub base_url: String,
    pub api_token: String,
    /// Station id -> export file name.
    pub stations: BTreeMap<i32, String>,
    pub start_year: i32,
    /// Exclusive.
    pub end_year: i32,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,
    #[serde(default = "default_year_delay_ms")]
    pub year_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_step_secs")]
    pub backoff_step_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_request_delay_ms() -> u64 {
    15_000
}

fn default_year_delay_ms() -> u64 {
    10_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_step_secs() -> u64 {
    5
}

fn default_request_timeout_secs() -> u64 {
    60
}

impl SourceConfig {
    pub fn years(&self) -> std::ops::Range<i32> {
        self.start_year..self.end_year
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoaderConfig {
    #[serde(default = "default_output_dir")]
    pub data_dir: PathBuf,
    /// Fixed offset of legacy date/time exports (Israel Standard Time).
    #[serde(default = "default_source_utc_offset_hours")]
    pub source_utc_offset_hours: i32,
    /// Skip a file when more than this share of its rows is dropped.
    #[serde(default = "default_max_failure_rate")]
    pub max_failure_rate: f64,
}

fn default_source_utc_offset_hours() -> i32 {
    2
}

fn default_max_failure_rate() -> f64 {
    0.5
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            data_dir: default_output_dir(),
            source_utc_offset_hours: default_source_utc_offset_hours(),
            max_failure_rate: default_max_failure_rate(),
        }
    }
}

/// What an hour with samples but no valid rain value reports as rainfall.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RainSumPolicy {
    #[default]
    Missing,
    Zero,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AggregationConfig {
    #[serde(default = "default_interpolation_limit")]
    pub interpolation_limit: usize,
    #[serde(default)]
    pub rain_sum_policy: RainSumPolicy,
    #[serde(default = "default_max_span_hours")]
    pub max_span_hours: i64,
}

fn default_interpolation_limit() -> usize {
    2
}

fn default_max_span_hours() -> i64 {
    // 30 years of hours
    24 * 366 * 30
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            interpolation_limit: default_interpolation_limit(),
            rain_sum_policy: RainSumPolicy::default(),
            max_span_hours: default_max_span_hours(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u64,
    #[serde(default = "default_initial_delay")]
    pub initial_delay_seconds: u64,
}

fn default_interval_minutes() -> u64 {
    24 * 60
}

fn default_initial_delay() -> u64 {
    10
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_minutes: default_interval_minutes(),
            initial_delay_seconds: default_initial_delay(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| AppError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        // Substitute environment variables
        let expanded = expand_env_vars(content)?;

        let config: Config = serde_yaml::from_str(&expanded)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    ///
    /// Checks for:
    /// - Unexpanded environment variables
    /// - Non-empty required fields
    /// - Valid port and connection ranges
    /// - HTTPS source URL
    /// - Sensible year range, station map and aggregation limits
    fn validate(&self) -> Result<()> {
        let fields_to_check = [
            ("DB_HOST", &self.database.host),
            ("DB_NAME", &self.database.name),
            ("DB_USER", &self.database.user),
            ("DB_PASSWORD", &self.database.password),
            ("API_TOKEN", &self.source.api_token),
        ];

        for (field_name, value) in &fields_to_check {
            if value.contains("${") {
                return Err(AppError::Config(format!(
                    "{} environment variable is not set. \
                     Please set it or create a .env file. \
                     See .env.example for required variables.",
                    field_name
                )));
            }
        }

        if self.database.host.is_empty() {
            return Err(AppError::Config(
                "Database host cannot be empty".to_string(),
            ));
        }

        if self.database.name.is_empty() {
            return Err(AppError::Config(
                "Database name cannot be empty".to_string(),
            ));
        }

        if self.database.user.is_empty() {
            return Err(AppError::Config(
                "Database user cannot be empty".to_string(),
            ));
        }

        if self.database.port == 0 {
            return Err(AppError::Config("Database port cannot be 0".to_string()));
        }

        if self.database.max_connections == 0 {
            return Err(AppError::Config(
                "Database max_connections must be at least 1".to_string(),
            ));
        }

        if self.database.max_connections > 100 {
            return Err(AppError::Config(format!(
                "Database max_connections {} seems too high, maximum recommended is 100",
                self.database.max_connections
            )));
        }

        match url::Url::parse(&self.source.base_url) {
            Err(e) => {
                return Err(AppError::Config(format!(
                    "Invalid source base_url '{}': {}",
                    self.source.base_url, e
                )));
            }
            Ok(parsed) if parsed.scheme() != "https" => {
                return Err(AppError::Config(format!(
                    "Source base_url must use HTTPS, got: {}",
                    parsed.scheme()
                )));
            }
            Ok(_) => {}
        }

        if self.source.stations.is_empty() {
            return Err(AppError::Config(
                "At least one station must be configured under source.stations".to_string(),
            ));
        }

        if self.source.start_year >= self.source.end_year {
            return Err(AppError::Config(format!(
                "source.start_year {} must be before source.end_year {} (end is exclusive)",
                self.source.start_year, self.source.end_year
            )));
        }

        if self.source.max_attempts == 0 {
            return Err(AppError::Config(
                "source.max_attempts must be at least 1".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.loader.max_failure_rate) {
            return Err(AppError::Config(format!(
                "loader.max_failure_rate {} must be between 0 and 1",
                self.loader.max_failure_rate
            )));
        }

        if !(-12..=14).contains(&self.loader.source_utc_offset_hours) {
            return Err(AppError::Config(format!(
                "loader.source_utc_offset_hours {} is not a valid UTC offset",
                self.loader.source_utc_offset_hours
            )));
        }

        if self.aggregation.interpolation_limit == 0 || self.aggregation.interpolation_limit > 24 {
            return Err(AppError::Config(format!(
                "aggregation.interpolation_limit {} must be between 1 and 24 hours",
                self.aggregation.interpolation_limit
            )));
        }

        if self.aggregation.max_span_hours <= 0 {
            return Err(AppError::Config(
                "aggregation.max_span_hours must be positive".to_string(),
            ));
        }

        if self.scheduler.interval_minutes == 0 {
            return Err(AppError::Config(
                "Scheduler interval_minutes must be greater than 0".to_string(),
            ));
        }

        if self.source.request_delay_ms == 0 {
            tracing::warn!(
                "source.request_delay_ms is 0, the station API may rate-limit this client"
            );
        }

        Ok(())
    }
}

fn expand_env_vars(content: &str) -> Result<String> {
    let mut result = content.to_string();
    let re = regex_lite::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| AppError::Config(format!("Invalid placeholder pattern: {}", e)))?;

    let mut missing_vars = Vec::new();

    for cap in re.captures_iter(content) {
        let var_name = &cap[1];
        match std::env::var(var_name) {
            Ok(value) => {
                result = result.replace(&cap[0], &value);
            }
            Err(_) => {
                missing_vars.push(var_name.to_string());
            }
        }
    }

    if !missing_vars.is_empty() {
        return Err(AppError::Config(format!(
            "Missing required environment variable{}: {}\n\n\
             To fix this:\n\
             1. Create a .env file in the project root (copy .env.example)\n\
             2. Set the missing variable{}: export {}=<value>\n\
             3. Or set {} in your environment before running",
            if missing_vars.len() > 1 { "s" } else { "" },
            missing_vars.join(", "),
            if missing_vars.len() > 1 { "s" } else { "" },
            missing_vars[0],
            missing_vars.join(", ")
        )));
    }

    Ok(result)
}
