use chrono_tz::Tz;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_TIMEZONE: &str = "Asia/Shanghai";
pub const DEFAULT_LOG_RETENTION_DAYS: u32 = 30;

/// Top-level config (foadmin.toml + FOADMIN_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FoadminConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
            auth: AuthConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub mode: AuthMode,
    pub token: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mode: AuthMode::Token,
            token: Some("change-me".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMode {
    /// `Authorization: Bearer <token>` must match `auth.token`.
    Token,
    /// No authentication. Local development only.
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Scheduler subsystem configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Start the scheduler and load enabled jobs on boot (default: true).
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// IANA zone that cron expressions are evaluated in.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub overlap: OverlapPolicy,
    #[serde(default)]
    pub past_due_one_shot: PastDuePolicy,
    /// Age in days past which `tasks.cleanup_old_logs` purges job logs.
    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timezone: default_timezone(),
            overlap: OverlapPolicy::default(),
            past_due_one_shot: PastDuePolicy::default(),
            log_retention_days: DEFAULT_LOG_RETENTION_DAYS,
        }
    }
}

impl SchedulerConfig {
    /// Parse `timezone` into a `chrono_tz::Tz`.
    pub fn tz(&self) -> crate::error::Result<Tz> {
        self.timezone.parse::<Tz>().map_err(|_| {
            crate::error::FoadminError::Config(format!("unknown timezone: {}", self.timezone))
        })
    }
}

/// What happens when a job falls due while its previous run is still going.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// At most one execution per job id; due fires are coalesced.
    #[default]
    Serialize,
    /// Every fire runs independently, even on top of a running one.
    Allow,
}

/// What a `date` job does when its `run_date` is already in the past at
/// registration time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PastDuePolicy {
    /// Fire once, immediately.
    #[default]
    Fire,
    /// Never fire; the job is left out of the live schedule.
    Expire,
}

fn bool_true() -> bool {
    true
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_timezone() -> String {
    DEFAULT_TIMEZONE.to_string()
}
fn default_log_retention_days() -> u32 {
    DEFAULT_LOG_RETENTION_DAYS
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.foadmin/foadmin.db", home)
}

impl FoadminConfig {
    /// Load config from a TOML file with FOADMIN_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `FOADMIN_SCHEDULER__TIMEZONE=UTC`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: FoadminConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("FOADMIN_").split("__"))
            .extract()
            .map_err(|e| crate::error::FoadminError::Config(e.to_string()))?;

        config.scheduler.tz()?;
        tracing::debug!(path = %path, "config loaded");
        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.foadmin/foadmin.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        figment::Jail::expect_with(|jail| {
            let path = jail.directory().join("absent.toml");
            let config = FoadminConfig::load(path.to_str()).expect("load");
            assert_eq!(config.gateway.port, DEFAULT_PORT);
            assert_eq!(config.scheduler.timezone, DEFAULT_TIMEZONE);
            assert_eq!(config.scheduler.overlap, OverlapPolicy::Serialize);
            assert_eq!(config.scheduler.past_due_one_shot, PastDuePolicy::Fire);
            assert!(config.scheduler.enabled);
            Ok(())
        });
    }

    #[test]
    fn toml_and_env_are_merged() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "foadmin.toml",
                r#"
                [gateway]
                port = 9001

                [scheduler]
                timezone = "UTC"
                overlap = "allow"
                "#,
            )?;
            jail.set_env("FOADMIN_SCHEDULER__LOG_RETENTION_DAYS", "7");
            jail.set_env("FOADMIN_SCHEDULER__PAST_DUE_ONE_SHOT", "expire");

            let config = FoadminConfig::load(Some("foadmin.toml")).expect("load");
            assert_eq!(config.gateway.port, 9001);
            assert_eq!(config.scheduler.timezone, "UTC");
            assert_eq!(config.scheduler.overlap, OverlapPolicy::Allow);
            assert_eq!(config.scheduler.log_retention_days, 7);
            assert_eq!(config.scheduler.past_due_one_shot, PastDuePolicy::Expire);
            Ok(())
        });
    }

    #[test]
    fn unknown_timezone_is_rejected() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("foadmin.toml", "[scheduler]\ntimezone = \"Mars/Olympus\"\n")?;
            assert!(FoadminConfig::load(Some("foadmin.toml")).is_err());
            Ok(())
        });
    }
}
