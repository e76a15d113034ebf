use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("invalid value for {name}: {message}")]
    InvalidValue { name: String, message: String },
    #[error("failed to parse {name} as integer: {source}")]
    ParseInt {
        name: String,
        #[source]
        source: std::num::ParseIntError,
    },
    #[error("failed to parse {name} as float: {source}")]
    ParseFloat {
        name: String,
        #[source]
        source: std::num::ParseFloatError,
    },
    #[error("failed to parse {name} as boolean: {value}")]
    ParseBool { name: String, value: String },
}

/// Which phases a run executes, parsed from a comma-separated list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseSelection {
    pub list: bool,
    pub detail: bool,
    pub media: bool,
    pub report: bool,
}

impl PhaseSelection {
    /// Parse a selection like `"list,detail,media,report"`.
    ///
    /// # Errors
    ///
    /// Returns an error if an unknown phase name appears.
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        let mut sel = Self {
            list: false,
            detail: false,
            media: false,
            report: false,
        };
        for name in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match name {
                "list" => sel.list = true,
                "detail" => sel.detail = true,
                "media" => sel.media = true,
                "report" => sel.report = true,
                other => {
                    return Err(ConfigError::InvalidValue {
                        name: "PHASES".to_string(),
                        message: format!("unknown phase '{other}'"),
                    })
                }
            }
        }
        Ok(sel)
    }

    #[must_use]
    pub fn all() -> Self {
        Self {
            list: true,
            detail: true,
            media: true,
            report: true,
        }
    }
}

/// Which posts the retweet-recheck pass re-examines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecheckMode {
    /// Only posts whose text carries the "weibo video" tell (cheap).
    VideoPhrase,
    /// Every post currently classified original in the scope (thorough).
    AllOriginal,
}

impl RecheckMode {
    fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.to_lowercase().as_str() {
            "video_phrase" => Ok(Self::VideoPhrase),
            "all_original" => Ok(Self::AllOriginal),
            _ => Err(ConfigError::InvalidValue {
                name: "RETWEET_RECHECK_MODE".to_string(),
                message: format!("must be 'video_phrase' or 'all_original', got '{value}'"),
            }),
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::VideoPhrase => "video_phrase",
            Self::AllOriginal => "all_original",
        }
    }
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Account / session
    pub user_id: String,
    pub cookie: String,
    pub user_agent: String,
    /// Root of the mobile site. Overridable for tests against a mock server.
    pub base_url: String,

    // Storage
    pub database_path: PathBuf,
    pub storage_dir: PathBuf,

    // Phases
    pub phases: PhaseSelection,

    // List phase
    pub stop_after_no_new_pages: u32,
    pub max_pages: Option<u32>,

    // Detail phase
    pub detail_batch_size: u32,
    pub detail_concurrency: usize,
    pub retweet_long_comment_threshold: usize,
    pub retweet_recheck_year: Option<i32>,
    pub retweet_recheck_mode: RecheckMode,
    pub retweet_recheck_limit: u32,
    pub detail_backfill_before_year: Option<i32>,

    // Anti-bot safety
    pub antibot_fail_fast: bool,
    pub antibot_cooldown: Duration,
    pub antibot_max_cooldowns: u32,

    // HTTP pacing
    pub request_delay: Duration,
    pub http_timeout: Duration,

    // Media phase
    pub media_concurrency: usize,

    // Progress events
    pub events_path: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing or invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            user_id: required_env("WEIBO_USER_ID")?,
            cookie: required_env("WEIBO_COOKIE")?,
            user_agent: env_or_default(
                "USER_AGENT",
                "Mozilla/5.0 (iPhone; CPU iPhone OS 16_0 like Mac OS X) AppleWebKit/605.1.15",
            ),
            base_url: env_or_default("WEIBO_BASE_URL", "https://weibo.cn"),

            database_path: PathBuf::from(env_or_default("DATABASE_PATH", "./data/weibo.sqlite")),
            storage_dir: PathBuf::from(env_or_default("STORAGE_DIR", "./data")),

            phases: PhaseSelection::parse(&env_or_default("PHASES", "list,detail,media,report"))?,

            stop_after_no_new_pages: parse_env_u32("STOP_AFTER_NO_NEW_PAGES", 3)?,
            max_pages: none_if_zero_u32(parse_env_u32("MAX_PAGES", 0)?),

            detail_batch_size: parse_env_u32("DETAIL_BATCH_SIZE", 200)?,
            detail_concurrency: parse_env_usize("DETAIL_CONCURRENCY", 3)?,
            retweet_long_comment_threshold: parse_env_usize("RETWEET_LONG_COMMENT_THRESHOLD", 100)?,
            retweet_recheck_year: none_if_zero_i32(parse_env_i32("RETWEET_RECHECK_YEAR", 0)?),
            retweet_recheck_mode: RecheckMode::parse(&env_or_default(
                "RETWEET_RECHECK_MODE",
                "video_phrase",
            ))?,
            retweet_recheck_limit: parse_env_u32("RETWEET_RECHECK_LIMIT", 500)?,
            detail_backfill_before_year: none_if_zero_i32(parse_env_i32(
                "DETAIL_BACKFILL_BEFORE_YEAR",
                0,
            )?),

            antibot_fail_fast: parse_env_bool("ANTIBOT_FAIL_FAST", true)?,
            antibot_cooldown: Duration::from_secs(parse_env_u64("ANTIBOT_COOLDOWN_SECS", 1800)?),
            antibot_max_cooldowns: parse_env_u32("ANTIBOT_MAX_COOLDOWNS", 3)?,

            request_delay: Duration::from_secs_f64(parse_env_f64("REQUEST_DELAY_SECS", 1.0)?),
            http_timeout: Duration::from_secs(parse_env_u64("HTTP_TIMEOUT_SECS", 30)?),

            media_concurrency: parse_env_usize("MEDIA_CONCURRENCY", 20)?,

            events_path: optional_env("EVENTS_PATH"),
        })
    }

    /// Validate that the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.user_id.is_empty() {
            return Err(ConfigError::InvalidValue {
                name: "WEIBO_USER_ID".to_string(),
                message: "cannot be empty".to_string(),
            });
        }
        if self.cookie.is_empty() {
            return Err(ConfigError::InvalidValue {
                name: "WEIBO_COOKIE".to_string(),
                message: "cannot be empty".to_string(),
            });
        }
        if self.detail_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                name: "DETAIL_CONCURRENCY".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.detail_batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                name: "DETAIL_BATCH_SIZE".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.media_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                name: "MEDIA_CONCURRENCY".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.stop_after_no_new_pages == 0 {
            return Err(ConfigError::InvalidValue {
                name: "STOP_AFTER_NO_NEW_PAGES".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.antibot_max_cooldowns == 0 {
            return Err(ConfigError::InvalidValue {
                name: "ANTIBOT_MAX_COOLDOWNS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// A configuration suitable for tests: no real credentials, tiny delays.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            user_id: "1234567890".to_string(),
            cookie: "SUB=test".to_string(),
            user_agent: "weibo-backup-test/0.1".to_string(),
            base_url: "https://weibo.cn".to_string(),
            database_path: PathBuf::from(":memory:"),
            storage_dir: PathBuf::from("./data"),
            phases: PhaseSelection::all(),
            stop_after_no_new_pages: 3,
            max_pages: None,
            detail_batch_size: 200,
            detail_concurrency: 3,
            retweet_long_comment_threshold: 100,
            retweet_recheck_year: None,
            retweet_recheck_mode: RecheckMode::VideoPhrase,
            retweet_recheck_limit: 500,
            detail_backfill_before_year: None,
            antibot_fail_fast: true,
            antibot_cooldown: Duration::from_millis(10),
            antibot_max_cooldowns: 3,
            request_delay: Duration::from_millis(1),
            http_timeout: Duration::from_secs(10),
            media_concurrency: 20,
            events_path: None,
        }
    }
}

fn required_env(name: &str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::MissingEnvVar(name.to_string()))
}

fn optional_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn env_or_default(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn none_if_zero_u32(value: u32) -> Option<u32> {
    (value > 0).then_some(value)
}

fn none_if_zero_i32(value: i32) -> Option<i32> {
    (value > 0).then_some(value)
}

fn parse_env_u64(name: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_u32(name: &str, default: u32) -> Result<u32, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_i32(name: &str, default: i32) -> Result<i32, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_usize(name: &str, default: usize) -> Result<usize, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_f64(name: &str, default: f64) -> Result<f64, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseFloat {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_bool(name: &str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => match val.to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::ParseBool {
                name: name.to_string(),
                value: val,
            }),
        },
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_phases() {
        let sel = PhaseSelection::parse("list,detail").unwrap();
        assert!(sel.list);
        assert!(sel.detail);
        assert!(!sel.media);
        assert!(!sel.report);

        assert!(PhaseSelection::parse("list,html").is_err());
    }

    #[test]
    fn test_parse_phases_tolerates_spacing() {
        let sel = PhaseSelection::parse(" list , media ,").unwrap();
        assert!(sel.list);
        assert!(sel.media);
        assert!(!sel.detail);
    }

    #[test]
    fn test_parse_recheck_mode() {
        assert_eq!(
            RecheckMode::parse("video_phrase").unwrap(),
            RecheckMode::VideoPhrase
        );
        assert_eq!(
            RecheckMode::parse("ALL_ORIGINAL").unwrap(),
            RecheckMode::AllOriginal
        );
        assert!(RecheckMode::parse("everything").is_err());
    }

    #[test]
    fn test_for_testing_validates() {
        Config::for_testing().validate().unwrap();
    }
}
