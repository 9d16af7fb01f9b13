//! Configuration and settings management
//!
//! Loads settings from environment variables and defines the broker's tunable constants.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Application settings loaded from environment variables
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Telegram Bot API token (the bot's identity, mandatory)
    pub telegram_token: String,

    /// Base URL of the artifact download API (`{api_url}/download/{id}`)
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Base URL of the catalog search service
    #[serde(default = "default_catalog_url")]
    pub catalog_url: String,

    /// Postgres connection string; the in-memory store is used when absent
    pub database_url: Option<String>,

    /// Executable used for fallback acquisition
    #[serde(default = "default_fallback_tool")]
    pub fallback_tool: String,

    /// Whitespace-separated arguments placed before the catalog identifier
    #[serde(default = "default_fallback_tool_args")]
    pub fallback_tool_args: String,

    /// Reject one-to-one conversations and only serve groups
    #[serde(default)]
    pub groups_only: bool,

    /// Chat that receives new-user announcements
    pub owner_chat_id: Option<i64>,

    /// Image sent alongside the welcome text
    pub welcome_image_url: Option<String>,

    /// Words that restart the interactive flow
    #[serde(rename = "greeting_keywords")]
    pub greeting_keywords_str: Option<String>,

    /// Words that trigger the usage message in groups
    #[serde(rename = "help_keywords")]
    pub help_keywords_str: Option<String>,
}

fn default_api_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_catalog_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_fallback_tool() -> String {
    "python3".to_string()
}

fn default_fallback_tool_args() -> String {
    "scrap.py".to_string()
}

const DEFAULT_GREETING_KEYWORDS: &[&str] = &["start", "/start", "بدء", "hi"];
const DEFAULT_HELP_KEYWORDS: &[&str] = &["help", "/help", "/start", "مساعدة"];

/// Build the layered configuration source shared by every settings type.
///
/// # Errors
///
/// Returns a `ConfigError` if a configuration file exists but cannot be parsed.
pub fn build_config() -> Result<Config, ConfigError> {
    let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

    Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
        // This file shouldn't be checked into git
        .add_source(File::with_name("config/local").required(false))
        // Eg.. `APP__GROUPS_ONLY=true ./target/apk-courier`
        .add_source(Environment::with_prefix("APP").separator("__"))
        // Environment::default() auto-converts UPPER_SNAKE_CASE to snake_case,
        // ignore_empty treats empty env vars as unset
        .add_source(Environment::default().ignore_empty(true))
        .build()
}

impl Settings {
    /// Create new settings by loading from environment and files
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use apk_courier::config::Settings;
    ///
    /// let settings = Settings::new().expect("Failed to load configuration");
    /// ```
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if loading fails or `TELEGRAM_TOKEN` is missing.
    pub fn new() -> Result<Self, ConfigError> {
        let mut settings: Self = build_config()?.try_deserialize()?;

        // Fallback: Check environment variables directly if config didn't pick them up
        if settings.database_url.is_none() {
            if let Ok(val) = std::env::var("DATABASE_URL") {
                if !val.is_empty() {
                    settings.database_url = Some(val);
                }
            }
        }

        if settings.telegram_token.trim().is_empty() {
            return Err(ConfigError::Message("TELEGRAM_TOKEN is empty".into()));
        }

        Ok(settings)
    }

    /// Arguments for the fallback tool, without the catalog identifier
    #[must_use]
    pub fn fallback_args(&self) -> Vec<String> {
        self.fallback_tool_args
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }

    /// Lowercased keywords that restart the interactive flow
    #[must_use]
    pub fn greeting_keywords(&self) -> HashSet<String> {
        parse_keywords(self.greeting_keywords_str.as_deref(), DEFAULT_GREETING_KEYWORDS)
    }

    /// Lowercased keywords that short-circuit to the usage message in groups
    #[must_use]
    pub fn help_keywords(&self) -> HashSet<String> {
        parse_keywords(self.help_keywords_str.as_deref(), DEFAULT_HELP_KEYWORDS)
    }
}

fn parse_keywords(raw: Option<&str>, defaults: &[&str]) -> HashSet<String> {
    match raw {
        Some(s) if !s.trim().is_empty() => s
            .split(|c: char| c == ',' || c == ';' || c.is_whitespace())
            .filter(|token| !token.is_empty())
            .map(str::to_lowercase)
            .collect(),
        _ => defaults.iter().map(|k| (*k).to_string()).collect(),
    }
}

// Abuse guard configuration
/// Messages closer together than this count towards a burst
pub const QUIET_INTERVAL_MS: u64 = 2000;
/// Burst size after which messages are throttled
pub const BURST_CEILING: u32 = 10;
/// Spam score at which an identity is blacklisted
pub const SPAM_SCORE_THRESHOLD: u32 = 5;

// Catalog configuration
/// Maximum number of ranked results shown for a query
pub const SEARCH_RESULT_LIMIT: usize = 10;
/// Timeout for catalog requests in seconds
pub const CATALOG_TIMEOUT_SECS: u64 = 20;

// Acquisition configuration
/// Timeout for the download API in seconds
pub const ACQUIRE_HTTP_TIMEOUT_SECS: u64 = 60;
/// Redirect hops followed by the download API client
pub const ACQUIRE_MAX_REDIRECTS: usize = 5;
/// Timeout for the fallback tool in seconds
pub const FALLBACK_TOOL_TIMEOUT_SECS: u64 = 300;
/// Timeout for icon and welcome image fetches in seconds
pub const ASSET_TIMEOUT_SECS: u64 = 15;

// Session configuration
/// Idle time after which a conversation session is forgotten
pub const SESSION_IDLE_TTL_SECS: u64 = 3600;
/// Maximum number of sessions kept in memory
pub const SESSION_MAX_CAPACITY: u64 = 100_000;
/// Characters of a group query kept as the in-flight label
pub const LABEL_PREVIEW_CHARS: usize = 30;

// Telegram API retry configuration
/// Maximum attempts for a Telegram API call
pub const TELEGRAM_API_MAX_RETRIES: usize = 3;
/// Initial backoff between Telegram API attempts
pub const TELEGRAM_API_INITIAL_BACKOFF_MS: u64 = 500;
/// Upper bound for the backoff between Telegram API attempts
pub const TELEGRAM_API_MAX_BACKOFF_MS: u64 = 4000;

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Get the burst quiet interval from env or default.
///
/// Environment variable: `QUIET_INTERVAL_MS`.
#[must_use]
pub fn get_quiet_interval() -> Duration {
    Duration::from_millis(env_or("QUIET_INTERVAL_MS", QUIET_INTERVAL_MS))
}

/// Get the burst ceiling from env or default.
///
/// Environment variable: `BURST_CEILING`.
#[must_use]
pub fn get_burst_ceiling() -> u32 {
    env_or("BURST_CEILING", BURST_CEILING)
}

/// Get the spam score threshold from env or default.
///
/// Environment variable: `SPAM_SCORE_THRESHOLD`.
#[must_use]
pub fn get_spam_score_threshold() -> u32 {
    env_or("SPAM_SCORE_THRESHOLD", SPAM_SCORE_THRESHOLD)
}

/// Get the download API timeout from env or default.
///
/// Environment variable: `ACQUIRE_HTTP_TIMEOUT_SECS`.
#[must_use]
pub fn get_acquire_http_timeout() -> Duration {
    Duration::from_secs(env_or("ACQUIRE_HTTP_TIMEOUT_SECS", ACQUIRE_HTTP_TIMEOUT_SECS))
}

/// Get the fallback tool timeout from env or default.
///
/// Environment variable: `FALLBACK_TOOL_TIMEOUT_SECS`.
#[must_use]
pub fn get_fallback_tool_timeout() -> Duration {
    Duration::from_secs(env_or("FALLBACK_TOOL_TIMEOUT_SECS", FALLBACK_TOOL_TIMEOUT_SECS))
}

/// Get the session idle TTL from env or default.
///
/// Environment variable: `SESSION_IDLE_TTL_SECS`.
#[must_use]
pub fn get_session_idle_ttl() -> Duration {
    Duration::from_secs(env_or("SESSION_IDLE_TTL_SECS", SESSION_IDLE_TTL_SECS))
}

/// Get the session capacity from env or default.
///
/// Environment variable: `SESSION_MAX_CAPACITY`.
#[must_use]
pub fn get_session_max_capacity() -> u64 {
    env_or("SESSION_MAX_CAPACITY", SESSION_MAX_CAPACITY)
}
