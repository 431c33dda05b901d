//! Configuration module for sync core settings and development seeds
//!
//! All configuration is loaded from environment variables under the
//! `MAIL_SYNC_*` prefix. Tuning knobs (timeouts, windows, queue bounds) are
//! enumerated settings with defaults; development credential seeds are
//! discovered by scanning for `MAIL_SYNC_ACCOUNT_<SEGMENT>_EMAIL` variables.

use std::env;
use std::env::VarError;
use std::time::Duration;

use regex::Regex;
use secrecy::SecretString;

use crate::errors::{AppError, AppResult};

/// Sync core configuration
///
/// Cloned into the supervisor, agents, and session hub via `Arc` for
/// thread-safe shared access.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Initial backfill window: messages younger than `now - window` are ingested
    pub backfill_window: Duration,
    /// Forced IDLE refresh interval (kept under server-side IDLE timeouts)
    pub idle_max: Duration,
    /// TCP connect + TLS handshake timeout
    pub connect_timeout: Duration,
    /// Per-message FETCH timeout; also bounds the pipeline hand-off
    pub fetch_timeout: Duration,
    /// Reconnect backoff base delay
    pub retry_base: Duration,
    /// Reconnect backoff cap
    pub retry_cap: Duration,
    /// WebSocket heartbeat PING interval
    pub ws_heartbeat: Duration,
    /// Per-frame WebSocket write timeout; violation closes the session
    pub ws_write_timeout: Duration,
    /// Bound of each session's outbound frame queue
    pub session_queue: usize,
    /// Total deadline for stopping all agents on shutdown
    pub shutdown_deadline: Duration,
    /// Listen address for the WebSocket surface
    pub bind_addr: String,
}

impl SyncConfig {
    /// Load all settings from environment variables
    ///
    /// Every setting has a default; only malformed values produce errors.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if a variable is set but not parseable.
    ///
    /// # Example Environment
    ///
    /// ```text
    /// MAIL_SYNC_BACKFILL_WINDOW_SECS=86400
    /// MAIL_SYNC_IDLE_MAX_SECS=1680
    /// MAIL_SYNC_CONNECT_TIMEOUT_MS=15000
    /// MAIL_SYNC_BIND=127.0.0.1:8080
    /// ```
    pub fn load_from_env() -> AppResult<Self> {
        Ok(Self {
            backfill_window: env_secs("MAIL_SYNC_BACKFILL_WINDOW_SECS", 86_400)?,
            idle_max: env_secs("MAIL_SYNC_IDLE_MAX_SECS", 1_680)?,
            connect_timeout: env_millis("MAIL_SYNC_CONNECT_TIMEOUT_MS", 15_000)?,
            fetch_timeout: env_millis("MAIL_SYNC_FETCH_TIMEOUT_MS", 30_000)?,
            retry_base: env_millis("MAIL_SYNC_RETRY_BASE_MS", 5_000)?,
            retry_cap: env_millis("MAIL_SYNC_RETRY_CAP_MS", 60_000)?,
            ws_heartbeat: env_secs("MAIL_SYNC_WS_HEARTBEAT_SECS", 30)?,
            ws_write_timeout: env_millis("MAIL_SYNC_WS_WRITE_TIMEOUT_MS", 5_000)?,
            session_queue: parse_env("MAIL_SYNC_SESSION_QUEUE", 256usize)?,
            shutdown_deadline: env_secs("MAIL_SYNC_SHUTDOWN_DEADLINE_SECS", 10)?,
            bind_addr: env_value("MAIL_SYNC_BIND")?
                .unwrap_or_else(|| "127.0.0.1:8080".to_owned()),
        })
    }
}

/// Development credential seed for the in-memory credential store
///
/// Tokens are stored using `SecretString` to prevent accidental logging.
#[derive(Debug, Clone)]
pub struct CredentialSeed {
    /// Tenant identifier the mailbox belongs to
    pub user_id: String,
    /// Mailbox address
    pub email: String,
    /// IMAP server hostname for this account
    pub imap_host: String,
    /// IMAP server port (993 for IMAPS)
    pub imap_port: u16,
    /// OAuth bearer token for XOAUTH2
    pub access_token: SecretString,
    /// Optional refresh token
    pub refresh_token: Option<SecretString>,
}

/// Discover credential seeds from the environment
///
/// Scans for `MAIL_SYNC_ACCOUNT_<SEGMENT>_EMAIL` variables; each segment
/// then supplies `_USER_ID`, `_EMAIL`, `_ACCESS_TOKEN` (required) and
/// `_REFRESH_TOKEN`, `_IMAP_HOST`, `_IMAP_PORT` (optional). An empty
/// environment yields an empty seed list, not an error.
///
/// # Errors
///
/// Returns `InvalidInput` if a discovered segment is missing a required
/// variable or carries a malformed port.
pub fn load_credential_seeds() -> AppResult<Vec<CredentialSeed>> {
    let account_pattern = Regex::new(r"^MAIL_SYNC_ACCOUNT_([A-Z0-9_]+)_EMAIL$")
        .map_err(|e| AppError::Internal(format!("invalid account regex: {e}")))?;

    let mut segments: Vec<String> = env::vars()
        .filter_map(|(k, _)| {
            account_pattern
                .captures(&k)
                .and_then(|c| c.get(1).map(|m| m.as_str().to_owned()))
        })
        .collect();
    segments.sort();
    segments.dedup();

    segments.into_iter().map(|seg| load_seed(&seg)).collect()
}

/// Load a single credential seed by segment name
fn load_seed(segment: &str) -> AppResult<CredentialSeed> {
    let prefix = format!("MAIL_SYNC_ACCOUNT_{segment}_");
    Ok(CredentialSeed {
        user_id: require_env(&format!("{prefix}USER_ID"))?,
        email: require_env(&format!("{prefix}EMAIL"))?,
        imap_host: env_value(&format!("{prefix}IMAP_HOST"))?
            .unwrap_or_else(|| "imap.gmail.com".to_owned()),
        imap_port: parse_env(&format!("{prefix}IMAP_PORT"), 993u16)?,
        access_token: SecretString::new(require_env(&format!("{prefix}ACCESS_TOKEN"))?.into()),
        refresh_token: env_value(&format!("{prefix}REFRESH_TOKEN"))?
            .map(|t| SecretString::new(t.into())),
    })
}

/// Load the static WebSocket token table
///
/// `MAIL_SYNC_WS_TOKENS` holds comma-separated `token:userId` pairs, e.g.
/// `MAIL_SYNC_WS_TOKENS=dev-token-1:u1,dev-token-2:u2`. Unset yields an
/// empty table.
///
/// # Errors
///
/// Returns `InvalidInput` on a pair without a `:` separator or with an
/// empty token or user id.
pub fn load_ws_tokens() -> AppResult<Vec<(String, String)>> {
    let Some(raw) = env_value("MAIL_SYNC_WS_TOKENS")? else {
        return Ok(Vec::new());
    };

    raw.split(',')
        .filter(|pair| !pair.trim().is_empty())
        .map(|pair| {
            let (token, user_id) = pair.trim().split_once(':').ok_or_else(|| {
                AppError::invalid("MAIL_SYNC_WS_TOKENS entries must be 'token:userId'")
            })?;
            if token.is_empty() || user_id.is_empty() {
                return Err(AppError::invalid(
                    "MAIL_SYNC_WS_TOKENS entries must have a non-empty token and userId",
                ));
            }
            Ok((token.to_owned(), user_id.to_owned()))
        })
        .collect()
}

/// Read one environment variable, treating blank values as unset
///
/// Values are trimmed; a variable set to whitespace behaves like a missing
/// one so that `FOO=` in a `.env` file does not shadow a default.
fn env_value(key: &str) -> AppResult<Option<String>> {
    match env::var(key) {
        Ok(value) => {
            let trimmed = value.trim();
            Ok((!trimmed.is_empty()).then(|| trimmed.to_owned()))
        }
        Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => Err(AppError::invalid(format!(
            "environment variable {key} is not valid unicode"
        ))),
    }
}

/// Read an environment variable that must be present and non-blank
fn require_env(key: &str) -> AppResult<String> {
    env_value(key)?
        .ok_or_else(|| AppError::invalid(format!("environment variable {key} must be set")))
}

/// Parse an environment variable into any `FromStr` type
///
/// Returns `default` when the variable is unset or blank.
///
/// # Errors
///
/// Returns `InvalidInput` when the variable is set but does not parse.
fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> AppResult<T> {
    match env_value(key)? {
        Some(raw) => raw.parse::<T>().map_err(|_| {
            AppError::invalid(format!("environment variable {key} has invalid value '{raw}'"))
        }),
        None => Ok(default),
    }
}

/// Duration setting expressed in whole seconds
fn env_secs(key: &str, default_secs: u64) -> AppResult<Duration> {
    Ok(Duration::from_secs(parse_env(key, default_secs)?))
}

/// Duration setting expressed in milliseconds
fn env_millis(key: &str, default_ms: u64) -> AppResult<Duration> {
    Ok(Duration::from_millis(parse_env(key, default_ms)?))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{SyncConfig, env_value, parse_env};

    #[test]
    fn unset_variables_fall_back_to_defaults() {
        assert!(env_value("MAIL_SYNC_NEVER_SET_IN_ANY_ENV").unwrap().is_none());
        assert_eq!(parse_env("MAIL_SYNC_NEVER_SET_IN_ANY_ENV", 42u64).unwrap(), 42);
        assert_eq!(parse_env("MAIL_SYNC_NEVER_SET_IN_ANY_ENV", 993u16).unwrap(), 993);
    }

    #[test]
    fn defaults_match_documented_values() {
        // Environment is not mutated here; unset keys must fall back.
        let config = SyncConfig::load_from_env().expect("defaults must load");
        assert_eq!(config.backfill_window, Duration::from_secs(86_400));
        assert_eq!(config.idle_max, Duration::from_secs(28 * 60));
        assert_eq!(config.connect_timeout, Duration::from_secs(15));
        assert_eq!(config.fetch_timeout, Duration::from_secs(30));
        assert_eq!(config.retry_base, Duration::from_secs(5));
        assert_eq!(config.retry_cap, Duration::from_secs(60));
        assert_eq!(config.ws_heartbeat, Duration::from_secs(30));
        assert_eq!(config.ws_write_timeout, Duration::from_secs(5));
        assert_eq!(config.session_queue, 256);
        assert_eq!(config.shutdown_deadline, Duration::from_secs(10));
    }
}
