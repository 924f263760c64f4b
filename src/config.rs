//! Configuration types.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Scheduler and dispatch tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Interval between scheduler ticks.
    pub tick_interval: Duration,
    /// Maximum number of senders processed concurrently within one tick.
    pub max_parallel_senders: usize,
    /// Upper bound on a single mail-send call.
    pub send_timeout: Duration,
    /// Consecutive send failures after which an enrollment is treated as bounced.
    pub max_send_attempts: u32,
    /// First retry delay after a failed send (doubles per attempt).
    pub retry_backoff_base: Duration,
    /// Ceiling for the retry delay.
    pub retry_backoff_max: Duration,
    /// How long a claimed enrollment stays locked if its worker dies.
    pub claim_ttl: Duration,
    /// Delay before retrying a send that failed to render.
    pub render_retry_delay: Duration,
    /// Time a completed enrollment waits for a late reply before the no-response verdict.
    pub no_response_grace: Duration,
    /// Failed automation attempts after which a trigger is no longer retried by ticks.
    pub max_trigger_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(3600), // hourly
            max_parallel_senders: 8,
            send_timeout: Duration::from_secs(30),
            max_send_attempts: 3,
            retry_backoff_base: Duration::from_secs(15 * 60),
            retry_backoff_max: Duration::from_secs(6 * 3600),
            claim_ttl: Duration::from_secs(600),
            render_retry_delay: Duration::from_secs(24 * 3600),
            no_response_grace: Duration::from_secs(3 * 24 * 3600),
            max_trigger_attempts: 5,
        }
    }
}

impl EngineConfig {
    /// Build from `OUTREACH_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            tick_interval: env_secs("OUTREACH_TICK_SECS", defaults.tick_interval)?,
            max_parallel_senders: env_parse(
                "OUTREACH_MAX_PARALLEL_SENDERS",
                defaults.max_parallel_senders,
            )?
            .max(1),
            send_timeout: env_secs("OUTREACH_SEND_TIMEOUT_SECS", defaults.send_timeout)?,
            max_send_attempts: env_parse("OUTREACH_MAX_SEND_ATTEMPTS", defaults.max_send_attempts)?
                .max(1),
            retry_backoff_base: env_secs("OUTREACH_RETRY_BASE_SECS", defaults.retry_backoff_base)?,
            retry_backoff_max: env_secs("OUTREACH_RETRY_MAX_SECS", defaults.retry_backoff_max)?,
            claim_ttl: env_secs("OUTREACH_CLAIM_TTL_SECS", defaults.claim_ttl)?,
            render_retry_delay: env_secs(
                "OUTREACH_RENDER_RETRY_SECS",
                defaults.render_retry_delay,
            )?,
            no_response_grace: env_secs(
                "OUTREACH_NO_RESPONSE_GRACE_SECS",
                defaults.no_response_grace,
            )?,
            max_trigger_attempts: env_parse(
                "OUTREACH_MAX_TRIGGER_ATTEMPTS",
                defaults.max_trigger_attempts,
            )?
            .max(1),
        })
    }
}

/// Process-level settings for the service binary.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub db_path: PathBuf,
    pub http_port: u16,
    /// Directory for rolling log files; stderr only when unset.
    pub log_dir: Option<PathBuf>,
    pub contacts_url: String,
    pub contacts_token: Option<SecretString>,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let contacts_url = std::env::var("OUTREACH_CONTACTS_URL")
            .map_err(|_| ConfigError::MissingEnvVar("OUTREACH_CONTACTS_URL".into()))?;

        Ok(Self {
            db_path: std::env::var("OUTREACH_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/outreach.db")),
            http_port: env_parse("OUTREACH_HTTP_PORT", 8080)?,
            log_dir: std::env::var("OUTREACH_LOG_DIR").ok().map(PathBuf::from),
            contacts_url,
            contacts_token: std::env::var("OUTREACH_CONTACTS_TOKEN")
                .ok()
                .map(SecretString::from),
        })
    }
}

/// SMTP settings for the bundled mail sender.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    /// Fallback `From` address for senders without their own entry.
    pub from_address: String,
    /// `From` address per sender id, from `SMTP_SENDER_ADDRESSES`.
    pub sender_addresses: HashMap<String, String>,
}

impl SmtpConfig {
    /// Returns `None` if `SMTP_HOST` is not set.
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        let Ok(host) = std::env::var("SMTP_HOST") else {
            return Ok(None);
        };
        let username = std::env::var("SMTP_USERNAME").unwrap_or_default();
        let from_address =
            std::env::var("SMTP_FROM_ADDRESS").unwrap_or_else(|_| username.clone());
        Ok(Some(Self {
            host,
            port: env_parse("SMTP_PORT", 587)?,
            username,
            password: SecretString::from(std::env::var("SMTP_PASSWORD").unwrap_or_default()),
            from_address,
            sender_addresses: match std::env::var("SMTP_SENDER_ADDRESSES") {
                Ok(raw) => parse_sender_addresses(&raw)?,
                Err(_) => HashMap::new(),
            },
        }))
    }
}

/// Parse `sender=address` pairs separated by commas.
fn parse_sender_addresses(raw: &str) -> Result<HashMap<String, String>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (sender, address) = pair
                .split_once('=')
                .map(|(s, a)| (s.trim(), a.trim()))
                .filter(|(s, a)| !s.is_empty() && !a.is_empty())
                .ok_or_else(|| ConfigError::InvalidValue {
                    key: "SMTP_SENDER_ADDRESSES".into(),
                    message: format!("expected sender=address, got '{pair}'"),
                })?;
            Ok((sender.to_string(), address.to_string()))
        })
        .collect()
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => parse_value(key, &raw),
        Err(_) => Ok(default),
    }
}

fn env_secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_parse(key, default.as_secs()).map(Duration::from_secs)
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{raw}': {e}"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_tick_hourly() {
        let config = EngineConfig::default();
        assert_eq!(config.tick_interval, Duration::from_secs(3600));
        assert_eq!(config.max_send_attempts, 3);
    }

    #[test]
    fn parse_value_rejects_garbage() {
        let err = parse_value::<u64>("OUTREACH_TICK_SECS", "soon").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "OUTREACH_TICK_SECS"));
    }

    #[test]
    fn sender_addresses_parse_pairs() {
        let map = parse_sender_addresses(" s1=ada@engine.io, s2 = grace@navy.mil ,").unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map["s1"], "ada@engine.io");
        assert_eq!(map["s2"], "grace@navy.mil");
        assert!(parse_sender_addresses("s1").is_err());
        assert!(parse_sender_addresses("=ada@engine.io").is_err());
    }

    #[test]
    fn parse_value_trims_whitespace() {
        let value: u16 = parse_value("OUTREACH_HTTP_PORT", " 9090 ").unwrap();
        assert_eq!(value, 9090);
    }
}
