//! Environment-backed runtime configuration for `padel-smoke`.

use std::env;

use padel_core::ClientTuning;
use thiserror::Error;
use url::Url;

const URL_KEY: &str = "PADEL_SUPABASE_URL";
const ANON_KEY_KEY: &str = "PADEL_SUPABASE_ANON_KEY";

/// Runtime configuration used by the smoke run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmokeConfig {
    /// Project base URL, e.g. `https://abc.supabase.co`.
    pub supabase_url: Url,
    /// Public anonymous key of the project.
    pub anon_key: String,
    /// Optional sign-in credentials; both or neither.
    pub credentials: Option<Credentials>,
    pub tuning: ClientTuning,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl SmokeConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let raw_url =
            optional_trimmed_env(URL_KEY, &mut lookup).ok_or(ConfigError::Missing(URL_KEY))?;
        let supabase_url = Url::parse(&raw_url).map_err(|err| ConfigError::InvalidValue {
            key: URL_KEY,
            value: raw_url.clone(),
            reason: err.to_string(),
        })?;
        if !matches!(supabase_url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidValue {
                key: URL_KEY,
                value: raw_url,
                reason: "scheme must be http or https".to_owned(),
            });
        }

        let anon_key = optional_trimmed_env(ANON_KEY_KEY, &mut lookup)
            .ok_or(ConfigError::Missing(ANON_KEY_KEY))?;

        let email = optional_trimmed_env("PADEL_EMAIL", &mut lookup);
        let password = lookup("PADEL_PASSWORD").filter(|value| !value.is_empty());
        let credentials = match (email, password) {
            (Some(email), Some(password)) => Some(Credentials { email, password }),
            (None, None) => None,
            (Some(_), None) => return Err(ConfigError::Missing("PADEL_PASSWORD")),
            (None, Some(_)) => return Err(ConfigError::Missing("PADEL_EMAIL")),
        };

        let defaults = ClientTuning::default();
        let tuning = ClientTuning {
            request_timeout_ms: parse_positive_u64(
                "PADEL_REQUEST_TIMEOUT_MS",
                defaults.request_timeout_ms,
                &mut lookup,
            )?,
            controller_retry_count: parse_positive_u32(
                "PADEL_CONTROLLER_RETRY_COUNT",
                defaults.controller_retry_count,
                &mut lookup,
            )?,
            controller_retry_delay_ms: parse_u64(
                "PADEL_CONTROLLER_RETRY_DELAY_MS",
                defaults.controller_retry_delay_ms,
                &mut lookup,
            )?,
            controller_timeout_ms: parse_positive_u64(
                "PADEL_CONTROLLER_TIMEOUT_MS",
                defaults.controller_timeout_ms,
                &mut lookup,
            )?,
            notification_debounce_ms: parse_u64(
                "PADEL_NOTIFICATION_DEBOUNCE_MS",
                defaults.notification_debounce_ms,
                &mut lookup,
            )?,
            module_retry_delay_ms: parse_u64(
                "PADEL_MODULE_RETRY_DELAY_MS",
                defaults.module_retry_delay_ms,
                &mut lookup,
            )?,
        };

        Ok(Self {
            supabase_url,
            anon_key,
            credentials,
            tuning,
        })
    }
}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_u64<F>(key: &'static str, default: u64, lookup: &mut F) -> Result<u64, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    value.parse::<u64>().map_err(|err| ConfigError::InvalidValue {
        key,
        value,
        reason: err.to_string(),
    })
}

fn parse_positive_u64<F>(
    key: &'static str,
    default: u64,
    lookup: &mut F,
) -> Result<u64, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let value = parse_u64(key, default, lookup)?;
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key,
            value: "0".to_owned(),
            reason: "must be at least 1".to_owned(),
        });
    }
    Ok(value)
}

fn parse_positive_u32<F>(
    key: &'static str,
    default: u32,
    lookup: &mut F,
) -> Result<u32, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let value = parse_positive_u64(key, u64::from(default), lookup)?;
    u32::try_from(value).map_err(|err| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
        reason: err.to_string(),
    })
}
