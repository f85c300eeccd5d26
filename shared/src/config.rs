//! Configuration management for the loader and web apps.
//!
//! Everything is read from environment variables once at process start. The
//! `from_lookup` constructors take the lookup as a closure so tests can feed
//! a map instead of mutating the process environment.

use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use validator::Validate;

use crate::discovery::{branch_path, data_store_path, DEFAULT_BRANCH};
use crate::retry::RetryPolicy;
use crate::vertex::{HarmBlockThreshold, SafetyThresholds, DEFAULT_MODEL_ID};

/// Data stores used by this app always live in the global location.
pub const LOCATION: &str = "global";

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_PAGE_TITLE: &str = "Chat";
const DEFAULT_SESSION_TTL_SECS: u64 = 3600;

/// A required environment value is absent or unusable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),

    #[error("{var} is invalid: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// Timeout and retry settings for calls to Google APIs.
#[derive(Debug, Clone, Copy, Validate)]
pub struct RemoteConfig {
    /// Per-attempt deadline in seconds
    #[validate(range(min = 1, max = 600))]
    pub timeout_secs: u64,
    /// Retries after the first attempt
    #[validate(range(max = 10))]
    pub max_retries: u32,
}

impl RemoteConfig {
    fn from_lookup<F>(lookup: &F, default_timeout_secs: u64) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let remote = Self {
            timeout_secs: parsed(lookup, "REMOTE_TIMEOUT_SECS", default_timeout_secs)?,
            max_retries: parsed(lookup, "REMOTE_MAX_RETRIES", 2)?,
        };
        remote.validate().map_err(|e| ConfigError::Invalid {
            var: "REMOTE_TIMEOUT_SECS/REMOTE_MAX_RETRIES",
            reason: e.to_string(),
        })?;
        Ok(remote)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            attempt_timeout: self.timeout(),
            ..RetryPolicy::default()
        }
    }
}

/// Listener and outbound-call settings shared by both binaries.
#[derive(Debug, Clone, Copy)]
pub struct ServerConfig {
    pub port: u16,
    pub remote: RemoteConfig,
}

impl ServerConfig {
    /// Load server settings; `default_timeout_secs` applies when
    /// `REMOTE_TIMEOUT_SECS` is unset.
    pub fn from_env(default_timeout_secs: u64) -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok(), default_timeout_secs)
    }

    pub fn from_lookup<F>(lookup: F, default_timeout_secs: u64) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            port: parsed(&lookup, "PORT", DEFAULT_PORT)?,
            remote: RemoteConfig::from_lookup(&lookup, default_timeout_secs)?,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }
}

/// Configuration for the document import trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderConfig {
    /// Target project
    pub project_id: String,
    /// Data store location (always `global`)
    pub location: String,
    /// Target data store
    pub data_store_id: String,
    /// Source objects, `gs://` URIs
    pub gcs_uris: Vec<String>,
}

impl LoaderConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            project_id: required(&lookup, "PROJECT_ID")?,
            location: LOCATION.to_string(),
            data_store_id: required(&lookup, "DATA_STORE_ID")?,
            gcs_uris: parse_gcs_uris(&required(&lookup, "GCS_URI")?)?,
        })
    }

    /// Default branch of the target data store.
    pub fn branch_path(&self) -> String {
        branch_path(
            &self.project_id,
            &self.location,
            &self.data_store_id,
            DEFAULT_BRANCH,
        )
    }
}

/// Configuration for the conversational web app.
#[derive(Debug, Clone, Validate)]
pub struct WebConfig {
    pub project_id: String,
    /// Region hosting the generative model
    pub region: String,
    pub data_store_id: String,
    /// Browser tab title
    pub page_title: String,
    /// Header shown at the top of the page
    pub header_title: String,
    pub model_id: String,
    pub safety: SafetyThresholds,
    #[validate(range(min = 60))]
    pub session_ttl_secs: u64,
}

impl WebConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let page_title =
            optional(&lookup, "PAGE_TITLE").unwrap_or_else(|| DEFAULT_PAGE_TITLE.to_string());
        let defaults = SafetyThresholds::default();

        let config = Self {
            project_id: required(&lookup, "PROJECT_ID")?,
            region: required(&lookup, "REGION")?,
            data_store_id: required(&lookup, "DATA_STORE_ID")?,
            header_title: optional(&lookup, "ST_TITLE").unwrap_or_else(|| page_title.clone()),
            page_title,
            model_id: optional(&lookup, "MODEL_ID").unwrap_or_else(|| DEFAULT_MODEL_ID.to_string()),
            safety: SafetyThresholds {
                hate_speech: threshold(&lookup, "SAFETY_HATE_SPEECH", defaults.hate_speech)?,
                dangerous_content: threshold(
                    &lookup,
                    "SAFETY_DANGEROUS_CONTENT",
                    defaults.dangerous_content,
                )?,
                sexually_explicit: threshold(
                    &lookup,
                    "SAFETY_SEXUALLY_EXPLICIT",
                    defaults.sexually_explicit,
                )?,
                harassment: threshold(&lookup, "SAFETY_HARASSMENT", defaults.harassment)?,
            },
            session_ttl_secs: parsed(&lookup, "SESSION_TTL_SECS", DEFAULT_SESSION_TTL_SECS)?,
        };

        config.validate().map_err(|e| ConfigError::Invalid {
            var: "SESSION_TTL_SECS",
            reason: e.to_string(),
        })?;

        Ok(config)
    }

    /// Data store the chat model grounds its answers on.
    pub fn data_store_path(&self) -> String {
        data_store_path(&self.project_id, LOCATION, &self.data_store_id)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}

/// Split a comma separated `GCS_URI` value into individual `gs://` URIs.
pub fn parse_gcs_uris(raw: &str) -> Result<Vec<String>, ConfigError> {
    let uris: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|uri| !uri.is_empty())
        .map(String::from)
        .collect();

    if uris.is_empty() {
        return Err(ConfigError::Missing("GCS_URI"));
    }

    if let Some(bad) = uris
        .iter()
        .find(|uri| !uri.starts_with("gs://") || uri.len() <= "gs://".len())
    {
        return Err(ConfigError::Invalid {
            var: "GCS_URI",
            reason: format!("'{}' is not a gs:// URI", bad),
        });
    }

    Ok(uris)
}

fn required<F>(lookup: &F, var: &'static str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    optional(lookup, var).ok_or(ConfigError::Missing(var))
}

fn optional<F>(lookup: &F, var: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(var)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parsed<F, T>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match optional(lookup, var) {
        Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn threshold<F>(
    lookup: &F,
    var: &'static str,
    default: HarmBlockThreshold,
) -> Result<HarmBlockThreshold, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    parsed(lookup, var, default)
}
