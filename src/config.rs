//! Configuration management for Turnstile.
//!
//! Settings are resolved from a flat key-value [`ConfigSource`]. Resolution
//! never fails: anything missing or malformed falls back to its documented
//! default, with a warning for values that were present but unusable.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::ratelimit::MethodClass;

/// A key-value lookup used to resolve limiter settings.
pub trait ConfigSource {
    /// Look up a raw value by key.
    fn get(&self, key: &str) -> Option<String>;
}

/// Reads settings from the process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSource;

impl ConfigSource for EnvSource {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl ConfigSource for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}

/// Layered configuration (files + environment) built with the `config` crate.
///
/// Keys are looked up lower-cased, matching how `config::Environment`
/// normalizes variable names.
impl ConfigSource for config::Config {
    fn get(&self, key: &str) -> Option<String> {
        self.get_string(&key.to_ascii_lowercase()).ok()
    }
}

/// Which counting backend the operator asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    /// Always count in process memory.
    Memory,
    /// Always count in the shared backend.
    Shared,
    /// Shared outside development-like environments, memory inside them.
    Auto,
}

impl FromStr for BackendMode {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(BackendMode::Memory),
            "shared" | "redis" => Ok(BackendMode::Shared),
            "auto" => Ok(BackendMode::Auto),
            _ => Err(()),
        }
    }
}

/// Requests allowed per fixed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowPolicy {
    /// Maximum admitted requests per window
    pub limit: u64,
    /// Window length in seconds
    pub window_secs: u64,
}

impl WindowPolicy {
    /// Window length as a [`Duration`].
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Connection parameters for the shared Redis backend.
#[derive(Clone, Serialize, Deserialize)]
pub struct RedisSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub db: i64,
    pub tls: bool,
    /// Upper bound on a single shared-backend operation
    #[serde(with = "millis")]
    pub op_timeout: Duration,
}

impl RedisSettings {
    /// Connection URL understood by `redis::Client::open`.
    pub fn url(&self) -> String {
        let scheme = if self.tls { "rediss" } else { "redis" };
        let encode = |s: &str| utf8_percent_encode(s, NON_ALPHANUMERIC).to_string();

        let auth = match (&self.username, &self.password) {
            (Some(user), Some(pass)) => format!("{}:{}@", encode(user), encode(pass)),
            (None, Some(pass)) => format!(":{}@", encode(pass)),
            (Some(user), None) => format!("{}@", encode(user)),
            (None, None) => String::new(),
        };

        format!("{}://{}{}:{}/{}", scheme, auth, self.host, self.port, self.db)
    }
}

impl fmt::Debug for RedisSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("db", &self.db)
            .field("tls", &self.tls)
            .field("op_timeout", &self.op_timeout)
            .finish()
    }
}

/// Process-wide limiter settings, immutable once resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterSettings {
    /// Policy for POST, PUT, PATCH and DELETE
    pub mutating: WindowPolicy,
    /// Policy for GET and every other method
    pub read: WindowPolicy,
    /// Configured backend mode
    pub mode: BackendMode,
    /// Deployment environment label
    pub environment: String,
    /// Namespace for shared counter keys
    pub key_prefix: String,
    /// Whether to count locally when the shared backend is unreachable
    pub memory_fallback: bool,
    /// Shared backend connection parameters
    pub redis: RedisSettings,
}

const DEFAULT_MUTATING_LIMIT: u64 = 5;
const DEFAULT_READ_LIMIT: u64 = 50;
const DEFAULT_WINDOW_SECS: u64 = 60;
const DEFAULT_ENVIRONMENT: &str = "development";
const DEFAULT_KEY_PREFIX: &str = "rate_limit";
const DEFAULT_REDIS_HOST: &str = "localhost";
const DEFAULT_REDIS_PORT: u16 = 6379;
const DEFAULT_OP_TIMEOUT_MS: u64 = 500;

impl LimiterSettings {
    /// Resolve settings from any configuration source.
    pub fn from_source<S: ConfigSource + ?Sized>(source: &S) -> Self {
        let environment = lookup(source, &["APP_ENV", "NODE_ENV"])
            .unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_string());
        let fallback_default = is_development_like(&environment);

        let mode = match lookup(source, &["RATE_LIMIT_STORE"]) {
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                warn!(value = %raw, "Unknown RATE_LIMIT_STORE, using auto");
                BackendMode::Auto
            }),
            None => BackendMode::Auto,
        };

        Self {
            mutating: WindowPolicy {
                limit: limit(source, &["RATE_LIMIT_POST_MAX", "RATE_LIMIT_POST_LIMIT"], DEFAULT_MUTATING_LIMIT),
                window_secs: window(source, "RATE_LIMIT_POST_WINDOW"),
            },
            read: WindowPolicy {
                limit: limit(source, &["RATE_LIMIT_GET_MAX", "RATE_LIMIT_GET_LIMIT"], DEFAULT_READ_LIMIT),
                window_secs: window(source, "RATE_LIMIT_GET_WINDOW"),
            },
            mode,
            environment,
            key_prefix: lookup(source, &["RATE_LIMIT_KEY_PREFIX"])
                .unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string()),
            memory_fallback: boolean(source, "RATE_LIMIT_MEMORY_FALLBACK", fallback_default),
            redis: RedisSettings {
                host: lookup(source, &["RATE_LIMIT_REDIS_HOST", "REDIS_HOST"])
                    .unwrap_or_else(|| DEFAULT_REDIS_HOST.to_string()),
                port: number(source, &["RATE_LIMIT_REDIS_PORT", "REDIS_PORT"], DEFAULT_REDIS_PORT),
                username: lookup(source, &["RATE_LIMIT_REDIS_USERNAME", "REDIS_USERNAME"]),
                password: lookup(source, &["RATE_LIMIT_REDIS_PASSWORD", "REDIS_PASSWORD"]),
                db: number(source, &["RATE_LIMIT_REDIS_DB"], 0),
                tls: boolean(source, "RATE_LIMIT_REDIS_TLS", false),
                op_timeout: Duration::from_millis(number(
                    source,
                    &["RATE_LIMIT_REDIS_TIMEOUT_MS"],
                    DEFAULT_OP_TIMEOUT_MS,
                )),
            },
        }
    }

    /// Resolve settings from the process environment.
    pub fn from_env() -> Self {
        Self::from_source(&EnvSource)
    }

    /// Whether the deployment environment label denotes a local/development setup.
    pub fn is_development(&self) -> bool {
        is_development_like(&self.environment)
    }

    /// Whether the resolved mode counts in the shared backend.
    ///
    /// `auto` trusts the environment label; it never probes reachability.
    pub fn uses_shared_backend(&self) -> bool {
        match self.mode {
            BackendMode::Memory => false,
            BackendMode::Shared => true,
            BackendMode::Auto => !self.is_development(),
        }
    }

    /// The window policy applying to a method class.
    pub fn policy_for(&self, class: MethodClass) -> WindowPolicy {
        match class {
            MethodClass::Mutating => self.mutating,
            MethodClass::Read => self.read,
        }
    }
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self::from_source(&HashMap::new())
    }
}

fn is_development_like(environment: &str) -> bool {
    matches!(
        environment.trim().to_ascii_lowercase().as_str(),
        "development" | "dev" | "local"
    )
}

/// First non-blank value among `keys`.
fn lookup<S: ConfigSource + ?Sized>(source: &S, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| source.get(key))
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
}

fn number<S, T>(source: &S, keys: &[&str], default: T) -> T
where
    S: ConfigSource + ?Sized,
    T: FromStr + Copy + fmt::Display,
{
    match lookup(source, keys) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(key = keys[0], value = %raw, default = %default, "Invalid number, using default");
            default
        }),
        None => default,
    }
}

fn limit<S: ConfigSource + ?Sized>(source: &S, keys: &[&str], default: u64) -> u64 {
    match number(source, keys, default) {
        0 => {
            warn!(key = keys[0], default, "Zero limit, using default");
            default
        }
        max => max,
    }
}

fn window<S: ConfigSource + ?Sized>(source: &S, key: &str) -> u64 {
    match number(source, &[key], DEFAULT_WINDOW_SECS) {
        0 => {
            warn!(key, default = DEFAULT_WINDOW_SECS, "Zero window, using default");
            DEFAULT_WINDOW_SECS
        }
        secs => secs,
    }
}

fn boolean<S: ConfigSource + ?Sized>(source: &S, key: &str, default: bool) -> bool {
    let Some(raw) = lookup(source, &[key]) else {
        return default;
    };

    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => true,
        "false" | "0" | "no" => false,
        _ => {
            warn!(key, value = %raw, default, "Invalid boolean, using default");
            default
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
