use std::{env, fmt::Display, str::FromStr, time::Duration};

use tracing::{info, warn};

use crate::rate::OperationClass;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("Invalid {key} value {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Fixed-window allowance for one operation class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RatePolicy {
    pub max_requests: u32,
    pub window: Duration,
}

impl RatePolicy {
    pub const fn per_minute(max_requests: u32) -> Self {
        Self {
            max_requests,
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateLimits {
    pub route_search: RatePolicy,
    pub suggestion: RatePolicy,
    pub profile_info: RatePolicy,
}

impl RateLimits {
    pub fn policy(&self, class: OperationClass) -> RatePolicy {
        match class {
            OperationClass::RouteSearch => self.route_search,
            OperationClass::SuggestionLookup => self.suggestion,
            OperationClass::ProfileInfo => self.profile_info,
        }
    }
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            route_search: RatePolicy::per_minute(10),
            suggestion: RatePolicy::per_minute(30),
            profile_info: RatePolicy::per_minute(20),
        }
    }
}

#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Project root, e.g. `https://xyz.supabase.co`.
    pub url: String,
    pub anon_key: String,
    pub request_timeout: Duration,
    /// Extra attempts after a transient failure.
    pub retries: u32,
    /// Page the password reset mail links back to.
    pub reset_redirect: Option<String>,
}

#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Resume requests closer together than this collapse into one.
    pub resume_debounce: Duration,
    pub reconnect_delay: Duration,
    pub heartbeat: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            resume_debounce: Duration::from_millis(800),
            reconnect_delay: Duration::from_secs(2),
            heartbeat: Duration::from_secs(25),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PlannerConfig {
    pub store: StoreConfig,
    pub limits: RateLimits,
    pub sync: SyncConfig,
    /// How often expired rate-limit records are evicted.
    pub sweep_interval: Duration,
}

impl PlannerConfig {
    pub fn new(url: impl Into<String>, anon_key: impl Into<String>) -> Self {
        Self {
            store: StoreConfig {
                url: url.into(),
                anon_key: anon_key.into(),
                request_timeout: Duration::from_secs(10),
                retries: 1,
                reset_redirect: None,
            },
            limits: RateLimits::default(),
            sync: SyncConfig::default(),
            sweep_interval: Duration::from_secs(300),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None, None)
    }

    /// Read the environment, with explicit values taking precedence over
    /// `TROTRO_STORE_URL` and `TROTRO_ANON_KEY`.
    ///
    /// Unset tunables fall back to their defaults with a logged notice. A set
    /// but unparsable one is an error rather than silently ignored.
    pub fn load(url: Option<String>, anon_key: Option<String>) -> Result<Self, ConfigError> {
        let url = match url {
            Some(url) => url,
            None => required("TROTRO_STORE_URL")?,
        };
        let anon_key = match anon_key {
            Some(key) => key,
            None => required("TROTRO_ANON_KEY")?,
        };
        let mut config = Self::new(url, anon_key);

        config.store.request_timeout =
            Duration::from_millis(try_load("TROTRO_REQUEST_TIMEOUT_MS", 10_000)?);
        config.store.retries = try_load("TROTRO_REQUEST_RETRIES", 1)?;
        config.store.reset_redirect = optional("TROTRO_RESET_REDIRECT");

        let window = Duration::from_secs(try_load("TROTRO_RATE_WINDOW_SECS", 60)?);
        let limits = &mut config.limits;
        limits.route_search = RatePolicy {
            max_requests: try_load("TROTRO_ROUTE_SEARCH_LIMIT", 10)?,
            window,
        };
        limits.suggestion = RatePolicy {
            max_requests: try_load("TROTRO_SUGGESTION_LIMIT", 30)?,
            window,
        };
        limits.profile_info = RatePolicy {
            max_requests: try_load("TROTRO_PROFILE_LIMIT", 20)?,
            window,
        };

        config.sync.resume_debounce =
            Duration::from_millis(try_load("TROTRO_RESUME_DEBOUNCE_MS", 800)?);

        Ok(config)
    }
}

fn required(key: &'static str) -> Result<String, ConfigError> {
    env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .ok_or(ConfigError::Missing(key))
}

fn optional(key: &'static str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn try_load<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + Display,
    T::Err: Display,
{
    let Ok(raw) = env::var(key) else {
        info!("{key} not set, using default: {default}");
        return Ok(default);
    };

    raw.trim().parse().map_err(|e: T::Err| {
        warn!("Invalid {key} value: {e}");
        ConfigError::Invalid {
            key,
            value: raw,
            reason: e.to_string(),
        }
    })
}
