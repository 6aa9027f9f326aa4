use std::env;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(15);
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);
/// Exponent cap for the reconnect backoff.
pub const DEFAULT_BACKOFF_ATTEMPT_CAP: u32 = 8;
pub const DEFAULT_VIEWPORT_ROWS: usize = 24;
pub const DEFAULT_HISTORY_ROWS: usize = 2000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} must be a non-negative integer, got '{value}'")]
    InvalidNumber { var: &'static str, value: String },
    #[error("{var} must be greater than zero")]
    Zero { var: &'static str },
}

/// Exponential reconnect backoff: `min(base * 2^attempt, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub attempt_cap: u32,
}

impl BackoffPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(self.attempt_cap).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
            max: DEFAULT_BACKOFF_MAX,
            attempt_cap: DEFAULT_BACKOFF_ATTEMPT_CAP,
        }
    }
}

/// Connection registry configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Grace period between the last release and disposal of an entry.
    pub keep_alive: Duration,
    pub backoff: BackoffPolicy,
    pub viewport_rows: usize,
    /// Upper bound on materialized rows per session.
    pub history_rows: usize,
}

impl RegistryConfig {
    /// Load configuration from `BEACH_CONNECT_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let keep_alive = env_millis("BEACH_CONNECT_KEEP_ALIVE_MS")?.unwrap_or(defaults.keep_alive);
        let base = env_millis("BEACH_CONNECT_BACKOFF_BASE_MS")?.unwrap_or(defaults.backoff.base);
        let max = env_millis("BEACH_CONNECT_BACKOFF_MAX_MS")?.unwrap_or(defaults.backoff.max);
        let viewport_rows =
            env_nonzero("BEACH_CONNECT_VIEWPORT_ROWS")?.unwrap_or(defaults.viewport_rows);
        let history_rows =
            env_nonzero("BEACH_CONNECT_HISTORY_ROWS")?.unwrap_or(defaults.history_rows);
        Ok(Self {
            keep_alive,
            backoff: BackoffPolicy {
                base,
                max: max.max(base),
                attempt_cap: defaults.backoff.attempt_cap,
            },
            viewport_rows,
            history_rows,
        })
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            keep_alive: DEFAULT_KEEP_ALIVE,
            backoff: BackoffPolicy::default(),
            viewport_rows: DEFAULT_VIEWPORT_ROWS,
            history_rows: DEFAULT_HISTORY_ROWS,
        }
    }
}

fn env_number(var: &'static str) -> Result<Option<u64>, ConfigError> {
    let Ok(raw) = env::var(var) else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse::<u64>()
        .map(Some)
        .map_err(|_| ConfigError::InvalidNumber {
            var,
            value: raw.clone(),
        })
}

fn env_millis(var: &'static str) -> Result<Option<Duration>, ConfigError> {
    Ok(env_number(var)?.map(Duration::from_millis))
}

fn env_nonzero(var: &'static str) -> Result<Option<usize>, ConfigError> {
    match env_number(var)? {
        Some(0) => Err(ConfigError::Zero { var }),
        Some(value) => Ok(Some(value as usize)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    // Environment variable tests must not run in parallel
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    const VARS: [&str; 5] = [
        "BEACH_CONNECT_KEEP_ALIVE_MS",
        "BEACH_CONNECT_BACKOFF_BASE_MS",
        "BEACH_CONNECT_BACKOFF_MAX_MS",
        "BEACH_CONNECT_VIEWPORT_ROWS",
        "BEACH_CONNECT_HISTORY_ROWS",
    ];

    fn clear_env() {
        for var in VARS {
            unsafe {
                env::remove_var(var);
            }
        }
    }

    #[test]
    fn default_config_matches_constants() {
        let config = RegistryConfig::default();
        assert_eq!(config.keep_alive, Duration::from_millis(15_000));
        assert_eq!(config.backoff.base, Duration::from_secs(1));
        assert_eq!(config.backoff.max, Duration::from_secs(30));
        assert_eq!(config.viewport_rows, 24);
    }

    #[test]
    fn from_env_without_overrides_uses_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        assert_eq!(RegistryConfig::from_env().unwrap(), RegistryConfig::default());
    }

    #[test]
    fn from_env_reads_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            env::set_var("BEACH_CONNECT_KEEP_ALIVE_MS", "2500");
            env::set_var("BEACH_CONNECT_BACKOFF_BASE_MS", "200");
            env::set_var("BEACH_CONNECT_BACKOFF_MAX_MS", "100");
            env::set_var("BEACH_CONNECT_HISTORY_ROWS", "64");
        }
        let config = RegistryConfig::from_env().unwrap();
        clear_env();

        assert_eq!(config.keep_alive, Duration::from_millis(2500));
        assert_eq!(config.backoff.base, Duration::from_millis(200));
        // max never drops below base
        assert_eq!(config.backoff.max, Duration::from_millis(200));
        assert_eq!(config.history_rows, 64);
        assert_eq!(config.viewport_rows, DEFAULT_VIEWPORT_ROWS);
    }

    #[test]
    fn from_env_rejects_garbage() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            env::set_var("BEACH_CONNECT_VIEWPORT_ROWS", "tall");
        }
        let err = RegistryConfig::from_env().unwrap_err();
        clear_env();
        assert!(matches!(
            err,
            ConfigError::InvalidNumber { var: "BEACH_CONNECT_VIEWPORT_ROWS", .. }
        ));

        unsafe {
            env::set_var("BEACH_CONNECT_HISTORY_ROWS", "0");
        }
        let err = RegistryConfig::from_env().unwrap_err();
        clear_env();
        assert_eq!(err, ConfigError::Zero { var: "BEACH_CONNECT_HISTORY_ROWS" });
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(250),
            max: Duration::from_secs(5),
            attempt_cap: 8,
        };
        let delays: Vec<_> = (0..10).map(|n| policy.delay(n)).collect();
        for (n, delay) in delays.iter().enumerate() {
            let expected = Duration::from_millis(250 * (1u64 << n.min(8))).min(policy.max);
            assert_eq!(*delay, expected, "attempt {n}");
        }
        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn backoff_attempt_cap_bounds_exponent() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(10),
            max: Duration::from_secs(3600),
            attempt_cap: 3,
        };
        assert_eq!(policy.delay(3), Duration::from_millis(80));
        assert_eq!(policy.delay(12), Duration::from_millis(80));
    }
}
