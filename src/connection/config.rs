use crate::core::{RepoError, Result};
use serde::{Deserialize, Deserializer};
use std::time::Duration;

/// Repository configuration
///
/// Built with the setter chain or read from a JSON document. Durations are
/// written in seconds; a `null` session time disables the session sweep.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Instance name, used in logs
    pub name: String,

    /// Number of storage handles opened at startup
    pub pool_size: usize,

    /// How long a connection waits for a free handle
    #[serde(deserialize_with = "seconds")]
    pub connect_timeout: Duration,

    /// Idle time after which a session is closed by the sweeper
    #[serde(deserialize_with = "optional_seconds")]
    pub session_time: Option<Duration>,

    /// Period of the session sweep
    #[serde(deserialize_with = "seconds")]
    pub cleanup_interval: Duration,

    /// Re-raise postcommit failures instead of logging them (test mode)
    pub strict_postcommit: bool,

    /// Record undoable actions and return a transaction id on commit
    pub undo_support: bool,

    /// Capacity of the `(source, extid) -> eid` cache
    pub extid_cache_size: usize,

    pub default_language: String,
}

fn seconds<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Duration, D::Error> {
    f64::deserialize(deserializer).map(Duration::from_secs_f64)
}

fn optional_seconds<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<Duration>, D::Error> {
    Option::<f64>::deserialize(deserializer).map(|secs| secs.map(Duration::from_secs_f64))
}

impl RepositoryConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            pool_size: 4,
            connect_timeout: Duration::from_secs(5),
            session_time: Some(Duration::from_secs(24 * 60 * 60)),
            cleanup_interval: Duration::from_secs(120),
            strict_postcommit: false,
            undo_support: false,
            extid_cache_size: 2000,
            default_language: "en".to_string(),
        }
    }

    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn session_time(mut self, time: Option<Duration>) -> Self {
        self.session_time = time;
        self
    }

    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn strict_postcommit(mut self, strict: bool) -> Self {
        self.strict_postcommit = strict;
        self
    }

    pub fn undo_support(mut self, enabled: bool) -> Self {
        self.undo_support = enabled;
        self
    }

    pub fn extid_cache_size(mut self, size: usize) -> Self {
        self.extid_cache_size = size;
        self
    }

    pub fn default_language(mut self, lang: &str) -> Self {
        self.default_language = lang.to_string();
        self
    }

    /// Parse a JSON document, missing keys taking their default value.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|err| RepoError::Execution(format!("invalid configuration: {}", err)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(RepoError::Execution("name cannot be empty".into()));
        }

        if self.pool_size == 0 {
            return Err(RepoError::Execution("pool_size must be > 0".into()));
        }

        if self.cleanup_interval.is_zero() {
            return Err(RepoError::Execution("cleanup_interval must be > 0".into()));
        }

        if self.extid_cache_size == 0 {
            return Err(RepoError::Execution("extid_cache_size must be > 0".into()));
        }

        Ok(())
    }
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self::new("cubicweb")
    }
}
