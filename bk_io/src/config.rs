//! Engine configuration.
//!
//! Every engine call receives an [`EngineConfig`]; nothing reads global
//! state. A config can be loaded from TOML, where every field is optional:
//!
//! ```toml
//! root = "/opt/brewkit"
//! jobs = 8
//!
//! [retry]
//! max_retries = 5
//! base_delay_ms = 500
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use bk_core::Error;

pub const DEFAULT_ROOT: &str = "/opt/brewkit";

/// Ambient variables passed through to install and test processes.
const DEFAULT_ENV_ALLOWLIST: &[&str] = &["USER", "LANG", "LC_ALL", "TERM", "TZ", "SSL_CERT_FILE"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Base directory the other paths default into
    pub root: PathBuf,
    /// `<install_root>/<name>/<version>-<revision>/`; defaults to `<root>/Cellar`
    pub install_root: Option<PathBuf>,
    /// Shared executable directory; defaults to `<root>/bin`
    pub shared_bin: Option<PathBuf>,
    /// Verified artifact cache; defaults to `<root>/cache`
    pub cache_dir: Option<PathBuf>,
    /// Concurrent install workers
    pub jobs: usize,
    /// Concurrent network transfers
    pub download_concurrency: usize,
    pub retry: RetryPolicy,
    pub env_allowlist: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT),
            install_root: None,
            shared_bin: None,
            cache_dir: None,
            jobs: default_jobs(),
            download_concurrency: 8,
            retry: RetryPolicy::default(),
            env_allowlist: DEFAULT_ENV_ALLOWLIST.iter().map(|v| v.to_string()).collect(),
        }
    }
}

impl EngineConfig {
    /// Defaults with every path under `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::fs(path, e))?;
        Self::from_toml_str(&contents).map_err(|e| match e {
            Error::Config { message } => Error::Config {
                message: format!("{}: {message}", path.display()),
            },
            other => other,
        })
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, Error> {
        let config: Self = toml::from_str(contents).map_err(|e| Error::Config {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.jobs == 0 {
            return Err(Error::Config {
                message: "jobs must be at least 1".to_string(),
            });
        }
        if self.download_concurrency == 0 {
            return Err(Error::Config {
                message: "download_concurrency must be at least 1".to_string(),
            });
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(Error::Config {
                message: "retry.max_delay_ms must not be smaller than retry.base_delay_ms"
                    .to_string(),
            });
        }
        Ok(())
    }

    pub fn install_root(&self) -> PathBuf {
        self.install_root
            .clone()
            .unwrap_or_else(|| self.root.join("Cellar"))
    }

    pub fn shared_bin(&self) -> PathBuf {
        self.shared_bin
            .clone()
            .unwrap_or_else(|| self.root.join("bin"))
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| self.root.join("cache"))
    }
}

fn default_jobs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Bounded exponential backoff for fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts after the first one
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 250,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// No retries and no waiting.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let millis = self
            .base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_ms);
        Duration::from_millis(millis)
    }
}
