use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use harvest_adapters::{BackoffPolicy, RetryPolicy};
use harvest_core::ReviewKeyScheme;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// How accepted records reach the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceMode {
    /// Venue rows rewritten once at the end of the pass; reviews appended once per venue.
    #[default]
    Simple,
    /// Venue checkpoints every `checkpoint_every` changes; reviews appended in bounded
    /// batches as pages arrive, stopping at the previous run's boundary.
    Resilient,
}

impl FromStr for PersistenceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "simple" => Ok(Self::Simple),
            "resilient" | "backup" => Ok(Self::Resilient),
            other => Err(format!("unknown persistence mode: {other}")),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HarvestConfig {
    pub venues_csv: PathBuf,
    pub reviews_csv: PathBuf,
    pub reports_dir: Option<PathBuf>,
    /// Venue names never admitted, compared case/whitespace-insensitively.
    pub blocklist: Vec<String>,
    pub review_key_scheme: ReviewKeyScheme,
    pub persistence: PersistenceMode,
    pub review_batch_size: usize,
    pub max_reviews_per_target: usize,
    pub checkpoint_every: usize,
    pub progress_every: usize,
    pub call_timeout_secs: u64,
    pub max_retries: usize,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            venues_csv: PathBuf::from("./data/venues.csv"),
            reviews_csv: PathBuf::from("./data/reviews.csv"),
            reports_dir: Some(PathBuf::from("./reports")),
            blocklist: Vec::new(),
            review_key_scheme: ReviewKeyScheme::ReviewerName,
            persistence: PersistenceMode::Simple,
            review_batch_size: 100,
            max_reviews_per_target: 2500,
            checkpoint_every: 10,
            progress_every: 10,
            call_timeout_secs: 10,
            max_retries: 3,
            retry_base_delay_ms: 250,
            retry_max_delay_ms: 5_000,
        }
    }
}

/// YAML file shape; every key optional and layered over the defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    venues_csv: Option<PathBuf>,
    reviews_csv: Option<PathBuf>,
    reports_dir: Option<PathBuf>,
    blocklist: Option<Vec<String>>,
    review_key_scheme: Option<ReviewKeyScheme>,
    persistence: Option<PersistenceMode>,
    review_batch_size: Option<usize>,
    max_reviews_per_target: Option<usize>,
    checkpoint_every: Option<usize>,
    progress_every: Option<usize>,
    call_timeout_secs: Option<u64>,
    max_retries: Option<usize>,
    retry_base_delay_ms: Option<u64>,
    retry_max_delay_ms: Option<u64>,
}

impl HarvestConfig {
    /// Defaults overridden by `HARVEST_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Defaults, then the YAML file (`path` or `HARVEST_CONFIG`), then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os("HARVEST_CONFIG").map(PathBuf::from));
        if let Some(path) = path {
            let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
            config.apply_yaml(&text, &path)?;
        }
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_yaml(text, Path::new("<inline>"))?;
        config.validate()?;
        Ok(config)
    }

    fn apply_yaml(&mut self, text: &str, path: &Path) -> Result<(), ConfigError> {
        let file: ConfigFile = serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        if let Some(v) = file.venues_csv {
            self.venues_csv = v;
        }
        if let Some(v) = file.reviews_csv {
            self.reviews_csv = v;
        }
        if let Some(v) = file.reports_dir {
            self.reports_dir = Some(v);
        }
        if let Some(v) = file.blocklist {
            self.blocklist = v;
        }
        if let Some(v) = file.review_key_scheme {
            self.review_key_scheme = v;
        }
        if let Some(v) = file.persistence {
            self.persistence = v;
        }
        self.review_batch_size = file.review_batch_size.unwrap_or(self.review_batch_size);
        self.max_reviews_per_target = file.max_reviews_per_target.unwrap_or(self.max_reviews_per_target);
        self.checkpoint_every = file.checkpoint_every.unwrap_or(self.checkpoint_every);
        self.progress_every = file.progress_every.unwrap_or(self.progress_every);
        self.call_timeout_secs = file.call_timeout_secs.unwrap_or(self.call_timeout_secs);
        self.max_retries = file.max_retries.unwrap_or(self.max_retries);
        self.retry_base_delay_ms = file.retry_base_delay_ms.unwrap_or(self.retry_base_delay_ms);
        self.retry_max_delay_ms = file.retry_max_delay_ms.unwrap_or(self.retry_max_delay_ms);
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("HARVEST_VENUES_CSV") {
            self.venues_csv = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("HARVEST_REVIEWS_CSV") {
            self.reviews_csv = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("HARVEST_REPORTS_DIR") {
            self.reports_dir = if v.trim().is_empty() {
                None
            } else {
                Some(PathBuf::from(v))
            };
        }
        self.review_key_scheme = env_parsed("HARVEST_KEY_SCHEME").unwrap_or(self.review_key_scheme);
        self.persistence = env_parsed("HARVEST_PERSISTENCE").unwrap_or(self.persistence);
        self.review_batch_size = env_parsed("HARVEST_REVIEW_BATCH").unwrap_or(self.review_batch_size);
        self.call_timeout_secs = env_parsed("HARVEST_TIMEOUT_SECS").unwrap_or(self.call_timeout_secs);
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.review_batch_size == 0 {
            return Err(ConfigError::Invalid("review_batch_size must be at least 1".into()));
        }
        if self.checkpoint_every == 0 {
            return Err(ConfigError::Invalid("checkpoint_every must be at least 1".into()));
        }
        if self.call_timeout_secs == 0 {
            return Err(ConfigError::Invalid("call_timeout_secs must be at least 1".into()));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            call_timeout: Duration::from_secs(self.call_timeout_secs),
            backoff: BackoffPolicy {
                max_retries: self.max_retries,
                base_delay: Duration::from_millis(self.retry_base_delay_ms),
                max_delay: Duration::from_millis(self.retry_max_delay_ms),
            },
        }
    }
}

fn env_parsed<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}
