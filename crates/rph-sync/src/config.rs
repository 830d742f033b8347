//! Typed crawl configuration and the YAML source registry.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use rph_adapters::ExtractionConfig;
use rph_core::WorkItem;
use rph_storage::{
    BackoffPolicy, BlockSignatures, PacingPolicy, ResponseClassifier, DEFAULT_USER_AGENTS,
};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{option} must be {expected}, got {value}")]
    Invalid {
        option: &'static str,
        expected: &'static str,
        value: String,
    },
    #[error("environment variable {var} is not a valid {expected}: {value:?}")]
    Env {
        var: &'static str,
        expected: &'static str,
        value: String,
    },
    #[error("reading source registry {path}: {source}")]
    RegistryRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing source registry {path}: {source}")]
    RegistryParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("duplicate source id `{0}` in registry")]
    DuplicateSource(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CrawlConfig {
    pub workers: usize,
    pub backoff: BackoffPolicy,
    pub reset_after_successes: u32,
    pub pacing: PacingPolicy,
    /// Pause every worker after this many successful fetches.
    pub cooldown_every: Option<u64>,
    pub cooldown: Duration,
    pub flush_every: usize,
    /// Sink NDJSON; also the source of the seen set on startup.
    pub output_path: PathBuf,
    pub progress_path: PathBuf,
    pub archive_dir: Option<PathBuf>,
    pub request_timeout: Duration,
    pub min_body_bytes: usize,
    pub user_agents: Vec<String>,
    pub block_signatures: BlockSignatures,
    /// Error records on disk are not treated as seen.
    pub retry_failed: bool,
    /// Ignore the seen set entirely.
    pub force: bool,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            backoff: BackoffPolicy::default(),
            reset_after_successes: 1,
            pacing: PacingPolicy::default(),
            cooldown_every: None,
            cooldown: Duration::from_secs(120),
            flush_every: 5,
            output_path: PathBuf::from("./data/records.ndjson"),
            progress_path: PathBuf::from("./data/progress.json"),
            archive_dir: None,
            request_timeout: Duration::from_secs(20),
            min_body_bytes: 100,
            user_agents: DEFAULT_USER_AGENTS.iter().map(|ua| ua.to_string()).collect(),
            block_signatures: BlockSignatures::default(),
            retry_failed: false,
            force: false,
        }
    }
}

fn invalid(option: &'static str, expected: &'static str, value: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        option,
        expected,
        value: value.to_string(),
    }
}

impl CrawlConfig {
    pub fn new(
        output_path: impl Into<PathBuf>,
        progress_path: impl Into<PathBuf>,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            output_path: output_path.into(),
            progress_path: progress_path.into(),
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=32).contains(&self.workers) {
            return Err(invalid("workers", "between 1 and 32", self.workers));
        }
        if !(self.backoff.factor.is_finite() && self.backoff.factor >= 1.0) {
            return Err(invalid("backoff.factor", ">= 1.0", self.backoff.factor));
        }
        if self.backoff.max_delay < self.backoff.base_delay {
            return Err(invalid(
                "backoff.max_delay",
                ">= backoff.base_delay",
                format!("{:?} < {:?}", self.backoff.max_delay, self.backoff.base_delay),
            ));
        }
        if self.reset_after_successes == 0 {
            return Err(invalid("backoff.reset_after_successes", ">= 1", 0));
        }
        if self.cooldown_every == Some(0) {
            return Err(invalid("cooldown_every", ">= 1 when set", 0));
        }
        if self.flush_every == 0 {
            return Err(invalid("flush_every", ">= 1", 0));
        }
        if self.user_agents.iter().all(|ua| ua.trim().is_empty()) {
            return Err(invalid("user_agents", "a non-empty list", "[]"));
        }
        if self.output_path.as_os_str().is_empty() {
            return Err(invalid("output_path", "a file path", "\"\""));
        }
        if self.progress_path.as_os_str().is_empty() {
            return Err(invalid("progress_path", "a file path", "\"\""));
        }
        Ok(())
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from `RPH_*` variables provided by `lookup`; unset keys keep defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let env = EnvReader { lookup: &lookup };

        if let Some(v) = env.parse::<usize>("RPH_WORKERS", "integer")? {
            config.workers = v;
        }
        if let Some(v) = env.parse::<usize>("RPH_MAX_RETRIES", "integer")? {
            config.backoff.max_retries = v;
        }
        if let Some(v) = env.millis("RPH_BACKOFF_BASE_MS")? {
            config.backoff.base_delay = v;
        }
        if let Some(v) = env.parse::<f64>("RPH_BACKOFF_FACTOR", "number")? {
            config.backoff.factor = v;
        }
        if let Some(v) = env.millis("RPH_BACKOFF_MAX_MS")? {
            config.backoff.max_delay = v;
        }
        if let Some(v) = env.millis("RPH_BACKOFF_JITTER_MS")? {
            config.backoff.jitter = v;
        }
        if let Some(v) = env.parse::<u32>("RPH_BACKOFF_RESET_AFTER", "integer")? {
            config.reset_after_successes = v;
        }
        if let Some(v) = env.millis("RPH_PACING_GAP_MS")? {
            config.pacing.min_gap = v;
        }
        if let Some(v) = env.millis("RPH_PACING_JITTER_MS")? {
            config.pacing.jitter = v;
        }
        if let Some(v) = env.parse::<u64>("RPH_COOLDOWN_EVERY", "integer")? {
            config.cooldown_every = Some(v);
        }
        if let Some(v) = env.parse::<u64>("RPH_COOLDOWN_SECS", "integer")? {
            config.cooldown = Duration::from_secs(v);
        }
        if let Some(v) = env.parse::<usize>("RPH_FLUSH_EVERY", "integer")? {
            config.flush_every = v;
        }
        if let Some(v) = env.raw("RPH_OUTPUT") {
            config.output_path = PathBuf::from(v);
        }
        if let Some(v) = env.raw("RPH_PROGRESS") {
            config.progress_path = PathBuf::from(v);
        }
        if let Some(v) = env.raw("RPH_ARCHIVE_DIR") {
            config.archive_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = env.parse::<u64>("RPH_HTTP_TIMEOUT_SECS", "integer")? {
            config.request_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env.parse::<usize>("RPH_MIN_BODY_BYTES", "integer")? {
            config.min_body_bytes = v;
        }
        if let Some(v) = env.raw("RPH_USER_AGENTS") {
            config.user_agents = v
                .split('|')
                .map(str::trim)
                .filter(|ua| !ua.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = env.raw("RPH_BLOCK_URL_PATTERNS") {
            config.block_signatures.url_patterns = split_list(&v);
        }
        if let Some(v) = env.raw("RPH_BLOCK_BODY_PATTERNS") {
            config.block_signatures.body_patterns = split_list(&v);
        }
        if let Some(v) = env.flag("RPH_RETRY_FAILED") {
            config.retry_failed = v;
        }
        if let Some(v) = env.flag("RPH_FORCE") {
            config.force = v;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn classifier(&self) -> ResponseClassifier {
        ResponseClassifier {
            min_body_bytes: self.min_body_bytes,
            signatures: self.block_signatures.clone(),
        }
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split('|')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

struct EnvReader<'a, F> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<'_, F> {
    fn raw(&self, var: &str) -> Option<String> {
        (self.lookup)(var).filter(|v| !v.trim().is_empty())
    }

    fn parse<T: std::str::FromStr>(
        &self,
        var: &'static str,
        expected: &'static str,
    ) -> Result<Option<T>, ConfigError> {
        match self.raw(var) {
            None => Ok(None),
            Some(value) => value
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| ConfigError::Env { var, expected, value }),
        }
    }

    fn millis(&self, var: &'static str) -> Result<Option<Duration>, ConfigError> {
        Ok(self
            .parse::<u64>(var, "millisecond count")?
            .map(Duration::from_millis))
    }

    fn flag(&self, var: &str) -> Option<bool> {
        self.raw(var)
            .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
    }
}

/// A multi-page resource. `{page}` in the URL (and form values) is replaced
/// by the page number.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ResourceSeed {
    pub resource_key: String,
    pub url_template: String,
    #[serde(default)]
    pub form: Option<BTreeMap<String, String>>,
}

impl ResourceSeed {
    pub fn page_item(&self, source_id: &str, page: u32) -> WorkItem {
        let page_str = page.to_string();
        let mut item = WorkItem::page(
            self.url_template.replace("{page}", &page_str),
            source_id,
            self.resource_key.clone(),
            page,
        );
        if let Some(form) = &self.form {
            item.form = Some(
                form.iter()
                    .map(|(k, v)| (k.clone(), v.replace("{page}", &page_str)))
                    .collect(),
            );
        }
        item
    }
}

/// Candidate URL filters applied to a target source before sequence matching.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CandidateFilter {
    #[serde(default)]
    pub include_any: Vec<String>,
    #[serde(default)]
    pub exclude_any: Vec<String>,
}

impl CandidateFilter {
    pub fn accepts(&self, url: &str) -> bool {
        let url = url.to_lowercase();
        let included = self.include_any.is_empty()
            || self.include_any.iter().any(|p| url.contains(&p.to_lowercase()));
        included && !self.exclude_any.iter().any(|p| url.contains(&p.to_lowercase()))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub seeds: Vec<ResourceSeed>,
    #[serde(default)]
    pub urls: Vec<String>,
    /// NDJSON work list; each line needs a `url`.
    #[serde(default)]
    pub work_list: Option<PathBuf>,
    /// Turn each sub-listing URL of a record into a new work item.
    #[serde(default)]
    pub expand_sub_listings: bool,
    #[serde(default)]
    pub noise_tokens: Vec<String>,
    #[serde(default)]
    pub candidate_filter: CandidateFilter,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReconcileSettings {
    #[serde(default)]
    pub truth_source: Option<String>,
    /// Replaces the built-in noise list when non-empty.
    #[serde(default)]
    pub noise_tokens: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub reconcile: ReconcileSettings,
}

impl SourceRegistry {
    pub fn from_yaml_str(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let registry: SourceRegistry =
            serde_yaml::from_str(text).map_err(|source| ConfigError::RegistryParse {
                path: path.to_path_buf(),
                source,
            })?;
        let mut ids = BTreeSet::new();
        for source in &registry.sources {
            if !ids.insert(source.source_id.as_str()) {
                return Err(ConfigError::DuplicateSource(source.source_id.clone()));
            }
        }
        Ok(registry)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::RegistryRead {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_yaml_str(&text, path)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    pub fn get(&self, source_id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }
}
