//! Durable crawl state for RPH: dedup store, checkpointed sink, progress
//! store, NDJSON loading, raw document archive, and the rate-limited fetcher.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use rph_core::{ExtractedRecord, ProgressState, WorkItem};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub mod fetch;

pub use fetch::{
    classify_status, BackoffPolicy, BackoffTracker, BlockSignatures, Fetcher, GlobalPacer,
    IdentityRotation, PacingPolicy, RateLimitedFetcher, RawResponse, ReqwestTransport,
    ResponseClassifier, RetryDisposition, Transport, TransportError, DEFAULT_USER_AGENTS,
};

pub const CRATE_NAME: &str = "rph-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Write `bytes` to a sibling temp file and rename it over `path`.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum WorkListError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedLine {
    pub line_number: usize,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct NdjsonLoad<T> {
    pub entries: Vec<T>,
    pub malformed: Vec<MalformedLine>,
}

impl<T> Default for NdjsonLoad<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            malformed: Vec::new(),
        }
    }
}

/// Parse newline-delimited JSON. Blank lines are skipped, invalid lines are
/// reported and skipped; a missing file loads as empty.
pub async fn load_ndjson<T: DeserializeOwned>(path: &Path) -> Result<NdjsonLoad<T>, WorkListError> {
    let text = match fs::read_to_string(path).await {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(NdjsonLoad::default()),
        Err(source) => {
            return Err(WorkListError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    Ok(parse_ndjson(&text, path))
}

fn parse_ndjson<T: DeserializeOwned>(text: &str, path: &Path) -> NdjsonLoad<T> {
    let mut load = NdjsonLoad::default();
    for (idx, line) in text.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(trimmed) {
            Ok(entry) => load.entries.push(entry),
            Err(err) => {
                warn!(
                    path = %path.display(),
                    line = idx + 1,
                    error = %err,
                    "skipping malformed line"
                );
                load.malformed.push(MalformedLine {
                    line_number: idx + 1,
                    error: err.to_string(),
                });
            }
        }
    }
    load
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkListEntry {
    url: String,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    resource_key: Option<String>,
    #[serde(default)]
    form: Option<BTreeMap<String, String>>,
}

/// Load flat work items. Entries need a `url`; `source` falls back to
/// `default_source`.
pub async fn load_work_list(
    path: &Path,
    default_source: &str,
) -> Result<NdjsonLoad<WorkItem>, WorkListError> {
    let raw: NdjsonLoad<WorkListEntry> = load_ndjson(path).await?;
    let entries = raw
        .entries
        .into_iter()
        .map(|entry| {
            let mut item = WorkItem::single(
                entry.url,
                entry.source.unwrap_or_else(|| default_source.to_string()),
            );
            if let Some(key) = entry.resource_key {
                item.resource_key = key;
            }
            item.form = entry.form;
            item
        })
        .collect();
    Ok(NdjsonLoad {
        entries,
        malformed: raw.malformed,
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeenLoadReport {
    pub records: usize,
    pub error_records: usize,
    pub skipped_errors: usize,
    pub malformed_lines: usize,
}

/// Keys of work already sunk. Grows monotonically during a run.
#[derive(Debug, Clone, Default)]
pub struct DedupStore {
    seen: HashSet<String>,
}

impl DedupStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the seen set from the sink output. Error records count as seen
    /// unless `retry_failed` is set.
    pub async fn load_from_sink(
        path: &Path,
        retry_failed: bool,
    ) -> anyhow::Result<(Self, SeenLoadReport)> {
        let load: NdjsonLoad<ExtractedRecord> = load_ndjson(path)
            .await
            .with_context(|| format!("loading seen set from {}", path.display()))?;

        let mut store = Self::new();
        let mut report = SeenLoadReport {
            malformed_lines: load.malformed.len(),
            ..SeenLoadReport::default()
        };
        for record in load.entries {
            report.records += 1;
            if record.is_error() {
                report.error_records += 1;
                if retry_failed {
                    report.skipped_errors += 1;
                    continue;
                }
            }
            store.seen.insert(record.source_url);
        }

        info!(
            path = %path.display(),
            seen = store.len(),
            records = report.records,
            error_records = report.error_records,
            malformed = report.malformed_lines,
            "loaded seen set"
        );
        Ok((store, report))
    }

    pub fn is_seen(&self, key: &str) -> bool {
        self.seen.contains(key)
    }

    /// Returns false when the key was already present.
    pub fn mark_seen(&mut self, key: impl Into<String>) -> bool {
        self.seen.insert(key.into())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Append-only NDJSON writer. Records are buffered as whole lines and written
/// every `flush_every` appends, so a crash loses at most the unflushed tail.
#[derive(Debug)]
pub struct CheckpointedSink {
    path: PathBuf,
    file: fs::File,
    buffer: Vec<u8>,
    pending: usize,
    flush_every: usize,
    written: u64,
}

/// Whether a non-empty file lacks a trailing newline. Only the last byte is read.
async fn ends_mid_line(path: &Path) -> std::io::Result<bool> {
    let mut file = match fs::File::open(path).await {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    };
    if file.metadata().await?.len() == 0 {
        return Ok(false);
    }
    file.seek(std::io::SeekFrom::End(-1)).await?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last).await?;
    Ok(last[0] != b'\n')
}

impl CheckpointedSink {
    pub async fn open(path: impl Into<PathBuf>, flush_every: usize) -> anyhow::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating sink directory {}", parent.display()))?;
        }

        // A torn final line from a crashed run must not swallow the next record.
        let needs_newline = ends_mid_line(&path)
            .await
            .with_context(|| format!("reading sink {}", path.display()))?;

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("opening sink {}", path.display()))?;
        if needs_newline {
            warn!(path = %path.display(), "sink ended mid-line, terminating torn record");
            file.write_all(b"\n")
                .await
                .with_context(|| format!("repairing sink {}", path.display()))?;
        }

        Ok(Self {
            path,
            file,
            buffer: Vec::new(),
            pending: 0,
            flush_every: flush_every.max(1),
            written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Buffer one record. Returns true when this append triggered a flush.
    pub async fn append<T: Serialize>(&mut self, record: &T) -> anyhow::Result<bool> {
        serde_json::to_writer(&mut self.buffer, record).context("serializing sink record")?;
        self.buffer.push(b'\n');
        self.pending += 1;
        self.written += 1;
        if self.pending >= self.flush_every {
            self.flush().await?;
            return Ok(true);
        }
        Ok(false)
    }

    pub async fn flush(&mut self) -> anyhow::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.file
            .write_all(&self.buffer)
            .await
            .with_context(|| format!("writing sink {}", self.path.display()))?;
        self.file
            .flush()
            .await
            .with_context(|| format!("flushing sink {}", self.path.display()))?;
        debug!(path = %self.path.display(), records = self.pending, "flushed sink");
        self.buffer.clear();
        self.pending = 0;
        Ok(())
    }
}

/// Per-resource pagination progress persisted as one JSON object keyed by
/// resource key.
#[derive(Debug, Clone)]
pub struct ProgressStore {
    path: PathBuf,
    states: BTreeMap<String, ProgressState>,
}

impl ProgressStore {
    pub async fn load(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let mut states: BTreeMap<String, ProgressState> = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing progress file {}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("reading progress file {}", path.display()))
            }
        };
        for (key, state) in states.iter_mut() {
            state.resource_key = key.clone();
        }
        Ok(Self { path, states })
    }

    pub fn get(&self, resource_key: &str) -> Option<&ProgressState> {
        self.states.get(resource_key)
    }

    pub fn states(&self) -> impl Iterator<Item = &ProgressState> {
        self.states.values()
    }

    /// Store `state`, refusing to move a resource backwards.
    pub fn update(&mut self, state: ProgressState) -> bool {
        if let Some(existing) = self.states.get(&state.resource_key) {
            if state.last_completed_page < existing.last_completed_page
                || (existing.is_completed && !state.is_completed)
            {
                warn!(
                    resource_key = %state.resource_key,
                    existing = existing.last_completed_page,
                    proposed = state.last_completed_page,
                    "refusing to move progress backwards"
                );
                return false;
            }
        }
        self.states.insert(state.resource_key.clone(), state);
        true
    }

    pub async fn save(&self) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(&self.states).context("serializing progress")?;
        write_atomic(&self.path, &bytes)
            .await
            .with_context(|| format!("saving progress file {}", self.path.display()))
    }
}

#[derive(Debug, Clone)]
pub struct ArchivedDocument {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Immutable, hash-addressed copies of fetched documents.
#[derive(Debug, Clone)]
pub struct DocumentArchive {
    root: PathBuf,
}

impl DocumentArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn relative_path(
        fetched_at: DateTime<Utc>,
        source_id: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let day = fetched_at.format("%Y%m%d").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(day)
            .join(source_id)
            .join(format!("{content_hash}.{ext}"))
    }

    pub async fn store(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedDocument> {
        let content_hash = sha256_hex(bytes);
        let relative_path = Self::relative_path(fetched_at, source_id, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);

        let deduplicated = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?;
        if !deduplicated {
            write_atomic(&absolute_path, bytes).await?;
        }

        Ok(ArchivedDocument {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated,
        })
    }
}
