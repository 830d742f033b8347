//! Crawl and reconcile orchestration.
//!
//! [`run_crawl`] drives the worker pool over every enabled source of a
//! [`SourceRegistry`]; [`run_reconcile`] links the resulting records across
//! sources and writes one aggregated project per line.

pub mod aggregate;
pub mod config;
pub mod crawl;
pub mod frontier;
pub mod reconcile;

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use rph_core::{ExtractedRecord, ReconciledRecord};
use rph_storage::{load_ndjson, write_atomic};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};

pub use aggregate::{aggregate, aggregate_project, parse_price, unit_table};
pub use config::{
    CandidateFilter, ConfigError, CrawlConfig, ReconcileSettings, ResourceSeed, SourceConfig,
    SourceRegistry,
};
pub use crawl::{run_crawl, CrawlRunner, CrawlSummary, FetcherFactory, HttpFetcherFactory};
pub use frontier::Frontier;
pub use reconcile::{
    canonical_key, group_by_source, keyword_matches, NormalizationRules, Reconciler,
    ReconciliationReport, SequenceReconciler,
};

pub const CRATE_NAME: &str = "rph-sync";

/// Inputs and outputs of one reconcile run.
#[derive(Debug, Clone)]
pub struct ReconcileJob {
    pub inputs: Vec<PathBuf>,
    pub output_path: PathBuf,
    pub unmatched_path: PathBuf,
    /// Overrides the registry's truth source.
    pub truth_source: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub truth_source: String,
    pub records: usize,
    pub malformed_lines: usize,
    pub skipped_errors: usize,
    pub reconciled: usize,
    pub unmatched: usize,
    pub unclaimed: usize,
}

/// One line of the unmatched file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnmatchedEntry {
    pub source: String,
    pub url: String,
    pub reason: UnmatchedReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmatchedReason {
    /// A truth record that no other source matched.
    NoMatch,
    /// A candidate record that no truth record claimed.
    Unclaimed,
}

/// Reconciler configured from the registry: noise tokens, per-source
/// candidate filters, and the truth source (override, the configured one, or
/// the first enabled source).
pub fn reconciler_for(
    registry: &SourceRegistry,
    truth_override: Option<&str>,
) -> Result<SequenceReconciler> {
    let settings = &registry.reconcile;
    let truth = truth_override
        .map(str::to_string)
        .or_else(|| settings.truth_source.clone())
        .or_else(|| registry.enabled().next().map(|s| s.source_id.clone()));
    let Some(truth) = truth else {
        bail!("no truth source configured and no enabled source to fall back on");
    };
    if registry.get(&truth).is_none() {
        warn!(truth_source = %truth, "truth source is not in the registry");
    }

    let mut rules = if settings.noise_tokens.is_empty() {
        NormalizationRules::default()
    } else {
        NormalizationRules::with_noise_tokens(settings.noise_tokens.iter().cloned())
    };
    for source in &registry.sources {
        rules.extend_noise(source.noise_tokens.iter().cloned());
    }

    let mut reconciler = SequenceReconciler::new(truth, rules);
    for source in &registry.sources {
        if source.candidate_filter != CandidateFilter::default() {
            reconciler =
                reconciler.with_filter(source.source_id.clone(), source.candidate_filter.clone());
        }
    }
    Ok(reconciler)
}

pub fn unmatched_entries(report: &ReconciliationReport) -> Vec<UnmatchedEntry> {
    let mut entries: Vec<UnmatchedEntry> = report
        .unmatched
        .iter()
        .filter_map(ReconciledRecord::truth_record)
        .map(|record| UnmatchedEntry {
            source: record.source.clone(),
            url: record.source_url.clone(),
            reason: UnmatchedReason::NoMatch,
        })
        .collect();
    for (source, urls) in &report.unclaimed {
        entries.extend(urls.iter().map(|url| UnmatchedEntry {
            source: source.clone(),
            url: url.clone(),
            reason: UnmatchedReason::Unclaimed,
        }));
    }
    entries
}

fn to_ndjson<T: Serialize>(rows: &[T]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for row in rows {
        serde_json::to_writer(&mut out, row)?;
        out.push(b'\n');
    }
    Ok(out)
}

async fn load_records(inputs: &[PathBuf]) -> Result<(Vec<ExtractedRecord>, usize)> {
    let mut records = Vec::new();
    let mut malformed = 0;
    for path in inputs {
        let load = load_ndjson::<ExtractedRecord>(path)
            .await
            .with_context(|| format!("loading records from {}", path.display()))?;
        malformed += load.malformed.len();
        records.extend(load.entries);
    }
    Ok((records, malformed))
}

/// Reconcile crawled records and write the aggregated and unmatched files.
/// Only matched groups reach the aggregated file; truth records without a
/// match go to the unmatched file. Both files are replaced atomically.
pub async fn run_reconcile(
    job: &ReconcileJob,
    registry: &SourceRegistry,
) -> Result<ReconcileSummary> {
    let span = info_span!("reconcile_run", output = %job.output_path.display());
    reconcile_inner(job, registry).instrument(span).await
}

async fn reconcile_inner(
    job: &ReconcileJob,
    registry: &SourceRegistry,
) -> Result<ReconcileSummary> {
    let reconciler = reconciler_for(registry, job.truth_source.as_deref())?;
    let (records, malformed_lines) = load_records(&job.inputs).await?;
    let record_count = records.len();
    let report = reconciler.reconcile(&group_by_source(records));

    let projects = report
        .reconciled
        .iter()
        .map(aggregate_project)
        .collect::<Result<Vec<_>>>()?;
    write_output(&job.output_path, &to_ndjson(&projects)?).await?;

    let unmatched = unmatched_entries(&report);
    write_output(&job.unmatched_path, &to_ndjson(&unmatched)?).await?;

    let summary = ReconcileSummary {
        truth_source: reconciler.truth_source().to_string(),
        records: record_count,
        malformed_lines,
        skipped_errors: report.skipped_errors,
        reconciled: report.reconciled.len(),
        unmatched: report.unmatched.len(),
        unclaimed: report.unclaimed.values().map(Vec::len).sum(),
    };
    info!(
        truth_source = %summary.truth_source,
        records = summary.records,
        malformed_lines = summary.malformed_lines,
        reconciled = summary.reconciled,
        unmatched = summary.unmatched,
        unclaimed = summary.unclaimed,
        "reconcile finished"
    );
    Ok(summary)
}

async fn write_output(path: &Path, bytes: &[u8]) -> Result<()> {
    write_atomic(path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTRY: &str = r#"
sources:
  - source_id: site-a
    display_name: Site A
    extraction: { format: embedded_script, script_marker: "window.__INITIAL_STATE__" }
  - source_id: site-b
    display_name: Site B
    extraction: { format: json_api }
    noise_tokens: [phase]
    candidate_filter: { exclude_any: [photos] }
"#;

    fn registry() -> SourceRegistry {
        SourceRegistry::from_yaml_str(REGISTRY, Path::new("sources.yaml")).expect("registry")
    }

    #[test]
    fn truth_source_falls_back_to_first_enabled() {
        let reconciler = reconciler_for(&registry(), None).expect("reconciler");
        assert_eq!(reconciler.truth_source(), "site-a");
        let reconciler = reconciler_for(&registry(), Some("site-b")).expect("reconciler");
        assert_eq!(reconciler.truth_source(), "site-b");
    }

    #[test]
    fn unmatched_file_lists_both_buckets() {
        let truth = ExtractedRecord::parsed(
            "https://site-a.example/x/lake-vista/9/project",
            "site-a",
            Default::default(),
            vec![],
        );
        let report = ReconciliationReport {
            unmatched: vec![ReconciledRecord {
                canonical_key: "https://site-a.example/x/lake-vista/9/project".into(),
                truth_source: "site-a".into(),
                per_source_records: [("site-a".to_string(), truth)].into_iter().collect(),
                matched_urls: Default::default(),
                unmatched_sources: ["site-b".to_string()].into_iter().collect(),
            }],
            unclaimed: [(
                "site-b".to_string(),
                vec!["https://site-b.example/royal-gardens".to_string()],
            )]
            .into_iter()
            .collect(),
            ..ReconciliationReport::default()
        };

        let entries = unmatched_entries(&report);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].reason, UnmatchedReason::NoMatch);
        assert_eq!(entries[1].source, "site-b");
        let line = serde_json::to_string(&entries[1]).expect("json");
        assert!(line.contains(r#""reason":"unclaimed""#));
    }
}
