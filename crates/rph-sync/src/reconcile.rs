//! Cross-source reconciliation by exact token-sequence matching on URL slugs.
//!
//! A truth-source record's project keyword (a path segment of its URL) is
//! normalized into tokens; a candidate from another source matches when its
//! normalized URL text contains the hyphen-joined token sequence verbatim.
//! There is no similarity scoring: anything that does not match exactly is
//! reported as unmatched.

use std::collections::{BTreeMap, BTreeSet};

use rph_core::{ExtractedRecord, ReconciledRecord};
use serde::Serialize;
use tracing::{debug, info};
use url::Url;

use crate::config::CandidateFilter;

pub const DEFAULT_NOISE_TOKENS: &[&str] = &[
    "for", "sale", "rent", "buy", "sell", "povp", "pdpid", "pppfs", "pppfr", "delhi", "noida",
    "bangalore", "hyderabad", "chennai", "kolkata", "ahmedabad", "pune", "surat", "visakhapatnam",
    "indore", "chandigarh", "kochi", "nagpur", "lucknow", "jaipur", "mumbai",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizationRules {
    pub noise_tokens: BTreeSet<String>,
    /// Which path segment, counted from the end, names the project.
    pub keyword_segment_from_end: usize,
}

impl Default for NormalizationRules {
    fn default() -> Self {
        Self {
            noise_tokens: DEFAULT_NOISE_TOKENS.iter().map(|t| t.to_string()).collect(),
            keyword_segment_from_end: 3,
        }
    }
}

impl NormalizationRules {
    pub fn with_noise_tokens(tokens: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            noise_tokens: tokens.into_iter().map(|t| t.into().to_lowercase()).collect(),
            ..Self::default()
        }
    }

    pub fn extend_noise(&mut self, tokens: impl IntoIterator<Item = impl Into<String>>) {
        self.noise_tokens
            .extend(tokens.into_iter().map(|t| t.into().to_lowercase()));
    }

    /// Lowercase, split on anything that is not alphanumeric, drop noise.
    pub fn tokens(&self, text: &str) -> Vec<String> {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty() && !self.noise_tokens.contains(*t))
            .map(str::to_string)
            .collect()
    }

    /// Normalized identifying text of a URL: its path tokens joined by `-`.
    pub fn normalized_text(&self, url: &str) -> String {
        self.tokens(&url_path(url)).join("-")
    }

    /// Token sequence of the project keyword segment: the configured segment
    /// from the end when the path is long enough, else the last segment.
    pub fn project_keyword(&self, url: &str) -> Vec<String> {
        let path = url_path(url);
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let n = self.keyword_segment_from_end.max(1);
        let segment = if segments.len() >= n {
            segments[segments.len() - n]
        } else {
            segments.last().copied().unwrap_or_default()
        };
        self.tokens(segment)
    }
}

fn url_path(url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url.split(['?', '#']).next().unwrap_or_default().to_string(),
    }
}

/// Progressive sequence test. Multi-token keywords must appear as one
/// hyphen-joined run; a single token is a plain substring test.
pub fn keyword_matches(keyword: &[String], candidate_text: &str) -> bool {
    match keyword {
        [] => false,
        [single] => candidate_text.contains(single.as_str()),
        tokens => candidate_text.contains(&tokens.join("-")),
    }
}

/// Stable key for a reconciled group: scheme and host lowercased, no query
/// or fragment, no trailing slash.
pub fn canonical_key(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) => {
            parsed.set_query(None);
            parsed.set_fragment(None);
            // Url lowercases scheme and host while parsing.
            parsed.to_string().trim_end_matches('/').to_string()
        }
        Err(_) => url
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .trim_end_matches('/')
            .to_string(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationReport {
    /// Truth records with at least one matching source.
    pub reconciled: Vec<ReconciledRecord>,
    /// Truth records no target source matched.
    pub unmatched: Vec<ReconciledRecord>,
    /// Target-source URLs that no truth record claimed, per source.
    pub unclaimed: BTreeMap<String, Vec<String>>,
    /// Records carrying an extraction error, excluded from matching.
    pub skipped_errors: usize,
}

pub trait Reconciler {
    fn reconcile(
        &self,
        records_by_source: &BTreeMap<String, Vec<ExtractedRecord>>,
    ) -> ReconciliationReport;
}

#[derive(Debug, Clone)]
pub struct SequenceReconciler {
    truth_source: String,
    rules: NormalizationRules,
    filters: BTreeMap<String, CandidateFilter>,
}

impl SequenceReconciler {
    pub fn new(truth_source: impl Into<String>, rules: NormalizationRules) -> Self {
        Self {
            truth_source: truth_source.into(),
            rules,
            filters: BTreeMap::new(),
        }
    }

    pub fn with_filter(mut self, source_id: impl Into<String>, filter: CandidateFilter) -> Self {
        self.filters.insert(source_id.into(), filter);
        self
    }

    pub fn truth_source(&self) -> &str {
        &self.truth_source
    }
}

impl Reconciler for SequenceReconciler {
    fn reconcile(
        &self,
        records_by_source: &BTreeMap<String, Vec<ExtractedRecord>>,
    ) -> ReconciliationReport {
        let mut report = ReconciliationReport::default();

        // Usable records per source, in URL order so every pass sees the same sequence.
        let mut usable: BTreeMap<&str, Vec<&ExtractedRecord>> = BTreeMap::new();
        for (source, records) in records_by_source {
            let mut kept: Vec<&ExtractedRecord> = Vec::new();
            for record in records {
                if record.is_error() {
                    report.skipped_errors += 1;
                } else {
                    kept.push(record);
                }
            }
            kept.sort_by(|a, b| a.source_url.cmp(&b.source_url));
            kept.dedup_by(|a, b| a.source_url == b.source_url);
            usable.insert(source.as_str(), kept);
        }

        let truth_records = usable.get(self.truth_source.as_str()).cloned().unwrap_or_default();
        let targets: Vec<(&str, Vec<(&ExtractedRecord, String)>)> = usable
            .iter()
            .filter(|(source, _)| **source != self.truth_source)
            .map(|(source, records)| {
                let filter = self.filters.get(*source);
                let candidates = records
                    .iter()
                    .filter(|r| filter.map_or(true, |f| f.accepts(&r.source_url)))
                    .map(|r| (*r, self.rules.normalized_text(&r.source_url)))
                    .collect();
                (*source, candidates)
            })
            .collect();

        let mut claimed: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        let mut groups: BTreeMap<String, ReconciledRecord> = BTreeMap::new();

        for truth in truth_records {
            let key = canonical_key(&truth.source_url);
            if groups.contains_key(&key) {
                debug!(
                    canonical_key = %key,
                    url = %truth.source_url,
                    "duplicate truth record ignored"
                );
                continue;
            }
            let keyword = self.rules.project_keyword(&truth.source_url);

            let mut group = ReconciledRecord {
                canonical_key: key.clone(),
                truth_source: self.truth_source.clone(),
                per_source_records: BTreeMap::from([(self.truth_source.clone(), truth.clone())]),
                matched_urls: BTreeMap::new(),
                unmatched_sources: BTreeSet::new(),
            };

            for (source, candidates) in &targets {
                let matched: Vec<&ExtractedRecord> = candidates
                    .iter()
                    .filter(|(_, text)| keyword_matches(&keyword, text))
                    .map(|(record, _)| *record)
                    .collect();
                if matched.is_empty() {
                    group.unmatched_sources.insert(source.to_string());
                    continue;
                }
                let entry = claimed.entry(*source).or_default();
                entry.extend(matched.iter().map(|r| r.source_url.as_str()));
                let urls = matched.iter().map(|r| r.source_url.clone()).collect();
                group.matched_urls.insert(source.to_string(), urls);
                group
                    .per_source_records
                    .insert(source.to_string(), merge_candidates(source, &matched));
            }

            groups.insert(key, group);
        }

        for group in groups.into_values() {
            if group.matched_urls.is_empty() && !targets.is_empty() {
                report.unmatched.push(group);
            } else {
                report.reconciled.push(group);
            }
        }

        for (source, candidates) in &targets {
            let taken = claimed.get(source);
            let leftovers: Vec<String> = candidates
                .iter()
                .map(|(record, _)| record.source_url.as_str())
                .filter(|url| !taken.is_some_and(|t| t.contains(url)))
                .map(str::to_string)
                .collect();
            if !leftovers.is_empty() {
                report.unclaimed.insert(source.to_string(), leftovers);
            }
        }

        info!(
            truth_source = %self.truth_source,
            reconciled = report.reconciled.len(),
            unmatched = report.unmatched.len(),
            skipped_errors = report.skipped_errors,
            "reconciliation finished"
        );
        report
    }
}

/// Fold several matched records of one source into one. Earlier records win
/// on field conflicts; sub-listings are concatenated in order.
fn merge_candidates(source: &str, matched: &[&ExtractedRecord]) -> ExtractedRecord {
    let mut merged = ExtractedRecord::parsed(
        matched.first().map(|r| r.source_url.clone()).unwrap_or_default(),
        source,
        Default::default(),
        Vec::new(),
    );
    for record in matched {
        if let (Some(into), Some(from)) = (merged.fields.as_mut(), record.fields.as_ref()) {
            for (k, v) in from {
                into.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }
        if let Some(listings) = merged.sub_listings.as_mut() {
            listings.extend(record.sub_listings().iter().cloned());
        }
        if merged.fetched_at.is_none() {
            merged.fetched_at = record.fetched_at;
        }
    }
    merged
}

pub fn group_by_source(
    records: impl IntoIterator<Item = ExtractedRecord>,
) -> BTreeMap<String, Vec<ExtractedRecord>> {
    let mut grouped: BTreeMap<String, Vec<ExtractedRecord>> = BTreeMap::new();
    for record in records {
        grouped.entry(record.source.clone()).or_default().push(record);
    }
    grouped
}
