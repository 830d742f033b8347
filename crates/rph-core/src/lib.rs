//! Core domain model for the RPH harvesting pipeline.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

pub const CRATE_NAME: &str = "rph-core";

/// One fetchable unit. `resource_key` groups the pages of a multi-page resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    pub url: String,
    pub source: String,
    pub resource_key: String,
    #[serde(default)]
    pub page_index: Option<u32>,
    /// When present the request is sent as a form-encoded POST.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub form: Option<BTreeMap<String, String>>,
}

impl WorkItem {
    pub fn single(url: impl Into<String>, source: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            resource_key: url.clone(),
            url,
            source: source.into(),
            page_index: None,
            form: None,
        }
    }

    pub fn page(
        url: impl Into<String>,
        source: impl Into<String>,
        resource_key: impl Into<String>,
        page_index: u32,
    ) -> Self {
        Self {
            url: url.into(),
            source: source.into(),
            resource_key: resource_key.into(),
            page_index: Some(page_index),
            form: None,
        }
    }

    pub fn with_form(mut self, form: BTreeMap<String, String>) -> Self {
        self.form = Some(form);
        self
    }

    pub fn is_paged(&self) -> bool {
        self.page_index.is_some()
    }

    /// Request identity used by the dedup store and as the record's `sourceUrl`.
    /// POST items fold their (ordered) form into a query string.
    pub fn dedup_key(&self) -> String {
        match &self.form {
            Some(form) if !form.is_empty() => {
                let encoded = form
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join("&");
                let sep = if self.url.contains('?') { '&' } else { '?' };
                format!("{}{sep}{encoded}", self.url)
            }
            _ => self.url.clone(),
        }
    }
}

/// Result of resolving one URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Success { document: String, final_url: String },
    TransientFailure { reason: String },
    PermanentFailure { reason: String },
    /// The site answered with an anti-automation challenge instead of content.
    Blocked { reason: String },
}

impl FetchOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            FetchOutcome::Success { .. } => "success",
            FetchOutcome::TransientFailure { .. } => "transient",
            FetchOutcome::PermanentFailure { .. } => "permanent",
            FetchOutcome::Blocked { .. } => "blocked",
        }
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, FetchOutcome::Blocked { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ListingKind {
    Sale,
    Rent,
    Project,
    #[default]
    #[serde(other)]
    Other,
}

/// A listing nested under a record: a sale/rent offer on a project page, or a
/// project tile on a listing page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SubListing {
    #[serde(default)]
    pub kind: ListingKind,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: Option<String>,
    /// Raw price as published: a number or a text such as "1.21 Cr".
    #[serde(default)]
    pub price: Option<JsonValue>,
    #[serde(default)]
    pub size: Option<JsonValue>,
    #[serde(flatten)]
    pub extra: JsonMap<String, JsonValue>,
}

/// Output of an extraction adapter. Always produced; parse failures carry `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedRecord {
    pub source_url: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub fields: Option<JsonMap<String, JsonValue>>,
    #[serde(default)]
    pub sub_listings: Option<Vec<SubListing>>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetched_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

impl ExtractedRecord {
    pub fn parsed(
        source_url: impl Into<String>,
        source: impl Into<String>,
        fields: JsonMap<String, JsonValue>,
        sub_listings: Vec<SubListing>,
    ) -> Self {
        Self {
            source_url: source_url.into(),
            source: source.into(),
            fields: Some(fields),
            sub_listings: Some(sub_listings),
            error: None,
            fetched_at: None,
            content_hash: None,
        }
    }

    pub fn failed(
        source_url: impl Into<String>,
        source: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            source_url: source_url.into(),
            source: source.into(),
            fields: None,
            sub_listings: None,
            error: Some(error.into()),
            fetched_at: None,
            content_hash: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn field(&self, key: &str) -> Option<&JsonValue> {
        self.fields.as_ref().and_then(|f| f.get(key))
    }

    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.field(key).and_then(JsonValue::as_str)
    }

    pub fn sub_listings(&self) -> &[SubListing] {
        self.sub_listings.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourcePhase {
    NotStarted,
    InProgress { page: u32 },
    Completed,
}

/// Pagination progress for one resource. `last_completed_page` never decreases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressState {
    #[serde(skip)]
    pub resource_key: String,
    pub last_completed_page: u32,
    pub is_completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_pages: Option<u32>,
}

impl ProgressState {
    pub fn new(resource_key: impl Into<String>) -> Self {
        Self {
            resource_key: resource_key.into(),
            last_completed_page: 0,
            is_completed: false,
            total_pages: None,
        }
    }

    pub fn phase(&self) -> ResourcePhase {
        if self.is_completed {
            ResourcePhase::Completed
        } else if self.last_completed_page == 0 {
            ResourcePhase::NotStarted
        } else {
            ResourcePhase::InProgress {
                page: self.last_completed_page,
            }
        }
    }

    /// Record a total learned by refetching an earlier page, without moving
    /// `last_completed_page`.
    pub fn learn_total(&mut self, total_pages: u32) {
        let total = total_pages.max(1);
        self.total_pages = Some(total);
        if self.last_completed_page >= total {
            self.is_completed = true;
        }
    }

    /// Record `page` as durably sunk. Returns false when the page would move
    /// progress backwards (the state is left untouched in that case).
    pub fn advance(&mut self, page: u32, total_pages: Option<u32>) -> bool {
        if page < self.last_completed_page {
            return false;
        }
        if let Some(total) = total_pages {
            self.total_pages = Some(total.max(1));
        }
        self.last_completed_page = page;
        let total = self.total_pages.unwrap_or(1);
        if self.last_completed_page >= total {
            self.is_completed = true;
        }
        true
    }
}

/// Records from several sources that describe the same project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciledRecord {
    pub canonical_key: String,
    pub truth_source: String,
    pub per_source_records: BTreeMap<String, ExtractedRecord>,
    pub matched_urls: BTreeMap<String, Vec<String>>,
    pub unmatched_sources: BTreeSet<String>,
}

impl ReconciledRecord {
    pub fn truth_record(&self) -> Option<&ExtractedRecord> {
        self.per_source_records.get(&self.truth_source)
    }
}

/// One row of a project's own unit table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitSpec {
    pub unit_type: String,
    pub bedrooms: Option<u32>,
    pub gross_area: Option<f64>,
    pub carpet_area: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ListingCounts {
    pub sale: usize,
    pub rent: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitStat {
    pub unit_type: String,
    pub bedrooms: Option<u32>,
    pub price_min: Option<f64>,
    pub price_max: Option<f64>,
    pub price_avg: Option<f64>,
    pub rent_min: Option<f64>,
    pub rent_max: Option<f64>,
    pub rent_avg: Option<f64>,
    pub price_per_carpet: Option<f64>,
    pub price_per_gross: Option<f64>,
    pub rent_per_carpet: Option<f64>,
    pub rent_per_gross: Option<f64>,
    pub listing_counts: ListingCounts,
}

/// Line format of the reconciled output file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedProject {
    pub canonical_key: String,
    pub per_source: BTreeMap<String, JsonValue>,
    pub unit_stats: Vec<UnitStat>,
    #[serde(default)]
    pub unmatched_sources: BTreeSet<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_never_moves_backwards() {
        let mut state = ProgressState::new("bangalore-projects");
        assert_eq!(state.phase(), ResourcePhase::NotStarted);

        assert!(state.advance(1, Some(4)));
        assert!(state.advance(3, None));
        assert!(!state.advance(2, None));
        assert_eq!(state.last_completed_page, 3);
        assert_eq!(state.phase(), ResourcePhase::InProgress { page: 3 });

        assert!(state.advance(4, None));
        assert_eq!(state.phase(), ResourcePhase::Completed);
    }

    #[test]
    fn missing_total_pages_means_single_page_resource() {
        let mut state = ProgressState::new("one-pager");
        state.advance(1, None);
        assert!(state.is_completed);
    }

    #[test]
    fn learned_total_keeps_last_page() {
        let mut state: ProgressState =
            serde_json::from_str(r#"{"lastCompletedPage": 2, "isCompleted": false}"#).unwrap();
        assert_eq!(state.total_pages, None);

        state.learn_total(4);
        assert_eq!(state.last_completed_page, 2);
        assert_eq!(state.total_pages, Some(4));
        assert!(!state.is_completed);

        state.learn_total(2);
        assert!(state.is_completed);
    }

    #[test]
    fn failed_record_serializes_null_fields() {
        let record = ExtractedRecord::failed("https://a.example/p/1", "site-a", "http status 404");
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["sourceUrl"], "https://a.example/p/1");
        assert!(value["fields"].is_null());
        assert!(value["subListings"].is_null());
        assert_eq!(value["error"], "http status 404");
    }

    #[test]
    fn post_items_fold_form_into_dedup_key() {
        let mut form = BTreeMap::new();
        form.insert("reraId".to_string(), "PRM/KA/1".to_string());
        let item = WorkItem::single("https://a.example/loadreradetail", "site-a").with_form(form);
        assert_eq!(
            item.dedup_key(),
            "https://a.example/loadreradetail?reraId=PRM/KA/1"
        );
    }

    #[test]
    fn sub_listing_keeps_unknown_keys() {
        let listing: SubListing = serde_json::from_value(serde_json::json!({
            "kind": "rent",
            "title": "2 BHK Flat",
            "price": "45 K",
            "postedBy": "Owner"
        }))
        .unwrap();
        assert_eq!(listing.kind, ListingKind::Rent);
        assert_eq!(listing.extra.get("postedBy").and_then(|v| v.as_str()), Some("Owner"));

        let odd: SubListing = serde_json::from_value(serde_json::json!({"kind": "lease"})).unwrap();
        assert_eq!(odd.kind, ListingKind::Other);
    }
}
