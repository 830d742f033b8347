//! Extraction adapter contract + configurable adapters for embedded-script
//! HTML pages and JSON API payloads.

use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};
use rph_core::{ExtractedRecord, ListingKind, SubListing};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "rph-adapters";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    /// Request identity; becomes the record's `sourceUrl`.
    pub url: String,
    pub final_url: String,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

impl FetchedPage {
    pub fn new(
        url: impl Into<String>,
        final_url: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            final_url: final_url.into(),
            body: body.into(),
            fetched_at: Utc::now(),
        }
    }

    pub fn from_fixture(path: impl AsRef<Path>, url: &str) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let body = std::fs::read_to_string(path)
            .with_context(|| format!("reading fixture {}", path.display()))?;
        Ok(Self::new(url, url, body))
    }
}

#[derive(Debug, Error)]
pub enum EmbeddedDataError {
    #[error("invalid script selector `{0}`")]
    Selector(String),
    #[error("no script block contains `{0}`")]
    MarkerNotFound(String),
    #[error("no object literal follows `{0}`")]
    NoObject(String),
    #[error("unterminated object literal after `{0}`")]
    Unterminated(String),
    #[error("embedded data is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Embedded(#[from] EmbeddedDataError),
    #[error("payload is not valid JSON: {0}")]
    Payload(#[source] serde_json::Error),
    #[error("pointer `{0}` did not resolve")]
    MissingPointer(String),
    #[error("value at `{pointer}` is not {expected}")]
    WrongShape {
        pointer: String,
        expected: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentFormat {
    /// HTML page carrying its data as a JSON object inside a `<script>` block.
    EmbeddedScript,
    /// The response body is the JSON payload.
    JsonApi,
}

/// Key names used by a source for its listing objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubListingKeys {
    pub kind: String,
    pub title: String,
    pub url: String,
    pub price: String,
    pub size: String,
}

impl Default for SubListingKeys {
    fn default() -> Self {
        Self {
            kind: "kind".into(),
            title: "title".into(),
            url: "url".into(),
            price: "price".into(),
            size: "size".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubListingSource {
    pub pointer: String,
    /// Applied when a listing object has no kind of its own.
    #[serde(default)]
    pub kind: Option<ListingKind>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionConfig {
    pub format: DocumentFormat,
    #[serde(default = "default_script_selector")]
    pub script_selector: String,
    /// Text preceding the object literal, e.g. `window.__INITIAL_STATE__`.
    /// Without a marker the whole script text must be JSON.
    #[serde(default)]
    pub script_marker: Option<String>,
    #[serde(default)]
    pub fields_pointer: String,
    #[serde(default)]
    pub units_pointer: Option<String>,
    #[serde(default)]
    pub sub_listings: Vec<SubListingSource>,
    #[serde(default)]
    pub sub_listing_keys: SubListingKeys,
    #[serde(default)]
    pub total_pages_pointer: Option<String>,
    /// Query parameter carrying the page number in pagination links.
    #[serde(default)]
    pub page_param: Option<String>,
}

fn default_script_selector() -> String {
    "script".to_string()
}

impl ExtractionConfig {
    pub fn embedded_script(marker: impl Into<String>) -> Self {
        Self {
            format: DocumentFormat::EmbeddedScript,
            script_selector: default_script_selector(),
            script_marker: Some(marker.into()),
            fields_pointer: String::new(),
            units_pointer: None,
            sub_listings: Vec::new(),
            sub_listing_keys: SubListingKeys::default(),
            total_pages_pointer: None,
            page_param: None,
        }
    }

    pub fn json_api() -> Self {
        Self {
            format: DocumentFormat::JsonApi,
            script_marker: None,
            ..Self::embedded_script("")
        }
    }
}

/// Structured content of one document before it becomes a record.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParsedDocument {
    pub fields: JsonMap<String, JsonValue>,
    pub sub_listings: Vec<SubListing>,
    pub total_pages: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub record: ExtractedRecord,
    pub total_pages: Option<u32>,
}

/// Per-source extraction. `parse` may fail; `extract` never does.
pub trait ExtractionAdapter: Send + Sync {
    fn source_id(&self) -> &str;

    fn parse(&self, page: &FetchedPage) -> Result<ParsedDocument, AdapterError>;

    fn extract(&self, page: &FetchedPage) -> Extraction {
        match self.parse(page) {
            Ok(doc) => {
                let mut record = ExtractedRecord::parsed(
                    page.url.clone(),
                    self.source_id(),
                    doc.fields,
                    doc.sub_listings,
                );
                record.fetched_at = Some(page.fetched_at);
                Extraction {
                    record,
                    total_pages: doc.total_pages,
                }
            }
            Err(err) => {
                debug!(
                    source = self.source_id(),
                    url = %page.url,
                    error = %err,
                    "extraction failed"
                );
                let mut record =
                    ExtractedRecord::failed(page.url.clone(), self.source_id(), err.to_string());
                record.fetched_at = Some(page.fetched_at);
                Extraction {
                    record,
                    total_pages: None,
                }
            }
        }
    }
}

/// Slice out the brace-balanced object literal that follows `marker`.
/// Quotes and escapes are honoured so braces inside strings do not count.
pub fn extract_balanced_object<'a>(
    text: &'a str,
    marker: &str,
) -> Result<&'a str, EmbeddedDataError> {
    let after_marker = text
        .find(marker)
        .map(|idx| idx + marker.len())
        .ok_or_else(|| EmbeddedDataError::MarkerNotFound(marker.to_string()))?;
    let start = text[after_marker..]
        .find('{')
        .map(|idx| after_marker + idx)
        .ok_or_else(|| EmbeddedDataError::NoObject(marker.to_string()))?;

    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == q {
                quote = None;
            }
            continue;
        }
        match ch {
            '"' | '\'' => quote = Some(ch),
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Ok(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    Err(EmbeddedDataError::Unterminated(marker.to_string()))
}

/// Find the embedded JSON object in an HTML document. Anything that is not
/// strict JSON (JS literals, trailing commas, `undefined`) is rejected.
pub fn parse_embedded_json(
    html: &str,
    script_selector: &str,
    marker: Option<&str>,
) -> Result<JsonValue, EmbeddedDataError> {
    let selector = Selector::parse(script_selector)
        .map_err(|e| EmbeddedDataError::Selector(format!("{script_selector}: {e}")))?;
    let document = Html::parse_document(html);

    for script in document.select(&selector) {
        let text = script.text().collect::<String>();
        match marker {
            Some(marker) if !marker.is_empty() => {
                if text.contains(marker) {
                    let literal = extract_balanced_object(&text, marker)?;
                    return Ok(serde_json::from_str(literal)?);
                }
            }
            _ => {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    return Ok(serde_json::from_str(trimmed)?);
                }
            }
        }
    }
    Err(EmbeddedDataError::MarkerNotFound(
        marker.unwrap_or(script_selector).to_string(),
    ))
}

/// Largest `param=N` among the document's links.
pub fn total_pages_from_links(html: &str, param: &str) -> Option<u32> {
    let selector = Selector::parse("a[href]").ok()?;
    let document = Html::parse_document(html);
    let needle = format!("{param}=");
    document
        .select(&selector)
        .filter_map(|a| a.value().attr("href"))
        .filter_map(|href| page_number_in(href, &needle))
        .max()
}

fn page_number_in(href: &str, needle: &str) -> Option<u32> {
    href.match_indices(needle)
        .filter(|(idx, _)| *idx == 0 || matches!(href.as_bytes()[idx - 1], b'?' | b'&'))
        .filter_map(|(idx, _)| {
            let digits: String = href[idx + needle.len()..]
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect();
            digits.parse().ok()
        })
        .max()
}

fn resolve<'a>(value: &'a JsonValue, pointer: &str) -> Result<&'a JsonValue, AdapterError> {
    value
        .pointer(pointer)
        .ok_or_else(|| AdapterError::MissingPointer(pointer.to_string()))
}

fn page_count(value: &JsonValue) -> Option<u32> {
    match value {
        JsonValue::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn map_sub_listing(
    value: &JsonValue,
    keys: &SubListingKeys,
    default_kind: Option<ListingKind>,
    pointer: &str,
) -> Result<SubListing, AdapterError> {
    let object = value.as_object().ok_or_else(|| AdapterError::WrongShape {
        pointer: pointer.to_string(),
        expected: "an array of objects",
    })?;

    let mut extra = object.clone();
    let kind = extra
        .remove(&keys.kind)
        .and_then(|v| serde_json::from_value::<ListingKind>(v).ok())
        .or(default_kind)
        .unwrap_or_default();
    let title = match extra.remove(&keys.title) {
        Some(JsonValue::String(s)) => s,
        Some(other) if !other.is_null() => other.to_string(),
        _ => String::new(),
    };
    let url = extra
        .remove(&keys.url)
        .and_then(|v| v.as_str().map(str::to_string));
    let price = extra.remove(&keys.price).filter(|v| !v.is_null());
    let size = extra.remove(&keys.size).filter(|v| !v.is_null());

    Ok(SubListing {
        kind,
        title,
        url,
        price,
        size,
        extra,
    })
}

/// Shared pointer-driven mapping from a JSON document to fields and listings.
fn parse_data(data: &JsonValue, config: &ExtractionConfig) -> Result<ParsedDocument, AdapterError> {
    let fields_value = resolve(data, &config.fields_pointer)?;
    let mut fields = fields_value
        .as_object()
        .cloned()
        .ok_or_else(|| AdapterError::WrongShape {
            pointer: config.fields_pointer.clone(),
            expected: "an object",
        })?;

    if let Some(pointer) = &config.units_pointer {
        if let Some(units) = data.pointer(pointer) {
            fields.insert("units".to_string(), units.clone());
        }
    }

    let mut sub_listings = Vec::new();
    for source in &config.sub_listings {
        let Some(value) = data.pointer(&source.pointer) else {
            continue;
        };
        if value.is_null() {
            continue;
        }
        let items = value.as_array().ok_or_else(|| AdapterError::WrongShape {
            pointer: source.pointer.clone(),
            expected: "an array",
        })?;
        for item in items {
            let keys = &config.sub_listing_keys;
            sub_listings.push(map_sub_listing(item, keys, source.kind, &source.pointer)?);
        }
    }

    let total_pages = config
        .total_pages_pointer
        .as_deref()
        .and_then(|p| data.pointer(p))
        .and_then(page_count);

    Ok(ParsedDocument {
        fields,
        sub_listings,
        total_pages,
    })
}

#[derive(Debug, Clone)]
pub struct EmbeddedScriptAdapter {
    source_id: String,
    config: ExtractionConfig,
}

impl EmbeddedScriptAdapter {
    pub fn new(
        source_id: impl Into<String>,
        config: ExtractionConfig,
    ) -> Result<Self, AdapterError> {
        Selector::parse(&config.script_selector)
            .map_err(|e| EmbeddedDataError::Selector(format!("{}: {e}", config.script_selector)))?;
        Ok(Self {
            source_id: source_id.into(),
            config,
        })
    }
}

impl ExtractionAdapter for EmbeddedScriptAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn parse(&self, page: &FetchedPage) -> Result<ParsedDocument, AdapterError> {
        let data = parse_embedded_json(
            &page.body,
            &self.config.script_selector,
            self.config.script_marker.as_deref(),
        )?;
        let mut doc = parse_data(&data, &self.config)?;
        if doc.total_pages.is_none() {
            if let Some(param) = &self.config.page_param {
                doc.total_pages = total_pages_from_links(&page.body, param);
            }
        }
        Ok(doc)
    }
}

#[derive(Debug, Clone)]
pub struct JsonApiAdapter {
    source_id: String,
    config: ExtractionConfig,
}

impl JsonApiAdapter {
    pub fn new(source_id: impl Into<String>, config: ExtractionConfig) -> Self {
        Self {
            source_id: source_id.into(),
            config,
        }
    }
}

impl ExtractionAdapter for JsonApiAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn parse(&self, page: &FetchedPage) -> Result<ParsedDocument, AdapterError> {
        let data: JsonValue = serde_json::from_str(&page.body).map_err(AdapterError::Payload)?;
        parse_data(&data, &self.config)
    }
}

pub fn adapter_for_source(
    source_id: &str,
    config: &ExtractionConfig,
) -> Result<Box<dyn ExtractionAdapter>, AdapterError> {
    Ok(match config.format {
        DocumentFormat::EmbeddedScript => {
            Box::new(EmbeddedScriptAdapter::new(source_id, config.clone())?)
        }
        DocumentFormat::JsonApi => Box::new(JsonApiAdapter::new(source_id, config.clone())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn fixture(name: &str) -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures")
            .join(name)
    }

    fn project_page_config() -> ExtractionConfig {
        ExtractionConfig {
            fields_pointer: "/projectDetails".into(),
            units_pointer: Some("/projectDetails/unitTable".into()),
            sub_listings: vec![
                SubListingSource {
                    pointer: "/listings/sale".into(),
                    kind: Some(ListingKind::Sale),
                },
                SubListingSource {
                    pointer: "/listings/rent".into(),
                    kind: Some(ListingKind::Rent),
                },
            ],
            sub_listing_keys: SubListingKeys {
                title: "propertyTitle".into(),
                price: "priceText".into(),
                ..SubListingKeys::default()
            },
            page_param: Some("page".into()),
            ..ExtractionConfig::embedded_script("window.__INITIAL_STATE__")
        }
    }

    #[test]
    fn balanced_object_ignores_braces_inside_strings() {
        let text = r#"var x = 1; window.__DATA__ = {"a": "}{", "b": {"c": "say \"}\""}}; more()"#;
        let literal = extract_balanced_object(text, "window.__DATA__").expect("object");
        let value: JsonValue = serde_json::from_str(literal).expect("json");
        assert_eq!(value["a"], "}{");
        assert_eq!(value["b"]["c"], "say \"}\"");
    }

    #[test]
    fn javascript_literal_fails_closed() {
        let html = concat!(
            "<html><script>window.__INITIAL_STATE__ = ",
            "{name: 'Royal Meadows', price: undefined};</script></html>",
        );
        let err =
            parse_embedded_json(html, "script", Some("window.__INITIAL_STATE__")).unwrap_err();
        assert!(matches!(err, EmbeddedDataError::InvalidJson(_)));

        let adapter = EmbeddedScriptAdapter::new("site-a", project_page_config()).expect("adapter");
        let url = "https://site-a.example/p/1";
        let page = FetchedPage::new(url, url, html);
        let extraction = adapter.extract(&page);
        assert!(extraction.record.is_error());
        assert!(extraction.record.fields.is_none());
        assert!(extraction
            .record
            .error
            .as_deref()
            .is_some_and(|e| e.contains("not valid JSON")));
    }

    #[test]
    fn project_page_fixture_yields_fields_units_and_listings() {
        let url = "https://site-a.example/bangalore/whitefield/royal-meadows/npxid-r1234";
        let page =
            FetchedPage::from_fixture(fixture("site-a/royal-meadows.html"), url).expect("fixture");
        let adapter = adapter_for_source("site-a", &project_page_config()).expect("adapter");

        let extraction = adapter.extract(&page);
        let record = extraction.record;
        assert_eq!(record.error, None);
        assert_eq!(record.source_url, url);
        assert_eq!(record.field_str("name"), Some("Royal Meadows"));
        assert!(record.field("units").and_then(JsonValue::as_array).is_some());

        let listings = record.sub_listings();
        assert_eq!(listings.len(), 3);
        assert_eq!(listings[0].kind, ListingKind::Sale);
        assert_eq!(listings[0].title, "2 BHK Flat for Sale in Royal Meadows");
        assert_eq!(listings[2].kind, ListingKind::Rent);
        assert_eq!(listings[2].extra.get("postedBy").and_then(JsonValue::as_str), Some("Owner"));

        assert_eq!(extraction.total_pages, Some(4));
    }

    #[test]
    fn missing_marker_is_a_parse_error_not_a_panic() {
        let adapter = EmbeddedScriptAdapter::new("site-a", project_page_config()).expect("adapter");
        let url = "https://site-a.example/p/2";
        let page = FetchedPage::new(url, url, "<html><body>maintenance</body></html>");
        let record = adapter.extract(&page).record;
        assert_eq!(
            record.error.as_deref(),
            Some("no script block contains `window.__INITIAL_STATE__`")
        );
    }

    #[test]
    fn json_api_reads_pointers_and_page_count() {
        let config = ExtractionConfig {
            fields_pointer: "/meta".into(),
            sub_listings: vec![SubListingSource {
                pointer: "/data/projects".into(),
                kind: Some(ListingKind::Project),
            }],
            total_pages_pointer: Some("/meta/totalPages".into()),
            ..ExtractionConfig::json_api()
        };
        let adapter = adapter_for_source("site-b", &config).expect("adapter");
        let url = "https://site-b.example/api/projects?city=bangalore&page=1";
        let page = FetchedPage::from_fixture(fixture("site-b/projects-page-1.json"), url)
            .expect("fixture");

        let extraction = adapter.extract(&page);
        assert_eq!(extraction.record.error, None);
        assert_eq!(extraction.total_pages, Some(3));
        let urls: Vec<_> = extraction
            .record
            .sub_listings()
            .iter()
            .filter_map(|l| l.url.as_deref())
            .collect();
        assert_eq!(
            urls,
            vec![
                "https://site-b.example/royal-meadows-phase1-bangalore",
                "https://site-b.example/royal-gardens-bangalore",
            ]
        );
    }

    #[test]
    fn pagination_links_pick_the_largest_page() {
        let html = concat!(
            r#"<a href="?page=2">2</a><a href="/list?city=x&page=12">12</a>"#,
            r#"<a href="/list?subpage=99">x</a>"#,
        );
        assert_eq!(total_pages_from_links(html, "page"), Some(12));
        assert_eq!(total_pages_from_links("<p>no links</p>", "page"), None);
    }
}
