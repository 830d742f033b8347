//! Per-unit price and rent statistics over a reconciled project.

use std::collections::BTreeMap;

use rph_core::{
    AggregatedProject, ListingCounts, ListingKind, ReconciledRecord, SubListing, UnitSpec, UnitStat,
};
use serde_json::Value as JsonValue;
use tracing::debug;

/// Parse a published price: plain numbers, or text such as `1.21 Cr`,
/// `99 L`, `85 Lac`, `45 K`, `₹ 1,20,000`. Only the first amount counts.
pub fn parse_price(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64().filter(|v| *v > 0.0),
        JsonValue::String(s) => parse_price_text(s),
        _ => None,
    }
}

fn unit_multiplier(word: &str) -> Option<f64> {
    match word {
        "cr" | "crore" | "crores" => Some(1e7),
        "l" | "lac" | "lacs" | "lakh" | "lakhs" => Some(1e5),
        "k" => Some(1e3),
        _ => None,
    }
}

fn parse_price_text(text: &str) -> Option<f64> {
    let lower = text.to_lowercase();
    let start = lower.find(|c: char| c.is_ascii_digit())?;
    let rest = &lower[start..];

    let number_len = rest
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == ','))
        .unwrap_or(rest.len());
    let amount: f64 = rest[..number_len].replace(',', "").parse().ok()?;

    // Ranges ("1.2 - 1.5 Cr") carry the unit after the upper bound only.
    let multiplier = rest[number_len..]
        .split(|c: char| !c.is_ascii_alphabetic())
        .find_map(unit_multiplier)
        .unwrap_or(1.0);

    let price = (amount * multiplier).round();
    (price > 0.0).then_some(price)
}

/// Unit table of a record (`fields.units`). Rows that do not parse are
/// skipped; a missing bedroom count is read from the unit type when it
/// starts with a number ("3 BHK Apartment").
pub fn unit_table(fields: Option<&serde_json::Map<String, JsonValue>>) -> Vec<UnitSpec> {
    let Some(rows) = fields.and_then(|f| f.get("units")).and_then(JsonValue::as_array) else {
        return Vec::new();
    };
    rows.iter()
        .filter_map(|row| serde_json::from_value::<UnitSpec>(row.clone()).ok())
        .map(|mut unit| {
            if unit.bedrooms.is_none() {
                unit.bedrooms = leading_number(&unit.unit_type);
            }
            unit
        })
        .collect()
}

fn leading_number(text: &str) -> Option<u32> {
    let digits: String = text
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// True when the title carries `bedrooms` as its own number token, e.g.
/// "2 BHK" or "2BHK" for 2, but not "12 BHK".
pub fn title_has_bedrooms(title: &str, bedrooms: u32) -> bool {
    let wanted = bedrooms.to_string();
    title
        .split(|c: char| !c.is_alphanumeric())
        .map(|token| token.trim_end_matches(|c: char| c.is_alphabetic()))
        .any(|digits| digits == wanted)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[derive(Debug, Default)]
struct Side {
    min: Option<f64>,
    max: Option<f64>,
    avg: Option<f64>,
    count: usize,
}

fn side_stats<'a>(listings: impl Iterator<Item = &'a SubListing>) -> Side {
    let prices: Vec<f64> = listings
        .filter_map(|l| l.price.as_ref().and_then(parse_price))
        .collect();
    if prices.is_empty() {
        return Side::default();
    }
    let min = prices.iter().copied().fold(f64::INFINITY, f64::min);
    let max = prices.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let avg = (prices.iter().sum::<f64>() / prices.len() as f64).round();
    Side {
        min: Some(min),
        max: Some(max),
        avg: Some(avg),
        count: prices.len(),
    }
}

fn per_area(avg: Option<f64>, area: Option<f64>) -> Option<f64> {
    match (avg, area) {
        (Some(avg), Some(area)) if avg != 0.0 && area != 0.0 => Some(round2(avg / area)),
        _ => None,
    }
}

/// Statistics for every unit in the truth record's unit table, pooled across
/// all sources' sale and rent listings.
pub fn aggregate(record: &ReconciledRecord) -> Vec<UnitStat> {
    let units = unit_table(record.truth_record().and_then(|r| r.fields.as_ref()));
    let listings: Vec<&SubListing> = record
        .per_source_records
        .values()
        .flat_map(|r| r.sub_listings())
        .collect();
    let of_kind = |kind: ListingKind| {
        listings
            .iter()
            .copied()
            .filter(|l| l.kind == kind)
            .collect::<Vec<_>>()
    };
    let sale = of_kind(ListingKind::Sale);
    let rent = of_kind(ListingKind::Rent);

    units
        .into_iter()
        .map(|unit| {
            // A unit without a bedroom count is coarse: it takes every listing.
            let select = |pool: &[&SubListing]| -> Side {
                match unit.bedrooms {
                    Some(bedrooms) => side_stats(
                        pool.iter()
                            .copied()
                            .filter(|l| title_has_bedrooms(&l.title, bedrooms)),
                    ),
                    None => side_stats(pool.iter().copied()),
                }
            };
            let sale_side = select(sale.as_slice());
            let rent_side = select(rent.as_slice());
            debug!(
                canonical_key = %record.canonical_key,
                unit = %unit.unit_type,
                sale = sale_side.count,
                rent = rent_side.count,
                "aggregated unit"
            );

            UnitStat {
                price_per_carpet: per_area(sale_side.avg, unit.carpet_area),
                price_per_gross: per_area(sale_side.avg, unit.gross_area),
                rent_per_carpet: per_area(rent_side.avg, unit.carpet_area),
                rent_per_gross: per_area(rent_side.avg, unit.gross_area),
                unit_type: unit.unit_type,
                bedrooms: unit.bedrooms,
                price_min: sale_side.min,
                price_max: sale_side.max,
                price_avg: sale_side.avg,
                rent_min: rent_side.min,
                rent_max: rent_side.max,
                rent_avg: rent_side.avg,
                listing_counts: ListingCounts {
                    sale: sale_side.count,
                    rent: rent_side.count,
                },
            }
        })
        .collect()
}

/// Output line for one reconciled project.
pub fn aggregate_project(record: &ReconciledRecord) -> anyhow::Result<AggregatedProject> {
    let mut per_source = BTreeMap::new();
    for (source, extracted) in &record.per_source_records {
        per_source.insert(source.clone(), serde_json::to_value(extracted)?);
    }
    Ok(AggregatedProject {
        canonical_key: record.canonical_key.clone(),
        per_source,
        unit_stats: aggregate(record),
        unmatched_sources: record.unmatched_sources.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rph_core::ExtractedRecord;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn listing(kind: ListingKind, title: &str, price: JsonValue) -> SubListing {
        SubListing {
            kind,
            title: title.into(),
            price: Some(price),
            ..SubListing::default()
        }
    }

    fn candidate(source: &str, listings: Vec<SubListing>) -> ExtractedRecord {
        let url = format!("https://{source}.example/rm");
        ExtractedRecord::parsed(url, source, Default::default(), listings)
    }

    fn project(
        units: JsonValue,
        site_b: Vec<SubListing>,
        site_c: Vec<SubListing>,
    ) -> ReconciledRecord {
        let truth = ExtractedRecord::parsed(
            "https://site-a.example/p/royal-meadows",
            "site-a",
            json!({ "name": "Royal Meadows", "units": units })
                .as_object()
                .cloned()
                .expect("object"),
            vec![],
        );
        ReconciledRecord {
            canonical_key: "https://site-a.example/p/royal-meadows".into(),
            truth_source: "site-a".into(),
            per_source_records: BTreeMap::from([
                ("site-a".to_string(), truth),
                ("site-b".to_string(), candidate("site-b", site_b)),
                ("site-c".to_string(), candidate("site-c", site_c)),
            ]),
            matched_urls: BTreeMap::new(),
            unmatched_sources: BTreeSet::new(),
        }
    }

    #[test]
    fn parses_indian_price_notation() {
        assert_eq!(parse_price(&json!("1.21 Cr")), Some(12_100_000.0));
        assert_eq!(parse_price(&json!("99 L")), Some(9_900_000.0));
        assert_eq!(parse_price(&json!("85 Lac")), Some(8_500_000.0));
        assert_eq!(parse_price(&json!("45 K")), Some(45_000.0));
        assert_eq!(parse_price(&json!("₹ 1,20,000")), Some(120_000.0));
        assert_eq!(parse_price(&json!("45,000/month")), Some(45_000.0));
        assert_eq!(parse_price(&json!("1.2 - 1.5 Cr")), Some(12_000_000.0));
        assert_eq!(parse_price(&json!("85 - 99 Lakhs onwards")), Some(8_500_000.0));
        assert_eq!(parse_price(&json!(7_500_000)), Some(7_500_000.0));
        assert_eq!(parse_price(&json!("Price on request")), None);
        assert_eq!(parse_price(&JsonValue::Null), None);
    }

    #[test]
    fn bedroom_token_must_stand_alone() {
        assert!(title_has_bedrooms("2 BHK Flat for Sale", 2));
        assert!(title_has_bedrooms("Spacious 2BHK apartment", 2));
        assert!(!title_has_bedrooms("12 BHK Villa", 2));
        assert!(!title_has_bedrooms("3 BHK Flat", 2));
    }

    #[test]
    fn unit_stats_pool_sources_and_filter_by_bedrooms() {
        let record = project(
            json!([
                {
                    "unitType": "2 BHK Apartment",
                    "bedrooms": 2,
                    "grossArea": 1210.0,
                    "carpetArea": 890.0
                },
                {"unitType": "3 BHK Apartment", "grossArea": 1650.0, "carpetArea": null}
            ]),
            vec![
                listing(ListingKind::Sale, "2 BHK Flat", json!("1.2 Cr")),
                listing(ListingKind::Sale, "3 BHK Flat", json!("1.65 Cr")),
                listing(ListingKind::Rent, "2 BHK Flat", json!("40 K")),
            ],
            vec![
                listing(ListingKind::Sale, "2 BHK Flat", json!("1.1 Cr")),
                listing(ListingKind::Rent, "2 BHK Flat", json!("50,000")),
                listing(ListingKind::Sale, "2 BHK Flat", json!("on request")),
            ],
        );

        let stats = aggregate(&record);
        assert_eq!(stats.len(), 2);

        let two = &stats[0];
        assert_eq!(two.bedrooms, Some(2));
        assert_eq!(two.price_min, Some(11_000_000.0));
        assert_eq!(two.price_max, Some(12_000_000.0));
        assert_eq!(two.price_avg, Some(11_500_000.0));
        assert_eq!(two.rent_avg, Some(45_000.0));
        assert_eq!(two.price_per_carpet, Some(12921.35));
        assert_eq!(two.price_per_gross, Some(9504.13));
        assert_eq!(two.listing_counts, ListingCounts { sale: 2, rent: 2 });

        let three = &stats[1];
        assert_eq!(three.bedrooms, Some(3));
        assert_eq!(three.price_avg, Some(16_500_000.0));
        assert_eq!(three.price_per_carpet, None);
        assert_eq!(three.rent_avg, None);
        assert_eq!(three.rent_per_gross, None);
    }

    #[test]
    fn coarse_unit_falls_back_to_all_listings() {
        let record = project(
            json!([{"unitType": "Plot", "grossArea": 0.0}]),
            vec![
                listing(ListingKind::Sale, "Residential plot", json!("50 L")),
                listing(ListingKind::Sale, "Corner plot", json!("70 L")),
            ],
            vec![],
        );
        let stats = aggregate(&record);
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].price_avg, Some(6_000_000.0));
        assert_eq!(stats[0].listing_counts.sale, 2);
        assert_eq!(stats[0].price_per_gross, None);
    }

    #[test]
    fn aggregated_project_serializes_output_schema() {
        let record = project(json!([]), vec![], vec![]);
        let project = aggregate_project(&record).expect("project");
        let value = serde_json::to_value(project).expect("json");
        assert_eq!(value["canonicalKey"], "https://site-a.example/p/royal-meadows");
        assert!(value["perSource"]["site-b"].is_object());
        assert!(value["unitStats"].as_array().is_some_and(|a| a.is_empty()));
    }
}
