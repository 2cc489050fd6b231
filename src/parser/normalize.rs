use chrono::NaiveDate;

use super::fields::{collapse_whitespace, Fields};
use crate::config::{FallbackEntry, Source};
use crate::db::{Record, NO_DESC, TBD, UNKNOWN};

pub const FALLBACK_NAME: &str = "No entries found";

fn or_sentinel(value: Option<String>, sentinel: &str) -> String {
    let sentinel = if sentinel.trim().is_empty() { UNKNOWN } else { sentinel };
    value
        .map(|v| collapse_whitespace(&v))
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| sentinel.to_string())
}

/// Turn resolved fields into a record. The name comes from the `name` label,
/// else the structural title; with neither the block is rejected.
///
/// Summaries arrive already bounded from the resolver.
pub fn normalize(
    fields: Fields,
    fallback_title: Option<&str>,
    source_id: &str,
    run_date: NaiveDate,
) -> Option<Record> {
    let name = fields
        .name
        .as_deref()
        .map(collapse_whitespace)
        .filter(|n| !n.is_empty())
        .or_else(|| {
            fallback_title
                .map(collapse_whitespace)
                .filter(|n| !n.is_empty())
        })?;

    Some(Record {
        name,
        release: or_sentinel(fields.release, TBD),
        category: or_sentinel(fields.category, UNKNOWN),
        summary: or_sentinel(fields.summary, NO_DESC),
        attribution: or_sentinel(fields.attribution, source_id),
        fetched_on: run_date,
    })
}

/// Records emitted when no strategy finds anything, so the output is never
/// silently empty. Sources may configure their own; entries with blank
/// names are skipped and the built-in record is used if none remain.
pub fn fallback_records(source: &Source, run_date: NaiveDate) -> Vec<Record> {
    let configured: Vec<Record> = source
        .fallback
        .iter()
        .filter_map(|entry| from_entry(entry, &source.id, run_date))
        .collect();
    if !configured.is_empty() {
        return configured;
    }

    vec![Record {
        name: FALLBACK_NAME.to_string(),
        release: TBD.to_string(),
        category: UNKNOWN.to_string(),
        summary: format!("No extractable records in {}.", source.id),
        attribution: source.id.clone(),
        fetched_on: run_date,
    }]
}

fn from_entry(entry: &FallbackEntry, source_id: &str, run_date: NaiveDate) -> Option<Record> {
    let fields = Fields {
        name: Some(entry.name.clone()),
        release: entry.release.clone(),
        category: entry.category.clone(),
        summary: entry
            .summary
            .as_deref()
            .map(super::fields::truncate_summary),
        attribution: entry.attribution.clone(),
    };
    normalize(fields, None, source_id, run_date)
}
