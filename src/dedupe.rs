use std::collections::HashSet;

use crate::db::{Record, RecordKind};

/// Run-scoped duplicate filter over `(name, attribution)`, first occurrence
/// wins. Fed incrementally by the writer loop as source results arrive, so it
/// spans every source of one cycle. Cross-run suppression is the store's job.
#[derive(Debug, Default)]
pub struct Deduplicator {
    seen: HashSet<(RecordKind, String, String)>,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the record is the first of its identity in this run.
    pub fn admit(&mut self, kind: RecordKind, record: &Record) -> bool {
        self.seen
            .insert((kind, record.name.clone(), record.attribution.clone()))
    }

    /// Keep the first record of each identity, in encounter order.
    pub fn dedupe(&mut self, kind: RecordKind, records: Vec<Record>) -> Vec<Record> {
        records
            .into_iter()
            .filter(|r| self.admit(kind, r))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn record(name: &str, attribution: &str, release: &str) -> Record {
        Record {
            name: name.into(),
            release: release.into(),
            category: "Unknown".into(),
            summary: "No desc.".into(),
            attribution: attribution.into(),
            fetched_on: NaiveDate::from_ymd_opt(2026, 10, 19).unwrap(),
        }
    }

    #[test]
    fn first_occurrence_kept_in_order() {
        let mut d = Deduplicator::new();
        let out = d.dedupe(
            RecordKind::Releases,
            vec![
                record("A", "x", "2026"),
                record("B", "x", "2026"),
                record("A", "x", "2027"),
                record("A", "y", "2026"),
            ],
        );
        let keys: Vec<(&str, &str, &str)> = out
            .iter()
            .map(|r| (r.name.as_str(), r.attribution.as_str(), r.release.as_str()))
            .collect();
        assert_eq!(keys, vec![("A", "x", "2026"), ("B", "x", "2026"), ("A", "y", "2026")]);
    }

    #[test]
    fn state_spans_batches() {
        let mut d = Deduplicator::new();
        assert_eq!(d.dedupe(RecordKind::News, vec![record("A", "x", "1")]).len(), 1);
        assert!(d.dedupe(RecordKind::News, vec![record("A", "x", "2")]).is_empty());
        assert!(!d.admit(RecordKind::News, &record("A", "x", "3")));
    }

    #[test]
    fn kinds_are_separate() {
        let mut d = Deduplicator::new();
        assert!(d.admit(RecordKind::Releases, &record("A", "x", "1")));
        assert!(d.admit(RecordKind::News, &record("A", "x", "1")));
    }
}
