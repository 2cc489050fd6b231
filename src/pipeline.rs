use std::fmt;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use indicatif::ProgressBar;
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tracing::{error, info, warn};

use crate::cache::RecentCache;
use crate::config::{Settings, Source};
use crate::db::{Record, RecordKind, Store};
use crate::dedupe::Deduplicator;
use crate::error::IngestError;
use crate::fetcher::Fetcher;
use crate::parser::strategy::StrategyKind;
use crate::parser::{self, Extraction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    Ok,
    /// Nothing extractable; the fallback set was emitted and not stored.
    Fallback,
    /// Extracted, but some store writes failed. Rows written before the
    /// failure stay.
    Partial,
    Failed,
}

impl fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SourceStatus::Ok => "ok",
            SourceStatus::Fallback => "fallback",
            SourceStatus::Partial => "partial",
            SourceStatus::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub source: String,
    pub kind: RecordKind,
    pub status: SourceStatus,
    pub http_status: Option<u16>,
    pub from_snapshot: bool,
    pub encoding: Option<&'static str>,
    pub strategy: Option<StrategyKind>,
    /// Records extracted, before run-wide dedupe.
    pub extracted: usize,
    pub inserted: usize,
    pub error: Option<String>,
    /// Records this source contributed to the run output: extracted records
    /// after dedupe, or the fallback set.
    pub records: Vec<Record>,
}

impl SourceReport {
    fn failed(source: &Source, message: String) -> Self {
        Self {
            source: source.id.clone(),
            kind: source.kind,
            status: SourceStatus::Failed,
            http_status: None,
            from_snapshot: false,
            encoding: None,
            strategy: None,
            extracted: 0,
            inserted: 0,
            error: Some(message),
            records: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub run_date: NaiveDate,
    pub force_refresh: bool,
    /// One per configured source, in configuration order.
    pub reports: Vec<SourceReport>,
}

impl CycleSummary {
    pub fn total_extracted(&self) -> usize {
        self.reports.iter().map(|r| r.extracted).sum()
    }

    pub fn total_inserted(&self) -> usize {
        self.reports.iter().map(|r| r.inserted).sum()
    }

    pub fn failed(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| r.status == SourceStatus::Failed)
            .count()
    }

    pub fn partial(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| r.status == SourceStatus::Partial)
            .count()
    }

    /// Every configured source failed, so the store shows stale data only.
    pub fn all_failed(&self) -> bool {
        !self.reports.is_empty() && self.failed() == self.reports.len()
    }
}

/// One source's fetch and extraction result, sent to the writer loop.
struct SourceOutcome {
    index: usize,
    http_status: Option<u16>,
    from_snapshot: bool,
    encoding: Option<&'static str>,
    result: Result<Extraction, IngestError>,
}

/// The single ingestion entry point shared by manual and scheduled triggers.
/// Cheap to share behind an `Arc`; overlapping cycles are safe because store
/// writes are idempotent.
pub struct Pipeline {
    sources: Arc<Vec<Source>>,
    fetcher: Arc<Fetcher>,
    store: Arc<Store>,
    cache: Arc<RecentCache>,
    concurrency: usize,
    max_records: usize,
}

impl Pipeline {
    pub fn new(settings: &Settings, store: Arc<Store>, cache: Arc<RecentCache>) -> Result<Self, IngestError> {
        Ok(Self::with_parts(
            settings.sources()?,
            Fetcher::from_settings(settings)?,
            store,
            cache,
            settings.concurrency,
            settings.max_records_per_source,
        ))
    }

    pub fn with_parts(
        sources: Vec<Source>,
        fetcher: Fetcher,
        store: Arc<Store>,
        cache: Arc<RecentCache>,
        concurrency: usize,
        max_records: usize,
    ) -> Self {
        Self {
            sources: Arc::new(sources),
            fetcher: Arc::new(fetcher),
            store,
            cache,
            concurrency: concurrency.max(1),
            max_records,
        }
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    #[cfg(test)]
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<RecentCache> {
        &self.cache
    }

    pub async fn run_cycle(&self, force_refresh: bool, pb: &ProgressBar) -> CycleSummary {
        self.run_cycle_on(Utc::now().date_naive(), force_refresh, pb).await
    }

    /// Fetch and extract every source concurrently, then persist from one
    /// writer loop as results arrive.
    pub async fn run_cycle_on(&self, run_date: NaiveDate, force_refresh: bool, pb: &ProgressBar) -> CycleSummary {
        self.cache.invalidate();
        info!(sources = self.sources.len(), force_refresh, %run_date, "ingestion cycle started");
        pb.set_length(self.sources.len() as u64);

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        // Workers send outcomes, the loop below is the only writer.
        let (tx, mut rx) = mpsc::channel::<SourceOutcome>(self.concurrency * 2);

        for index in 0..self.sources.len() {
            let sources = Arc::clone(&self.sources);
            let fetcher = Arc::clone(&self.fetcher);
            let sem = Arc::clone(&semaphore);
            let tx = tx.clone();
            let max_records = self.max_records;

            tokio::spawn(async move {
                let Ok(_permit) = sem.acquire_owned().await else {
                    return;
                };
                let source = &sources[index];
                let outcome = match fetcher.fetch(source, force_refresh).await {
                    Ok(raw) => SourceOutcome {
                        index,
                        http_status: raw.status,
                        from_snapshot: raw.from_snapshot,
                        encoding: Some(raw.encoding),
                        result: Ok(parser::process_document(source, &raw.text, run_date, max_records)),
                    },
                    Err(e) => SourceOutcome {
                        index,
                        http_status: e.status(),
                        from_snapshot: false,
                        encoding: None,
                        result: Err(e),
                    },
                };
                let _ = tx.send(outcome).await;
            });
        }

        // Drop our copy of tx so rx closes when all spawned tasks finish
        drop(tx);

        let mut dedupe = Deduplicator::new();
        let mut reports: Vec<Option<SourceReport>> = vec![None; self.sources.len()];
        while let Some(outcome) = rx.recv().await {
            let index = outcome.index;
            reports[index] = Some(self.persist(outcome, &mut dedupe));
            pb.inc(1);
        }

        let reports: Vec<SourceReport> = reports
            .into_iter()
            .zip(self.sources.iter())
            .map(|(report, source)| {
                report.unwrap_or_else(|| {
                    error!(source = %source.id, "worker ended without a result");
                    SourceReport::failed(source, "worker ended without a result".into())
                })
            })
            .collect();

        self.cache.invalidate();

        let summary = CycleSummary {
            run_date,
            force_refresh,
            reports,
        };
        if summary.all_failed() {
            error!(sources = summary.reports.len(), "every source failed this cycle");
        }
        info!(
            extracted = summary.total_extracted(),
            inserted = summary.total_inserted(),
            failed = summary.failed(),
            partial = summary.partial(),
            "ingestion cycle finished"
        );
        summary
    }

    fn persist(&self, outcome: SourceOutcome, dedupe: &mut Deduplicator) -> SourceReport {
        let source = &self.sources[outcome.index];
        let extraction = match outcome.result {
            Ok(extraction) => extraction,
            Err(e) => {
                error!(source = %source.id, status = ?outcome.http_status, error = %e, "source failed");
                let mut report = SourceReport::failed(source, e.to_string());
                report.http_status = outcome.http_status;
                return report;
            }
        };

        let mut report = SourceReport {
            source: source.id.clone(),
            kind: source.kind,
            status: SourceStatus::Ok,
            http_status: outcome.http_status,
            from_snapshot: outcome.from_snapshot,
            encoding: outcome.encoding,
            strategy: extraction.strategy,
            extracted: 0,
            inserted: 0,
            error: None,
            records: Vec::new(),
        };

        if extraction.fallback {
            warn!(
                source = %source.id,
                strategy = ?extraction.strategy,
                blocks = extraction.blocks,
                "no extractable records, emitting fallback set"
            );
            report.status = SourceStatus::Fallback;
            report.records = extraction.records;
            return report;
        }

        report.extracted = extraction.records.len();
        let records = dedupe.dedupe(source.kind, extraction.records);

        // Each insert stands alone; earlier rows stay if a later one fails.
        let mut failures = 0usize;
        for record in &records {
            match self.store.upsert_if_absent(source.kind, record) {
                Ok(true) => report.inserted += 1,
                Ok(false) => {}
                Err(e) => {
                    failures += 1;
                    warn!(source = %source.id, name = %record.name, error = %e, "insert failed");
                    report.error = Some(e.to_string());
                }
            }
        }
        if failures > 0 {
            error!(source = %source.id, failures, "store writes failed");
            report.status = SourceStatus::Partial;
        }

        info!(
            source = %source.id,
            strategy = ?report.strategy,
            records = report.extracted,
            inserted = report.inserted,
            "source ingested"
        );
        report.records = records;
        report
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use super::*;
    use crate::config::SourceMode;
    use crate::db::IdentityKey;
    use crate::parser::normalize::FALLBACK_NAME;

    fn fixture(name: &str) -> String {
        let path = format!("{}/tests/fixtures/{}", env!("CARGO_MANIFEST_DIR"), name);
        std::fs::read_to_string(path).unwrap()
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
    }

    fn snapshot_source(dir: &Path, id: &str, fixture_name: Option<&str>) -> Source {
        let path: PathBuf = dir.join(format!("{}.html", id));
        if let Some(name) = fixture_name {
            std::fs::write(&path, fixture(name)).unwrap();
        }
        Source::snapshot_only(id, path, SourceMode::StructuredDocument)
    }

    fn pipeline(sources: Vec<Source>, identity: IdentityKey) -> Pipeline {
        let fetcher = Fetcher::new("test-agent", Duration::from_secs(5), 1, Duration::from_millis(1)).unwrap();
        Pipeline::with_parts(
            sources,
            fetcher,
            Arc::new(Store::open_in_memory(identity).unwrap()),
            Arc::new(RecentCache::new(Duration::from_secs(60))),
            4,
            200,
        )
    }

    #[tokio::test]
    async fn second_run_inserts_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(
            vec![snapshot_source(dir.path(), "docs", Some("two_headings.html"))],
            IdentityKey::Daily,
        );
        let pb = ProgressBar::hidden();

        let first = p.run_cycle_on(day(), false, &pb).await;
        assert_eq!(first.total_inserted(), 2);
        assert_eq!(first.reports[0].status, SourceStatus::Ok);
        assert_eq!(first.reports[0].strategy, Some(StrategyKind::HeadingRun));

        let second = p.run_cycle_on(day(), true, &pb).await;
        assert_eq!(second.total_extracted(), 2);
        assert_eq!(second.total_inserted(), 0);
        assert_eq!(p.store().count(RecordKind::Releases).unwrap(), 2);
    }

    #[tokio::test]
    async fn failing_source_is_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(
            vec![
                snapshot_source(dir.path(), "missing", None),
                snapshot_source(dir.path(), "docs", Some("structured_document.html")),
            ],
            IdentityKey::Daily,
        );
        let summary = p.run_cycle_on(day(), false, &ProgressBar::hidden()).await;

        assert_eq!(summary.reports[0].source, "missing");
        assert_eq!(summary.reports[0].status, SourceStatus::Failed);
        assert!(summary.reports[0].error.as_deref().unwrap().contains("no snapshot"));
        assert_eq!(summary.reports[1].status, SourceStatus::Ok);
        assert_eq!(summary.reports[1].inserted, 3);
        assert_eq!(summary.failed(), 1);
        assert!(!summary.all_failed());
    }

    #[tokio::test]
    async fn all_failed_when_every_source_fails() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(
            vec![
                snapshot_source(dir.path(), "a", None),
                snapshot_source(dir.path(), "b", None),
            ],
            IdentityKey::Daily,
        );
        let summary = p.run_cycle_on(day(), false, &ProgressBar::hidden()).await;
        assert!(summary.all_failed());
        assert_eq!(summary.total_inserted(), 0);
    }

    #[tokio::test]
    async fn fallback_is_reported_not_stored() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(
            vec![snapshot_source(dir.path(), "maintenance", Some("no_structure.html"))],
            IdentityKey::Daily,
        );
        let summary = p.run_cycle_on(day(), false, &ProgressBar::hidden()).await;
        let report = &summary.reports[0];
        assert_eq!(report.status, SourceStatus::Fallback);
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.records[0].name, FALLBACK_NAME);
        assert_eq!(report.inserted, 0);
        assert_eq!(p.store().count(RecordKind::Releases).unwrap(), 0);
    }

    #[tokio::test]
    async fn duplicates_across_sources_collapse() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(
            vec![
                snapshot_source(dir.path(), "mirror-a", Some("structured_document.html")),
                snapshot_source(dir.path(), "mirror-b", Some("structured_document.html")),
            ],
            IdentityKey::Latest,
        );
        let summary = p.run_cycle_on(day(), false, &ProgressBar::hidden()).await;
        // "Ashfall Online" carries its own attribution and appears once;
        // the other two are attributed to each mirror.
        assert_eq!(summary.total_extracted(), 6);
        assert_eq!(summary.total_inserted(), 5);
        assert_eq!(p.store().count(RecordKind::Releases).unwrap(), 5);
    }

    #[tokio::test]
    async fn cycle_invalidates_read_cache() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(
            vec![snapshot_source(dir.path(), "docs", Some("two_headings.html"))],
            IdentityKey::Daily,
        );
        let before = p.cache().list_recent(p.store(), RecordKind::Releases, 10).unwrap();
        assert!(before.is_empty());

        p.run_cycle_on(day(), false, &ProgressBar::hidden()).await;
        assert_eq!(p.cache().len(), 0);
        let after = p.cache().list_recent(p.store(), RecordKind::Releases, 10).unwrap();
        assert_eq!(after.len(), 2);
    }

    #[tokio::test]
    async fn write_failure_keeps_earlier_rows() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(
            vec![snapshot_source(dir.path(), "docs", Some("structured_document.html"))],
            IdentityKey::Daily,
        );
        p.store()
            .execute_batch(
                "CREATE TRIGGER reject_tides BEFORE INSERT ON releases
                 WHEN NEW.name = 'Tides of Arden'
                 BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
            )
            .unwrap();

        let summary = p.run_cycle_on(day(), false, &ProgressBar::hidden()).await;
        let report = &summary.reports[0];
        assert_eq!(report.status, SourceStatus::Partial);
        assert_eq!(report.extracted, 3);
        assert_eq!(report.inserted, 2);
        assert!(report.error.as_deref().unwrap().contains("disk full"));
        assert_eq!(summary.partial(), 1);
        assert!(!summary.all_failed());

        let names: Vec<String> = p
            .store()
            .export_all(RecordKind::Releases)
            .unwrap()
            .into_iter()
            .map(|r| r.record.name)
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"Ashfall Online".to_string()));
        assert!(names.contains(&"Starfall Tactics".to_string()));
    }

    #[tokio::test]
    async fn overlapping_cycles_stay_consistent() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(
            vec![snapshot_source(dir.path(), "docs", Some("structured_document.html"))],
            IdentityKey::Daily,
        );
        let pb = ProgressBar::hidden();
        let (a, b) = tokio::join!(p.run_cycle_on(day(), false, &pb), p.run_cycle_on(day(), true, &pb));
        assert_eq!(a.total_inserted() + b.total_inserted(), 3);
        assert_eq!(p.store().count(RecordKind::Releases).unwrap(), 3);
    }
}
