pub mod document;
pub mod fields;
pub mod normalize;
pub mod strategy;

use chrono::NaiveDate;
use tracing::debug;

use crate::config::Source;
use crate::db::Record;
use document::Document;
use strategy::{StrategyKind, StrategySelector};

/// What one document yielded.
#[derive(Debug, Clone)]
pub struct Extraction {
    /// Strategy that produced the blocks, `None` when every strategy came up empty.
    pub strategy: Option<StrategyKind>,
    pub blocks: usize,
    pub records: Vec<Record>,
    /// `records` is the fallback set, not extracted data.
    pub fallback: bool,
}

/// Four synchronous passes: document → candidate blocks → fields → records.
///
/// Never returns an empty record list: when nothing survives, the source's
/// fallback set is substituted and `fallback` is set.
pub fn process_document(
    source: &Source,
    text: &str,
    run_date: NaiveDate,
    max_records: usize,
) -> Extraction {
    let doc = Document::parse(text, source.mode);
    let selection = StrategySelector::for_source(source).extract(&doc);
    let blocks = selection.blocks.len();

    let records: Vec<Record> = selection
        .blocks
        .into_iter()
        .filter_map(|block| {
            let fields = fields::resolve(&block.text);
            normalize::normalize(fields, block.title.as_deref(), &source.id, run_date)
        })
        .take(max_records)
        .collect();

    debug!(
        source = %source.id,
        strategy = ?selection.strategy,
        blocks,
        records = records.len(),
        "document processed"
    );

    if records.is_empty() {
        return Extraction {
            strategy: selection.strategy,
            blocks,
            records: normalize::fallback_records(source, run_date),
            fallback: true,
        };
    }

    Extraction {
        strategy: selection.strategy,
        blocks,
        records,
        fallback: false,
    }
}

// ── Tests ──
