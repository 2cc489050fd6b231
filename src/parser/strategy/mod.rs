pub mod container;
pub mod feed;
pub mod heading_run;
pub mod plain_text;

use std::fmt;
use std::sync::LazyLock;

use scraper::{ElementRef, Selector};
use serde::{Deserialize, Serialize};

use super::document::Document;
use super::fields::collapse_whitespace;
use crate::config::{Source, SourceMode};

/// Structural heuristics, declared in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    FeedItems,
    Container,
    HeadingRun,
    PlainText,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StrategyKind::FeedItems => "feed-items",
            StrategyKind::Container => "container",
            StrategyKind::HeadingRun => "heading-run",
            StrategyKind::PlainText => "plain-text",
        })
    }
}

/// One structural unit that may become a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateBlock {
    /// Structural title (heading, item title, first line), used when the
    /// text carries no name label.
    pub title: Option<String>,
    /// Body as `label: value` lines or free text.
    pub text: String,
}

pub trait Strategy: Send + Sync {
    fn kind(&self) -> StrategyKind;
    fn extract(&self, doc: &Document) -> Vec<CandidateBlock>;
}

pub struct Selection {
    pub strategy: Option<StrategyKind>,
    pub blocks: Vec<CandidateBlock>,
}

/// Ordered chain of strategies; the first one yielding a block wins.
pub struct StrategySelector {
    strategies: Vec<Box<dyn Strategy>>,
}

impl StrategySelector {
    pub fn new(strategies: Vec<Box<dyn Strategy>>) -> Self {
        Self { strategies }
    }

    pub fn for_source(source: &Source) -> Self {
        let strategies = source
            .strategies
            .iter()
            .map(|kind| -> Box<dyn Strategy> {
                match kind {
                    StrategyKind::FeedItems => Box::new(feed::FeedItems),
                    StrategyKind::Container => Box::new(container::Container::from_source(source)),
                    StrategyKind::HeadingRun => {
                        let level = match (source.heading_level, source.mode) {
                            (Some(level), _) => heading_run::Level::Fixed(level),
                            (None, SourceMode::GenericPage) => heading_run::Level::Auto,
                            (None, _) => heading_run::Level::Fixed(2),
                        };
                        Box::new(heading_run::HeadingRun::new(level))
                    }
                    StrategyKind::PlainText => {
                        Box::new(plain_text::PlainText::from_source(source))
                    }
                }
            })
            .collect();
        Self::new(strategies)
    }

    pub fn extract(&self, doc: &Document) -> Selection {
        for strategy in &self.strategies {
            let blocks = strategy.extract(doc);
            tracing::debug!(strategy = %strategy.kind(), blocks = blocks.len(), "strategy tried");
            if !blocks.is_empty() {
                return Selection {
                    strategy: Some(strategy.kind()),
                    blocks,
                };
            }
        }
        Selection {
            strategy: None,
            blocks: Vec::new(),
        }
    }
}

static SPAN: LazyLock<Selector> = LazyLock::new(|| Selector::parse("span").unwrap());

/// Text of one body element as a single line.
///
/// Paragraphs written as `<span>Label:</span><span>value</span>` become
/// `Label: value`; anything else is the element's collapsed text.
pub(crate) fn paragraph_text(el: ElementRef) -> String {
    let spans: Vec<String> = el.select(&SPAN).map(element_text).collect();
    if spans.len() >= 2 && spans[0].ends_with(':') {
        let key = spans[0].trim_end_matches(':').trim();
        let value = collapse_whitespace(&spans[1..].join(" "));
        if !key.is_empty() && !value.is_empty() {
            return format!("{}: {}", key, value);
        }
    }
    element_text(el)
}

pub(crate) fn element_text(el: ElementRef) -> String {
    collapse_whitespace(&el.text().collect::<Vec<_>>().join(" "))
}

// ── Tests ──
