use scraper::Selector;
use tracing::warn;

use super::{element_text, paragraph_text, CandidateBlock, Strategy, StrategyKind};
use crate::config::Source;
use crate::parser::document::Document;

const DEFAULT_CONTAINER: &str = "article, .game, .item, [role=article]";
const DEFAULT_TITLE: &str = "h1, h2, h3, h4, .title";
const DEFAULT_BODY: &str = "p, li, .field";

/// Explicit item containers: one block per container, title and body read
/// from elements beneath it.
pub struct Container {
    container: Selector,
    title: Selector,
    body: Selector,
}

impl Container {
    pub fn new(container: &str, title: &str, body: &str) -> Self {
        Self {
            container: parse_or(container, DEFAULT_CONTAINER),
            title: parse_or(title, DEFAULT_TITLE),
            body: parse_or(body, DEFAULT_BODY),
        }
    }

    pub fn from_source(source: &Source) -> Self {
        Self::new(
            source.container_selector.as_deref().unwrap_or(DEFAULT_CONTAINER),
            source.title_selector.as_deref().unwrap_or(DEFAULT_TITLE),
            source.body_selector.as_deref().unwrap_or(DEFAULT_BODY),
        )
    }
}

impl Default for Container {
    fn default() -> Self {
        Self::new(DEFAULT_CONTAINER, DEFAULT_TITLE, DEFAULT_BODY)
    }
}

fn parse_or(css: &str, default: &str) -> Selector {
    Selector::parse(css).unwrap_or_else(|e| {
        warn!(selector = css, error = %e, "invalid selector, using default");
        // Defaults are constant and valid.
        Selector::parse(default).unwrap()
    })
}

impl Strategy for Container {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Container
    }

    fn extract(&self, doc: &Document) -> Vec<CandidateBlock> {
        let Some(html) = &doc.html else {
            return Vec::new();
        };

        let mut blocks = Vec::new();
        for item in html.select(&self.container) {
            let title = item
                .select(&self.title)
                .map(element_text)
                .find(|t| !t.is_empty());
            let lines: Vec<String> = item
                .select(&self.body)
                .map(paragraph_text)
                .filter(|t| !t.is_empty())
                .collect();
            if title.is_none() && lines.is_empty() {
                continue;
            }
            blocks.push(CandidateBlock {
                title,
                text: lines.join("\n"),
            });
        }
        blocks
    }
}
