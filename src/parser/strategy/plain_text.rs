use std::sync::LazyLock;

use regex::Regex;

use super::{CandidateBlock, Strategy, StrategyKind};
use crate::config::Source;
use crate::parser::document::Document;

static DEFAULT_PREAMBLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)Neueste Online-PC-Spiele[^#]*").unwrap());
const DEFAULT_DELIMITER: &str = "##";

/// Last resort: the document as text, boilerplate preamble removed, split on
/// a section marker at the start of a line. Text before the first marker is
/// not an item.
pub struct PlainText {
    preamble: Regex,
    delimiter: String,
}

impl PlainText {
    pub fn new(preamble: Regex, delimiter: impl Into<String>) -> Self {
        Self {
            preamble,
            delimiter: delimiter.into(),
        }
    }

    pub fn from_source(source: &Source) -> Self {
        Self::new(
            source
                .preamble
                .clone()
                .unwrap_or_else(|| DEFAULT_PREAMBLE.clone()),
            source.delimiter.as_deref().unwrap_or(DEFAULT_DELIMITER),
        )
    }

    fn split(&self, text: &str) -> Vec<CandidateBlock> {
        let text = self.preamble.replace_all(text, "");

        let mut chunks: Vec<Vec<&str>> = Vec::new();
        for line in text.lines() {
            let trimmed = line.trim();
            if let Some(rest) = trimmed.strip_prefix(self.delimiter.as_str()) {
                chunks.push(vec![rest.trim()]);
            } else if let Some(current) = chunks.last_mut() {
                current.push(trimmed);
            }
        }

        chunks
            .into_iter()
            .filter_map(|chunk| {
                let lines: Vec<&str> = chunk.into_iter().filter(|l| !l.is_empty()).collect();
                let title = lines.first()?.to_string();
                Some(CandidateBlock {
                    title: Some(title),
                    text: lines.join("\n"),
                })
            })
            .collect()
    }
}

impl Default for PlainText {
    fn default() -> Self {
        Self::new(DEFAULT_PREAMBLE.clone(), DEFAULT_DELIMITER)
    }
}

impl Strategy for PlainText {
    fn kind(&self) -> StrategyKind {
        StrategyKind::PlainText
    }

    fn extract(&self, doc: &Document) -> Vec<CandidateBlock> {
        self.split(&doc.plain_text())
    }
}
