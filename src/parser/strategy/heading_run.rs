use std::sync::LazyLock;

use scraper::{ElementRef, Html, Selector};

use super::{element_text, paragraph_text, CandidateBlock, Strategy, StrategyKind};
use crate::parser::document::Document;

static CONTENTS: LazyLock<Selector> = LazyLock::new(|| Selector::parse("#contents").unwrap());
static LIST_ITEM: LazyLock<Selector> = LazyLock::new(|| Selector::parse("li").unwrap());
static NESTED_BODY: LazyLock<Selector> = LazyLock::new(|| Selector::parse("p, li").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Fixed(u8),
    /// Shallowest heading level that repeats in the document.
    Auto,
}

/// Section headings: one block per heading, holding the body elements that
/// follow it up to the next heading of the same or higher rank.
pub struct HeadingRun {
    level: Level,
}

impl HeadingRun {
    pub fn new(level: Level) -> Self {
        Self { level }
    }
}

fn scope(html: &Html) -> ElementRef<'_> {
    html.select(&CONTENTS)
        .next()
        .unwrap_or_else(|| html.root_element())
}

fn heading_rank(tag: &str) -> Option<u8> {
    match tag.as_bytes() {
        [b'h', d @ b'1'..=b'6'] => Some(d - b'0'),
        _ => None,
    }
}

fn detect_level(scope: ElementRef) -> Option<u8> {
    let mut counts = [0usize; 7];
    for el in scope.descendants().filter_map(ElementRef::wrap) {
        if let Some(rank) = heading_rank(el.value().name()) {
            counts[rank as usize] += 1;
        }
    }
    (1..=6u8)
        .find(|&n| counts[n as usize] >= 2)
        .or_else(|| (1..=6u8).find(|&n| counts[n as usize] >= 1))
}

impl Strategy for HeadingRun {
    fn kind(&self) -> StrategyKind {
        StrategyKind::HeadingRun
    }

    fn extract(&self, doc: &Document) -> Vec<CandidateBlock> {
        let Some(html) = &doc.html else {
            return Vec::new();
        };
        let scope = scope(html);
        let level = match self.level {
            Level::Fixed(n) => n,
            Level::Auto => match detect_level(scope) {
                Some(n) => n,
                None => return Vec::new(),
            },
        };
        let Ok(heading) = Selector::parse(&format!("h{}", level)) else {
            return Vec::new();
        };

        let mut blocks = Vec::new();
        for h in scope.select(&heading) {
            let title = element_text(h);
            let mut lines = Vec::new();

            for sib in h.next_siblings().filter_map(ElementRef::wrap) {
                let tag = sib.value().name();
                if heading_rank(tag).is_some_and(|rank| rank <= level) {
                    break;
                }
                match tag {
                    "p" => lines.push(paragraph_text(sib)),
                    "ul" | "ol" => lines.extend(sib.select(&LIST_ITEM).map(paragraph_text)),
                    "div" | "section" | "blockquote" => {
                        lines.extend(sib.select(&NESTED_BODY).map(paragraph_text))
                    }
                    _ => {}
                }
            }
            lines.retain(|l| !l.is_empty());

            if title.is_empty() && lines.is_empty() {
                continue;
            }
            blocks.push(CandidateBlock {
                title: Some(title).filter(|t| !t.is_empty()),
                text: lines.join("\n"),
            });
        }
        blocks
    }
}
