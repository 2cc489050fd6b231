use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::warn;

use super::{CandidateBlock, Strategy, StrategyKind};
use crate::parser::document::{strip_tags, Document};
use crate::parser::fields::collapse_whitespace;

/// RSS `<item>` / Atom `<entry>` elements, rewritten as labelled lines so
/// they go through the same field resolution as markup blocks.
pub struct FeedItems;

#[derive(Default)]
struct Item {
    title: Option<String>,
    summary: Option<String>,
    date: Option<String>,
    category: Option<String>,
    link: Option<String>,
}

impl Item {
    fn set(&mut self, tag: &[u8], value: String) {
        let value = collapse_whitespace(&strip_tags(&value));
        if value.is_empty() {
            return;
        }
        let slot = match tag {
            b"title" => &mut self.title,
            b"description" | b"summary" | b"content" | b"content:encoded" => &mut self.summary,
            b"pubDate" | b"published" | b"updated" | b"dc:date" => &mut self.date,
            b"category" => &mut self.category,
            b"link" | b"guid" => &mut self.link,
            _ => return,
        };
        if slot.is_none() {
            *slot = Some(value);
        }
    }

    fn into_block(self) -> Option<CandidateBlock> {
        let mut lines = Vec::new();
        if let Some(s) = self.summary {
            lines.push(format!("Summary: {}", s));
        }
        if let Some(d) = self.date {
            lines.push(format!("Release: {}", d));
        }
        if let Some(c) = self.category {
            lines.push(format!("Genre: {}", c));
        }
        if let Some(l) = self.link {
            lines.push(format!("Source: {}", l));
        }
        if self.title.is_none() && lines.is_empty() {
            return None;
        }
        Some(CandidateBlock {
            title: self.title,
            text: lines.join("\n"),
        })
    }
}

fn is_item(tag: &[u8]) -> bool {
    matches!(tag, b"item" | b"entry")
}

fn href(e: &BytesStart) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == b"href")
        .and_then(|a| a.unescape_value().ok().map(|v| v.to_string()))
}

pub fn parse_items(xml: &str) -> Vec<CandidateBlock> {
    let mut reader = Reader::from_str(xml);
    let mut blocks = Vec::new();
    let mut current: Option<Item> = None;
    let mut field: Option<Vec<u8>> = None;
    let mut text = String::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = e.name().as_ref().to_vec();
                if is_item(&name) {
                    current = Some(Item::default());
                } else if current.is_some() && field.is_none() {
                    if name == b"link" {
                        if let (Some(item), Some(h)) = (current.as_mut(), href(&e)) {
                            item.set(b"link", h);
                        }
                    }
                    field = Some(name);
                    text.clear();
                }
            }
            Ok(Event::Empty(e)) => {
                if e.name().as_ref() == b"link" {
                    if let (Some(item), Some(h)) = (current.as_mut(), href(&e)) {
                        item.set(b"link", h);
                    }
                }
            }
            Ok(Event::Text(e)) if field.is_some() => match e.unescape() {
                Ok(t) => text.push_str(&t),
                Err(_) => text.push_str(&String::from_utf8_lossy(&e)),
            },
            Ok(Event::CData(e)) if field.is_some() => {
                text.push_str(&String::from_utf8_lossy(&e));
            }
            Ok(Event::End(e)) => {
                let name = e.name().as_ref().to_vec();
                if is_item(&name) {
                    if let Some(block) = current.take().and_then(Item::into_block) {
                        blocks.push(block);
                    }
                    field = None;
                } else if field.as_deref() == Some(name.as_slice()) {
                    if let Some(item) = current.as_mut() {
                        item.set(&name, std::mem::take(&mut text));
                    }
                    field = None;
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                warn!(error = %e, position = reader.buffer_position(), "feed parse stopped early");
                break;
            }
            _ => {}
        }
        buf.clear();
    }

    blocks
}

impl Strategy for FeedItems {
    fn kind(&self) -> StrategyKind {
        StrategyKind::FeedItems
    }

    fn extract(&self, doc: &Document) -> Vec<CandidateBlock> {
        parse_items(doc.raw)
    }
}
