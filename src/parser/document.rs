use scraper::node::Node;
use scraper::{ElementRef, Html};

use crate::config::SourceMode;

/// A fetched payload with its parsed tree. HTML modes get a `scraper` tree;
/// feeds keep only the raw text and are read by the feed strategy directly.
pub struct Document<'a> {
    pub raw: &'a str,
    pub html: Option<Html>,
}

impl<'a> Document<'a> {
    pub fn parse(raw: &'a str, mode: SourceMode) -> Self {
        let html = match mode {
            SourceMode::Feed => None,
            SourceMode::StructuredDocument | SourceMode::GenericPage => {
                Some(Html::parse_document(raw))
            }
        };
        Self { raw, html }
    }

    /// Every text node on its own line, script and style bodies skipped.
    /// Feed CDATA sections are unwrapped so their markup is read as HTML.
    pub fn plain_text(&self) -> String {
        match &self.html {
            Some(html) => text_lines(html.root_element()),
            None => strip_tags(&self.raw.replace("<![CDATA[", "").replace("]]>", "")),
        }
    }
}

/// Text of a markup fragment, one line per text node, entities decoded.
pub fn strip_tags(markup: &str) -> String {
    text_lines(Html::parse_fragment(markup).root_element())
}

fn text_lines(root: ElementRef) -> String {
    root.descendants()
        .filter_map(|node| {
            let text = node.value().as_text()?;
            let parent = node.parent().and_then(|p| match p.value() {
                Node::Element(e) => Some(e.name()),
                _ => None,
            });
            if matches!(parent, Some("script" | "style")) {
                return None;
            }
            Some(&**text)
        })
        .collect::<Vec<&str>>()
        .join("\n")
}
