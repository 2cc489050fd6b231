//! Label-driven field resolution over raw block text.
//!
//! The text is tokenized into label occurrences (`Release:`, `Genre:`, ...)
//! from a synonym table. A field's value runs from its label to the next
//! label occurrence, so adjacent `label: value` pairs on one line never
//! bleed into each other. A short `Key:` opening a line is a boundary too,
//! even when the key is not in the table (`Plattform:`, `Entwickler:`).

use std::sync::LazyLock;

use regex::Regex;

pub const MAX_SUMMARY_LEN: usize = 400;
pub const ELLIPSIS: &str = "...";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Name,
    Release,
    Category,
    Summary,
    Attribution,
}

/// Labels per field, in priority order.
pub const LABELS: &[(Field, &[&str])] = &[
    (Field::Name, &["Name", "Titel", "Title", "Spielname"]),
    (
        Field::Release,
        &["Erscheinungsdatum", "Release Date", "Release", "Datum", "Date"],
    ),
    (Field::Category, &["Genre", "Kategorie", "Category"]),
    (
        Field::Summary,
        &["Zusammenfassung", "Beschreibung", "Summary", "Description"],
    ),
    (Field::Attribution, &["Quelle", "Source"]),
];

/// Any known label at a word boundary, followed by a colon. Longer labels
/// come first so `Release Date:` wins over `Date:`.
static LABEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    let mut labels: Vec<&str> = LABELS.iter().flat_map(|(_, l)| l.iter().copied()).collect();
    labels.sort_by_key(|l| std::cmp::Reverse(l.len()));
    let alternation = labels
        .iter()
        .map(|l| regex::escape(l).replace(' ', r"\s+"))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(r"(?i)\b({})\s*:", alternation)).unwrap()
});

/// Any short key at the start of a line followed by a colon and whitespace.
static LINE_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*(\p{L}[\p{L}\p{N}\- ]{0,29}?)[ \t]*:(?:\s|$)").unwrap()
});

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fields {
    pub name: Option<String>,
    pub release: Option<String>,
    pub category: Option<String>,
    pub summary: Option<String>,
    pub attribution: Option<String>,
}

impl Fields {
    fn slot(&mut self, field: Field) -> &mut Option<String> {
        match field {
            Field::Name => &mut self.name,
            Field::Release => &mut self.release,
            Field::Category => &mut self.category,
            Field::Summary => &mut self.summary,
            Field::Attribution => &mut self.attribution,
        }
    }
}

/// One label occurrence in the text.
#[derive(Debug, Clone, PartialEq, Eq)]
struct LabelToken {
    /// Lowercased, single-spaced label; `None` for a key not in the table.
    label: Option<String>,
    /// Byte offset where the label starts.
    start: usize,
    /// Byte offset just past the colon.
    value_start: usize,
}

fn tokenize(text: &str) -> Vec<LabelToken> {
    let mut tokens: Vec<LabelToken> = LABEL_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let label = caps.get(1)?;
            Some(LabelToken {
                label: Some(collapse_whitespace(label.as_str()).to_lowercase()),
                start: whole.start(),
                value_start: whole.end(),
            })
        })
        .collect();

    let unknown: Vec<LabelToken> = LINE_KEY_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let key = caps.get(1)?;
            let overlaps_known = tokens
                .iter()
                .any(|t| key.start() < t.value_start && t.start < key.end());
            (!overlaps_known).then(|| LabelToken {
                label: None,
                start: key.start(),
                value_start: key.end(),
            })
        })
        .collect();

    tokens.extend(unknown);
    tokens.sort_by_key(|t| t.start);
    tokens
}

/// Extract every known field from a block's text. Fields without a label
/// (or with an empty value) stay `None`.
pub fn resolve(text: &str) -> Fields {
    let tokens = tokenize(text);
    let mut fields = Fields::default();

    for (field, labels) in LABELS {
        let value = labels.iter().find_map(|label| {
            let label = label.to_lowercase();
            tokens
                .iter()
                .enumerate()
                .filter(|(_, t)| t.label.as_deref() == Some(label.as_str()))
                .find_map(|(i, t)| {
                    let end = tokens.get(i + 1).map_or(text.len(), |next| next.start);
                    let value = collapse_whitespace(&text[t.value_start..end]);
                    (!value.is_empty()).then_some(value)
                })
        });
        *fields.slot(*field) = value;
    }

    fields.summary = fields.summary.map(|s| truncate_summary(&s));
    fields
}

/// Cut to `MAX_SUMMARY_LEN` characters, trim the cut, and mark it.
pub fn truncate_summary(s: &str) -> String {
    if s.chars().count() <= MAX_SUMMARY_LEN {
        return s.to_string();
    }
    let cut: String = s.chars().take(MAX_SUMMARY_LEN).collect();
    format!("{}{}", cut.trim_end(), ELLIPSIS)
}

pub fn collapse_whitespace(s: &str) -> String {
    WHITESPACE.replace_all(s.trim(), " ").into_owned()
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_boundary_on_one_line() {
        let f = resolve("Name: Foo Genre: RPG Release: 2025");
        assert_eq!(f.name.as_deref(), Some("Foo"));
        assert_eq!(f.category.as_deref(), Some("RPG"));
        assert_eq!(f.release.as_deref(), Some("2025"));
        assert!(f.summary.is_none());
        assert!(f.attribution.is_none());
    }

    #[test]
    fn german_labels_case_insensitive() {
        let f = resolve("ERSCHEINUNGSDATUM: 12.03.2026\nzusammenfassung: Ein MMO.\nQuelle: pcgames.de");
        assert_eq!(f.release.as_deref(), Some("12.03.2026"));
        assert_eq!(f.summary.as_deref(), Some("Ein MMO."));
        assert_eq!(f.attribution.as_deref(), Some("pcgames.de"));
    }

    #[test]
    fn synonym_priority_first_match_wins() {
        let f = resolve("Datum: later\nErscheinungsdatum: 2026");
        assert_eq!(f.release.as_deref(), Some("2026"));
    }

    #[test]
    fn longer_label_wins_over_suffix() {
        let f = resolve("Release Date: Q3 2026");
        assert_eq!(f.release.as_deref(), Some("Q3 2026"));
        // "Date" must not have produced its own token.
        assert_eq!(tokenize("Release Date: Q3 2026").len(), 1);
    }

    #[test]
    fn label_inside_word_is_ignored() {
        let f = resolve("Erscheinungsdatum: 2026");
        assert_eq!(tokenize("Erscheinungsdatum: 2026").len(), 1);
        assert_eq!(f.release.as_deref(), Some("2026"));
    }

    #[test]
    fn adjacent_labels_without_space() {
        let f = resolve("Name:Foo Genre:RPG");
        assert_eq!(f.name.as_deref(), Some("Foo"));
        assert_eq!(f.category.as_deref(), Some("RPG"));
    }

    #[test]
    fn empty_value_falls_through_to_next_occurrence() {
        let f = resolve("Genre: Genre: Strategy");
        assert_eq!(f.category.as_deref(), Some("Strategy"));
    }

    #[test]
    fn unknown_text_resolves_nothing() {
        assert_eq!(resolve("Just some prose without labels."), Fields::default());
        assert_eq!(resolve(""), Fields::default());
    }

    #[test]
    fn multiline_summary_collapsed() {
        let f = resolve("Beschreibung: line one\n   line two\nQuelle: x");
        assert_eq!(f.summary.as_deref(), Some("line one line two"));
    }

    #[test]
    fn summary_truncated_with_ellipsis() {
        let long = "word ".repeat(200);
        let f = resolve(&format!("Summary: {}", long));
        let s = f.summary.unwrap();
        assert!(s.ends_with(ELLIPSIS));
        assert!(s.chars().count() <= MAX_SUMMARY_LEN + ELLIPSIS.len());
        assert!(!s.trim_end_matches(ELLIPSIS).ends_with(' '));
    }

    #[test]
    fn truncate_counts_characters_not_bytes() {
        let s = "ä".repeat(MAX_SUMMARY_LEN);
        assert_eq!(truncate_summary(&s), s);
        let t = truncate_summary(&"ü".repeat(MAX_SUMMARY_LEN + 1));
        assert_eq!(t.chars().count(), MAX_SUMMARY_LEN + ELLIPSIS.len());
    }

    #[test]
    fn unknown_line_keys_end_values() {
        let f = resolve("Genre: MMORPG\nPlattform: PC\nEntwickler: Studio X\nQuelle: mein-mmo.de");
        assert_eq!(f.category.as_deref(), Some("MMORPG"));
        assert_eq!(f.attribution.as_deref(), Some("mein-mmo.de"));
    }

    #[test]
    fn colons_inside_values_are_not_keys() {
        let f = resolve("Release: 10:00 Uhr\nSource: https://example.com/a\nSummary: Patch notes\nhttps://example.com/b");
        assert_eq!(f.release.as_deref(), Some("10:00 Uhr"));
        assert_eq!(f.attribution.as_deref(), Some("https://example.com/a"));
        assert_eq!(f.summary.as_deref(), Some("Patch notes https://example.com/b"));
    }

    #[test]
    fn label_with_inner_whitespace() {
        let f = resolve("Release\n  Date : Q1 2027");
        assert_eq!(f.release.as_deref(), Some("Q1 2027"));
    }
}
