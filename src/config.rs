use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::db::{IdentityKey, RecordKind};
use crate::error::IngestError;
use crate::parser::strategy::StrategyKind;

pub const DEFAULT_CONFIG_PATH: &str = "release_scraper.toml";
const ENV_PREFIX: &str = "RELEASES";
pub const MAX_ATTEMPTS_LIMIT: u32 = 10;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub db_path: PathBuf,
    pub snapshot_dir: PathBuf,
    pub user_agent: String,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub concurrency: usize,
    pub identity: IdentityKey,
    /// Hour of day (UTC) for the scheduled cycle.
    pub schedule_hour: u32,
    pub cache_ttl_secs: u64,
    pub max_records_per_source: usize,
    pub sources: Vec<SourceConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/releases.sqlite"),
            snapshot_dir: PathBuf::from("data/snapshots"),
            user_agent: "Mozilla/5.0".to_string(),
            timeout_secs: 15,
            max_attempts: 3,
            base_backoff_ms: 1000,
            concurrency: 4,
            identity: IdentityKey::Daily,
            schedule_hour: 6,
            cache_ttl_secs: 1800,
            max_records_per_source: 200,
            sources: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceMode {
    StructuredDocument,
    Feed,
    GenericPage,
}

impl SourceMode {
    pub fn default_strategies(self) -> Vec<StrategyKind> {
        match self {
            SourceMode::StructuredDocument | SourceMode::GenericPage => vec![
                StrategyKind::Container,
                StrategyKind::HeadingRun,
                StrategyKind::PlainText,
            ],
            SourceMode::Feed => vec![StrategyKind::FeedItems, StrategyKind::PlainText],
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FallbackEntry {
    pub name: String,
    pub release: Option<String>,
    pub category: Option<String>,
    pub summary: Option<String>,
    pub attribution: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub snapshot: Option<PathBuf>,
    pub mode: SourceMode,
    #[serde(default = "default_kind")]
    pub kind: RecordKind,
    #[serde(default)]
    pub strategies: Option<Vec<StrategyKind>>,
    #[serde(default)]
    pub container_selector: Option<String>,
    #[serde(default)]
    pub title_selector: Option<String>,
    #[serde(default)]
    pub body_selector: Option<String>,
    #[serde(default)]
    pub heading_level: Option<u8>,
    #[serde(default)]
    pub preamble: Option<String>,
    #[serde(default)]
    pub delimiter: Option<String>,
    #[serde(default)]
    pub fallback: Vec<FallbackEntry>,
}

fn default_kind() -> RecordKind {
    RecordKind::Releases
}

/// A fully resolved source, immutable for the duration of a cycle.
#[derive(Debug, Clone)]
pub struct Source {
    pub id: String,
    pub url: Option<String>,
    pub snapshot: PathBuf,
    pub mode: SourceMode,
    pub kind: RecordKind,
    /// Always in fixed priority order.
    pub strategies: Vec<StrategyKind>,
    pub container_selector: Option<String>,
    pub title_selector: Option<String>,
    pub body_selector: Option<String>,
    pub heading_level: Option<u8>,
    pub preamble: Option<Regex>,
    pub delimiter: Option<String>,
    pub fallback: Vec<FallbackEntry>,
}

impl Source {
    /// Minimal source reading a snapshot file.
    #[cfg(test)]
    pub fn snapshot_only(id: &str, snapshot: impl Into<PathBuf>, mode: SourceMode) -> Self {
        Self {
            id: id.to_string(),
            url: None,
            snapshot: snapshot.into(),
            mode,
            kind: RecordKind::Releases,
            strategies: mode.default_strategies(),
            container_selector: None,
            title_selector: None,
            body_selector: None,
            heading_level: None,
            preamble: None,
            delimiter: None,
            fallback: Vec::new(),
        }
    }
}

impl Settings {
    /// Layer the optional TOML file under `RELEASES__*` environment overrides.
    pub fn load(path: &Path) -> Result<Self, IngestError> {
        let settings = Config::builder()
            .add_source(File::from(path).format(FileFormat::Toml).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .and_then(|c| c.try_deserialize::<Settings>())
            .map_err(|e| IngestError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn validate(&self) -> Result<(), IngestError> {
        if self.schedule_hour > 23 {
            return Err(IngestError::Config(format!(
                "schedule_hour must be 0-23, got {}",
                self.schedule_hour
            )));
        }
        if !(1..=MAX_ATTEMPTS_LIMIT).contains(&self.max_attempts) {
            return Err(IngestError::Config(format!(
                "max_attempts must be 1-{}, got {}",
                MAX_ATTEMPTS_LIMIT, self.max_attempts
            )));
        }
        let mut seen = HashSet::new();
        for s in &self.sources {
            if s.id.trim().is_empty() {
                return Err(IngestError::Config("source id must not be empty".into()));
            }
            if !seen.insert(s.id.as_str()) {
                return Err(IngestError::Config(format!("duplicate source id '{}'", s.id)));
            }
            for sel in [&s.container_selector, &s.title_selector, &s.body_selector]
                .into_iter()
                .flatten()
            {
                scraper::Selector::parse(sel).map_err(|e| {
                    IngestError::Config(format!("source '{}': bad selector '{}': {}", s.id, sel, e))
                })?;
            }
            if let Some(level) = s.heading_level {
                if !(1..=6).contains(&level) {
                    return Err(IngestError::Config(format!(
                        "source '{}': heading_level must be 1-6, got {}",
                        s.id, level
                    )));
                }
            }
            if let Some(p) = &s.preamble {
                Regex::new(p).map_err(|e| {
                    IngestError::Config(format!("source '{}': bad preamble pattern: {}", s.id, e))
                })?;
            }
            if matches!(&s.delimiter, Some(d) if d.trim().is_empty()) {
                return Err(IngestError::Config(format!(
                    "source '{}': delimiter must not be blank",
                    s.id
                )));
            }
        }
        Ok(())
    }

    /// Resolve every configured source. Call after `validate`.
    pub fn sources(&self) -> Result<Vec<Source>, IngestError> {
        self.sources.iter().map(|s| self.resolve(s)).collect()
    }

    fn resolve(&self, s: &SourceConfig) -> Result<Source, IngestError> {
        let mut strategies = s
            .strategies
            .clone()
            .unwrap_or_else(|| s.mode.default_strategies());
        strategies.sort();
        strategies.dedup();

        let preamble = s
            .preamble
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| IngestError::Config(e.to_string()))?;

        Ok(Source {
            id: s.id.clone(),
            url: s.url.clone().filter(|u| !u.trim().is_empty()),
            snapshot: s
                .snapshot
                .clone()
                .unwrap_or_else(|| self.snapshot_dir.join(format!("{}.html", s.id))),
            mode: s.mode,
            kind: s.kind,
            strategies,
            container_selector: s.container_selector.clone(),
            title_selector: s.title_selector.clone(),
            body_selector: s.body_selector.clone(),
            heading_level: s.heading_level,
            preamble,
            delimiter: s.delimiter.clone(),
            fallback: s.fallback.clone(),
        })
    }
}

// ── Tests ──
