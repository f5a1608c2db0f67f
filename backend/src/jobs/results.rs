use std::collections::BTreeMap;
use std::fmt;

use platforms::Platform;
use serde::{Deserialize, Serialize};

/// Per-platform delivery state as persisted in `platform_results`.
///
/// Wire form is a plain string: `"sent"`, `"skipped:<reason>"`,
/// `"failed:<reason>"`. A bare `"skipped"` or `"failed"` carries no reason
/// and is written back bare. Anything else is kept verbatim as `Unknown`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum PlatformOutcome {
    Sent,
    Skipped(Option<String>),
    Failed(Option<String>),
    Unknown(String),
}

impl PlatformOutcome {
    pub fn skipped(reason: impl Into<String>) -> Self {
        PlatformOutcome::Skipped(Some(reason.into()))
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        PlatformOutcome::Failed(Some(reason.into()))
    }

    /// Reason attached to a skip or failure, if any.
    pub fn reason(&self) -> Option<&str> {
        match self {
            PlatformOutcome::Skipped(r) | PlatformOutcome::Failed(r) => r.as_deref(),
            _ => None,
        }
    }

    pub fn is_sent(&self) -> bool {
        matches!(self, PlatformOutcome::Sent)
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, PlatformOutcome::Skipped(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, PlatformOutcome::Failed(_))
    }
}

impl From<String> for PlatformOutcome {
    fn from(raw: String) -> Self {
        if raw == "sent" {
            return PlatformOutcome::Sent;
        }
        if raw == "skipped" {
            return PlatformOutcome::Skipped(None);
        }
        if raw == "failed" {
            return PlatformOutcome::Failed(None);
        }
        if let Some(reason) = raw.strip_prefix("skipped:") {
            return PlatformOutcome::skipped(reason);
        }
        if let Some(reason) = raw.strip_prefix("failed:") {
            return PlatformOutcome::failed(reason);
        }
        PlatformOutcome::Unknown(raw)
    }
}

impl From<PlatformOutcome> for String {
    fn from(o: PlatformOutcome) -> Self {
        o.to_string()
    }
}

impl fmt::Display for PlatformOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformOutcome::Sent => f.write_str("sent"),
            PlatformOutcome::Skipped(None) => f.write_str("skipped"),
            PlatformOutcome::Skipped(Some(r)) => write!(f, "skipped:{r}"),
            PlatformOutcome::Failed(None) => f.write_str("failed"),
            PlatformOutcome::Failed(Some(r)) => write!(f, "failed:{r}"),
            PlatformOutcome::Unknown(raw) => f.write_str(raw),
        }
    }
}

/// Platform -> outcome map with monotonic `sent` entries.
///
/// Keys are platform names rather than [`Platform`] so rows written by a
/// newer deploy with an unknown platform survive a read-modify-write.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlatformResults(BTreeMap<String, PlatformOutcome>);

impl PlatformResults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, platform: Platform) -> Option<&PlatformOutcome> {
        self.0.get(platform.as_str())
    }

    pub fn is_sent(&self, platform: Platform) -> bool {
        self.get(platform).is_some_and(PlatformOutcome::is_sent)
    }

    /// Records `outcome` for `platform`. A `sent` entry is never overwritten;
    /// returns whether the stored value changed.
    pub fn record(&mut self, platform: Platform, outcome: PlatformOutcome) -> bool {
        let key = platform.as_str().to_string();
        match self.0.get(&key) {
            Some(PlatformOutcome::Sent) => false,
            Some(existing) if *existing == outcome => false,
            _ => {
                self.0.insert(key, outcome);
                true
            }
        }
    }

    /// Folds `newer` into `self` under the same monotonic rule as [`record`](Self::record).
    pub fn merge(&mut self, newer: &PlatformResults) {
        for (key, outcome) in &newer.0 {
            match self.0.get(key) {
                Some(PlatformOutcome::Sent) => {}
                _ => {
                    self.0.insert(key.clone(), outcome.clone());
                }
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PlatformOutcome)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Platforms whose latest outcome is a failure, in key order.
    pub fn failed_platforms(&self) -> Vec<&str> {
        self.0
            .iter()
            .filter(|(_, o)| o.is_failed())
            .map(|(k, _)| k.as_str())
            .collect()
    }
}

/// Bounds free-form failure text before it is stored.
pub fn truncate_reason(message: &str, max_chars: usize) -> String {
    let trimmed = message.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(max_chars).collect();
    out.push('…');
    out
}
