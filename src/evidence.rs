//! Append-only, ordered per-run sequence of typed observations.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The kind of fact an [`Evidence`] record carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvidenceKind {
    ToolResult,
    HumanInput,
    Observation,
}

/// A single typed observation appended to a run's accumulating context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    pub kind: EvidenceKind,
    pub source: String,
    pub content: Bytes,
    pub timestamp: DateTime<Utc>,
}

impl Evidence {
    pub fn tool_result(source: impl Into<String>, content: Bytes, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind: EvidenceKind::ToolResult,
            source: source.into(),
            content,
            timestamp,
        }
    }

    pub fn human_input(source: impl Into<String>, content: Bytes, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind: EvidenceKind::HumanInput,
            source: source.into(),
            content,
            timestamp,
        }
    }

    pub fn observation(source: impl Into<String>, content: Bytes, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind: EvidenceKind::Observation,
            source: source.into(),
            content,
            timestamp,
        }
    }
}

/// Append-only log of [`Evidence`]. The engine is the sole writer within a
/// run, so no internal locking is needed — callers synchronize externally.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvidenceLog {
    entries: Vec<Evidence>,
}

impl EvidenceLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// O(1) amortized; preserves insertion order. Never removes entries.
    pub fn append(&mut self, evidence: Evidence) {
        self.entries.push(evidence);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Evidence> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_preserves_insertion_order() {
        let mut log = EvidenceLog::new();
        let now = Utc::now();
        log.append(Evidence::observation("a", Bytes::from_static(b"1"), now));
        log.append(Evidence::observation("b", Bytes::from_static(b"2"), now));
        log.append(Evidence::observation("c", Bytes::from_static(b"3"), now));

        let sources: Vec<&str> = log.iter().map(|e| e.source.as_str()).collect();
        assert_eq!(sources, vec!["a", "b", "c"]);
    }

    #[test]
    fn empty_log_has_len_zero() {
        let log = EvidenceLog::new();
        assert_eq!(log.len(), 0);
        assert!(log.is_empty());
    }
}
