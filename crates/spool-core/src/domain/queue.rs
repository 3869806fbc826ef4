//! Queue selection for the claim protocol.
//!
//! A worker is configured with an ordered list such as `"critical,mail_*,*"`:
//! exact names, prefix wildcards (`name*`) and the catch-all `*`. Entries are
//! served in list order; inside one entry, rows are taken by priority then age.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueueEntry {
    All,
    Exact(String),
    Prefix(String),
}

impl QueueEntry {
    fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if raw == "*" {
            return Some(QueueEntry::All);
        }
        match raw.strip_suffix('*') {
            Some(prefix) => Some(QueueEntry::Prefix(prefix.to_string())),
            None => Some(QueueEntry::Exact(raw.to_string())),
        }
    }

    pub fn matches(&self, queue_name: &str) -> bool {
        match self {
            QueueEntry::All => true,
            QueueEntry::Exact(name) => name == queue_name,
            QueueEntry::Prefix(prefix) => queue_name.starts_with(prefix.as_str()),
        }
    }
}

impl fmt::Display for QueueEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueEntry::All => f.write_str("*"),
            QueueEntry::Exact(name) => f.write_str(name),
            QueueEntry::Prefix(prefix) => write!(f, "{prefix}*"),
        }
    }
}

/// Ordered list of queue entries a worker claims from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "RawQueues", into = "String")]
pub struct QueueSelector {
    entries: Vec<QueueEntry>,
}

impl QueueSelector {
    pub fn all() -> Self {
        Self {
            entries: vec![QueueEntry::All],
        }
    }

    /// Parses a comma-separated list. An empty list selects every queue.
    pub fn parse(raw: &str) -> Self {
        Self::from_names(raw.split(','))
    }

    pub fn from_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let mut entries: Vec<QueueEntry> = Vec::new();
        for entry in names.into_iter().filter_map(QueueEntry::parse) {
            if !entries.contains(&entry) {
                entries.push(entry);
            }
        }
        if entries.is_empty() {
            return Self::all();
        }
        Self { entries }
    }

    pub fn entries(&self) -> &[QueueEntry] {
        &self.entries
    }

    pub fn matches(&self, queue_name: &str) -> bool {
        self.rank(queue_name).is_some()
    }

    /// Index of the first entry selecting `queue_name`.
    pub fn rank(&self, queue_name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.matches(queue_name))
    }
}

impl Default for QueueSelector {
    fn default() -> Self {
        Self::all()
    }
}

impl fmt::Display for QueueSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.entries.iter().map(ToString::to_string).collect();
        f.write_str(&names.join(","))
    }
}

impl From<&str> for QueueSelector {
    fn from(raw: &str) -> Self {
        Self::parse(raw)
    }
}

impl From<QueueSelector> for String {
    fn from(selector: QueueSelector) -> Self {
        selector.to_string()
    }
}

/// Pending executions of one queue, by state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub queue_name: String,
    pub scheduled: usize,
    pub ready: usize,
    pub claimed: usize,
    pub blocked: usize,
    pub failed: usize,
}

impl QueueCounts {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            ..Self::default()
        }
    }

    /// Unfinished jobs of the queue.
    pub fn pending(&self) -> usize {
        self.scheduled + self.ready + self.claimed + self.blocked + self.failed
    }
}

/// Accepts `"a,b*"` as well as `["a", "b*"]` in configuration files.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawQueues {
    One(String),
    Many(Vec<String>),
}

impl From<RawQueues> for QueueSelector {
    fn from(raw: RawQueues) -> Self {
        match raw {
            RawQueues::One(s) => QueueSelector::parse(&s),
            RawQueues::Many(names) => QueueSelector::from_names(names.iter().map(String::as_str)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn parses_ordered_entries() {
        let selector = QueueSelector::parse("critical, mail_*,*");
        assert_eq!(
            selector.entries(),
            &[
                QueueEntry::Exact("critical".into()),
                QueueEntry::Prefix("mail_".into()),
                QueueEntry::All,
            ]
        );
        assert_eq!(selector.to_string(), "critical,mail_*,*");
    }

    #[rstest]
    #[case::exact("critical", Some(0))]
    #[case::prefix("mail_digest", Some(1))]
    #[case::fallback("default", Some(2))]
    fn ranks_by_first_matching_entry(#[case] queue: &str, #[case] expected: Option<usize>) {
        let selector = QueueSelector::parse("critical,mail_*,*");
        assert_eq!(selector.rank(queue), expected);
    }

    #[test]
    fn unmatched_queue_has_no_rank() {
        let selector = QueueSelector::parse("critical,mail_*");
        assert!(!selector.matches("default"));
    }

    #[test]
    fn empty_list_selects_everything() {
        assert_eq!(QueueSelector::parse(""), QueueSelector::all());
        assert_eq!(QueueSelector::parse(" , "), QueueSelector::all());
    }

    #[test]
    fn deserializes_from_string_or_list() {
        let from_string: QueueSelector = serde_json::from_str("\"a,b*\"").unwrap();
        let from_list: QueueSelector = serde_json::from_str("[\"a\", \"b*\"]").unwrap();
        assert_eq!(from_string, from_list);
        assert_eq!(serde_json::to_string(&from_list).unwrap(), "\"a,b*\"");
    }
}
