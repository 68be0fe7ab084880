//! Close records: the structured outcome string attached when a task closes.
//!
//! Wire format: `VERDICT | key1: value1 | key2: value2`. Decoding is tolerant:
//! malformed segments are dropped with a [`DecodeWarning`] instead of failing
//! the whole record, and unknown keys are kept for analytics.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Segment separator on the wire.
pub const SEPARATOR: &str = " | ";

/// Well-known verdict tokens. Anything else is preserved as [`Verdict::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Verdict {
    Pass,
    Minor,
    Critical,
    Done,
    Fixed,
    Skipped,
    Regression,
    Complete,
    GapsFound,
    Blocked,
    Other(String),
}

impl Verdict {
    /// Parses a verdict token (case-insensitive for known tokens).
    pub fn parse(token: &str) -> Self {
        match token.trim().to_ascii_uppercase().as_str() {
            "PASS" => Verdict::Pass,
            "MINOR" => Verdict::Minor,
            "CRITICAL" => Verdict::Critical,
            "DONE" => Verdict::Done,
            "FIXED" => Verdict::Fixed,
            "SKIPPED" => Verdict::Skipped,
            "REGRESSION" => Verdict::Regression,
            "COMPLETE" => Verdict::Complete,
            "GAPS_FOUND" => Verdict::GapsFound,
            "BLOCKED" => Verdict::Blocked,
            _ => Verdict::Other(token.trim().to_string()),
        }
    }

    /// Returns the wire token.
    pub fn as_str(&self) -> &str {
        match self {
            Verdict::Pass => "PASS",
            Verdict::Minor => "MINOR",
            Verdict::Critical => "CRITICAL",
            Verdict::Done => "DONE",
            Verdict::Fixed => "FIXED",
            Verdict::Skipped => "SKIPPED",
            Verdict::Regression => "REGRESSION",
            Verdict::Complete => "COMPLETE",
            Verdict::GapsFound => "GAPS_FOUND",
            Verdict::Blocked => "BLOCKED",
            Verdict::Other(s) => s,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured outcome: verdict plus an ordered, open-ended attribute map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseRecord {
    /// Primary outcome token, kept verbatim.
    pub verdict: String,
    /// Attributes in insertion order. Keys are unique.
    pub attributes: Vec<(String, String)>,
}

/// A malformed segment dropped while decoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodeWarning {
    /// Zero-based segment index (the verdict is segment 0).
    pub segment: usize,
    /// Raw segment text.
    pub raw: String,
    /// What was wrong with it.
    pub reason: String,
}

impl fmt::Display for DecodeWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "segment {} ({:?}): {}", self.segment, self.raw, self.reason)
    }
}

/// Output of [`CloseRecord::decode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub record: CloseRecord,
    pub warnings: Vec<DecodeWarning>,
}

impl CloseRecord {
    /// Creates a record with no attributes.
    pub fn new(verdict: impl Into<String>) -> Self {
        Self {
            verdict: verdict.into(),
            attributes: Vec::new(),
        }
    }

    /// Creates a record from a well-known verdict.
    pub fn with_verdict(verdict: &Verdict) -> Self {
        Self::new(verdict.as_str())
    }

    /// Adds an attribute, replacing the value in place if the key exists.
    pub fn attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    /// Inserts an attribute, replacing the value in place if the key exists.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.attributes.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.attributes.push((key, value)),
        }
    }

    /// Returns the attribute value for `key`, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Parsed verdict.
    pub fn verdict(&self) -> Verdict {
        Verdict::parse(&self.verdict)
    }

    /// The `files` attribute split on commas.
    pub fn files(&self) -> Vec<String> {
        self.get("files")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Encodes to the wire format: verdict first, then attributes in order.
    ///
    /// Pipes inside values become `/` and newlines become spaces so the
    /// record always decodes back into the same number of segments.
    pub fn encode(&self) -> String {
        let mut out = sanitize(&self.verdict);
        for (key, value) in &self.attributes {
            out.push_str(SEPARATOR);
            out.push_str(&sanitize(key));
            out.push_str(": ");
            out.push_str(&sanitize(value));
        }
        out
    }

    /// Decodes a wire string.
    pub fn decode(input: &str) -> Decoded {
        let mut segments = input.split('|');
        let verdict = segments.next().unwrap_or_default().trim().to_string();
        let mut record = CloseRecord::new(verdict);
        let mut warnings = Vec::new();

        if record.verdict.is_empty() {
            warnings.push(DecodeWarning {
                segment: 0,
                raw: String::new(),
                reason: "missing verdict".to_string(),
            });
        }

        for (i, raw) in segments.enumerate() {
            let segment = raw.trim();
            if segment.is_empty() {
                continue;
            }
            match segment.split_once(':') {
                Some((key, value)) if !key.trim().is_empty() => {
                    record.insert(key.trim(), value.trim());
                }
                Some(_) => warnings.push(DecodeWarning {
                    segment: i + 1,
                    raw: segment.to_string(),
                    reason: "empty key".to_string(),
                }),
                None => warnings.push(DecodeWarning {
                    segment: i + 1,
                    raw: segment.to_string(),
                    reason: "no ':' separator".to_string(),
                }),
            }
        }

        for warning in &warnings {
            tracing::warn!(warning = %warning, "malformed close record segment dropped");
        }

        Decoded { record, warnings }
    }
}

impl fmt::Display for CloseRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

fn sanitize(s: &str) -> String {
    s.replace('|', "/").replace(['\n', '\r'], " ").trim().to_string()
}
