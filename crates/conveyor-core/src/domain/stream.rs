//! Stream names and offsets.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Name of an append-only stream in the queue backend.
///
/// Non-empty, no whitespace. The name is also the sharding key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StreamName(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid stream name {0:?}: must be non-empty and contain no whitespace")]
pub struct InvalidStreamName(pub String);

impl StreamName {
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidStreamName> {
        let name = name.into();
        if name.is_empty() || name.chars().any(char::is_whitespace) {
            return Err(InvalidStreamName(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for StreamName {
    fn default() -> Self {
        Self("default".to_string())
    }
}

impl TryFrom<String> for StreamName {
    type Error = InvalidStreamName;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<StreamName> for String {
    fn from(value: StreamName) -> Self {
        value.0
    }
}

impl fmt::Display for StreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Position of an entry within one stream. Assigned by the backend, starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Offset(pub u64);

impl Offset {
    pub const FIRST: Offset = Offset(1);

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Offset {
        Offset(self.0 + 1)
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::empty("")]
    #[case::space("payments retries")]
    #[case::tab("a\tb")]
    fn stream_name_rejects_invalid(#[case] raw: &str) {
        assert!(StreamName::new(raw).is_err());
    }

    #[test]
    fn stream_name_serializes_as_plain_string() {
        let name = StreamName::new("payments.retries").unwrap();
        let json = serde_json::to_string(&name).unwrap();
        assert_eq!(json, "\"payments.retries\"");

        let bad: Result<StreamName, _> = serde_json::from_str("\"\"");
        assert!(bad.is_err());
    }

    #[test]
    fn offsets_are_ordered() {
        assert!(Offset::FIRST < Offset::FIRST.next());
        assert_eq!(Offset(41).next(), Offset(42));
    }
}
