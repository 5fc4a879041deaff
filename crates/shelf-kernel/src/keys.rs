use std::fmt;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// File name of the mutable pointer object inside every tool namespace.
pub const LATEST_OBJECT: &str = "latest.json";

const SUFFIX_LEN: usize = 8;

/// A validated, trimmed tool namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ToolName(String);

impl ToolName {
    /// Returns `None` when `raw` is absent or blank after trimming.
    pub fn parse(raw: Option<&str>) -> Option<Self> {
        let trimmed = raw?.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `<tool>/latest.json`
    pub fn latest_key(&self) -> String {
        format!("{}/{}", self.0, LATEST_OBJECT)
    }

    /// `<tool>/<timestamp>-<suffix>.json`, colons in the timestamp replaced by `-`.
    pub fn artifact_key(&self, at: DateTime<Utc>, suffix: &str) -> String {
        format!("{}/{}-{}.json", self.0, key_timestamp(at), suffix)
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// ISO-8601 UTC with millisecond precision and no colons.
pub fn key_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H-%M-%S%.3fZ").to_string()
}

/// Eight lowercase hex characters disambiguating artifacts within one millisecond.
pub fn random_suffix() -> String {
    let mut suffix = Uuid::new_v4().simple().to_string();
    suffix.truncate(SUFFIX_LEN);
    suffix
}

/// Checks that `key` is an artifact key inside `tool`'s namespace.
pub fn is_artifact_key(tool: &ToolName, key: &str) -> bool {
    let Some(file) = key
        .strip_prefix(tool.as_str())
        .and_then(|rest| rest.strip_prefix('/'))
    else {
        return false;
    };
    let Some(stem) = file.strip_suffix(".json") else {
        return false;
    };
    // 2024-05-01T12-34-56.789Z-0a1b2c3d
    let Some((timestamp, suffix)) = stem.rsplit_once('-') else {
        return false;
    };
    suffix.len() == SUFFIX_LEN
        && suffix
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        && timestamp.len() == "2024-05-01T12-34-56.789Z".len()
        && timestamp.ends_with('Z')
        && !timestamp.contains(':')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn rejects_absent_and_blank_names() {
        assert_eq!(ToolName::parse(None), None);
        assert_eq!(ToolName::parse(Some("")), None);
        assert_eq!(ToolName::parse(Some(" \t\n")), None);
        assert_eq!(
            ToolName::parse(Some("  frog-scanner ")).unwrap().as_str(),
            "frog-scanner"
        );
    }

    #[test]
    fn derives_pointer_and_artifact_keys() {
        let tool = ToolName::parse(Some("frog-scanner")).unwrap();
        assert_eq!(tool.latest_key(), "frog-scanner/latest.json");
        assert_eq!(
            tool.artifact_key(at("2024-05-01T12:34:56.789Z"), "0a1b2c3d"),
            "frog-scanner/2024-05-01T12-34-56.789Z-0a1b2c3d.json"
        );
    }

    #[test]
    fn timestamp_keeps_millisecond_precision() {
        assert_eq!(
            key_timestamp(at("2024-01-02T03:04:05Z")),
            "2024-01-02T03-04-05.000Z"
        );
    }

    #[test]
    fn suffix_is_eight_lowercase_hex_characters() {
        for _ in 0..32 {
            let suffix = random_suffix();
            assert_eq!(suffix.len(), 8);
            assert!(suffix
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
        }
    }

    #[test]
    fn recognises_artifact_keys() {
        let tool = ToolName::parse(Some("t")).unwrap();
        let key = tool.artifact_key(Utc::now(), &random_suffix());
        assert!(is_artifact_key(&tool, &key));
        assert!(!is_artifact_key(&tool, "t/latest.json"));
        assert!(!is_artifact_key(&tool, "other/2024-05-01T12-34-56.789Z-0a1b2c3d.json"));
        assert!(!is_artifact_key(&tool, "t/2024-05-01T12-34-56.789Z-0A1B2C3D.json"));
    }
}
