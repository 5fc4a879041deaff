use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;

/// Contents of a `<tool>/latest.json` pointer object.
///
/// Parsing is lenient in the same way readers of the object are: unknown
/// fields are ignored, a `key` that is not a non-empty string counts as
/// absent, and an `updatedAt` that is not a string counts as absent. An empty
/// `updatedAt` string is kept as written.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PointerDocument {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl PointerDocument {
    /// The document a publisher writes after uploading `key`.
    pub fn for_artifact(key: impl Into<String>, updated_at: DateTime<Utc>) -> Self {
        Self {
            key: Some(key.into()),
            updated_at: Some(format_timestamp(updated_at)),
        }
    }

    /// Parses a pointer body. An empty body is treated as `{}`.
    pub fn parse(body: &[u8]) -> Result<Self, serde_json::Error> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }

        let value: Value = serde_json::from_slice(body)?;
        let string_field = |name: &str| value.get(name).and_then(Value::as_str);
        Ok(Self {
            key: string_field("key")
                .filter(|key| !key.is_empty())
                .map(str::to_string),
            updated_at: string_field("updatedAt").map(str::to_string),
        })
    }

    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// RFC 3339 UTC with milliseconds and a `Z` suffix, e.g. `2024-05-01T12:00:00.000Z`.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}
