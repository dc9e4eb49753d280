//! Deterministic cache keys for provider requests.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::provider::{Capability, Payload};

/// Hex-encoded SHA-256 over every request-shaping field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Starts a fingerprint for requests against `capability`.
    pub fn builder(capability: Capability) -> FingerprintBuilder {
        FingerprintBuilder::new(capability)
    }

    /// Fingerprint of a whole JSON payload. Object keys are hashed in
    /// sorted order at every depth, independent of how the map stores them.
    pub fn of_payload(capability: Capability, payload: &Payload) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(capability.as_str().as_bytes());
        hasher.update(b"\n");
        hash_canonical(payload, &mut hasher);
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading characters, enough to correlate log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }

    fn digest(bytes: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(bytes)))
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Serialize)]
struct Canonical<'a> {
    capability: &'static str,
    text: &'a [String],
    fields: &'a BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

/// Builds a [`Fingerprint`] from the semantically significant parts of a
/// request.
///
/// Text is normalized (trimmed, runs of whitespace collapsed) before
/// hashing. Named fields are hashed in key order, so the order in which
/// they are added is irrelevant. A seed only contributes when pinned.
#[derive(Debug, Clone)]
pub struct FingerprintBuilder {
    capability: Capability,
    text: Vec<String>,
    fields: BTreeMap<String, String>,
    seed: Option<u64>,
}

impl FingerprintBuilder {
    pub fn new(capability: Capability) -> Self {
        Self {
            capability,
            text: Vec::new(),
            fields: BTreeMap::new(),
            seed: None,
        }
    }

    pub fn text(mut self, content: &str) -> Self {
        self.text.push(normalize_text(content));
        self
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Includes `seed` when it is pinned. Random per-call seeds must be
    /// passed as `None` so they never split the cache.
    pub fn pinned_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn build(self) -> Fingerprint {
        let canonical = Canonical {
            capability: self.capability.as_str(),
            text: &self.text,
            fields: &self.fields,
            seed: self.seed,
        };
        // Serializing plain strings and integers cannot fail.
        let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
        Fingerprint::digest(&bytes)
    }
}

fn hash_canonical(value: &Value, hasher: &mut Sha256) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_unstable_by(|left, right| left.0.cmp(right.0));
            hasher.update(b"{");
            for (position, (key, value)) in entries.into_iter().enumerate() {
                if position > 0 {
                    hasher.update(b",");
                }
                hasher.update(Value::from(key.as_str()).to_string().as_bytes());
                hasher.update(b":");
                hash_canonical(value, hasher);
            }
            hasher.update(b"}");
        }
        Value::Array(items) => {
            hasher.update(b"[");
            for (position, item) in items.iter().enumerate() {
                if position > 0 {
                    hasher.update(b",");
                }
                hash_canonical(item, hasher);
            }
            hasher.update(b"]");
        }
        scalar => hasher.update(scalar.to_string().as_bytes()),
    }
}

fn normalize_text(content: &str) -> String {
    content.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_order_does_not_change_the_fingerprint() {
        let first = Fingerprint::builder(Capability::ImageGeneration)
            .text("sunset over the bay")
            .field("style", "cinematic")
            .field("aspect", "16:9")
            .build();
        let second = Fingerprint::builder(Capability::ImageGeneration)
            .field("aspect", "16:9")
            .text("sunset over the bay")
            .field("style", "cinematic")
            .build();

        assert_eq!(first, second);
        assert_eq!(first.as_str().len(), 64);
    }

    #[test]
    fn whitespace_is_normalized() {
        let compact = Fingerprint::builder(Capability::TextAnalysis)
            .text("hook strength")
            .build();
        let padded = Fingerprint::builder(Capability::TextAnalysis)
            .text("  hook \n\t strength ")
            .build();

        assert_eq!(compact, padded);
    }

    #[test]
    fn pinned_seed_and_capability_split_the_key() {
        let base = Fingerprint::builder(Capability::ImageGeneration).text("cat");
        let unpinned = base.clone().pinned_seed(None).build();
        let pinned = base.clone().pinned_seed(Some(42)).build();
        let other_capability = Fingerprint::builder(Capability::TextAnalysis)
            .text("cat")
            .build();

        assert_eq!(unpinned, base.build());
        assert_ne!(unpinned, pinned);
        assert_ne!(unpinned, other_capability);
    }

    #[test]
    fn payload_fingerprint_sorts_keys_inside_arrays() {
        let mut first = serde_json::Map::new();
        first.insert(String::from("style"), Value::from("bold"));
        first.insert(String::from("aspect"), Value::from("16:9"));
        let mut second = serde_json::Map::new();
        second.insert(String::from("aspect"), Value::from("16:9"));
        second.insert(String::from("style"), Value::from("bold"));

        let left = serde_json::json!({ "variants": [Value::Object(first)] });
        let right = serde_json::json!({ "variants": [Value::Object(second)] });
        let other = serde_json::json!({ "variants": [{"aspect": "9:16", "style": "bold"}] });

        let fingerprint = |payload: &Payload| Fingerprint::of_payload(Capability::ImageGeneration, payload);
        assert_eq!(fingerprint(&left), fingerprint(&right));
        assert_ne!(fingerprint(&left), fingerprint(&other));
        assert_ne!(
            fingerprint(&left),
            Fingerprint::of_payload(Capability::TextAnalysis, &left)
        );
    }

    #[test]
    fn payload_fingerprint_ignores_key_order() {
        let left: Payload = serde_json::from_str(r#"{"a":1,"b":{"c":2,"d":3}}"#).expect("json");
        let right: Payload = serde_json::from_str(r#"{"b":{"d":3,"c":2},"a":1}"#).expect("json");

        assert_eq!(
            Fingerprint::of_payload(Capability::TextAnalysis, &left),
            Fingerprint::of_payload(Capability::TextAnalysis, &right)
        );
        assert_eq!(
            Fingerprint::of_payload(Capability::TextAnalysis, &left).short().len(),
            12
        );
    }
}
