use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::delta::NormalizedError;
use super::token_usage::TokenUsage;

/// Provider-supplied citation attached to a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroundingSource {
    pub uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Opaque provider token tagging a reasoning segment. Deduplicated by the
/// composite key `(part_index, signature)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThoughtSignature {
    pub part_index: usize,
    pub signature: String,
}

/// Typed message metadata. The merge strategy is explicit per field: scalars
/// replace, the two array fields concatenate with dedup, unknown keys land in
/// `extra` with last-write-wins. Nothing is inferred from a value's shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub grounding_sources: Vec<GroundingSource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub thought_signatures: Vec<ThoughtSignature>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<NormalizedError>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Partial metadata carried by a single delta.
#[derive(Debug, Clone, Default)]
pub struct MetadataPatch {
    pub usage: Option<TokenUsage>,
    pub finish_reason: Option<String>,
    pub grounding_sources: Vec<GroundingSource>,
    pub thought_signatures: Vec<ThoughtSignature>,
    pub extra: HashMap<String, serde_json::Value>,
}

impl MetadataPatch {
    pub fn is_empty(&self) -> bool {
        self.usage.is_none()
            && self.finish_reason.is_none()
            && self.grounding_sources.is_empty()
            && self.thought_signatures.is_empty()
            && self.extra.is_empty()
    }
}

impl MessageMetadata {
    /// Fold a patch in. Later scalar values win; `grounding_sources` dedups
    /// by uri, `thought_signatures` by `(part_index, signature)`.
    pub fn merge(&mut self, patch: MetadataPatch) {
        if let Some(usage) = patch.usage {
            self.usage = Some(usage);
        }
        if let Some(reason) = patch.finish_reason {
            self.finish_reason = Some(reason);
        }
        for source in patch.grounding_sources {
            if !self.grounding_sources.iter().any(|s| s.uri == source.uri) {
                self.grounding_sources.push(source);
            }
        }
        for sig in patch.thought_signatures {
            let seen = self
                .thought_signatures
                .iter()
                .any(|s| s.part_index == sig.part_index && s.signature == sig.signature);
            if !seen {
                self.thought_signatures.push(sig);
            }
        }
        for (key, value) in patch.extra {
            self.extra.insert(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(part_index: usize, signature: &str) -> ThoughtSignature {
        ThoughtSignature {
            part_index,
            signature: signature.to_string(),
        }
    }

    #[test]
    fn test_scalar_fields_replace() {
        let mut meta = MessageMetadata::default();
        meta.merge(MetadataPatch {
            usage: Some(TokenUsage::new(10, 5)),
            finish_reason: Some("STOP".into()),
            ..Default::default()
        });
        meta.merge(MetadataPatch {
            usage: Some(TokenUsage::new(20, 15)),
            ..Default::default()
        });

        assert_eq!(meta.usage.as_ref().unwrap().input_tokens, 20);
        assert_eq!(meta.finish_reason.as_deref(), Some("STOP"));
    }

    #[test]
    fn test_thought_signatures_dedup_by_composite_key() {
        let mut meta = MessageMetadata::default();
        meta.merge(MetadataPatch {
            thought_signatures: vec![sig(0, "abc")],
            ..Default::default()
        });
        // Same (part_index, signature) pair arrives again; at-least-once
        // transport can replay metadata.
        meta.merge(MetadataPatch {
            thought_signatures: vec![sig(0, "abc"), sig(1, "abc"), sig(0, "def")],
            ..Default::default()
        });

        assert_eq!(meta.thought_signatures.len(), 3);
        assert_eq!(meta.thought_signatures[0], sig(0, "abc"));
    }

    #[test]
    fn test_grounding_sources_dedup_by_uri() {
        let mut meta = MessageMetadata::default();
        let source = GroundingSource {
            uri: "https://example.com/a".into(),
            title: Some("A".into()),
        };
        meta.merge(MetadataPatch {
            grounding_sources: vec![source.clone()],
            ..Default::default()
        });
        meta.merge(MetadataPatch {
            grounding_sources: vec![source],
            ..Default::default()
        });

        assert_eq!(meta.grounding_sources.len(), 1);
    }

    #[test]
    fn test_extra_keys_last_write_wins() {
        let mut meta = MessageMetadata::default();
        let mut extra = HashMap::new();
        extra.insert("model_version".to_string(), serde_json::json!("v1"));
        meta.merge(MetadataPatch {
            extra,
            ..Default::default()
        });

        let mut extra = HashMap::new();
        extra.insert("model_version".to_string(), serde_json::json!("v2"));
        meta.merge(MetadataPatch {
            extra,
            ..Default::default()
        });

        assert_eq!(meta.extra["model_version"], serde_json::json!("v2"));
    }
}
