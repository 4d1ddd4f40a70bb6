pub mod gemini;
pub mod openai;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::models::delta::{ErrorPhase, NormalizedDelta, NormalizedError};
use crate::models::message::{Message, Sender};

pub use gemini::GeminiAdapter;
pub use openai::OpenAiAdapter;

/// Raw provider chunks arrive as provider-shaped JSON; the adapter is the
/// only component that understands the shape.
pub type RawChunk = serde_json::Value;

/// Error surfaced by the transport before normalization.
#[derive(Debug, Clone)]
pub struct RawProviderError {
    pub status: Option<u16>,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("malformed chunk: {0}")]
    MalformedChunk(String),

    #[error("failed to build request: {0}")]
    BuildFailed(String),

    #[error("unknown provider id: {0}")]
    UnknownProvider(String),

    #[error("provider id already registered: {0}")]
    DuplicateProvider(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Model,
}

/// One part of a content turn in the outgoing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentPart {
    Text(String),
    InlineData { mime_type: String, bytes: Vec<u8> },
    FileRef { uri: String, mime_type: String },
}

#[derive(Debug, Clone)]
pub struct ContentTurn {
    pub role: Role,
    pub parts: Vec<ContentPart>,
}

impl ContentTurn {
    /// Project a message into a request turn. Failed attachments are
    /// excluded; remote attachments become file references, local ones are
    /// inlined.
    pub fn from_message(message: &Message) -> Self {
        let role = match message.sender {
            Sender::User => Role::User,
            Sender::Model => Role::Model,
        };
        let mut parts = Vec::new();
        if !message.content.text.is_empty() {
            parts.push(ContentPart::Text(message.content.text.clone()));
        }
        for attachment in &message.attachments {
            if attachment.is_failed() {
                continue;
            }
            if let Some(uri) = attachment.remote_uri() {
                parts.push(ContentPart::FileRef {
                    uri: uri.to_string(),
                    mime_type: attachment.mime_type.clone(),
                });
            } else if let Some(bytes) = attachment.local_bytes() {
                parts.push(ContentPart::InlineData {
                    mime_type: attachment.mime_type.clone(),
                    bytes: bytes.to_vec(),
                });
            }
        }
        Self { role, parts }
    }
}

/// Generic request configuration. Unset fields are omitted from provider
/// payloads, never serialized as null, so provider defaults stay in force.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    /// Include the reasoning channel in responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<bool>,
    /// Web-search grounding tool toggle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_search: Option<bool>,
}

/// Provider-agnostic request envelope.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub provider_id: String,
    pub conversation_id: String,
    pub request_id: String,
    pub model: String,
    pub contents: Vec<ContentTurn>,
    pub config: RequestConfig,
    pub streaming: bool,
}

/// Handle to a remotely stored file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub uri: String,
    /// Unix millis after which the provider may garbage-collect the file.
    pub expires_at: Option<i64>,
}

/// Presentation badges derived from message + config. Pure projections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayIndicator {
    Thinking,
    WebSearch,
    Grounded(usize),
    Attachments(usize),
}

/// The capability interface every provider implements. One implementation
/// per provider id, resolved through the registry at configuration time.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn id(&self) -> &'static str;

    /// Deterministically map the generic envelope into the provider's
    /// payload shape.
    fn build_request(&self, request: &ChatRequest) -> Result<serde_json::Value, ProviderError>;

    /// Pure function from one raw chunk to the canonical delta. No state is
    /// carried across calls; cross-chunk dedup is the metadata merge's job.
    fn parse_chunk(&self, raw: &RawChunk) -> Result<NormalizedDelta, ProviderError>;

    /// The single place retryability is derived (from the status class).
    fn normalize_error(&self, raw: &RawProviderError, phase: ErrorPhase) -> NormalizedError;

    /// Upload a file to the provider's storage, reporting percentage
    /// progress over the channel. Cancellation is cooperative via the flag.
    async fn upload_attachment(
        &self,
        name: &str,
        mime_type: &str,
        bytes: Vec<u8>,
        progress: mpsc::UnboundedSender<u8>,
        cancel: Arc<AtomicBool>,
    ) -> Result<RemoteFile, NormalizedError>;

    /// Pure projection of (message, config) into presentation badges.
    fn display_indicators(&self, message: &Message, config: &RequestConfig) -> Vec<DisplayIndicator> {
        let mut indicators = Vec::new();
        if config.thinking == Some(true) {
            indicators.push(DisplayIndicator::Thinking);
        }
        if config.web_search == Some(true) {
            indicators.push(DisplayIndicator::WebSearch);
        }
        if !message.metadata.grounding_sources.is_empty() {
            indicators.push(DisplayIndicator::Grounded(
                message.metadata.grounding_sources.len(),
            ));
        }
        if !message.attachments.is_empty() {
            indicators.push(DisplayIndicator::Attachments(message.attachments.len()));
        }
        indicators
    }

    /// Pure projection of response metadata into a short human summary.
    fn metadata_summary(&self, message: &Message) -> Option<String> {
        let usage = message.metadata.usage.as_ref()?;
        let mut summary = format!(
            "{} in / {} out tokens",
            usage.input_tokens, usage.output_tokens
        );
        if let Some(reason) = &message.metadata.finish_reason {
            summary.push_str(&format!(" · {reason}"));
        }
        Some(summary)
    }
}

/// Maps a provider id to exactly one adapter, resolved at configuration
/// time, never duck-typed at call time.
#[derive(Default)]
pub struct ProviderRegistry {
    adapters: HashMap<&'static str, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) -> Result<(), ProviderError> {
        let id = adapter.id();
        if self.adapters.contains_key(id) {
            return Err(ProviderError::DuplicateProvider(id.to_string()));
        }
        self.adapters.insert(id, adapter);
        Ok(())
    }

    pub fn resolve(&self, provider_id: &str) -> Result<Arc<dyn ProviderAdapter>, ProviderError> {
        self.adapters
            .get(provider_id)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownProvider(provider_id.to_string()))
    }

    pub fn ids(&self) -> Vec<&'static str> {
        self.adapters.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::attachment::{Attachment, AttachmentSource};

    #[test]
    fn test_registry_rejects_duplicate_ids() {
        let mut registry = ProviderRegistry::new();
        registry
            .register(Arc::new(GeminiAdapter::new("key")))
            .unwrap();

        let err = registry
            .register(Arc::new(GeminiAdapter::new("other-key")))
            .unwrap_err();
        assert!(matches!(err, ProviderError::DuplicateProvider(_)));
    }

    #[test]
    fn test_registry_resolves_by_id() {
        let mut registry = ProviderRegistry::new();
        registry
            .register(Arc::new(GeminiAdapter::new("key")))
            .unwrap();
        registry.register(Arc::new(OpenAiAdapter::new("key"))).unwrap();

        assert_eq!(registry.resolve("gemini").unwrap().id(), "gemini");
        assert_eq!(registry.resolve("openai").unwrap().id(), "openai");
        assert!(matches!(
            registry.resolve("nope").unwrap_err(),
            ProviderError::UnknownProvider(_)
        ));
    }

    #[test]
    fn test_display_indicators_project_message_and_config() {
        use crate::models::metadata::GroundingSource;
        use crate::models::token_usage::TokenUsage;

        let adapter = GeminiAdapter::new("key");
        let mut message = Message::pending_model("conv-1", 10, "req-1");
        message.metadata.grounding_sources = vec![GroundingSource {
            uri: "https://example.com".into(),
            title: None,
        }];
        message.metadata.usage = Some(TokenUsage::new(12, 7));
        message.metadata.finish_reason = Some("STOP".into());

        let config = RequestConfig {
            thinking: Some(true),
            ..Default::default()
        };
        let indicators = adapter.display_indicators(&message, &config);
        assert!(indicators.contains(&DisplayIndicator::Thinking));
        assert!(indicators.contains(&DisplayIndicator::Grounded(1)));
        assert!(!indicators.contains(&DisplayIndicator::WebSearch));

        let summary = adapter.metadata_summary(&message).unwrap();
        assert!(summary.contains("12 in / 7 out"));
        assert!(summary.contains("STOP"));

        // Pure projections: same inputs, same outputs.
        assert_eq!(indicators, adapter.display_indicators(&message, &config));
    }

    #[test]
    fn test_turn_projection_excludes_failed_attachments() {
        let mut message = Message::user("conv-1", 10, "look at this", vec![]);
        let mut good = Attachment::new_inline("a.txt", "text/plain", b"ok".to_vec(), AttachmentSource::User);
        good.message_id = Some(message.id.clone());
        let mut bad = good.clone();
        bad.mark_failed("upload failed");
        message.attachments = vec![good, bad];

        let turn = ContentTurn::from_message(&message);
        assert_eq!(turn.parts.len(), 2); // text + one surviving attachment
        assert!(matches!(turn.parts[0], ContentPart::Text(_)));
        assert!(matches!(turn.parts[1], ContentPart::InlineData { .. }));
    }

    #[test]
    fn test_turn_projection_prefers_remote_uri() {
        let mut message = Message::user("conv-1", 10, "", vec![]);
        let mut att = Attachment::new_pending_upload("clip.mp4", "video/mp4", vec![0u8; 8]);
        att.promote_to_remote("files/xyz", None);
        message.attachments = vec![att];

        let turn = ContentTurn::from_message(&message);
        assert_eq!(
            turn.parts,
            vec![ContentPart::FileRef {
                uri: "files/xyz".to_string(),
                mime_type: "video/mp4".to_string(),
            }]
        );
    }
}
