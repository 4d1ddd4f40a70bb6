use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::models::delta::{ErrorCode, ErrorPhase, NormalizedDelta, NormalizedError};
use crate::models::metadata::MetadataPatch;
use crate::models::token_usage::TokenUsage;

use super::{
    ChatRequest, ContentPart, ProviderAdapter, ProviderError, RawChunk, RawProviderError,
    RemoteFile, Role,
};

/// Adapter for OpenAI-compatible chat-completions streams: snake_case SSE
/// chunks with `choices[].delta` and an optional reasoning channel.
pub struct OpenAiAdapter {
    #[allow(dead_code)]
    api_key: String,
}

impl OpenAiAdapter {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    delta: Option<Delta>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Delta {
    content: Option<String>,
    /// Reasoning channel used by several OpenAI-compatible backends.
    reasoning_content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Serialize)]
struct CompletionRequest {
    model: String,
    messages: Vec<WireMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[async_trait::async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn id(&self) -> &'static str {
        "openai"
    }

    fn build_request(&self, request: &ChatRequest) -> Result<serde_json::Value, ProviderError> {
        let mut messages = Vec::new();
        if let Some(system) = &request.config.system_instruction {
            messages.push(WireMessage {
                role: "system",
                content: system.clone(),
            });
        }
        for turn in &request.contents {
            let mut content = String::new();
            for part in &turn.parts {
                match part {
                    ContentPart::Text(text) => content.push_str(text),
                    // This adapter has no file channel; binary parts cannot be
                    // represented and the build fails deterministically.
                    ContentPart::InlineData { .. } | ContentPart::FileRef { .. } => {
                        return Err(ProviderError::BuildFailed(
                            "openai adapter does not support binary content parts".into(),
                        ));
                    }
                }
            }
            messages.push(WireMessage {
                role: match turn.role {
                    Role::User => "user",
                    Role::Model => "assistant",
                },
                content,
            });
        }

        let payload = CompletionRequest {
            model: request.model.clone(),
            messages,
            stream: request.streaming,
            temperature: request.config.temperature,
            top_p: request.config.top_p,
            max_tokens: request.config.max_output_tokens,
        };
        Ok(serde_json::to_value(payload)?)
    }

    fn parse_chunk(&self, raw: &RawChunk) -> Result<NormalizedDelta, ProviderError> {
        let chunk = ChatChunk::deserialize(raw)
            .map_err(|e| ProviderError::MalformedChunk(e.to_string()))?;

        let mut delta = NormalizedDelta::default();
        for choice in &chunk.choices {
            if let Some(d) = &choice.delta {
                if let Some(content) = &d.content {
                    delta
                        .delta_text
                        .get_or_insert_with(String::new)
                        .push_str(content);
                }
                if let Some(reasoning) = &d.reasoning_content {
                    delta
                        .thought_delta
                        .get_or_insert_with(String::new)
                        .push_str(reasoning);
                }
            }
            if let Some(reason) = &choice.finish_reason {
                delta.finish_reason = Some(reason.clone());
            }
        }

        if let Some(usage) = &chunk.usage {
            delta.metadata_patch = Some(MetadataPatch {
                usage: Some(TokenUsage::new(usage.prompt_tokens, usage.completion_tokens)),
                ..Default::default()
            });
        }
        Ok(delta)
    }

    fn normalize_error(&self, raw: &RawProviderError, phase: ErrorPhase) -> NormalizedError {
        let code = if phase == ErrorPhase::Parse {
            ErrorCode::Parse
        } else {
            match raw.status {
                Some(401) | Some(403) => ErrorCode::Auth,
                Some(429) => ErrorCode::RateLimited,
                Some(_) => ErrorCode::Provider,
                None => ErrorCode::Transport,
            }
        };
        NormalizedError::new(code, raw.message.clone(), raw.status, phase)
    }

    /// This backend has no attachment storage; callers keep payloads inline.
    async fn upload_attachment(
        &self,
        _name: &str,
        _mime_type: &str,
        _bytes: Vec<u8>,
        _progress: mpsc::UnboundedSender<u8>,
        _cancel: Arc<AtomicBool>,
    ) -> Result<RemoteFile, NormalizedError> {
        Err(NormalizedError::new(
            ErrorCode::Unsupported,
            "openai adapter does not support remote uploads",
            None,
            ErrorPhase::Upload,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{ContentTurn, RequestConfig};
    use serde_json::json;

    fn adapter() -> OpenAiAdapter {
        OpenAiAdapter::new("test-key")
    }

    #[test]
    fn test_parse_content_and_reasoning_channels() {
        let raw = json!({
            "choices": [{ "delta": { "content": "4", "reasoning_content": "adding" } }]
        });
        let delta = adapter().parse_chunk(&raw).unwrap();
        assert_eq!(delta.delta_text.as_deref(), Some("4"));
        assert_eq!(delta.thought_delta.as_deref(), Some("adding"));
    }

    #[test]
    fn test_parse_finish_and_usage() {
        let raw = json!({
            "choices": [{ "delta": {}, "finish_reason": "stop" }],
            "usage": { "prompt_tokens": 12, "completion_tokens": 4 }
        });
        let delta = adapter().parse_chunk(&raw).unwrap();
        assert_eq!(delta.finish_reason.as_deref(), Some("stop"));
        assert_eq!(delta.metadata_patch.unwrap().usage.unwrap().output_tokens, 4);
    }

    #[test]
    fn test_parse_malformed_chunk_errors() {
        assert!(matches!(
            adapter().parse_chunk(&json!(42)).unwrap_err(),
            ProviderError::MalformedChunk(_)
        ));
    }

    #[test]
    fn test_build_request_shape() {
        let request = ChatRequest {
            provider_id: "openai".into(),
            conversation_id: "conv-1".into(),
            request_id: "req-1".into(),
            model: "gpt-4o-mini".into(),
            contents: vec![ContentTurn {
                role: Role::User,
                parts: vec![ContentPart::Text("2+2?".into())],
            }],
            config: RequestConfig {
                system_instruction: Some("be brief".into()),
                temperature: Some(0.1),
                ..Default::default()
            },
            streaming: true,
        };
        let payload = adapter().build_request(&request).unwrap();

        assert_eq!(payload["model"], "gpt-4o-mini");
        assert_eq!(payload["stream"], true);
        assert_eq!(payload["messages"][0]["role"], "system");
        assert_eq!(payload["messages"][1]["role"], "user");
        assert_eq!(payload["temperature"], 0.1);
        // Unset sampling fields are omitted entirely.
        assert!(payload.get("top_p").is_none());
        assert!(payload.get("max_tokens").is_none());
    }

    #[test]
    fn test_build_request_rejects_binary_parts() {
        let request = ChatRequest {
            provider_id: "openai".into(),
            conversation_id: "conv-1".into(),
            request_id: "req-1".into(),
            model: "gpt-4o-mini".into(),
            contents: vec![ContentTurn {
                role: Role::User,
                parts: vec![ContentPart::InlineData {
                    mime_type: "image/png".into(),
                    bytes: vec![0u8; 4],
                }],
            }],
            config: RequestConfig::default(),
            streaming: true,
        };
        assert!(matches!(
            adapter().build_request(&request).unwrap_err(),
            ProviderError::BuildFailed(_)
        ));
    }

    #[tokio::test]
    async fn test_upload_is_unsupported() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = adapter()
            .upload_attachment("a.mp4", "video/mp4", vec![0u8; 4], tx, Arc::new(AtomicBool::new(false)))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Unsupported);
        assert!(!err.retryable);
    }
}
