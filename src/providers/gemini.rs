use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::models::attachment::{Attachment, AttachmentSource};
use crate::models::delta::{ErrorCode, ErrorPhase, NormalizedDelta, NormalizedError};
use crate::models::metadata::{GroundingSource, MetadataPatch, ThoughtSignature};
use crate::models::token_usage::TokenUsage;

use super::{
    ChatRequest, ContentPart, ProviderAdapter, ProviderError, RawChunk, RawProviderError,
    RemoteFile, Role,
};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Upload chunk granularity for the resumable protocol.
const UPLOAD_CHUNK_SIZE: usize = 1024 * 1024;

/// Adapter for the Gemini generate-content wire shape: camelCase chunks with
/// thought parts, inline data, grounding metadata, and thought signatures.
pub struct GeminiAdapter {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl GeminiAdapter {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

// ---- incoming chunk shape -------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
    grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    text: Option<String>,
    #[serde(default)]
    thought: bool,
    thought_signature: Option<String>,
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroundingMetadata {
    #[serde(default)]
    grounding_chunks: Vec<GroundingChunk>,
}

#[derive(Debug, Deserialize)]
struct GroundingChunk {
    web: Option<WebSource>,
}

#[derive(Debug, Deserialize)]
struct WebSource {
    uri: String,
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

// ---- outgoing request shape ----------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<WireContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<WireContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<WireGenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
}

#[derive(Serialize)]
struct WireContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<WirePart>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WirePart {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inline_data: Option<WireInlineData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    file_data: Option<WireFileData>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireInlineData {
    mime_type: String,
    data: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireFileData {
    file_uri: String,
    mime_type: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking_config: Option<WireThinkingConfig>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireThinkingConfig {
    include_thoughts: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireTool {
    google_search: WireGoogleSearch,
}

#[derive(Serialize)]
struct WireGoogleSearch {}

fn wire_part(part: &ContentPart) -> WirePart {
    match part {
        ContentPart::Text(text) => WirePart {
            text: Some(text.clone()),
            inline_data: None,
            file_data: None,
        },
        ContentPart::InlineData { mime_type, bytes } => WirePart {
            text: None,
            inline_data: Some(WireInlineData {
                mime_type: mime_type.clone(),
                data: BASE64.encode(bytes),
            }),
            file_data: None,
        },
        ContentPart::FileRef { uri, mime_type } => WirePart {
            text: None,
            inline_data: None,
            file_data: Some(WireFileData {
                file_uri: uri.clone(),
                mime_type: mime_type.clone(),
            }),
        },
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    file: UploadedFile,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadedFile {
    uri: String,
    expiration_time: Option<String>,
}

#[async_trait::async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn id(&self) -> &'static str {
        "gemini"
    }

    fn build_request(&self, request: &ChatRequest) -> Result<serde_json::Value, ProviderError> {
        let contents = request
            .contents
            .iter()
            .map(|turn| WireContent {
                role: Some(match turn.role {
                    Role::User => "user",
                    Role::Model => "model",
                }),
                parts: turn.parts.iter().map(wire_part).collect(),
            })
            .collect();

        let config = &request.config;
        let generation_config = if config.temperature.is_some()
            || config.top_p.is_some()
            || config.max_output_tokens.is_some()
            || config.thinking == Some(true)
        {
            Some(WireGenerationConfig {
                temperature: config.temperature,
                top_p: config.top_p,
                max_output_tokens: config.max_output_tokens,
                thinking_config: (config.thinking == Some(true))
                    .then_some(WireThinkingConfig { include_thoughts: true }),
            })
        } else {
            None
        };

        let payload = GenerateRequest {
            contents,
            system_instruction: config.system_instruction.as_ref().map(|text| WireContent {
                role: None,
                parts: vec![WirePart {
                    text: Some(text.clone()),
                    inline_data: None,
                    file_data: None,
                }],
            }),
            generation_config,
            tools: (config.web_search == Some(true)).then(|| {
                vec![WireTool {
                    google_search: WireGoogleSearch {},
                }]
            }),
        };

        Ok(serde_json::to_value(payload)?)
    }

    fn parse_chunk(&self, raw: &RawChunk) -> Result<NormalizedDelta, ProviderError> {
        let chunk = GenerateChunk::deserialize(raw)
            .map_err(|e| ProviderError::MalformedChunk(e.to_string()))?;

        let mut delta = NormalizedDelta::default();
        let mut patch = MetadataPatch::default();

        for candidate in &chunk.candidates {
            if let Some(content) = &candidate.content {
                for (part_index, part) in content.parts.iter().enumerate() {
                    if let Some(text) = &part.text {
                        // Thought and answer channels are disjoint.
                        if part.thought {
                            delta
                                .thought_delta
                                .get_or_insert_with(String::new)
                                .push_str(text);
                        } else {
                            delta
                                .delta_text
                                .get_or_insert_with(String::new)
                                .push_str(text);
                        }
                    }
                    if let Some(signature) = &part.thought_signature {
                        patch.thought_signatures.push(ThoughtSignature {
                            part_index,
                            signature: signature.clone(),
                        });
                    }
                    if let Some(inline) = &part.inline_data {
                        // Side-channel binary payloads decode to attachment
                        // records at parse time, not deferred.
                        let bytes = BASE64
                            .decode(&inline.data)
                            .map_err(|e| ProviderError::MalformedChunk(e.to_string()))?;
                        delta.new_attachments.push(Attachment::new_inline(
                            format!("generated-{part_index}"),
                            inline.mime_type.clone(),
                            bytes,
                            AttachmentSource::Model,
                        ));
                    }
                }
            }
            if let Some(reason) = &candidate.finish_reason {
                delta.finish_reason = Some(reason.clone());
            }
            if let Some(grounding) = &candidate.grounding_metadata {
                for chunk in &grounding.grounding_chunks {
                    if let Some(web) = &chunk.web {
                        patch.grounding_sources.push(GroundingSource {
                            uri: web.uri.clone(),
                            title: web.title.clone(),
                        });
                    }
                }
            }
        }

        if let Some(usage) = &chunk.usage_metadata {
            patch.usage = Some(TokenUsage::new(
                usage.prompt_token_count,
                usage.candidates_token_count,
            ));
        }

        if !patch.is_empty() {
            delta.metadata_patch = Some(patch);
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

    /// Resumable upload against the files API. Progress is reported as a
    /// percentage after each transferred chunk and only ever increases.
    async fn upload_attachment(
        &self,
        name: &str,
        mime_type: &str,
        bytes: Vec<u8>,
        progress: mpsc::UnboundedSender<u8>,
        cancel: Arc<AtomicBool>,
    ) -> Result<RemoteFile, NormalizedError> {
        let total = bytes.len();
        let start_url = format!("{}/upload/v1beta/files?key={}", self.base_url, self.api_key);

        let start = self
            .client
            .post(&start_url)
            .header("X-Goog-Upload-Protocol", "resumable")
            .header("X-Goog-Upload-Command", "start")
            .header("X-Goog-Upload-Header-Content-Length", total.to_string())
            .header("X-Goog-Upload-Header-Content-Type", mime_type)
            .json(&serde_json::json!({ "file": { "display_name": name } }))
            .send()
            .await
            .map_err(|e| self.http_error(e, ErrorPhase::Upload))?;

        if !start.status().is_success() {
            return Err(self.status_error(&start, "upload session rejected").await);
        }

        let upload_url = start
            .headers()
            .get("x-goog-upload-url")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                NormalizedError::new(
                    ErrorCode::Provider,
                    "upload session missing x-goog-upload-url",
                    Some(start.status().as_u16()),
                    ErrorPhase::Upload,
                )
            })?;

        let mut offset = 0usize;
        let mut finalize_response = None;
        let chunk_count = bytes.len().div_ceil(UPLOAD_CHUNK_SIZE).max(1);
        for (i, chunk) in bytes.chunks(UPLOAD_CHUNK_SIZE.max(1)).enumerate() {
            if cancel.load(Ordering::Relaxed) {
                debug!(name, "upload cancelled");
                return Err(NormalizedError::cancelled(ErrorPhase::Upload));
            }

            let is_last = i + 1 == chunk_count;
            let command = if is_last { "upload, finalize" } else { "upload" };
            let response = self
                .client
                .post(&upload_url)
                .header("X-Goog-Upload-Command", command)
                .header("X-Goog-Upload-Offset", offset.to_string())
                .body(chunk.to_vec())
                .send()
                .await
                .map_err(|e| self.http_error(e, ErrorPhase::Upload))?;

            if !response.status().is_success() {
                return Err(self.status_error(&response, "upload chunk rejected").await);
            }

            offset += chunk.len();
            let percent = ((offset * 100) / total.max(1)) as u8;
            let _ = progress.send(percent);

            if is_last {
                finalize_response = Some(response);
            }
        }

        let response = finalize_response.ok_or_else(|| {
            NormalizedError::new(
                ErrorCode::Provider,
                "empty upload payload",
                None,
                ErrorPhase::Upload,
            )
        })?;
        let uploaded: UploadResponse = response
            .json()
            .await
            .map_err(|e| self.http_error(e, ErrorPhase::Upload))?;

        let expires_at = uploaded
            .file
            .expiration_time
            .as_deref()
            .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.timestamp_millis());

        Ok(RemoteFile {
            uri: uploaded.file.uri,
            expires_at,
        })
    }
}

impl GeminiAdapter {
    fn http_error(&self, error: reqwest::Error, phase: ErrorPhase) -> NormalizedError {
        let status = error.status().map(|s| s.as_u16());
        self.normalize_error(
            &RawProviderError {
                status,
                message: error.to_string(),
            },
            phase,
        )
    }

    async fn status_error(&self, response: &reqwest::Response, context: &str) -> NormalizedError {
        let status = response.status().as_u16();
        self.normalize_error(
            &RawProviderError {
                status: Some(status),
                message: format!("{context} (HTTP {status})"),
            },
            ErrorPhase::Upload,
        )
    }
}
