use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::attachment::Attachment;
use super::metadata::MetadataPatch;

/// One incremental unit of provider output, normalized into the canonical
/// envelope every adapter produces. Ephemeral: folded into a `Message` and
/// never persisted.
#[derive(Debug, Clone, Default)]
pub struct NormalizedDelta {
    /// Answer-channel text to append.
    pub delta_text: Option<String>,
    /// Reasoning-channel text to append. Disjoint from `delta_text`.
    pub thought_delta: Option<String>,
    /// Model-generated attachments decoded at parse time (e.g. inline images).
    pub new_attachments: Vec<Attachment>,
    /// Metadata to merge (usage, grounding, thought signatures, …).
    pub metadata_patch: Option<MetadataPatch>,
    /// Terminal signal from the provider, if this chunk carries one.
    pub finish_reason: Option<String>,
}

impl NormalizedDelta {
    /// True when the chunk carried nothing worth folding.
    pub fn is_empty(&self) -> bool {
        self.delta_text.is_none()
            && self.thought_delta.is_none()
            && self.new_attachments.is_empty()
            && self.metadata_patch.is_none()
            && self.finish_reason.is_none()
    }
}

/// Where in the request lifecycle an error surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPhase {
    Build,
    Parse,
    Stream,
    Upload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Malformed chunk. Terminal for the message, never retryable.
    Parse,
    /// Connection drop or 5xx from the transport.
    Transport,
    /// Provider-side failure reported in-band.
    Provider,
    /// Missing or rejected credentials.
    Auth,
    /// 429 from the provider.
    RateLimited,
    /// Operation the provider does not support (e.g. remote uploads).
    Unsupported,
    /// Cooperatively cancelled by the user.
    Cancelled,
}

/// Canonical provider error. `retryable` is derived once, here, from the
/// status class; client code must not re-derive it elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{message}")]
pub struct NormalizedError {
    pub code: ErrorCode,
    pub message: String,
    /// HTTP status, when the failure had one.
    pub status: Option<u16>,
    pub phase: ErrorPhase,
    pub retryable: bool,
}

impl NormalizedError {
    /// Build an error with retryability derived from the status class:
    /// ≥500 (or a statusless transport drop) is retryable, everything else
    /// is not.
    pub fn new(
        code: ErrorCode,
        message: impl Into<String>,
        status: Option<u16>,
        phase: ErrorPhase,
    ) -> Self {
        let retryable = match code {
            ErrorCode::Parse | ErrorCode::Auth | ErrorCode::Unsupported | ErrorCode::Cancelled => {
                false
            }
            ErrorCode::Transport => status.map(|s| s >= 500).unwrap_or(true),
            ErrorCode::Provider | ErrorCode::RateLimited => {
                status.map(|s| s >= 500).unwrap_or(false)
            }
        };
        Self {
            code,
            message: message.into(),
            status,
            phase,
            retryable,
        }
    }

    /// The deterministic downgrade applied to messages found mid-stream with
    /// no live handle (crash or reload during generation).
    pub fn interrupted() -> Self {
        Self::new(
            ErrorCode::Transport,
            "stream interrupted",
            None,
            ErrorPhase::Stream,
        )
    }

    pub fn cancelled(phase: ErrorPhase) -> Self {
        Self::new(ErrorCode::Cancelled, "cancelled", None, phase)
    }
}
