use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::attachment::{Attachment, AttachmentSource};
use super::delta::{NormalizedDelta, NormalizedError};
use super::metadata::MessageMetadata;
use super::now_millis;

/// Gap between consecutive message sequence numbers, leaving room for
/// insertion between existing messages.
pub const SEQUENCE_STEP: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    User,
    Model,
}

impl Sender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sender::User => "user",
            Sender::Model => "model",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Sender::User),
            "model" => Some(Sender::Model),
            _ => None,
        }
    }
}

/// Message lifecycle. Moves forward only:
/// `Pending → Streaming → {Completed | Error | Cancelled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Streaming,
    Completed,
    Error,
    Cancelled,
}

impl MessageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MessageStatus::Completed | MessageStatus::Error | MessageStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Streaming => "streaming",
            MessageStatus::Completed => "completed",
            MessageStatus::Error => "error",
            MessageStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(MessageStatus::Pending),
            "streaming" => Some(MessageStatus::Streaming),
            "completed" => Some(MessageStatus::Completed),
            "error" => Some(MessageStatus::Error),
            "cancelled" => Some(MessageStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReducerError {
    /// A delta arrived for a message already in a terminal state. Protocol
    /// error on the transport side, dropped with a warning, never a crash.
    #[error("message {id} is terminal ({status:?}); mutation rejected")]
    Terminal { id: String, status: MessageStatus },

    #[error("invalid status transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: MessageStatus,
        to: MessageStatus,
    },
}

/// Answer-channel content. Append-only while streaming.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageContent {
    pub text: String,
}

/// Reasoning-channel content, kept separate from the answer text.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Thoughts {
    pub raw_text: String,
}

/// A single chat message. Mutated exclusively through the reducer methods
/// below; everything else sees it as an immutable snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender: Sender,
    pub sequence: i64,
    pub status: MessageStatus,
    pub content: MessageContent,
    pub thoughts: Thoughts,
    pub attachments: Vec<Attachment>,
    pub metadata: MessageMetadata,
    /// Correlates with the in-flight stream, when one exists.
    pub request_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Message {
    /// A finished user message (user turns never stream).
    pub fn user(
        conversation_id: impl Into<String>,
        sequence: i64,
        text: impl Into<String>,
        mut attachments: Vec<Attachment>,
    ) -> Self {
        let id = Uuid::new_v4().to_string();
        let now = now_millis();
        for (i, att) in attachments.iter_mut().enumerate() {
            att.message_id = Some(id.clone());
            att.order = i as u32;
        }
        Self {
            id,
            conversation_id: conversation_id.into(),
            sender: Sender::User,
            sequence,
            status: MessageStatus::Completed,
            content: MessageContent { text: text.into() },
            thoughts: Thoughts::default(),
            attachments,
            metadata: MessageMetadata::default(),
            request_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A model message awaiting its first delta.
    pub fn pending_model(
        conversation_id: impl Into<String>,
        sequence: i64,
        request_id: impl Into<String>,
    ) -> Self {
        let now = now_millis();
        Self {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            sender: Sender::Model,
            sequence,
            status: MessageStatus::Pending,
            content: MessageContent::default(),
            thoughts: Thoughts::default(),
            attachments: Vec::new(),
            metadata: MessageMetadata::default(),
            request_id: Some(request_id.into()),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the recorded failure supports a retry affordance. The signal
    /// comes solely from the normalized error's `retryable` flag.
    pub fn is_retryable_failure(&self) -> bool {
        self.status == MessageStatus::Error
            && self
                .metadata
                .error
                .as_ref()
                .map(|e| e.retryable)
                .unwrap_or(false)
    }

    /// Fold one normalized delta into the message. Purely additive: text and
    /// thoughts append, attachments extend (source forced to `Model`),
    /// metadata merges per-field. `Pending` moves to `Streaming` on the first
    /// delta. Re-applying the same delta is NOT idempotent; at-most-once
    /// delivery per delta is the transport boundary's contract; the only
    /// reducer-side defense is the metadata-array dedup.
    ///
    /// `finish_reason` is recorded but does not transition the status; the
    /// stream driver calls `finalize` when it sees one.
    pub fn apply_delta(&mut self, delta: NormalizedDelta) -> Result<(), ReducerError> {
        if self.status.is_terminal() {
            return Err(ReducerError::Terminal {
                id: self.id.clone(),
                status: self.status,
            });
        }
        if self.status == MessageStatus::Pending {
            self.status = MessageStatus::Streaming;
        }

        if let Some(text) = delta.delta_text {
            self.content.text.push_str(&text);
        }
        if let Some(thought) = delta.thought_delta {
            self.thoughts.raw_text.push_str(&thought);
        }
        for mut attachment in delta.new_attachments {
            attachment.source = AttachmentSource::Model;
            attachment.message_id = Some(self.id.clone());
            attachment.order = self.attachments.len() as u32;
            self.attachments.push(attachment);
        }
        if let Some(patch) = delta.metadata_patch {
            self.metadata.merge(patch);
        }
        if let Some(reason) = delta.finish_reason {
            self.metadata.finish_reason = Some(reason);
        }

        self.updated_at = now_millis();
        Ok(())
    }

    /// Terminal transition to `Completed`. Freezes `updated_at`.
    pub fn finalize(&mut self, finish_reason: Option<String>) -> Result<(), ReducerError> {
        self.transition(MessageStatus::Completed)?;
        if let Some(reason) = finish_reason {
            self.metadata.finish_reason = Some(reason);
        }
        self.updated_at = now_millis();
        Ok(())
    }

    /// Terminal transition to `Error`, recording the normalized error in
    /// metadata so it renders attached to this message.
    pub fn fail(&mut self, error: NormalizedError) -> Result<(), ReducerError> {
        self.transition(MessageStatus::Error)?;
        self.metadata.error = Some(error);
        self.updated_at = now_millis();
        Ok(())
    }

    /// Terminal transition to `Cancelled`. Valid only from `Pending` or
    /// `Streaming`.
    pub fn cancel(&mut self) -> Result<(), ReducerError> {
        self.transition(MessageStatus::Cancelled)?;
        self.updated_at = now_millis();
        Ok(())
    }

    fn transition(&mut self, to: MessageStatus) -> Result<(), ReducerError> {
        if self.status.is_terminal() {
            return Err(ReducerError::Terminal {
                id: self.id.clone(),
                status: self.status,
            });
        }
        match (self.status, to) {
            (MessageStatus::Pending | MessageStatus::Streaming, s) if s.is_terminal() => {
                self.status = s;
                Ok(())
            }
            (from, to) => Err(ReducerError::InvalidTransition { from, to }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::metadata::{MetadataPatch, ThoughtSignature};
    use crate::models::delta::{ErrorCode, ErrorPhase};

    fn text_delta(text: &str) -> NormalizedDelta {
        NormalizedDelta {
            delta_text: Some(text.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_first_delta_moves_pending_to_streaming() {
        let mut msg = Message::pending_model("conv-1", 10, "req-1");
        assert_eq!(msg.status, MessageStatus::Pending);

        msg.apply_delta(text_delta("Hi")).unwrap();
        assert_eq!(msg.status, MessageStatus::Streaming);

        // Never reverts.
        msg.apply_delta(text_delta(" there")).unwrap();
        assert_eq!(msg.status, MessageStatus::Streaming);
    }

    #[test]
    fn test_reassembly_invariance() {
        // Any split of a string into deltas, applied in order, reproduces it.
        let original = "Hello, world";
        for split_at in 0..=original.len() {
            let (a, b) = original.split_at(split_at);
            let mut msg = Message::pending_model("conv-1", 10, "req-1");
            for part in [a, b] {
                if !part.is_empty() {
                    msg.apply_delta(text_delta(part)).unwrap();
                }
            }
            assert_eq!(msg.content.text, original);
        }
    }

    #[test]
    fn test_thought_channel_is_disjoint_from_answer() {
        let mut msg = Message::pending_model("conv-1", 10, "req-1");
        msg.apply_delta(NormalizedDelta {
            thought_delta: Some("considering...".into()),
            ..Default::default()
        })
        .unwrap();
        msg.apply_delta(text_delta("42")).unwrap();

        assert_eq!(msg.content.text, "42");
        assert_eq!(msg.thoughts.raw_text, "considering...");
    }

    #[test]
    fn test_finalize_freezes_content() {
        let mut msg = Message::pending_model("conv-1", 10, "req-1");
        msg.apply_delta(text_delta("4")).unwrap();
        msg.finalize(Some("STOP".into())).unwrap();

        assert_eq!(msg.status, MessageStatus::Completed);
        let err = msg.apply_delta(text_delta("5")).unwrap_err();
        assert!(matches!(err, ReducerError::Terminal { .. }));
        assert_eq!(msg.content.text, "4");
    }

    #[test]
    fn test_status_only_moves_forward() {
        let mut msg = Message::pending_model("conv-1", 10, "req-1");
        msg.cancel().unwrap();
        assert_eq!(msg.status, MessageStatus::Cancelled);

        assert!(msg.finalize(None).is_err());
        assert!(msg.cancel().is_err());
        assert!(
            msg.fail(NormalizedError::new(
                ErrorCode::Transport,
                "late",
                None,
                ErrorPhase::Stream
            ))
            .is_err()
        );
    }

    #[test]
    fn test_model_attachments_get_model_source() {
        let mut msg = Message::pending_model("conv-1", 10, "req-1");
        let att = crate::models::attachment::Attachment::new_inline(
            "gen.png",
            "image/png",
            vec![1, 2, 3],
            AttachmentSource::User, // adapter bug; reducer must force Model
        );
        msg.apply_delta(NormalizedDelta {
            new_attachments: vec![att],
            ..Default::default()
        })
        .unwrap();

        assert_eq!(msg.attachments.len(), 1);
        assert_eq!(msg.attachments[0].source, AttachmentSource::Model);
        assert_eq!(msg.attachments[0].message_id.as_deref(), Some(msg.id.as_str()));
    }

    #[test]
    fn test_signature_dedup_survives_replay() {
        let mut msg = Message::pending_model("conv-1", 10, "req-1");
        let patch = || MetadataPatch {
            thought_signatures: vec![ThoughtSignature {
                part_index: 0,
                signature: "sig-a".into(),
            }],
            ..Default::default()
        };
        msg.apply_delta(NormalizedDelta {
            metadata_patch: Some(patch()),
            ..Default::default()
        })
        .unwrap();
        msg.apply_delta(NormalizedDelta {
            metadata_patch: Some(patch()),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(msg.metadata.thought_signatures.len(), 1);
    }

    #[test]
    fn test_retry_affordance_follows_retryable_flag() {
        let mut msg = Message::pending_model("conv-1", 10, "req-1");
        msg.fail(NormalizedError::new(
            ErrorCode::Transport,
            "boom",
            Some(503),
            ErrorPhase::Stream,
        ))
        .unwrap();
        assert!(msg.is_retryable_failure());

        let mut msg = Message::pending_model("conv-1", 20, "req-2");
        msg.fail(NormalizedError::new(
            ErrorCode::Parse,
            "garbage",
            None,
            ErrorPhase::Parse,
        ))
        .unwrap();
        assert!(!msg.is_retryable_failure());
    }
}
