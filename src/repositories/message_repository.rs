use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use super::error::{RepositoryError, RepositoryResult};
use crate::models::attachment::{Attachment, AttachmentPayload, AttachmentSource};
use crate::models::message::{Message, MessageContent, MessageStatus, Sender, Thoughts};
use crate::models::metadata::MessageMetadata;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Serializable message snapshot. Attachment rows are stored separately
/// (indexed by message) and rejoined on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub conversation_id: String,
    pub sender: Sender,
    pub sequence: i64,
    pub status: MessageStatus,
    pub content_text: String,
    pub thoughts_text: String,
    /// JSON-serialized MessageMetadata
    pub metadata: String,
    pub request_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl MessageRecord {
    pub fn from_message(message: &Message) -> RepositoryResult<Self> {
        Ok(Self {
            id: message.id.clone(),
            conversation_id: message.conversation_id.clone(),
            sender: message.sender,
            sequence: message.sequence,
            status: message.status,
            content_text: message.content.text.clone(),
            thoughts_text: message.thoughts.raw_text.clone(),
            metadata: serde_json::to_string(&message.metadata)?,
            request_id: message.request_id.clone(),
            created_at: message.created_at,
            updated_at: message.updated_at,
        })
    }

    pub fn parse_metadata(&self) -> RepositoryResult<MessageMetadata> {
        Ok(serde_json::from_str(&self.metadata)?)
    }

    pub fn into_message(self, attachments: Vec<Attachment>) -> RepositoryResult<Message> {
        let metadata = serde_json::from_str(&self.metadata)?;
        Ok(Message {
            id: self.id,
            conversation_id: self.conversation_id,
            sender: self.sender,
            sequence: self.sequence,
            status: self.status,
            content: MessageContent {
                text: self.content_text,
            },
            thoughts: Thoughts {
                raw_text: self.thoughts_text,
            },
            attachments,
            metadata,
            request_id: self.request_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Serializable attachment row. Local payload bytes travel in `data`; remote
/// attachments persist only the URI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentRecord {
    pub id: String,
    pub message_id: String,
    pub name: String,
    pub mime_type: String,
    pub size: i64,
    pub source: AttachmentSource,
    pub remote_uri: Option<String>,
    pub expires_at: Option<i64>,
    pub data: Option<Vec<u8>>,
    pub upload_progress: i64,
    pub error: Option<String>,
    pub order_index: i64,
}

impl AttachmentRecord {
    pub fn from_attachment(attachment: &Attachment) -> RepositoryResult<Self> {
        let message_id = attachment.message_id.clone().ok_or_else(|| {
            RepositoryError::InvalidData {
                message: format!("attachment {} has no owning message", attachment.id),
            }
        })?;
        let (remote_uri, expires_at, data) = match &attachment.payload {
            AttachmentPayload::Local { bytes } => (None, None, Some(bytes.clone())),
            AttachmentPayload::Remote { uri, expires_at } => {
                (Some(uri.clone()), *expires_at, None)
            }
        };
        Ok(Self {
            id: attachment.id.clone(),
            message_id,
            name: attachment.name.clone(),
            mime_type: attachment.mime_type.clone(),
            size: attachment.size as i64,
            source: attachment.source,
            remote_uri,
            expires_at,
            data,
            upload_progress: attachment.upload_progress as i64,
            error: attachment.error.clone(),
            order_index: attachment.order as i64,
        })
    }

    pub fn into_attachment(self) -> Attachment {
        let payload = match (self.remote_uri, self.data) {
            (Some(uri), _) => AttachmentPayload::Remote {
                uri,
                expires_at: self.expires_at,
            },
            (None, Some(bytes)) => AttachmentPayload::Local { bytes },
            (None, None) => AttachmentPayload::Local { bytes: Vec::new() },
        };
        Attachment {
            id: self.id,
            message_id: Some(self.message_id),
            name: self.name,
            mime_type: self.mime_type,
            size: self.size as u64,
            source: self.source,
            payload,
            upload_progress: self.upload_progress.clamp(0, 100) as u8,
            error: self.error,
            order: self.order_index.max(0) as u32,
        }
    }
}

/// Lightweight conversation summary for sidebar-style listings.
/// Loaded without deserializing message content.
#[derive(Debug, Clone)]
pub struct ConversationSummary {
    pub conversation_id: String,
    pub message_count: i64,
    pub last_updated_at: i64,
}

/// Repository trait for message persistence.
///
/// The store is a capability: typed methods stand in for the index queries
/// the engine needs (by chat, by chat + sequence order, attachments by
/// message).
pub trait MessageRepository: Send + Sync + 'static {
    /// Load one message snapshot by id.
    fn load_one(&self, id: &str) -> BoxFuture<'static, RepositoryResult<Option<MessageRecord>>>;

    /// Load all messages of a conversation, ordered by sequence.
    fn load_conversation(
        &self,
        conversation_id: &str,
    ) -> BoxFuture<'static, RepositoryResult<Vec<MessageRecord>>>;

    /// Load the attachment rows of one message, ordered by position.
    fn load_attachments(
        &self,
        message_id: &str,
    ) -> BoxFuture<'static, RepositoryResult<Vec<AttachmentRecord>>>;

    /// Load per-conversation summaries, most recent first.
    fn load_summaries(&self) -> BoxFuture<'static, RepositoryResult<Vec<ConversationSummary>>>;

    /// Upsert a message snapshot.
    fn save(&self, record: MessageRecord) -> BoxFuture<'static, RepositoryResult<()>>;

    /// Replace the attachment rows of a message.
    fn save_attachments(
        &self,
        message_id: &str,
        records: Vec<AttachmentRecord>,
    ) -> BoxFuture<'static, RepositoryResult<()>>;

    /// Delete a message and its attachments.
    fn delete(&self, id: &str) -> BoxFuture<'static, RepositoryResult<()>>;
}
