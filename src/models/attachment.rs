use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentSource {
    User,
    Model,
}

/// Exactly one variant is authoritative at any time. The transition is
/// one-way: `Local` becomes `Remote` on successful upload, and the local
/// bytes are discarded with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentPayload {
    Local { bytes: Vec<u8> },
    Remote { uri: String, expires_at: Option<i64> },
}

/// A validated file attached to a composition or message.
///
/// `upload_progress < 100` with no `error` means an upload is still in
/// flight. A set `error` is terminal for the attachment (it is excluded from
/// outgoing requests) until the user removes or retries it explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    /// None while the attachment is still in composition (pre-send).
    pub message_id: Option<String>,
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    pub source: AttachmentSource,
    pub payload: AttachmentPayload,
    pub upload_progress: u8,
    pub error: Option<String>,
    /// Stable position within the owning collection.
    pub order: u32,
}

impl Attachment {
    /// An attachment that lives inline. No remote upload needed, so it is
    /// immediately fully available.
    pub fn new_inline(
        name: impl Into<String>,
        mime_type: impl Into<String>,
        bytes: Vec<u8>,
        source: AttachmentSource,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_id: None,
            name: name.into(),
            mime_type: mime_type.into(),
            size: bytes.len() as u64,
            source,
            payload: AttachmentPayload::Local { bytes },
            upload_progress: 100,
            error: None,
            order: 0,
        }
    }

    /// An attachment that must be uploaded to remote storage before use.
    pub fn new_pending_upload(
        name: impl Into<String>,
        mime_type: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        let mut attachment = Self::new_inline(name, mime_type, bytes, AttachmentSource::User);
        attachment.upload_progress = 0;
        attachment
    }

    pub fn local_bytes(&self) -> Option<&[u8]> {
        match &self.payload {
            AttachmentPayload::Local { bytes } => Some(bytes),
            AttachmentPayload::Remote { .. } => None,
        }
    }

    pub fn remote_uri(&self) -> Option<&str> {
        match &self.payload {
            AttachmentPayload::Remote { uri, .. } => Some(uri),
            AttachmentPayload::Local { .. } => None,
        }
    }

    /// Swap the local payload for the remote handle. The local bytes are
    /// dropped here; after this call the remote URI is the only copy.
    pub fn promote_to_remote(&mut self, uri: impl Into<String>, expires_at: Option<i64>) {
        self.payload = AttachmentPayload::Remote {
            uri: uri.into(),
            expires_at,
        };
        self.upload_progress = 100;
        self.error = None;
    }

    /// Record a terminal upload failure. Progress resets to 0; the record
    /// stays in the bucket until the user removes or retries it.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.upload_progress = 0;
    }

    pub fn is_in_flight(&self) -> bool {
        self.upload_progress < 100 && self.error.is_none()
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }

    /// Byte-level defensive copy, detached from any owning message. This is
    /// the single copy contract used when restoring drafts: payload bytes are
    /// duplicated explicitly rather than shared.
    pub fn clone_detached(&self) -> Self {
        let payload = match &self.payload {
            AttachmentPayload::Local { bytes } => AttachmentPayload::Local {
                bytes: bytes.as_slice().to_vec(),
            },
            AttachmentPayload::Remote { uri, expires_at } => AttachmentPayload::Remote {
                uri: uri.clone(),
                expires_at: *expires_at,
            },
        };
        Self {
            id: self.id.clone(),
            message_id: None,
            name: self.name.clone(),
            mime_type: self.mime_type.clone(),
            size: self.size,
            source: self.source,
            payload,
            upload_progress: self.upload_progress,
            error: self.error.clone(),
            order: self.order,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inline_attachment_is_immediately_available() {
        let att = Attachment::new_inline("notes.txt", "text/plain", b"hello".to_vec(), AttachmentSource::User);
        assert_eq!(att.upload_progress, 100);
        assert!(!att.is_in_flight());
        assert_eq!(att.local_bytes(), Some(b"hello".as_slice()));
        assert_eq!(att.remote_uri(), None);
    }

    #[test]
    fn test_promote_discards_local_bytes() {
        let mut att = Attachment::new_pending_upload("clip.mp4", "video/mp4", vec![0u8; 64]);
        assert!(att.is_in_flight());

        att.promote_to_remote("files/abc123", Some(1_700_000_000_000));
        assert_eq!(att.local_bytes(), None);
        assert_eq!(att.remote_uri(), Some("files/abc123"));
        assert_eq!(att.upload_progress, 100);
    }

    #[test]
    fn test_failure_resets_progress() {
        let mut att = Attachment::new_pending_upload("clip.mp4", "video/mp4", vec![0u8; 64]);
        att.upload_progress = 60;
        att.mark_failed("connection reset");

        assert!(att.is_failed());
        assert!(!att.is_in_flight());
        assert_eq!(att.upload_progress, 0);
    }

    #[test]
    fn test_clone_detached_copies_bytes() {
        let att = Attachment::new_inline("a.txt", "text/plain", b"data".to_vec(), AttachmentSource::User);
        let copy = att.clone_detached();

        assert_eq!(copy.local_bytes(), att.local_bytes());
        assert_eq!(copy.message_id, None);
        assert_eq!(copy.id, att.id);
    }
}
