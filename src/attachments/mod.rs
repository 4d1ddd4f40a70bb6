pub mod convert;
pub mod upload;
pub mod validation;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::models::attachment::Attachment;
use crate::providers::ProviderRegistry;

pub use upload::UploadEvent;
use upload::UploadTask;
pub use validation::ValidationError;

/// Attachment bucket limits. Capacity is enforced before a file is accepted,
/// never after.
#[derive(Debug, Clone)]
pub struct PipelinePolicy {
    /// Maximum concurrent attachments per composition.
    pub max_attachments: usize,
    /// Size ceiling for non-media attachments.
    pub max_inline_size: u64,
    /// Media larger than this is routed to remote storage.
    pub remote_threshold: u64,
}

impl Default for PipelinePolicy {
    fn default() -> Self {
        Self {
            max_attachments: 10,
            max_inline_size: validation::MAX_FILE_SIZE,
            remote_threshold: validation::MAX_FILE_SIZE,
        }
    }
}

/// A user-selected file before validation.
#[derive(Debug, Clone)]
pub struct PendingFile {
    pub name: String,
    /// MIME type as reported by the host, often missing or generic.
    pub reported_mime: Option<String>,
    pub bytes: Vec<u8>,
}

#[derive(Debug)]
pub struct RejectedFile {
    pub name: String,
    pub reason: ValidationError,
}

/// Result of one `add_files` batch. A failed file never blocks its siblings;
/// capacity violations are reported once per batch as a count.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub accepted: Vec<String>,
    pub rejected: Vec<RejectedFile>,
    pub capacity_dropped: usize,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RestoreOutcome {
    pub restored: usize,
    pub dropped: usize,
}

/// Bounded collection of attachment records for one in-flight composition.
///
/// Uploads run as independent tasks reporting over the event channel handed
/// out by `new`; the owner drains that channel into `apply_event`, which is
/// the only place upload results touch bucket state.
pub struct AttachmentPipeline {
    items: Vec<Attachment>,
    policy: PipelinePolicy,
    registry: Arc<ProviderRegistry>,
    uploads: HashMap<String, UploadTask>,
    events_tx: mpsc::UnboundedSender<UploadEvent>,
}

impl AttachmentPipeline {
    pub fn new(
        policy: PipelinePolicy,
        registry: Arc<ProviderRegistry>,
    ) -> (Self, mpsc::UnboundedReceiver<UploadEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                items: Vec::new(),
                policy,
                registry,
                uploads: HashMap::new(),
                events_tx,
            },
            events_rx,
        )
    }

    pub fn items(&self) -> &[Attachment] {
        &self.items
    }

    pub fn get(&self, attachment_id: &str) -> Option<&Attachment> {
        self.items.iter().find(|a| a.id == attachment_id)
    }

    /// Validate and enqueue a batch of files. Files are processed
    /// sequentially; each failure is recorded in the outcome without
    /// aborting the rest.
    pub fn add_files(&mut self, files: Vec<PendingFile>, provider_id: &str) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();

        for file in files {
            if self.items.len() >= self.policy.max_attachments {
                outcome.capacity_dropped += 1;
                continue;
            }

            let mut mime = validation::normalize_mime(&file.name, file.reported_mime.as_deref());
            let mut bytes = file.bytes;

            if convert::is_spreadsheet(&mime) {
                match convert::spreadsheet_to_text(&bytes) {
                    Ok(text) => {
                        bytes = text.into_bytes();
                        mime = "text/plain".to_string();
                    }
                    Err(e) => {
                        debug!(name = %file.name, error = %e, "Spreadsheet conversion failed");
                        outcome.rejected.push(RejectedFile {
                            name: file.name,
                            reason: ValidationError::UnsupportedType(mime),
                        });
                        continue;
                    }
                }
            }

            let size = bytes.len() as u64;
            if let Err(reason) = validation::validate(&mime, size, self.policy.max_inline_size) {
                outcome.rejected.push(RejectedFile {
                    name: file.name,
                    reason,
                });
                continue;
            }

            let needs_remote =
                validation::is_media(&mime) && size > self.policy.remote_threshold;
            let mut attachment = if needs_remote {
                let adapter = match self.registry.resolve(provider_id) {
                    Ok(adapter) => adapter,
                    Err(_) => {
                        outcome.rejected.push(RejectedFile {
                            name: file.name,
                            reason: ValidationError::UploadUnavailable(provider_id.to_string()),
                        });
                        continue;
                    }
                };
                let attachment =
                    Attachment::new_pending_upload(file.name.clone(), mime.clone(), bytes.clone());
                let task = UploadTask::spawn(
                    adapter,
                    attachment.id.clone(),
                    file.name,
                    mime,
                    bytes,
                    self.events_tx.clone(),
                );
                self.uploads.insert(attachment.id.clone(), task);
                attachment
            } else {
                Attachment::new_inline(
                    file.name,
                    mime,
                    bytes,
                    crate::models::attachment::AttachmentSource::User,
                )
            };

            attachment.order = self.items.len() as u32;
            outcome.accepted.push(attachment.id.clone());
            self.items.push(attachment);
        }

        outcome
    }

    /// Apply one upload event to the bucket. Progress is monotonic per
    /// attachment: stale or out-of-order percentages are ignored.
    pub fn apply_event(&mut self, event: UploadEvent) {
        match event {
            UploadEvent::Progress {
                attachment_id,
                percent,
            } => {
                if let Some(att) = self.items.iter_mut().find(|a| a.id == attachment_id) {
                    if att.error.is_none() && percent > att.upload_progress {
                        att.upload_progress = percent.min(100);
                    }
                }
            }
            UploadEvent::Completed {
                attachment_id,
                file,
            } => {
                self.uploads.remove(&attachment_id);
                if let Some(att) = self.items.iter_mut().find(|a| a.id == attachment_id) {
                    att.promote_to_remote(file.uri, file.expires_at);
                }
            }
            UploadEvent::Failed {
                attachment_id,
                error,
            } => {
                self.uploads.remove(&attachment_id);
                if let Some(att) = self.items.iter_mut().find(|a| a.id == attachment_id) {
                    att.mark_failed(error.message.clone());
                    warn!(attachment_id = %att.id, error = %error, "Attachment upload failed");
                }
            }
        }
    }

    /// Cancel one in-flight upload without touching its siblings.
    pub fn cancel_upload(&mut self, attachment_id: &str) {
        if let Some(task) = self.uploads.remove(attachment_id) {
            task.cancel();
        }
        if let Some(att) = self.items.iter_mut().find(|a| a.id == attachment_id) {
            if att.is_in_flight() {
                att.mark_failed("upload cancelled");
            }
        }
    }

    /// Remove an attachment entirely (user action), cancelling any upload.
    pub fn remove(&mut self, attachment_id: &str) -> bool {
        if let Some(task) = self.uploads.remove(attachment_id) {
            task.cancel();
        }
        let before = self.items.len();
        self.items.retain(|a| a.id != attachment_id);
        let removed = self.items.len() != before;
        for (i, att) in self.items.iter_mut().enumerate() {
            att.order = i as u32;
        }
        removed
    }

    /// Restore a draft's attachments. Each record is defensively copied at
    /// the byte level and re-validated against current policy; violators are
    /// dropped silently with one aggregate warning.
    pub fn replace_all(&mut self, list: Vec<Attachment>) -> RestoreOutcome {
        for task in self.uploads.values() {
            task.cancel();
        }
        self.uploads.clear();
        self.items.clear();

        let mut outcome = RestoreOutcome::default();
        for att in &list {
            if self.items.len() >= self.policy.max_attachments {
                outcome.dropped += 1;
                continue;
            }
            if validation::validate(&att.mime_type, att.size.max(1), self.policy.max_inline_size)
                .is_err()
            {
                outcome.dropped += 1;
                continue;
            }
            let mut copy = att.clone_detached();
            copy.order = self.items.len() as u32;
            self.items.push(copy);
            outcome.restored += 1;
        }

        if outcome.dropped > 0 {
            warn!(
                dropped = outcome.dropped,
                restored = outcome.restored,
                "Dropped draft attachments violating current policy"
            );
        }
        outcome
    }

    /// Attachments eligible for an outgoing request: failed ones are
    /// excluded, in-flight ones are not yet eligible.
    pub fn ready_attachments(&self) -> Vec<Attachment> {
        self.items
            .iter()
            .filter(|a| !a.is_failed() && !a.is_in_flight())
            .cloned()
            .collect()
    }

    /// True once no attachment is still uploading.
    pub fn is_settled(&self) -> bool {
        !self.items.iter().any(|a| a.is_in_flight())
    }

    pub fn clear(&mut self) {
        for task in self.uploads.values() {
            task.cancel();
        }
        self.uploads.clear();
        self.items.clear();
    }
}
