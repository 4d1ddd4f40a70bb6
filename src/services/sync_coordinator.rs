use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::models::delta::NormalizedError;
use crate::models::message::{Message, MessageStatus};
use crate::models::stream_manager::StreamHandle;
use crate::repositories::{
    AttachmentRecord, MessageRecord, MessageRepository, RepositoryResult,
};

/// Default minimum interval between streaming snapshots of one message.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// Bridges transient in-memory message state to the durable store.
///
/// While a message streams, snapshots are throttled to at most one write per
/// debounce interval: the tail of the stream (at most one interval's worth
/// of text) is at risk on a hard crash, which is the accepted tradeoff for
/// avoiding per-delta write amplification. Terminal states are always written
/// and awaited before the turn settles.
pub struct SyncCoordinator {
    repository: Arc<dyn MessageRepository>,
    debounce: Duration,
    last_write: Mutex<HashMap<String, Instant>>,
}

impl SyncCoordinator {
    pub fn new(repository: Arc<dyn MessageRepository>) -> Self {
        Self::with_debounce(repository, DEFAULT_DEBOUNCE)
    }

    pub fn with_debounce(repository: Arc<dyn MessageRepository>, debounce: Duration) -> Self {
        Self {
            repository,
            debounce,
            last_write: Mutex::new(HashMap::new()),
        }
    }

    pub fn repository(&self) -> &Arc<dyn MessageRepository> {
        &self.repository
    }

    /// Throttled write-through for a streaming message. Returns whether a
    /// snapshot was actually written.
    pub async fn persist_streaming(&self, message: &Message) -> RepositoryResult<bool> {
        let due = {
            let last_write = self.last_write.lock();
            last_write
                .get(&message.id)
                .map(|t| t.elapsed() >= self.debounce)
                .unwrap_or(true)
        };
        if !due {
            return Ok(false);
        }

        self.write_snapshot(message).await?;
        self.last_write
            .lock()
            .insert(message.id.clone(), Instant::now());
        Ok(true)
    }

    /// Unconditional write, awaited by the caller. Used for terminal states
    /// and user-turn persistence; a terminal message is never lost.
    pub async fn persist_now(&self, message: &Message) -> RepositoryResult<()> {
        self.write_snapshot(message).await?;
        self.last_write.lock().remove(&message.id);
        Ok(())
    }

    async fn write_snapshot(&self, message: &Message) -> RepositoryResult<()> {
        self.repository
            .save(MessageRecord::from_message(message)?)
            .await?;
        if !message.attachments.is_empty() {
            let records = message
                .attachments
                .iter()
                .map(AttachmentRecord::from_attachment)
                .collect::<RepositoryResult<Vec<_>>>()?;
            self.repository
                .save_attachments(&message.id, records)
                .await?;
        }
        debug!(message_id = %message.id, status = ?message.status, "Persisted message snapshot");
        Ok(())
    }

    /// Reconcile persisted state after load or reconnect: any message still
    /// persisted as `Pending`/`Streaming` with no live stream handle is
    /// deterministically downgraded to `Error` ("interrupted"), preserving
    /// whatever partial text the debounced writes captured.
    pub async fn reconcile_on_load(
        &self,
        conversation_id: &str,
        active: &[StreamHandle],
    ) -> RepositoryResult<Vec<Message>> {
        let records = self.repository.load_conversation(conversation_id).await?;
        let mut messages = Vec::with_capacity(records.len());

        for record in records {
            let attachments = self
                .repository
                .load_attachments(&record.id)
                .await?
                .into_iter()
                .map(|r| r.into_attachment())
                .collect();
            let mut message = record.into_message(attachments)?;

            let orphaned = matches!(
                message.status,
                MessageStatus::Pending | MessageStatus::Streaming
            ) && !active.iter().any(|h| h.message_id == message.id);

            if orphaned && message.fail(NormalizedError::interrupted()).is_ok() {
                info!(
                    message_id = %message.id,
                    "Downgraded orphaned in-flight message to interrupted error"
                );
                self.persist_now(&message).await?;
            }

            messages.push(message);
        }

        Ok(messages)
    }
}
