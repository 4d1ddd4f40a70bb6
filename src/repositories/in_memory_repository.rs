use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::error::RepositoryResult;
use super::message_repository::{
    AttachmentRecord, BoxFuture, ConversationSummary, MessageRecord, MessageRepository,
};

/// In-memory repository for messages.
/// Useful for testing and development; also counts writes so tests can
/// observe the coordinator's debounce behavior.
#[derive(Clone, Default)]
pub struct InMemoryMessageRepository {
    messages: Arc<Mutex<HashMap<String, MessageRecord>>>,
    attachments: Arc<Mutex<HashMap<String, Vec<AttachmentRecord>>>>,
    save_count: Arc<AtomicUsize>,
}

impl InMemoryMessageRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of message snapshots written so far.
    pub fn save_count(&self) -> usize {
        self.save_count.load(Ordering::Relaxed)
    }
}

impl MessageRepository for InMemoryMessageRepository {
    fn load_one(&self, id: &str) -> BoxFuture<'static, RepositoryResult<Option<MessageRecord>>> {
        let messages = self.messages.clone();
        let id = id.to_string();
        Box::pin(async move { Ok(messages.lock().get(&id).cloned()) })
    }

    fn load_conversation(
        &self,
        conversation_id: &str,
    ) -> BoxFuture<'static, RepositoryResult<Vec<MessageRecord>>> {
        let messages = self.messages.clone();
        let conversation_id = conversation_id.to_string();
        Box::pin(async move {
            let mut records: Vec<MessageRecord> = messages
                .lock()
                .values()
                .filter(|r| r.conversation_id == conversation_id)
                .cloned()
                .collect();
            records.sort_by_key(|r| r.sequence);
            Ok(records)
        })
    }

    fn load_attachments(
        &self,
        message_id: &str,
    ) -> BoxFuture<'static, RepositoryResult<Vec<AttachmentRecord>>> {
        let attachments = self.attachments.clone();
        let message_id = message_id.to_string();
        Box::pin(async move {
            let mut records = attachments
                .lock()
                .get(&message_id)
                .cloned()
                .unwrap_or_default();
            records.sort_by_key(|r| r.order_index);
            Ok(records)
        })
    }

    fn load_summaries(&self) -> BoxFuture<'static, RepositoryResult<Vec<ConversationSummary>>> {
        let messages = self.messages.clone();
        Box::pin(async move {
            let mut by_conversation: HashMap<String, (i64, i64)> = HashMap::new();
            for record in messages.lock().values() {
                let entry = by_conversation
                    .entry(record.conversation_id.clone())
                    .or_insert((0, 0));
                entry.0 += 1;
                entry.1 = entry.1.max(record.updated_at);
            }
            let mut summaries: Vec<ConversationSummary> = by_conversation
                .into_iter()
                .map(|(conversation_id, (count, updated))| ConversationSummary {
                    conversation_id,
                    message_count: count,
                    last_updated_at: updated,
                })
                .collect();
            summaries.sort_by_key(|s| std::cmp::Reverse(s.last_updated_at));
            Ok(summaries)
        })
    }

    fn save(&self, record: MessageRecord) -> BoxFuture<'static, RepositoryResult<()>> {
        let messages = self.messages.clone();
        let save_count = self.save_count.clone();
        Box::pin(async move {
            messages.lock().insert(record.id.clone(), record);
            save_count.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
    }

    fn save_attachments(
        &self,
        message_id: &str,
        records: Vec<AttachmentRecord>,
    ) -> BoxFuture<'static, RepositoryResult<()>> {
        let attachments = self.attachments.clone();
        let message_id = message_id.to_string();
        Box::pin(async move {
            attachments.lock().insert(message_id, records);
            Ok(())
        })
    }

    fn delete(&self, id: &str) -> BoxFuture<'static, RepositoryResult<()>> {
        let messages = self.messages.clone();
        let attachments = self.attachments.clone();
        let id = id.to_string();
        Box::pin(async move {
            messages.lock().remove(&id);
            attachments.lock().remove(&id);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::message::Message;

    #[tokio::test]
    async fn test_save_and_load() {
        let repo = InMemoryMessageRepository::new();
        let message = Message::user("conv-1", 10, "hello", vec![]);

        repo.save(MessageRecord::from_message(&message).unwrap())
            .await
            .unwrap();

        let loaded = repo.load_one(&message.id).await.unwrap().unwrap();
        assert_eq!(loaded.content_text, "hello");
        assert_eq!(repo.save_count(), 1);
    }

    #[tokio::test]
    async fn test_conversation_ordering() {
        let repo = InMemoryMessageRepository::new();
        for seq in [20i64, 10] {
            let message = Message::user("conv-1", seq, format!("m{seq}"), vec![]);
            repo.save(MessageRecord::from_message(&message).unwrap())
                .await
                .unwrap();
        }

        let records = repo.load_conversation("conv-1").await.unwrap();
        assert_eq!(records[0].sequence, 10);
        assert_eq!(records[1].sequence, 20);
    }

    #[tokio::test]
    async fn test_delete() {
        let repo = InMemoryMessageRepository::new();
        let message = Message::user("conv-1", 10, "bye", vec![]);
        repo.save(MessageRecord::from_message(&message).unwrap())
            .await
            .unwrap();

        repo.delete(&message.id).await.unwrap();
        assert!(repo.load_one(&message.id).await.unwrap().is_none());
    }
}
