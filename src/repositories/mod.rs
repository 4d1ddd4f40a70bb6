mod error;
mod in_memory_repository;
mod message_repository;
mod sqlite_repository;

pub use error::{RepositoryError, RepositoryResult};
pub use in_memory_repository::InMemoryMessageRepository;
pub use message_repository::{
    AttachmentRecord, BoxFuture, ConversationSummary, MessageRecord, MessageRepository,
};
pub use sqlite_repository::SqliteMessageRepository;
