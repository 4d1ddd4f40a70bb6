pub mod attachment;
pub mod chat_store;
pub mod delta;
pub mod message;
pub mod metadata;
pub mod stream_manager;
pub mod token_usage;

/// Unix timestamp in milliseconds.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
