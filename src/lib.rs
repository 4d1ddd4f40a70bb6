//! weft: streaming message synchronization engine for multi-provider AI
//! chat.
//!
//! The engine keeps a chat's message state consistent while responses arrive
//! incrementally, attachments upload concurrently, and multiple provider
//! backends expose different wire shapes:
//!
//! - [`providers`] normalizes raw provider chunks into canonical
//!   [`models::delta::NormalizedDelta`] events and maps outgoing requests
//!   into provider payloads.
//! - [`models`] owns message state: the reducer folds deltas in arrival
//!   order under strict lifecycle guarantees, and the stream manager
//!   enforces the one-live-stream-per-conversation invariant.
//! - [`attachments`] validates, converts, and concurrently uploads files
//!   with per-attachment failure isolation.
//! - [`services`] drives transport events through the adapter and reducer,
//!   and keeps the durable store consistent with debounced snapshots,
//!   immediate terminal writes, and reconcile-on-load.
//!
//! Rendering, transport socket mechanics, and the storage engine itself are
//! external collaborators.

pub mod attachments;
pub mod logging;
pub mod models;
pub mod providers;
pub mod repositories;
pub mod services;

pub use models::attachment::{Attachment, AttachmentPayload, AttachmentSource};
pub use models::chat_store::ChatStore;
pub use models::delta::{ErrorCode, ErrorPhase, NormalizedDelta, NormalizedError};
pub use models::message::{Message, MessageStatus, ReducerError, Sender};
pub use models::metadata::{MessageMetadata, MetadataPatch};
pub use models::stream_manager::{
    StreamError, StreamEvent, StreamHandle, StreamManager, StreamOutcome,
};
pub use providers::{ChatRequest, ProviderAdapter, ProviderRegistry, RequestConfig};
pub use services::{StreamContext, SyncCoordinator, TransportEvent};
