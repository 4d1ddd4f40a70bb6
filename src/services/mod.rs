pub mod stream_service;
pub mod sync_coordinator;

pub use stream_service::{
    Generation, GenerationParams, RawChunkStream, StreamContext, TransportEvent,
    cancel_generation, into_transport_events, run_stream, start_generation,
};
pub use sync_coordinator::{DEFAULT_DEBOUNCE, SyncCoordinator};
