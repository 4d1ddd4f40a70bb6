use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::delta::NormalizedError;

/// Minimum interval between batched `TextDelta` events (~60fps).
const FLUSH_INTERVAL: Duration = Duration::from_millis(16);

/// Capacity of the subscriber event channel. Slow subscribers that fall more
/// than this far behind lose the oldest events, not the stream itself.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Identifies the single active stream of a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHandle {
    pub conversation_id: String,
    pub message_id: String,
    pub request_id: String,
    pub provider_id: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamError {
    /// Single-writer invariant: starting a generation while one is active
    /// for the same conversation fails fast instead of interleaving deltas.
    #[error("conversation {0} already has an active stream")]
    AlreadyStreaming(String),

    #[error("no active stream for conversation {0}")]
    NotStreaming(String),
}

/// How a stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    Cancelled,
    Failed(NormalizedError),
}

/// Events for decoupled presentation updates. Each variant carries
/// `conversation_id` so subscribers can filter.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Started {
        conversation_id: String,
        message_id: String,
        request_id: String,
    },
    /// Batched answer text (at most one event per `FLUSH_INTERVAL`).
    TextDelta {
        conversation_id: String,
        message_id: String,
        text: String,
    },
    /// Reasoning text, forwarded without batching.
    ThoughtDelta {
        conversation_id: String,
        message_id: String,
        text: String,
    },
    Ended {
        conversation_id: String,
        message_id: String,
        outcome: StreamOutcome,
    },
}

struct ActiveStream {
    handle: StreamHandle,
    cancel_flag: Arc<AtomicBool>,
    /// Text accumulated since the last TextDelta event emission.
    pending_text: String,
    last_flush: Instant,
}

/// Centralized stream lifecycle manager.
///
/// Owns the per-conversation `StreamHandle` registry and enforces the
/// single-writer invariant. Does NOT accumulate response text — that is the
/// sole responsibility of the message reducer; the manager only batches the
/// presentation-facing event copies.
pub struct StreamManager {
    streams: HashMap<String, ActiveStream>,
    events: broadcast::Sender<StreamEvent>,
}

impl StreamManager {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            streams: HashMap::new(),
            events,
        }
    }

    /// Subscribe to presentation events.
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.events.subscribe()
    }

    /// Register a stream for a conversation. Rejects if one is already
    /// active; the caller must cancel explicitly first.
    pub fn begin(&mut self, handle: StreamHandle) -> Result<Arc<AtomicBool>, StreamError> {
        if self.streams.contains_key(&handle.conversation_id) {
            return Err(StreamError::AlreadyStreaming(handle.conversation_id));
        }

        let cancel_flag = Arc::new(AtomicBool::new(false));
        self.emit(StreamEvent::Started {
            conversation_id: handle.conversation_id.clone(),
            message_id: handle.message_id.clone(),
            request_id: handle.request_id.clone(),
        });
        debug!(conv_id = %handle.conversation_id, request_id = %handle.request_id, "Stream registered");

        self.streams.insert(
            handle.conversation_id.clone(),
            ActiveStream {
                handle,
                cancel_flag: cancel_flag.clone(),
                pending_text: String::new(),
                last_flush: Instant::now(),
            },
        );
        Ok(cancel_flag)
    }

    pub fn is_streaming(&self, conversation_id: &str) -> bool {
        self.streams.contains_key(conversation_id)
    }

    pub fn has_active_streams(&self) -> bool {
        !self.streams.is_empty()
    }

    pub fn handle_for(&self, conversation_id: &str) -> Option<&StreamHandle> {
        self.streams.get(conversation_id).map(|s| &s.handle)
    }

    pub fn active_handles(&self) -> Vec<StreamHandle> {
        self.streams.values().map(|s| s.handle.clone()).collect()
    }

    /// Queue answer text for subscribers. Batched: emitted as a single
    /// `TextDelta` only once `FLUSH_INTERVAL` has elapsed.
    pub fn push_text(&mut self, conversation_id: &str, text: &str) {
        let Some(state) = self.streams.get_mut(conversation_id) else {
            return;
        };
        state.pending_text.push_str(text);
        if state.last_flush.elapsed() >= FLUSH_INTERVAL {
            let batch = std::mem::take(&mut state.pending_text);
            state.last_flush = Instant::now();
            let event = StreamEvent::TextDelta {
                conversation_id: conversation_id.to_string(),
                message_id: state.handle.message_id.clone(),
                text: batch,
            };
            self.emit(event);
        }
    }

    /// Forward reasoning text immediately.
    pub fn push_thought(&mut self, conversation_id: &str, text: &str) {
        let Some(state) = self.streams.get(conversation_id) else {
            return;
        };
        let event = StreamEvent::ThoughtDelta {
            conversation_id: conversation_id.to_string(),
            message_id: state.handle.message_id.clone(),
            text: text.to_string(),
        };
        self.emit(event);
    }

    /// Request cooperative cancellation. Sets the cancel flag (subsequent
    /// deltas for the request are dropped by the stream driver) and releases
    /// the handle; the underlying transport read is not aborted.
    pub fn cancel(&mut self, conversation_id: &str) -> Result<StreamHandle, StreamError> {
        let Some(state) = self.streams.remove(conversation_id) else {
            return Err(StreamError::NotStreaming(conversation_id.to_string()));
        };
        state.cancel_flag.store(true, Ordering::Relaxed);
        debug!(conv_id = %conversation_id, "Stream cancelled");
        Ok(self.release(conversation_id, state, StreamOutcome::Cancelled))
    }

    /// Flush any batched text, emit `Ended`, and drop the registration.
    /// Called by the stream driver once the message reached a terminal state.
    pub fn finish(&mut self, conversation_id: &str, outcome: StreamOutcome) {
        let Some(state) = self.streams.remove(conversation_id) else {
            warn!(conv_id = %conversation_id, "finish called but no stream found");
            return;
        };
        self.release(conversation_id, state, outcome);
    }

    fn release(
        &mut self,
        conversation_id: &str,
        mut state: ActiveStream,
        outcome: StreamOutcome,
    ) -> StreamHandle {
        if !state.pending_text.is_empty() {
            let batch = std::mem::take(&mut state.pending_text);
            self.emit(StreamEvent::TextDelta {
                conversation_id: conversation_id.to_string(),
                message_id: state.handle.message_id.clone(),
                text: batch,
            });
        }

        self.emit(StreamEvent::Ended {
            conversation_id: conversation_id.to_string(),
            message_id: state.handle.message_id.clone(),
            outcome,
        });
        state.handle
    }

    /// Cancel every active stream (shutdown path).
    pub fn cancel_all(&mut self) {
        let ids: Vec<String> = self.streams.keys().cloned().collect();
        for id in ids {
            let _ = self.cancel(&id);
        }
    }

    fn emit(&self, event: StreamEvent) {
        // No subscribers is fine; the engine runs headless in tests.
        let _ = self.events.send(event);
    }
}

impl Default for StreamManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(conv: &str) -> StreamHandle {
        StreamHandle {
            conversation_id: conv.to_string(),
            message_id: format!("{conv}-msg"),
            request_id: format!("{conv}-req"),
            provider_id: "gemini".to_string(),
        }
    }

    #[test]
    fn test_new_manager_is_empty() {
        let mgr = StreamManager::new();
        assert!(!mgr.has_active_streams());
        assert!(!mgr.is_streaming("conv-1"));
    }

    #[test]
    fn test_single_writer_invariant() {
        let mut mgr = StreamManager::new();
        mgr.begin(handle("conv-1")).unwrap();

        let err = mgr.begin(handle("conv-1")).unwrap_err();
        assert_eq!(err, StreamError::AlreadyStreaming("conv-1".to_string()));

        // Other conversations are independent.
        mgr.begin(handle("conv-2")).unwrap();
        assert!(mgr.is_streaming("conv-2"));
    }

    #[test]
    fn test_cancel_sets_flag_and_releases() {
        let mut mgr = StreamManager::new();
        let flag = mgr.begin(handle("conv-1")).unwrap();

        mgr.cancel("conv-1").unwrap();
        assert!(flag.load(Ordering::Relaxed));
        assert!(!mgr.is_streaming("conv-1"));

        // A new stream can start afterwards.
        mgr.begin(handle("conv-1")).unwrap();
    }

    #[test]
    fn test_cancel_unknown_conversation_errors() {
        let mut mgr = StreamManager::new();
        assert_eq!(
            mgr.cancel("nope").unwrap_err(),
            StreamError::NotStreaming("nope".to_string())
        );
    }

    #[test]
    fn test_finish_flushes_pending_text() {
        let mut mgr = StreamManager::new();
        let mut rx = mgr.subscribe();
        mgr.begin(handle("conv-1")).unwrap();
        mgr.push_text("conv-1", "tail");
        mgr.finish("conv-1", StreamOutcome::Completed);

        // Started, then the flushed TextDelta, then Ended.
        assert!(matches!(rx.try_recv().unwrap(), StreamEvent::Started { .. }));
        match rx.try_recv().unwrap() {
            StreamEvent::TextDelta { text, .. } => assert_eq!(text, "tail"),
            other => panic!("expected TextDelta, got {other:?}"),
        }
        match rx.try_recv().unwrap() {
            StreamEvent::Ended { outcome, .. } => assert_eq!(outcome, StreamOutcome::Completed),
            other => panic!("expected Ended, got {other:?}"),
        }
    }

    #[test]
    fn test_active_handles_snapshot() {
        let mut mgr = StreamManager::new();
        mgr.begin(handle("conv-1")).unwrap();
        mgr.begin(handle("conv-2")).unwrap();

        let mut ids: Vec<String> = mgr
            .active_handles()
            .into_iter()
            .map(|h| h.conversation_id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["conv-1", "conv-2"]);
    }
}
