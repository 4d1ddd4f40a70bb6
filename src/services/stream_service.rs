use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::attachment::Attachment;
use crate::models::chat_store::ChatStore;
use crate::models::delta::{ErrorPhase, NormalizedError};
use crate::models::message::{Message, MessageStatus};
use crate::models::stream_manager::{StreamHandle, StreamManager, StreamOutcome};
use crate::providers::{
    ChatRequest, ContentTurn, ProviderAdapter, ProviderRegistry, RawProviderError, RequestConfig,
};

use super::sync_coordinator::SyncCoordinator;

/// Events the transport delivers for one `request_id`, in order.
#[derive(Debug)]
pub enum TransportEvent {
    Chunk(serde_json::Value),
    End(Option<serde_json::Value>),
    Error(RawProviderError),
}

/// Raw provider stream as a transport implementation hands it over.
pub type RawChunkStream = BoxStream<'static, Result<serde_json::Value, RawProviderError>>;

/// Fold an ordered raw chunk stream into transport events: every chunk is
/// forwarded, the first stream error terminates the sequence, and a clean
/// end of stream becomes `End`.
pub fn into_transport_events(mut stream: RawChunkStream) -> BoxStream<'static, TransportEvent> {
    Box::pin(async_stream::stream! {
        while let Some(item) = stream.next().await {
            match item {
                Ok(chunk) => yield TransportEvent::Chunk(chunk),
                Err(error) => {
                    yield TransportEvent::Error(error);
                    return;
                }
            }
        }
        yield TransportEvent::End(None);
    })
}

/// Shared handles to the engine's state owners. Cheap to clone; all message
/// mutation goes through `store` under short non-suspending lock sections.
#[derive(Clone)]
pub struct StreamContext {
    pub store: Arc<Mutex<ChatStore>>,
    pub streams: Arc<Mutex<StreamManager>>,
    pub coordinator: Arc<SyncCoordinator>,
    pub registry: Arc<ProviderRegistry>,
}

impl StreamContext {
    pub fn new(
        coordinator: Arc<SyncCoordinator>,
        registry: Arc<ProviderRegistry>,
    ) -> Self {
        Self {
            store: Arc::new(Mutex::new(ChatStore::new())),
            streams: Arc::new(Mutex::new(StreamManager::new())),
            coordinator,
            registry,
        }
    }
}

pub struct GenerationParams {
    pub conversation_id: String,
    pub provider_id: String,
    pub model: String,
    pub prompt: String,
    pub attachments: Vec<Attachment>,
    pub config: RequestConfig,
}

/// Everything the caller needs to drive one generation: the handle, the
/// cooperative cancel flag, and the provider payload to hand the transport.
pub struct Generation {
    pub handle: StreamHandle,
    pub cancel: Arc<AtomicBool>,
    pub payload: serde_json::Value,
    pub user_message_id: String,
}

/// Create the user turn and the pending model message, register the stream
/// (failing fast if one is already active for the conversation), build the
/// provider payload, and persist both messages.
pub async fn start_generation(
    ctx: &StreamContext,
    params: GenerationParams,
) -> Result<Generation> {
    let adapter = ctx
        .registry
        .resolve(&params.provider_id)
        .context("unknown provider")?;

    // Single-writer check up front so no messages are created for a
    // conversation that already has a live stream.
    if ctx.streams.lock().is_streaming(&params.conversation_id) {
        bail!(
            "conversation {} already has an active stream",
            params.conversation_id
        );
    }

    let request_id = Uuid::new_v4().to_string();

    // Build the request from the completed history plus the new user turn,
    // before any state is mutated.
    let (user_message, pending, contents) = {
        let store = ctx.store.lock();
        let user_sequence = store.next_sequence(&params.conversation_id);
        let user_message = Message::user(
            params.conversation_id.as_str(),
            user_sequence,
            params.prompt.as_str(),
            params.attachments,
        );
        let pending = Message::pending_model(
            params.conversation_id.as_str(),
            user_sequence + crate::models::message::SEQUENCE_STEP,
            request_id.as_str(),
        );

        let mut contents: Vec<ContentTurn> = store
            .messages(&params.conversation_id)
            .iter()
            .filter(|m| m.status == MessageStatus::Completed)
            .map(ContentTurn::from_message)
            .collect();
        contents.push(ContentTurn::from_message(&user_message));
        (user_message, pending, contents)
    };

    let request = ChatRequest {
        provider_id: params.provider_id.clone(),
        conversation_id: params.conversation_id.clone(),
        request_id: request_id.clone(),
        model: params.model,
        contents,
        config: params.config,
        streaming: true,
    };
    let payload = adapter
        .build_request(&request)
        .context("failed to build provider request")?;

    let handle = StreamHandle {
        conversation_id: params.conversation_id.clone(),
        message_id: pending.id.clone(),
        request_id,
        provider_id: params.provider_id,
    };
    let cancel = ctx.streams.lock().begin(handle.clone())?;

    let user_message_id = user_message.id.clone();
    {
        let mut store = ctx.store.lock();
        store.push_message(user_message.clone());
        store.push_message(pending.clone());
    }

    // The user turn is terminal and must never be lost; the pending model
    // message is persisted so a crash before the first delta still
    // reconciles deterministically.
    ctx.coordinator.persist_now(&user_message).await?;
    ctx.coordinator.persist_now(&pending).await?;

    Ok(Generation {
        handle,
        cancel,
        payload,
        user_message_id,
    })
}

/// Drive one stream to its terminal state.
///
/// Consumes transport events in delivery order, normalizes each chunk
/// through the adapter, folds the delta into the message, and keeps the
/// coordinator fed. Deltas arriving after cancellation or a terminal state
/// are dropped with a warning; the transport may keep delivering until it
/// closes on its own.
pub async fn run_stream(
    ctx: StreamContext,
    handle: StreamHandle,
    cancel: Arc<AtomicBool>,
    mut events: mpsc::Receiver<TransportEvent>,
) -> Result<()> {
    let adapter = ctx.registry.resolve(&handle.provider_id)?;

    while let Some(event) = events.recv().await {
        if cancel.load(Ordering::Relaxed) {
            debug!(request_id = %handle.request_id, "Dropping event after cancellation");
            continue;
        }

        match event {
            TransportEvent::Chunk(raw) => {
                let delta = match adapter.parse_chunk(&raw) {
                    Ok(delta) => delta,
                    Err(e) => {
                        // A malformed chunk must never crash the reducer or
                        // leave the message stuck mid-stream.
                        let error = adapter.normalize_error(
                            &RawProviderError {
                                status: None,
                                message: e.to_string(),
                            },
                            ErrorPhase::Parse,
                        );
                        fail_stream(&ctx, &handle, error).await?;
                        return Ok(());
                    }
                };

                let finish_reason = delta.finish_reason.clone();
                let text = delta.delta_text.clone();
                let thought = delta.thought_delta.clone();

                let applied = {
                    let mut store = ctx.store.lock();
                    match store.message_mut(&handle.conversation_id, &handle.message_id) {
                        Some(message) => message.apply_delta(delta).map(|_| ()),
                        None => {
                            warn!(message_id = %handle.message_id, "Delta for unknown message dropped");
                            continue;
                        }
                    }
                };
                if let Err(e) = applied {
                    warn!(request_id = %handle.request_id, error = %e, "Late delta dropped");
                    continue;
                }

                {
                    let mut streams = ctx.streams.lock();
                    if let Some(text) = &text {
                        streams.push_text(&handle.conversation_id, text);
                    }
                    if let Some(thought) = &thought {
                        streams.push_thought(&handle.conversation_id, thought);
                    }
                }

                if let Some(reason) = finish_reason {
                    finalize_stream(&ctx, &handle, Some(reason)).await?;
                    return Ok(());
                }

                let snapshot = ctx
                    .store
                    .lock()
                    .message(&handle.conversation_id, &handle.message_id)
                    .cloned();
                if let Some(snapshot) = snapshot {
                    ctx.coordinator.persist_streaming(&snapshot).await?;
                }
            }
            TransportEvent::End(_) => {
                finalize_stream(&ctx, &handle, None).await?;
                return Ok(());
            }
            TransportEvent::Error(raw) => {
                let error = adapter.normalize_error(&raw, ErrorPhase::Stream);
                fail_stream(&ctx, &handle, error).await?;
                return Ok(());
            }
        }
    }

    // The transport closed without a terminal event. If the user cancelled,
    // the message is already settled; otherwise this is a connection drop.
    if !cancel.load(Ordering::Relaxed) {
        let error = adapter.normalize_error(
            &RawProviderError {
                status: None,
                message: "transport closed without terminal event".into(),
            },
            ErrorPhase::Stream,
        );
        fail_stream(&ctx, &handle, error).await?;
    }
    Ok(())
}

/// Cooperatively cancel the active stream of a conversation. The message
/// settles as `Cancelled` and is persisted before this returns; the
/// transport read is left to drain on its own.
pub async fn cancel_generation(ctx: &StreamContext, conversation_id: &str) -> Result<()> {
    let handle = ctx.streams.lock().cancel(conversation_id)?;

    let snapshot = {
        let mut store = ctx.store.lock();
        let Some(message) = store.message_mut(conversation_id, &handle.message_id) else {
            return Ok(());
        };
        message.cancel()?;
        message.clone()
    };
    ctx.coordinator.persist_now(&snapshot).await?;
    Ok(())
}

async fn finalize_stream(
    ctx: &StreamContext,
    handle: &StreamHandle,
    finish_reason: Option<String>,
) -> Result<()> {
    let snapshot = {
        let mut store = ctx.store.lock();
        let Some(message) = store.message_mut(&handle.conversation_id, &handle.message_id) else {
            bail!("finalize for unknown message {}", handle.message_id);
        };
        if !message.is_terminal() {
            message.finalize(finish_reason)?;
        }
        message.clone()
    };

    ctx.coordinator.persist_now(&snapshot).await?;
    ctx.streams
        .lock()
        .finish(&handle.conversation_id, StreamOutcome::Completed);
    Ok(())
}

async fn fail_stream(
    ctx: &StreamContext,
    handle: &StreamHandle,
    error: NormalizedError,
) -> Result<()> {
    let snapshot = {
        let mut store = ctx.store.lock();
        let Some(message) = store.message_mut(&handle.conversation_id, &handle.message_id) else {
            bail!("failure for unknown message {}", handle.message_id);
        };
        if !message.is_terminal() {
            message.fail(error.clone())?;
        }
        message.clone()
    };

    ctx.coordinator.persist_now(&snapshot).await?;
    ctx.streams
        .lock()
        .finish(&handle.conversation_id, StreamOutcome::Failed(error));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::models::delta::ErrorCode;
    use crate::providers::GeminiAdapter;
    use crate::repositories::{InMemoryMessageRepository, MessageRepository};

    fn context() -> (StreamContext, Arc<InMemoryMessageRepository>) {
        let repo = Arc::new(InMemoryMessageRepository::new());
        let coordinator = Arc::new(SyncCoordinator::new(repo.clone()));
        let mut registry = ProviderRegistry::new();
        registry
            .register(Arc::new(GeminiAdapter::new("test-key")))
            .unwrap();
        (
            StreamContext::new(coordinator, Arc::new(registry)),
            repo,
        )
    }

    fn params(conversation_id: &str, prompt: &str) -> GenerationParams {
        GenerationParams {
            conversation_id: conversation_id.to_string(),
            provider_id: "gemini".to_string(),
            model: "gemini-2.5-flash".to_string(),
            prompt: prompt.to_string(),
            attachments: vec![],
            config: RequestConfig::default(),
        }
    }

    fn text_chunk(text: &str) -> TransportEvent {
        TransportEvent::Chunk(json!({
            "candidates": [{ "content": { "parts": [{ "text": text }] } }]
        }))
    }

    #[tokio::test]
    async fn test_prompt_round_trip() {
        let (ctx, repo) = context();
        let generation = start_generation(&ctx, params("conv-1", "2+2?")).await.unwrap();
        assert!(generation.payload["contents"][0]["parts"][0]["text"] == "2+2?");

        let (tx, rx) = mpsc::channel(8);
        let driver = tokio::spawn(run_stream(
            ctx.clone(),
            generation.handle.clone(),
            generation.cancel.clone(),
            rx,
        ));

        tx.send(text_chunk("4")).await.unwrap();
        tx.send(TransportEvent::Chunk(json!({
            "candidates": [{ "finishReason": "STOP" }]
        })))
        .await
        .unwrap();
        driver.await.unwrap().unwrap();

        let store = ctx.store.lock();
        let message = store
            .message("conv-1", &generation.handle.message_id)
            .unwrap();
        assert_eq!(message.status, MessageStatus::Completed);
        assert_eq!(message.content.text, "4");
        assert_eq!(message.metadata.finish_reason.as_deref(), Some("STOP"));
        drop(store);

        // The terminal snapshot is durable.
        let record = repo
            .load_one(&generation.handle.message_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, MessageStatus::Completed);
        assert_eq!(record.content_text, "4");

        // The stream handle is released for the next turn.
        assert!(!ctx.streams.lock().is_streaming("conv-1"));
    }

    #[tokio::test]
    async fn test_second_generation_rejected_while_streaming() {
        let (ctx, _repo) = context();
        let _generation = start_generation(&ctx, params("conv-1", "first")).await.unwrap();

        let err = start_generation(&ctx, params("conv-1", "second"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("active stream"));

        // Other conversations are unaffected.
        start_generation(&ctx, params("conv-2", "elsewhere")).await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_chunk_fails_message_without_crash() {
        let (ctx, repo) = context();
        let generation = start_generation(&ctx, params("conv-1", "hi")).await.unwrap();

        let (tx, rx) = mpsc::channel(8);
        let driver = tokio::spawn(run_stream(
            ctx.clone(),
            generation.handle.clone(),
            generation.cancel.clone(),
            rx,
        ));

        tx.send(text_chunk("partial")).await.unwrap();
        tx.send(TransportEvent::Chunk(json!("not a chunk"))).await.unwrap();
        driver.await.unwrap().unwrap();

        let record = repo
            .load_one(&generation.handle.message_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, MessageStatus::Error);
        // Partial text survives the failure.
        assert_eq!(record.content_text, "partial");

        let store = ctx.store.lock();
        let message = store
            .message("conv-1", &generation.handle.message_id)
            .unwrap();
        let error = message.metadata.error.as_ref().unwrap();
        assert_eq!(error.phase, ErrorPhase::Parse);
        assert!(!error.retryable);
    }

    #[tokio::test]
    async fn test_transport_error_is_retryable() {
        let (ctx, _repo) = context();
        let generation = start_generation(&ctx, params("conv-1", "hi")).await.unwrap();

        let (tx, rx) = mpsc::channel(8);
        let driver = tokio::spawn(run_stream(
            ctx.clone(),
            generation.handle.clone(),
            generation.cancel.clone(),
            rx,
        ));

        tx.send(TransportEvent::Error(RawProviderError {
            status: Some(503),
            message: "overloaded".into(),
        }))
        .await
        .unwrap();
        driver.await.unwrap().unwrap();

        let store = ctx.store.lock();
        let message = store
            .message("conv-1", &generation.handle.message_id)
            .unwrap();
        assert_eq!(message.status, MessageStatus::Error);
        assert!(message.is_retryable_failure());
        drop(store);

        // The retry affordance creates a fresh message with a new request id
        // instead of mutating the failed one.
        let retry = start_generation(&ctx, params("conv-1", "hi")).await.unwrap();
        assert_ne!(retry.handle.request_id, generation.handle.request_id);
        assert_ne!(retry.handle.message_id, generation.handle.message_id);
    }

    #[tokio::test]
    async fn test_cancellation_drops_subsequent_deltas() {
        let (ctx, _repo) = context();
        let generation = start_generation(&ctx, params("conv-1", "hi")).await.unwrap();

        let (tx, rx) = mpsc::channel(8);
        let driver = tokio::spawn(run_stream(
            ctx.clone(),
            generation.handle.clone(),
            generation.cancel.clone(),
            rx,
        ));

        tx.send(text_chunk("before")).await.unwrap();
        // Give the driver a chance to fold the first delta.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        cancel_generation(&ctx, "conv-1").await.unwrap();

        // The transport keeps delivering; these must be discarded.
        tx.send(text_chunk(" after")).await.unwrap();
        drop(tx);
        driver.await.unwrap().unwrap();

        let store = ctx.store.lock();
        let message = store
            .message("conv-1", &generation.handle.message_id)
            .unwrap();
        assert_eq!(message.status, MessageStatus::Cancelled);
        assert_eq!(message.content.text, "before");
        drop(store);

        assert!(!ctx.streams.lock().is_streaming("conv-1"));
    }

    #[tokio::test]
    async fn test_transport_close_without_end_fails_stream() {
        let (ctx, _repo) = context();
        let generation = start_generation(&ctx, params("conv-1", "hi")).await.unwrap();

        let (tx, rx) = mpsc::channel(8);
        let driver = tokio::spawn(run_stream(
            ctx.clone(),
            generation.handle.clone(),
            generation.cancel.clone(),
            rx,
        ));

        tx.send(text_chunk("cut off")).await.unwrap();
        drop(tx);
        driver.await.unwrap().unwrap();

        let store = ctx.store.lock();
        let message = store
            .message("conv-1", &generation.handle.message_id)
            .unwrap();
        assert_eq!(message.status, MessageStatus::Error);
        assert_eq!(message.content.text, "cut off");
        let error = message.metadata.error.as_ref().unwrap();
        assert_eq!(error.code, ErrorCode::Transport);
        assert!(error.retryable);
    }

    #[tokio::test]
    async fn test_raw_stream_folds_into_transport_events() {
        let chunks: Vec<Result<serde_json::Value, RawProviderError>> =
            vec![Ok(json!({"a": 1})), Ok(json!({"b": 2}))];
        let events: Vec<TransportEvent> =
            into_transport_events(futures::stream::iter(chunks).boxed())
                .collect()
                .await;

        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], TransportEvent::Chunk(_)));
        assert!(matches!(events[2], TransportEvent::End(None)));

        let chunks: Vec<Result<serde_json::Value, RawProviderError>> = vec![
            Ok(json!({"a": 1})),
            Err(RawProviderError {
                status: Some(500),
                message: "boom".into(),
            }),
            Ok(json!({"never": "delivered"})),
        ];
        let events: Vec<TransportEvent> =
            into_transport_events(futures::stream::iter(chunks).boxed())
                .collect()
                .await;

        // The error terminates the sequence; nothing follows it.
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], TransportEvent::Error(_)));
    }

    #[tokio::test]
    async fn test_end_event_finalizes_without_finish_reason() {
        let (ctx, _repo) = context();
        let generation = start_generation(&ctx, params("conv-1", "hi")).await.unwrap();

        let (tx, rx) = mpsc::channel(8);
        let driver = tokio::spawn(run_stream(
            ctx.clone(),
            generation.handle.clone(),
            generation.cancel.clone(),
            rx,
        ));

        tx.send(text_chunk("done")).await.unwrap();
        tx.send(TransportEvent::End(None)).await.unwrap();
        driver.await.unwrap().unwrap();

        let store = ctx.store.lock();
        let message = store
            .message("conv-1", &generation.handle.message_id)
            .unwrap();
        assert_eq!(message.status, MessageStatus::Completed);
        assert_eq!(message.content.text, "done");
    }
}
