//! Per-attachment upload tasks.
//!
//! Each accepted media attachment gets an independent tokio task that streams
//! its bytes to the provider and reports back over the pipeline's event
//! channel. Tasks are isolated: one failing or being cancelled never touches
//! a sibling upload or the message stream.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::models::delta::NormalizedError;
use crate::providers::{ProviderAdapter, RemoteFile};

/// Events produced by upload tasks, applied to the bucket by its owner.
#[derive(Debug, Clone)]
pub enum UploadEvent {
    Progress {
        attachment_id: String,
        percent: u8,
    },
    Completed {
        attachment_id: String,
        file: RemoteFile,
    },
    Failed {
        attachment_id: String,
        error: NormalizedError,
    },
}

pub struct UploadTask {
    pub attachment_id: String,
    cancel_flag: Arc<AtomicBool>,
    #[allow(dead_code)]
    handle: JoinHandle<()>,
}

impl UploadTask {
    /// Start an upload in the background. Progress percentages from the
    /// adapter are forwarded as `UploadEvent::Progress` until the transfer
    /// resolves to `Completed` or `Failed`.
    pub fn spawn(
        adapter: Arc<dyn ProviderAdapter>,
        attachment_id: String,
        name: String,
        mime_type: String,
        bytes: Vec<u8>,
        events: mpsc::UnboundedSender<UploadEvent>,
    ) -> Self {
        let cancel_flag = Arc::new(AtomicBool::new(false));
        let cancel = cancel_flag.clone();
        let id = attachment_id.clone();

        let handle = tokio::spawn(async move {
            let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<u8>();
            let upload = adapter.upload_attachment(&name, &mime_type, bytes, progress_tx, cancel);
            tokio::pin!(upload);

            loop {
                tokio::select! {
                    Some(percent) = progress_rx.recv() => {
                        let _ = events.send(UploadEvent::Progress {
                            attachment_id: id.clone(),
                            percent,
                        });
                    }
                    result = &mut upload => {
                        match result {
                            Ok(file) => {
                                debug!(attachment_id = %id, uri = %file.uri, "Upload completed");
                                let _ = events.send(UploadEvent::Completed {
                                    attachment_id: id.clone(),
                                    file,
                                });
                            }
                            Err(error) => {
                                debug!(attachment_id = %id, error = %error, "Upload failed");
                                let _ = events.send(UploadEvent::Failed {
                                    attachment_id: id.clone(),
                                    error,
                                });
                            }
                        }
                        break;
                    }
                }
            }
        });

        Self {
            attachment_id,
            cancel_flag,
            handle,
        }
    }

    /// Request cooperative cancellation; the adapter observes the flag at its
    /// next suspension point.
    pub fn cancel(&self) {
        self.cancel_flag.store(true, Ordering::Relaxed);
    }
}
