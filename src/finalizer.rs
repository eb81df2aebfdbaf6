use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::clip::FinishedClip;
use crate::database::{NewRecording, RecordingStore};
use crate::errors::Result;
use crate::notifier::{Event, Notifier};
use crate::transcoder::Transcoder;

/// Post-processing of finished clips: transcode, persist, notify.
///
/// Runs detached from the camera that produced the clip, so stopping a camera
/// never waits on transcoding.
#[derive(Clone)]
pub struct Finalizer {
    inner: Arc<FinalizerInner>,
}

struct FinalizerInner {
    transcoder: Option<Arc<dyn Transcoder>>,
    store: Arc<dyn RecordingStore>,
    notifier: Arc<dyn Notifier>,
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl Finalizer {
    pub fn new(
        transcoder: Option<Arc<dyn Transcoder>>,
        store: Arc<dyn RecordingStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            inner: Arc::new(FinalizerInner {
                transcoder,
                store,
                notifier,
                pending: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Queue a clip for finalization in the background
    pub async fn submit(&self, clip: FinishedClip) {
        let finalizer = self.clone();
        let handle = tokio::spawn(async move {
            let camera_id = clip.camera_id.clone();
            if let Err(e) = finalizer.finalize(clip).await {
                error!("[{}] Failed to save recording: {}", camera_id, e);
            }
        });

        let mut pending = self.inner.pending.lock().await;
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }

    /// Transcode (falling back to the raw file), persist and announce one clip
    pub async fn finalize(&self, clip: FinishedClip) -> Result<i64> {
        let file_path = self.playable_path(&clip).await;

        let recording = NewRecording {
            camera_id: clip.camera_id.clone(),
            file_path: file_path.to_string_lossy().to_string(),
            start_time: clip.start_time,
            end_time: clip.end_time,
        };
        let recording_id = self.inner.store.save_recording(&recording).await?;
        info!(
            "[{}] Saved recording {} at {}",
            clip.camera_id, recording_id, recording.file_path
        );

        self.inner.notifier.emit(Event::RecordingSaved {
            camera_id: clip.camera_id,
            recording_id,
            file_path: recording.file_path,
        });
        Ok(recording_id)
    }

    async fn playable_path(&self, clip: &FinishedClip) -> PathBuf {
        let Some(transcoder) = &self.inner.transcoder else {
            return clip.path.clone();
        };

        match transcoder.transcode(&clip.path).await {
            Ok(output) => {
                if let Err(e) = tokio::fs::remove_file(&clip.path).await {
                    warn!("[{}] Could not remove raw clip {}: {}", clip.camera_id, clip.path.display(), e);
                }
                output
            }
            Err(e) => {
                warn!("[{}] Transcoding failed, keeping raw clip {}: {}", clip.camera_id, clip.path.display(), e);
                clip.path.clone()
            }
        }
    }

    /// Wait for every submitted clip, including ones submitted while waiting
    pub async fn flush(&self) {
        loop {
            let handles: Vec<JoinHandle<()>> = {
                let mut pending = self.inner.pending.lock().await;
                pending.drain(..).collect()
            };
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    error!("Finalization task failed: {}", e);
                }
            }
        }
    }
}
