use std::collections::HashMap;
use std::sync::Arc;
use futures_util::future::join_all;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::camera_loop::{self, CameraSnapshot, PipelineContext};
use crate::errors::Result;
use crate::registry::{CameraRegistry, RegistryEvent};
use crate::signal::StopSignal;

/// A running ingestion loop and the means to stop it
struct IngestionSession {
    address: String,
    stop: StopSignal,
    task: JoinHandle<()>,
}

impl IngestionSession {
    async fn shutdown(self, camera_id: &str) {
        self.stop.trigger();
        if let Err(e) = self.task.await {
            error!("[{}] Ingestion loop ended abnormally: {}", camera_id, e);
        }
    }
}

#[derive(Default)]
struct CameraSlot {
    session: Option<IngestionSession>,
    retired: bool,
}

/// Owns one ingestion loop per camera id.
///
/// Every operation on a camera holds that camera's slot lock for its whole
/// duration, so start/stop/restart of the same camera are serialized while
/// different cameras never wait on each other.
pub struct Supervisor {
    ctx: Arc<PipelineContext>,
    slots: RwLock<HashMap<String, Arc<Mutex<CameraSlot>>>>,
    statuses: RwLock<HashMap<String, watch::Receiver<CameraSnapshot>>>,
}

impl Supervisor {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self {
            ctx,
            slots: RwLock::new(HashMap::new()),
            statuses: RwLock::new(HashMap::new()),
        }
    }

    /// Lock the slot for `camera_id`, creating it when missing. A slot retired
    /// by a concurrent stop is replaced rather than reused.
    async fn lock_slot(&self, camera_id: &str) -> tokio::sync::OwnedMutexGuard<CameraSlot> {
        loop {
            let slot = {
                let mut slots = self.slots.write().await;
                slots.entry(camera_id.to_string()).or_default().clone()
            };
            let guard = slot.lock_owned().await;
            if !guard.retired {
                return guard;
            }
        }
    }

    /// Start ingestion for a camera, replacing (and fully joining) any loop it already has
    pub async fn start(&self, camera_id: &str, address: &str) {
        let mut slot = self.lock_slot(camera_id).await;

        if let Some(previous) = slot.session.take() {
            info!(
                "[{}] Restarting ingestion: {} -> {}",
                camera_id, previous.address, address
            );
            previous.shutdown(camera_id).await;
        }

        let stop = StopSignal::new();
        let (task, status) = camera_loop::spawn(camera_id, address, self.ctx.clone(), stop.clone());
        self.statuses.write().await.insert(camera_id.to_string(), status);
        slot.session = Some(IngestionSession {
            address: address.to_string(),
            stop,
            task,
        });
        info!("[{}] Camera started", camera_id);
    }

    /// Stop a camera and drop all of its state. Returns false when nothing was running.
    ///
    /// Waits until the loop has exited, which includes handing off an active recording.
    pub async fn stop(&self, camera_id: &str) -> bool {
        let exists = self.slots.read().await.contains_key(camera_id);
        if !exists {
            return false;
        }

        let mut slot = self.lock_slot(camera_id).await;
        let session = slot.session.take();
        let was_running = session.is_some();

        if let Some(session) = session {
            info!("[{}] Stopping camera", camera_id);
            session.shutdown(camera_id).await;
        }

        slot.retired = true;
        self.slots.write().await.remove(camera_id);
        self.statuses.write().await.remove(camera_id);
        drop(slot);

        if was_running {
            info!("[{}] Camera stopped", camera_id);
        }
        was_running
    }

    /// Stop every camera concurrently and wait for all of them
    pub async fn stop_all(&self) {
        let camera_ids = self.running_cameras().await;
        info!("Stopping {} cameras", camera_ids.len());
        join_all(camera_ids.iter().map(|id| self.stop(id))).await;
    }

    pub async fn snapshot(&self, camera_id: &str) -> Option<CameraSnapshot> {
        self.statuses
            .read()
            .await
            .get(camera_id)
            .map(|rx| rx.borrow().clone())
    }

    pub async fn running_cameras(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.statuses.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Start every camera the registry lists
    pub async fn start_from_registry(&self, registry: &dyn CameraRegistry) -> Result<usize> {
        let cameras = registry.list_cameras().await?;
        for camera in &cameras {
            self.start(&camera.id, &camera.address).await;
        }
        Ok(cameras.len())
    }

    pub async fn apply(&self, event: RegistryEvent) {
        match event {
            RegistryEvent::Added(camera) => {
                info!("Camera '{}' added", camera.id);
                self.start(&camera.id, &camera.address).await;
            }
            RegistryEvent::Updated(camera) => {
                info!("Camera '{}' updated", camera.id);
                self.start(&camera.id, &camera.address).await;
            }
            RegistryEvent::Removed(camera_id) => {
                info!("Camera '{}' removed", camera_id);
                if !self.stop(&camera_id).await {
                    warn!("Camera '{}' was not running", camera_id);
                }
            }
        }
    }

    /// Apply registry events until the channel closes and every queued event
    /// has been applied. Events for one camera are applied in order by a
    /// per-camera worker; a slow stop of one camera does not hold up the others.
    pub async fn follow_registry(self: Arc<Self>, events: mpsc::Receiver<RegistryEvent>) {
        RegistryFollower::new(self).run(events).await;
    }
}

struct RegistryWorker {
    tx: mpsc::UnboundedSender<RegistryEvent>,
    pending: usize,
    removed: bool,
}

/// Routes registry events to per-camera workers and drops idle workers of removed cameras
struct RegistryFollower {
    supervisor: Arc<Supervisor>,
    workers: HashMap<String, RegistryWorker>,
    done_tx: mpsc::UnboundedSender<String>,
    done_rx: mpsc::UnboundedReceiver<String>,
}

impl RegistryFollower {
    fn new(supervisor: Arc<Supervisor>) -> Self {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        Self {
            supervisor,
            workers: HashMap::new(),
            done_tx,
            done_rx,
        }
    }

    async fn run(mut self, mut events: mpsc::Receiver<RegistryEvent>) {
        let mut events_open = true;

        while events_open || !self.workers.is_empty() {
            tokio::select! {
                event = events.recv(), if events_open => match event {
                    Some(event) => self.dispatch(event),
                    None => {
                        events_open = false;
                        self.workers.retain(|_, worker| worker.pending > 0);
                    }
                },
                Some(camera_id) = self.done_rx.recv() => self.complete(&camera_id, !events_open),
            }
        }
    }

    fn dispatch(&mut self, event: RegistryEvent) {
        let camera_id = event.camera_id().to_string();
        let removed = matches!(event, RegistryEvent::Removed(_));

        let event = match self.workers.get_mut(&camera_id) {
            Some(worker) => match worker.tx.send(event) {
                Ok(()) => {
                    worker.pending += 1;
                    worker.removed = removed;
                    return;
                }
                Err(mpsc::error::SendError(event)) => event,
            },
            None => event,
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let supervisor = self.supervisor.clone();
        let done = self.done_tx.clone();
        let worker_camera = camera_id.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                supervisor.apply(event).await;
                if done.send(worker_camera.clone()).is_err() {
                    break;
                }
            }
        });

        let pending = match tx.send(event) {
            Ok(()) => 1,
            Err(_) => {
                warn!("[{}] Registry worker exited before receiving an event", camera_id);
                0
            }
        };
        self.workers.insert(camera_id, RegistryWorker { tx, pending, removed });
    }

    /// One event for `camera_id` has been applied. An idle worker is dropped once
    /// its camera was removed or no more events can arrive.
    fn complete(&mut self, camera_id: &str, closing: bool) {
        let Some(worker) = self.workers.get_mut(camera_id) else {
            return;
        };
        worker.pending = worker.pending.saturating_sub(1);
        if worker.pending == 0 && (worker.removed || closing) {
            self.workers.remove(camera_id);
            debug!("[{}] Registry worker released", camera_id);
        }
    }
}
