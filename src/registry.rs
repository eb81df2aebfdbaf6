use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use async_trait::async_trait;
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::config::{camera_id_from_path, load_camera_file, Config};
use crate::errors::{Result, VigilError};

const DEBOUNCE: Duration = Duration::from_millis(500);

/// A camera as the supervisor sees it: an id and an address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraEntry {
    pub id: String,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Added(CameraEntry),
    Updated(CameraEntry),
    Removed(String),
}

impl RegistryEvent {
    pub fn camera_id(&self) -> &str {
        match self {
            RegistryEvent::Added(entry) | RegistryEvent::Updated(entry) => &entry.id,
            RegistryEvent::Removed(id) => id,
        }
    }
}

/// Source of truth for which cameras should be running
#[async_trait]
pub trait CameraRegistry: Send + Sync {
    async fn list_cameras(&self) -> Result<Vec<CameraEntry>>;
}

/// Camera definitions stored as one JSON/TOML file per camera in a directory
pub struct DirectoryRegistry {
    dir: PathBuf,
}

impl DirectoryRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Watch the directory and translate file changes into registry events
    pub fn watch(&self) -> Result<mpsc::Receiver<RegistryEvent>> {
        let (raw_tx, mut raw_rx) = mpsc::channel::<Event>(100);

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if let Err(e) = raw_tx.blocking_send(event) {
                        error!("Failed to send file watcher event: {}", e);
                    }
                }
                Err(e) => error!("File watcher error: {}", e),
            },
            NotifyConfig::default(),
        )
        .map_err(|e| VigilError::config(format!("File watcher error: {}", e)))?;

        if !self.dir.exists() {
            info!("Creating cameras directory '{}' for watching...", self.dir.display());
            fs::create_dir_all(&self.dir)?;
        }
        watcher
            .watch(&self.dir, RecursiveMode::NonRecursive)
            .map_err(|e| VigilError::config(format!("Failed to watch cameras directory: {}", e)))?;
        info!("Watching cameras directory '{}' for configuration changes", self.dir.display());

        let (tx, rx) = mpsc::channel(100);
        tokio::spawn(async move {
            let _watcher = watcher;
            let mut last_events: HashMap<(String, bool), Instant> = HashMap::new();

            while let Some(event) = raw_rx.recv().await {
                for path in &event.paths {
                    let Some(registry_event) = registry_event_for(&event.kind, path) else {
                        continue;
                    };

                    // Debounce per camera and kind; a removal is never swallowed by an earlier write
                    let key = match &registry_event {
                        RegistryEvent::Removed(id) => (id.clone(), true),
                        RegistryEvent::Added(e) | RegistryEvent::Updated(e) => (e.id.clone(), false),
                    };
                    let now = Instant::now();
                    if last_events.get(&key).is_some_and(|last| now.duration_since(*last) < DEBOUNCE) {
                        continue;
                    }
                    last_events.insert(key, now);

                    if tx.send(registry_event).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}

/// Map one file-system change to a registry event. Disabling a camera counts as removal.
pub fn registry_event_for(kind: &EventKind, path: &Path) -> Option<RegistryEvent> {
    let camera_id = camera_id_from_path(path)?;
    match kind {
        EventKind::Remove(_) => Some(RegistryEvent::Removed(camera_id)),
        EventKind::Create(_) | EventKind::Modify(_) => {
            if !path.exists() {
                return Some(RegistryEvent::Removed(camera_id));
            }
            match load_camera_file(path) {
                Ok(camera) if !camera.is_enabled() => Some(RegistryEvent::Removed(camera_id)),
                Ok(camera) => {
                    let entry = CameraEntry { id: camera_id, address: camera.url };
                    if matches!(kind, EventKind::Create(_)) {
                        Some(RegistryEvent::Added(entry))
                    } else {
                        Some(RegistryEvent::Updated(entry))
                    }
                }
                // Editors often write files in several steps; wait for a parseable version
                Err(e) => {
                    warn!("Ignoring unreadable camera file {}: {}", path.display(), e);
                    None
                }
            }
        }
        _ => None,
    }
}

#[async_trait]
impl CameraRegistry for DirectoryRegistry {
    async fn list_cameras(&self) -> Result<Vec<CameraEntry>> {
        let dir = self.dir.to_string_lossy().to_string();
        let cameras = tokio::task::spawn_blocking(move || Config::load_cameras_from_directory(&dir))
            .await
            .map_err(|e| VigilError::config(format!("camera directory scan failed: {}", e)))??;

        let mut entries: Vec<CameraEntry> = cameras
            .into_iter()
            .filter(|(_, camera)| camera.is_enabled())
            .map(|(id, camera)| CameraEntry { id, address: camera.url })
            .collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entries)
    }
}
