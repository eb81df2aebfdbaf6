use std::path::{Path, PathBuf};
use clap::ValueEnum;
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::errors::{Result, VigilError};
use crate::processing::{ModeSwitch, ProcessingMode};

/// Parse a mode command such as `human` or ` Motion\n`
pub fn parse_mode(payload: &[u8]) -> Option<ProcessingMode> {
    let text = std::str::from_utf8(payload).ok()?.trim();
    ProcessingMode::from_str(text, true).ok()
}

/// Switch every camera to `mode`. Returns false when it was already active.
pub fn apply_mode(modes: &ModeSwitch, mode: ProcessingMode, origin: &str) -> bool {
    if modes.current() == mode {
        return false;
    }
    info!("Processing mode {} requested via {}", mode, origin);
    modes.set(mode);
    true
}

fn mode_from_config(path: &Path) -> Result<ProcessingMode> {
    let path = path
        .to_str()
        .ok_or_else(|| VigilError::config(format!("Config path is not valid UTF-8: {}", path.display())))?;
    Ok(Config::from_file(path)?.processing.mode)
}

/// Follow `[processing] mode` in the config file and apply edits at runtime.
/// Only a changed value in the file is applied, other edits leave the mode alone.
pub fn watch_config_mode(config_path: impl Into<PathBuf>, modes: ModeSwitch) -> Result<()> {
    let config_path: PathBuf = config_path.into();
    let file_name = config_path
        .file_name()
        .map(|name| name.to_os_string())
        .ok_or_else(|| VigilError::config(format!("Not a config file: {}", config_path.display())))?;
    let dir = match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let (raw_tx, mut raw_rx) = mpsc::channel::<Event>(32);
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if let Err(e) = raw_tx.blocking_send(event) {
                    error!("Failed to send config watcher event: {}", e);
                }
            }
            Err(e) => error!("Config watcher error: {}", e),
        },
        NotifyConfig::default(),
    )
    .map_err(|e| VigilError::config(format!("File watcher error: {}", e)))?;

    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .map_err(|e| VigilError::config(format!("Failed to watch {}: {}", dir.display(), e)))?;
    info!("Watching {} for processing mode changes", config_path.display());
    let mut file_mode = mode_from_config(&config_path).ok();

    tokio::spawn(async move {
        let _watcher = watcher;

        while let Some(event) = raw_rx.recv().await {
            if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                continue;
            }
            if !event.paths.iter().any(|p| p.file_name() == Some(file_name.as_os_str())) {
                continue;
            }
            let path = config_path.clone();
            match tokio::task::spawn_blocking(move || mode_from_config(&path)).await {
                Ok(Ok(mode)) if file_mode != Some(mode) => {
                    file_mode = Some(mode);
                    apply_mode(&modes, mode, "config file");
                }
                Ok(Ok(_)) => {}
                // Editors often write files in several steps; wait for a parseable version
                Ok(Err(e)) => warn!("Ignoring unreadable config {}: {}", config_path.display(), e),
                Err(e) => error!("Config reload task failed: {}", e),
            }
        }
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;

    #[test]
    fn parses_mode_commands_case_insensitively() {
        assert_eq!(parse_mode(b"human"), Some(ProcessingMode::Human));
        assert_eq!(parse_mode(b" Motion\n"), Some(ProcessingMode::Motion));
        assert_eq!(parse_mode(b"NONE"), Some(ProcessingMode::None));
        assert_eq!(parse_mode(b"thermal"), None);
        assert_eq!(parse_mode(&[0xff, 0xfe]), None);
    }

    #[test]
    fn apply_mode_reports_only_real_changes() {
        let modes = ModeSwitch::new(ProcessingMode::Human);
        let mut rx = modes.subscribe();

        assert!(!apply_mode(&modes, ProcessingMode::Human, "test"));
        assert!(!rx.has_changed().unwrap());

        assert!(apply_mode(&modes, ProcessingMode::Motion, "test"));
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), ProcessingMode::Motion);
        assert_eq!(modes.current(), ProcessingMode::Motion);
    }

    #[tokio::test]
    async fn config_edits_switch_the_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[processing]\nmode = \"human\"\n").unwrap();

        let modes = ModeSwitch::new(ProcessingMode::Human);
        let mut rx = modes.subscribe();
        watch_config_mode(&path, modes.clone()).unwrap();

        // A mode chosen elsewhere survives edits that keep the file's mode
        modes.set(ProcessingMode::Motion);
        fs::write(dir.path().join("other.toml"), "[processing]\nmode = \"none\"\n").unwrap();
        fs::write(&path, "[processing]\nmode = \"human\"\ntarget_fps = 1.0\n").unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(modes.current(), ProcessingMode::Motion);

        fs::write(&path, "[processing]\nmode = \"none\"\n").unwrap();
        tokio::time::timeout(Duration::from_secs(10), rx.wait_for(|mode| *mode == ProcessingMode::None))
            .await
            .expect("mode change not picked up")
            .unwrap();
        assert_eq!(modes.current(), ProcessingMode::None);
    }
}
