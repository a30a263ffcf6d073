//! Hot reload for `convoy.toml`.
//!
//! The watcher observes the config file's parent directory, so editors that
//! save by renaming a temporary file over the original are still noticed.
//! Bursts of events are collapsed: the file is re-read once no further event
//! has arrived for the debounce window.

use convoy_core::{ConvoyError, ConvoyResult};
use convoy_orchestrator::ConvoyConfig;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Keeps the file-system watch alive. Dropping it ends the reload thread.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    /// Watch `config_path` and call `on_reload` on a background thread with
    /// every successfully parsed and validated revision. Invalid revisions
    /// are logged and skipped.
    pub fn start<F>(config_path: PathBuf, debounce: Duration, on_reload: F) -> ConvoyResult<Self>
    where
        F: Fn(ConvoyConfig) + Send + 'static,
    {
        let file_name = config_path
            .file_name()
            .map(ToOwned::to_owned)
            .ok_or_else(|| ConvoyError::Config(format!("'{}' is not a file path", config_path.display())))?;
        let dir = match config_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let (tx, rx) = mpsc::channel::<()>();
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            let Ok(event) = res else { return };
            if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                return;
            }
            if event.paths.iter().any(|p| p.file_name() == Some(file_name.as_os_str())) {
                let _ = tx.send(());
            }
        })
        .map_err(|e| ConvoyError::Config(format!("Failed to create file watcher: {e}")))?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| ConvoyError::Config(format!("Failed to watch '{}': {e}", dir.display())))?;

        let path = config_path.clone();
        std::thread::spawn(move || {
            while rx.recv().is_ok() {
                // Quiet period: keep waiting while events keep coming.
                loop {
                    match rx.recv_timeout(debounce) {
                        Ok(()) => continue,
                        Err(RecvTimeoutError::Timeout) => break,
                        Err(RecvTimeoutError::Disconnected) => return,
                    }
                }
                match ConvoyConfig::load(&path) {
                    Ok(config) => {
                        info!(path = %path.display(), "Config reloaded");
                        on_reload(config);
                    }
                    Err(e) => warn!(error = %e, "Ignoring invalid config revision"),
                }
            }
            debug!("Config watcher thread exiting");
        });

        info!(path = %config_path.display(), "Config hot-reload watcher started");
        Ok(Self { _watcher: watcher })
    }
}

/// Load `path` if it exists, otherwise fall back to the defaults.
pub fn load_or_default(path: &Path) -> ConvoyResult<ConvoyConfig> {
    if path.exists() {
        ConvoyConfig::load(path)
    } else {
        debug!(path = %path.display(), "Config file not found, using defaults");
        Ok(ConvoyConfig::default())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_or_default(&dir.path().join("convoy.toml")).unwrap();
        assert_eq!(config.scheduler.max_concurrent_tasks, 5);
        assert!(config.agents.is_empty());
    }

    #[test]
    fn test_existing_file_is_parsed() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            tmp.as_file_mut(),
            r#"
[scheduler]
max_concurrent_tasks = 2

[[agents]]
id = "e1"
agent_type = "echo"
"#
        )
        .unwrap();
        let config = load_or_default(tmp.path()).unwrap();
        assert_eq!(config.scheduler.max_concurrent_tasks, 2);
        assert_eq!(config.agents[0].kind, "echo");
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp.as_file_mut(), "[scheduler]\nmax_concurrent_tasks = 0").unwrap();
        assert!(load_or_default(tmp.path()).is_err());
    }

    #[test]
    fn test_watcher_reports_new_revision() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("convoy.toml");
        std::fs::write(&path, "[scheduler]\nmax_concurrent_tasks = 1\n").unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _watcher = ConfigWatcher::start(path.clone(), Duration::from_millis(50), move |c| {
            sink.lock().unwrap().push(c.scheduler.max_concurrent_tasks);
        })
        .unwrap();

        std::thread::sleep(Duration::from_millis(100));
        std::fs::write(&path, "[scheduler]\nmax_concurrent_tasks = 7\n").unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while seen.lock().unwrap().is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(seen.lock().unwrap().last(), Some(&7));
    }
}
