//! Filesystem watcher that drives hot reloads.
//!
//! Notify events are debounced: editors typically emit several writes per
//! save, and a save-all across a split config directory lands as a burst.
//! Only after the burst goes quiet for the debounce window does one reload
//! run. Reload outcomes travel on the event bus, not through this module.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::state::RuntimeStateManager;

const DEBOUNCE: Duration = Duration::from_millis(250);

pub struct WatchHandle {
    pub join_handle: JoinHandle<()>,
    /// Keep watcher alive for lifetime of handle.
    _watcher: RecommendedWatcher,
}

impl WatchHandle {
    pub fn abort(&self) {
        self.join_handle.abort();
    }
}

/// Watch the config file or directory and reload on changes.
pub fn watch_sources(
    path: PathBuf,
    state: Arc<RuntimeStateManager>,
) -> notify::Result<WatchHandle> {
    let (notify_tx, mut notify_rx) = mpsc::channel(16);

    let mut watcher = notify::recommended_watcher({
        let notify_tx = notify_tx.clone();
        move |res| {
            let _ = notify_tx.blocking_send(res);
        }
    })?;

    let mode = if path.is_dir() {
        RecursiveMode::Recursive
    } else {
        RecursiveMode::NonRecursive
    };
    watcher.watch(&path, mode)?;

    let join_handle = tokio::spawn(async move {
        let mut deadline: Option<tokio::time::Instant> = None;

        loop {
            if let Some(next_deadline) = deadline {
                tokio::select! {
                    Some(event) = notify_rx.recv() => {
                        if let Ok(ev) = event {
                            if is_relevant(&ev.kind) {
                                deadline = Some(tokio::time::Instant::now() + DEBOUNCE);
                            }
                        } else {
                            break;
                        }
                    }
                    _ = tokio::time::sleep_until(next_deadline) => {
                        deadline = None;
                        debug!(target: "padforge::watch", "change burst settled, reloading");
                        state.reload().await;
                    }
                }
            } else {
                match notify_rx.recv().await {
                    Some(Ok(event)) => {
                        if is_relevant(&event.kind) {
                            deadline = Some(tokio::time::Instant::now() + DEBOUNCE);
                        }
                    }
                    Some(Err(_)) => {
                        // Ignore errors but continue listening.
                        deadline = Some(tokio::time::Instant::now() + DEBOUNCE);
                    }
                    None => break,
                }
            }
        }
    });

    Ok(WatchHandle {
        join_handle,
        _watcher: watcher,
    })
}

fn is_relevant(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_) | EventKind::Other
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{EventBus, ReloadNotice};
    use crate::store::CacheStore;
    use std::fs;

    fn config_yaml(extra_macro: bool) -> String {
        let mut yaml = String::from(
            "version: 1\nmacros:\n  copy:\n    status: ready\n    trigger:\n      type: note\n      number: 60\n    steps:\n      - type: keystroke\n        keys: [\"C\"]\n",
        );
        if extra_macro {
            yaml.push_str(
                "  paste:\n    status: ready\n    trigger:\n      type: note\n      number: 61\n    steps:\n      - type: keystroke\n        keys: [\"V\"]\n",
            );
        }
        yaml
    }

    #[tokio::test]
    async fn file_change_triggers_a_committed_reload() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config_path = dir.path().join("config.yaml");
        fs::write(&config_path, config_yaml(false)).expect("write config");

        let bus = EventBus::new();
        let store = CacheStore::new(dir.path().join("cache"), "bundle").expect("store");
        let state = RuntimeStateManager::bootstrap(config_path.clone(), store, bus.clone())
            .expect("bootstrap");
        let mut reload_rx = bus.subscribe_reload();

        let handle = watch_sources(config_path.clone(), state.clone()).expect("watch");
        fs::write(&config_path, config_yaml(true)).expect("rewrite config");

        let notice = tokio::time::timeout(Duration::from_secs(2), reload_rx.recv())
            .await
            .expect("timeout waiting for reload")
            .expect("channel closed");
        assert!(matches!(notice, ReloadNotice::Committed { .. }));
        assert_eq!(state.current().body.macros.len(), 2);
        handle.abort();
    }

    #[tokio::test]
    async fn directory_watch_picks_up_new_files() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config_dir = dir.path().join("config");
        fs::create_dir_all(&config_dir).expect("mkdir");
        fs::write(config_dir.join("main.yaml"), config_yaml(false)).expect("write");

        let bus = EventBus::new();
        let store = CacheStore::new(dir.path().join("cache"), "bundle").expect("store");
        let state = RuntimeStateManager::bootstrap(config_dir.clone(), store, bus.clone())
            .expect("bootstrap");
        let mut reload_rx = bus.subscribe_reload();

        let handle = watch_sources(config_dir.clone(), state.clone()).expect("watch");
        fs::write(
            config_dir.join("extra.yaml"),
            "macros:\n  paste:\n    status: ready\n    trigger:\n      type: note\n      number: 61\n    steps:\n      - type: keystroke\n        keys: [\"V\"]\n",
        )
        .expect("write extra");

        let notice = tokio::time::timeout(Duration::from_secs(2), reload_rx.recv())
            .await
            .expect("timeout waiting for reload")
            .expect("channel closed");
        assert!(matches!(notice, ReloadNotice::Committed { .. }));
        assert_eq!(state.current().body.macros.len(), 2);
        handle.abort();
    }
}
