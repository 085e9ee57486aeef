//! Single-owner runtime state and the hot-reload protocol.
//!
//! The manager is the only writer of the active cache pointer. Readers hold
//! a `watch` receiver (or call `current()`) and always observe either the
//! pre-reload or the post-reload bundle in full: bundles are immutable once
//! staged, and the swap is a single channel send.
//!
//! Reload walks `Merging → Validating → Compiling → Staging → Committed`;
//! any blocking failure short-circuits to `RolledBack` without touching the
//! active pointer, and the attempt's diagnostics go out on the `reload`
//! topic either way.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use cache_compiler::compile_merged;
use cache_model::CacheBundle;
use config_core::{merge_path, validate_config, Diagnostic, IssueCode, Severity};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::bus::{EventBus, ReloadNotice};
use crate::store::{CacheStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// Pipeline succeeded; the active bundle was swapped.
    Committed,
    /// A blocking error rolled the attempt back; state is unchanged.
    Rejected,
    /// A reload was already in flight; this request was folded into it.
    Coalesced,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("no usable cache: fresh compile failed and no prior artifact exists")]
    NoUsableCache(Vec<Diagnostic>),
    #[error("cache store error: {0}")]
    Store(#[from] StoreError),
}

pub struct RuntimeStateManager {
    source_path: PathBuf,
    store: CacheStore,
    bus: EventBus,
    active: watch::Sender<Arc<CacheBundle>>,
    diagnostics: Mutex<Vec<Diagnostic>>,
    reload_busy: tokio::sync::Mutex<()>,
    reload_pending: AtomicBool,
}

impl RuntimeStateManager {
    /// Start serving. Prefers a previously committed artifact whose source
    /// hash matches the current merged sources (skipping recompilation);
    /// otherwise runs the full pipeline. Falls back through the history
    /// ring on integrity failures. Fatal only when nothing usable exists.
    pub fn bootstrap(
        source_path: impl Into<PathBuf>,
        store: CacheStore,
        bus: EventBus,
    ) -> Result<Arc<Self>, BootstrapError> {
        let source_path = source_path.into();
        let manager = Arc::new(Self {
            source_path,
            store,
            bus,
            active: watch::channel(Arc::new(CacheBundle::empty())).0,
            diagnostics: Mutex::new(Vec::new()),
            reload_busy: tokio::sync::Mutex::new(()),
            reload_pending: AtomicBool::new(false),
        });
        manager.bootstrap_inner()?;
        Ok(manager)
    }

    fn bootstrap_inner(&self) -> Result<(), BootstrapError> {
        let merged = match merge_path(&self.source_path) {
            Ok(merged) => Some(merged),
            Err(err) => {
                warn!(target: "padforge::state", %err, "bootstrap merge failed");
                self.set_diagnostics(vec![err.to_diagnostic()]);
                None
            }
        };

        if let Some(merged) = &merged {
            // A committed artifact compiled from these exact sources is
            // adopted as-is.
            match self.store.load_active() {
                Ok(bundle) if bundle.header.source_hash == merged.source_hash => {
                    info!(
                        target: "padforge::state",
                        source_hash = bundle.header.source_hash,
                        "adopting committed cache, sources unchanged"
                    );
                    // The artifact carries no diagnostics; re-validate so
                    // warnings from the original compile stay visible.
                    self.set_diagnostics(validate_config(&merged.config, &merged.files));
                    self.swap(Arc::new(bundle));
                    return Ok(());
                }
                Ok(bundle) => {
                    debug!(
                        target: "padforge::state",
                        cached = bundle.header.source_hash,
                        current = merged.source_hash,
                        "stale cache on disk, recompiling"
                    );
                }
                Err(StoreError::NoActive(_)) => {}
                Err(err) => {
                    warn!(target: "padforge::state", %err, "active cache unreadable, trying history");
                    for bundle in self.store.load_history()? {
                        if bundle.header.source_hash == merged.source_hash {
                            info!(
                                target: "padforge::state",
                                "adopting history entry after integrity failure"
                            );
                            self.set_diagnostics(validate_config(&merged.config, &merged.files));
                            self.swap(Arc::new(bundle));
                            return Ok(());
                        }
                    }
                }
            }

            match compile_merged(merged) {
                Ok(output) => {
                    let staged = self.store.stage(&output.bundle)?;
                    self.store.commit(staged)?;
                    self.set_diagnostics(output.diagnostics);
                    self.swap(Arc::new(output.bundle));
                    return Ok(());
                }
                Err(err) => {
                    let diagnostics = err.into_diagnostics();
                    warn!(
                        target: "padforge::state",
                        errors = diagnostics.len(),
                        "bootstrap compile failed"
                    );
                    self.set_diagnostics(diagnostics);
                }
            }
        }

        // Sources are unusable. Serve any intact prior artifact (stale is
        // better than nothing at startup) and report the failure on the bus.
        let fallback = match self.store.load_active() {
            Ok(bundle) => Some(bundle),
            Err(_) => self.store.load_history()?.into_iter().next(),
        };
        match fallback {
            Some(bundle) => {
                warn!(
                    target: "padforge::state",
                    source_hash = bundle.header.source_hash,
                    "serving prior cache; current sources do not compile"
                );
                let diagnostics = self.diagnostics();
                self.bus.publish_reload(ReloadNotice::Rejected {
                    diagnostics: diagnostics.clone(),
                });
                self.swap(Arc::new(bundle));
                Ok(())
            }
            None => Err(BootstrapError::NoUsableCache(self.diagnostics())),
        }
    }

    /// Re-run the pipeline. One reload in flight at a time; a request that
    /// arrives mid-flight is coalesced into one more pass by the in-flight
    /// worker.
    pub async fn reload(&self) -> ReloadOutcome {
        let mut outcome = ReloadOutcome::Coalesced;
        loop {
            match self.reload_busy.try_lock() {
                Ok(_guard) => {
                    outcome = self.reload_once();
                    while self.reload_pending.swap(false, Ordering::SeqCst) {
                        outcome = self.reload_once();
                    }
                }
                Err(_) => {
                    // The lock holder drains the pending flag before
                    // releasing, so this request is served by its next pass.
                    self.reload_pending.store(true, Ordering::SeqCst);
                    return outcome;
                }
            }
            // The guard is released here. A request can slip in between the
            // final drain above and the release; re-check so it is served
            // now instead of waiting for an unrelated future reload.
            if !self.reload_pending.load(Ordering::SeqCst) {
                return outcome;
            }
        }
    }

    fn reload_once(&self) -> ReloadOutcome {
        debug!(target: "padforge::state", phase = "merging", "reload started");
        let merged = match merge_path(&self.source_path) {
            Ok(merged) => merged,
            Err(err) => return self.roll_back(vec![err.to_diagnostic()]),
        };

        debug!(target: "padforge::state", phase = "validating", "sources merged");
        let output = match compile_merged(&merged) {
            Ok(output) => output,
            Err(err) => return self.roll_back(err.into_diagnostics()),
        };

        debug!(target: "padforge::state", phase = "staging", "bundle compiled");
        let staged = match self.store.stage(&output.bundle) {
            Ok(staged) => staged,
            Err(err) => return self.roll_back(vec![store_diagnostic(&err)]),
        };
        if let Err(err) = self.store.commit(staged) {
            return self.roll_back(vec![store_diagnostic(&err)]);
        }

        self.set_diagnostics(output.diagnostics.clone());
        self.swap(Arc::new(output.bundle));
        info!(
            target: "padforge::state",
            phase = "committed",
            source_hash = merged.source_hash,
            warnings = output.diagnostics.len(),
            "reload committed"
        );
        self.bus.publish_reload(ReloadNotice::Committed {
            diagnostics: output.diagnostics,
        });
        ReloadOutcome::Committed
    }

    fn roll_back(&self, diagnostics: Vec<Diagnostic>) -> ReloadOutcome {
        warn!(
            target: "padforge::state",
            phase = "rolled_back",
            findings = diagnostics.len(),
            "reload rejected, previous bundle stays active"
        );
        self.set_diagnostics(diagnostics.clone());
        self.bus.publish_reload(ReloadNotice::Rejected { diagnostics });
        ReloadOutcome::Rejected
    }

    /// The active bundle. Never blocks on an in-flight reload.
    pub fn current(&self) -> Arc<CacheBundle> {
        self.active.borrow().clone()
    }

    /// Receiver observing every committed swap.
    pub fn subscribe(&self) -> watch::Receiver<Arc<CacheBundle>> {
        self.active.subscribe()
    }

    /// Diagnostics from the most recent pipeline run (committed or not).
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics.lock().map(|d| d.clone()).unwrap_or_default()
    }

    fn set_diagnostics(&self, diagnostics: Vec<Diagnostic>) {
        if let Ok(mut slot) = self.diagnostics.lock() {
            *slot = diagnostics;
        }
    }

    fn swap(&self, bundle: Arc<CacheBundle>) {
        self.active.send_replace(bundle);
    }
}

fn store_diagnostic(err: &StoreError) -> Diagnostic {
    Diagnostic::new(
        IssueCode::CacheIntegrity,
        Severity::Error,
        "<store>",
        err.to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    fn ready_macro(id: &str, note: u8, key: &str) -> String {
        format!(
            "  {id}:\n    status: ready\n    trigger:\n      type: note\n      number: {note}\n    steps:\n      - type: keystroke\n        keys: [\"{key}\"]\n"
        )
    }

    fn write_config(path: &Path, macros: &[(&str, u8, &str)]) {
        let mut yaml = String::from("version: 1\nmacros:\n");
        for (id, note, key) in macros {
            yaml.push_str(&ready_macro(id, *note, key));
        }
        fs::write(path, yaml).expect("write config");
    }

    fn setup(macros: &[(&str, u8, &str)]) -> (tempfile::TempDir, PathBuf, Arc<RuntimeStateManager>, EventBus) {
        let dir = tempfile::tempdir().expect("temp dir");
        let config_path = dir.path().join("config.yaml");
        write_config(&config_path, macros);
        let store = CacheStore::new(dir.path().join("cache"), "bundle").expect("store");
        let bus = EventBus::new();
        let state = RuntimeStateManager::bootstrap(config_path.clone(), store, bus.clone())
            .expect("bootstrap");
        (dir, config_path, state, bus)
    }

    #[tokio::test]
    async fn bootstrap_compiles_fresh_bundle() {
        let (_dir, _path, state, _bus) = setup(&[("copy", 60, "C")]);
        let bundle = state.current();
        assert_eq!(bundle.body.macros.len(), 1);
        assert_eq!(bundle.body.macros[0].id, "copy");
        assert_ne!(bundle.header.source_hash, 0);
    }

    #[tokio::test]
    async fn bootstrap_adopts_matching_cache_without_recompiling() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config_path = dir.path().join("config.yaml");
        write_config(&config_path, &[("copy", 60, "C")]);
        let cache_dir = dir.path().join("cache");
        let bus = EventBus::new();

        let first = RuntimeStateManager::bootstrap(
            config_path.clone(),
            CacheStore::new(&cache_dir, "bundle").expect("store"),
            bus.clone(),
        )
        .expect("first bootstrap");
        let first_header = first.current().header.clone();

        let second = RuntimeStateManager::bootstrap(
            config_path.clone(),
            CacheStore::new(&cache_dir, "bundle").expect("store"),
            bus,
        )
        .expect("second bootstrap");
        // Identical header (including timestamp) proves the artifact was
        // adopted, not rebuilt.
        assert_eq!(second.current().header, first_header);
    }

    #[tokio::test]
    async fn bootstrap_discards_stale_cache() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config_path = dir.path().join("config.yaml");
        write_config(&config_path, &[("copy", 60, "C")]);
        let cache_dir = dir.path().join("cache");

        let first = RuntimeStateManager::bootstrap(
            config_path.clone(),
            CacheStore::new(&cache_dir, "bundle").expect("store"),
            EventBus::new(),
        )
        .expect("first bootstrap");
        let old_hash = first.current().header.source_hash;

        write_config(&config_path, &[("copy", 60, "C"), ("paste", 61, "V")]);
        let second = RuntimeStateManager::bootstrap(
            config_path,
            CacheStore::new(&cache_dir, "bundle").expect("store"),
            EventBus::new(),
        )
        .expect("second bootstrap");
        let bundle = second.current();
        assert_ne!(bundle.header.source_hash, old_hash);
        assert_eq!(bundle.body.macros.len(), 2);
    }

    #[tokio::test]
    async fn bootstrap_fails_without_sources_or_cache() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config_path = dir.path().join("config.yaml");
        fs::write(&config_path, "version: [broken\n").expect("write");
        let store = CacheStore::new(dir.path().join("cache"), "bundle").expect("store");
        match RuntimeStateManager::bootstrap(config_path, store, EventBus::new()) {
            Err(BootstrapError::NoUsableCache(diags)) => assert!(!diags.is_empty()),
            Err(other) => panic!("expected fatal bootstrap, got {other:?}"),
            Ok(_) => panic!("bootstrap should not succeed"),
        }
    }

    #[tokio::test]
    async fn successful_reload_swaps_bundle_and_notifies() {
        let (_dir, config_path, state, bus) = setup(&[("copy", 60, "C")]);
        let mut reload_rx = bus.subscribe_reload();

        write_config(&config_path, &[("copy", 60, "C"), ("paste", 61, "V")]);
        assert_eq!(state.reload().await, ReloadOutcome::Committed);

        assert_eq!(state.current().body.macros.len(), 2);
        assert!(matches!(
            reload_rx.recv().await.expect("notice"),
            ReloadNotice::Committed { .. }
        ));
    }

    #[tokio::test]
    async fn failed_reload_keeps_previous_bundle() {
        let (_dir, config_path, state, bus) = setup(&[("copy", 60, "C")]);
        let before = state.current().header.source_hash;
        let mut reload_rx = bus.subscribe_reload();

        // Ready macro with an out-of-range note: blocking error.
        fs::write(
            &config_path,
            "version: 1\nmacros:\n  bad:\n    status: ready\n    trigger:\n      type: note\n      number: 200\n    steps:\n      - type: keystroke\n        keys: [\"X\"]\n",
        )
        .expect("write");
        assert_eq!(state.reload().await, ReloadOutcome::Rejected);

        assert_eq!(state.current().header.source_hash, before);
        match reload_rx.recv().await.expect("notice") {
            ReloadNotice::Rejected { diagnostics } => {
                assert!(config_core::has_blocking(&diagnostics));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn bootstrap_adoption_still_reports_validation_findings() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config_path = dir.path().join("config.yaml");
        // Two ready macros on the same note: compiles with a conflict
        // warning.
        write_config(&config_path, &[("alpha", 60, "A"), ("beta", 60, "B")]);
        let cache_dir = dir.path().join("cache");

        let first = RuntimeStateManager::bootstrap(
            config_path.clone(),
            CacheStore::new(&cache_dir, "bundle").expect("store"),
            EventBus::new(),
        )
        .expect("first bootstrap");
        let compiled_diags = first.diagnostics();
        assert!(compiled_diags
            .iter()
            .any(|d| d.code == IssueCode::Conflict));

        // Second start adopts the committed artifact without recompiling
        // but must surface the same findings.
        let second = RuntimeStateManager::bootstrap(
            config_path,
            CacheStore::new(&cache_dir, "bundle").expect("store"),
            EventBus::new(),
        )
        .expect("second bootstrap");
        let adopted_diags = second.diagnostics();
        assert!(adopted_diags
            .iter()
            .any(|d| d.code == IssueCode::Conflict));
        assert_eq!(adopted_diags.len(), compiled_diags.len());
    }

    #[tokio::test]
    async fn reload_while_busy_is_coalesced() {
        let (_dir, config_path, state, _bus) = setup(&[("copy", 60, "C")]);
        write_config(&config_path, &[("copy", 60, "C"), ("paste", 61, "V")]);

        let guard = state.reload_busy.lock().await;
        assert_eq!(state.reload().await, ReloadOutcome::Coalesced);
        assert!(state.reload_pending.load(Ordering::SeqCst));
        // Nothing swapped while the in-flight pass owns the pipeline.
        assert_eq!(state.current().body.macros.len(), 1);
        drop(guard);
    }

    #[tokio::test]
    async fn queued_request_is_drained_before_reload_returns() {
        let (_dir, config_path, state, _bus) = setup(&[("copy", 60, "C")]);
        write_config(&config_path, &[("copy", 60, "C"), ("paste", 61, "V")]);

        // A request recorded while a pass was in flight must be served by
        // the worker itself, not deferred to some future reload.
        state.reload_pending.store(true, Ordering::SeqCst);
        assert_eq!(state.reload().await, ReloadOutcome::Committed);
        assert_eq!(state.current().body.macros.len(), 2);
        assert!(!state.reload_pending.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reload_requests_all_get_served() {
        let (_dir, config_path, state, _bus) = setup(&[("copy", 60, "C")]);
        write_config(&config_path, &[("copy", 60, "C"), ("paste", 61, "V")]);

        let mut joins = Vec::new();
        for _ in 0..8 {
            let state = state.clone();
            joins.push(tokio::spawn(async move { state.reload().await }));
        }
        for join in joins {
            join.await.expect("reload task");
        }

        // Whatever mix of committed and coalesced outcomes the race
        // produced, the rewrite is live and no request is left hanging.
        assert_eq!(state.current().body.macros.len(), 2);
        assert!(!state.reload_pending.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn history_is_bounded_after_many_reloads() {
        let (dir, config_path, state, _bus) = setup(&[("copy", 60, "C")]);
        for (id, note) in [("m1", 61u8), ("m2", 62), ("m3", 63), ("m4", 64)] {
            write_config(&config_path, &[("copy", 60, "C"), (id, note, "X")]);
            assert_eq!(state.reload().await, ReloadOutcome::Committed);
        }
        let store = CacheStore::new(dir.path().join("cache"), "bundle").expect("store");
        assert_eq!(store.history_paths().expect("paths").len(), 2);
    }
}
