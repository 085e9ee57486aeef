//! Top-level wiring: state manager, dispatcher, watcher, and MIDI input
//! assembled into one running host.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use notify::Error as NotifyError;
use tracing::warn;

use crate::actions::{ActionSet, DefaultKeySender, DefaultMouseSender};
use crate::bus::EventBus;
use crate::dispatch::{spawn_dispatcher, DispatchMsg, DispatcherHandle, TriggerPulse};
use crate::midi::{spawn_midi_listener, MidiHandle};
use crate::script::{NullScriptHost, ScriptHost};
use crate::state::{BootstrapError, ReloadOutcome, RuntimeStateManager};
use crate::store::{CacheStore, StoreError};
use crate::watch::{watch_sources, WatchHandle};

const SCRIPT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(thiserror::Error, Debug)]
pub enum RuntimeError {
    #[error("bootstrap error: {0}")]
    Bootstrap(#[from] BootstrapError),
    #[error("watch error: {0}")]
    Watch(#[from] NotifyError),
    #[error("cache store error: {0}")]
    Store(#[from] StoreError),
}

pub struct Runtime {
    state: Arc<RuntimeStateManager>,
    bus: EventBus,
    dispatcher: DispatcherHandle,
    watch: WatchHandle,
    midi: Option<MidiHandle>,
}

impl Runtime {
    /// Bootstrap from `config_path` and bring every subsystem up. MIDI
    /// hardware is optional; everything else failing is fatal.
    pub async fn start(
        config_path: PathBuf,
        cache_dir: PathBuf,
    ) -> Result<Self, RuntimeError> {
        Self::start_with_scripts(config_path, cache_dir, Arc::new(NullScriptHost)).await
    }

    pub async fn start_with_scripts(
        config_path: PathBuf,
        cache_dir: PathBuf,
        scripts: Arc<dyn ScriptHost>,
    ) -> Result<Self, RuntimeError> {
        let bus = EventBus::new();
        let store = CacheStore::new(cache_dir, "bundle")?;
        let state = RuntimeStateManager::bootstrap(config_path.clone(), store, bus.clone())?;

        let actions = Arc::new(ActionSet {
            keys: Arc::new(DefaultKeySender::default()),
            mouse: Arc::new(DefaultMouseSender::default()),
            scripts,
            script_timeout: SCRIPT_TIMEOUT,
        });
        let dispatcher = spawn_dispatcher(state.subscribe(), bus.clone(), actions);

        let midi = match spawn_midi_listener("padforge", dispatcher.sender()) {
            Ok(handle) => handle,
            Err(err) => {
                warn!(target: "padforge::runtime", %err, "input unavailable, continuing without it");
                None
            }
        };

        let watch = watch_sources(config_path, state.clone())?;

        Ok(Self {
            state,
            bus,
            dispatcher,
            watch,
            midi,
        })
    }

    pub fn state(&self) -> &Arc<RuntimeStateManager> {
        &self.state
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn missed_triggers(&self) -> u64 {
        self.dispatcher.missed_triggers()
    }

    pub fn failed_invocations(&self) -> u64 {
        self.dispatcher.failed_invocations()
    }

    /// Feed a pulse as if it came from hardware. Used by the virtual
    /// console surface and by tests.
    pub fn inject_pulse(&self, pulse: TriggerPulse) {
        let _ = self.dispatcher.sender().send(DispatchMsg::Pulse(pulse));
    }

    pub fn device_gone(&self, device: impl Into<String>) {
        let _ = self
            .dispatcher
            .sender()
            .send(DispatchMsg::DeviceGone(device.into()));
    }

    pub async fn reload(&self) -> ReloadOutcome {
        self.state.reload().await
    }

    pub fn shutdown(self) {
        self.watch.abort();
        self.dispatcher.abort();
        if let Some(midi) = self.midi {
            midi.join_handle.abort();
        }
    }
}
