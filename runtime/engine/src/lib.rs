pub mod actions;
pub mod bus;
pub mod dispatch;
pub mod hold;
pub mod midi;
pub mod runtime;
pub mod script;
pub mod state;
pub mod store;
pub mod telemetry;
pub mod timer;
pub mod watch;

pub use actions::{
    ActionSet, DefaultKeySender, DefaultMouseSender, KeySender, MouseSender, StepError,
};
pub use bus::{ActionNotice, EventBus, ReloadNotice, StepOutcome, TriggerNotice};
pub use dispatch::{
    spawn_dispatcher, DispatchMsg, DispatcherHandle, PulseEdge, PulseKind, TriggerPulse,
};
pub use runtime::{Runtime, RuntimeError};
pub use script::{NullScriptHost, ScriptContext, ScriptError, ScriptHost, ScriptOutcome};
pub use state::{BootstrapError, ReloadOutcome, RuntimeStateManager};
pub use store::{CacheStore, StagedCache, StoreError};
pub use timer::{TimerFire, TimerKey, TimerKind, TimerWheel};
pub use watch::{watch_sources, WatchHandle};
