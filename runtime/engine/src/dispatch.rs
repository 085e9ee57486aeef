//! Trigger dispatcher: consumes normalized input pulses, resolves them
//! against the active bundle's trigger table, and launches macro
//! invocations.
//!
//! The dispatcher task rebuilds its lookup table whenever the state manager
//! swaps the bundle, so a pulse is always resolved against exactly one
//! bundle. Invocations run as independent tasks; a pause or slow script in
//! one macro never delays dispatch of the next pulse.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cache_model::{CacheBundle, TriggerMode};
use config_core::{Diagnostic, IssueCode, Severity};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::actions::ActionSet;
use crate::bus::{ActionNotice, DiagnosticsNotice, EventBus, StepOutcome, TriggerNotice};
use crate::hold::{PadEvent, PadEffect, TapHoldMachine};
use crate::timer::{TimerFire, TimerKey, TimerKind, TimerWheel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PulseKind {
    Note,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PulseEdge {
    Press,
    Release,
}

/// A normalized input event, already stripped of transport details.
#[derive(Debug, Clone)]
pub struct TriggerPulse {
    pub device: String,
    pub kind: PulseKind,
    pub value: u8,
    pub velocity: u8,
    pub channel: u8,
    pub edge: PulseEdge,
    pub timestamp_ms: u64,
}

#[derive(Debug)]
pub enum DispatchMsg {
    Pulse(TriggerPulse),
    /// The named device disconnected; its hold state must be dropped.
    DeviceGone(String),
}

#[derive(Debug)]
pub struct DispatcherHandle {
    tx: mpsc::UnboundedSender<DispatchMsg>,
    missed: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
    join: JoinHandle<()>,
}

impl DispatcherHandle {
    pub fn sender(&self) -> mpsc::UnboundedSender<DispatchMsg> {
        self.tx.clone()
    }

    /// Pulses that matched no trigger entry since startup.
    pub fn missed_triggers(&self) -> u64 {
        self.missed.load(Ordering::Relaxed)
    }

    /// Invocations abandoned by a failed step since startup.
    pub fn failed_invocations(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn abort(&self) {
        self.join.abort();
    }
}

pub fn spawn_dispatcher(
    active: watch::Receiver<Arc<CacheBundle>>,
    bus: EventBus,
    actions: Arc<ActionSet>,
) -> DispatcherHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let missed = Arc::new(AtomicU64::new(0));
    let failed = Arc::new(AtomicU64::new(0));
    let join = tokio::spawn(run_dispatcher(
        active,
        bus,
        actions,
        rx,
        missed.clone(),
        failed.clone(),
    ));
    DispatcherHandle {
        tx,
        missed,
        failed,
        join,
    }
}

/// Bindings for one note: at most one global entry plus any number of
/// device-scoped overrides. Keyed by note first so the hot-path lookup
/// borrows the pulse's device name instead of allocating a key.
#[derive(Debug, Default)]
struct NoteBinding {
    global: Option<(u32, TriggerMode)>,
    by_device: HashMap<String, (u32, TriggerMode)>,
}

type TriggerTable = HashMap<u8, NoteBinding>;

fn build_table(bundle: &CacheBundle) -> TriggerTable {
    let mut table = TriggerTable::new();
    for entry in &bundle.body.triggers {
        let binding = table.entry(entry.note).or_default();
        let target = (entry.macro_index, entry.mode);
        match &entry.device {
            Some(device) => {
                binding.by_device.insert(device.clone(), target);
            }
            None => binding.global = Some(target),
        }
    }
    table
}

fn lookup(table: &TriggerTable, device: &str, note: u8) -> Option<(u32, TriggerMode)> {
    let binding = table.get(&note)?;
    binding.by_device.get(device).copied().or(binding.global)
}

async fn run_dispatcher(
    mut active: watch::Receiver<Arc<CacheBundle>>,
    bus: EventBus,
    actions: Arc<ActionSet>,
    mut rx: mpsc::UnboundedReceiver<DispatchMsg>,
    missed: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
) {
    let (fire_tx, mut fire_rx) = mpsc::unbounded_channel();
    let wheel = TimerWheel::spawn(fire_tx);

    let mut bundle = active.borrow().clone();
    let mut table = build_table(&bundle);
    let mut holds: HashMap<(String, u8), TapHoldMachine> = HashMap::new();

    loop {
        tokio::select! {
            changed = active.changed() => {
                if changed.is_err() {
                    break;
                }
                bundle = active.borrow_and_update().clone();
                table = build_table(&bundle);
                debug!(
                    target: "padforge::dispatch",
                    triggers = bundle.body.triggers.len(),
                    "trigger table rebuilt"
                );
            }
            msg = rx.recv() => {
                let Some(msg) = msg else { break };
                match msg {
                    DispatchMsg::Pulse(pulse) => on_pulse(
                        pulse, &table, &bundle, &bus, &actions, &wheel, &mut holds, &missed,
                        &failed,
                    ),
                    DispatchMsg::DeviceGone(device) => {
                        wheel.cancel_device(device.clone());
                        holds.retain(|(held_device, _), _| *held_device != device);
                        debug!(target: "padforge::dispatch", device, "device state cleared");
                    }
                }
            }
            fire = fire_rx.recv() => {
                let Some(TimerFire { key }) = fire else { break };
                on_timeout(key, &table, &bundle, &bus, &actions, &mut holds, &failed);
            }
        }
    }
    wheel.abort();
}

#[allow(clippy::too_many_arguments)]
fn on_pulse(
    pulse: TriggerPulse,
    table: &TriggerTable,
    bundle: &Arc<CacheBundle>,
    bus: &EventBus,
    actions: &Arc<ActionSet>,
    wheel: &TimerWheel,
    holds: &mut HashMap<(String, u8), TapHoldMachine>,
    missed: &AtomicU64,
    failed: &Arc<AtomicU64>,
) {
    if pulse.edge == PulseEdge::Press {
        bus.publish_trigger(TriggerNotice {
            device: pulse.device.clone(),
            value: pulse.value,
            timestamp_ms: pulse.timestamp_ms,
        });
    }

    let Some((macro_index, mode)) = lookup(table, &pulse.device, pulse.value) else {
        if pulse.edge == PulseEdge::Press {
            missed.fetch_add(1, Ordering::Relaxed);
            debug!(
                target: "padforge::dispatch",
                device = %pulse.device,
                note = pulse.value,
                "no trigger bound"
            );
        }
        return;
    };

    match mode {
        TriggerMode::Immediate => {
            if pulse.edge == PulseEdge::Press {
                spawn_invocation(
                    bundle.clone(),
                    macro_index,
                    bus.clone(),
                    actions.clone(),
                    failed.clone(),
                );
            }
        }
        TriggerMode::TapHold => {
            let slot = (pulse.device.clone(), pulse.value);
            let machine = holds.entry(slot).or_default();
            let event = match pulse.edge {
                PulseEdge::Press => PadEvent::Press,
                PulseEdge::Release => PadEvent::Release,
            };
            let key = TimerKey {
                device: pulse.device.clone(),
                slot: pulse.value.to_string(),
            };
            match machine.on(event) {
                PadEffect::StartTimer => {
                    let timeout =
                        Duration::from_millis(bundle.body.defaults.tap_hold_timeout_ms);
                    wheel.schedule(key, timeout, TimerKind::OneShot);
                }
                PadEffect::FireTap => {
                    wheel.cancel(key);
                    spawn_invocation(
                        bundle.clone(),
                        macro_index,
                        bus.clone(),
                        actions.clone(),
                        failed.clone(),
                    );
                }
                PadEffect::FireHold | PadEffect::None => {}
            }
        }
    }
}

fn on_timeout(
    key: TimerKey,
    table: &TriggerTable,
    bundle: &Arc<CacheBundle>,
    bus: &EventBus,
    actions: &Arc<ActionSet>,
    holds: &mut HashMap<(String, u8), TapHoldMachine>,
    failed: &Arc<AtomicU64>,
) {
    let Ok(note) = key.slot.parse::<u8>() else {
        return;
    };
    let Some(machine) = holds.get_mut(&(key.device.clone(), note)) else {
        return;
    };
    if machine.on(PadEvent::Timeout) != PadEffect::FireHold {
        return;
    }
    // Resolve against the table as it stands now: a reload while the pad
    // was held may have rebound or removed the trigger.
    if let Some((macro_index, _)) = lookup(table, &key.device, note) {
        spawn_invocation(
            bundle.clone(),
            macro_index,
            bus.clone(),
            actions.clone(),
            failed.clone(),
        );
    }
}

/// Run one macro to completion on its own task. Steps run strictly in
/// order; a failed step is reported and abandons the remainder.
fn spawn_invocation(
    bundle: Arc<CacheBundle>,
    macro_index: u32,
    bus: EventBus,
    actions: Arc<ActionSet>,
    failed: Arc<AtomicU64>,
) {
    tokio::spawn(async move {
        let Some(entry) = bundle.macro_by_index(macro_index) else {
            warn!(
                target: "padforge::dispatch",
                macro_index,
                "trigger names a macro index outside the bundle"
            );
            return;
        };
        for (step_index, step) in entry.steps.iter().enumerate() {
            match actions
                .execute(&entry.id, step, &bundle.body.scripts)
                .await
            {
                Ok(()) => bus.publish_action(ActionNotice {
                    macro_id: entry.id.clone(),
                    step_index,
                    outcome: StepOutcome::Completed,
                }),
                Err(err) => {
                    warn!(
                        target: "padforge::dispatch",
                        macro_id = %entry.id,
                        step_index,
                        %err,
                        "step failed, abandoning invocation"
                    );
                    failed.fetch_add(1, Ordering::Relaxed);
                    bus.publish_action(ActionNotice {
                        macro_id: entry.id.clone(),
                        step_index,
                        outcome: StepOutcome::Failed(err.to_string()),
                    });
                    bus.publish_diagnostics(DiagnosticsNotice {
                        diagnostics: vec![Diagnostic::new(
                            IssueCode::Execution,
                            Severity::Warning,
                            format!("macros.{}.steps[{step_index}]", entry.id),
                            err.to_string(),
                        )],
                    });
                    return;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{KeySender, LoggingMouseSender, StepError};
    use crate::script::NullScriptHost;
    use async_trait::async_trait;
    use cache_model::{
        CacheBody, CompiledMacro, CompiledStep, NoteTrigger, RuntimeDefaults, TriggerEntry,
    };
    use std::sync::Mutex;
    use tokio::time;

    struct RecordingKeys {
        sent: Mutex<Vec<Vec<String>>>,
    }

    impl RecordingKeys {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
            })
        }

        fn count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl KeySender for RecordingKeys {
        async fn send_keystroke(&self, keys: &[String]) -> Result<(), StepError> {
            self.sent.lock().unwrap().push(keys.to_vec());
            Ok(())
        }
    }

    fn bundle_with(
        macros: Vec<CompiledMacro>,
        triggers: Vec<TriggerEntry>,
        tap_hold_timeout_ms: u64,
    ) -> Arc<CacheBundle> {
        let body = CacheBody {
            defaults: RuntimeDefaults {
                tap_hold_timeout_ms,
            },
            macros,
            triggers,
            ..CacheBody::default()
        };
        Arc::new(CacheBundle::seal(body, 1, 1).expect("seal"))
    }

    fn keystroke_macro(id: &str, note: u8, key: &str) -> CompiledMacro {
        CompiledMacro {
            id: id.into(),
            description: None,
            tags: vec![],
            trigger: Some(NoteTrigger { note }),
            steps: vec![CompiledStep::Keystroke {
                keys: vec![key.into()],
            }],
        }
    }

    fn immediate(note: u8, macro_index: u32) -> TriggerEntry {
        TriggerEntry {
            device: None,
            note,
            macro_index,
            mode: TriggerMode::Immediate,
        }
    }

    fn pulse(note: u8, edge: PulseEdge) -> DispatchMsg {
        DispatchMsg::Pulse(TriggerPulse {
            device: "pad".into(),
            kind: PulseKind::Note,
            value: note,
            velocity: 100,
            channel: 0,
            edge,
            timestamp_ms: 0,
        })
    }

    fn harness(
        bundle: Arc<CacheBundle>,
    ) -> (
        watch::Sender<Arc<CacheBundle>>,
        EventBus,
        Arc<RecordingKeys>,
        DispatcherHandle,
    ) {
        let (active_tx, active_rx) = watch::channel(bundle);
        let bus = EventBus::new();
        let keys = RecordingKeys::new();
        let actions = Arc::new(ActionSet {
            keys: keys.clone(),
            mouse: Arc::new(LoggingMouseSender),
            scripts: Arc::new(NullScriptHost),
            script_timeout: Duration::from_millis(500),
        });
        let handle = spawn_dispatcher(active_rx, bus.clone(), actions);
        (active_tx, bus, keys, handle)
    }

    #[tokio::test]
    async fn press_on_bound_note_runs_the_macro() {
        let bundle = bundle_with(
            vec![keystroke_macro("copy", 60, "C")],
            vec![immediate(60, 0)],
            500,
        );
        let (_active, bus, keys, handle) = harness(bundle);
        let mut action_rx = bus.subscribe_action();

        handle.sender().send(pulse(60, PulseEdge::Press)).expect("send");

        let notice = action_rx.recv().await.expect("action");
        assert_eq!(notice.macro_id, "copy");
        assert_eq!(notice.outcome, StepOutcome::Completed);
        assert_eq!(keys.count(), 1);
        assert_eq!(handle.missed_triggers(), 0);
        handle.abort();
    }

    #[tokio::test]
    async fn unbound_note_increments_missed_counter() {
        let bundle = bundle_with(
            vec![keystroke_macro("copy", 60, "C")],
            vec![immediate(60, 0)],
            500,
        );
        let (_active, bus, keys, handle) = harness(bundle);
        let mut trigger_rx = bus.subscribe_trigger();

        handle.sender().send(pulse(61, PulseEdge::Press)).expect("send");

        // The trigger notice is published even for a miss.
        assert_eq!(trigger_rx.recv().await.expect("trigger").value, 61);
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.missed_triggers(), 1);
        assert_eq!(keys.count(), 0);
        handle.abort();
    }

    #[tokio::test]
    async fn failed_step_abandons_the_rest_of_the_macro() {
        let failing = CompiledMacro {
            id: "broken".into(),
            description: None,
            tags: vec![],
            trigger: Some(NoteTrigger { note: 60 }),
            steps: vec![
                CompiledStep::ScriptCall { index: 0 },
                CompiledStep::Keystroke {
                    keys: vec!["X".into()],
                },
            ],
        };
        // No script table entries, so step 0 fails to resolve.
        let bundle = bundle_with(vec![failing], vec![immediate(60, 0)], 500);
        let (_active, bus, keys, handle) = harness(bundle);
        let mut action_rx = bus.subscribe_action();

        handle.sender().send(pulse(60, PulseEdge::Press)).expect("send");

        let notice = action_rx.recv().await.expect("action");
        assert_eq!(notice.step_index, 0);
        assert!(matches!(notice.outcome, StepOutcome::Failed(_)));
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(keys.count(), 0);
        assert_eq!(handle.failed_invocations(), 1);
        handle.abort();
    }

    #[tokio::test]
    async fn device_scoped_trigger_shadows_the_global_binding() {
        let bundle = bundle_with(
            vec![
                keystroke_macro("everyone", 60, "E"),
                keystroke_macro("pad-only", 60, "P"),
            ],
            vec![
                immediate(60, 0),
                TriggerEntry {
                    device: Some("pad".into()),
                    note: 60,
                    macro_index: 1,
                    mode: TriggerMode::Immediate,
                },
            ],
            500,
        );
        let (_active, bus, _keys, handle) = harness(bundle);
        let mut action_rx = bus.subscribe_action();

        // "pad" is the harness device, so the scoped entry wins.
        handle.sender().send(pulse(60, PulseEdge::Press)).expect("send");
        assert_eq!(action_rx.recv().await.expect("action").macro_id, "pad-only");

        let other = DispatchMsg::Pulse(TriggerPulse {
            device: "other-pad".into(),
            kind: PulseKind::Note,
            value: 60,
            velocity: 100,
            channel: 0,
            edge: PulseEdge::Press,
            timestamp_ms: 0,
        });
        handle.sender().send(other).expect("send");
        assert_eq!(action_rx.recv().await.expect("action").macro_id, "everyone");
        handle.abort();
    }

    #[tokio::test]
    async fn reload_swaps_the_trigger_table() {
        let bundle = bundle_with(
            vec![keystroke_macro("copy", 60, "C")],
            vec![immediate(60, 0)],
            500,
        );
        let (active, bus, _keys, handle) = harness(bundle);
        let mut action_rx = bus.subscribe_action();

        let rebound = bundle_with(
            vec![keystroke_macro("paste", 60, "V")],
            vec![immediate(60, 0)],
            500,
        );
        active.send_replace(rebound);
        // Give the dispatcher a beat to observe the swap.
        time::sleep(Duration::from_millis(50)).await;

        handle.sender().send(pulse(60, PulseEdge::Press)).expect("send");
        assert_eq!(action_rx.recv().await.expect("action").macro_id, "paste");
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn quick_release_fires_tap_hold_macro_once() {
        let tap_hold = TriggerEntry {
            device: None,
            note: 60,
            macro_index: 0,
            mode: TriggerMode::TapHold,
        };
        let bundle = bundle_with(vec![keystroke_macro("fade", 60, "F")], vec![tap_hold], 500);
        let (_active, bus, keys, handle) = harness(bundle);
        let mut action_rx = bus.subscribe_action();

        handle.sender().send(pulse(60, PulseEdge::Press)).expect("send");
        time::sleep(Duration::from_millis(100)).await;
        handle.sender().send(pulse(60, PulseEdge::Release)).expect("send");

        assert_eq!(action_rx.recv().await.expect("action").macro_id, "fade");
        // No second firing when the (cancelled) timeout would have expired.
        time::sleep(Duration::from_millis(600)).await;
        assert_eq!(keys.count(), 1);
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn held_pad_fires_on_timeout() {
        let tap_hold = TriggerEntry {
            device: None,
            note: 60,
            macro_index: 0,
            mode: TriggerMode::TapHold,
        };
        let bundle = bundle_with(vec![keystroke_macro("fade", 60, "F")], vec![tap_hold], 500);
        let (_active, bus, keys, handle) = harness(bundle);
        let mut action_rx = bus.subscribe_action();

        handle.sender().send(pulse(60, PulseEdge::Press)).expect("send");
        time::sleep(Duration::from_millis(600)).await;

        assert_eq!(action_rx.recv().await.expect("action").macro_id, "fade");
        // The late release is inert.
        handle.sender().send(pulse(60, PulseEdge::Release)).expect("send");
        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(keys.count(), 1);
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn device_disconnect_clears_pending_holds() {
        let tap_hold = TriggerEntry {
            device: None,
            note: 60,
            macro_index: 0,
            mode: TriggerMode::TapHold,
        };
        let bundle = bundle_with(vec![keystroke_macro("fade", 60, "F")], vec![tap_hold], 500);
        let (_active, _bus, keys, handle) = harness(bundle);

        handle.sender().send(pulse(60, PulseEdge::Press)).expect("send");
        time::sleep(Duration::from_millis(100)).await;
        handle
            .sender()
            .send(DispatchMsg::DeviceGone("pad".into()))
            .expect("send");

        time::sleep(Duration::from_millis(600)).await;
        assert_eq!(keys.count(), 0);
        handle.abort();
    }
}
