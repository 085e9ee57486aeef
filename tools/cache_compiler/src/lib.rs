//! Transforms a validated config bundle into a sealed cache bundle.
//!
//! Compilation is all-or-nothing: any error-severity diagnostic anywhere in
//! the bundle rejects the whole compile. Warnings and info notes ride along
//! in the output. Only `ready` macros are compiled; every widget and script
//! reference is resolved to a table index.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use cache_model::{
    CacheBody, CacheBundle, CacheError, CompiledMacro, CompiledStep, DeviceTable, NoteTrigger,
    PageTable, RuntimeDefaults, ScriptEntry, SlotAction, TriggerEntry, TriggerMode, WidgetSlot,
};
use config_core::schema::{Action, Config, MacroStatus, Step};
use config_core::{
    has_blocking, merge_path, merge_sources, merge_str, validate_config, Diagnostic, MergeError,
    MergedConfig, SourceFile,
};
use thiserror::Error;

#[derive(Debug)]
pub struct CompileOutput {
    pub bundle: CacheBundle,
    /// Non-blocking findings (warnings and info notes).
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("merge failed: {0}")]
    Merge(#[from] MergeError),
    #[error("validation errors prevented cache build")]
    Validation(Vec<Diagnostic>),
    #[error("cache sealing failed: {0}")]
    Cache(#[from] CacheError),
}

impl CompileError {
    /// Every failure as a diagnostic list, for uniform reload reporting.
    pub fn into_diagnostics(self) -> Vec<Diagnostic> {
        match self {
            CompileError::Validation(diags) => diags,
            CompileError::Merge(err) => vec![err.to_diagnostic()],
            CompileError::Cache(err) => vec![Diagnostic::new(
                config_core::IssueCode::CacheIntegrity,
                config_core::Severity::Error,
                "<cache>",
                err.to_string(),
            )],
        }
    }
}

pub fn compile_path(path: impl AsRef<Path>) -> Result<CompileOutput, CompileError> {
    compile_merged(&merge_path(path)?)
}

pub fn compile_str(contents: &str) -> Result<CompileOutput, CompileError> {
    compile_merged(&merge_str(contents)?)
}

pub fn compile_sources(files: Vec<SourceFile>) -> Result<CompileOutput, CompileError> {
    compile_merged(&merge_sources(files)?)
}

pub fn compile_merged(merged: &MergedConfig) -> Result<CompileOutput, CompileError> {
    let generated_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    compile_merged_at(merged, generated_at)
}

/// Compile with an explicit timestamp. Output bytes are a pure function of
/// the merged sources and this value.
pub fn compile_merged_at(
    merged: &MergedConfig,
    generated_at: u64,
) -> Result<CompileOutput, CompileError> {
    let diagnostics = validate_config(&merged.config, &merged.files);
    if has_blocking(&diagnostics) {
        return Err(CompileError::Validation(diagnostics));
    }

    let body = assemble_body(&merged.config);
    let bundle = CacheBundle::seal(body, merged.source_hash, generated_at)?;
    Ok(CompileOutput {
        bundle,
        diagnostics,
    })
}

fn assemble_body(config: &Config) -> CacheBody {
    // Stable indices: BTreeMap iteration is sorted by id.
    let script_index: HashMap<&str, u32> = config
        .scripts
        .keys()
        .enumerate()
        .map(|(idx, id)| (id.as_str(), idx as u32))
        .collect();

    let ready_macros: Vec<(&String, &config_core::schema::Macro)> = config
        .macros
        .iter()
        .filter(|(_, m)| m.status == MacroStatus::Ready)
        .collect();
    let macro_index: HashMap<&str, u32> = ready_macros
        .iter()
        .enumerate()
        .map(|(idx, (id, _))| (id.as_str(), idx as u32))
        .collect();

    let hold_macros = hold_bound_macros(config);

    let macros: Vec<CompiledMacro> = ready_macros
        .iter()
        .map(|(id, m)| CompiledMacro {
            id: (*id).clone(),
            description: m.description.clone(),
            tags: m.tags.clone(),
            // Validation already bounded ready-macro notes to 0..=127, so
            // the narrowing is lossless here.
            trigger: m.trigger.map(|t| NoteTrigger { note: t.number as u8 }),
            steps: m
                .steps
                .iter()
                .map(|step| convert_step(step, &script_index))
                .collect(),
        })
        .collect();

    let mut triggers = Vec::new();
    let mut taken: HashSet<u8> = HashSet::new();
    for (idx, mac) in macros.iter().enumerate() {
        let Some(trigger) = mac.trigger else { continue };
        // First macro in sorted-id order wins a shared note; the loser is
        // still reachable through widget bindings.
        if !taken.insert(trigger.note) {
            continue;
        }
        let mode = if hold_macros.contains(mac.id.as_str()) {
            TriggerMode::TapHold
        } else {
            TriggerMode::Immediate
        };
        triggers.push(TriggerEntry {
            device: None,
            note: trigger.note,
            macro_index: idx as u32,
            mode,
        });
    }
    triggers.sort_by(|a, b| (&a.device, a.note).cmp(&(&b.device, b.note)));

    let devices = config
        .devices
        .iter()
        .map(|(key, device)| DeviceTable {
            key: key.clone(),
            hardware_id: device.hardware_id.clone().unwrap_or_default(),
            pages: device
                .pages
                .iter()
                .map(|page| PageTable {
                    name: page.name.clone(),
                    widgets: page
                        .widgets
                        .iter()
                        .map(|widget| WidgetSlot {
                            id: widget.id.clone(),
                            tap_behavior: widget.tap_behavior.clone(),
                            action: widget
                                .action
                                .as_ref()
                                .and_then(|action| resolve_action(action, &macro_index, &script_index)),
                        })
                        .collect(),
                })
                .collect(),
        })
        .collect();

    let scripts = config
        .scripts
        .iter()
        .map(|(id, script)| ScriptEntry {
            id: id.clone(),
            body: script.body().to_string(),
        })
        .collect();

    let tap_hold_timeout_ms = config
        .global
        .as_ref()
        .and_then(|g| g.defaults.as_ref())
        .and_then(|d| d.tap_hold_timeout_ms)
        .unwrap_or_else(|| RuntimeDefaults::default().tap_hold_timeout_ms);

    CacheBody {
        defaults: RuntimeDefaults {
            tap_hold_timeout_ms,
        },
        devices,
        macros,
        triggers,
        scripts,
    }
}

/// Macro ids referenced by at least one widget with `tap_behavior: hold`;
/// their triggers go through tap/hold discrimination instead of firing on
/// press.
fn hold_bound_macros(config: &Config) -> HashSet<&str> {
    let mut out = HashSet::new();
    for device in config.devices.values() {
        for page in &device.pages {
            for widget in &page.widgets {
                if widget.tap_behavior.as_deref() != Some("hold") {
                    continue;
                }
                if let Some(Action::Macro { ref_ }) = &widget.action {
                    out.insert(ref_.as_str());
                }
            }
        }
    }
    out
}

fn convert_step(step: &Step, script_index: &HashMap<&str, u32>) -> CompiledStep {
    match step {
        Step::Keystroke { keys } => CompiledStep::Keystroke { keys: keys.clone() },
        Step::Pause { ms } => CompiledStep::Pause { ms: *ms },
        Step::ScriptCall { ref_ } => CompiledStep::ScriptCall {
            // Validation guarantees the reference resolves for ready macros.
            index: script_index.get(ref_.as_str()).copied().unwrap_or(u32::MAX),
        },
        Step::Mouse { button, clicks } => CompiledStep::Mouse {
            button: button.clone(),
            clicks: *clicks,
        },
        Step::System { command } => CompiledStep::System {
            command: command.clone(),
        },
    }
}

fn resolve_action(
    action: &Action,
    macro_index: &HashMap<&str, u32>,
    script_index: &HashMap<&str, u32>,
) -> Option<SlotAction> {
    match action {
        // A widget pointing at a draft macro compiles to an empty slot; the
        // validator already emitted the warning.
        Action::Macro { ref_ } => macro_index
            .get(ref_.as_str())
            .map(|idx| SlotAction::Macro { index: *idx }),
        Action::Script { ref_ } => script_index
            .get(ref_.as_str())
            .map(|idx| SlotAction::Script { index: *idx }),
    }
}
