//! Semantic checks over a merged bundle.
//!
//! Validation never aborts early: every finding across the whole bundle is
//! collected in one pass. Severity is status-aware — structural and
//! referential defects on a `ready` macro are errors, the same defects on a
//! `draft` macro are downgraded to informational Draft notes. Out-of-range
//! trigger notes are the one carve-out: always an error.

use std::collections::{HashMap, HashSet};

use crate::diagnostics::{Diagnostic, IssueCode, Location, Severity};
use crate::merge::SourceFile;
use crate::schema::{Action, Config, MacroStatus, Step, TriggerType};

pub fn validate_config(config: &Config, files: &[SourceFile]) -> Vec<Diagnostic> {
    let mut issues = Vec::new();

    if config.version != 1 {
        issues.push(Diagnostic::new(
            IssueCode::Schema,
            Severity::Error,
            "version",
            format!("Unsupported schema version {} (expected 1)", config.version),
        ));
    }

    let referenced_macros = check_devices(config, &mut issues);
    check_macros(config, &referenced_macros, &mut issues);
    check_scripts(config, &mut issues);

    attach_locations(files, issues)
}

/// Device/page/widget checks. Returns the set of macro ids referenced by
/// widgets, needed for the unused-macro pass.
fn check_devices(config: &Config, issues: &mut Vec<Diagnostic>) -> HashSet<String> {
    let mut hardware_ids: HashMap<String, String> = HashMap::new();
    let mut widget_owners: HashMap<String, String> = HashMap::new();
    let mut referenced = HashSet::new();

    for (device_name, device) in &config.devices {
        let path = format!("devices.{device_name}");

        match device.hardware_id.as_deref() {
            Some(id) if !id.trim().is_empty() => {
                if let Some(previous) = hardware_ids.insert(id.trim().to_string(), device_name.clone()) {
                    issues.push(Diagnostic::new(
                        IssueCode::Duplicate,
                        Severity::Error,
                        format!("{path}.hardware_id"),
                        format!("Duplicate hardware_id `{}` also used by `{previous}`", id.trim()),
                    ));
                }
            }
            Some(_) => {
                issues.push(Diagnostic::new(
                    IssueCode::Schema,
                    Severity::Error,
                    format!("{path}.hardware_id"),
                    "hardware_id must not be empty",
                ));
            }
            None => {
                issues.push(Diagnostic::new(
                    IssueCode::Schema,
                    Severity::Error,
                    format!("{path}.hardware_id"),
                    "hardware_id is required",
                ));
            }
        }

        for (page_index, page) in device.pages.iter().enumerate() {
            let mut page_ids = HashSet::new();
            for widget in &page.widgets {
                let widget_path = format!("{path}.pages[{page_index}].widgets.{}", widget.id);
                let owner = format!("{device_name}/{}", page.name);

                if !page_ids.insert(widget.id.clone()) {
                    issues.push(Diagnostic::new(
                        IssueCode::Duplicate,
                        Severity::Error,
                        widget_path.clone(),
                        "Duplicate widget id within page",
                    ));
                } else if let Some(previous) = widget_owners.get(&widget.id) {
                    // Reuse on another page or device is legal but worth
                    // flagging; layouts often copy-paste ids.
                    issues.push(Diagnostic::new(
                        IssueCode::Duplicate,
                        Severity::Warning,
                        widget_path.clone(),
                        format!("Widget id `{}` also used on {previous}", widget.id),
                    ));
                } else {
                    widget_owners.insert(widget.id.clone(), owner);
                }

                if let Some(action) = &widget.action {
                    match action {
                        Action::Macro { ref_ } => {
                            referenced.insert(ref_.clone());
                            match config.macros.get(ref_) {
                                None => issues.push(Diagnostic::new(
                                    IssueCode::Reference,
                                    Severity::Error,
                                    widget_path.clone(),
                                    format!("References undefined macro `{ref_}`"),
                                )),
                                Some(mac) if mac.status != MacroStatus::Ready => {
                                    issues.push(Diagnostic::new(
                                        IssueCode::Draft,
                                        Severity::Warning,
                                        widget_path.clone(),
                                        format!(
                                            "References macro `{ref_}` that is not marked ready and will be absent from the next cache"
                                        ),
                                    ));
                                }
                                Some(_) => {}
                            }
                        }
                        Action::Script { ref_ } => {
                            if !config.scripts.contains_key(ref_) {
                                issues.push(Diagnostic::new(
                                    IssueCode::Reference,
                                    Severity::Error,
                                    widget_path.clone(),
                                    format!("References undefined script `{ref_}`"),
                                ));
                            }
                        }
                    }
                }
            }
        }
    }

    referenced
}

fn check_macros(config: &Config, referenced: &HashSet<String>, issues: &mut Vec<Diagnostic>) {
    let mut note_map: HashMap<i64, String> = HashMap::new();

    for (macro_name, macro_def) in &config.macros {
        let macro_path = format!("macros.{macro_name}");

        if let Some(trigger) = &macro_def.trigger {
            match trigger.r#type {
                TriggerType::Note => {
                    if !(0..=127).contains(&trigger.number) {
                        // Always an error: a wrong note value stays wrong
                        // when the macro is promoted.
                        issues.push(Diagnostic::new(
                            IssueCode::Range,
                            Severity::Error,
                            format!("{macro_path}.trigger"),
                            "Note trigger number must be between 0 and 127",
                        ));
                    } else if macro_def.status == MacroStatus::Ready {
                        if let Some(existing) = note_map.insert(trigger.number, macro_name.clone())
                        {
                            issues.push(Diagnostic::new(
                                IssueCode::Conflict,
                                Severity::Warning,
                                format!("{macro_path}.trigger"),
                                format!(
                                    "Note {} already assigned to ready macro `{existing}`",
                                    trigger.number
                                ),
                            ));
                        }
                    }
                }
            }
        } else if macro_def.status == MacroStatus::Ready {
            issues.push(Diagnostic::new(
                IssueCode::Schema,
                Severity::Warning,
                format!("{macro_path}.trigger"),
                "Ready macro missing trigger",
            ));
        }

        for (idx, step) in macro_def.steps.iter().enumerate() {
            let step_path = format!("{macro_path}.steps[{idx}]");
            match step {
                Step::Keystroke { keys } => {
                    if keys.is_empty() || keys.iter().any(|k| k.trim().is_empty()) {
                        push_structural(
                            issues,
                            macro_def.status,
                            IssueCode::Schema,
                            step_path,
                            "Keystroke step must define at least one non-empty key",
                        );
                    }
                }
                Step::Pause { ms } => {
                    if *ms == 0 {
                        push_structural(
                            issues,
                            macro_def.status,
                            IssueCode::Schema,
                            step_path,
                            "Pause duration must be greater than zero",
                        );
                    }
                }
                Step::ScriptCall { ref_ } => {
                    if !config.scripts.contains_key(ref_) {
                        push_structural(
                            issues,
                            macro_def.status,
                            IssueCode::Reference,
                            step_path,
                            format!("Script call references undefined script `{ref_}`"),
                        );
                    }
                }
                Step::Mouse { button, clicks } => {
                    if button.trim().is_empty() {
                        push_structural(
                            issues,
                            macro_def.status,
                            IssueCode::Schema,
                            step_path.clone(),
                            "Mouse step must name a button",
                        );
                    }
                    if *clicks == 0 {
                        push_structural(
                            issues,
                            macro_def.status,
                            IssueCode::Schema,
                            step_path,
                            "Mouse step click count must be greater than zero",
                        );
                    }
                }
                Step::System { command } => {
                    if command.trim().is_empty() {
                        push_structural(
                            issues,
                            macro_def.status,
                            IssueCode::Schema,
                            step_path,
                            "System step must define a command",
                        );
                    }
                }
            }
        }

        match macro_def.status {
            MacroStatus::Draft => {
                issues.push(Diagnostic::new(
                    IssueCode::Draft,
                    Severity::Info,
                    macro_path,
                    "Draft macro is excluded from the compiled cache",
                ));
            }
            MacroStatus::Ready => {
                if macro_def.trigger.is_none() && !referenced.contains(macro_name) {
                    issues.push(Diagnostic::new(
                        IssueCode::Unused,
                        Severity::Warning,
                        macro_path,
                        "Ready macro has no trigger and no widget references it",
                    ));
                }
            }
        }
    }
}

fn check_scripts(config: &Config, issues: &mut Vec<Diagnostic>) {
    for (script_name, script) in &config.scripts {
        if script.body().trim().is_empty() {
            issues.push(Diagnostic::new(
                IssueCode::Schema,
                Severity::Error,
                format!("scripts.{script_name}"),
                "Script body must not be empty",
            ));
        }
    }
}

/// Structural or referential defect on a macro step: error for ready,
/// downgraded to an informational Draft note for draft macros.
fn push_structural(
    issues: &mut Vec<Diagnostic>,
    status: MacroStatus,
    code: IssueCode,
    path: String,
    message: impl Into<String>,
) {
    let (code, severity) = match status {
        MacroStatus::Ready => (code, Severity::Error),
        MacroStatus::Draft => (IssueCode::Draft, Severity::Info),
    };
    issues.push(Diagnostic::new(code, severity, path, message));
}

fn attach_locations(files: &[SourceFile], mut issues: Vec<Diagnostic>) -> Vec<Diagnostic> {
    for issue in &mut issues {
        if let Some((file, location)) = find_location(files, &issue.path) {
            issue.file = Some(file);
            issue.location = Some(location);
        }
    }
    issues
}

/// Best-effort source position: first line in any file containing the last
/// path segment.
fn find_location(files: &[SourceFile], path: &str) -> Option<(String, Location)> {
    let needle = path.rsplit('.').next()?.split('[').next()?;
    if needle.is_empty() {
        return None;
    }
    for file in files {
        for (idx, line) in file.contents.lines().enumerate() {
            if let Some(column) = line.find(needle) {
                return Some((
                    file.name.clone(),
                    Location {
                        line: idx + 1,
                        column: column + 1,
                    },
                ));
            }
        }
    }
    None
}
