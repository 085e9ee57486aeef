use cache_compiler::{compile_path, compile_str, CompileError};
use cache_model::{CacheBundle, CompiledStep, SlotAction};
use config_core::{has_blocking, IssueCode, Severity};

#[test]
fn copy_ready_fade_draft_scenario() {
    let yaml = r#"version: 1
macros:
  copy:
    status: ready
    trigger:
      type: note
      number: 60
    steps:
      - type: keystroke
        keys: ["Ctrl", "C"]
  fade:
    status: draft
    steps: []
"#;
    let output = compile_str(yaml).expect("compile");

    // Trigger table contains {60 -> copy} only.
    assert_eq!(output.bundle.body.triggers.len(), 1);
    let entry = &output.bundle.body.triggers[0];
    assert_eq!(entry.note, 60);
    assert_eq!(
        output.bundle.body.macros[entry.macro_index as usize].id,
        "copy"
    );
    assert!(!output.bundle.body.macros.iter().any(|m| m.id == "fade"));

    // Exactly one informational draft note, zero errors.
    assert!(!has_blocking(&output.diagnostics));
    let draft_notes: Vec<_> = output
        .diagnostics
        .iter()
        .filter(|d| d.code == IssueCode::Draft && d.severity == Severity::Info)
        .collect();
    assert_eq!(draft_notes.len(), 1);
    assert!(draft_notes[0].path.contains("fade"));
}

#[test]
fn dangling_widget_reference_rejects_whole_bundle() {
    let yaml = r#"version: 1
devices:
  pad:
    hardware_id: "usb:x"
    pages:
      - name: Main
        widgets:
          - id: w1
            action:
              type: macro
              ref: does_not_exist
"#;
    match compile_str(yaml) {
        Err(CompileError::Validation(diags)) => {
            assert!(diags
                .iter()
                .any(|d| d.code == IssueCode::Reference && d.severity == Severity::Error));
        }
        other => panic!("expected validation rejection, got {other:?}"),
    }
}

#[test]
fn multi_file_directory_compiles_and_round_trips() {
    let dir = tempfile::tempdir().expect("temp dir");
    std::fs::write(
        dir.path().join("00-main.yaml"),
        r#"version: 1
devices:
  launchpad:
    hardware_id: "usb:demo.launchpad"
    pages:
      - name: Main
        widgets:
          - id: pad_1
            tap_behavior: tap
            action:
              type: macro
              ref: copy
"#,
    )
    .expect("write main");
    std::fs::write(
        dir.path().join("10-macros.yaml"),
        r#"macros:
  copy:
    status: ready
    trigger:
      type: note
      number: 60
    steps:
      - type: keystroke
        keys: ["Ctrl", "C"]
      - type: pause
        ms: 50
  runner:
    status: ready
    trigger:
      type: note
      number: 61
    steps:
      - type: script_call
        ref: greet
scripts:
  greet: "print('hi')"
"#,
    )
    .expect("write macros");

    let output = compile_path(dir.path()).expect("compile");
    let bytes = output.bundle.encode().expect("encode");
    let decoded = CacheBundle::decode(&bytes).expect("decode");
    assert_eq!(output.bundle, decoded);

    assert_eq!(decoded.body.macros.len(), 2);
    assert_eq!(decoded.body.devices.len(), 1);
    let widget = &decoded.body.devices[0].pages[0].widgets[0];
    assert_eq!(widget.action, Some(SlotAction::Macro { index: 0 }));

    let runner = decoded
        .body
        .macros
        .iter()
        .find(|m| m.id == "runner")
        .expect("runner macro");
    match &runner.steps[0] {
        CompiledStep::ScriptCall { index } => {
            assert_eq!(decoded.body.scripts[*index as usize].id, "greet");
        }
        other => panic!("unexpected step: {other:?}"),
    }
}
