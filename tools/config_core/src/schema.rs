//! Typed model of the authored configuration bundle.
//!
//! Maps are `BTreeMap` so merge output, `format`, and compilation iterate in
//! a stable order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global: Option<Global>,
    #[serde(default)]
    pub devices: BTreeMap<String, Device>,
    #[serde(default)]
    pub macros: BTreeMap<String, Macro>,
    #[serde(default)]
    pub scripts: BTreeMap<String, Script>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_console: Option<serde_yaml::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Global {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defaults: Option<Defaults>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Defaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tap_hold_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<DisplaySettings>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DisplaySettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Device {
    pub hardware_id: Option<String>,
    #[serde(default)]
    pub pages: Vec<Page>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Page {
    pub name: String,
    #[serde(default)]
    pub widgets: Vec<Widget>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Widget {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tap_behavior: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Macro {
        #[serde(rename = "ref")]
        ref_: String,
    },
    Script {
        #[serde(rename = "ref")]
        ref_: String,
    },
}

impl Action {
    pub fn target(&self) -> &str {
        match self {
            Action::Macro { ref_ } | Action::Script { ref_ } => ref_,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Macro {
    #[serde(default = "default_status")]
    pub status: MacroStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<Trigger>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum MacroStatus {
    Draft,
    Ready,
}

fn default_status() -> MacroStatus {
    MacroStatus::Draft
}

/// The note number is deliberately wider than the MIDI range so an
/// out-of-range value parses and surfaces as a range diagnostic instead of
/// a deserialization failure.
#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
pub struct Trigger {
    pub r#type: TriggerType,
    pub number: i64,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Note,
}

fn default_clicks() -> u32 {
    1
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    Keystroke {
        keys: Vec<String>,
    },
    Pause {
        ms: u64,
    },
    ScriptCall {
        #[serde(rename = "ref")]
        ref_: String,
    },
    Mouse {
        button: String,
        #[serde(default = "default_clicks")]
        clicks: u32,
    },
    System {
        command: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Script {
    Body { body: String },
    Inline(String),
}

impl Script {
    pub fn body(&self) -> &str {
        match self {
            Script::Body { body } => body,
            Script::Inline(body) => body,
        }
    }
}
