//! Canonical re-rendering and structural diffing of merged bundles, backing
//! the `format` and `diff` CLI commands.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::merge::MergedConfig;
use crate::schema::Config;

/// Render the merged bundle back to canonical YAML: sections in schema
/// order, map entries sorted (BTreeMap ordering).
pub fn format_config(config: &Config) -> Result<String, serde_yaml::Error> {
    serde_yaml::to_string(config)
}

/// One reported difference between two bundles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffEntry {
    Added(String),
    Removed(String),
    Changed(String),
}

impl std::fmt::Display for DiffEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiffEntry::Added(path) => write!(f, "+ {path}"),
            DiffEntry::Removed(path) => write!(f, "- {path}"),
            DiffEntry::Changed(path) => write!(f, "~ {path}"),
        }
    }
}

/// Structural diff at entry granularity: added/removed/changed devices,
/// macros, and scripts, plus version and global changes.
pub fn diff_configs(a: &MergedConfig, b: &MergedConfig) -> Vec<DiffEntry> {
    let mut entries = Vec::new();
    let (a, b) = (&a.config, &b.config);

    if a.version != b.version {
        entries.push(DiffEntry::Changed("version".into()));
    }
    if render_opt(&a.global) != render_opt(&b.global) {
        entries.push(DiffEntry::Changed("global".into()));
    }

    diff_section(&mut entries, "devices", a.devices.keys(), b.devices.keys(), |id| {
        render_opt(&a.devices.get(id)) != render_opt(&b.devices.get(id))
    });
    diff_section(&mut entries, "macros", a.macros.keys(), b.macros.keys(), |id| {
        render_opt(&a.macros.get(id)) != render_opt(&b.macros.get(id))
    });
    diff_section(&mut entries, "scripts", a.scripts.keys(), b.scripts.keys(), |id| {
        render_opt(&a.scripts.get(id)) != render_opt(&b.scripts.get(id))
    });

    entries
}

fn diff_section<'k>(
    entries: &mut Vec<DiffEntry>,
    section: &str,
    a_keys: impl Iterator<Item = &'k String>,
    b_keys: impl Iterator<Item = &'k String>,
    changed: impl Fn(&str) -> bool,
) {
    let a_set: BTreeSet<&String> = a_keys.collect();
    let b_set: BTreeSet<&String> = b_keys.collect();

    for id in a_set.difference(&b_set) {
        entries.push(DiffEntry::Removed(format!("{section}.{id}")));
    }
    for id in b_set.difference(&a_set) {
        entries.push(DiffEntry::Added(format!("{section}.{id}")));
    }
    for id in a_set.intersection(&b_set) {
        if changed(id) {
            entries.push(DiffEntry::Changed(format!("{section}.{id}")));
        }
    }
}

/// Compare entries through their canonical YAML rendering; the schema types
/// deliberately do not implement PartialEq.
fn render_opt<T: Serialize>(value: &T) -> String {
    serde_yaml::to_string(value).unwrap_or_default()
}
