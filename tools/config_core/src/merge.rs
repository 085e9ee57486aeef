//! Deterministic multi-file merge.
//!
//! Sources are combined in declared order (directory scan order, sorted by
//! file name) into a single logical bundle before typed deserialization.
//! Merging is a pure transform: it either yields a `MergedConfig` or a
//! `MergeError` naming the offending file.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde_yaml::{Mapping, Value};
use thiserror::Error;
use xxhash_rust::xxh3::Xxh3;

use crate::diagnostics::{Diagnostic, IssueCode, Location, Severity};
use crate::schema::Config;

/// Top-level keys that merge entry-wise across files.
const MAP_SECTIONS: [&str; 3] = ["devices", "macros", "scripts"];
/// Top-level keys that may appear in exactly one file.
const SINGLETON_KEYS: [&str; 3] = ["version", "global", "virtual_console"];

#[derive(Debug, Clone)]
pub struct SourceFile {
    pub name: String,
    pub contents: String,
}

impl SourceFile {
    pub fn new(name: impl Into<String>, contents: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            contents: contents.into(),
        }
    }
}

/// One logical bundle assembled from every source file.
#[derive(Debug)]
pub struct MergedConfig {
    pub config: Config,
    pub files: Vec<SourceFile>,
    /// xxh3 over the ordered (name, contents) sequence; the value embedded
    /// in the compiled cache header.
    pub source_hash: u64,
}

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no config sources found at {path}")]
    NoSources { path: String },
    #[error("{file}: YAML parse error: {source}")]
    Parse {
        file: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("{file}: top-level document must be a mapping")]
    NotAMapping { file: String },
    #[error("{file}: unknown top-level key `{key}`")]
    UnknownKey { file: String, key: String },
    #[error("top-level key `{key}` declared in both {first} and {second}")]
    DuplicateKey {
        key: String,
        first: String,
        second: String,
    },
    #[error("{section}.{id} declared in both {first} and {second}")]
    DuplicateEntry {
        section: String,
        id: String,
        first: String,
        second: String,
    },
    #[error("{file}: `{key}` must be a mapping of ids")]
    MalformedSection { file: String, key: String },
    #[error("merged bundle does not match the schema: {source}")]
    Schema {
        #[source]
        source: serde_yaml::Error,
    },
}

impl MergeError {
    /// Render the failure as a diagnostic so reload reporting has one shape.
    pub fn to_diagnostic(&self) -> Diagnostic {
        let (code, file, location) = match self {
            MergeError::Parse { file, source } => (
                IssueCode::Syntax,
                Some(file.clone()),
                source.location().map(|loc| Location {
                    line: loc.line(),
                    column: loc.column(),
                }),
            ),
            MergeError::NotAMapping { file }
            | MergeError::UnknownKey { file, .. }
            | MergeError::MalformedSection { file, .. } => {
                (IssueCode::Schema, Some(file.clone()), None)
            }
            MergeError::DuplicateKey { second, .. } | MergeError::DuplicateEntry { second, .. } => {
                (IssueCode::Duplicate, Some(second.clone()), None)
            }
            MergeError::Schema { .. } => (IssueCode::Schema, None, None),
            MergeError::Io { .. } | MergeError::NoSources { .. } => (IssueCode::Syntax, None, None),
        };
        let mut diag = Diagnostic::new(code, Severity::Error, "<merge>", self.to_string());
        diag.file = file;
        diag.location = location;
        diag
    }
}

/// Merge a directory of `*.yaml`/`*.yml` files (sorted by name) or a single
/// file into one bundle.
pub fn merge_path(path: impl AsRef<Path>) -> Result<MergedConfig, MergeError> {
    let path = path.as_ref();
    let mut files = Vec::new();
    if path.is_dir() {
        let mut names: Vec<_> = fs::read_dir(path)
            .map_err(|source| MergeError::Io {
                path: path.display().to_string(),
                source,
            })?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                matches!(
                    p.extension().and_then(|ext| ext.to_str()),
                    Some("yaml") | Some("yml")
                )
            })
            .collect();
        names.sort();
        for file_path in names {
            files.push(read_source(&file_path)?);
        }
    } else {
        files.push(read_source(path)?);
    }
    if files.is_empty() {
        return Err(MergeError::NoSources {
            path: path.display().to_string(),
        });
    }
    merge_sources(files)
}

fn read_source(path: &Path) -> Result<SourceFile, MergeError> {
    let contents = fs::read_to_string(path).map_err(|source| MergeError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    Ok(SourceFile { name, contents })
}

/// Single-source convenience, mainly for tests and tooling.
pub fn merge_str(contents: &str) -> Result<MergedConfig, MergeError> {
    merge_sources(vec![SourceFile::new("<input>", contents)])
}

pub fn merge_sources(files: Vec<SourceFile>) -> Result<MergedConfig, MergeError> {
    let mut sections: BTreeMap<&'static str, Mapping> = BTreeMap::new();
    let mut entry_origin: BTreeMap<(String, String), String> = BTreeMap::new();
    let mut singletons: Vec<(Value, Value)> = Vec::new();
    let mut singleton_origin: BTreeMap<String, String> = BTreeMap::new();

    for file in &files {
        let value: Value =
            serde_yaml::from_str(&file.contents).map_err(|source| MergeError::Parse {
                file: file.name.clone(),
                source,
            })?;
        let mapping = match value {
            Value::Mapping(mapping) => mapping,
            Value::Null => continue,
            _ => {
                return Err(MergeError::NotAMapping {
                    file: file.name.clone(),
                })
            }
        };

        for (key, val) in mapping {
            let key_str = match key.as_str() {
                Some(s) => s.to_string(),
                None => {
                    return Err(MergeError::UnknownKey {
                        file: file.name.clone(),
                        key: format!("{key:?}"),
                    })
                }
            };

            if let Some(section_name) = MAP_SECTIONS.iter().find(|s| **s == key_str) {
                let entries = match val {
                    Value::Mapping(entries) => entries,
                    Value::Null => continue,
                    _ => {
                        return Err(MergeError::MalformedSection {
                            file: file.name.clone(),
                            key: key_str,
                        })
                    }
                };
                let target = sections.entry(section_name).or_default();
                for (id, entry) in entries {
                    let id_str = id.as_str().unwrap_or_default().to_string();
                    let origin_key = (key_str.clone(), id_str.clone());
                    if let Some(first) = entry_origin.get(&origin_key) {
                        return Err(MergeError::DuplicateEntry {
                            section: key_str,
                            id: id_str,
                            first: first.clone(),
                            second: file.name.clone(),
                        });
                    }
                    entry_origin.insert(origin_key, file.name.clone());
                    target.insert(id, entry);
                }
            } else if SINGLETON_KEYS.contains(&key_str.as_str()) {
                if let Some(first) = singleton_origin.get(&key_str) {
                    return Err(MergeError::DuplicateKey {
                        key: key_str,
                        first: first.clone(),
                        second: file.name.clone(),
                    });
                }
                singleton_origin.insert(key_str.clone(), file.name.clone());
                singletons.push((key, val));
            } else {
                return Err(MergeError::UnknownKey {
                    file: file.name.clone(),
                    key: key_str,
                });
            }
        }
    }

    let mut merged = Mapping::new();
    for (key, val) in singletons {
        merged.insert(key, val);
    }
    for (name, entries) in sections {
        merged.insert(Value::String(name.to_string()), Value::Mapping(entries));
    }

    let config: Config = serde_yaml::from_value(Value::Mapping(merged))
        .map_err(|source| MergeError::Schema { source })?;

    let source_hash = hash_sources(&files);
    Ok(MergedConfig {
        config,
        files,
        source_hash,
    })
}

/// Content hash of the ordered source set. File names participate so a
/// rename (which changes merge order) changes the hash.
pub fn hash_sources(files: &[SourceFile]) -> u64 {
    let mut hasher = Xxh3::new();
    for file in files {
        hasher.update(file.name.as_bytes());
        hasher.update(&[0]);
        hasher.update(file.contents.as_bytes());
        hasher.update(&[0]);
    }
    hasher.digest()
}
