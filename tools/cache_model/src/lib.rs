//! Compiled cache bundle: the read-only artifact the real-time engine
//! executes against. Everything in here is resolved — widget actions and
//! script calls reference table indices, never names.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use xxhash_rust::xxh3::xxh3_64;

/// Current cache schema version, embedded in every header and in the
/// artifact file name (`<name>.v<schema>.cache`).
pub const CACHE_SCHEMA_VERSION: u32 = 1;

/// Header stored at the front of every cache artifact.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct CacheHeader {
    pub schema_version: u32,
    /// xxh3 hash of the merged source the bundle was compiled from.
    pub source_hash: u64,
    /// UNIX timestamp (seconds) at generation time.
    pub generated_at: u64,
    /// xxh3 hash of the encoded body, checked on stage and on load.
    pub content_hash: u64,
}

/// Root structure serialized into a `.cache` artifact.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct CacheBundle {
    pub header: CacheHeader,
    pub body: CacheBody,
}

/// Resolved tables. All vectors are sorted by their natural key so that
/// identical inputs encode to identical bytes.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Default)]
pub struct CacheBody {
    pub defaults: RuntimeDefaults,
    pub devices: Vec<DeviceTable>,
    pub macros: Vec<CompiledMacro>,
    pub triggers: Vec<TriggerEntry>,
    pub scripts: Vec<ScriptEntry>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct RuntimeDefaults {
    pub tap_hold_timeout_ms: u64,
}

impl Default for RuntimeDefaults {
    fn default() -> Self {
        Self {
            tap_hold_timeout_ms: 500,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct DeviceTable {
    pub key: String,
    pub hardware_id: String,
    pub pages: Vec<PageTable>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct PageTable {
    pub name: String,
    pub widgets: Vec<WidgetSlot>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct WidgetSlot {
    pub id: String,
    pub tap_behavior: Option<String>,
    /// None when the authored action pointed at a draft macro and was
    /// dropped from this bundle.
    pub action: Option<SlotAction>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum SlotAction {
    Macro { index: u32 },
    Script { index: u32 },
}

/// A compiled macro ready for runtime execution.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct CompiledMacro {
    pub id: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub trigger: Option<NoteTrigger>,
    pub steps: Vec<CompiledStep>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
pub struct NoteTrigger {
    pub note: u8,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub enum CompiledStep {
    Keystroke { keys: Vec<String> },
    Pause { ms: u64 },
    ScriptCall { index: u32 },
    Mouse { button: String, clicks: u32 },
    System { command: String },
}

/// Trigger lookup table entry. `device: None` is the global note space; the
/// dispatcher consults `(device, note)` before `(None, note)`.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct TriggerEntry {
    pub device: Option<String>,
    pub note: u8,
    pub macro_index: u32,
    pub mode: TriggerMode,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    Immediate,
    TapHold,
}

/// Script metadata carried through the cache. Compiled bytecode is future
/// work; the runtime hands the id to the script host.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct ScriptEntry {
    pub id: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache decode failed: {0}")]
    Decode(#[from] bincode::Error),
    #[error("cache integrity check failed: header declares {expected:#018x}, body hashes to {actual:#018x}")]
    Integrity { expected: u64, actual: u64 },
    #[error(
        "unsupported cache schema version {found} (expected {CACHE_SCHEMA_VERSION})"
    )]
    SchemaVersion { found: u32 },
}

/// xxh3 of the encoded body, the value sealed into `CacheHeader::content_hash`.
pub fn content_hash(body: &CacheBody) -> Result<u64, CacheError> {
    let bytes = bincode::serialize(body)?;
    Ok(xxh3_64(&bytes))
}

impl CacheBundle {
    /// The pre-bootstrap active value: no devices, no macros, no triggers.
    pub fn empty() -> Self {
        let body = CacheBody::default();
        // Hashing a default body cannot fail.
        let content = content_hash(&body).unwrap_or(0);
        Self {
            header: CacheHeader {
                schema_version: CACHE_SCHEMA_VERSION,
                source_hash: 0,
                generated_at: 0,
                content_hash: content,
            },
            body,
        }
    }

    /// Wrap a finished body in a header whose content hash matches it.
    pub fn seal(body: CacheBody, source_hash: u64, generated_at: u64) -> Result<Self, CacheError> {
        let content = content_hash(&body)?;
        Ok(Self {
            header: CacheHeader {
                schema_version: CACHE_SCHEMA_VERSION,
                source_hash,
                generated_at,
                content_hash: content,
            },
            body,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, CacheError> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode an artifact and verify schema version and body integrity.
    pub fn decode(bytes: &[u8]) -> Result<Self, CacheError> {
        let bundle: CacheBundle = bincode::deserialize(bytes)?;
        if bundle.header.schema_version != CACHE_SCHEMA_VERSION {
            return Err(CacheError::SchemaVersion {
                found: bundle.header.schema_version,
            });
        }
        let actual = content_hash(&bundle.body)?;
        if actual != bundle.header.content_hash {
            return Err(CacheError::Integrity {
                expected: bundle.header.content_hash,
                actual,
            });
        }
        Ok(bundle)
    }

    pub fn macro_by_index(&self, index: u32) -> Option<&CompiledMacro> {
        self.body.macros.get(index as usize)
    }

    pub fn script_by_index(&self, index: u32) -> Option<&ScriptEntry> {
        self.body.scripts.get(index as usize)
    }
}
