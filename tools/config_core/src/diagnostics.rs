//! Typed, leveled findings shared by the validator, compiler, and runtime.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub line: usize,
    pub column: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// Closed taxonomy of finding kinds. New kinds extend this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCode {
    /// Unparseable source text.
    Syntax,
    /// Unsupported version or malformed structure.
    Schema,
    /// Dangling macro/script/device reference.
    Reference,
    /// Trigger value out of bounds.
    Range,
    /// Non-unique id where uniqueness is required.
    Duplicate,
    /// Two ready macros share a trigger value.
    Conflict,
    /// Macro reachable by neither widget nor trigger.
    Unused,
    /// Anything concerning a draft macro, or a widget pointing at one.
    Draft,
    /// Hash or header mismatch on cache load.
    CacheIntegrity,
    /// A step or script failed at runtime.
    Execution,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub code: IssueCode,
    pub severity: Severity,
    /// Dotted path into the authored bundle, e.g. `macros.copy.steps[1]`.
    pub path: String,
    pub message: String,
    /// Source file the finding was located in, when resolvable.
    pub file: Option<String>,
    pub location: Option<Location>,
}

impl Diagnostic {
    pub fn new(code: IssueCode, severity: Severity, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            severity,
            path: path.into(),
            message: message.into(),
            file: None,
            location: None,
        }
    }

    pub fn is_blocking(&self) -> bool {
        self.severity == Severity::Error
    }
}

/// True when any finding in the set blocks compilation.
pub fn has_blocking(diagnostics: &[Diagnostic]) -> bool {
    diagnostics.iter().any(Diagnostic::is_blocking)
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        };
        f.write_str(text)
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.path, self.message)?;
        if let Some(loc) = self.location {
            let file = self.file.as_deref().unwrap_or("<input>");
            write!(f, " ({file}, line {}, column {})", loc.line, loc.column)?;
        }
        Ok(())
    }
}
