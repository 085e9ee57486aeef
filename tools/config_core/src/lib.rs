pub mod diagnostics;
pub mod merge;
pub mod render;
pub mod schema;
pub mod validation;

pub use diagnostics::{has_blocking, Diagnostic, IssueCode, Location, Severity};
pub use merge::{hash_sources, merge_path, merge_sources, merge_str, MergeError, MergedConfig, SourceFile};
pub use render::{diff_configs, format_config, DiffEntry};
pub use validation::validate_config;
