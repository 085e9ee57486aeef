//! Script execution seam.
//!
//! The engine resolves a `script_call` step to a script id and hands it to
//! whatever `ScriptHost` was wired in at startup. The default host refuses
//! everything, which keeps script-free deployments honest: a config that
//! sneaks a script past validation still fails loudly at run time.

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

/// Invocation context passed to the host alongside the script id.
#[derive(Debug, Clone)]
pub struct ScriptContext {
    /// Macro whose step triggered the call.
    pub macro_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptOutcome {
    Completed,
}

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("no script host is configured")]
    Unavailable,
    #[error("script failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait ScriptHost: Send + Sync {
    async fn execute_script(
        &self,
        script_id: &str,
        ctx: &ScriptContext,
    ) -> Result<ScriptOutcome, ScriptError>;
}

/// Host used when no scripting backend is wired in.
#[derive(Debug, Default)]
pub struct NullScriptHost;

#[async_trait]
impl ScriptHost for NullScriptHost {
    async fn execute_script(
        &self,
        script_id: &str,
        ctx: &ScriptContext,
    ) -> Result<ScriptOutcome, ScriptError> {
        warn!(
            target: "padforge::script",
            script = script_id,
            macro_id = %ctx.macro_id,
            "script call with no host configured"
        );
        Err(ScriptError::Unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_host_reports_unavailable() {
        let host = NullScriptHost;
        let ctx = ScriptContext {
            macro_id: "copy".into(),
        };
        assert!(matches!(
            host.execute_script("fade_out", &ctx).await,
            Err(ScriptError::Unavailable)
        ));
    }
}
