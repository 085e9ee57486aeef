//! Step execution: turns compiled steps into OS-level effects.
//!
//! Keyboard and mouse injection go through `enigo`, which is blocking, so
//! every call hops to the blocking pool. The senders sit behind traits so
//! dispatcher tests can record effects instead of emitting them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cache_model::{CompiledStep, ScriptEntry};
use thiserror::Error;
use tokio::task;
use tracing::{debug, warn};

use crate::script::{ScriptContext, ScriptError, ScriptHost};

#[derive(Debug, Error)]
pub enum StepError {
    #[error("keystroke injection failed: {0}")]
    Key(String),
    #[error("mouse injection failed: {0}")]
    Mouse(String),
    #[error("script '{0}' failed: {1}")]
    Script(String, ScriptError),
    #[error("script '{0}' exceeded the {1:?} execution budget")]
    ScriptTimeout(String, Duration),
    #[error("no script at index {0} in the active bundle")]
    UnknownScript(u32),
}

#[async_trait]
pub trait KeySender: Send + Sync {
    async fn send_keystroke(&self, keys: &[String]) -> Result<(), StepError>;
}

#[async_trait]
pub trait MouseSender: Send + Sync {
    async fn click(&self, button: &str, clicks: u32) -> Result<(), StepError>;
}

/// Logs instead of injecting. The default under test.
#[derive(Debug, Default)]
pub struct LoggingKeySender;

#[async_trait]
impl KeySender for LoggingKeySender {
    async fn send_keystroke(&self, keys: &[String]) -> Result<(), StepError> {
        debug!(target: "padforge::actions", ?keys, "keystroke");
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct LoggingMouseSender;

#[async_trait]
impl MouseSender for LoggingMouseSender {
    async fn click(&self, button: &str, clicks: u32) -> Result<(), StepError> {
        debug!(target: "padforge::actions", button, clicks, "mouse click");
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct EnigoKeySender;

#[async_trait]
impl KeySender for EnigoKeySender {
    async fn send_keystroke(&self, keys: &[String]) -> Result<(), StepError> {
        let keys = keys.to_vec();
        task::spawn_blocking(move || send_keys_blocking(keys))
            .await
            .map_err(|err| StepError::Key(err.to_string()))?
    }
}

#[derive(Debug, Default)]
pub struct EnigoMouseSender;

#[async_trait]
impl MouseSender for EnigoMouseSender {
    async fn click(&self, button: &str, clicks: u32) -> Result<(), StepError> {
        let button = button.to_string();
        task::spawn_blocking(move || click_blocking(&button, clicks))
            .await
            .map_err(|err| StepError::Mouse(err.to_string()))?
    }
}

#[cfg(not(test))]
pub type DefaultKeySender = EnigoKeySender;
#[cfg(not(test))]
pub type DefaultMouseSender = EnigoMouseSender;

#[cfg(test)]
pub type DefaultKeySender = LoggingKeySender;
#[cfg(test)]
pub type DefaultMouseSender = LoggingMouseSender;

/// The executable backends an invocation runs against.
pub struct ActionSet {
    pub keys: Arc<dyn KeySender>,
    pub mouse: Arc<dyn MouseSender>,
    pub scripts: Arc<dyn ScriptHost>,
    /// Per-script wall-clock budget; an expired budget fails the step.
    pub script_timeout: Duration,
}

impl ActionSet {
    /// Execute one step to completion. `scripts` is the active bundle's
    /// script table, for resolving `ScriptCall` indices.
    pub async fn execute(
        &self,
        macro_id: &str,
        step: &CompiledStep,
        scripts: &[ScriptEntry],
    ) -> Result<(), StepError> {
        match step {
            CompiledStep::Keystroke { keys } => self.keys.send_keystroke(keys).await,
            CompiledStep::Pause { ms } => {
                // Suspends this invocation only; the dispatcher keeps
                // serving other triggers.
                tokio::time::sleep(Duration::from_millis(*ms)).await;
                Ok(())
            }
            CompiledStep::ScriptCall { index } => {
                let entry = scripts
                    .get(*index as usize)
                    .ok_or(StepError::UnknownScript(*index))?;
                let ctx = ScriptContext {
                    macro_id: macro_id.to_string(),
                };
                match tokio::time::timeout(
                    self.script_timeout,
                    self.scripts.execute_script(&entry.id, &ctx),
                )
                .await
                {
                    Ok(Ok(_)) => Ok(()),
                    Ok(Err(err)) => Err(StepError::Script(entry.id.clone(), err)),
                    Err(_) => Err(StepError::ScriptTimeout(
                        entry.id.clone(),
                        self.script_timeout,
                    )),
                }
            }
            CompiledStep::Mouse { button, clicks } => self.mouse.click(button, *clicks).await,
            CompiledStep::System { command } => {
                // Accepted but not executed; kept for forward compatibility
                // with configs authored for hosts that allow shell steps.
                warn!(target: "padforge::actions", command, "system step ignored");
                Ok(())
            }
        }
    }
}

fn send_keys_blocking(keys: Vec<String>) -> Result<(), StepError> {
    use enigo::{Enigo, Key, KeyboardControllable};

    if keys.is_empty() {
        return Ok(());
    }

    let mut enigo = Enigo::new();
    let mut modifiers: Vec<Key> = Vec::new();

    for key_str in keys.iter().take(keys.len().saturating_sub(1)) {
        let key = map_key(key_str).ok_or_else(|| StepError::Key(format!("unknown key '{key_str}'")))?;
        enigo.key_down(key.clone());
        modifiers.push(key);
    }

    if let Some(last_str) = keys.last() {
        let last_key =
            map_key(last_str).ok_or_else(|| StepError::Key(format!("unknown key '{last_str}'")))?;
        enigo.key_click(last_key);
    }

    for key in modifiers.into_iter().rev() {
        enigo.key_up(key);
    }
    Ok(())
}

fn click_blocking(button: &str, clicks: u32) -> Result<(), StepError> {
    use enigo::{Enigo, MouseButton, MouseControllable};

    let button = match button.to_ascii_lowercase().as_str() {
        "left" => MouseButton::Left,
        "right" => MouseButton::Right,
        "middle" => MouseButton::Middle,
        other => return Err(StepError::Mouse(format!("unknown button '{other}'"))),
    };
    let mut enigo = Enigo::new();
    for _ in 0..clicks.max(1) {
        enigo.mouse_click(button);
    }
    Ok(())
}

fn map_key(input: &str) -> Option<enigo::Key> {
    use enigo::Key;
    match input.to_ascii_lowercase().as_str() {
        "ctrl" | "control" => Some(Key::Control),
        "alt" => Some(Key::Alt),
        "shift" => Some(Key::Shift),
        "meta" | "cmd" | "command" | "super" => Some(Key::Meta),
        "enter" | "return" => Some(Key::Return),
        "space" | "spacebar" => Some(Key::Space),
        "tab" => Some(Key::Tab),
        "esc" | "escape" => Some(Key::Escape),
        s if s.chars().count() == 1 => s.chars().next().map(Key::Layout),
        _ => None,
    }
}
