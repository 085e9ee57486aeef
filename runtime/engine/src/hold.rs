//! Per-pad tap/hold state machine.
//!
//! Pure and synchronous: the dispatcher feeds it press/release/timeout
//! events and acts on the returned effect (arming or cancelling the timer,
//! firing the bound macro). A release before the timeout is a tap; the
//! timeout expiring first is a hold. Either way the pad returns to idle, so
//! exactly one of tap or hold fires per press.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PadPhase {
    #[default]
    Idle,
    Pressed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PadEvent {
    Press,
    Release,
    /// The hold timer for this pad expired.
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PadEffect {
    /// Arm the hold timer for this pad.
    StartTimer,
    FireTap,
    FireHold,
    None,
}

#[derive(Debug, Default)]
pub struct TapHoldMachine {
    phase: PadPhase,
}

impl TapHoldMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> PadPhase {
        self.phase
    }

    pub fn on(&mut self, event: PadEvent) -> PadEffect {
        match (self.phase, event) {
            (PadPhase::Idle, PadEvent::Press) => {
                self.phase = PadPhase::Pressed;
                PadEffect::StartTimer
            }
            (PadPhase::Pressed, PadEvent::Release) => {
                self.phase = PadPhase::Idle;
                PadEffect::FireTap
            }
            (PadPhase::Pressed, PadEvent::Timeout) => {
                self.phase = PadPhase::Idle;
                PadEffect::FireHold
            }
            // Stale timeouts after a release, duplicate presses, releases
            // while idle: all ignored.
            _ => PadEffect::None,
        }
    }
}
