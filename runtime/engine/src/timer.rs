//! Shared timer wheel for tap/hold arbitration.
//!
//! One background task owns a `DelayQueue`; callers talk to it through an
//! unbounded command channel, so scheduling and cancellation never block the
//! dispatcher. Scheduling a key that is already pending replaces the old
//! deadline.

use std::collections::HashMap;
use std::time::Duration;

use futures::future::poll_fn;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::trace;

/// Identifies one pending timer: a device plus a slot within it (for pad
/// timers the slot is the note number).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TimerKey {
    pub device: String,
    pub slot: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    OneShot,
    /// Re-armed with the given period after every expiry.
    Repeating(Duration),
}

/// Delivered on the fire channel when a timer expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerFire {
    pub key: TimerKey,
}

#[derive(Debug)]
enum Command {
    Schedule {
        key: TimerKey,
        after: Duration,
        kind: TimerKind,
    },
    Cancel {
        key: TimerKey,
    },
    CancelDevice {
        device: String,
    },
}

#[derive(Debug)]
pub struct TimerWheel {
    tx: mpsc::UnboundedSender<Command>,
    handle: JoinHandle<()>,
}

impl TimerWheel {
    /// Spawn the wheel task. Expiries are pushed to `fire_tx`.
    pub fn spawn(fire_tx: mpsc::UnboundedSender<TimerFire>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_wheel(rx, fire_tx));
        Self { tx, handle }
    }

    pub fn schedule(&self, key: TimerKey, after: Duration, kind: TimerKind) {
        let _ = self.tx.send(Command::Schedule { key, after, kind });
    }

    pub fn cancel(&self, key: TimerKey) {
        let _ = self.tx.send(Command::Cancel { key });
    }

    /// Drop every pending timer belonging to `device`.
    pub fn cancel_device(&self, device: impl Into<String>) {
        let _ = self.tx.send(Command::CancelDevice {
            device: device.into(),
        });
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

async fn run_wheel(
    mut rx: mpsc::UnboundedReceiver<Command>,
    fire_tx: mpsc::UnboundedSender<TimerFire>,
) {
    let mut queue: DelayQueue<TimerKey> = DelayQueue::new();
    let mut pending: HashMap<TimerKey, (delay_queue::Key, TimerKind)> = HashMap::new();

    loop {
        tokio::select! {
            command = rx.recv() => {
                let Some(command) = command else { break };
                match command {
                    Command::Schedule { key, after, kind } => {
                        if let Some((old, _)) = pending.remove(&key) {
                            queue.remove(&old);
                        }
                        trace!(target: "padforge::timer", ?key, ?after, "armed");
                        let qkey = queue.insert(key.clone(), after);
                        pending.insert(key, (qkey, kind));
                    }
                    Command::Cancel { key } => {
                        if let Some((qkey, _)) = pending.remove(&key) {
                            queue.remove(&qkey);
                            trace!(target: "padforge::timer", ?key, "cancelled");
                        }
                    }
                    Command::CancelDevice { device } => {
                        let stale: Vec<TimerKey> = pending
                            .keys()
                            .filter(|k| k.device == device)
                            .cloned()
                            .collect();
                        for key in stale {
                            if let Some((qkey, _)) = pending.remove(&key) {
                                queue.remove(&qkey);
                            }
                        }
                    }
                }
            }
            expired = poll_fn(|cx| queue.poll_expired(cx)), if !queue.is_empty() => {
                let Some(expired) = expired else { continue };
                let key = expired.into_inner();
                let kind = pending.remove(&key).map(|(_, kind)| kind);
                if let Some(TimerKind::Repeating(period)) = kind {
                    let qkey = queue.insert(key.clone(), period);
                    pending.insert(key.clone(), (qkey, TimerKind::Repeating(period)));
                }
                trace!(target: "padforge::timer", ?key, "fired");
                if fire_tx.send(TimerFire { key }).is_err() {
                    break;
                }
            }
        }
    }
}
