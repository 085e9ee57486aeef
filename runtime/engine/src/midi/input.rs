//! midir-backed input listener.
//!
//! The midir callback runs on a platform thread, so messages hop through a
//! bounded channel to a tokio task that normalizes them into pulses. Note-on
//! with velocity zero is treated as note-off, as many controllers send it.

use std::time::{SystemTime, UNIX_EPOCH};

use midir::{Ignore, MidiInput};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::dispatch::{DispatchMsg, PulseEdge, PulseKind, TriggerPulse};

#[derive(Debug)]
pub struct MidiHandle {
    pub join_handle: JoinHandle<()>,
}

struct RawMessage {
    device: String,
    bytes: Vec<u8>,
}

/// Connect to the first available input port and forward its note messages
/// as pulses. Returns `Ok(None)` when no port is present, so hosts without
/// hardware still start.
pub fn spawn_midi_listener<T: Into<String>>(
    client_name: T,
    sender: mpsc::UnboundedSender<DispatchMsg>,
) -> anyhow::Result<Option<MidiHandle>> {
    let client_name = client_name.into();
    let mut input = MidiInput::new(client_name.as_str())?;
    input.ignore(Ignore::None);

    let ports = input.ports();
    let Some(port) = ports.first().cloned() else {
        warn!(target: "padforge::midi", "no input ports, running without hardware");
        return Ok(None);
    };
    let device = input
        .port_name(&port)
        .unwrap_or_else(|_| "unknown".to_string());
    info!(target: "padforge::midi", device = %device, "connecting input port");

    let (tx, mut rx) = mpsc::channel::<RawMessage>(32);

    let callback_device = device.clone();
    std::thread::spawn(move || {
        let input = input;
        let connection = input.connect(
            &port,
            "padforge",
            move |_, message, _| {
                let _ = tx.blocking_send(RawMessage {
                    device: callback_device.clone(),
                    bytes: message.to_vec(),
                });
            },
            (),
        );
        match connection {
            Ok(_connection) => loop {
                std::thread::park();
            },
            Err(err) => {
                warn!(target: "padforge::midi", %err, "failed to open input port");
            }
        }
    });

    let gone_device = device;
    let join_handle = tokio::spawn(async move {
        while let Some(raw) = rx.recv().await {
            if let Some(pulse) = decode_pulse(&raw.device, &raw.bytes) {
                if sender.send(DispatchMsg::Pulse(pulse)).is_err() {
                    return;
                }
            }
        }
        // Channel closed means the callback thread is gone with the port.
        let _ = sender.send(DispatchMsg::DeviceGone(gone_device));
    });

    Ok(Some(MidiHandle { join_handle }))
}

fn decode_pulse(device: &str, bytes: &[u8]) -> Option<TriggerPulse> {
    if bytes.len() < 3 {
        return None;
    }
    let status = bytes[0] & 0xF0;
    let channel = bytes[0] & 0x0F;
    let note = bytes[1];
    let velocity = bytes[2];
    let edge = match status {
        0x90 if velocity > 0 => PulseEdge::Press,
        0x90 | 0x80 => PulseEdge::Release,
        _ => return None,
    };
    Some(TriggerPulse {
        device: device.to_string(),
        kind: PulseKind::Note,
        value: note,
        velocity,
        channel,
        edge,
        timestamp_ms: now_ms(),
    })
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
