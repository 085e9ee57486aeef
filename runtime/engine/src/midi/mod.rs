//! MIDI transport: turns raw port messages into dispatcher pulses.

pub mod input;

pub use input::{spawn_midi_listener, MidiHandle};
