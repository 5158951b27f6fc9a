//! Output backends for [`MidiEvent`]s.
//!
//! The scheduler only sees the [`MidiOut`] trait.  Backends:
//!
//! * [`NullOut`]: discards everything (dry runs);
//! * [`RecordingOut`]: keeps every event in a shared in-memory log;
//! * [`MidirOut`]: a real or virtual MIDI port (feature `hw-midi`).
//!
//! Network backends (e.g. OSC) live with the transport and implement the
//! same trait.

use std::sync::{Arc, Mutex, PoisonError};

use crate::error::OutputError;
use crate::MidiEvent;

// ════════════════════════════════════════════════════════════════════════════
// MidiOut
// ════════════════════════════════════════════════════════════════════════════

/// Fire-and-forget sink for scheduler events.
///
/// Failures are returned to the caller and never retried.
pub trait MidiOut: Send {
    fn send(&mut self, event: &MidiEvent) -> Result<(), OutputError>;
}

impl<T: MidiOut + ?Sized> MidiOut for Box<T> {
    fn send(&mut self, event: &MidiEvent) -> Result<(), OutputError> {
        (**self).send(event)
    }
}

// ── null backend ──────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Default)]
pub struct NullOut;

impl MidiOut for NullOut {
    fn send(&mut self, _event: &MidiEvent) -> Result<(), OutputError> { Ok(()) }
}

// ── in-memory backend ─────────────────────────────────────────────────────

/// Records events; clones share the same log.
#[derive(Clone, Debug, Default)]
pub struct RecordingOut {
    events: Arc<Mutex<Vec<MidiEvent>>>,
}

impl RecordingOut {
    pub fn new() -> Self { Self::default() }

    /// Snapshot of everything sent so far.
    pub fn events(&self) -> Vec<MidiEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Drain the log.
    pub fn take(&self) -> Vec<MidiEvent> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl MidiOut for RecordingOut {
    fn send(&mut self, event: &MidiEvent) -> Result<(), OutputError> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(*event);
        Ok(())
    }
}

// ════════════════════════════════════════════════════════════════════════════
// MidirOut: midir backend (feature = "hw-midi")
// ════════════════════════════════════════════════════════════════════════════

/// MIDI port connection.
#[cfg(feature = "hw-midi")]
pub struct MidirOut {
    conn: midir::MidiOutputConnection,
}

#[cfg(feature = "hw-midi")]
impl MidirOut {
    /// Connect to the first output port whose name contains `port_name`
    /// (case-insensitive).  If none exists, a virtual port of that name is
    /// opened where the platform supports it.
    pub fn open(client_name: &str, port_name: &str) -> Result<Self, OutputError> {
        let midi_out = midir::MidiOutput::new(client_name)
            .map_err(|e| OutputError::Init(e.to_string()))?;

        let needle = port_name.to_lowercase();
        let port = midi_out.ports().into_iter().find(|p| {
            midi_out.port_name(p)
                .map(|n| n.to_lowercase().contains(&needle))
                .unwrap_or(false)
        });

        if let Some(port) = port {
            let name = midi_out.port_name(&port).unwrap_or_else(|_| "Unknown".to_string());
            tracing::info!("opening MIDI port: {name}");
            let conn = midi_out.connect(&port, client_name)
                .map_err(|e| OutputError::Connect { port: name, reason: e.to_string() })?;
            return Ok(MidirOut { conn });
        }

        Self::open_virtual(midi_out, port_name)
    }

    #[cfg(unix)]
    fn open_virtual(midi_out: midir::MidiOutput, port_name: &str) -> Result<Self, OutputError> {
        use midir::os::unix::VirtualOutput;

        tracing::info!("no MIDI port matches '{port_name}', opening a virtual port");
        let conn = midi_out.create_virtual(port_name)
            .map_err(|e| OutputError::Connect { port: port_name.to_string(), reason: e.to_string() })?;
        Ok(MidirOut { conn })
    }

    #[cfg(not(unix))]
    fn open_virtual(_midi_out: midir::MidiOutput, port_name: &str) -> Result<Self, OutputError> {
        Err(OutputError::NoPort(port_name.to_string()))
    }
}

#[cfg(feature = "hw-midi")]
impl MidiOut for MidirOut {
    fn send(&mut self, event: &MidiEvent) -> Result<(), OutputError> {
        self.conn.send(&event.to_bytes()).map_err(|e| OutputError::Send {
            event:  format!("{event:?}"),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_clones_share_log() {
        let out = RecordingOut::new();
        let mut writer = out.clone();
        writer.send(&MidiEvent::AllNotesOff { channel: 4 }).unwrap();
        assert_eq!(out.events(), vec![MidiEvent::AllNotesOff { channel: 4 }]);
        assert_eq!(out.take().len(), 1);
        assert!(out.events().is_empty());
    }

    #[test]
    fn boxed_output_forwards() {
        let out = RecordingOut::new();
        let mut boxed: Box<dyn MidiOut> = Box::new(out.clone());
        boxed.send(&MidiEvent::NoteOn { channel: 0, key: 60, velocity: 1 }).unwrap();
        assert_eq!(out.events().len(), 1);
    }
}
