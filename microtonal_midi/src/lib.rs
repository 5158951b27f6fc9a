//! # microtonal_midi
//!
//! Symbolic note output for microtonal chords.
//!
//! A fractional pitch such as `60.25` is played as MIDI key `60` with a
//! pitch bend a quarter of the way up.  Because a bend applies to a whole
//! channel, every note of a chord gets its own channel, taken round-robin
//! from a fixed pool; the [`NoteScheduler`] releases each chord once its
//! duration has elapsed.
//!
//! The bend encoding assumes the receiving instrument uses a bend range of
//! ±1 semitone:
//!
//! | fractional part | bend |
//! |---|---|
//! | 0.0  | 8192 (centre) |
//! | 0.5  | 12288 |
//! | →1.0 | 16383 (clamped) |
//!
//! ## Quick start
//!
//! ```rust
//! use microtonal_midi::{ChordNote, NoteScheduler, RecordingOut, SchedulerConfig};
//!
//! let out = RecordingOut::new();
//! let scheduler = NoteScheduler::new(Box::new(out.clone()), SchedulerConfig::default()).unwrap();
//!
//! let notes = scheduler.schedule_chord(&[
//!     ChordNote::new(60.0, 100),
//!     ChordNote::new(63.86, 100),   // just major third
//! ]).unwrap();
//! assert_eq!(notes[0].channel, 0);
//! assert_eq!(notes[1].channel, 1);
//! assert_eq!(out.events().len(), 4); // bend + note-on per note
//! ```

pub mod error;
pub mod output;
pub mod scheduler;

pub use error::{ConfigError, OutputError};
pub use output::{MidiOut, NullOut, RecordingOut};
#[cfg(feature = "hw-midi")]
pub use output::MidirOut;
pub use scheduler::{Clock, ManualClock, MonotonicClock, NoteScheduler, SchedulerConfig};

/// Centre (no bend) value of the 14-bit pitch wheel.
pub const PITCH_BEND_CENTER: u16 = 8192;

/// Largest 14-bit pitch wheel value.
pub const PITCH_BEND_MAX: u16 = 16383;

/// Channel-mode controller number for "All Notes Off".
pub const CC_ALL_NOTES_OFF: u8 = 123;

/// Number of channels a MIDI port offers.
pub const MIDI_CHANNELS: u8 = 16;

// ════════════════════════════════════════════════════════════════════════════
// Pitch helpers
// ════════════════════════════════════════════════════════════════════════════

/// Pitch-wheel value for the fractional part of `pitch`.
///
/// `round(16384 × (0.5 + 0.5 × frac))`, clamped to `0..=16383`.
pub fn pitch_bend_for(pitch: f64) -> u16 {
    let frac = pitch - pitch.floor();
    let bend = (16384.0 * (0.5 + 0.5 * frac)).round();
    bend.clamp(0.0, PITCH_BEND_MAX as f64) as u16
}

/// MIDI key for the integer part of `pitch`, clamped to `0..=127`.
pub fn key_for(pitch: f64) -> u8 {
    pitch.floor().clamp(0.0, 127.0) as u8
}

// ════════════════════════════════════════════════════════════════════════════
// ChordNote / Note
// ════════════════════════════════════════════════════════════════════════════

/// A requested note: fractional pitch plus velocity.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChordNote {
    /// Semitones on the MIDI scale (60.0 = middle C); fraction = microtonal offset.
    pub pitch:    f64,
    /// Loudness (0–127).
    pub velocity: u8,
}

impl ChordNote {
    pub fn new(pitch: f64, velocity: u8) -> Self {
        ChordNote { pitch, velocity: velocity.min(127) }
    }
}

/// A note that has been started on a channel.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Note {
    /// Output channel, 0-based.
    pub channel:  u8,
    pub pitch:    f64,
    pub key:      u8,
    pub bend:     u16,
    pub velocity: u8,
}

impl Note {
    pub fn on_channel(channel: u8, requested: &ChordNote) -> Self {
        Note {
            channel,
            pitch:    requested.pitch,
            key:      key_for(requested.pitch),
            bend:     pitch_bend_for(requested.pitch),
            velocity: requested.velocity.min(127),
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// MidiEvent: what the scheduler emits
// ════════════════════════════════════════════════════════════════════════════

/// A channel message emitted by the scheduler.  Channels are 0-based here;
/// backends that address channels 1-based add one on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MidiEvent {
    PitchBend   { channel: u8, value: u16 },
    NoteOn      { channel: u8, key: u8, velocity: u8 },
    AllNotesOff { channel: u8 },
}

impl MidiEvent {
    pub fn channel(&self) -> u8 {
        match *self {
            MidiEvent::PitchBend   { channel, .. }
            | MidiEvent::NoteOn    { channel, .. }
            | MidiEvent::AllNotesOff { channel } => channel,
        }
    }

    /// Raw MIDI bytes (running status not used).
    pub fn to_bytes(&self) -> [u8; 3] {
        match *self {
            MidiEvent::PitchBend { channel, value } => {
                let value = value.min(PITCH_BEND_MAX);
                [0xE0 | (channel & 0x0F), (value & 0x7F) as u8, ((value >> 7) & 0x7F) as u8]
            }
            MidiEvent::NoteOn { channel, key, velocity } => {
                [0x90 | (channel & 0x0F), key & 0x7F, velocity & 0x7F]
            }
            MidiEvent::AllNotesOff { channel } => {
                [0xB0 | (channel & 0x0F), CC_ALL_NOTES_OFF, 0]
            }
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// Tests
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    // ── pitch bend ────────────────────────────────────────────────────────
    #[test]
    fn integer_pitch_is_centred() {
        assert_eq!(pitch_bend_for(60.0), PITCH_BEND_CENTER);
        assert_eq!(pitch_bend_for(0.0), PITCH_BEND_CENTER);
    }

    #[test]
    fn almost_next_semitone_clamps_to_max() {
        assert_eq!(pitch_bend_for(60.999_999_9), PITCH_BEND_MAX);
    }

    #[test]
    fn half_semitone_is_three_quarters() {
        assert_eq!(pitch_bend_for(64.5), 12288);
    }

    #[test]
    fn bend_is_monotonic_in_fraction() {
        let mut last = 0;
        for i in 0..1000 {
            let b = pitch_bend_for(60.0 + i as f64 / 1000.0);
            assert!(b >= last, "bend decreased at step {i}");
            last = b;
        }
    }

    #[test]
    fn key_clamps_to_midi_range() {
        assert_eq!(key_for(63.86), 63);
        assert_eq!(key_for(-3.5), 0);
        assert_eq!(key_for(140.2), 127);
    }

    // ── MIDI bytes ────────────────────────────────────────────────────────
    #[test]
    fn pitch_bend_bytes_are_lsb_first() {
        let bytes = MidiEvent::PitchBend { channel: 2, value: 12288 }.to_bytes();
        assert_eq!(bytes, [0xE2, 0x00, 0x60]);
    }

    #[test]
    fn note_on_bytes() {
        let bytes = MidiEvent::NoteOn { channel: 15, key: 60, velocity: 100 }.to_bytes();
        assert_eq!(bytes, [0x9F, 60, 100]);
    }

    #[test]
    fn all_notes_off_is_cc_123() {
        assert_eq!(MidiEvent::AllNotesOff { channel: 0 }.to_bytes(), [0xB0, 123, 0]);
    }

    #[test]
    fn note_from_request() {
        let n = Note::on_channel(3, &ChordNote::new(67.02, 90));
        assert_eq!((n.channel, n.key, n.velocity), (3, 67, 90));
        assert_eq!(n.bend, pitch_bend_for(67.02));
    }

    #[test]
    fn velocity_clamped() {
        assert_eq!(ChordNote::new(60.0, 200).velocity, 127);
    }
}
