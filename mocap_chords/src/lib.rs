//! # mocap_chords
//!
//! Turns a motion-capture OSC feed into microtonal chords.
//!
//! ```text
//!  UDP ──► OscReceiver ──► BodyDispatcher ──► KinematicEstimator ──► beat
//!                                                                     │
//!  instrument ◄── OscOut / MidirOut ◄── NoteScheduler ◄── ChordVoicing ◄┘
//! ```
//!
//! | Module | Role |
//! |---|---|
//! | [`config`] | TOML configuration with defaults for every key |
//! | [`transport`] | OSC receive loop and OSC instrument output |
//! | [`voicing`] | Beat → chord (root from height, velocity from acceleration) |
//! | [`app`] | Wiring, run loop and orderly shutdown |
//!
//! The `hw-midi` feature adds a raw MIDI port backend.

pub mod app;
pub mod config;
pub mod transport;
pub mod voicing;

pub use app::{build_output, App, AppError};
pub use config::{AppConfig, OutputBackend};
pub use voicing::{ChordVoicing, VoicingConfig};
