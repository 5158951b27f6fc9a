//! Beat → chord mapping.
//!
//! The root follows the body's height; the chord shape is a fixed list of
//! fractional intervals above the root, so just-intonation voicings come out
//! as pitch-bent notes.  Harder hits play louder.

use serde::{Deserialize, Serialize};

use microtonal_midi::ChordNote;
use motion_beat::BeatEvent;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VoicingConfig {
    /// Root pitch at height 0.
    pub base_pitch:         f64,
    /// Root pitch change per unit of height.
    pub semitones_per_unit: f64,
    /// Semitone offsets of the chord tones above the root.
    pub intervals:          Vec<f64>,
    pub min_pitch:          f64,
    pub max_pitch:          f64,
    /// Velocity per unit of acceleration magnitude.
    pub velocity_scale:     f64,
}

impl Default for VoicingConfig {
    fn default() -> Self {
        VoicingConfig {
            base_pitch:         60.0,
            semitones_per_unit: 12.0,
            // just major triad: 5/4 and 3/2 above the root
            intervals:          vec![0.0, 3.863, 7.02],
            min_pitch:          36.0,
            max_pitch:          96.0,
            velocity_scale:     10.0,
        }
    }
}

impl VoicingConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.intervals.is_empty() {
            return Err("at least one interval is required".into());
        }
        if self.intervals.len() > microtonal_midi::MIDI_CHANNELS as usize {
            return Err(format!(
                "a chord can have at most {} notes, got {}",
                microtonal_midi::MIDI_CHANNELS,
                self.intervals.len()
            ));
        }
        let scalars = [
            ("base_pitch", self.base_pitch),
            ("semitones_per_unit", self.semitones_per_unit),
            ("min_pitch", self.min_pitch),
            ("max_pitch", self.max_pitch),
            ("velocity_scale", self.velocity_scale),
        ];
        if let Some((name, v)) = scalars.iter().find(|(_, v)| !v.is_finite()) {
            return Err(format!("{name} must be finite, got {v}"));
        }
        if self.intervals.iter().any(|i| !i.is_finite()) {
            return Err("intervals must be finite".into());
        }
        if !(0.0..=127.0).contains(&self.min_pitch)
            || !(0.0..=127.0).contains(&self.max_pitch)
            || self.min_pitch > self.max_pitch
        {
            return Err(format!(
                "pitch range {}..{} must lie within 0..127 and not be empty",
                self.min_pitch, self.max_pitch
            ));
        }
        if self.velocity_scale < 0.0 {
            return Err(format!("velocity_scale must not be negative, got {}", self.velocity_scale));
        }
        Ok(())
    }
}

// ════════════════════════════════════════════════════════════════════════════
// ChordVoicing
// ════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Debug)]
pub struct ChordVoicing {
    config: VoicingConfig,
}

impl ChordVoicing {
    pub fn new(config: VoicingConfig) -> Self {
        ChordVoicing { config }
    }

    pub fn config(&self) -> &VoicingConfig { &self.config }

    /// Root pitch for a body at `height`, clamped to the configured range.
    pub fn root_for(&self, height: f64) -> f64 {
        let c = &self.config;
        (c.base_pitch + height * c.semitones_per_unit).clamp(c.min_pitch, c.max_pitch)
    }

    /// Velocity for an acceleration magnitude, in `1..=127`.
    pub fn velocity_for(&self, accel: f64) -> u8 {
        (accel.abs() * self.config.velocity_scale).round().clamp(1.0, 127.0) as u8
    }

    pub fn chord_for(&self, beat: &BeatEvent) -> Vec<ChordNote> {
        let root = self.root_for(beat.position.z);
        let velocity = self.velocity_for(beat.accel.norm());
        self.config.intervals.iter()
            .map(|interval| ChordNote::new((root + interval).clamp(0.0, 127.0), velocity))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    fn beat(z: f64, accel: f64) -> BeatEvent {
        BeatEvent {
            position:  Vector3::new(0.3, -0.2, z),
            speed:     Vector3::zeros(),
            accel:     Vector3::new(accel, 0.0, 0.0),
            jerk:      Vector3::zeros(),
            slot:      0,
            body_id:   7,
            timestamp: 1.0,
        }
    }

    #[test]
    fn default_is_just_triad_on_middle_c() {
        let chord = ChordVoicing::new(VoicingConfig::default()).chord_for(&beat(0.0, 3.0));
        assert_eq!(chord.len(), 3);
        assert_relative_eq!(chord[0].pitch, 60.0);
        assert_relative_eq!(chord[1].pitch, 63.863, epsilon = 1e-9);
        assert_relative_eq!(chord[2].pitch, 67.02, epsilon = 1e-9);
        assert!(chord.iter().all(|n| n.velocity == 30));
    }

    #[test]
    fn height_moves_root() {
        let v = ChordVoicing::new(VoicingConfig::default());
        assert_relative_eq!(v.root_for(0.5), 66.0);
        assert_relative_eq!(v.root_for(-1.0), 48.0);
    }

    #[test]
    fn root_is_clamped() {
        let v = ChordVoicing::new(VoicingConfig::default());
        assert_relative_eq!(v.root_for(100.0), 96.0);
        assert_relative_eq!(v.root_for(-100.0), 36.0);
    }

    #[test]
    fn velocity_is_clamped() {
        let v = ChordVoicing::new(VoicingConfig::default());
        assert_eq!(v.velocity_for(0.0), 1);
        assert_eq!(v.velocity_for(-4.0), 40);
        assert_eq!(v.velocity_for(1e6), 127);
    }

    #[test]
    fn validation() {
        assert!(VoicingConfig::default().validate().is_ok());
        let mut c = VoicingConfig::default();
        c.min_pitch = 100.0;
        assert!(c.validate().is_err());
        let mut c = VoicingConfig::default();
        c.intervals = vec![0.0; 17];
        assert!(c.validate().is_err());
        let mut c = VoicingConfig::default();
        c.semitones_per_unit = f64::NAN;
        assert!(c.validate().is_err());
    }
}
