//! Per-body kinematic estimation and beat detection.
//!
//! A [`KinematicEstimator`] turns timestamped positions into a smoothed
//! velocity (moving average of the last *S* frame differences), then
//! acceleration and jerk as first differences of that.  Its embedded
//! [`OnsetDetector`] fires a [`BeatEvent`] whenever the acceleration
//! magnitude enters the configured band, subject to a stale-frame guard and
//! a refractory period.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, trace};

use crate::error::ConfigError;
use crate::Vec3;

/// Minimum time between two beats of the same body (seconds).
pub const REFRACTORY_PERIOD: f64 = 0.1;

/// Frames arriving more than this long after their predecessor never fire a beat.
pub const MAX_FRAME_GAP: f64 = 0.2;

/// Frames closer than this to their predecessor are treated as duplicates.
const DUPLICATE_FRAME_EPSILON: f64 = 1e-6;

// ════════════════════════════════════════════════════════════════════════════
// Events and callbacks
// ════════════════════════════════════════════════════════════════════════════

/// Kinematic state of one body after an ingested sample.
#[derive(Clone, Debug, PartialEq)]
pub struct MoveEvent {
    pub position:  Vec3,
    pub speed:     Vec3,
    pub accel:     Vec3,
    pub jerk:      Vec3,
    /// `dot(speed, previous_speed)`; negative when the body reverses.
    pub speed_dot: f64,
    /// Dispatcher slot that produced the event.
    pub slot:      usize,
    /// Body id reported by the capture system.
    pub body_id:   u32,
    pub timestamp: f64,
}

/// A detected onset.
#[derive(Clone, Debug, PartialEq)]
pub struct BeatEvent {
    pub position:  Vec3,
    pub speed:     Vec3,
    pub accel:     Vec3,
    pub jerk:      Vec3,
    pub slot:      usize,
    pub body_id:   u32,
    pub timestamp: f64,
}

/// Invoked synchronously for every qualifying beat.
pub type BeatCallback = Arc<dyn Fn(&BeatEvent) + Send + Sync>;

/// Invoked synchronously for every ingested (non-duplicate) sample.
pub type MoveCallback = Arc<dyn Fn(&MoveEvent) + Send + Sync>;

// ════════════════════════════════════════════════════════════════════════════
// EstimatorConfig: immutable template for a pool of estimators
// ════════════════════════════════════════════════════════════════════════════

/// Configuration shared by every estimator of a dispatcher.
#[derive(Clone, Debug, PartialEq)]
pub struct EstimatorConfig {
    /// Number of frame differences averaged into the velocity estimate (*S*).
    pub smoothing:      usize,
    /// Lower bound (inclusive) of the beat band on `‖accel‖`.
    pub beat_threshold: f64,
    /// Upper bound (exclusive); larger accelerations are sensor spikes.
    pub max_accel:      f64,
    /// `position[i] = raw[permutation[i]]`.
    pub permutation:    [usize; 3],
    /// Subtracted after permuting.
    pub origin:         [f64; 3],
    /// Multiplied elementwise after subtracting the origin.
    pub scale:          [f64; 3],
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        EstimatorConfig {
            smoothing:      4,
            beat_threshold: 1.0,
            max_accel:      100_000.0,
            permutation:    [0, 1, 2],
            origin:         [0.0; 3],
            scale:          [1.0; 3],
        }
    }
}

impl EstimatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.smoothing == 0 {
            return Err(ConfigError::EmptyWindow);
        }
        validate_permutation(self.permutation)?;
        for (name, value) in [("beat_threshold", self.beat_threshold), ("max_accel", self.max_accel)] {
            if value.is_nan() || value == f64::NEG_INFINITY {
                return Err(ConfigError::NotFinite { name, value });
            }
        }
        for v in self.origin.iter().chain(self.scale.iter()) {
            if !v.is_finite() {
                return Err(ConfigError::NotFinite { name: "transform", value: *v });
            }
        }
        if self.beat_threshold >= self.max_accel {
            return Err(ConfigError::EmptyBeatBand {
                threshold: self.beat_threshold,
                max_accel: self.max_accel,
            });
        }
        Ok(())
    }

    /// Build a fresh estimator for dispatcher slot `slot`.
    pub fn build(&self, slot: usize) -> Result<KinematicEstimator, ConfigError> {
        self.validate()?;
        Ok(KinematicEstimator::from_config(self, slot))
    }

    /// Build `count` independent estimators, slots `0..count`.
    pub fn build_pool(&self, count: usize) -> Result<Vec<KinematicEstimator>, ConfigError> {
        self.validate()?;
        Ok((0..count).map(|slot| KinematicEstimator::from_config(self, slot)).collect())
    }
}

fn validate_permutation(p: [usize; 3]) -> Result<(), ConfigError> {
    let mut seen = [false; 3];
    for &axis in &p {
        if axis > 2 || seen[axis] {
            return Err(ConfigError::InvalidPermutation(p));
        }
        seen[axis] = true;
    }
    Ok(())
}

// ════════════════════════════════════════════════════════════════════════════
// OnsetDetector
// ════════════════════════════════════════════════════════════════════════════

/// Threshold-band beat gate with a fixed refractory period.
#[derive(Clone, Debug)]
pub struct OnsetDetector {
    threshold: f64,
    max_accel: f64,
    last_beat: f64,
}

impl OnsetDetector {
    pub fn new(threshold: f64, max_accel: f64) -> Self {
        OnsetDetector { threshold, max_accel, last_beat: 0.0 }
    }

    /// Decide whether the frame at `timestamp` is a beat.
    ///
    /// `dt` is the gap to the previous frame.  A `true` result starts a new
    /// refractory period.
    pub fn check(&mut self, accel: &Vec3, dt: f64, timestamp: f64) -> bool {
        let accel_norm = accel.norm();
        if !(self.threshold <= accel_norm && accel_norm < self.max_accel) {
            return false;
        }
        if dt > MAX_FRAME_GAP {
            trace!(dt, "beat candidate on stale frame ignored");
            return false;
        }
        if timestamp < self.last_beat + REFRACTORY_PERIOD {
            trace!(timestamp, last_beat = self.last_beat, "beat candidate in refractory period");
            return false;
        }
        self.last_beat = timestamp;
        true
    }

    /// Timestamp of the most recent beat (0.0 before the first).
    pub fn last_beat(&self) -> f64 { self.last_beat }

    pub fn reset(&mut self) { self.last_beat = 0.0; }
}

// ════════════════════════════════════════════════════════════════════════════
// Recording: fixed-length capture of kinematic state
// ════════════════════════════════════════════════════════════════════════════

/// Preallocated buffers filled by [`KinematicEstimator::record_movement`].
#[derive(Clone, Debug, Default)]
pub struct Recording {
    pub positions: Vec<Vec3>,
    pub speeds:    Vec<Vec3>,
    pub accels:    Vec<Vec3>,
    pub jerks:     Vec<Vec3>,
    len:    usize,
    active: bool,
}

impl Recording {
    fn with_steps(steps: usize) -> Self {
        Recording {
            positions: vec![Vec3::zeros(); steps],
            speeds:    vec![Vec3::zeros(); steps],
            accels:    vec![Vec3::zeros(); steps],
            jerks:     vec![Vec3::zeros(); steps],
            len:    0,
            active: steps > 0,
        }
    }

    /// Number of samples written so far.
    pub fn len(&self) -> usize { self.len }
    pub fn is_empty(&self) -> bool { self.len == 0 }
    /// Configured step count.
    pub fn capacity(&self) -> usize { self.positions.len() }
    /// Still accepting samples.
    pub fn is_active(&self) -> bool { self.active }

    /// Append one sample.  Returns `true` when this sample filled the buffers.
    fn push(&mut self, pos: Vec3, speed: Vec3, accel: Vec3, jerk: Vec3) -> bool {
        if !self.active {
            return false;
        }
        let i = self.len;
        self.positions[i] = pos;
        self.speeds[i]    = speed;
        self.accels[i]    = accel;
        self.jerks[i]     = jerk;
        self.len += 1;
        if self.len >= self.capacity() {
            self.active = false;
            return true;
        }
        false
    }
}

// ════════════════════════════════════════════════════════════════════════════
// KinematicEstimator
// ════════════════════════════════════════════════════════════════════════════

/// Kinematic state of one tracked body (one dispatcher slot).
pub struct KinematicEstimator {
    slot:        usize,
    permutation: [usize; 3],
    origin:      Vec3,
    scale:       Vec3,

    // ── smoothing window ─────────────────────────────────────────────────
    window:    Vec<Vec3>,
    write_pos: usize,

    // ── last frame ───────────────────────────────────────────────────────
    last_position: Vec3,
    last_speed:    Vec3,
    last_accel:    Vec3,
    last_time:     f64,
    /// Last body seen in this slot; `None` until the first sample.
    body_id:       Option<u32>,

    onset:     OnsetDetector,
    recording: Option<Recording>,

    beat_callback: Option<BeatCallback>,
    move_callback: Option<MoveCallback>,
}

impl fmt::Debug for KinematicEstimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KinematicEstimator")
            .field("slot", &self.slot)
            .field("body_id", &self.body_id)
            .field("last_time", &self.last_time)
            .field("last_position", &self.last_position)
            .field("last_speed", &self.last_speed)
            .finish_non_exhaustive()
    }
}

impl KinematicEstimator {
    fn from_config(cfg: &EstimatorConfig, slot: usize) -> Self {
        KinematicEstimator {
            slot,
            permutation: cfg.permutation,
            origin:      Vec3::from(cfg.origin),
            scale:       Vec3::from(cfg.scale),
            window:      vec![Vec3::zeros(); cfg.smoothing],
            write_pos:   0,
            last_position: Vec3::zeros(),
            last_speed:    Vec3::zeros(),
            last_accel:    Vec3::zeros(),
            last_time:     0.0,
            body_id:       None,
            onset:     OnsetDetector::new(cfg.beat_threshold, cfg.max_accel),
            recording: None,
            beat_callback: None,
            move_callback: None,
        }
    }

    // ── callbacks ─────────────────────────────────────────────────────────

    pub fn set_beat_callback(&mut self, callback: Option<BeatCallback>) {
        self.beat_callback = callback;
    }

    pub fn set_move_callback(&mut self, callback: Option<MoveCallback>) {
        self.move_callback = callback;
    }

    /// Replace any subset of the input transform.
    pub fn set_transform(
        &mut self,
        origin:      Option<[f64; 3]>,
        scale:       Option<[f64; 3]>,
        permutation: Option<[usize; 3]>,
    ) -> Result<(), ConfigError> {
        if let Some(p) = permutation {
            validate_permutation(p)?;
        }
        if let Some(o) = origin {
            self.origin = Vec3::from(o);
        }
        if let Some(s) = scale {
            self.scale = Vec3::from(s);
        }
        if let Some(p) = permutation {
            self.permutation = p;
        }
        Ok(())
    }

    // ── ingest ────────────────────────────────────────────────────────────

    /// Feed one sample.
    ///
    /// Returns `None` when the sample is a duplicate of the previous frame
    /// (less than a microsecond later), otherwise the resulting state.  The
    /// move callback sees every returned event; the beat callback fires at
    /// most once per call.
    pub fn ingest(&mut self, timestamp: f64, raw: [f64; 3], body_id: u32) -> Option<MoveEvent> {
        let dt = timestamp - self.last_time;
        if dt < DUPLICATE_FRAME_EPSILON {
            return None;
        }

        let position = self.transform(raw);

        if self.body_id != Some(body_id) {
            if self.body_id.is_some() {
                debug!(slot = self.slot, from = ?self.body_id, to = body_id, "slot reassigned to new body");
            }
            self.body_id = Some(body_id);
            self.last_position = position;
            self.last_time = timestamp;
        }

        let velocity = (position - self.last_position) / dt;
        self.write_pos = (self.write_pos + 1) % self.window.len();
        self.window[self.write_pos] = velocity;

        let speed = self.window.iter().fold(Vec3::zeros(), |acc, v| acc + v)
            / self.window.len() as f64;
        let accel = speed - self.last_speed;
        let jerk  = accel - self.last_accel;
        let speed_dot = speed.dot(&self.last_speed);

        self.last_position = position;
        self.last_speed    = speed;
        self.last_accel    = accel;
        self.last_time     = timestamp;

        trace!(
            slot = self.slot,
            body = body_id,
            timestamp,
            dt,
            accel = accel.norm(),
            jerk = jerk.norm(),
            "frame"
        );

        if let Some(rec) = self.recording.as_mut() {
            if rec.len() % 100 == 0 {
                debug!(slot = self.slot, step = rec.len(), "recording…");
            }
            if rec.push(position, speed, accel, jerk) {
                info!(slot = self.slot, steps = rec.len(), "finished recording");
            }
        }

        let event = MoveEvent {
            position,
            speed,
            accel,
            jerk,
            speed_dot,
            slot: self.slot,
            body_id,
            timestamp,
        };

        if let Some(cb) = &self.move_callback {
            cb(&event);
        }

        if self.onset.check(&accel, dt, timestamp) {
            if let Some(cb) = &self.beat_callback {
                cb(&BeatEvent {
                    position,
                    speed,
                    accel,
                    jerk,
                    slot: self.slot,
                    body_id,
                    timestamp,
                });
            }
        }

        Some(event)
    }

    fn transform(&self, raw: [f64; 3]) -> Vec3 {
        let p = self.permutation;
        let permuted = Vec3::new(raw[p[0]], raw[p[1]], raw[p[2]]);
        (permuted - self.origin).component_mul(&self.scale)
    }

    // ── recording ─────────────────────────────────────────────────────────

    /// Start recording the next `steps` samples into fresh buffers.
    pub fn record_movement(&mut self, steps: usize) {
        self.recording = Some(Recording::with_steps(steps));
    }

    pub fn is_recording(&self) -> bool {
        self.recording.as_ref().is_some_and(Recording::is_active)
    }

    /// The current (or last finished) recording.
    pub fn recording(&self) -> Option<&Recording> { self.recording.as_ref() }

    /// Remove and return the recording.
    pub fn take_recording(&mut self) -> Option<Recording> { self.recording.take() }

    // ── state ─────────────────────────────────────────────────────────────

    /// Back to the freshly built state; transform and callbacks are kept.
    pub fn reset(&mut self) {
        self.window.iter_mut().for_each(|v| *v = Vec3::zeros());
        self.write_pos     = 0;
        self.last_position = Vec3::zeros();
        self.last_speed    = Vec3::zeros();
        self.last_accel    = Vec3::zeros();
        self.last_time     = 0.0;
        self.body_id       = None;
        self.onset.reset();
        self.recording     = None;
    }

    pub fn slot(&self)          -> usize { self.slot }
    pub fn body_id(&self)       -> Option<u32> { self.body_id }
    pub fn last_time(&self)     -> f64   { self.last_time }
    pub fn last_beat(&self)     -> f64   { self.onset.last_beat() }
    pub fn last_position(&self) -> Vec3  { self.last_position }
    pub fn last_speed(&self)    -> Vec3  { self.last_speed }
    pub fn last_accel(&self)    -> Vec3  { self.last_accel }
    pub fn smoothing(&self)     -> usize { self.window.len() }
}

// ════════════════════════════════════════════════════════════════════════════
// Tests
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::sync::Mutex;

    fn estimator() -> KinematicEstimator {
        EstimatorConfig::default().build(0).unwrap()
    }

    fn collect_beats(est: &mut KinematicEstimator) -> Arc<Mutex<Vec<BeatEvent>>> {
        let beats = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&beats);
        est.set_beat_callback(Some(Arc::new(move |b: &BeatEvent| {
            sink.lock().unwrap().push(b.clone());
        })));
        beats
    }

    #[test]
    fn steady_velocity_fills_window() {
        let mut est = estimator();
        let v = Vec3::new(0.5, -1.0, 2.0);
        let mut last = None;
        // the first frame only anchors the body; four more fill the window
        for k in 1..=5 {
            let t = k as f64 * 0.01;
            let p = v * t;
            last = est.ingest(t, [p.x, p.y, p.z], 0);
        }
        let ev = last.unwrap();
        assert_relative_eq!(ev.speed, v, epsilon = 1e-9);
    }

    #[test]
    fn warm_up_is_biased_toward_zero() {
        let mut est = estimator();
        est.ingest(0.01, [0.0, 0.0, 0.0], 0);
        let ev = est.ingest(0.02, [0.01, 0.0, 0.0], 0).unwrap();
        // one of four window entries holds 1.0, the rest are zero
        assert_relative_eq!(ev.speed.x, 0.25, epsilon = 1e-9);
        assert_relative_eq!(ev.accel.x, 0.25, epsilon = 1e-9);
        assert_relative_eq!(ev.jerk.x, 0.25, epsilon = 1e-9);
    }

    #[test]
    fn duplicate_frame_is_ignored() {
        let mut est = estimator();
        assert!(est.ingest(1.0, [1.0, 0.0, 0.0], 0).is_some());
        assert!(est.ingest(1.0 + 1e-7, [5.0, 0.0, 0.0], 0).is_none());
        assert!(est.ingest(0.5, [5.0, 0.0, 0.0], 0).is_none());
        assert_eq!(est.last_position(), Vec3::new(1.0, 0.0, 0.0));
    }

    #[test]
    fn transform_permutes_then_offsets_then_scales() {
        let cfg = EstimatorConfig {
            permutation: [2, 0, 1],
            origin:      [1.0, 1.0, 1.0],
            scale:       [2.0, 3.0, 4.0],
            ..EstimatorConfig::default()
        };
        let mut est = cfg.build(0).unwrap();
        let ev = est.ingest(1.0, [10.0, 20.0, 30.0], 0).unwrap();
        assert_eq!(ev.position, Vec3::new(58.0, 27.0, 76.0));
    }

    #[test]
    fn invalid_permutation_rejected() {
        let cfg = EstimatorConfig { permutation: [0, 0, 1], ..EstimatorConfig::default() };
        assert_eq!(cfg.build(0).unwrap_err(), ConfigError::InvalidPermutation([0, 0, 1]));
        let mut est = estimator();
        assert!(est.set_transform(None, None, Some([0, 1, 3])).is_err());
    }

    #[test]
    fn empty_window_rejected() {
        let cfg = EstimatorConfig { smoothing: 0, ..EstimatorConfig::default() };
        assert_eq!(cfg.build(0).unwrap_err(), ConfigError::EmptyWindow);
    }

    #[test]
    fn refractory_keeps_first_beat() {
        let mut est = EstimatorConfig { smoothing: 1, ..EstimatorConfig::default() }
            .build(0).unwrap();
        let beats = collect_beats(&mut est);
        est.ingest(1.00, [0.0, 0.0, 0.0], 0);
        // jump in velocity of 5 m/s → |accel| = 5
        est.ingest(1.01, [0.05, 0.0, 0.0], 0);
        // reversal 50 ms later, also well above threshold
        est.ingest(1.06, [0.0, 0.0, 0.0], 0);
        let beats = beats.lock().unwrap();
        assert_eq!(beats.len(), 1);
        assert_relative_eq!(beats[0].timestamp, 1.01);
    }

    #[test]
    fn beat_fires_again_after_refractory() {
        let mut est = EstimatorConfig { smoothing: 1, ..EstimatorConfig::default() }
            .build(0).unwrap();
        let beats = collect_beats(&mut est);
        est.ingest(1.00, [0.0, 0.0, 0.0], 0);
        est.ingest(1.05, [0.5, 0.0, 0.0], 0);
        est.ingest(1.20, [0.0, 0.0, 0.0], 0);
        assert_eq!(beats.lock().unwrap().len(), 2);
    }

    #[test]
    fn stale_frame_never_beats() {
        let mut est = EstimatorConfig { smoothing: 1, ..EstimatorConfig::default() }
            .build(0).unwrap();
        let beats = collect_beats(&mut est);
        est.ingest(1.0, [0.0, 0.0, 0.0], 0);
        // 0.3 s gap: accel is large but the frame is stale
        est.ingest(1.3, [30.0, 0.0, 0.0], 0);
        assert!(beats.lock().unwrap().is_empty());
    }

    #[test]
    fn spikes_above_ceiling_are_ignored() {
        let mut est = EstimatorConfig { smoothing: 1, max_accel: 50.0, ..EstimatorConfig::default() }
            .build(0).unwrap();
        let beats = collect_beats(&mut est);
        est.ingest(1.00, [0.0, 0.0, 0.0], 0);
        est.ingest(1.01, [10.0, 0.0, 0.0], 0); // 1000 m/s spike
        assert!(beats.lock().unwrap().is_empty());
    }

    #[test]
    fn move_callback_sees_every_frame() {
        let mut est = estimator();
        let count = Arc::new(Mutex::new(0usize));
        let c = Arc::clone(&count);
        est.set_move_callback(Some(Arc::new(move |_: &MoveEvent| *c.lock().unwrap() += 1)));
        for k in 1..=10 {
            est.ingest(k as f64 * 0.01, [0.0, 0.0, 0.0], 0);
        }
        est.ingest(0.10, [0.0, 0.0, 0.0], 0); // duplicate
        assert_eq!(*count.lock().unwrap(), 10);
    }

    #[test]
    fn new_body_id_starts_from_its_own_position() {
        let mut est = estimator();
        for k in 1..=4 {
            est.ingest(k as f64 * 0.01, [0.0, 0.0, 0.0], 1);
        }
        // a different body, two metres away, takes over the slot
        let ev = est.ingest(0.05, [2.0, 0.0, 0.0], 2).unwrap();
        assert_eq!(ev.body_id, 2);
        assert_eq!(ev.speed, Vec3::zeros());
        assert_eq!(est.body_id(), Some(2));
    }

    #[test]
    fn first_frame_of_any_id_has_zero_speed() {
        for id in [0, 7] {
            let mut est = estimator();
            let ev = est.ingest(1.0, [3.0, 4.0, 5.0], id).unwrap();
            assert_eq!(ev.speed, Vec3::zeros());
            assert_eq!(est.body_id(), Some(id));
        }
    }

    #[test]
    fn reversal_gives_negative_speed_dot() {
        let mut est = EstimatorConfig { smoothing: 1, ..EstimatorConfig::default() }
            .build(0).unwrap();
        est.ingest(1.00, [0.0, 0.0, 0.0], 1);
        let out = est.ingest(1.01, [0.02, 0.0, 0.0], 1).unwrap();
        assert_relative_eq!(out.speed_dot, 0.0);
        let on = est.ingest(1.02, [0.04, 0.0, 0.0], 1).unwrap();
        assert_relative_eq!(on.speed_dot, 4.0, epsilon = 1e-9);
        let back = est.ingest(1.03, [0.03, 0.0, 0.0], 1).unwrap();
        // speed went from +2 to -1
        assert_relative_eq!(back.speed_dot, -2.0, epsilon = 1e-9);
    }

    #[test]
    fn recording_stops_after_configured_steps() {
        let mut est = estimator();
        est.record_movement(3);
        assert!(est.is_recording());
        for k in 1..=5 {
            est.ingest(k as f64 * 0.01, [k as f64, 0.0, 0.0], 0);
        }
        assert!(!est.is_recording());
        let rec = est.recording().unwrap();
        assert_eq!(rec.len(), 3);
        assert_eq!(rec.positions[2], Vec3::new(3.0, 0.0, 0.0));
    }

    #[test]
    fn reset_restores_fresh_state() {
        let mut est = estimator();
        est.ingest(1.0, [1.0, 2.0, 3.0], 9);
        est.reset();
        assert_eq!(est.last_time(), 0.0);
        assert_eq!(est.body_id(), None);
        assert_eq!(est.last_speed(), Vec3::zeros());
    }
}
