//! Demultiplexing of multi-body capture packets.
//!
//! The dispatcher owns a fixed pool of *P* [`KinematicEstimator`] slots built
//! from one [`EstimatorConfig`].  Clock packets update a shared clock; every
//! position packet is fanned out to the slots by report order:
//!
//! ```text
//!   packet:  [count=5, b0, b1, b2, b3, b4]     P = 3
//!                      ╳   ╳   │   │   │
//!   slots:                     0   1   2
//! ```
//!
//! When more bodies are reported than there are slots, the *first* bodies of
//! the packet are dropped and the last *P* kept.  The reported id does not
//! influence routing; it travels with the events so listeners can tell bodies
//! apart.

use rosc::OscType;
use tracing::{debug, warn};

use crate::error::ConfigError;
use crate::kinematics::{BeatCallback, EstimatorConfig, KinematicEstimator, MoveCallback};
use crate::packet::{BodyReport, CapturePacket, PacketError, DEFAULT_CLOCK_ADDRESS};

// ════════════════════════════════════════════════════════════════════════════
// DispatcherConfig
// ════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Debug, PartialEq)]
pub struct DispatcherConfig {
    /// Number of estimator slots (*P*).
    pub bodies:        usize,
    pub clock_address: String,
    pub estimator:     EstimatorConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            bodies:        4,
            clock_address: DEFAULT_CLOCK_ADDRESS.to_string(),
            estimator:     EstimatorConfig::default(),
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// BodyDispatcher
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug)]
pub struct BodyDispatcher {
    slots:         Vec<KinematicEstimator>,
    clock:         f64,
    clock_address: String,
    dropped:       u64,
}

impl BodyDispatcher {
    pub fn new(config: &DispatcherConfig) -> Result<Self, ConfigError> {
        if config.bodies == 0 {
            return Err(ConfigError::NoSlots);
        }
        Ok(BodyDispatcher {
            slots:         config.estimator.build_pool(config.bodies)?,
            clock:         0.0,
            clock_address: config.clock_address.clone(),
            dropped:       0,
        })
    }

    /// Decode and apply one inbound message.
    ///
    /// A malformed message is logged and returned as an error; dispatcher
    /// state is left untouched, so the caller can simply carry on with the
    /// next one.
    pub fn deliver(&mut self, address: &str, args: &[OscType]) -> Result<(), PacketError> {
        match CapturePacket::decode(address, args, &self.clock_address) {
            Ok(packet) => {
                self.handle(&packet);
                Ok(())
            }
            Err(e) => {
                warn!("dropping malformed packet: {e}");
                Err(e)
            }
        }
    }

    /// Apply an already decoded packet.
    pub fn handle(&mut self, packet: &CapturePacket) {
        match packet {
            CapturePacket::Clock { hi, lo } => {
                self.clock = CapturePacket::clock_seconds(*hi, *lo);
            }
            CapturePacket::Positions(bodies) => self.dispatch(bodies),
        }
    }

    fn dispatch(&mut self, bodies: &[BodyReport]) {
        let capacity = self.slots.len();
        let overflow = bodies.len().saturating_sub(capacity);
        if overflow > 0 {
            debug!(reported = bodies.len(), capacity, overflow, "too many bodies, dropping oldest");
            self.dropped += overflow as u64;
        }
        let clock = self.clock;
        for (slot, body) in self.slots.iter_mut().zip(&bodies[overflow..]) {
            slot.ingest(clock, body.position, body.id);
        }
    }

    // ── configuration shared by all slots ─────────────────────────────────

    pub fn set_beat_callback(&mut self, callback: BeatCallback) {
        for slot in &mut self.slots {
            slot.set_beat_callback(Some(callback.clone()));
        }
    }

    pub fn set_move_callback(&mut self, callback: MoveCallback) {
        for slot in &mut self.slots {
            slot.set_move_callback(Some(callback.clone()));
        }
    }

    pub fn clear_callbacks(&mut self) {
        for slot in &mut self.slots {
            slot.set_beat_callback(None);
            slot.set_move_callback(None);
        }
    }

    pub fn set_transform(
        &mut self,
        origin:      Option<[f64; 3]>,
        scale:       Option<[f64; 3]>,
        permutation: Option<[usize; 3]>,
    ) -> Result<(), ConfigError> {
        for slot in &mut self.slots {
            slot.set_transform(origin, scale, permutation)?;
        }
        Ok(())
    }

    /// Reset every slot and the clock.
    pub fn reset(&mut self) {
        self.slots.iter_mut().for_each(KinematicEstimator::reset);
        self.clock = 0.0;
        self.dropped = 0;
    }

    // ── accessors ─────────────────────────────────────────────────────────

    /// Shared capture clock in seconds.
    pub fn clock(&self) -> f64 { self.clock }

    pub fn capacity(&self) -> usize { self.slots.len() }

    pub fn slots(&self) -> &[KinematicEstimator] { &self.slots }

    pub fn slot_mut(&mut self, index: usize) -> Option<&mut KinematicEstimator> {
        self.slots.get_mut(index)
    }

    /// Bodies discarded by the overflow policy since construction or reset.
    pub fn dropped_bodies(&self) -> u64 { self.dropped }
}

// ════════════════════════════════════════════════════════════════════════════
// Tests
// ════════════════════════════════════════════════════════════════════════════
