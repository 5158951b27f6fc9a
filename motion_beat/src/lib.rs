//! # motion_beat
//!
//! Kinematic analysis of motion-capture bodies, and detection of sudden
//! accelerations ("beats") that drive the musical layer.
//!
//! ## Pipeline
//!
//! | Stage | Type | Role |
//! |---|---|---|
//! | Decode | [`CapturePacket`] | Validate an OSC argument list against the clock / position schema |
//! | Demultiplex | [`BodyDispatcher`] | Rebuild the shared clock, route bodies to a fixed pool of slots |
//! | Estimate | [`KinematicEstimator`] | Moving-average velocity, acceleration and jerk per slot |
//! | Detect | [`OnsetDetector`] | Threshold band + stale-frame guard + refractory period |
//!
//! Beats and per-frame movement are reported synchronously through
//! [`BeatCallback`] / [`MoveCallback`], shared by every slot of a dispatcher.
//!
//! ## Quick start
//!
//! ```rust
//! use std::sync::Arc;
//! use motion_beat::{BeatEvent, BodyDispatcher, DispatcherConfig};
//! use rosc::OscType;
//!
//! let mut dispatcher = BodyDispatcher::new(&DispatcherConfig::default()).unwrap();
//! dispatcher.set_beat_callback(Arc::new(|beat: &BeatEvent| {
//!     println!("beat from body {} at {:.3}s", beat.body_id, beat.timestamp);
//! }));
//!
//! // Clock packet: 1.5 s expressed in microseconds, split hi / lo.
//! dispatcher.deliver("/qtm/data", &[OscType::Int(0), OscType::Int(1_500_000)]).unwrap();
//! // One body at (0.1, 0.2, 0.3) with id 7.
//! dispatcher.deliver("/qtm/3d_no_labels", &[
//!     OscType::Int(1),
//!     OscType::Float(0.1), OscType::Float(0.2), OscType::Float(0.3), OscType::Int(7),
//! ]).unwrap();
//! assert!((dispatcher.clock() - 1.5).abs() < 1e-9);
//! ```

pub mod dispatcher;
pub mod error;
pub mod kinematics;
pub mod packet;

pub use dispatcher::{BodyDispatcher, DispatcherConfig};
pub use error::ConfigError;
pub use kinematics::{
    BeatCallback, BeatEvent, EstimatorConfig, KinematicEstimator, MoveCallback, MoveEvent,
    OnsetDetector, Recording, MAX_FRAME_GAP, REFRACTORY_PERIOD,
};
pub use packet::{BodyReport, CapturePacket, PacketError, DEFAULT_CLOCK_ADDRESS};

/// Position / velocity / acceleration vector type used throughout the crate.
pub type Vec3 = nalgebra::Vector3<f64>;
