use thiserror::Error;

/// Rejected estimator or dispatcher configuration.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("smoothing window must hold at least one frame")]
    EmptyWindow,

    #[error("axis permutation {0:?} is not a permutation of [0, 1, 2]")]
    InvalidPermutation([usize; 3]),

    #[error("beat band is empty: threshold {threshold} must be below max accel {max_accel}")]
    EmptyBeatBand { threshold: f64, max_accel: f64 },

    #[error("{name} must be finite, got {value}")]
    NotFinite { name: &'static str, value: f64 },

    #[error("dispatcher needs at least one body slot")]
    NoSlots,
}
