//! Application configuration, loaded from TOML.
//!
//! Every key is optional; a missing file section falls back to its
//! defaults.  Example:
//!
//! ```toml
//! [transport]
//! listen = "0.0.0.0:22225"
//!
//! [output]
//! backend = "osc"
//! send    = "192.168.1.144:45454"
//!
//! [scheduler]
//! channels = 16
//! duration = 1.0
//!
//! [motion]
//! bodies         = 4
//! beat_threshold = 1.5
//! permutation    = [0, 2, 1]   # capture system is Y-up
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use microtonal_midi::SchedulerConfig;
use motion_beat::{DispatcherConfig, EstimatorConfig, DEFAULT_CLOCK_ADDRESS};

use crate::voicing::VoicingConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path:   PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid [motion] section: {0}")]
    Motion(#[from] motion_beat::ConfigError),

    #[error("invalid [scheduler] section: {0}")]
    Scheduler(#[from] microtonal_midi::ConfigError),

    #[error("invalid [voicing] section: {0}")]
    Voicing(String),

    #[error("output backend '{0}' is not available in this build")]
    BackendUnavailable(OutputBackend),
}

// ════════════════════════════════════════════════════════════════════════════
// Sections
// ════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    /// UDP address the capture feed is received on.
    pub listen:        String,
    pub clock_address: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            listen:        "0.0.0.0:22225".to_string(),
            clock_address: DEFAULT_CLOCK_ADDRESS.to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputBackend {
    /// OSC messages to an instrument endpoint.
    Osc,
    /// Discard everything.
    Null,
    /// MIDI port via midir (`hw-midi` feature).
    Midi,
}

impl fmt::Display for OutputBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OutputBackend::Osc  => "osc",
            OutputBackend::Null => "null",
            OutputBackend::Midi => "midi",
        })
    }
}

impl std::str::FromStr for OutputBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "osc"  => Ok(OutputBackend::Osc),
            "null" => Ok(OutputBackend::Null),
            "midi" => Ok(OutputBackend::Midi),
            other  => Err(format!("unknown backend '{other}' (expected osc, null or midi)")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputConfig {
    pub backend:   OutputBackend,
    /// Instrument endpoint for the OSC backend.
    pub send:      String,
    /// Address prefix of outbound OSC messages.
    pub prefix:    String,
    /// Port to connect to (or create) for the MIDI backend.
    pub port_name: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            backend:   OutputBackend::Osc,
            send:      "127.0.0.1:22226".to_string(),
            prefix:    "/midi".to_string(),
            port_name: "virtual instrument port".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerSection {
    pub channels:      u8,
    pub duration:      f64,
    pub poll_interval: f64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        let d = SchedulerConfig::default();
        SchedulerSection { channels: d.channels, duration: d.duration, poll_interval: d.poll_interval }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MotionSection {
    /// Dispatcher capacity: bodies tracked at once.
    pub bodies:         usize,
    pub smoothing:      usize,
    pub beat_threshold: f64,
    pub max_accel:      f64,
    pub permutation:    [usize; 3],
    pub origin:         [f64; 3],
    pub scale:          [f64; 3],
}

impl Default for MotionSection {
    fn default() -> Self {
        let e = EstimatorConfig::default();
        MotionSection {
            bodies:         DispatcherConfig::default().bodies,
            smoothing:      e.smoothing,
            beat_threshold: e.beat_threshold,
            max_accel:      e.max_accel,
            permutation:    e.permutation,
            origin:         e.origin,
            scale:          e.scale,
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// AppConfig
// ════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub transport: TransportConfig,
    pub output:    OutputConfig,
    pub scheduler: SchedulerSection,
    pub motion:    MotionSection,
    pub voicing:   VoicingConfig,
}

impl AppConfig {
    /// Read and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg = Self::from_toml_str(&text)?;
        tracing::debug!("loaded config from {}", path.display());
        Ok(cfg)
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let cfg: AppConfig = toml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scheduler_config().validate()?;
        let dispatcher = self.dispatcher_config();
        if dispatcher.bodies == 0 {
            return Err(motion_beat::ConfigError::NoSlots.into());
        }
        dispatcher.estimator.validate()?;
        self.voicing.validate().map_err(ConfigError::Voicing)?;
        if self.output.backend == OutputBackend::Midi && !cfg!(feature = "hw-midi") {
            return Err(ConfigError::BackendUnavailable(OutputBackend::Midi));
        }
        Ok(())
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            channels:      self.scheduler.channels,
            duration:      self.scheduler.duration,
            poll_interval: self.scheduler.poll_interval,
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        let m = &self.motion;
        DispatcherConfig {
            bodies:        m.bodies,
            clock_address: self.transport.clock_address.clone(),
            estimator: EstimatorConfig {
                smoothing:      m.smoothing,
                beat_threshold: m.beat_threshold,
                max_accel:      m.max_accel,
                permutation:    m.permutation,
                origin:         m.origin,
                scale:          m.scale,
            },
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// Tests
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_gives_defaults() {
        let cfg = AppConfig::from_toml_str("").unwrap();
        assert_eq!(cfg, AppConfig::default());
        assert_eq!(cfg.scheduler.channels, 16);
        assert_eq!(cfg.scheduler.duration, 1.0);
        assert_eq!(cfg.motion.smoothing, 4);
        assert_eq!(cfg.motion.beat_threshold, 1.0);
        assert_eq!(cfg.motion.max_accel, 100_000.0);
        assert_eq!(cfg.transport.clock_address, "/qtm/data");
    }

    #[test]
    fn partial_sections_override() {
        let cfg = AppConfig::from_toml_str(r#"
            [output]
            backend = "null"

            [motion]
            bodies = 6
            permutation = [0, 2, 1]
        "#).unwrap();
        assert_eq!(cfg.output.backend, OutputBackend::Null);
        assert_eq!(cfg.output.prefix, "/midi");
        let d = cfg.dispatcher_config();
        assert_eq!(d.bodies, 6);
        assert_eq!(d.estimator.permutation, [0, 2, 1]);
        assert_eq!(d.estimator.smoothing, 4);
    }

    #[test]
    fn unknown_key_is_rejected() {
        let err = AppConfig::from_toml_str("[scheduler]\nchanels = 4\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            AppConfig::from_toml_str("[scheduler]\nchannels = 0\n").unwrap_err(),
            ConfigError::Scheduler(_)
        ));
        assert!(matches!(
            AppConfig::from_toml_str("[motion]\nbodies = 0\n").unwrap_err(),
            ConfigError::Motion(motion_beat::ConfigError::NoSlots)
        ));
        assert!(matches!(
            AppConfig::from_toml_str("[motion]\npermutation = [1, 1, 2]\n").unwrap_err(),
            ConfigError::Motion(_)
        ));
        assert!(matches!(
            AppConfig::from_toml_str("[voicing]\nintervals = []\n").unwrap_err(),
            ConfigError::Voicing(_)
        ));
    }

    #[cfg(not(feature = "hw-midi"))]
    #[test]
    fn midi_backend_needs_feature() {
        assert!(matches!(
            AppConfig::from_toml_str("[output]\nbackend = \"midi\"\n").unwrap_err(),
            ConfigError::BackendUnavailable(OutputBackend::Midi)
        ));
    }

    #[test]
    fn round_trips_through_toml() {
        let mut cfg = AppConfig::default();
        cfg.voicing.base_pitch = 55.5;
        let text = cfg.to_toml().unwrap();
        assert_eq!(AppConfig::from_toml_str(&text).unwrap(), cfg);
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[scheduler]\nduration = 0.5").unwrap();
        let cfg = AppConfig::load(file.path()).unwrap();
        assert_eq!(cfg.scheduler.duration, 0.5);
    }

    #[test]
    fn load_missing_file() {
        let err = AppConfig::load(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn backend_parses_from_cli_text() {
        assert_eq!("OSC".parse::<OutputBackend>().unwrap(), OutputBackend::Osc);
        assert!("alsa".parse::<OutputBackend>().is_err());
    }
}
