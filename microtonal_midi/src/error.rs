use thiserror::Error;

/// Failure of an output backend.
///
/// `Init`, `NoPort` and `Connect` can only happen while opening a backend
/// and are startup errors; `Send` and `Io` happen while playing.  `Stopped`
/// refuses a chord after shutdown.
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("MIDI output initialisation failed: {0}")]
    Init(String),

    #[error("no MIDI output port matching '{0}'")]
    NoPort(String),

    #[error("could not connect to MIDI port '{port}': {reason}")]
    Connect { port: String, reason: String },

    #[error("failed to send {event}: {reason}")]
    Send { event: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("scheduler is shut down")]
    Stopped,
}

/// Rejected scheduler configuration.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("channel count must be between 1 and 16, got {0}")]
    Channels(u8),

    #[error("note duration must be a non-negative number of seconds, got {0}")]
    Duration(f64),

    #[error("poll interval must be a positive number of seconds, got {0}")]
    PollInterval(f64),
}
