//! Chord scheduling with timed release.
//!
//! Two flows of control share the pending-chord registry:
//!
//! * the caller of [`NoteScheduler::schedule_chord`] (the packet thread),
//!   which allocates channels, starts notes and appends a chord;
//! * the expiry thread, which wakes every poll interval and stops the
//!   chords whose time is up.
//!
//! Both go through one `Mutex<Registry>`.  The lock is held for the whole
//! emission of one chord and for one whole sweep, so a sweep never sees a
//! half-started chord and the channel counter never interleaves.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, trace, warn};

use crate::error::{ConfigError, OutputError};
use crate::output::MidiOut;
use crate::{ChordNote, MidiEvent, Note, MIDI_CHANNELS};

// ════════════════════════════════════════════════════════════════════════════
// Clock
// ════════════════════════════════════════════════════════════════════════════

/// Source of "now" in seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
}

/// Seconds since construction.
#[derive(Clone, Copy, Debug)]
pub struct MonotonicClock {
    start: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self { MonotonicClock { start: Instant::now() } }
}

impl Clock for MonotonicClock {
    fn now(&self) -> f64 { self.start.elapsed().as_secs_f64() }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    bits: AtomicU64,
}

impl ManualClock {
    pub fn new(t: f64) -> Self {
        ManualClock { bits: AtomicU64::new(t.to_bits()) }
    }

    pub fn set(&self, t: f64) {
        self.bits.store(t.to_bits(), Ordering::SeqCst);
    }

    pub fn advance(&self, dt: f64) {
        self.set(self.now() + dt);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 { f64::from_bits(self.bits.load(Ordering::SeqCst)) }
}

// ════════════════════════════════════════════════════════════════════════════
// SchedulerConfig
// ════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Debug, PartialEq)]
pub struct SchedulerConfig {
    /// Size of the channel pool (*N*).
    pub channels:      u8,
    /// Lifetime of every chord, seconds.
    pub duration:      f64,
    /// Expiry sweep period, seconds.
    pub poll_interval: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig { channels: MIDI_CHANNELS, duration: 1.0, poll_interval: 0.1 }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channels == 0 || self.channels > MIDI_CHANNELS {
            return Err(ConfigError::Channels(self.channels));
        }
        if !(self.duration.is_finite() && self.duration >= 0.0) {
            return Err(ConfigError::Duration(self.duration));
        }
        if !(self.poll_interval.is_finite() && self.poll_interval > 0.0) {
            return Err(ConfigError::PollInterval(self.poll_interval));
        }
        Ok(())
    }
}

// ════════════════════════════════════════════════════════════════════════════
// Registry: everything behind the lock
// ════════════════════════════════════════════════════════════════════════════

struct Chord {
    notes:      Vec<Note>,
    expires_at: f64,
}

struct Registry {
    output:       Box<dyn MidiOut>,
    pending:      Vec<Chord>,
    channels:     u8,
    last_channel: u8,
}

impl Registry {
    fn new(output: Box<dyn MidiOut>, channels: u8) -> Self {
        // so that the first allocation yields channel 0
        Registry { output, pending: Vec::new(), channels, last_channel: channels - 1 }
    }

    fn next_channel(&mut self) -> u8 {
        self.last_channel = (self.last_channel + 1) % self.channels;
        self.last_channel
    }

    fn start_chord(&mut self, requested: &[ChordNote], expires_at: f64) -> Result<Vec<Note>, OutputError> {
        let mut started = Vec::with_capacity(requested.len());
        let mut result = Ok(());
        for req in requested {
            let note = Note::on_channel(self.next_channel(), req);
            let sent = self.output
                .send(&MidiEvent::PitchBend { channel: note.channel, value: note.bend })
                .and_then(|_| self.output.send(&MidiEvent::NoteOn {
                    channel:  note.channel,
                    key:      note.key,
                    velocity: note.velocity,
                }));
            // registered even on failure: the note-on may have gone out
            started.push(note);
            if let Err(e) = sent {
                result = Err(e);
                break;
            }
        }

        if !started.is_empty() {
            self.pending.push(Chord { notes: started.clone(), expires_at });
        }
        result.map(|_| started)
    }

    /// Stop and drop every chord that expired before `now`.
    fn sweep(&mut self, now: f64) -> Result<usize, OutputError> {
        let (expired, active): (Vec<Chord>, Vec<Chord>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|c| c.expires_at < now);
        self.pending = active;

        let mut first_error = None;
        for chord in &expired {
            for note in &chord.notes {
                if let Err(e) = self.output.send(&MidiEvent::AllNotesOff { channel: note.channel }) {
                    warn!(channel = note.channel, "note-off failed: {e}");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None    => Ok(expired.len()),
        }
    }

    fn all_notes_off(&mut self) -> Result<(), OutputError> {
        let mut first_error = None;
        for channel in 0..self.channels {
            if let Err(e) = self.output.send(&MidiEvent::AllNotesOff { channel }) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

// ════════════════════════════════════════════════════════════════════════════
// Expiry thread
// ════════════════════════════════════════════════════════════════════════════

struct ExpiryTask {
    stop_tx: Sender<()>,
    handle:  JoinHandle<()>,
}

fn spawn_expiry(registry: Arc<Mutex<Registry>>, clock: Arc<dyn Clock>, poll: Duration) -> ExpiryTask {
    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let handle = thread::spawn(move || loop {
        match stop_rx.recv_timeout(poll) {
            Err(RecvTimeoutError::Timeout) => {
                let now = clock.now();
                match lock(&registry).sweep(now) {
                    Ok(0) => {}
                    Ok(n) => trace!(expired = n, now, "released chords"),
                    Err(e) => error!("expiry sweep: {e}"),
                }
            }
            // stop requested, or the scheduler is gone
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
        }
    });
    ExpiryTask { stop_tx, handle }
}

// ════════════════════════════════════════════════════════════════════════════
// NoteScheduler
// ════════════════════════════════════════════════════════════════════════════

/// Plays chords on a round-robin channel pool and releases them on time.
pub struct NoteScheduler {
    registry: Arc<Mutex<Registry>>,
    clock:    Arc<dyn Clock>,
    config:   SchedulerConfig,
    expiry:   Mutex<Option<ExpiryTask>>,
    stopped:  AtomicBool,
}

impl fmt::Debug for NoteScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NoteScheduler")
            .field("config", &self.config)
            .field("pending", &self.pending_chords())
            .field("expiry_running", &self.expiry_running())
            .finish()
    }
}

impl NoteScheduler {
    /// Scheduler on a monotonic clock.  Call [`start_expiry`](Self::start_expiry)
    /// (or use [`spawn`](Self::spawn)) to release notes automatically.
    pub fn new(output: Box<dyn MidiOut>, config: SchedulerConfig) -> Result<Self, ConfigError> {
        Self::with_clock(output, config, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(
        output: Box<dyn MidiOut>,
        config: SchedulerConfig,
        clock:  Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(NoteScheduler {
            registry: Arc::new(Mutex::new(Registry::new(output, config.channels))),
            clock,
            config,
            expiry:  Mutex::new(None),
            stopped: AtomicBool::new(false),
        })
    }

    /// [`new`](Self::new) followed by [`start_expiry`](Self::start_expiry).
    pub fn spawn(output: Box<dyn MidiOut>, config: SchedulerConfig) -> Result<Self, ConfigError> {
        let scheduler = Self::new(output, config)?;
        scheduler.start_expiry();
        Ok(scheduler)
    }

    // ── expiry task ───────────────────────────────────────────────────────

    /// Start the background sweep.  No-op if it is already running or the
    /// scheduler has been shut down.
    pub fn start_expiry(&self) {
        let mut expiry = self.expiry.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_stopped() {
            warn!("expiry task not started: scheduler is shut down");
            return;
        }
        if expiry.is_none() {
            let poll = Duration::from_secs_f64(self.config.poll_interval);
            *expiry = Some(spawn_expiry(Arc::clone(&self.registry), Arc::clone(&self.clock), poll));
            debug!(poll_ms = poll.as_millis() as u64, "expiry task started");
        }
    }

    /// Stop the background sweep.  Pending chords stay registered.
    pub fn stop_expiry(&self) {
        let task = self.expiry.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            let _ = task.stop_tx.send(());
            if task.handle.join().is_err() {
                warn!("expiry task panicked");
            }
            debug!("expiry task stopped");
        }
    }

    pub fn expiry_running(&self) -> bool {
        self.expiry.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    // ── playing ───────────────────────────────────────────────────────────

    /// Start `notes` now; they are released after the configured duration.
    pub fn schedule_chord(&self, notes: &[ChordNote]) -> Result<Vec<Note>, OutputError> {
        self.schedule_chord_at(notes, self.clock.now())
    }

    /// Start `notes` as if the time were `now`.
    ///
    /// For each note: next channel, pitch bend, note-on.  The started notes
    /// are registered for release even when the output fails part way.
    /// Fails with [`OutputError::Stopped`] once the scheduler is shut down.
    pub fn schedule_chord_at(&self, notes: &[ChordNote], now: f64) -> Result<Vec<Note>, OutputError> {
        let started = {
            let mut registry = lock(&self.registry);
            // checked under the lock: shutdown flags first, then clears
            if self.is_stopped() {
                return Err(OutputError::Stopped);
            }
            registry.start_chord(notes, now + self.config.duration)?
        };
        debug!(
            channels = ?started.iter().map(|n| n.channel).collect::<Vec<_>>(),
            expires_at = now + self.config.duration,
            "chord started"
        );
        Ok(started)
    }

    /// Release every chord that expired before `now`; returns how many.
    pub fn sweep(&self, now: f64) -> Result<usize, OutputError> {
        lock(&self.registry).sweep(now)
    }

    /// Stop every channel of the pool, whatever the registry says.
    pub fn all_notes_off(&self) -> Result<(), OutputError> {
        lock(&self.registry).all_notes_off()
    }

    /// Stop the expiry task, forget pending chords and silence every channel.
    ///
    /// Safe to call more than once; only the first call emits anything.
    pub fn shutdown(&self) -> Result<(), OutputError> {
        let already_stopped = self.stopped.swap(true, Ordering::SeqCst);
        self.stop_expiry();
        if already_stopped {
            return Ok(());
        }
        let mut registry = lock(&self.registry);
        registry.pending.clear();
        registry.all_notes_off()
    }

    // ── accessors ─────────────────────────────────────────────────────────

    pub fn is_stopped(&self) -> bool { self.stopped.load(Ordering::SeqCst) }

    pub fn pending_chords(&self) -> usize { lock(&self.registry).pending.len() }

    pub fn config(&self) -> &SchedulerConfig { &self.config }

    pub fn now(&self) -> f64 { self.clock.now() }
}

impl Drop for NoteScheduler {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("all-notes-off on shutdown failed: {e}");
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// Tests
// ════════════════════════════════════════════════════════════════════════════
