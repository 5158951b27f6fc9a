//! Application wiring.
//!
//! `App` owns the [`BodyDispatcher`] and shares a [`NoteScheduler`] with the
//! beat callback.  Every beat is voiced into a chord and started right away
//! from the receive loop; the scheduler's expiry thread releases it.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rosc::OscMessage;
use thiserror::Error;
use tracing::{error, info};

use microtonal_midi::{Clock, MidiOut, MonotonicClock, NoteScheduler, NullOut, OutputError};
use motion_beat::{BeatEvent, BodyDispatcher, PacketError};

use crate::config::{AppConfig, ConfigError, OutputBackend};
use crate::transport::{OscOut, OscReceiver};
use crate::voicing::ChordVoicing;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("cannot open output: {0}")]
    Output(#[from] OutputError),

    #[error("cannot listen on {addr}: {source}")]
    Bind {
        addr:   String,
        source: std::io::Error,
    },

    #[error("receive failed: {0}")]
    Recv(#[source] std::io::Error),
}

/// Open the output backend named by the configuration.
pub fn build_output(cfg: &AppConfig) -> Result<Box<dyn MidiOut>, AppError> {
    let out = &cfg.output;
    match out.backend {
        OutputBackend::Osc  => Ok(Box::new(OscOut::connect(&out.send, &out.prefix)?)),
        OutputBackend::Null => {
            info!("output disabled (null backend)");
            Ok(Box::new(NullOut))
        }
        #[cfg(feature = "hw-midi")]
        OutputBackend::Midi => {
            Ok(Box::new(microtonal_midi::MidirOut::open("mocap_chords", &out.port_name)?))
        }
        #[cfg(not(feature = "hw-midi"))]
        OutputBackend::Midi => Err(ConfigError::BackendUnavailable(OutputBackend::Midi).into()),
    }
}

// ════════════════════════════════════════════════════════════════════════════
// App
// ════════════════════════════════════════════════════════════════════════════

pub struct App {
    listen:     String,
    dispatcher: BodyDispatcher,
    scheduler:  Arc<NoteScheduler>,
    beats:      Arc<AtomicU64>,
}

impl App {
    pub fn new(cfg: &AppConfig, output: Box<dyn MidiOut>) -> Result<Self, AppError> {
        Self::with_clock(cfg, output, Arc::new(MonotonicClock::default()))
    }

    /// Build the pipeline with an explicit scheduler clock.
    pub fn with_clock(
        cfg:    &AppConfig,
        output: Box<dyn MidiOut>,
        clock:  Arc<dyn Clock>,
    ) -> Result<Self, AppError> {
        cfg.validate()?;
        let scheduler = Arc::new(
            NoteScheduler::with_clock(output, cfg.scheduler_config(), clock)
                .map_err(ConfigError::from)?,
        );
        let mut dispatcher = BodyDispatcher::new(&cfg.dispatcher_config())
            .map_err(ConfigError::from)?;

        let voicing = ChordVoicing::new(cfg.voicing.clone());
        let beats = Arc::new(AtomicU64::new(0));
        {
            let scheduler = Arc::clone(&scheduler);
            let beats = Arc::clone(&beats);
            dispatcher.set_beat_callback(Arc::new(move |beat: &BeatEvent| {
                beats.fetch_add(1, Ordering::Relaxed);
                play_beat(&scheduler, &voicing, beat);
            }));
        }

        Ok(App { listen: cfg.transport.listen.clone(), dispatcher, scheduler, beats })
    }

    /// Feed one inbound message through the dispatcher.
    pub fn handle_message(&mut self, msg: &OscMessage) -> Result<(), PacketError> {
        self.dispatcher.deliver(&msg.addr, &msg.args)
    }

    /// Receive on the configured address until Ctrl-C.
    pub async fn run(self) -> Result<(), AppError> {
        let listen = self.listen.clone();
        self.run_on(&listen).await
    }

    /// Receive on `listen` until Ctrl-C, then silence the instrument.
    pub async fn run_on(self, listen: &str) -> Result<(), AppError> {
        let rx = OscReceiver::bind(listen).await.map_err(|source| AppError::Bind {
            addr: listen.to_string(),
            source,
        })?;
        info!("listening for capture data on {}", rx.local_addr().map_err(AppError::Recv)?);
        self.run_until(rx, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("cannot listen for Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Drain `rx` until `stop` completes, then silence the instrument.
    pub async fn run_until<F>(mut self, mut rx: OscReceiver, stop: F) -> Result<(), AppError>
    where
        F: Future<Output = ()>,
    {
        self.scheduler.start_expiry();
        tokio::pin!(stop);

        let outcome = loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Ok(messages) => {
                        for msg in &messages {
                            // malformed packets are already logged by the dispatcher
                            let _ = self.handle_message(msg);
                        }
                    }
                    Err(e) => break Err(AppError::Recv(e)),
                },
                _ = &mut stop => {
                    info!("interrupted");
                    break Ok(());
                }
            }
        };

        info!(
            beats   = self.beats(),
            dropped = self.dispatcher.dropped_bodies(),
            "shutting down"
        );
        if let Err(e) = self.scheduler.shutdown() {
            error!("all-notes-off failed: {e}");
        }
        outcome
    }

    // ── accessors ─────────────────────────────────────────────────────────

    pub fn dispatcher(&self) -> &BodyDispatcher { &self.dispatcher }

    pub fn scheduler(&self) -> &Arc<NoteScheduler> { &self.scheduler }

    /// Beats detected so far.
    pub fn beats(&self) -> u64 { self.beats.load(Ordering::Relaxed) }
}

fn play_beat(scheduler: &NoteScheduler, voicing: &ChordVoicing, beat: &BeatEvent) {
    let chord = voicing.chord_for(beat);
    info!(
        slot = beat.slot,
        body = beat.body_id,
        t    = beat.timestamp,
        accel = beat.accel.norm(),
        "beat"
    );
    if let Err(e) = scheduler.schedule_chord(&chord) {
        error!("failed to start chord: {e}");
    }
}
