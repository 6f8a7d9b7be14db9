//! Voice session lifecycle.
//!
//! [`VoiceController`] is an actor. Commands from the front-end, transport
//! events, capture blocks and segment-ended notifications all arrive on
//! channels consumed by a single `select!` loop, so controller state is
//! never shared and events are handled in arrival order.
//!
//! ```text
//! Inactive ──start──▶ Active(acquiring) ──devices ready──▶ Active(opening)
//!    ▲                    │ stop                               │ Opened
//!    │                    ▼                                    ▼
//!    └──────── stop / transport error / timeout ─────── Active(streaming)
//! ```
//!
//! Every start bumps a generation counter. A stop drops whatever the
//! pending start had acquired, and late results from an older generation
//! are discarded.

use futures_util::future::BoxFuture;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::events::{pcm_rate, ServerEvent, TransportEvent};
use super::transport::{LiveConnection, LiveSessionConfig, LiveTransport};
use crate::audio::codec::{decode_payload, encode_chunk, encode_wav};
use crate::audio::resample::resample_linear;
use crate::audio::{
    AudioBuffer, AudioChunk, AudioSink, BlockSink, CaptureStream, Microphone, PlaybackScheduler,
    SegmentId, Speaker,
};
use crate::config::Config;
use crate::error::{VoiceError, VoiceResult};
use crate::i18n::Language;

// ── Public types ───────────────────────────────────────────────────

/// Whether a voice session is running (or starting).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Inactive,
    Active,
}

/// Who a transcript line belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptRole {
    User,
    Model,
}

/// Front-end hooks. All methods run on the controller task and must not block.
pub trait VoiceObserver: Send + Sync {
    /// A localized, user-facing notice.
    fn on_alert(&self, _message: &str) {}

    fn on_state(&self, _state: SessionState) {}

    fn on_transcript(&self, _role: TranscriptRole, _text: &str) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl VoiceObserver for NoopObserver {}

/// User choices that shape the next session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoicePreferences {
    pub voice: String,
    pub language: Language,
}

/// Static controller parameters.
#[derive(Debug, Clone)]
pub struct VoiceControllerConfig {
    pub live_model: String,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub block_size: usize,
    /// Bounds device acquisition and, separately, the wait for `Opened`.
    pub open_timeout: Option<Duration>,
    pub transcribe: bool,
    /// Write each session's model audio here as WAV on stop.
    pub record_dir: Option<PathBuf>,
}

impl VoiceControllerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            live_model: config.gemini.live_model.clone(),
            input_sample_rate: config.voice.input_sample_rate,
            output_sample_rate: config.voice.output_sample_rate,
            block_size: config.voice.block_size,
            open_timeout: config.voice.open_timeout_secs.map(Duration::from_secs),
            transcribe: config.voice.transcribe,
            record_dir: None,
        }
    }
}

impl Default for VoiceControllerConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

// ── Handle ─────────────────────────────────────────────────────────

enum Command {
    Start(oneshot::Sender<VoiceResult<()>>),
    Stop(oneshot::Sender<()>),
    SetPreferences(VoicePreferences),
    Shutdown,
}

/// Cloneable front-end handle to a running [`VoiceController`].
#[derive(Clone)]
pub struct VoiceHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionState>,
}

impl VoiceHandle {
    /// Start a session. Resolves once the devices are acquired and the
    /// transport is opening; readiness is reported later.
    pub async fn start(&self) -> VoiceResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Start(tx))?;
        rx.await.map_err(|_| controller_gone())?
    }

    /// Tear down the current session. A no-op when nothing is running.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.send(Command::Stop(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Takes effect at the next start.
    pub fn set_preferences(&self, preferences: VoicePreferences) -> VoiceResult<()> {
        self.send(Command::SetPreferences(preferences))
    }

    /// Stop any session and end the controller task.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    fn send(&self, command: Command) -> VoiceResult<()> {
        self.commands.send(command).map_err(|_| controller_gone())
    }
}

fn controller_gone() -> VoiceError {
    VoiceError::Transport("voice controller is not running".into())
}

// ── Session resources ──────────────────────────────────────────────

struct Acquired {
    capture: CaptureStream,
    sink: Box<dyn AudioSink>,
    chunks: mpsc::UnboundedReceiver<AudioChunk>,
    ended: mpsc::UnboundedReceiver<SegmentId>,
}

struct PendingStart {
    generation: u64,
    reply: oneshot::Sender<VoiceResult<()>>,
    acquire: BoxFuture<'static, VoiceResult<Acquired>>,
}

struct LiveSession {
    generation: u64,
    session_id: String,
    connection: LiveConnection,
    capture: CaptureStream,
    scheduler: PlaybackScheduler,
    events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    chunks: Option<mpsc::UnboundedReceiver<AudioChunk>>,
    ended: Option<mpsc::UnboundedReceiver<SegmentId>>,
    open_deadline: Option<Instant>,
    opened: bool,
    recording: Option<Vec<f32>>,
    started_at: std::time::Instant,
}

impl LiveSession {
    fn mark_opened(&mut self) {
        if self.opened {
            return;
        }
        self.opened = true;
        self.open_deadline = None;
        self.capture.set_forwarding(true);
        tracing::info!(
            session_id = %self.session_id,
            elapsed_ms = self.started_at.elapsed().as_millis() as u64,
            device = %self.capture.device_name(),
            "Voice session open, streaming microphone"
        );
    }

    fn handle_server_event(
        &mut self,
        event: ServerEvent,
        output_rate: u32,
        observer: &dyn VoiceObserver,
    ) {
        match event {
            ServerEvent::Audio { data, mime_type } => {
                let rate = mime_type.as_deref().and_then(pcm_rate).unwrap_or(output_rate);
                let buffer = match decode_payload(&data, rate, 1) {
                    Ok(buffer) => buffer,
                    Err(e) => {
                        tracing::warn!(session_id = %self.session_id, error = %e, "Skipping undecodable audio segment");
                        return;
                    }
                };
                if buffer.is_empty() {
                    return;
                }
                if let Some(recording) = self.recording.as_mut() {
                    let mono: Vec<f32> = (0..buffer.frame_count())
                        .map(|frame| buffer.mixed_sample(frame))
                        .collect();
                    recording.extend(resample_linear(&mono, buffer.sample_rate, output_rate));
                }
                self.scheduler.schedule(buffer);
            }
            ServerEvent::Interrupted => {
                let stopped = self.scheduler.interrupt();
                tracing::info!(session_id = %self.session_id, stopped, "Playback interrupted");
            }
            ServerEvent::TurnComplete => {
                tracing::debug!(
                    session_id = %self.session_id,
                    queued_until = self.scheduler.next_start_time(),
                    "Model turn complete"
                );
            }
            ServerEvent::InputTranscript { text } => observer.on_transcript(TranscriptRole::User, &text),
            ServerEvent::OutputTranscript { text } => observer.on_transcript(TranscriptRole::Model, &text),
            ServerEvent::SetupComplete => {}
            ServerEvent::Error { message } => {
                // Routed to teardown by the caller; kept for exhaustiveness.
                tracing::error!(session_id = %self.session_id, %message, "Server error");
            }
        }
    }

    /// Close the transport, then release both devices and all segments.
    fn shutdown(self, record_dir: Option<&Path>, output_rate: u32) {
        let LiveSession {
            session_id,
            connection,
            capture,
            mut scheduler,
            recording,
            started_at,
            ..
        } = self;

        connection.close();
        capture.stop();
        scheduler.close();

        if let (Some(dir), Some(samples)) = (record_dir, recording) {
            match save_recording(dir, &session_id, samples, output_rate) {
                Ok(path) => tracing::info!(session_id = %session_id, path = %path.display(), "Saved session audio"),
                Err(e) => tracing::warn!(session_id = %session_id, error = %e, "Failed to save session audio"),
            }
        }

        tracing::info!(
            session_id = %session_id,
            duration_secs = started_at.elapsed().as_secs(),
            "Voice session stopped"
        );
    }
}

fn save_recording(dir: &Path, session_id: &str, samples: Vec<f32>, rate: u32) -> VoiceResult<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("jarvis-{session_id}.wav"));
    std::fs::write(&path, encode_wav(&AudioBuffer::mono(samples, rate))?)?;
    Ok(path)
}

async fn acquire_devices(
    microphone: Arc<dyn Microphone>,
    speaker: Arc<dyn Speaker>,
    block_size: usize,
    output_rate: u32,
    generation: u64,
) -> VoiceResult<Acquired> {
    let (chunk_tx, chunks) = mpsc::unbounded_channel();
    let capture = microphone
        .acquire(BlockSink::new(block_size, generation, chunk_tx))
        .await?;

    let (ended_tx, ended) = mpsc::unbounded_channel();
    let sink = match speaker.open(output_rate, ended_tx).await {
        Ok(sink) => sink,
        Err(e) => {
            capture.stop();
            return Err(e);
        }
    };

    Ok(Acquired {
        capture,
        sink,
        chunks,
        ended,
    })
}

// ── Controller ─────────────────────────────────────────────────────

enum Step {
    Command(Option<Command>),
    Acquired(VoiceResult<Acquired>),
    Transport(Option<TransportEvent>),
    Chunk(Option<AudioChunk>),
    SegmentEnded(Option<SegmentId>),
    OpenTimeout,
}

/// Owns the microphone, the speaker, the scheduler and the single
/// transport handle.
pub struct VoiceController {
    config: VoiceControllerConfig,
    preferences: VoicePreferences,
    microphone: Arc<dyn Microphone>,
    speaker: Arc<dyn Speaker>,
    transport: Arc<dyn LiveTransport>,
    observer: Arc<dyn VoiceObserver>,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<SessionState>,
    generation: u64,
    pending: Option<PendingStart>,
    session: Option<LiveSession>,
}

impl VoiceController {
    pub fn new(
        config: VoiceControllerConfig,
        preferences: VoicePreferences,
        microphone: Arc<dyn Microphone>,
        speaker: Arc<dyn Speaker>,
        transport: Arc<dyn LiveTransport>,
        observer: Arc<dyn VoiceObserver>,
    ) -> (Self, VoiceHandle) {
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (state, state_rx) = watch::channel(SessionState::Inactive);
        let controller = Self {
            config,
            preferences,
            microphone,
            speaker,
            transport,
            observer,
            commands,
            state,
            generation: 0,
            pending: None,
            session: None,
        };
        let handle = VoiceHandle {
            commands: command_tx,
            state: state_rx,
        };
        (controller, handle)
    }

    /// Run the controller on the current runtime.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        tracing::debug!("Voice controller running");
        loop {
            let step = tokio::select! {
                command = self.commands.recv() => Step::Command(command),
                result = poll_pending(&mut self.pending) => Step::Acquired(result),
                step = next_session_step(&mut self.session) => step,
            };

            match step {
                Step::Command(None) | Step::Command(Some(Command::Shutdown)) => {
                    self.stop();
                    break;
                }
                Step::Command(Some(command)) => self.handle_command(command),
                Step::Acquired(result) => self.finish_start(result),
                Step::Transport(event) => self.handle_transport(event),
                Step::Chunk(chunk) => self.forward_chunk(chunk),
                Step::SegmentEnded(id) => {
                    if let Some(session) = self.session.as_mut() {
                        match id {
                            Some(id) => session.scheduler.on_segment_ended(id),
                            None => session.ended = None,
                        }
                    }
                }
                Step::OpenTimeout => self.fail_session("timed out waiting for the session to open"),
            }
        }
        tracing::debug!("Voice controller stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start(reply) => self.begin_start(reply),
            Command::Stop(reply) => {
                self.stop();
                let _ = reply.send(());
            }
            Command::SetPreferences(preferences) => {
                tracing::info!(
                    voice = %preferences.voice,
                    language = %preferences.language,
                    "Voice preferences updated"
                );
                self.preferences = preferences;
            }
            Command::Shutdown => self.stop(),
        }
    }

    fn begin_start(&mut self, reply: oneshot::Sender<VoiceResult<()>>) {
        if self.pending.is_some() || self.session.is_some() {
            tracing::debug!("Start ignored, voice session already active");
            let _ = reply.send(Err(VoiceError::AlreadyActive));
            return;
        }

        self.generation += 1;
        self.set_state(SessionState::Active);

        let acquire = acquire_devices(
            Arc::clone(&self.microphone),
            Arc::clone(&self.speaker),
            self.config.block_size,
            self.config.output_sample_rate,
            self.generation,
        );
        let acquire: BoxFuture<'static, VoiceResult<Acquired>> = match self.config.open_timeout {
            Some(limit) => Box::pin(async move {
                tokio::time::timeout(limit, acquire)
                    .await
                    .map_err(|_| VoiceError::Timeout("audio devices"))?
            }),
            None => Box::pin(acquire),
        };

        tracing::info!(generation = self.generation, "Starting voice session");
        self.pending = Some(PendingStart {
            generation: self.generation,
            reply,
            acquire,
        });
    }

    fn finish_start(&mut self, result: VoiceResult<Acquired>) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        if pending.generation != self.generation {
            let _ = pending.reply.send(Err(VoiceError::Cancelled));
            return;
        }

        match result.and_then(|acquired| self.open_session(pending.generation, acquired)) {
            Ok(session) => {
                self.session = Some(session);
                let _ = pending.reply.send(Ok(()));
            }
            Err(e) => {
                match &e {
                    VoiceError::PermissionDenied(reason) => {
                        tracing::warn!(%reason, "Microphone unavailable, voice session not started");
                    }
                    other => tracing::error!(error = %other, "Voice session failed to start"),
                }
                self.set_state(SessionState::Inactive);
                let strings = self.preferences.language.translations();
                let alert = match e {
                    VoiceError::PermissionDenied(_) => strings.microphone_permission_error,
                    _ => strings.voice_session_error,
                };
                self.observer.on_alert(alert);
                let _ = pending.reply.send(Err(e));
            }
        }
    }

    fn open_session(&self, generation: u64, acquired: Acquired) -> VoiceResult<LiveSession> {
        let Acquired {
            capture,
            sink,
            chunks,
            ended,
        } = acquired;
        let mut scheduler = PlaybackScheduler::new(sink);

        let language = self.preferences.language;
        let live_config = LiveSessionConfig {
            session_id: uuid::Uuid::new_v4().to_string(),
            model: self.config.live_model.clone(),
            voice: self.preferences.voice.clone(),
            system_instruction: language.translations().system_instruction(language),
            transcribe: self.config.transcribe,
        };
        let session_id = live_config.session_id.clone();

        let (connection, events) = match self.transport.open(live_config) {
            Ok(opened) => opened,
            Err(e) => {
                capture.stop();
                scheduler.close();
                return Err(e);
            }
        };

        Ok(LiveSession {
            generation,
            session_id,
            connection,
            capture,
            scheduler,
            events: Some(events),
            chunks: Some(chunks),
            ended: Some(ended),
            open_deadline: self.config.open_timeout.map(|limit| Instant::now() + limit),
            opened: false,
            recording: self.config.record_dir.as_ref().map(|_| Vec::new()),
            started_at: std::time::Instant::now(),
        })
    }

    fn handle_transport(&mut self, event: Option<TransportEvent>) {
        match event {
            Some(TransportEvent::Opened) => {
                if let Some(session) = self.session.as_mut() {
                    session.mark_opened();
                }
            }
            Some(TransportEvent::Error(message))
            | Some(TransportEvent::Message(ServerEvent::Error { message })) => {
                self.fail_session(&message);
            }
            Some(TransportEvent::Message(event)) => {
                if let Some(session) = self.session.as_mut() {
                    session.handle_server_event(
                        event,
                        self.config.output_sample_rate,
                        self.observer.as_ref(),
                    );
                }
            }
            Some(TransportEvent::Closed) | None => {
                if let Some(session) = self.session.as_mut() {
                    tracing::info!(session_id = %session.session_id, "Voice session closed by server");
                    session.events = None;
                    session.open_deadline = None;
                    session.capture.set_forwarding(false);
                }
            }
        }
    }

    fn forward_chunk(&mut self, chunk: Option<AudioChunk>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match chunk {
            Some(chunk) if session.opened && chunk.generation == session.generation => {
                if let Err(e) = session.connection.send(encode_chunk(&chunk.samples)) {
                    tracing::debug!(session_id = %session.session_id, error = %e, "Dropping capture block");
                }
            }
            Some(_) => {}
            None => {
                tracing::warn!(session_id = %session.session_id, "Capture stream ended");
                session.chunks = None;
            }
        }
    }

    fn fail_session(&mut self, reason: &str) {
        if self.session.is_none() && self.pending.is_none() {
            return;
        }
        tracing::error!(%reason, "Voice session error, tearing down");
        self.stop();
        self.observer
            .on_alert(self.preferences.language.translations().voice_session_error);
    }

    /// Unconditional teardown. Safe to call in any state.
    fn stop(&mut self) {
        self.generation += 1;
        if let Some(pending) = self.pending.take() {
            tracing::info!(generation = pending.generation, "Voice session start cancelled");
            let _ = pending.reply.send(Err(VoiceError::Cancelled));
        }
        if let Some(session) = self.session.take() {
            session.shutdown(
                self.config.record_dir.as_deref(),
                self.config.output_sample_rate,
            );
        }
        self.set_state(SessionState::Inactive);
    }

    fn set_state(&self, state: SessionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            self.observer.on_state(state);
        }
    }
}

async fn poll_pending(pending: &mut Option<PendingStart>) -> VoiceResult<Acquired> {
    match pending.as_mut() {
        Some(pending) => (&mut pending.acquire).await,
        None => std::future::pending().await,
    }
}

async fn next_session_step(session: &mut Option<LiveSession>) -> Step {
    let Some(session) = session.as_mut() else {
        return std::future::pending().await;
    };
    let deadline = session.open_deadline;
    tokio::select! {
        event = recv_or_pending(&mut session.events) => Step::Transport(event),
        chunk = recv_or_pending(&mut session.chunks) => Step::Chunk(chunk),
        id = recv_or_pending(&mut session.ended) => Step::SegmentEnded(id),
        _ = sleep_until(deadline) => Step::OpenTimeout,
    }
}

async fn recv_or_pending<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// ── Tests ──────────────────────────────────────────────────────────
