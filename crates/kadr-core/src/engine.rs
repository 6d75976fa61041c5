//! Playback engine
//!
//! The single writer of playback state. Every external signal (user
//! intent, load result, decoder fault, time-update tick) arrives as a
//! [`Message`]; the engine applies it synchronously, queues
//! [`Notification`]s for listeners and returns the [`Command`]s the driver
//! must run. No I/O happens here, so the whole transition table can be
//! exercised without a network or a real decoder.

use crate::abr::{AbrContext, AbrController, LevelSwitch, SwitchReason};
use crate::audio::{AudioChain, AudioRouting};
use crate::buffer::{BufferManager, SegmentPayload};
use crate::error::{Error, FetchError, ManifestError, SinkError};
use crate::loader::SegmentRequest;
use crate::manifest::{Level, Manifest, MediaPlaylist};
use crate::platform::{Capabilities, Platform};
use crate::recovery::{FatalKind, FaultClass, RecoveryAction, Supervisor};
use crate::resume::SaveThrottle;
use crate::scrub::ScrubCue;
use crate::types::{
    AttachId, BufferedRange, PlaybackState, PlayerConfig, QualitySelection, SkipMark, MAX_RATE,
    MIN_RATE, RANGE_GAP_TOLERANCE,
};
use bytes::Bytes;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use url::Url;

/// What to attach and how
#[derive(Debug, Clone)]
pub struct AttachRequest {
    pub url: Url,
    /// Key for resume persistence; nothing is saved without one
    pub content_id: Option<String>,
    /// Scrub preview index
    pub thumbnails: Option<Url>,
    pub skip_marks: Vec<SkipMark>,
    /// Duration to assume while the playlist does not declare one
    pub duration_hint: Option<f64>,
    /// Overrides `PlayerConfig::autoplay`
    pub autoplay: Option<bool>,
}

impl AttachRequest {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            content_id: None,
            thumbnails: None,
            skip_marks: Vec::new(),
            duration_hint: None,
            autoplay: None,
        }
    }

    pub fn with_content_id(mut self, content_id: impl Into<String>) -> Self {
        self.content_id = Some(content_id.into());
        self
    }

    pub fn with_thumbnails(mut self, url: Url) -> Self {
        self.thumbnails = Some(url);
        self
    }

    pub fn with_skip_marks(mut self, marks: Vec<SkipMark>) -> Self {
        self.skip_marks = marks;
        self
    }

    pub fn with_duration_hint(mut self, duration: f64) -> Self {
        self.duration_hint = Some(duration);
        self
    }

    pub fn with_autoplay(mut self, autoplay: bool) -> Self {
        self.autoplay = Some(autoplay);
        self
    }
}

/// Everything loaded asynchronously before the engine switches content
#[derive(Debug)]
pub struct PreparedAttach {
    pub attach: AttachId,
    pub request: AttachRequest,
    pub manifest: Manifest,
    pub scrub_cues: Arc<[ScrubCue]>,
    /// Stored resume position, not yet checked against the duration
    pub resume_position: Option<f64>,
}

/// User intents
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    Play,
    Pause,
    Seek(f64),
    SetRate(f64),
    SetVolume(f64),
    SetMuted(bool),
    SetQuality(QualitySelection),
    SetAudioConditioning(bool),
    SetSubtitles(bool),
    /// Jump to the end of the skip mark under the play head
    SkipSegment,
    TogglePictureInPicture,
}

/// Identity of one issued load. Results whose attach or generation no
/// longer match are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoadTicket {
    pub attach: AttachId,
    pub generation: u64,
    pub level: usize,
    /// Timeline index for segment loads, `None` for variant playlists
    pub index: Option<usize>,
}

/// Input to the engine
#[derive(Debug)]
pub enum Message {
    /// An attach has started loading; earlier pending attaches lose
    AttachRequested(AttachId),
    Attach(Box<PreparedAttach>),
    AttachRejected {
        attach: AttachId,
        error: ManifestError,
    },
    Detach,
    Intent(Intent),
    VariantLoaded {
        ticket: LoadTicket,
        result: crate::Result<MediaPlaylist>,
    },
    SegmentLoaded {
        ticket: LoadTicket,
        result: Result<Bytes, FetchError>,
        elapsed: Duration,
    },
    /// Asynchronous fault reported by the surface
    DecodeError {
        attach: AttachId,
        error: SinkError,
    },
    Tick {
        at: Instant,
    },
}

/// Which loads to abort
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelScope {
    /// Everything belonging to an attach
    Attach(AttachId),
    /// Loads issued before `generation`
    Superseded { attach: AttachId, generation: u64 },
}

/// Work for the driver
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    LoadVariant {
        ticket: LoadTicket,
        url: Url,
        delay: Duration,
    },
    FetchSegment {
        ticket: LoadTicket,
        request: SegmentRequest,
        delay: Duration,
    },
    SaveResume {
        content_id: String,
        position: f64,
    },
    Cancel(CancelScope),
}

/// Error categories reported to listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Manifest,
    Network,
    MediaDecode,
    Unsupported,
    Unrecoverable,
    Audio,
    Quality,
}

impl From<FaultClass> for ErrorKind {
    fn from(class: FaultClass) -> Self {
        match class {
            FaultClass::NetworkTransient => ErrorKind::Network,
            FaultClass::MediaDecodeTransient => ErrorKind::MediaDecode,
            FaultClass::Fatal => ErrorKind::Unrecoverable,
        }
    }
}

impl From<FatalKind> for ErrorKind {
    fn from(kind: FatalKind) -> Self {
        match kind {
            FatalKind::Unsupported => ErrorKind::Unsupported,
            FatalKind::Unrecoverable => ErrorKind::Unrecoverable,
        }
    }
}

/// Output of the engine, fanned out to listeners
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    Attached {
        attach: AttachId,
        levels: Vec<Level>,
        scrub_cues: Arc<[ScrubCue]>,
        capabilities: Capabilities,
        skip_marks: Vec<SkipMark>,
    },
    DurationChanged {
        duration: f64,
    },
    StateChanged {
        from: PlaybackState,
        to: PlaybackState,
    },
    PositionChanged {
        position: f64,
    },
    BufferedChanged {
        ranges: Vec<BufferedRange>,
    },
    QualityChanged {
        selection: QualitySelection,
        level: usize,
        auto: bool,
    },
    Error {
        kind: ErrorKind,
        message: String,
        fatal: bool,
    },
    Milestone {
        percent: u8,
    },
    SkipAvailable {
        mark: Option<SkipMark>,
    },
    RateChanged {
        rate: f64,
    },
    VolumeChanged {
        volume: f64,
        muted: bool,
    },
    SubtitlesChanged {
        visible: bool,
    },
    AudioRoutingChanged {
        routing: AudioRouting,
    },
    PictureInPictureChanged {
        active: bool,
    },
    Detached {
        attach: AttachId,
    },
}

/// Point-in-time statistics for overlays and logs
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub state: PlaybackState,
    pub attach: Option<AttachId>,
    pub level: Option<usize>,
    pub level_label: Option<String>,
    pub selection: QualitySelection,
    pub estimate_bps: Option<u64>,
    pub position: f64,
    pub duration: Option<f64>,
    pub buffered_end: Option<f64>,
    pub lead: f64,
    pub rate: f64,
    pub memory_used: usize,
}

/// Per-attach state, dropped wholesale on detach
struct Attachment {
    id: AttachId,
    content_id: Option<String>,
    skip_marks: Vec<SkipMark>,
    manifest: Manifest,
    capabilities: Capabilities,
    buffer: BufferManager,
    audio: AudioChain,
    playlists: HashMap<usize, MediaPlaylist>,
    variant_loading: Option<usize>,
    /// Level new segment fetches use
    level: usize,
    generation: u64,
    wants_play: bool,
    /// Buffering was entered through an underrun
    underrun: bool,
    seek_target: Option<f64>,
    resume: Option<f64>,
    duration: Option<f64>,
    duration_hint: Option<f64>,
    position: f64,
    milestones: BTreeSet<u8>,
    active_skip: Option<SkipMark>,
    throttle: SaveThrottle,
    parked_until: Option<Instant>,
    /// Indices given up on after repeated decode faults
    skipped: BTreeSet<usize>,
    pip: bool,
}

impl Attachment {
    fn timeline(&self) -> Option<&MediaPlaylist> {
        self.playlists
            .get(&self.level)
            .or_else(|| self.playlists.values().next())
    }

    fn target(&self) -> f64 {
        self.seek_target.unwrap_or(self.position)
    }

    fn lead(&self) -> f64 {
        self.buffer.lead(self.target())
    }

    fn is_complete(&self) -> bool {
        self.timeline()
            .is_some_and(|p| self.buffer.is_complete_from(p, self.target(), &self.skipped))
    }
}

/// Synchronous playback state machine
pub struct PlaybackEngine {
    config: PlayerConfig,
    platform: Arc<dyn Platform>,
    state: PlaybackState,
    abr: AbrController,
    supervisor: Supervisor,
    current: Option<Attachment>,
    pending_attach: Option<AttachId>,
    rate: f64,
    volume: f64,
    muted: bool,
    subtitles: bool,
    routing: AudioRouting,
    outbox: Vec<Notification>,
    commands: Vec<Command>,
}

impl PlaybackEngine {
    pub fn new(config: PlayerConfig, platform: Arc<dyn Platform>) -> Self {
        Self {
            abr: AbrController::new(config.abr.clone()),
            supervisor: Supervisor::new(config.recovery.clone()),
            config,
            platform,
            state: PlaybackState::Idle,
            current: None,
            pending_attach: None,
            rate: 1.0,
            volume: 1.0,
            muted: false,
            subtitles: false,
            routing: AudioRouting::Dry,
            outbox: Vec::new(),
            commands: Vec::new(),
        }
    }

    pub fn config(&self) -> &PlayerConfig {
        &self.config
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn attach_id(&self) -> Option<AttachId> {
        self.current.as_ref().map(|a| a.id)
    }

    pub fn position(&self) -> f64 {
        self.current.as_ref().map(|a| a.target()).unwrap_or(0.0)
    }

    pub fn duration(&self) -> Option<f64> {
        self.current.as_ref().and_then(|a| a.duration)
    }

    pub fn levels(&self) -> &[Level] {
        self.current
            .as_ref()
            .map(|a| a.manifest.levels())
            .unwrap_or(&[])
    }

    pub fn buffered_ranges(&self) -> &[BufferedRange] {
        self.current
            .as_ref()
            .map(|a| a.buffer.buffered_ranges())
            .unwrap_or(&[])
    }

    pub fn selection(&self) -> QualitySelection {
        self.abr.selection()
    }

    pub fn stats(&self) -> EngineStats {
        let att = self.current.as_ref();
        let level = att.map(|a| a.level);
        EngineStats {
            state: self.state,
            attach: att.map(|a| a.id),
            level,
            level_label: att
                .zip(level)
                .and_then(|(a, l)| a.manifest.level(l))
                .map(|l| l.label.clone()),
            selection: self.abr.selection(),
            estimate_bps: self.abr.estimate_bps(),
            position: self.position(),
            duration: self.duration(),
            buffered_end: att.and_then(|a| a.buffer.buffered_end(a.target())),
            lead: att.map(|a| a.lead()).unwrap_or(0.0),
            rate: self.rate,
            memory_used: att.map(|a| a.buffer.memory_used()).unwrap_or(0),
        }
    }

    /// Take the notifications queued since the last call
    pub fn drain_notifications(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.outbox)
    }

    /// Apply one message and return the commands it produced
    pub fn handle(&mut self, message: Message) -> Vec<Command> {
        match message {
            Message::AttachRequested(attach) => {
                debug!(%attach, "Attach requested");
                self.pending_attach = Some(attach);
            }
            Message::Attach(prepared) => self.on_attach(*prepared),
            Message::AttachRejected { attach, error } => {
                if self.pending_attach == Some(attach) {
                    self.pending_attach = None;
                    warn!(%attach, error = %error, "Attach rejected");
                    self.notify(Notification::Error {
                        kind: ErrorKind::Manifest,
                        message: error.to_string(),
                        fatal: false,
                    });
                }
            }
            Message::Detach => {
                self.pending_attach = None;
                self.detach();
            }
            Message::Intent(intent) => self.on_intent(intent),
            Message::VariantLoaded { ticket, result } => self.on_variant_loaded(ticket, result),
            Message::SegmentLoaded {
                ticket,
                result,
                elapsed,
            } => self.on_segment_loaded(ticket, result, elapsed),
            Message::DecodeError { attach, error } => self.on_decode_error(attach, error),
            Message::Tick { at } => self.on_tick(at),
        }
        std::mem::take(&mut self.commands)
    }

    fn notify(&mut self, notification: Notification) {
        self.outbox.push(notification);
    }

    fn transition(&mut self, to: PlaybackState) -> bool {
        let from = self.state;
        if from == to {
            return false;
        }
        if !from.can_transition_to(to) {
            warn!(%from, %to, "Ignoring invalid state transition");
            return false;
        }
        self.state = to;
        info!(%from, %to, "State transition");
        self.notify(Notification::StateChanged { from, to });
        true
    }

    fn with_attachment(&mut self, f: impl FnOnce(&mut Self, &mut Attachment)) {
        if let Some(mut att) = self.current.take() {
            f(self, &mut att);
            self.current = Some(att);
        }
    }

    // --- attach / detach -------------------------------------------------

    fn on_attach(&mut self, prepared: PreparedAttach) {
        if self.pending_attach != Some(prepared.attach) {
            debug!(attach = %prepared.attach, "Dropping superseded attach");
            return;
        }
        self.pending_attach = None;
        self.detach();

        let surface = match self.platform.create_surface() {
            Ok(surface) => surface,
            Err(err) => {
                error!(error = %err, "Surface creation failed");
                self.notify(Notification::Error {
                    kind: ErrorKind::Unrecoverable,
                    message: err.to_string(),
                    fatal: true,
                });
                self.transition(PlaybackState::FatalError);
                return;
            }
        };
        let capabilities = self.platform.capabilities();

        let mut buffer = BufferManager::new(self.config.buffer.clone(), surface);
        let sink = buffer.sink_mut();
        sink.set_rate(self.rate);
        sink.set_volume(self.volume, self.muted);
        sink.set_subtitles_visible(self.subtitles);

        self.supervisor.reset();
        let PreparedAttach {
            attach,
            request,
            manifest,
            scrub_cues,
            resume_position,
        } = prepared;
        let level = self.abr.start(manifest.levels());
        let levels = manifest.levels().to_vec();
        let inline = manifest.inline_playlist().cloned();

        info!(
            %attach,
            url = %manifest.url(),
            levels = levels.len(),
            level,
            scrub_cues = scrub_cues.len(),
            "Content attached"
        );

        self.current = Some(Attachment {
            id: attach,
            content_id: request.content_id,
            skip_marks: request.skip_marks.clone(),
            manifest,
            capabilities,
            buffer,
            audio: AudioChain::new(self.routing),
            playlists: HashMap::new(),
            variant_loading: None,
            level,
            generation: 0,
            wants_play: request.autoplay.unwrap_or(self.config.autoplay),
            underrun: false,
            seek_target: None,
            resume: resume_position,
            duration: None,
            duration_hint: request.duration_hint,
            position: 0.0,
            milestones: BTreeSet::new(),
            active_skip: None,
            throttle: SaveThrottle::new(Duration::from_millis(self.config.resume.save_interval_ms)),
            parked_until: None,
            skipped: BTreeSet::new(),
            pip: false,
        });

        self.transition(PlaybackState::Attaching);
        self.notify(Notification::Attached {
            attach,
            levels,
            scrub_cues,
            capabilities,
            skip_marks: request.skip_marks,
        });
        let selection = self.abr.selection();
        self.notify(Notification::QualityChanged {
            selection,
            level,
            auto: selection.is_auto(),
        });

        self.with_attachment(|engine, att| match inline {
            Some(playlist) => engine.install_playlist(att, playlist),
            None => engine.request_variant(att, level, Duration::ZERO),
        });
    }

    fn detach(&mut self) {
        let Some(mut att) = self.current.take() else {
            return;
        };
        self.commands.push(Command::Cancel(CancelScope::Attach(att.id)));
        att.audio.release();
        att.buffer.release();
        self.transition(PlaybackState::Idle);
        info!(attach = %att.id, "Detached");
        self.notify(Notification::Detached { attach: att.id });
    }

    // --- loads -----------------------------------------------------------

    fn request_variant(&mut self, att: &mut Attachment, level: usize, delay: Duration) {
        if att.playlists.contains_key(&level) || att.variant_loading == Some(level) {
            return;
        }
        let Some(url) = att.manifest.level(level).map(|l| l.uri.clone()) else {
            warn!(level, "Variant requested for unknown level");
            return;
        };
        att.variant_loading = Some(level);
        self.commands.push(Command::LoadVariant {
            ticket: LoadTicket {
                attach: att.id,
                generation: att.generation,
                level,
                index: None,
            },
            url,
            delay,
        });
    }

    fn issue_fetch(&mut self, att: &mut Attachment, index: usize, delay: Duration) {
        let level = att.level;
        let Some(segment) = att.playlists.get(&level).and_then(|p| p.segment(index)) else {
            return;
        };
        let request = SegmentRequest::from(segment);
        att.buffer.begin_fetch(index);
        debug!(level, index, delay_ms = delay.as_millis() as u64, "Fetching segment");
        self.commands.push(Command::FetchSegment {
            ticket: LoadTicket {
                attach: att.id,
                generation: att.generation,
                level,
                index: Some(index),
            },
            request,
            delay,
        });
    }

    /// Invalidate outstanding segment loads
    fn supersede(&mut self, att: &mut Attachment) {
        att.generation += 1;
        att.buffer.end_fetch();
        self.commands.push(Command::Cancel(CancelScope::Superseded {
            attach: att.id,
            generation: att.generation,
        }));
    }

    /// Fill the forward horizon
    fn pump(&mut self, att: &mut Attachment, now: Instant) {
        use PlaybackState::*;
        if !matches!(self.state, Attaching | Buffering | Playing | Paused | Seeking) {
            return;
        }
        if let Some(until) = att.parked_until {
            if now < until {
                return;
            }
            att.parked_until = None;
        }
        let Some(playlist) = att.playlists.get(&att.level) else {
            self.request_variant(att, att.level, Duration::ZERO);
            return;
        };
        if let Some(index) = att.buffer.next_fetch(playlist, att.target(), &att.skipped) {
            self.issue_fetch(att, index, Duration::ZERO);
        }
    }

    fn on_variant_loaded(&mut self, ticket: LoadTicket, result: crate::Result<MediaPlaylist>) {
        self.with_attachment(|engine, att| {
            if ticket.attach != att.id || engine.state == PlaybackState::FatalError {
                debug!(level = ticket.level, "Dropping stale variant playlist");
                return;
            }
            if att.variant_loading == Some(ticket.level) {
                att.variant_loading = None;
            }
            engine.supervisor.network_settled();
            match result {
                Ok(playlist) => {
                    engine.supervisor.network_recovered();
                    engine.install_playlist(att, playlist.for_level(ticket.level));
                }
                Err(Error::Fetch(err)) => engine.on_load_fault(att, ticket, err),
                Err(err) => engine.fail(
                    att,
                    FatalKind::Unrecoverable,
                    format!("variant playlist for level {}: {}", ticket.level, err),
                ),
            }
        });
    }

    fn install_playlist(&mut self, att: &mut Attachment, playlist: MediaPlaylist) {
        let level = playlist.level;
        debug!(
            level,
            segments = playlist.segments.len(),
            ended = playlist.ended,
            "Variant playlist loaded"
        );
        if let Some(duration) = playlist.duration().or(att.duration_hint) {
            if att.duration != Some(duration) {
                att.duration = Some(duration);
                self.notify(Notification::DurationChanged { duration });
            }
        }
        att.playlists.insert(level, playlist);

        // applied once, before the first segment, without a seek
        if let Some(stored) = att.resume.take() {
            let resume_at = att
                .duration
                .and_then(|d| self.config.resume.applicable(stored, d));
            if let Some(position) = resume_at {
                info!(position, "Resuming from stored position");
                att.position = position;
                att.buffer.sink_mut().seek(position);
                self.notify(Notification::PositionChanged { position });
            }
        }

        self.pump(att, Instant::now());
    }

    fn on_segment_loaded(
        &mut self,
        ticket: LoadTicket,
        result: Result<Bytes, FetchError>,
        elapsed: Duration,
    ) {
        self.with_attachment(|engine, att| {
            if ticket.attach != att.id
                || ticket.generation != att.generation
                || engine.state == PlaybackState::FatalError
            {
                debug!(
                    level = ticket.level,
                    index = ?ticket.index,
                    "Dropping stale segment result"
                );
                return;
            }
            let Some(index) = ticket.index else {
                return;
            };
            att.buffer.end_fetch();
            engine.supervisor.network_settled();
            engine.supervisor.decode_settled();

            match result {
                Ok(data) => {
                    engine.supervisor.network_recovered();
                    engine.abr.record_sample(data.len(), elapsed);
                    engine.append(att, ticket.level, index, data);
                }
                Err(FetchError::Cancelled) => {}
                Err(err) => engine.on_load_fault(att, ticket, err),
            }
        });
    }

    fn append(&mut self, att: &mut Attachment, level: usize, index: usize, data: Bytes) {
        let Some(segment) = att.playlists.get(&level).and_then(|p| p.segment(index)) else {
            return;
        };
        let payload = SegmentPayload {
            level,
            index,
            start: segment.start,
            duration: segment.duration,
            data,
        };

        match att.buffer.append(&payload) {
            Ok(()) => {
                self.notify(Notification::BufferedChanged {
                    ranges: att.buffer.buffered_ranges().to_vec(),
                });
                if self.state == PlaybackState::Attaching {
                    self.transition(PlaybackState::Buffering);
                }
                self.settle(att);
                self.pump(att, Instant::now());
            }
            Err(err) => self.on_sink_fault(att, err, level, Some(index)),
        }
    }

    // --- faults ----------------------------------------------------------

    fn on_load_fault(&mut self, att: &mut Attachment, ticket: LoadTicket, err: FetchError) {
        match self.supervisor.on_network_fault(&err) {
            RecoveryAction::Retry { attempt, delay } => {
                warn!(error = %err, attempt, "Load failed, retrying");
                match ticket.index {
                    Some(index) => self.issue_fetch(att, index, delay),
                    None => {
                        att.variant_loading = None;
                        self.request_variant(att, ticket.level, delay);
                    }
                }
            }
            RecoveryAction::Advisory {
                class,
                skip_segment,
                resume_after,
            } => {
                let index = ticket.index;
                self.advise(att, class, skip_segment, resume_after, index, err.to_string());
            }
            RecoveryAction::Fatal(kind) => self.fail(att, kind, err.to_string()),
            RecoveryAction::ResetDecoder { .. } | RecoveryAction::Suppressed => {
                debug!(error = %err, "Network fault suppressed");
            }
        }
    }

    fn on_decode_error(&mut self, attach: AttachId, error: SinkError) {
        self.with_attachment(|engine, att| {
            if attach != att.id || engine.state == PlaybackState::FatalError {
                debug!(%attach, "Dropping stale decode error");
                return;
            }
            let position = att.target();
            let index = att.timeline().and_then(|p| p.index_at(position));
            let level = index
                .and_then(|i| att.buffer.level_of(i))
                .unwrap_or(att.level);
            engine.on_sink_fault(att, error, level, index);
        });
    }

    fn on_sink_fault(
        &mut self,
        att: &mut Attachment,
        err: SinkError,
        level: usize,
        index: Option<usize>,
    ) {
        match self.supervisor.on_sink_fault(&err, level, Instant::now()) {
            RecoveryAction::ResetDecoder { level } => {
                warn!(error = %err, level, ?index, "Decode fault, resetting decoder");
                att.buffer.sink_mut().reset(level);
                if let Some(index) = index {
                    if att.buffer.in_flight().is_some() {
                        self.supersede(att);
                    }
                    self.issue_fetch(att, index, Duration::ZERO);
                }
            }
            RecoveryAction::Advisory {
                class,
                skip_segment,
                resume_after,
            } => self.advise(att, class, skip_segment, resume_after, index, err.to_string()),
            RecoveryAction::Fatal(kind) => self.fail(att, kind, err.to_string()),
            RecoveryAction::Retry { .. } | RecoveryAction::Suppressed => {
                debug!(error = %err, "Decode fault suppressed");
            }
        }
    }

    /// Report a non-fatal fault, then park loading or skip past `index`
    fn advise(
        &mut self,
        att: &mut Attachment,
        class: FaultClass,
        skip_segment: bool,
        resume_after: Option<Duration>,
        index: Option<usize>,
        message: String,
    ) {
        self.notify(Notification::Error {
            kind: class.into(),
            message,
            fatal: false,
        });
        if let Some(delay) = resume_after {
            debug!(delay_ms = delay.as_millis() as u64, "Loading parked");
            att.parked_until = Some(Instant::now() + delay);
        }
        if !skip_segment {
            return;
        }
        if let Some(index) = index {
            warn!(index, ?class, "Skipping unplayable segment");
            att.skipped.insert(index);
        }
        self.jump_skipped(att);
        self.pump(att, Instant::now());
    }

    fn fail(&mut self, att: &mut Attachment, kind: FatalKind, message: String) {
        error!(attach = %att.id, ?kind, %message, "Fatal playback error");
        att.buffer.sink_mut().set_playing(false);
        att.buffer.end_fetch();
        att.seek_target = None;
        self.commands.push(Command::Cancel(CancelScope::Attach(att.id)));
        self.notify(Notification::Error {
            kind: kind.into(),
            message,
            fatal: true,
        });
        self.transition(PlaybackState::FatalError);
    }

    /// Move the play head over skipped segments it has reached
    fn jump_skipped(&mut self, att: &mut Attachment) {
        let head = att.target();
        let edge = att.buffer.buffered_end(head).unwrap_or(head);
        if edge - head > RANGE_GAP_TOLERANCE {
            return;
        }
        let Some(playlist) = att.timeline() else {
            return;
        };
        let Some(first) = playlist.index_at(edge) else {
            return;
        };
        let resume_at = playlist.segments[first..]
            .iter()
            .take_while(|s| att.skipped.contains(&s.index))
            .last()
            .map(|s| s.end());
        let Some(resume_at) = resume_at else {
            return;
        };

        info!(from = head, to = resume_at, "Jumping over skipped media");
        att.buffer.sink_mut().seek(resume_at);
        match att.seek_target.as_mut() {
            Some(target) => *target = resume_at,
            None => att.position = resume_at,
        }
        self.notify(Notification::PositionChanged {
            position: resume_at,
        });
    }

    // --- state -----------------------------------------------------------

    /// Leave `Buffering` / `Seeking` once enough media is in place
    fn settle(&mut self, att: &mut Attachment) {
        match self.state {
            PlaybackState::Buffering => {
                if att.lead() >= self.config.buffer.min_buffer_time || att.is_complete() {
                    att.underrun = false;
                    self.resume_or_pause(att);
                }
            }
            PlaybackState::Seeking => {
                let Some(target) = att.seek_target else {
                    return;
                };
                let ready = att
                    .timeline()
                    .and_then(|p| p.index_at(target))
                    .map(|i| att.buffer.is_buffered(i))
                    .unwrap_or_else(|| att.is_complete());
                if ready {
                    att.seek_target = None;
                    att.position = target;
                    debug!(position = target, "Seek settled");
                    self.resume_or_pause(att);
                }
            }
            _ => {}
        }
    }

    fn resume_or_pause(&mut self, att: &mut Attachment) {
        if att.wants_play {
            self.enter_playing(att);
        } else if self.transition(PlaybackState::Paused) {
            att.buffer.sink_mut().set_playing(false);
        }
    }

    fn enter_playing(&mut self, att: &mut Attachment) {
        if !self.transition(PlaybackState::Playing) {
            return;
        }
        att.buffer.sink_mut().set_playing(true);
        if !att.audio.is_started() {
            match att.audio.start(self.platform.as_ref()) {
                Ok(true) => debug!(routing = ?att.audio.routing(), "Audio chain started"),
                Ok(false) => {}
                Err(err) => {
                    warn!(error = %err, "Audio chain unavailable");
                    self.notify(Notification::Error {
                        kind: ErrorKind::Audio,
                        message: err.to_string(),
                        fatal: false,
                    });
                }
            }
        }
    }

    fn on_tick(&mut self, now: Instant) {
        self.with_attachment(|engine, att| {
            if matches!(engine.state, PlaybackState::Idle | PlaybackState::FatalError) {
                return;
            }

            let head = att.buffer.sink().current_time();
            let mut buffered_changed = att.buffer.refresh();
            buffered_changed |= att.buffer.evict(head);
            if buffered_changed {
                engine.notify(Notification::BufferedChanged {
                    ranges: att.buffer.buffered_ranges().to_vec(),
                });
            }
            if att.seek_target.is_none() && (head - att.position).abs() > 1e-3 {
                att.position = head;
                engine.notify(Notification::PositionChanged { position: head });
            }

            engine.jump_skipped(att);
            engine.evaluate_abr(att);

            match engine.state {
                PlaybackState::Playing => engine.check_playing(att),
                PlaybackState::Buffering | PlaybackState::Seeking => engine.settle(att),
                _ => {}
            }
            if engine.state.is_active() {
                engine.track_progress(att, now);
            }
            engine.pump(att, now);
        });
    }

    fn check_playing(&mut self, att: &mut Attachment) {
        if let Some(duration) = att.duration {
            if att.position >= duration - self.config.end_epsilon {
                att.wants_play = false;
                att.buffer.sink_mut().set_playing(false);
                self.transition(PlaybackState::Ended);
                return;
            }
        }
        let lead = att.lead();
        if lead < self.config.buffer.rebuffer_threshold && !att.is_complete() {
            info!(lead, position = att.position, "Buffer underrun");
            att.underrun = true;
            att.buffer.sink_mut().set_playing(false);
            self.transition(PlaybackState::Buffering);
        }
    }

    fn evaluate_abr(&mut self, att: &mut Attachment) {
        let context = AbrContext {
            buffer_lead: att.lead(),
            emergency_allowed: self.state == PlaybackState::Playing
                || (self.state == PlaybackState::Buffering && att.underrun),
        };
        if let Some(switch) = self.abr.on_tick(att.manifest.levels(), &context) {
            self.apply_switch(att, switch);
        }
    }

    fn apply_switch(&mut self, att: &mut Attachment, switch: LevelSwitch) {
        att.level = switch.to;
        if matches!(switch.reason, SwitchReason::Manual | SwitchReason::Emergency) {
            self.supersede(att);
        }
        self.notify(Notification::QualityChanged {
            selection: self.abr.selection(),
            level: switch.to,
            auto: switch.is_auto(),
        });
        self.request_variant(att, switch.to, Duration::ZERO);
    }

    fn track_progress(&mut self, att: &mut Attachment, now: Instant) {
        if let Some(content_id) = &att.content_id {
            if self.config.resume.should_save(att.duration) && att.throttle.due(now) {
                self.commands.push(Command::SaveResume {
                    content_id: content_id.clone(),
                    position: att.position,
                });
            }
        }

        if let Some(duration) = att.duration.filter(|d| *d > 0.0) {
            let percent = att.position / duration * 100.0;
            let crossed: Vec<u8> = self
                .config
                .milestones
                .iter()
                .copied()
                .filter(|m| percent >= f64::from(*m) && att.milestones.insert(*m))
                .collect();
            for percent in crossed {
                info!(percent, "Watch milestone");
                self.notify(Notification::Milestone { percent });
            }
        }

        let mark = att
            .skip_marks
            .iter()
            .find(|m| m.contains_time(att.position))
            .copied();
        if mark != att.active_skip {
            att.active_skip = mark;
            self.notify(Notification::SkipAvailable { mark });
        }
    }

    // --- intents ---------------------------------------------------------

    fn on_intent(&mut self, intent: Intent) {
        debug!(?intent, state = %self.state, "Intent");
        match intent {
            Intent::SetRate(rate) => self.set_rate(rate),
            Intent::SetVolume(volume) => self.set_volume(volume),
            Intent::SetMuted(muted) => self.set_muted(muted),
            Intent::SetSubtitles(visible) => self.set_subtitles(visible),
            Intent::SetAudioConditioning(enabled) => self.set_audio_conditioning(enabled),
            other => self.with_attachment(|engine, att| engine.on_attached_intent(att, other)),
        }
    }

    fn on_attached_intent(&mut self, att: &mut Attachment, intent: Intent) {
        if self.state == PlaybackState::FatalError {
            debug!(?intent, "Ignoring intent after fatal error");
            return;
        }
        match intent {
            Intent::Play => self.play(att),
            Intent::Pause => {
                att.wants_play = false;
                // pending transitions settle into `Paused` on their own
                if self.state == PlaybackState::Playing {
                    att.buffer.sink_mut().set_playing(false);
                    self.transition(PlaybackState::Paused);
                }
            }
            Intent::Seek(position) => {
                if self.state.can_seek() {
                    self.seek(att, position);
                } else {
                    debug!(state = %self.state, "Seek ignored");
                }
            }
            Intent::SetQuality(selection) => self.set_quality(att, selection),
            Intent::SkipSegment => {
                if let Some(mark) = att.active_skip {
                    info!(kind = ?mark.kind, to = mark.end, "Skipping segment");
                    self.seek(att, mark.end);
                }
            }
            Intent::TogglePictureInPicture => self.toggle_pip(att),
            Intent::SetRate(_)
            | Intent::SetVolume(_)
            | Intent::SetMuted(_)
            | Intent::SetSubtitles(_)
            | Intent::SetAudioConditioning(_) => {}
        }
    }

    fn play(&mut self, att: &mut Attachment) {
        att.wants_play = true;
        match self.state {
            PlaybackState::Ended => {
                info!("Replaying from start");
                self.seek(att, 0.0);
            }
            PlaybackState::Paused => {
                if att.lead() < self.config.buffer.rebuffer_threshold && !att.is_complete() {
                    self.transition(PlaybackState::Buffering);
                    self.settle(att);
                } else {
                    self.enter_playing(att);
                }
            }
            // applied once the pending transition completes
            _ => {}
        }
    }

    fn seek(&mut self, att: &mut Attachment, position: f64) {
        if !position.is_finite() {
            return;
        }
        let target = match att.duration {
            Some(duration) => position.clamp(0.0, duration),
            None => position.max(0.0),
        };
        info!(from = att.target(), to = target, "Seeking");

        self.supersede(att);
        self.abr.reset_hysteresis();
        att.seek_target = Some(target);
        att.underrun = false;
        let sink = att.buffer.sink_mut();
        sink.set_playing(false);
        sink.seek(target);

        self.transition(PlaybackState::Seeking);
        self.notify(Notification::PositionChanged { position: target });
        self.settle(att);
        self.pump(att, Instant::now());
    }

    fn set_quality(&mut self, att: &mut Attachment, selection: QualitySelection) {
        let before = self.abr.selection();
        match self.abr.set_selection(selection, att.manifest.levels()) {
            Ok(Some(switch)) => {
                self.apply_switch(att, switch);
                self.pump(att, Instant::now());
            }
            Ok(None) => {
                let after = self.abr.selection();
                if after != before {
                    self.notify(Notification::QualityChanged {
                        selection: after,
                        level: self.abr.current_level(),
                        auto: after.is_auto(),
                    });
                }
            }
            Err(err) => {
                warn!(error = %err, "Quality override rejected");
                self.notify(Notification::Error {
                    kind: ErrorKind::Quality,
                    message: err.to_string(),
                    fatal: false,
                });
            }
        }
    }

    fn toggle_pip(&mut self, att: &mut Attachment) {
        let Some(mode) = att.capabilities.picture_in_picture.mode() else {
            debug!("Picture-in-picture not supported");
            return;
        };
        let active = !att.pip;
        match att.buffer.sink_mut().set_picture_in_picture(mode, active) {
            Ok(()) => {
                att.pip = active;
                self.notify(Notification::PictureInPictureChanged { active });
            }
            Err(err) => warn!(error = %err, "Picture-in-picture toggle failed"),
        }
    }

    fn set_rate(&mut self, rate: f64) {
        if !rate.is_finite() {
            return;
        }
        let rate = rate.clamp(MIN_RATE, MAX_RATE);
        if (rate - self.rate).abs() < f64::EPSILON {
            return;
        }
        self.rate = rate;
        if let Some(att) = self.current.as_mut() {
            att.buffer.sink_mut().set_rate(rate);
        }
        self.notify(Notification::RateChanged { rate });
    }

    fn set_volume(&mut self, volume: f64) {
        if !volume.is_finite() {
            return;
        }
        let volume = volume.clamp(0.0, 1.0);
        let muted = if volume > 0.0 { false } else { self.muted };
        self.apply_volume(volume, muted);
    }

    fn set_muted(&mut self, muted: bool) {
        self.apply_volume(self.volume, muted);
    }

    fn apply_volume(&mut self, volume: f64, muted: bool) {
        if volume == self.volume && muted == self.muted {
            return;
        }
        self.volume = volume;
        self.muted = muted;
        if let Some(att) = self.current.as_mut() {
            att.buffer.sink_mut().set_volume(volume, muted);
        }
        self.notify(Notification::VolumeChanged { volume, muted });
    }

    fn set_subtitles(&mut self, visible: bool) {
        if visible == self.subtitles {
            return;
        }
        self.subtitles = visible;
        if let Some(att) = self.current.as_mut() {
            att.buffer.sink_mut().set_subtitles_visible(visible);
        }
        self.notify(Notification::SubtitlesChanged { visible });
    }

    fn set_audio_conditioning(&mut self, enabled: bool) {
        let requested = AudioRouting::from_enabled(enabled);
        let rewire = self.current.as_mut().map(|att| {
            let result = att.audio.set_routing(requested);
            (result, att.audio.connected())
        });

        // report what the graph carries, which is dry after a failed rewire
        let mut routing = requested;
        if let Some((result, connected)) = rewire {
            if let Err(err) = result {
                warn!(error = %err, "Audio routing change failed");
                self.notify(Notification::Error {
                    kind: ErrorKind::Audio,
                    message: err.to_string(),
                    fatal: false,
                });
            }
            routing = connected.unwrap_or(requested);
        }
        if routing != self.routing {
            self.routing = routing;
            self.notify(Notification::AudioRoutingChanged { routing });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::parse_manifest;
    use crate::platform::HeadlessPlatform;

    const MASTER: &str = "#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=500000,RESOLUTION=426x240
240p.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=2500000,RESOLUTION=1280x720
720p.m3u8
";

    fn engine() -> PlaybackEngine {
        PlaybackEngine::new(PlayerConfig::default(), Arc::new(HeadlessPlatform::default()))
    }

    fn attach(engine: &mut PlaybackEngine) -> (AttachId, Vec<Command>) {
        let url = Url::parse("https://cdn.example.com/master.m3u8").unwrap();
        let manifest = parse_manifest(MASTER, &url).unwrap();
        let id = AttachId::next();
        engine.handle(Message::AttachRequested(id));
        let commands = engine.handle(Message::Attach(Box::new(PreparedAttach {
            attach: id,
            request: AttachRequest::new(url),
            manifest,
            scrub_cues: Arc::from(Vec::new()),
            resume_position: None,
        })));
        (id, commands)
    }

    #[test]
    fn test_attach_requests_variant() {
        let mut engine = engine();
        let (id, commands) = attach(&mut engine);

        assert_eq!(engine.state(), PlaybackState::Attaching);
        assert_eq!(engine.attach_id(), Some(id));
        assert!(matches!(
            commands.as_slice(),
            [Command::LoadVariant { ticket, .. }] if ticket.level == 0 && ticket.index.is_none()
        ));

        let events = engine.drain_notifications();
        assert!(matches!(events[0], Notification::StateChanged { to: PlaybackState::Attaching, .. }));
        assert!(matches!(&events[1], Notification::Attached { levels, .. } if levels.len() == 2));
    }

    #[test]
    fn test_superseded_attach_is_dropped() {
        let mut engine = engine();
        let older = AttachId::next();
        engine.handle(Message::AttachRequested(older));
        let (newer, _) = attach(&mut engine);
        engine.drain_notifications();

        let url = Url::parse("https://cdn.example.com/other.m3u8").unwrap();
        let manifest = parse_manifest(MASTER, &url).unwrap();
        let commands = engine.handle(Message::Attach(Box::new(PreparedAttach {
            attach: older,
            request: AttachRequest::new(url),
            manifest,
            scrub_cues: Arc::from(Vec::new()),
            resume_position: None,
        })));
        assert!(commands.is_empty());
        assert_eq!(engine.attach_id(), Some(newer));
        assert!(engine.drain_notifications().is_empty());
    }

    #[test]
    fn test_rejected_attach_leaves_session_untouched() {
        let mut engine = engine();
        let (id, _) = attach(&mut engine);
        engine.drain_notifications();

        let failed = AttachId::next();
        engine.handle(Message::AttachRequested(failed));
        engine.handle(Message::AttachRejected {
            attach: failed,
            error: ManifestError::NotFound("https://cdn.example.com/missing.m3u8".into()),
        });

        assert_eq!(engine.attach_id(), Some(id));
        assert_eq!(engine.state(), PlaybackState::Attaching);
        let events = engine.drain_notifications();
        assert!(matches!(
            events.as_slice(),
            [Notification::Error { kind: ErrorKind::Manifest, fatal: false, .. }]
        ));
    }

    #[test]
    fn test_settings_apply_without_content() {
        let mut engine = engine();
        engine.handle(Message::Intent(Intent::SetRate(5.0)));
        engine.handle(Message::Intent(Intent::SetMuted(true)));
        engine.handle(Message::Intent(Intent::SetVolume(0.4)));
        engine.handle(Message::Intent(Intent::SetVolume(0.4)));

        let events = engine.drain_notifications();
        assert!(matches!(events[0], Notification::RateChanged { rate } if rate == MAX_RATE));
        assert!(matches!(events[1], Notification::VolumeChanged { muted: true, .. }));
        assert!(matches!(
            events[2],
            Notification::VolumeChanged { volume, muted: false } if volume == 0.4
        ));
        assert_eq!(events.len(), 3);
    }

    #[test]
    fn test_advisory_class_maps_to_error_kind() {
        assert_eq!(ErrorKind::from(FaultClass::NetworkTransient), ErrorKind::Network);
        assert_eq!(ErrorKind::from(FaultClass::MediaDecodeTransient), ErrorKind::MediaDecode);
        assert_eq!(ErrorKind::from(FaultClass::Fatal), ErrorKind::Unrecoverable);
    }

    #[test]
    fn test_audio_toggle_same_mode_is_silent() {
        let mut engine = engine();
        engine.handle(Message::Intent(Intent::SetAudioConditioning(true)));
        engine.handle(Message::Intent(Intent::SetAudioConditioning(true)));
        let events = engine.drain_notifications();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            Notification::AudioRoutingChanged { routing: AudioRouting::Conditioned }
        ));
    }

    #[test]
    fn test_detach_cancels_and_idles() {
        let mut engine = engine();
        let (id, _) = attach(&mut engine);
        engine.drain_notifications();

        let commands = engine.handle(Message::Detach);
        assert_eq!(commands, vec![Command::Cancel(CancelScope::Attach(id))]);
        assert_eq!(engine.state(), PlaybackState::Idle);
        assert!(matches!(
            engine.drain_notifications().last(),
            Some(Notification::Detached { attach }) if *attach == id
        ));
    }
}
