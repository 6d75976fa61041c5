//! Player Session - async driver for the playback engine
//!
//! Coordinates:
//! - Attach preparation (manifest, scrub index, stored resume position)
//! - Execution of engine commands as cancellable, time-bounded tasks
//! - The time-update tick
//! - Fan-out of engine notifications
//!
//! The engine itself never awaits. Every result flows back through one
//! queue, so the engine stays the single writer of playback state.

use crate::{
    engine::{
        AttachRequest, CancelScope, Command, EngineStats, Intent, LoadTicket, Message,
        Notification, PlaybackEngine, PreparedAttach,
    },
    error::{Error, FetchError, ManifestError, SinkError},
    loader::{Loader, SegmentRequest},
    manifest::{normalize_manifest_url, HlsParser},
    platform::Platform,
    resume::{PositionStore, ResumeStore},
    scrub::{self, ScrubCue},
    types::*,
    Result,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// Capacity of the notification channel; slow listeners lag
const NOTIFICATION_CAPACITY: usize = 1024;

/// Collaborators shared by the session and its handles
struct Shared {
    config: PlayerConfig,
    loader: Arc<dyn Loader>,
    parser: HlsParser,
    positions: PositionStore,
}

/// Player session owning one playback engine
pub struct PlayerSession {
    /// Unique session ID
    id: SessionId,
    /// Single writer of playback state
    engine: PlaybackEngine,
    shared: Arc<Shared>,
    /// Message queue feeding the engine
    rx: mpsc::UnboundedReceiver<Message>,
    handle: SessionHandle,
    stats_tx: watch::Sender<EngineStats>,
    /// Root token per attach
    attach_tokens: HashMap<AttachId, CancellationToken>,
    /// Token of the current segment-fetch generation, child of its attach
    generation: Option<(AttachId, u64, CancellationToken)>,
    /// Resume saves, written in issue order by one writer task
    saves: mpsc::UnboundedSender<(String, f64)>,
    saves_rx: Option<mpsc::UnboundedReceiver<(String, f64)>>,
}

impl PlayerSession {
    /// Create a new player session
    pub fn new(
        config: PlayerConfig,
        loader: Arc<dyn Loader>,
        platform: Arc<dyn Platform>,
        store: Arc<dyn ResumeStore>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let engine = PlaybackEngine::new(config.clone(), platform);
        let (stats_tx, stats_rx) = watch::channel(engine.stats());
        let (saves, saves_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            parser: HlsParser::new(loader.clone()),
            positions: PositionStore::new(store, config.resume.clone()),
            loader,
            config,
        });

        let handle = SessionHandle {
            tx,
            events,
            stats: stats_rx,
            shared: shared.clone(),
            preparing: Arc::new(Mutex::new(None)),
        };

        Self {
            id: SessionId::new(),
            engine,
            shared,
            rx,
            handle,
            stats_tx,
            attach_tokens: HashMap::new(),
            generation: None,
            saves,
            saves_rx: Some(saves_rx),
        }
    }

    /// Get session ID
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Handle for issuing intents and observing the session
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Drive the engine until `stop` is cancelled, then detach
    #[instrument(skip_all, fields(session_id = %self.id))]
    pub async fn run_until(mut self, stop: CancellationToken) {
        let period = Duration::from_millis(self.shared.config.tick_interval_ms);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let writer = self
            .saves_rx
            .take()
            .map(|rx| tokio::spawn(write_positions(self.shared.positions.clone(), rx)));
        info!(tick_ms = period.as_millis() as u64, "Session started");

        loop {
            let message = tokio::select! {
                _ = stop.cancelled() => break,
                Some(message) = self.rx.recv() => message,
                _ = ticker.tick() => Message::Tick { at: Instant::now() },
            };
            self.dispatch(message);
        }

        self.dispatch(Message::Detach);
        for token in self.attach_tokens.values() {
            token.cancel();
        }
        drop(self.saves);
        if let Some(writer) = writer {
            // flush positions queued before the stop
            let _ = writer.await;
        }
        info!("Session stopped");
    }

    fn dispatch(&mut self, message: Message) {
        let commands = self.engine.handle(message);
        for notification in self.engine.drain_notifications() {
            // no listeners is fine
            let _ = self.handle.events.send(notification);
        }
        for command in commands {
            self.execute(command);
        }
        self.stats_tx.send_replace(self.engine.stats());
    }

    fn attach_token(&mut self, attach: AttachId) -> CancellationToken {
        self.attach_tokens.entry(attach).or_default().clone()
    }

    fn generation_token(&mut self, ticket: &LoadTicket) -> CancellationToken {
        match &self.generation {
            Some((attach, generation, token))
                if *attach == ticket.attach && *generation == ticket.generation =>
            {
                token.clone()
            }
            _ => {
                if let Some((_, _, stale)) = self.generation.take() {
                    stale.cancel();
                }
                let token = self.attach_token(ticket.attach).child_token();
                self.generation = Some((ticket.attach, ticket.generation, token.clone()));
                token
            }
        }
    }

    fn execute(&mut self, command: Command) {
        let timeout = Duration::from_millis(self.shared.config.request_timeout_ms);
        match command {
            Command::LoadVariant { ticket, url, delay } => {
                let token = self.attach_token(ticket.attach);
                let shared = self.shared.clone();
                let tx = self.handle.tx.clone();
                tokio::spawn(async move {
                    let result = tokio::select! {
                        _ = token.cancelled() => return,
                        result = async {
                            tokio::time::sleep(delay).await;
                            load_variant(&shared.parser, &url, ticket.level, timeout).await
                        } => result,
                    };
                    let _ = tx.send(Message::VariantLoaded { ticket, result });
                });
            }
            Command::FetchSegment {
                ticket,
                request,
                delay,
            } => {
                let token = self.generation_token(&ticket);
                let loader = self.shared.loader.clone();
                let tx = self.handle.tx.clone();
                tokio::spawn(async move {
                    let (result, elapsed) = tokio::select! {
                        _ = token.cancelled() => return,
                        outcome = async {
                            tokio::time::sleep(delay).await;
                            let started = Instant::now();
                            let result = fetch_segment(loader.as_ref(), &request, timeout).await;
                            (result, started.elapsed())
                        } => outcome,
                    };
                    let _ = tx.send(Message::SegmentLoaded {
                        ticket,
                        result,
                        elapsed,
                    });
                });
            }
            Command::SaveResume {
                content_id,
                position,
            } => {
                if self.saves.send((content_id, position)).is_err() {
                    debug!("Resume writer gone, position dropped");
                }
            }
            Command::Cancel(CancelScope::Attach(attach)) => {
                debug!(%attach, "Cancelling attach loads");
                if let Some(token) = self.attach_tokens.remove(&attach) {
                    token.cancel();
                }
                if self.generation.as_ref().is_some_and(|(a, ..)| *a == attach) {
                    self.generation = None;
                }
            }
            Command::Cancel(CancelScope::Superseded { attach, generation }) => {
                if let Some((current, issued, token)) = &self.generation {
                    if *current == attach && *issued < generation {
                        debug!(%attach, generation, "Cancelling superseded loads");
                        token.cancel();
                        self.generation = None;
                    }
                }
            }
        }
    }
}

/// Persist positions one at a time, in the order they were issued
async fn write_positions(
    positions: PositionStore,
    mut rx: mpsc::UnboundedReceiver<(String, f64)>,
) {
    while let Some((content_id, position)) = rx.recv().await {
        positions.save(&content_id, position).await;
    }
}

async fn load_variant(
    parser: &HlsParser,
    url: &Url,
    level: usize,
    timeout: Duration,
) -> Result<crate::manifest::MediaPlaylist> {
    match tokio::time::timeout(timeout, parser.load_variant(url, level)).await {
        Ok(result) => result,
        Err(_) => Err(FetchError::Timeout {
            url: url.to_string(),
        }
        .into()),
    }
}

async fn fetch_segment(
    loader: &dyn Loader,
    request: &SegmentRequest,
    timeout: Duration,
) -> std::result::Result<bytes::Bytes, FetchError> {
    match tokio::time::timeout(timeout, loader.fetch_segment(request)).await {
        Ok(result) => result,
        Err(_) => Err(FetchError::Timeout {
            url: request.url.to_string(),
        }),
    }
}

/// Load everything an attach needs before the engine switches content
#[instrument(skip(shared, request), fields(url = %request.url))]
async fn prepare(shared: Arc<Shared>, attach: AttachId, request: AttachRequest) -> Message {
    let url = normalize_manifest_url(&request.url);
    if url != request.url {
        debug!(%url, "Rewrote legacy manifest URL");
    }

    let timeout = Duration::from_millis(shared.config.request_timeout_ms);
    let manifest = match tokio::time::timeout(timeout, shared.parser.load(&url)).await {
        Ok(Ok(manifest)) => manifest,
        Ok(Err(error)) => return Message::AttachRejected { attach, error },
        Err(_) => {
            return Message::AttachRejected {
                attach,
                error: ManifestError::Unreachable(format!("timed out: {}", url)),
            }
        }
    };

    let scrub_cues = async {
        let Some(index) = &request.thumbnails else {
            return Arc::<[ScrubCue]>::from(Vec::new());
        };
        match scrub::fetch_index(shared.loader.as_ref(), index).await {
            Ok(parsed) => parsed.into_shared(),
            Err(e) => {
                warn!(error = %e, "Scrub index unavailable, previews disabled");
                Arc::from(Vec::new())
            }
        }
    };
    let resume_position = async {
        match &request.content_id {
            Some(content_id) => shared.positions.load(content_id).await,
            None => None,
        }
    };
    let (scrub_cues, resume_position) = tokio::join!(scrub_cues, resume_position);

    Message::Attach(Box::new(PreparedAttach {
        attach,
        request,
        manifest,
        scrub_cues,
        resume_position,
    }))
}

/// Clonable front door to a running [`PlayerSession`]
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<Message>,
    events: broadcast::Sender<Notification>,
    stats: watch::Receiver<EngineStats>,
    shared: Arc<Shared>,
    /// Token of the attach currently being prepared
    preparing: Arc<Mutex<Option<CancellationToken>>>,
}

impl SessionHandle {
    fn send(&self, message: Message) -> Result<()> {
        self.tx.send(message).map_err(|_| Error::SessionClosed)
    }

    /// Subscribe to engine notifications
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.events.subscribe()
    }

    /// Latest statistics snapshot
    pub fn stats(&self) -> EngineStats {
        self.stats.borrow().clone()
    }

    /// Receiver updated after every processed message
    pub fn watch_stats(&self) -> watch::Receiver<EngineStats> {
        self.stats.clone()
    }

    /// Start loading new content. The current content keeps playing until
    /// the new manifest is in; a rejected manifest leaves it untouched.
    #[instrument(skip(self, request), fields(url = %request.url))]
    pub async fn attach(&self, request: AttachRequest) -> Result<AttachId> {
        let attach = AttachId::next();
        self.send(Message::AttachRequested(attach))?;
        info!(%attach, "Loading content");

        let token = CancellationToken::new();
        if let Some(previous) = self.preparing.lock().await.replace(token.clone()) {
            previous.cancel();
        }

        let shared = self.shared.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => debug!(%attach, "Attach preparation abandoned"),
                message = prepare(shared, attach, request) => {
                    let _ = tx.send(message);
                }
            }
        });
        Ok(attach)
    }

    /// Drop the current content and cancel everything in flight
    pub async fn detach(&self) -> Result<()> {
        if let Some(preparing) = self.preparing.lock().await.take() {
            preparing.cancel();
        }
        self.send(Message::Detach)
    }

    pub fn intent(&self, intent: Intent) -> Result<()> {
        self.send(Message::Intent(intent))
    }

    pub fn play(&self) -> Result<()> {
        self.intent(Intent::Play)
    }

    pub fn pause(&self) -> Result<()> {
        self.intent(Intent::Pause)
    }

    pub fn seek(&self, position: f64) -> Result<()> {
        self.intent(Intent::Seek(position))
    }

    pub fn set_rate(&self, rate: f64) -> Result<()> {
        self.intent(Intent::SetRate(rate))
    }

    pub fn set_volume(&self, volume: f64) -> Result<()> {
        self.intent(Intent::SetVolume(volume))
    }

    pub fn set_muted(&self, muted: bool) -> Result<()> {
        self.intent(Intent::SetMuted(muted))
    }

    pub fn set_quality(&self, selection: QualitySelection) -> Result<()> {
        self.intent(Intent::SetQuality(selection))
    }

    pub fn set_audio_conditioning(&self, enabled: bool) -> Result<()> {
        self.intent(Intent::SetAudioConditioning(enabled))
    }

    pub fn set_subtitles(&self, visible: bool) -> Result<()> {
        self.intent(Intent::SetSubtitles(visible))
    }

    pub fn skip_segment(&self) -> Result<()> {
        self.intent(Intent::SkipSegment)
    }

    pub fn toggle_picture_in_picture(&self) -> Result<()> {
        self.intent(Intent::TogglePictureInPicture)
    }

    /// Forward an asynchronous decoder fault raised by the host surface
    pub fn report_decode_error(&self, attach: AttachId, error: SinkError) -> Result<()> {
        self.send(Message::DecodeError { attach, error })
    }
}
