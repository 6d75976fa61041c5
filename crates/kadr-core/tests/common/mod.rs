//! Shared fakes for integration tests

#![allow(dead_code)]

use bytes::Bytes;
use kadr_core::audio::{AudioGraph, AudioRouting, CompressorSettings, SoftwareAudioGraph};
use kadr_core::engine::{LoadTicket, PreparedAttach};
use kadr_core::manifest::{parse_manifest, parse_media_playlist};
use kadr_core::platform::{Capabilities, Capability, MediaSink, PipMode, Platform};
use kadr_core::{
    normalize_ranges, AttachId, AttachRequest, BufferedRange, Command, Message, Notification,
    PlaybackEngine, PlayerConfig, SegmentPayload, SegmentRequest, SinkError,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

pub const MASTER: &str = "#EXTM3U
#EXT-X-VERSION:3
#EXT-X-STREAM-INF:BANDWIDTH=500000,RESOLUTION=426x240
240p.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=2500000,RESOLUTION=1280x720
720p.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=5000000,RESOLUTION=1920x1080
1080p.m3u8
";

pub fn master_url() -> Url {
    Url::parse("https://cdn.example.com/show/master.m3u8").unwrap()
}

/// VOD media playlist of `count` segments of `duration` seconds
pub fn media_playlist(count: usize, duration: f64) -> String {
    let mut text = format!(
        "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:{}\n#EXT-X-MEDIA-SEQUENCE:0\n",
        duration.ceil() as u64
    );
    for i in 0..count {
        text.push_str(&format!("#EXTINF:{:.3},\nseg{}.ts\n", duration, i));
    }
    text.push_str("#EXT-X-ENDLIST\n");
    text
}

/// Decoder state shared between a test and the surface it handed out
#[derive(Debug, Default)]
pub struct SurfaceState {
    pub ranges: Vec<BufferedRange>,
    pub time: f64,
    pub playing: bool,
    pub rate: f64,
    pub volume: f64,
    pub muted: bool,
    pub resets: Vec<usize>,
    pub appended: Vec<(usize, usize)>,
    /// Errors returned by the next appends, in order
    pub fail_next: VecDeque<SinkError>,
    pub pip: Option<PipMode>,
    pub released: bool,
}

/// Surface whose clock only moves when the test says so
pub struct ScriptedSurface {
    state: Arc<Mutex<SurfaceState>>,
}

impl MediaSink for ScriptedSurface {
    fn append(&mut self, segment: &SegmentPayload) -> Result<(), SinkError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.fail_next.pop_front() {
            return Err(err);
        }
        let mut ranges = std::mem::take(&mut state.ranges);
        ranges.push(BufferedRange::new(segment.start, segment.end()));
        state.ranges = normalize_ranges(ranges);
        state.appended.push((segment.level, segment.index));
        Ok(())
    }

    fn evict(&mut self, start: f64, end: f64) {
        let mut state = self.state.lock().unwrap();
        let mut kept = Vec::new();
        for range in state.ranges.drain(..) {
            if range.end <= start || range.start >= end {
                kept.push(range);
                continue;
            }
            if range.start < start {
                kept.push(BufferedRange::new(range.start, start));
            }
            if range.end > end {
                kept.push(BufferedRange::new(end, range.end));
            }
        }
        state.ranges = kept;
    }

    fn buffered(&self) -> Vec<BufferedRange> {
        self.state.lock().unwrap().ranges.clone()
    }

    fn reset(&mut self, level: usize) {
        self.state.lock().unwrap().resets.push(level);
    }

    fn current_time(&self) -> f64 {
        self.state.lock().unwrap().time
    }

    fn seek(&mut self, position: f64) {
        self.state.lock().unwrap().time = position;
    }

    fn set_playing(&mut self, playing: bool) {
        self.state.lock().unwrap().playing = playing;
    }

    fn set_rate(&mut self, rate: f64) {
        self.state.lock().unwrap().rate = rate;
    }

    fn set_volume(&mut self, volume: f64, muted: bool) {
        let mut state = self.state.lock().unwrap();
        state.volume = volume;
        state.muted = muted;
    }

    fn set_picture_in_picture(&mut self, mode: PipMode, active: bool) -> Result<(), SinkError> {
        self.state.lock().unwrap().pip = active.then_some(mode);
        Ok(())
    }

    fn release(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.released = true;
        state.ranges.clear();
    }
}

/// Audio graph that cannot build the conditioned path
pub struct DryOnlyGraph(SoftwareAudioGraph);

impl AudioGraph for DryOnlyGraph {
    fn connect(&mut self, routing: AudioRouting) -> Result<(), SinkError> {
        if routing.is_conditioned() {
            return Err(SinkError::Unrecoverable("compressor node unavailable".into()));
        }
        self.0.connect(routing)
    }

    fn disconnect(&mut self) {
        self.0.disconnect();
    }

    fn close(&mut self) {
        self.0.close();
    }
}

/// Platform handing out scripted surfaces and counting audio graphs
#[derive(Default)]
pub struct ScriptedPlatform {
    pub pip: Option<PipMode>,
    pub dry_audio_only: bool,
    pub surfaces: Mutex<Vec<Arc<Mutex<SurfaceState>>>>,
    pub audio_graphs: AtomicUsize,
}

impl ScriptedPlatform {
    pub fn with_pip(mode: PipMode) -> Self {
        Self {
            pip: Some(mode),
            ..Default::default()
        }
    }

    /// State of the most recently created surface
    pub fn surface(&self) -> Arc<Mutex<SurfaceState>> {
        self.surfaces.lock().unwrap().last().cloned().unwrap()
    }

    pub fn audio_graphs(&self) -> usize {
        self.audio_graphs.load(Ordering::SeqCst)
    }
}

impl Platform for ScriptedPlatform {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            picture_in_picture: match self.pip {
                Some(mode) => Capability::Supported(mode),
                None => Capability::Unsupported,
            },
        }
    }

    fn create_surface(&self) -> Result<Box<dyn MediaSink>, SinkError> {
        let state = Arc::new(Mutex::new(SurfaceState {
            rate: 1.0,
            volume: 1.0,
            ..Default::default()
        }));
        self.surfaces.lock().unwrap().push(state.clone());
        Ok(Box::new(ScriptedSurface { state }))
    }

    fn create_audio_graph(&self) -> Result<Box<dyn AudioGraph>, SinkError> {
        self.audio_graphs.fetch_add(1, Ordering::SeqCst);
        let graph = SoftwareAudioGraph::new(48_000, CompressorSettings::default());
        if self.dry_audio_only {
            return Ok(Box::new(DryOnlyGraph(graph)));
        }
        Ok(Box::new(graph))
    }
}

/// Engine plus fakes, answering loads on demand
pub struct Harness {
    pub engine: PlaybackEngine,
    pub platform: Arc<ScriptedPlatform>,
    pub commands: Vec<Command>,
    pub events: Vec<Notification>,
    pub attach: Option<AttachId>,
    pub segments: usize,
    pub segment_duration: f64,
}

impl Harness {
    pub fn new(config: PlayerConfig) -> Self {
        Self::with_platform(config, ScriptedPlatform::default())
    }

    pub fn with_platform(config: PlayerConfig, platform: ScriptedPlatform) -> Self {
        let platform = Arc::new(platform);
        Self {
            engine: PlaybackEngine::new(config, platform.clone()),
            platform,
            commands: Vec::new(),
            events: Vec::new(),
            attach: None,
            segments: 20,
            segment_duration: 4.0,
        }
    }

    pub fn request() -> AttachRequest {
        AttachRequest::new(master_url())
    }

    pub fn send(&mut self, message: Message) -> Vec<Command> {
        let commands = self.engine.handle(message);
        self.events.extend(self.engine.drain_notifications());
        self.commands.extend(commands.iter().cloned());
        commands
    }

    /// Attach the three-level master with `request` and an optional stored position
    pub fn attach_with(&mut self, request: AttachRequest, resume: Option<f64>) -> Vec<Command> {
        let id = AttachId::next();
        self.attach = Some(id);
        self.send(Message::AttachRequested(id));
        let manifest = parse_manifest(MASTER, &master_url()).unwrap();
        self.send(Message::Attach(Box::new(PreparedAttach {
            attach: id,
            request,
            manifest,
            scrub_cues: Arc::from(Vec::new()),
            resume_position: resume,
        })))
    }

    pub fn attach(&mut self) -> Vec<Command> {
        self.attach_with(Self::request(), None)
    }

    /// Answer a variant load with the harness timeline
    pub fn load_variant(&mut self, ticket: LoadTicket) -> Vec<Command> {
        let url = Url::parse(&format!("https://cdn.example.com/show/{}.m3u8", ticket.level)).unwrap();
        let playlist =
            parse_media_playlist(&media_playlist(self.segments, self.segment_duration), &url, ticket.level)
                .unwrap();
        self.send(Message::VariantLoaded {
            ticket,
            result: Ok(playlist),
        })
    }

    pub fn deliver(&mut self, ticket: LoadTicket, bytes: usize, elapsed: Duration) -> Vec<Command> {
        self.send(Message::SegmentLoaded {
            ticket,
            result: Ok(Bytes::from(vec![0u8; bytes])),
            elapsed,
        })
    }

    /// Answer loads found in `commands` until no new work appears
    pub fn pump(&mut self, commands: Vec<Command>) {
        self.pump_with(commands, 100_000, Duration::from_millis(500));
    }

    /// Like [`Harness::pump`], every segment taking `elapsed` for `bytes`
    pub fn pump_with(&mut self, mut commands: Vec<Command>, bytes: usize, elapsed: Duration) {
        for _ in 0..64 {
            let mut next = Vec::new();
            for command in commands {
                match command {
                    Command::LoadVariant { ticket, .. } => next.extend(self.load_variant(ticket)),
                    Command::FetchSegment { ticket, .. } => {
                        next.extend(self.deliver(ticket, bytes, elapsed))
                    }
                    _ => {}
                }
            }
            if next.is_empty() {
                return;
            }
            commands = next;
        }
    }

    /// Attach and fill the forward buffer
    pub fn attach_and_buffer(&mut self) {
        let commands = self.attach();
        self.pump(commands);
    }

    pub fn tick(&mut self) -> Vec<Command> {
        self.send(Message::Tick {
            at: std::time::Instant::now(),
        })
    }

    pub fn set_time(&self, time: f64) {
        self.platform.surface().lock().unwrap().time = time;
    }

    pub fn take_events(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.events)
    }
}

pub fn fetches(commands: &[Command]) -> Vec<(LoadTicket, SegmentRequest, Duration)> {
    commands
        .iter()
        .filter_map(|c| match c {
            Command::FetchSegment {
                ticket,
                request,
                delay,
            } => Some((*ticket, request.clone(), *delay)),
            _ => None,
        })
        .collect()
}

pub fn variant_loads(commands: &[Command]) -> Vec<LoadTicket> {
    commands
        .iter()
        .filter_map(|c| match c {
            Command::LoadVariant { ticket, .. } => Some(*ticket),
            _ => None,
        })
        .collect()
}
