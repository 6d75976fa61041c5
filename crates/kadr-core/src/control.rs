//! Control surface
//!
//! Folds engine notifications into a [`ControlView`], translates hotkeys
//! and pointer input into [`Intent`]s and owns the auxiliary timers
//! (auto-hide, sleep timer, hover preview debounce, click debounce).
//! Timers are plain deadlines; the host calls [`ControlSurface::poll`] at
//! or after [`ControlSurface::next_deadline`].

use crate::engine::{ErrorKind, Intent, Notification};
use crate::manifest::Level;
use crate::scrub::{self, PreviewFrame, ScrubCue};
use crate::types::{
    format_clock, BufferedRange, PlaybackState, QualitySelection, SkipMark, MAX_RATE, MIN_RATE,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Control surface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Hide controls this long after the last pointer activity while playing
    pub auto_hide_ms: u64,
    /// `j` / `l` seek distance in seconds
    pub seek_step: f64,
    /// `<` / `>` rate step
    pub rate_step: f64,
    pub hover_debounce_ms: u64,
    /// Window in which a second click turns into a double click
    pub click_debounce_ms: u64,
    /// Duration of the play/pause flash
    pub flash_ms: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            auto_hide_ms: 2_200,
            seek_step: 10.0,
            rate_step: 0.25,
            hover_debounce_ms: 100,
            click_debounce_ms: 180,
            flash_ms: 430,
        }
    }
}

/// A key press; space is `' '`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPress {
    pub key: char,
    pub alt: bool,
}

impl KeyPress {
    pub fn new(key: char) -> Self {
        Self { key, alt: false }
    }

    pub fn with_alt(key: char) -> Self {
        Self { key, alt: true }
    }
}

/// Sleep timer presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SleepTimer {
    #[default]
    Off,
    Min15,
    Min30,
    Min60,
}

impl SleepTimer {
    pub fn duration(&self) -> Option<Duration> {
        let minutes = match self {
            SleepTimer::Off => return None,
            SleepTimer::Min15 => 15,
            SleepTimer::Min30 => 30,
            SleepTimer::Min60 => 60,
        };
        Some(Duration::from_secs(minutes * 60))
    }

    pub fn label(&self) -> &'static str {
        match self {
            SleepTimer::Off => "Off",
            SleepTimer::Min15 => "15 min",
            SleepTimer::Min30 => "30 min",
            SleepTimer::Min60 => "60 min",
        }
    }
}

/// Centre-screen play/pause flash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Flash {
    Play,
    Pause,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBanner {
    pub kind: ErrorKind,
    pub message: String,
    pub fatal: bool,
}

/// Seek-bar hover preview
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Preview {
    pub time: f64,
    pub label: String,
    /// `None` when no cue covers `time`
    pub frame: Option<PreviewFrame>,
}

/// Everything a renderer needs
#[derive(Debug, Clone, Serialize)]
pub struct ControlView {
    pub state: PlaybackState,
    pub position: f64,
    pub duration: Option<f64>,
    pub buffered_pct: f64,
    pub progress_pct: f64,
    pub time_label: String,
    pub quality_label: String,
    pub quality_options: Vec<String>,
    pub skip: Option<SkipMark>,
    pub error: Option<ErrorBanner>,
    pub milestones: Vec<u8>,
    pub rate: f64,
    pub volume: f64,
    pub muted: bool,
    pub subtitles: bool,
    pub audio_conditioning: bool,
    pub pip_supported: bool,
    pub pip_active: bool,
    pub controls_visible: bool,
    pub fullscreen: bool,
    pub theater: bool,
    pub stats_visible: bool,
    pub sleep: SleepTimer,
    pub preview: Option<Preview>,
    pub flash: Option<Flash>,
}

impl Default for ControlView {
    fn default() -> Self {
        Self {
            state: PlaybackState::Idle,
            position: 0.0,
            duration: None,
            buffered_pct: 0.0,
            progress_pct: 0.0,
            time_label: "0:00".into(),
            quality_label: "Auto".into(),
            quality_options: Vec::new(),
            skip: None,
            error: None,
            milestones: Vec::new(),
            rate: 1.0,
            volume: 1.0,
            muted: false,
            subtitles: false,
            audio_conditioning: false,
            pip_supported: false,
            pip_active: false,
            controls_visible: true,
            fullscreen: false,
            theater: false,
            stats_visible: false,
            sleep: SleepTimer::Off,
            preview: None,
            flash: None,
        }
    }
}

/// UI adapter between a host and the engine
pub struct ControlSurface {
    config: ControlConfig,
    view: ControlView,
    levels: Vec<Level>,
    scrub_cues: Arc<[ScrubCue]>,
    buffered: Vec<BufferedRange>,
    hide_at: Option<Instant>,
    sleep_at: Option<Instant>,
    hover_at: Option<(f64, Instant)>,
    click_at: Option<Instant>,
    flash_until: Option<Instant>,
}

impl ControlSurface {
    pub fn new(config: ControlConfig) -> Self {
        Self {
            config,
            view: ControlView::default(),
            levels: Vec::new(),
            scrub_cues: Arc::from(Vec::new()),
            buffered: Vec::new(),
            hide_at: None,
            sleep_at: None,
            hover_at: None,
            click_at: None,
            flash_until: None,
        }
    }

    pub fn view(&self) -> &ControlView {
        &self.view
    }

    /// Fold one engine notification into the view
    pub fn apply(&mut self, notification: &Notification) {
        match notification {
            Notification::Attached {
                levels,
                scrub_cues,
                capabilities,
                skip_marks: _,
                ..
            } => {
                self.reset();
                self.levels = levels.clone();
                self.scrub_cues = scrub_cues.clone();
                self.view.pip_supported = capabilities.picture_in_picture.is_supported();
                self.view.quality_options = std::iter::once("Auto".to_string())
                    .chain(levels.iter().map(|l| l.label.clone()))
                    .collect();
            }
            Notification::DurationChanged { duration } => {
                self.view.duration = Some(*duration);
                self.refresh_progress();
            }
            Notification::StateChanged { to, .. } => {
                self.view.state = *to;
                if *to == PlaybackState::Playing {
                    self.view.error = self.view.error.take().filter(|e| e.fatal);
                } else {
                    self.view.controls_visible = true;
                    self.hide_at = None;
                }
            }
            Notification::PositionChanged { position } => {
                self.view.position = *position;
                self.refresh_progress();
            }
            Notification::BufferedChanged { ranges } => {
                self.buffered = ranges.clone();
                self.refresh_progress();
            }
            Notification::QualityChanged {
                selection, level, ..
            } => {
                let label = self
                    .levels
                    .iter()
                    .find(|l| l.index == *level)
                    .map(|l| l.label.as_str())
                    .unwrap_or("?");
                self.view.quality_label = match selection {
                    QualitySelection::Auto => format!("Auto ({})", label),
                    QualitySelection::Manual(_) => label.to_string(),
                };
            }
            Notification::Error {
                kind,
                message,
                fatal,
            } => {
                self.view.error = Some(ErrorBanner {
                    kind: *kind,
                    message: message.clone(),
                    fatal: *fatal,
                });
            }
            Notification::Milestone { percent } => self.view.milestones.push(*percent),
            Notification::SkipAvailable { mark } => self.view.skip = *mark,
            Notification::RateChanged { rate } => self.view.rate = *rate,
            Notification::VolumeChanged { volume, muted } => {
                self.view.volume = *volume;
                self.view.muted = *muted;
            }
            Notification::SubtitlesChanged { visible } => self.view.subtitles = *visible,
            Notification::AudioRoutingChanged { routing } => {
                self.view.audio_conditioning = routing.is_conditioned();
            }
            Notification::PictureInPictureChanged { active } => self.view.pip_active = *active,
            Notification::Detached { .. } => self.reset(),
        }
    }

    fn refresh_progress(&mut self) {
        let position = self.view.position;
        let buffered_end = self
            .buffered
            .iter()
            .find(|r| r.contains(position) || (r.start - position).abs() < f64::EPSILON)
            .map(|r| r.end)
            .unwrap_or(position);

        match self.view.duration.filter(|d| *d > 0.0) {
            Some(duration) => {
                self.view.progress_pct = (position / duration * 100.0).clamp(0.0, 100.0);
                self.view.buffered_pct = (buffered_end / duration * 100.0).clamp(0.0, 100.0);
                self.view.time_label =
                    format!("{} / {}", format_clock(position), format_clock(duration));
            }
            None => {
                self.view.progress_pct = 0.0;
                self.view.buffered_pct = 0.0;
                self.view.time_label = format_clock(position);
            }
        }
    }

    /// Clear per-content state and every pending timer. Preferences
    /// (rate, volume, subtitles, conditioning, layout) survive.
    pub fn reset(&mut self) {
        let previous = std::mem::take(&mut self.view);
        self.view.rate = previous.rate;
        self.view.volume = previous.volume;
        self.view.muted = previous.muted;
        self.view.subtitles = previous.subtitles;
        self.view.audio_conditioning = previous.audio_conditioning;
        self.view.fullscreen = previous.fullscreen;
        self.view.theater = previous.theater;
        self.view.stats_visible = previous.stats_visible;

        self.levels.clear();
        self.scrub_cues = Arc::from(Vec::new());
        self.buffered.clear();
        self.hide_at = None;
        self.sleep_at = None;
        self.hover_at = None;
        self.click_at = None;
        self.flash_until = None;
    }

    /// Translate a hotkey
    pub fn key(&mut self, press: KeyPress, now: Instant) -> Option<Intent> {
        self.pointer_activity(now);
        let view = &self.view;
        let step = self.config.seek_step;

        let intent = match (press.key, press.alt) {
            ('s', true) => {
                self.view.stats_visible = !self.view.stats_visible;
                return None;
            }
            (_, true) => return None,
            ('k', _) | (' ', _) => Some(self.toggle(now)),
            ('j', _) => Some(Intent::Seek((view.position - step).max(0.0))),
            ('l', _) => {
                let target = view.position + step;
                Some(Intent::Seek(view.duration.map_or(target, |d| target.min(d))))
            }
            ('m', _) => Some(Intent::SetMuted(!view.muted)),
            ('c', _) => Some(Intent::SetSubtitles(!view.subtitles)),
            ('>', _) => Some(Intent::SetRate(self.step_rate(1.0))),
            ('<', _) => Some(Intent::SetRate(self.step_rate(-1.0))),
            ('f', _) => {
                self.view.fullscreen = !self.view.fullscreen;
                None
            }
            ('t', _) => {
                self.view.theater = !self.view.theater;
                None
            }
            _ => None,
        };
        if let Some(intent) = &intent {
            debug!(key = %press.key, ?intent, "Hotkey");
        }
        intent
    }

    fn step_rate(&self, direction: f64) -> f64 {
        let step = self.config.rate_step;
        let next = self.view.rate + direction * step;
        ((next / step).round() * step).clamp(MIN_RATE, MAX_RATE)
    }

    fn toggle(&mut self, now: Instant) -> Intent {
        let (intent, flash) = if self.view.state == PlaybackState::Playing {
            (Intent::Pause, Flash::Pause)
        } else {
            (Intent::Play, Flash::Play)
        };
        self.view.flash = Some(flash);
        self.flash_until = Some(now + Duration::from_millis(self.config.flash_ms));
        intent
    }

    pub fn pointer_activity(&mut self, now: Instant) {
        self.view.controls_visible = true;
        self.hide_at = (self.view.state == PlaybackState::Playing)
            .then(|| now + Duration::from_millis(self.config.auto_hide_ms));
    }

    pub fn pointer_leave(&mut self) {
        if self.view.state == PlaybackState::Playing {
            self.view.controls_visible = false;
            self.hide_at = None;
        }
    }

    /// Pointer over the seek bar at `time`; the preview follows after the
    /// debounce
    pub fn hover(&mut self, time: f64, now: Instant) {
        self.hover_at = Some((time, now + Duration::from_millis(self.config.hover_debounce_ms)));
    }

    pub fn hover_end(&mut self) {
        self.hover_at = None;
        self.view.preview = None;
    }

    /// Click on the video; toggles playback unless a double click follows
    pub fn click(&mut self, now: Instant) {
        self.click_at = Some(now + Duration::from_millis(self.config.click_debounce_ms));
    }

    pub fn double_click(&mut self) {
        self.click_at = None;
        self.view.fullscreen = !self.view.fullscreen;
    }

    pub fn set_sleep(&mut self, timer: SleepTimer, now: Instant) {
        self.view.sleep = timer;
        self.sleep_at = timer.duration().map(|d| now + d);
    }

    /// Earliest pending timer
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.hide_at,
            self.sleep_at,
            self.hover_at.map(|(_, at)| at),
            self.click_at,
            self.flash_until,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Fire every timer due at `now`
    pub fn poll(&mut self, now: Instant) -> Vec<Intent> {
        let mut intents = Vec::new();

        if self.click_at.is_some_and(|at| at <= now) {
            self.click_at = None;
            intents.push(self.toggle(now));
        }
        if self.flash_until.is_some_and(|at| at <= now) {
            self.flash_until = None;
            self.view.flash = None;
        }
        if self.hide_at.is_some_and(|at| at <= now) {
            self.hide_at = None;
            self.view.controls_visible = false;
        }
        if let Some((time, at)) = self.hover_at {
            if at <= now {
                self.hover_at = None;
                self.view.preview = Some(Preview {
                    time,
                    label: format_clock(time),
                    frame: scrub::lookup(&self.scrub_cues, time).map(ScrubCue::frame),
                });
            }
        }
        if self.sleep_at.is_some_and(|at| at <= now) {
            self.sleep_at = None;
            self.view.sleep = SleepTimer::Off;
            debug!("Sleep timer elapsed");
            if self.view.state.is_active() || self.view.state == PlaybackState::Buffering {
                intents.push(Intent::Pause);
            }
        }
        intents
    }
}
