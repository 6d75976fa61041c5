//! Core types for Kadr

use crate::abr::AbrConfig;
use crate::buffer::BufferConfig;
use crate::control::ControlConfig;
use crate::error::{Error, Result};
use crate::recovery::RecoveryConfig;
use crate::resume::ResumeConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Unique identifier for a player session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one attach within an engine. Load results tagged with an
/// older id belong to detached content and are dropped on arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttachId(pub u64);

static NEXT_ATTACH: AtomicU64 = AtomicU64::new(1);

impl AttachId {
    pub fn next() -> Self {
        Self(NEXT_ATTACH.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for AttachId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "attach#{}", self.0)
    }
}

/// Player state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlaybackState {
    /// No content attached
    Idle,
    /// Manifest parsed, waiting for the first segment
    Attaching,
    /// Waiting for enough forward buffer
    Buffering,
    Playing,
    Paused,
    /// Waiting for the segment at the seek target
    Seeking,
    /// Reached the end of the current content
    Ended,
    /// Terminal until a fresh attach
    FatalError,
}

impl PlaybackState {
    /// Check if transition to target state is valid
    pub fn can_transition_to(&self, target: PlaybackState) -> bool {
        use PlaybackState::*;
        if target == Idle || target == FatalError {
            // detach and fatal faults are accepted from anywhere
            return *self != target || target == Idle;
        }
        matches!(
            (self, target),
            // From Idle
            (Idle, Attaching) |
            // From Attaching
            (Attaching, Buffering) |
            // From Buffering
            (Buffering, Playing) | (Buffering, Paused) | (Buffering, Seeking) |
            // From Playing
            (Playing, Paused) | (Playing, Buffering) | (Playing, Seeking) | (Playing, Ended) |
            // From Paused
            (Paused, Playing) | (Paused, Buffering) | (Paused, Seeking) |
            // From Seeking
            (Seeking, Seeking) | (Seeking, Playing) | (Seeking, Paused) |
            // From Ended
            (Ended, Seeking) |
            // From FatalError
            (FatalError, Attaching)
        )
    }

    /// States in which time-update ticks drive position bookkeeping
    pub fn is_active(&self) -> bool {
        matches!(self, PlaybackState::Playing | PlaybackState::Paused)
    }

    /// States from which a seek may be issued
    pub fn can_seek(&self) -> bool {
        matches!(
            self,
            PlaybackState::Playing
                | PlaybackState::Paused
                | PlaybackState::Buffering
                | PlaybackState::Seeking
                | PlaybackState::Ended
        )
    }
}

impl std::fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlaybackState::Idle => write!(f, "idle"),
            PlaybackState::Attaching => write!(f, "attaching"),
            PlaybackState::Buffering => write!(f, "buffering"),
            PlaybackState::Playing => write!(f, "playing"),
            PlaybackState::Paused => write!(f, "paused"),
            PlaybackState::Seeking => write!(f, "seeking"),
            PlaybackState::Ended => write!(f, "ended"),
            PlaybackState::FatalError => write!(f, "fatal_error"),
        }
    }
}

/// Quality selection mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QualitySelection {
    Auto,
    Manual(usize),
}

impl QualitySelection {
    pub fn is_auto(&self) -> bool {
        matches!(self, QualitySelection::Auto)
    }
}

impl std::fmt::Display for QualitySelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QualitySelection::Auto => write!(f, "auto"),
            QualitySelection::Manual(level) => write!(f, "level {}", level),
        }
    }
}

/// A contiguous buffered time span in seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BufferedRange {
    pub start: f64,
    pub end: f64,
}

impl BufferedRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }

    pub fn contains(&self, time: f64) -> bool {
        time >= self.start && time < self.end
    }
}

/// Gap below which two spans count as contiguous
pub const RANGE_GAP_TOLERANCE: f64 = 0.1;

/// Sort, drop empty spans and merge overlapping or touching spans.
pub fn normalize_ranges(mut ranges: Vec<BufferedRange>) -> Vec<BufferedRange> {
    ranges.retain(|r| r.end > r.start && r.start.is_finite() && r.end.is_finite());
    ranges.sort_by(|a, b| a.start.total_cmp(&b.start));

    let mut merged: Vec<BufferedRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(last) if range.start - last.end < RANGE_GAP_TOLERANCE => {
                last.end = last.end.max(range.end);
            }
            _ => merged.push(range),
        }
    }
    merged
}

/// Total seconds covered by a set of ranges
pub fn covered_duration(ranges: &[BufferedRange]) -> f64 {
    ranges.iter().map(BufferedRange::duration).sum()
}

/// Playback rate bounds
pub const MIN_RATE: f64 = 0.25;
pub const MAX_RATE: f64 = 2.0;

/// Kind of a skippable segment of the content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkipKind {
    Intro,
    Outro,
}

/// Caller-declared skippable interval
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SkipMark {
    pub kind: SkipKind,
    pub start: f64,
    pub end: f64,
}

impl SkipMark {
    pub fn new(kind: SkipKind, start: f64, end: f64) -> Self {
        Self { kind, start, end }
    }

    /// Check if the affordance should be shown at `time`
    pub fn contains_time(&self, time: f64) -> bool {
        time >= self.start && time < self.end
    }

    /// Label for the skip button
    pub fn label(&self) -> &'static str {
        match self.kind {
            SkipKind::Intro => "Skip intro",
            SkipKind::Outro => "Skip outro",
        }
    }
}

/// Format seconds as `m:ss` or `h:mm:ss`
pub fn format_clock(seconds: f64) -> String {
    let total = if seconds.is_finite() { seconds.max(0.0).floor() as u64 } else { 0 };
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{}:{:02}:{:02}", h, m, s)
    } else {
        format!("{}:{:02}", m, s)
    }
}

/// Player configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Start playing as soon as enough is buffered
    pub autoplay: bool,
    /// Per-request timeout for playlist and segment loads
    pub request_timeout_ms: u64,
    /// Period of the time-update tick driven by the session
    pub tick_interval_ms: u64,
    /// Distance from the end at which playback counts as ended (seconds)
    pub end_epsilon: f64,
    /// Watch milestones in percent
    pub milestones: Vec<u8>,
    pub buffer: BufferConfig,
    pub abr: AbrConfig,
    pub recovery: RecoveryConfig,
    pub resume: ResumeConfig,
    pub controls: ControlConfig,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            autoplay: false,
            request_timeout_ms: 10_000,
            tick_interval_ms: 250,
            end_epsilon: 0.5,
            milestones: vec![25, 50, 75, 95],
            buffer: BufferConfig::default(),
            abr: AbrConfig::default(),
            recovery: RecoveryConfig::default(),
            resume: ResumeConfig::default(),
            controls: ControlConfig::default(),
        }
    }
}

impl PlayerConfig {
    /// Load configuration overrides from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: PlayerConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> Result<()> {
        let b = &self.buffer;
        if b.min_buffer_time <= 0.0 || b.max_buffer_length < b.min_buffer_time {
            return Err(Error::InvalidConfig(format!(
                "buffer: need 0 < min_buffer_time ({}) <= max_buffer_length ({})",
                b.min_buffer_time, b.max_buffer_length
            )));
        }
        if b.rebuffer_threshold < 0.0 || b.rebuffer_threshold > b.min_buffer_time {
            return Err(Error::InvalidConfig(format!(
                "buffer: rebuffer_threshold ({}) must lie in [0, min_buffer_time]",
                b.rebuffer_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.abr.safety_factor) || self.abr.safety_factor == 0.0 {
            return Err(Error::InvalidConfig(format!(
                "abr: safety_factor {} must lie in (0, 1]",
                self.abr.safety_factor
            )));
        }
        if self.abr.stable_ticks == 0 {
            return Err(Error::InvalidConfig("abr: stable_ticks must be >= 1".into()));
        }
        if self.tick_interval_ms == 0 || self.request_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "tick_interval_ms and request_timeout_ms must be non-zero".into(),
            ));
        }
        if let Some(m) = self.milestones.iter().find(|m| **m == 0 || **m > 100) {
            return Err(Error::InvalidConfig(format!("milestone {}% out of range", m)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_merges_and_sorts() {
        let ranges = vec![
            BufferedRange::new(20.0, 24.0),
            BufferedRange::new(0.0, 4.0),
            BufferedRange::new(4.05, 8.0),
            BufferedRange::new(6.0, 7.0),
            BufferedRange::new(9.0, 9.0),
        ];
        let merged = normalize_ranges(ranges);
        assert_eq!(merged, vec![BufferedRange::new(0.0, 8.0), BufferedRange::new(20.0, 24.0)]);
        assert!((covered_duration(&merged) - 12.0).abs() < 1e-9);
    }

    #[test]
    fn test_detach_and_fatal_from_anywhere() {
        for state in [
            PlaybackState::Attaching,
            PlaybackState::Buffering,
            PlaybackState::Playing,
            PlaybackState::Seeking,
            PlaybackState::Ended,
        ] {
            assert!(state.can_transition_to(PlaybackState::Idle));
            assert!(state.can_transition_to(PlaybackState::FatalError));
        }
        assert!(!PlaybackState::FatalError.can_transition_to(PlaybackState::FatalError));
        assert!(!PlaybackState::FatalError.can_transition_to(PlaybackState::Playing));
    }

    #[test]
    fn test_format_clock() {
        assert_eq!(format_clock(0.0), "0:00");
        assert_eq!(format_clock(75.9), "1:15");
        assert_eq!(format_clock(3725.0), "1:02:05");
        assert_eq!(format_clock(-3.0), "0:00");
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(PlayerConfig::default().validate().is_ok());

        let mut config = PlayerConfig::default();
        config.abr.safety_factor = 1.5;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }
}
