//! Platform seam: media surface, audio graph factory and capability probing
//!
//! Hosts implement [`Platform`] once. [`HeadlessPlatform`] backs the CLI and
//! tests with a [`VirtualSurface`] whose play head is driven by a monotonic
//! clock.

use crate::audio::{AudioGraph, CompressorSettings, SoftwareAudioGraph};
use crate::buffer::SegmentPayload;
use crate::error::SinkError;
use crate::types::{normalize_ranges, BufferedRange};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::debug;

/// Result of probing an optional platform feature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "mode", rename_all = "snake_case")]
pub enum Capability<M> {
    Supported(M),
    Unsupported,
}

impl<M: Copy> Capability<M> {
    pub fn mode(&self) -> Option<M> {
        match self {
            Capability::Supported(mode) => Some(*mode),
            Capability::Unsupported => None,
        }
    }

    pub fn is_supported(&self) -> bool {
        matches!(self, Capability::Supported(_))
    }
}

/// Picture-in-picture flavour offered by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipMode {
    /// Standard floating-window API
    Standard,
    /// Vendor presentation-mode switch
    Presentation,
}

/// Capabilities probed once per attach
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub picture_in_picture: Capability<PipMode>,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            picture_in_picture: Capability::Unsupported,
        }
    }
}

/// Playback surface: decoder plus render target
pub trait MediaSink: Send {
    /// Decode and queue one segment
    fn append(&mut self, segment: &SegmentPayload) -> Result<(), SinkError>;

    /// Drop decoded media in `[start, end)`
    fn evict(&mut self, start: f64, end: f64);

    /// Ranges the surface can currently play
    fn buffered(&self) -> Vec<BufferedRange>;

    /// Reset decode context for `level`, keeping buffered media
    fn reset(&mut self, level: usize);

    /// Current play head in seconds
    fn current_time(&self) -> f64;

    fn seek(&mut self, position: f64);

    fn set_playing(&mut self, playing: bool);

    fn set_rate(&mut self, rate: f64);

    fn set_volume(&mut self, volume: f64, muted: bool);

    fn set_subtitles_visible(&mut self, _visible: bool) {}

    fn set_picture_in_picture(&mut self, _mode: PipMode, _active: bool) -> Result<(), SinkError> {
        Err(SinkError::Unsupported("picture-in-picture".into()))
    }

    /// Free decoder resources; the surface is unusable afterwards
    fn release(&mut self);
}

/// Factory for per-attach resources
pub trait Platform: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    fn create_surface(&self) -> Result<Box<dyn MediaSink>, SinkError>;

    fn create_audio_graph(&self) -> Result<Box<dyn AudioGraph>, SinkError>;
}

/// Surface without a real decoder. Buffered ranges follow appends and
/// evictions; the play head advances at the current rate while playing
/// and stalls at the end of the buffered range it is in.
#[derive(Debug)]
pub struct VirtualSurface {
    ranges: Vec<BufferedRange>,
    anchor_position: f64,
    anchor_at: Option<Instant>,
    rate: f64,
    volume: f64,
    muted: bool,
    subtitles: bool,
    pip: Option<PipMode>,
    pip_supported: bool,
    appended_bytes: usize,
    released: bool,
}

impl VirtualSurface {
    pub fn new(pip_supported: bool) -> Self {
        Self {
            ranges: Vec::new(),
            anchor_position: 0.0,
            anchor_at: None,
            rate: 1.0,
            volume: 1.0,
            muted: false,
            subtitles: false,
            pip: None,
            pip_supported,
            appended_bytes: 0,
            released: false,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.anchor_at.is_some()
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn volume(&self) -> (f64, bool) {
        (self.volume, self.muted)
    }

    pub fn subtitles_visible(&self) -> bool {
        self.subtitles
    }

    pub fn picture_in_picture(&self) -> Option<PipMode> {
        self.pip
    }

    pub fn appended_bytes(&self) -> usize {
        self.appended_bytes
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    fn playable_end(&self, position: f64) -> f64 {
        self.ranges
            .iter()
            .find(|r| r.start <= position + crate::types::RANGE_GAP_TOLERANCE && position < r.end)
            .map(|r| r.end)
            .unwrap_or(position)
    }

    fn time_at(&self, now: Instant) -> f64 {
        match self.anchor_at {
            Some(at) => {
                let advanced =
                    self.anchor_position + now.duration_since(at).as_secs_f64() * self.rate;
                advanced.min(self.playable_end(self.anchor_position).max(self.anchor_position))
            }
            None => self.anchor_position,
        }
    }

    /// Re-anchor the clock so later rate or state changes start from here
    fn settle(&mut self) {
        let now = Instant::now();
        self.anchor_position = self.time_at(now);
        if self.anchor_at.is_some() {
            self.anchor_at = Some(now);
        }
    }
}

impl MediaSink for VirtualSurface {
    fn append(&mut self, segment: &SegmentPayload) -> Result<(), SinkError> {
        if self.released {
            return Err(SinkError::Unrecoverable("surface released".into()));
        }
        if segment.data.is_empty() {
            return Err(SinkError::Decode(format!(
                "segment {} at level {} carried no data",
                segment.index, segment.level
            )));
        }
        self.settle();
        let mut ranges = std::mem::take(&mut self.ranges);
        ranges.push(BufferedRange::new(segment.start, segment.start + segment.duration));
        self.ranges = normalize_ranges(ranges);
        self.appended_bytes += segment.data.len();
        Ok(())
    }

    fn evict(&mut self, start: f64, end: f64) {
        self.settle();
        let mut kept = Vec::with_capacity(self.ranges.len() + 1);
        for range in self.ranges.drain(..) {
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
        self.ranges = kept;
    }

    fn buffered(&self) -> Vec<BufferedRange> {
        self.ranges.clone()
    }

    fn reset(&mut self, level: usize) {
        debug!(level, "Virtual decoder reset");
        self.settle();
    }

    fn current_time(&self) -> f64 {
        self.time_at(Instant::now())
    }

    fn seek(&mut self, position: f64) {
        self.anchor_position = position.max(0.0);
        if self.anchor_at.is_some() {
            self.anchor_at = Some(Instant::now());
        }
    }

    fn set_playing(&mut self, playing: bool) {
        self.settle();
        self.anchor_at = playing.then(Instant::now);
    }

    fn set_rate(&mut self, rate: f64) {
        self.settle();
        self.rate = rate;
    }

    fn set_volume(&mut self, volume: f64, muted: bool) {
        self.volume = volume;
        self.muted = muted;
    }

    fn set_subtitles_visible(&mut self, visible: bool) {
        self.subtitles = visible;
    }

    fn set_picture_in_picture(&mut self, mode: PipMode, active: bool) -> Result<(), SinkError> {
        if !self.pip_supported {
            return Err(SinkError::Unsupported("picture-in-picture".into()));
        }
        self.pip = active.then_some(mode);
        Ok(())
    }

    fn release(&mut self) {
        self.settle();
        self.anchor_at = None;
        self.ranges.clear();
        self.released = true;
    }
}

/// Platform for hosts without a display or audio device
#[derive(Debug, Clone)]
pub struct HeadlessPlatform {
    pub picture_in_picture: Capability<PipMode>,
    pub sample_rate: u32,
    pub compressor: CompressorSettings,
}

impl Default for HeadlessPlatform {
    fn default() -> Self {
        Self {
            picture_in_picture: Capability::Unsupported,
            sample_rate: 48_000,
            compressor: CompressorSettings::default(),
        }
    }
}

impl Platform for HeadlessPlatform {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            picture_in_picture: self.picture_in_picture,
        }
    }

    fn create_surface(&self) -> Result<Box<dyn MediaSink>, SinkError> {
        Ok(Box::new(VirtualSurface::new(self.picture_in_picture.is_supported())))
    }

    fn create_audio_graph(&self) -> Result<Box<dyn AudioGraph>, SinkError> {
        Ok(Box::new(SoftwareAudioGraph::new(self.sample_rate, self.compressor)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn payload(index: usize, start: f64) -> SegmentPayload {
        SegmentPayload {
            level: 0,
            index,
            start,
            duration: 4.0,
            data: Bytes::from_static(&[0u8; 16]),
        }
    }

    #[test]
    fn test_append_and_evict_ranges() {
        let mut surface = VirtualSurface::new(false);
        surface.append(&payload(0, 0.0)).unwrap();
        surface.append(&payload(1, 4.0)).unwrap();
        surface.append(&payload(3, 12.0)).unwrap();
        assert_eq!(
            surface.buffered(),
            vec![BufferedRange::new(0.0, 8.0), BufferedRange::new(12.0, 16.0)]
        );

        surface.evict(0.0, 4.0);
        assert_eq!(
            surface.buffered(),
            vec![BufferedRange::new(4.0, 8.0), BufferedRange::new(12.0, 16.0)]
        );
    }

    #[test]
    fn test_empty_segment_is_decode_error() {
        let mut surface = VirtualSurface::new(false);
        let mut empty = payload(0, 0.0);
        empty.data = Bytes::new();
        assert!(matches!(surface.append(&empty), Err(SinkError::Decode(_))));
    }

    #[test]
    fn test_paused_head_does_not_move() {
        let mut surface = VirtualSurface::new(false);
        surface.append(&payload(0, 0.0)).unwrap();
        surface.seek(2.5);
        assert_eq!(surface.current_time(), 2.5);
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(surface.current_time(), 2.5);
    }

    #[test]
    fn test_playing_head_stalls_at_buffered_end() {
        let mut surface = VirtualSurface::new(false);
        let mut short = payload(0, 0.0);
        short.duration = 0.01;
        surface.append(&short).unwrap();
        surface.set_playing(true);
        std::thread::sleep(std::time::Duration::from_millis(30));
        assert!(surface.current_time() <= 0.01 + 1e-9);
    }

    #[test]
    fn test_pip_capability() {
        let headless = HeadlessPlatform::default();
        assert!(!headless.capabilities().picture_in_picture.is_supported());
        let mut surface = headless.create_surface().unwrap();
        assert!(surface.set_picture_in_picture(PipMode::Standard, true).is_err());

        let pip = HeadlessPlatform {
            picture_in_picture: Capability::Supported(PipMode::Standard),
            ..Default::default()
        };
        let mut surface = pip.create_surface().unwrap();
        assert!(surface.set_picture_in_picture(PipMode::Standard, true).is_ok());
    }
}
