//! Buffer management for video playback
//!
//! Handles:
//! - Forward horizon bookkeeping (which timeline index to fetch next)
//! - Appending segments to the media surface
//! - Back-buffer and memory-pressure eviction
//! - The buffered-range snapshot, refreshed from the surface

use crate::error::SinkError;
use crate::manifest::MediaPlaylist;
use crate::platform::MediaSink;
use crate::types::{normalize_ranges, BufferedRange, RANGE_GAP_TOLERANCE};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, instrument, warn};

/// Fetched segment ready to be appended
#[derive(Debug, Clone)]
pub struct SegmentPayload {
    pub level: usize,
    /// Timeline index, shared across aligned levels
    pub index: usize,
    pub start: f64,
    pub duration: f64,
    pub data: Bytes,
}

impl SegmentPayload {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// Buffer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Forward buffer required to leave `Buffering` (seconds)
    pub min_buffer_time: f64,
    /// Forward horizon kept filled (seconds)
    pub max_buffer_length: f64,
    /// Media kept behind the play head (seconds)
    pub back_buffer_length: f64,
    /// Lead below which playback stalls into `Buffering` (seconds)
    pub rebuffer_threshold: f64,
    /// Maximum appended bytes before evicting behind the play head
    pub max_memory_bytes: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            min_buffer_time: 6.0,
            max_buffer_length: 30.0,
            back_buffer_length: 120.0,
            rebuffer_threshold: 2.0,
            max_memory_bytes: 256 * 1024 * 1024, // 256 MB
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct TrackedSegment {
    level: usize,
    start: f64,
    end: f64,
    bytes: usize,
}

/// Owns the media surface of one attach and its buffer bookkeeping
pub struct BufferManager {
    config: BufferConfig,
    sink: Box<dyn MediaSink>,
    /// Appended segments keyed by timeline index
    segments: BTreeMap<usize, TrackedSegment>,
    ranges: Vec<BufferedRange>,
    memory_used: usize,
    in_flight: Option<usize>,
}

impl BufferManager {
    pub fn new(config: BufferConfig, sink: Box<dyn MediaSink>) -> Self {
        Self {
            config,
            sink,
            segments: BTreeMap::new(),
            ranges: Vec::new(),
            memory_used: 0,
            in_flight: None,
        }
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    pub fn sink(&self) -> &dyn MediaSink {
        self.sink.as_ref()
    }

    pub fn sink_mut(&mut self) -> &mut dyn MediaSink {
        self.sink.as_mut()
    }

    /// Append a segment; re-appending an index at another level replaces it.
    #[instrument(skip(self, payload), fields(level = payload.level, index = payload.index))]
    pub fn append(&mut self, payload: &SegmentPayload) -> Result<(), SinkError> {
        self.sink.append(payload)?;

        let tracked = TrackedSegment {
            level: payload.level,
            start: payload.start,
            end: payload.end(),
            bytes: payload.data.len(),
        };
        if let Some(previous) = self.segments.insert(payload.index, tracked) {
            self.memory_used = self.memory_used.saturating_sub(previous.bytes);
            if previous.level != payload.level {
                debug!(from = previous.level, "Replaced segment at new level");
            }
        }
        self.memory_used += tracked.bytes;
        self.refresh();

        debug!(
            bytes = tracked.bytes,
            memory_used = self.memory_used,
            ranges = self.ranges.len(),
            "Segment appended"
        );
        Ok(())
    }

    /// Re-read the surface's ranges. Returns true when the snapshot changed.
    pub fn refresh(&mut self) -> bool {
        let ranges = normalize_ranges(self.sink.buffered());
        // forget indices the surface no longer holds
        let before = self.segments.len();
        self.segments.retain(|_, seg| {
            let mid = (seg.start + seg.end) / 2.0;
            ranges.iter().any(|r| r.contains(mid))
        });
        if self.segments.len() != before {
            self.memory_used = self.segments.values().map(|s| s.bytes).sum();
        }

        let changed = ranges != self.ranges;
        self.ranges = ranges;
        changed
    }

    /// Current snapshot: ascending, non-overlapping
    pub fn buffered_ranges(&self) -> &[BufferedRange] {
        &self.ranges
    }

    /// Seconds buffered ahead of `position` in the range containing it
    pub fn lead(&self, position: f64) -> f64 {
        self.range_at(position)
            .map(|r| (r.end - position).max(0.0))
            .unwrap_or(0.0)
    }

    /// End of the range containing `position`
    pub fn buffered_end(&self, position: f64) -> Option<f64> {
        self.range_at(position).map(|r| r.end)
    }

    fn range_at(&self, position: f64) -> Option<&BufferedRange> {
        self.ranges
            .iter()
            .find(|r| r.start <= position + RANGE_GAP_TOLERANCE && position < r.end)
    }

    pub fn is_buffered(&self, index: usize) -> bool {
        self.segments.contains_key(&index)
    }

    /// Level an index was appended at
    pub fn level_of(&self, index: usize) -> Option<usize> {
        self.segments.get(&index).map(|s| s.level)
    }

    /// Every segment from `position` to the end of `playlist` is appended
    pub fn is_complete_from(
        &self,
        playlist: &MediaPlaylist,
        position: f64,
        excluded: &BTreeSet<usize>,
    ) -> bool {
        playlist.ended
            && playlist
                .segments
                .iter()
                .filter(|s| s.end() > position + RANGE_GAP_TOLERANCE)
                .all(|s| self.is_buffered(s.index) || excluded.contains(&s.index))
    }

    /// Next timeline index to fetch, if the horizon needs filling and no
    /// fetch is outstanding. Indices in `excluded` are stepped over.
    pub fn next_fetch(
        &self,
        playlist: &MediaPlaylist,
        position: f64,
        excluded: &BTreeSet<usize>,
    ) -> Option<usize> {
        if self.in_flight.is_some() {
            return None;
        }
        let horizon = position + self.config.max_buffer_length;
        let first = match playlist.index_at(position) {
            Some(index) => index,
            // before the first segment, or at/after the end
            None if position < playlist.segments.first()?.start => 0,
            None => return None,
        };

        playlist.segments[first..]
            .iter()
            .take_while(|s| s.start < horizon)
            .find(|s| !self.is_buffered(s.index) && !excluded.contains(&s.index))
            .map(|s| s.index)
    }

    pub fn begin_fetch(&mut self, index: usize) {
        self.in_flight = Some(index);
    }

    pub fn end_fetch(&mut self) {
        self.in_flight = None;
    }

    pub fn in_flight(&self) -> Option<usize> {
        self.in_flight
    }

    /// Drop media older than the back-buffer bound, then enforce the
    /// memory cap. Returns true when anything was evicted.
    pub fn evict(&mut self, position: f64) -> bool {
        let cutoff = position - self.config.back_buffer_length;
        let stale: Vec<usize> = self
            .segments
            .iter()
            .filter(|(_, seg)| seg.end <= cutoff)
            .map(|(&index, _)| index)
            .collect();
        let mut evicted = self.remove(&stale);

        if self.memory_used > self.config.max_memory_bytes {
            let mut behind = Vec::new();
            let mut projected = self.memory_used;
            for (&index, seg) in &self.segments {
                if projected <= self.config.max_memory_bytes || seg.end > position {
                    break;
                }
                projected = projected.saturating_sub(seg.bytes);
                behind.push(index);
            }
            if projected > self.config.max_memory_bytes {
                warn!(
                    memory_used = self.memory_used,
                    limit = self.config.max_memory_bytes,
                    "Memory cap exceeded with nothing left behind the play head"
                );
            }
            evicted |= self.remove(&behind);
        }

        if evicted {
            self.refresh();
        }
        evicted
    }

    fn remove(&mut self, indices: &[usize]) -> bool {
        for index in indices {
            if let Some(seg) = self.segments.remove(index) {
                self.sink.evict(seg.start, seg.end);
                self.memory_used = self.memory_used.saturating_sub(seg.bytes);
                debug!(index, start = seg.start, end = seg.end, "Evicted segment");
            }
        }
        !indices.is_empty()
    }

    pub fn memory_used(&self) -> usize {
        self.memory_used
    }

    /// Release the surface at detach
    pub fn release(&mut self) {
        self.segments.clear();
        self.ranges.clear();
        self.memory_used = 0;
        self.in_flight = None;
        self.sink.release();
    }
}
