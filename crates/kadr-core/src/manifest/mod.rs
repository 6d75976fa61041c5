//! Manifest model: quality levels of a master playlist and the segment
//! timeline of each variant playlist.

mod hls;

pub use hls::{parse_manifest, parse_media_playlist, HlsParser};

use crate::error::ManifestError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use url::Url;

/// One quality rendition of the content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Level {
    /// Stable index for the lifetime of the session
    pub index: usize,
    pub width: u32,
    pub height: u32,
    /// Advertised bandwidth in bits per second
    pub bandwidth: u64,
    /// Human-readable label, never empty
    pub label: String,
    pub codecs: Option<String>,
    /// Variant playlist URI
    pub uri: Url,
}

/// Parsed master manifest
#[derive(Debug, Clone)]
pub struct Manifest {
    url: Url,
    levels: Vec<Level>,
    /// Set when the entry URL was itself a media playlist
    inline_playlist: Option<MediaPlaylist>,
}

impl Manifest {
    /// Build a manifest, enforcing unique indices and at least one level
    pub fn new(url: Url, levels: Vec<Level>) -> Result<Self, ManifestError> {
        if levels.is_empty() {
            return Err(ManifestError::Empty);
        }
        let mut seen = HashSet::with_capacity(levels.len());
        for level in &levels {
            if !seen.insert(level.index) {
                return Err(ManifestError::Malformed(format!(
                    "duplicate level index {}",
                    level.index
                )));
            }
        }
        Ok(Self {
            url,
            levels,
            inline_playlist: None,
        })
    }

    pub(crate) fn with_inline_playlist(mut self, playlist: MediaPlaylist) -> Self {
        self.inline_playlist = Some(playlist);
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Levels ordered by ascending bandwidth
    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    pub fn level(&self, index: usize) -> Option<&Level> {
        self.levels.iter().find(|l| l.index == index)
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Media playlist parsed from the entry URL, if it was not a master
    pub fn inline_playlist(&self) -> Option<&MediaPlaylist> {
        self.inline_playlist.as_ref()
    }
}

/// Byte range for partial segment requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub length: u64,
}

impl ByteRange {
    pub fn end(&self) -> u64 {
        self.start + self.length.saturating_sub(1)
    }

    /// Value for an HTTP `Range` header
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end())
    }
}

/// One media segment on the content timeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentInfo {
    /// Position in the playlist, shared across aligned levels
    pub index: usize,
    /// Media sequence number
    pub sequence: u64,
    /// Start time in seconds
    pub start: f64,
    pub duration: f64,
    pub uri: Url,
    pub byte_range: Option<ByteRange>,
}

impl SegmentInfo {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// Parsed variant playlist of one level
#[derive(Debug, Clone, PartialEq)]
pub struct MediaPlaylist {
    pub level: usize,
    pub segments: Vec<SegmentInfo>,
    pub target_duration: f64,
    /// `#EXT-X-ENDLIST` seen
    pub ended: bool,
}

impl MediaPlaylist {
    /// Total duration for VOD playlists
    pub fn duration(&self) -> Option<f64> {
        if self.ended {
            Some(self.segments.last().map(SegmentInfo::end).unwrap_or(0.0))
        } else {
            None
        }
    }

    /// Index of the segment whose `[start, end)` contains `time`
    pub fn index_at(&self, time: f64) -> Option<usize> {
        let after = self.segments.partition_point(|s| s.start <= time);
        let candidate = self.segments.get(after.checked_sub(1)?)?;
        (time < candidate.end()).then_some(candidate.index)
    }

    pub fn segment(&self, index: usize) -> Option<&SegmentInfo> {
        self.segments.get(index)
    }

    /// Relabel for another level, keeping the timeline
    pub(crate) fn for_level(mut self, level: usize) -> Self {
        self.level = level;
        self
    }
}

/// Rewrite the legacy sibling `index.m3u8` entry point to `master.m3u8`.
pub fn normalize_manifest_url(url: &Url) -> Url {
    let mut normalized = url.clone();
    let rewritten = url.path_segments().and_then(|segments| {
        let segments: Vec<&str> = segments.collect();
        match segments.last() {
            Some(last) if last.eq_ignore_ascii_case("index.m3u8") => {
                let mut parts = segments[..segments.len() - 1].to_vec();
                parts.push("master.m3u8");
                Some(format!("/{}", parts.join("/")))
            }
            _ => None,
        }
    });
    if let Some(path) = rewritten {
        normalized.set_path(&path);
    }
    normalized
}
