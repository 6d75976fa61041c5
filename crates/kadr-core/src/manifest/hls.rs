//! HLS (HTTP Live Streaming) playlist parsing
//!
//! Implements parsing for:
//! - Master playlists (multivariant), one level per non-I-frame variant
//! - Media playlists (segment timeline, byte ranges, ENDLIST)
//! - Media playlists used directly as the entry point

use super::{ByteRange, Level, Manifest, MediaPlaylist, SegmentInfo};
use crate::error::{Error, ManifestError, Result};
use crate::loader::Loader;
use m3u8_rs::{MasterPlaylist, MediaPlaylist as M3u8MediaPlaylist};
use std::sync::Arc;
use tracing::{debug, instrument};
use url::Url;

/// HLS manifest loader on top of a [`Loader`]
#[derive(Clone)]
pub struct HlsParser {
    loader: Arc<dyn Loader>,
}

impl HlsParser {
    pub fn new(loader: Arc<dyn Loader>) -> Self {
        Self { loader }
    }

    /// Fetch and parse the manifest at `url`
    #[instrument(skip(self))]
    pub async fn load(&self, url: &Url) -> std::result::Result<Manifest, ManifestError> {
        debug!("Fetching HLS manifest: {}", url);
        let content = self.loader.fetch_text(url).await?;
        parse_manifest(&content, url)
    }

    /// Fetch and parse the variant playlist of level `level` at `url`
    #[instrument(skip(self))]
    pub async fn load_variant(&self, url: &Url, level: usize) -> Result<MediaPlaylist> {
        debug!("Fetching HLS variant playlist: {}", url);
        let content = self.loader.fetch_text(url).await?;
        parse_media_playlist(&content, url, level).map_err(Error::from)
    }
}

/// Parse manifest text fetched from `url`.
///
/// A media playlist handed in directly becomes a single synthetic level.
pub fn parse_manifest(content: &str, url: &Url) -> std::result::Result<Manifest, ManifestError> {
    ensure_m3u(content)?;

    if content.contains("#EXT-X-STREAM-INF") {
        let parsed = m3u8_rs::parse_master_playlist_res(content.as_bytes())
            .map_err(|e| ManifestError::Malformed(format!("HLS master: {:?}", e)))?;
        let levels = extract_levels(&parsed, url)?;
        Manifest::new(url.clone(), levels)
    } else {
        let playlist = parse_media_playlist(content, url, 0)?;
        if playlist.segments.is_empty() {
            return Err(ManifestError::Empty);
        }
        let level = Level {
            index: 0,
            width: 0,
            height: 0,
            bandwidth: 0,
            label: "default".to_string(),
            codecs: None,
            uri: url.clone(),
        };
        Ok(Manifest::new(url.clone(), vec![level])?.with_inline_playlist(playlist))
    }
}

/// Parse a variant playlist into a segment timeline
pub fn parse_media_playlist(
    content: &str,
    url: &Url,
    level: usize,
) -> std::result::Result<MediaPlaylist, ManifestError> {
    ensure_m3u(content)?;
    let parsed = m3u8_rs::parse_media_playlist_res(content.as_bytes())
        .map_err(|e| ManifestError::Malformed(format!("HLS media: {:?}", e)))?;
    extract_segments(&parsed, url, level)
}

fn ensure_m3u(content: &str) -> std::result::Result<(), ManifestError> {
    if content.trim_start_matches('\u{feff}').trim_start().starts_with("#EXTM3U") {
        Ok(())
    } else {
        Err(ManifestError::Malformed("missing #EXTM3U header".to_string()))
    }
}

/// Extract levels from a master playlist, ordered by bandwidth
fn extract_levels(
    master: &MasterPlaylist,
    base_url: &Url,
) -> std::result::Result<Vec<Level>, ManifestError> {
    let mut variants = Vec::new();
    for variant in master.variants.iter().filter(|v| !v.is_i_frame) {
        let uri = resolve_uri(base_url, &variant.uri)?;
        let (width, height) = variant
            .resolution
            .map(|r| (r.width as u32, r.height as u32))
            .unwrap_or((0, 0));
        variants.push((variant.bandwidth, width, height, variant.codecs.clone(), uri));
    }

    variants.sort_by_key(|(bandwidth, ..)| *bandwidth);

    Ok(variants
        .into_iter()
        .enumerate()
        .map(|(index, (bandwidth, width, height, codecs, uri))| Level {
            index,
            width,
            height,
            bandwidth,
            label: level_label(height, bandwidth),
            codecs,
            uri,
        })
        .collect())
}

fn level_label(height: u32, bandwidth: u64) -> String {
    if height > 0 {
        format!("{}p", height)
    } else {
        format!("{} kbps", bandwidth / 1000)
    }
}

/// Extract segments from a media playlist
fn extract_segments(
    media: &M3u8MediaPlaylist,
    base_url: &Url,
    level: usize,
) -> std::result::Result<MediaPlaylist, ManifestError> {
    let mut segments = Vec::with_capacity(media.segments.len());
    let mut start = 0.0;
    // offset-less byte ranges continue from the previous range of the same resource
    let mut next_offset: Option<(String, u64)> = None;

    for (idx, seg) in media.segments.iter().enumerate() {
        let duration = f64::from(seg.duration);
        if !duration.is_finite() || duration < 0.0 {
            return Err(ManifestError::Malformed(format!(
                "segment {} has invalid duration {}",
                idx, seg.duration
            )));
        }
        let uri = resolve_uri(base_url, &seg.uri)?;

        let byte_range = seg.byte_range.as_ref().map(|br| {
            let offset = br.offset.unwrap_or_else(|| match &next_offset {
                Some((prev_uri, end)) if *prev_uri == seg.uri => *end,
                _ => 0,
            });
            next_offset = Some((seg.uri.clone(), offset + br.length));
            ByteRange {
                start: offset,
                length: br.length,
            }
        });

        segments.push(SegmentInfo {
            index: idx,
            sequence: media.media_sequence + idx as u64,
            start,
            duration,
            uri,
            byte_range,
        });
        start += duration;
    }

    Ok(MediaPlaylist {
        level,
        segments,
        target_duration: media.target_duration as f64,
        ended: media.end_list,
    })
}

/// Resolve relative URI against base URL
fn resolve_uri(base: &Url, relative: &str) -> std::result::Result<Url, ManifestError> {
    base.join(relative)
        .map_err(|e| ManifestError::Malformed(format!("invalid URI '{}': {}", relative, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASTER: &str = "#EXTM3U
#EXT-X-VERSION:3
#EXT-X-STREAM-INF:BANDWIDTH=5000000,RESOLUTION=1920x1080,CODECS=\"avc1.640028,mp4a.40.2\"
1080p/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=500000,RESOLUTION=426x240
240p/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=2500000,RESOLUTION=1280x720
720p/index.m3u8
#EXT-X-I-FRAME-STREAM-INF:BANDWIDTH=90000,URI=\"iframes.m3u8\"
";

    const MEDIA: &str = "#EXTM3U
#EXT-X-VERSION:4
#EXT-X-TARGETDURATION:4
#EXT-X-MEDIA-SEQUENCE:7
#EXTINF:4.0,
seg0.ts
#EXTINF:4.0,
seg1.ts
#EXTINF:2.5,
#EXT-X-BYTERANGE:1000@0
all.ts
#EXTINF:2.5,
#EXT-X-BYTERANGE:500
all.ts
#EXT-X-ENDLIST
";

    fn master_url() -> Url {
        Url::parse("https://cdn.example.com/hls/movie/master.m3u8").unwrap()
    }

    #[test]
    fn test_master_levels_sorted_and_indexed() {
        let manifest = parse_manifest(MASTER, &master_url()).unwrap();
        let heights: Vec<u32> = manifest.levels().iter().map(|l| l.height).collect();
        assert_eq!(heights, vec![240, 720, 1080]);

        let indices: Vec<usize> = manifest.levels().iter().map(|l| l.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);

        for level in manifest.levels() {
            assert!(!level.label.is_empty());
            assert!(level.height > 0);
        }
        assert_eq!(
            manifest.levels()[1].uri.as_str(),
            "https://cdn.example.com/hls/movie/720p/index.m3u8"
        );
        assert!(manifest.inline_playlist().is_none());
    }

    #[test]
    fn test_media_playlist_timeline() {
        let url = Url::parse("https://cdn.example.com/hls/movie/720p/index.m3u8").unwrap();
        let playlist = parse_media_playlist(MEDIA, &url, 1).unwrap();

        assert_eq!(playlist.level, 1);
        assert!(playlist.ended);
        assert_eq!(playlist.segments.len(), 4);
        assert_eq!(playlist.segments[0].sequence, 7);
        assert!((playlist.segments[2].start - 8.0).abs() < 1e-9);
        assert!((playlist.duration().unwrap() - 13.0).abs() < 1e-6);

        assert_eq!(playlist.segments[2].byte_range, Some(ByteRange { start: 0, length: 1000 }));
        assert_eq!(playlist.segments[3].byte_range, Some(ByteRange { start: 1000, length: 500 }));

        assert_eq!(playlist.index_at(0.0), Some(0));
        assert_eq!(playlist.index_at(4.0), Some(1));
        assert_eq!(playlist.index_at(12.9), Some(3));
        assert_eq!(playlist.index_at(13.0), None);
    }

    #[test]
    fn test_media_playlist_as_entry_point() {
        let url = Url::parse("https://cdn.example.com/clip.m3u8").unwrap();
        let manifest = parse_manifest(MEDIA, &url).unwrap();
        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest.levels()[0].label, "default");
        assert_eq!(manifest.inline_playlist().map(|p| p.segments.len()), Some(4));
    }

    #[test]
    fn test_malformed_and_empty() {
        let url = master_url();
        assert!(matches!(
            parse_manifest("<html>not found</html>", &url),
            Err(ManifestError::Malformed(_))
        ));

        let empty_media = "#EXTM3U
#EXT-X-TARGETDURATION:4
#EXT-X-ENDLIST
";
        assert_eq!(parse_manifest(empty_media, &url).unwrap_err(), ManifestError::Empty);
    }
}
