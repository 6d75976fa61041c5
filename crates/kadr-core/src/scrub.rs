//! Scrub preview index
//!
//! Parses a WebVTT-style thumbnail track: blocks separated by blank lines,
//! each holding a `start --> end` timing line and, as its last line, a
//! sprite URL with an optional `#xywh=x,y,w,h` crop.

use crate::error::FetchError;
use crate::loader::Loader;
use nom::{
    bytes::complete::tag,
    character::complete::{char, digit1, one_of, space1},
    combinator::{map_res, opt},
    sequence::{delimited, preceded, separated_pair},
    IResult, Parser,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument};
use url::Url;

/// Default preview size when a cue carries no crop
pub const DEFAULT_FRAME_WIDTH: u32 = 160;
pub const DEFAULT_FRAME_HEIGHT: u32 = 90;

/// Sprite region in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Crop {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

/// One preview interval, `[start, end)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrubCue {
    pub start: f64,
    pub end: f64,
    pub sprite_url: String,
    pub crop: Option<Crop>,
}

/// Geometry needed to draw a preview frame
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreviewFrame {
    pub sprite_url: String,
    pub width: u32,
    pub height: u32,
    /// Background offset into the sprite sheet
    pub offset_x: i64,
    pub offset_y: i64,
}

impl ScrubCue {
    pub fn frame(&self) -> PreviewFrame {
        let (width, height, offset_x, offset_y) = match self.crop {
            Some(c) => (c.w, c.h, -i64::from(c.x), -i64::from(c.y)),
            None => (DEFAULT_FRAME_WIDTH, DEFAULT_FRAME_HEIGHT, 0, 0),
        };
        PreviewFrame {
            sprite_url: self.sprite_url.clone(),
            width,
            height,
            offset_x,
            offset_y,
        }
    }
}

/// Result of parsing an index document
#[derive(Debug, Clone, Default)]
pub struct ParsedIndex {
    /// Cues sorted by start
    pub cues: Vec<ScrubCue>,
    /// Malformed blocks that were dropped
    pub skipped: usize,
}

impl ParsedIndex {
    pub fn into_shared(self) -> Arc<[ScrubCue]> {
        self.cues.into()
    }
}

/// Parse an index whose sprite URLs are already absolute or left relative
pub fn parse(text: &str) -> ParsedIndex {
    parse_with_base(text, None)
}

/// Parse an index, resolving relative sprite URLs against `base`
pub fn parse_with_base(text: &str, base: Option<&Url>) -> ParsedIndex {
    let normalized = text.trim_start_matches('\u{feff}').replace("\r\n", "\n");
    let mut parsed = ParsedIndex::default();

    for block in normalized.split("\n\n") {
        let lines: Vec<&str> = block
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();
        if lines.is_empty() || is_preamble(lines[0]) {
            continue;
        }
        match parse_block(&lines, base) {
            Some(cue) => parsed.cues.push(cue),
            None => parsed.skipped += 1,
        }
    }

    parsed.cues.sort_by(|a, b| a.start.total_cmp(&b.start));
    parsed
}

fn is_preamble(first: &str) -> bool {
    first.starts_with("WEBVTT") || first.starts_with("NOTE") || first.starts_with("STYLE")
}

fn parse_block(lines: &[&str], base: Option<&Url>) -> Option<ScrubCue> {
    if lines.len() < 2 {
        return None;
    }
    // optional cue identifier before the timing line
    let timing_at = lines.iter().position(|l| l.contains("-->"))?;
    if timing_at + 1 >= lines.len() {
        return None;
    }
    let (_, (start, end)) = timing_line(lines[timing_at]).ok()?;
    if end <= start {
        return None;
    }

    let (sprite_url, crop) = sprite_line(lines[lines.len() - 1], base)?;
    Some(ScrubCue {
        start,
        end,
        sprite_url,
        crop,
    })
}

fn number(input: &str) -> IResult<&str, u64> {
    map_res(digit1, str::parse::<u64>).parse(input)
}

fn fraction(input: &str) -> IResult<&str, f64> {
    preceded(
        one_of(".,"),
        map_res(digit1, |digits: &str| format!("0.{}", digits).parse::<f64>()),
    )
    .parse(input)
}

/// `h:mm:ss(.fff)` or `mm:ss(.fff)`, `.` or `,` before the fraction
fn timestamp(input: &str) -> IResult<&str, f64> {
    let (rest, (first, second, third, frac)) = (
        number,
        preceded(char(':'), number),
        opt(preceded(char(':'), number)),
        opt(fraction),
    )
        .parse(input)?;

    let (hours, minutes, seconds) = match third {
        Some(seconds) => (first, second, seconds),
        None => (0, first, second),
    };
    if seconds >= 60 || (third.is_some() && minutes >= 60) {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Verify,
        )));
    }

    let total = (hours * 3600 + minutes * 60 + seconds) as f64 + frac.unwrap_or(0.0);
    Ok((rest, total))
}

/// `start --> end`, trailing cue settings ignored
fn timing_line(input: &str) -> IResult<&str, (f64, f64)> {
    separated_pair(timestamp, delimited(space1, tag("-->"), space1), timestamp).parse(input)
}

fn sprite_line(line: &str, base: Option<&Url>) -> Option<(String, Option<Crop>)> {
    if line.contains("-->") {
        return None;
    }
    let (path, fragment) = match line.split_once('#') {
        Some((path, fragment)) => (path, Some(fragment)),
        None => (line, None),
    };
    if path.is_empty() {
        return None;
    }

    let crop = match fragment {
        Some(fragment) => Some(parse_xywh(fragment)?),
        None => None,
    };
    let url = match base {
        Some(base) => base.join(path).ok()?.to_string(),
        None => path.to_string(),
    };
    Some((url, crop))
}

fn parse_xywh(fragment: &str) -> Option<Crop> {
    let values: Vec<u32> = fragment
        .strip_prefix("xywh=")?
        .split(',')
        .map(|v| v.trim().parse().ok())
        .collect::<Option<_>>()?;
    match values[..] {
        [x, y, w, h] if w > 0 && h > 0 => Some(Crop { x, y, w, h }),
        _ => None,
    }
}

/// Cue covering `time`, half-open
pub fn lookup(cues: &[ScrubCue], time: f64) -> Option<&ScrubCue> {
    let after = cues.partition_point(|c| c.start <= time);
    let cue = cues.get(after.checked_sub(1)?)?;
    (time < cue.end).then_some(cue)
}

/// Fetch and parse the index at `url`
#[instrument(skip(loader))]
pub async fn fetch_index(loader: &dyn Loader, url: &Url) -> Result<ParsedIndex, FetchError> {
    let text = loader.fetch_text(url).await?;
    let parsed = parse_with_base(&text, Some(url));
    debug!(cues = parsed.cues.len(), skipped = parsed.skipped, "Scrub index parsed");
    Ok(parsed)
}
