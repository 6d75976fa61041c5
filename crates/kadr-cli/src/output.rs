//! Output formatting for CLI

use kadr_core::manifest::Level;
use kadr_core::scrub::ScrubCue;
use kadr_core::{format_clock, ControlView, Notification};
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

/// Pretty JSON, falling back to an empty object
pub fn to_json<T: Serialize>(data: &T) -> String {
    serde_json::to_string_pretty(data).unwrap_or_else(|_| "{}".to_string())
}

#[derive(Tabled)]
struct LevelRow {
    #[tabled(rename = "#")]
    index: usize,
    label: String,
    resolution: String,
    #[tabled(rename = "bandwidth")]
    kbps: String,
    codecs: String,
}

pub fn levels_table(levels: &[Level]) -> String {
    let rows = levels.iter().map(|l| LevelRow {
        index: l.index,
        label: l.label.clone(),
        resolution: if l.height > 0 {
            format!("{}x{}", l.width, l.height)
        } else {
            "-".to_string()
        },
        kbps: format!("{} kbps", l.bandwidth / 1000),
        codecs: l.codecs.clone().unwrap_or_else(|| "-".to_string()),
    });
    Table::new(rows).with(Style::rounded()).to_string()
}

#[derive(Tabled)]
struct CueRow {
    start: String,
    end: String,
    sprite: String,
    frame: String,
}

pub fn cues_table(cues: &[ScrubCue]) -> String {
    let rows = cues.iter().map(|cue| {
        let frame = cue.frame();
        CueRow {
            start: format_clock(cue.start),
            end: format_clock(cue.end),
            sprite: cue.sprite_url.clone(),
            frame: format!(
                "{}x{} @ {},{}",
                frame.width, frame.height, frame.offset_x, frame.offset_y
            ),
        }
    });
    Table::new(rows).with(Style::rounded()).to_string()
}

/// One line per notification; `None` for high-frequency events
pub fn describe(notification: &Notification, view: &ControlView) -> Option<String> {
    let line = match notification {
        Notification::Attached { levels, scrub_cues, .. } => format!(
            "attached: {} levels, {} previews",
            levels.len(),
            scrub_cues.len()
        ),
        Notification::DurationChanged { duration } => {
            format!("duration {}", format_clock(*duration))
        }
        Notification::StateChanged { from, to } => {
            format!("{} -> {}  [{}]", from, to, view.time_label)
        }
        Notification::QualityChanged { level, auto, .. } => format!(
            "quality {} (level {}{})",
            view.quality_label,
            level,
            if *auto { ", auto" } else { "" }
        ),
        Notification::Error {
            kind,
            message,
            fatal,
        } => format!(
            "{} {:?} error: {}",
            if *fatal { "FATAL" } else { "warning:" },
            kind,
            message
        ),
        Notification::Milestone { percent } => format!("watched {}%", percent),
        Notification::SkipAvailable { mark: Some(mark) } => {
            format!("{} available until {}", mark.label(), format_clock(mark.end))
        }
        Notification::RateChanged { rate } => format!("rate {}x", rate),
        Notification::VolumeChanged { volume, muted } => format!(
            "volume {:.0}%{}",
            volume * 100.0,
            if *muted { " (muted)" } else { "" }
        ),
        Notification::AudioRoutingChanged { routing } => format!("audio {:?}", routing),
        Notification::Detached { attach } => format!("detached {}", attach),
        Notification::PositionChanged { .. }
        | Notification::BufferedChanged { .. }
        | Notification::SkipAvailable { mark: None }
        | Notification::SubtitlesChanged { .. }
        | Notification::PictureInPictureChanged { .. } => return None,
    };
    Some(line)
}
