//! CLI command implementations

use crate::output;
use anyhow::Context;
use clap::Args;
use kadr_core::{
    scrub, AttachRequest, ControlSurface, FileResumeStore, HeadlessPlatform, HlsParser,
    HttpLoader, Notification, PlaybackState, PlayerConfig, PlayerSession, QualitySelection,
    SkipKind, SkipMark,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

/// Options of `kadr play`
#[derive(Args, Debug)]
pub struct PlayArgs {
    /// Manifest URL
    pub url: String,

    /// Start playing once buffered
    #[arg(long)]
    pub autoplay: bool,

    /// Quality: `auto` or a level index
    #[arg(short, long, default_value = "auto", value_parser = parse_quality)]
    pub quality: QualitySelection,

    /// Playback rate (0.25 - 2)
    #[arg(short, long)]
    pub rate: Option<f64>,

    /// Content id used to store the resume position
    #[arg(long)]
    pub content_id: Option<String>,

    /// Resume positions file
    #[arg(long)]
    pub resume_file: Option<PathBuf>,

    /// Scrub preview index URL
    #[arg(long)]
    pub thumbnails: Option<String>,

    /// Skippable interval, e.g. `intro:0-85` (repeatable)
    #[arg(long = "skip", value_parser = parse_skip_mark)]
    pub skip_marks: Vec<SkipMark>,

    /// Duration to assume until the playlist declares one (seconds)
    #[arg(long)]
    pub duration: Option<f64>,

    /// Player configuration file (JSON)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Stop after this many seconds of wall time
    #[arg(long)]
    pub seconds: Option<u64>,
}

fn parse_quality(value: &str) -> Result<QualitySelection, String> {
    if value.eq_ignore_ascii_case("auto") {
        return Ok(QualitySelection::Auto);
    }
    value
        .parse::<usize>()
        .map(QualitySelection::Manual)
        .map_err(|_| format!("expected `auto` or a level index, got '{}'", value))
}

fn parse_skip_mark(value: &str) -> Result<SkipMark, String> {
    let (kind, range) = value
        .split_once(':')
        .ok_or_else(|| format!("expected kind:start-end, got '{}'", value))?;
    let kind = match kind {
        "intro" => SkipKind::Intro,
        "outro" => SkipKind::Outro,
        other => return Err(format!("unknown skip kind '{}'", other)),
    };
    let (start, end) = range
        .split_once('-')
        .ok_or_else(|| format!("expected start-end, got '{}'", range))?;
    let start: f64 = start.trim().parse().map_err(|_| format!("bad start '{}'", start))?;
    let end: f64 = end.trim().parse().map_err(|_| format!("bad end '{}'", end))?;
    if end <= start {
        return Err(format!("empty interval {}-{}", start, end));
    }
    Ok(SkipMark::new(kind, start, end))
}

fn loader(config: &PlayerConfig) -> anyhow::Result<Arc<HttpLoader>> {
    let timeout = Duration::from_millis(config.request_timeout_ms);
    Ok(Arc::new(HttpLoader::new(timeout)?))
}

/// Print the quality ladder of a manifest
pub async fn inspect(manifest_url: &str, json: bool) -> anyhow::Result<()> {
    let url = Url::parse(manifest_url)?;
    let parser = HlsParser::new(loader(&PlayerConfig::default())?);
    let manifest = parser
        .load(&url)
        .await
        .with_context(|| format!("loading {}", url))?;

    if json {
        println!("{}", output::to_json(&manifest.levels()));
        return Ok(());
    }

    println!("Manifest: {}", manifest.url());
    if let Some(playlist) = manifest.inline_playlist() {
        println!(
            "  Media playlist: {} segments, {}",
            playlist.segments.len(),
            playlist
                .duration()
                .map(kadr_core::format_clock)
                .unwrap_or_else(|| "live".to_string())
        );
    }
    println!("{}", output::levels_table(manifest.levels()));
    Ok(())
}

/// Parse a scrub preview index, optionally resolving one time
pub async fn thumbs(index_url: &str, at: Option<f64>, json: bool) -> anyhow::Result<()> {
    let url = Url::parse(index_url)?;
    let loader = loader(&PlayerConfig::default())?;
    let parsed = scrub::fetch_index(loader.as_ref(), &url)
        .await
        .with_context(|| format!("loading {}", url))?;
    if parsed.skipped > 0 {
        warn!(skipped = parsed.skipped, "Dropped malformed cues");
    }

    match at {
        Some(time) => {
            let frame = scrub::lookup(&parsed.cues, time).map(|cue| cue.frame());
            if json {
                println!("{}", output::to_json(&frame));
            } else {
                match frame {
                    Some(f) => println!(
                        "{} -> {} ({}x{} at {},{})",
                        kadr_core::format_clock(time),
                        f.sprite_url,
                        f.width,
                        f.height,
                        f.offset_x,
                        f.offset_y
                    ),
                    None => println!("No preview at {}", kadr_core::format_clock(time)),
                }
            }
        }
        None if json => println!("{}", output::to_json(&parsed.cues)),
        None => {
            println!("{} cues", parsed.cues.len());
            println!("{}", output::cues_table(&parsed.cues));
        }
    }
    Ok(())
}

/// Play a stream on the headless platform until it ends, fails, or is
/// interrupted
pub async fn play(args: PlayArgs, json: bool) -> anyhow::Result<()> {
    let config = match &args.config {
        Some(path) => PlayerConfig::from_json_file(path)
            .with_context(|| format!("reading {}", path.display()))?,
        None => PlayerConfig::default(),
    };

    let mut request = AttachRequest::new(Url::parse(&args.url)?)
        .with_skip_marks(args.skip_marks.clone())
        .with_autoplay(args.autoplay || config.autoplay);
    if let Some(id) = &args.content_id {
        request = request.with_content_id(id.clone());
    }
    if let Some(thumbs) = &args.thumbnails {
        request = request.with_thumbnails(Url::parse(thumbs)?);
    }
    if let Some(duration) = args.duration {
        request = request.with_duration_hint(duration);
    }

    let resume_file = args.resume_file.clone().unwrap_or_else(crate::default_resume_file);
    let mut controls = ControlSurface::new(config.controls.clone());
    let session = PlayerSession::new(
        config.clone(),
        loader(&config)?,
        Arc::new(HeadlessPlatform::default()),
        Arc::new(FileResumeStore::new(&resume_file)),
    );
    let handle = session.handle();
    let mut events = handle.subscribe();
    let stop = CancellationToken::new();
    let driver = tokio::spawn(session.run_until(stop.clone()));

    if let Some(rate) = args.rate {
        handle.set_rate(rate)?;
    }
    let attach = handle.attach(request).await?;
    info!(%attach, url = %args.url, resume_file = %resume_file.display(), "Playing");

    let deadline = args
        .seconds
        .map(|s| tokio::time::Instant::now() + Duration::from_secs(s));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let timer = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        let notification = tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted");
                break;
            }
            _ = timer => {
                info!("Time limit reached");
                break;
            }
            received = events.recv() => match received {
                Ok(notification) => notification,
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "Event listener lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            },
        };

        controls.apply(&notification);
        for intent in controls.poll(Instant::now()) {
            handle.intent(intent)?;
        }

        if json {
            println!("{}", serde_json::to_string(&notification)?);
        } else if let Some(line) = output::describe(&notification, controls.view()) {
            println!("{}", line);
        }

        match notification {
            Notification::Attached { .. } if !args.quality.is_auto() => {
                handle.set_quality(args.quality)?;
            }
            Notification::StateChanged {
                to: PlaybackState::Ended | PlaybackState::FatalError,
                ..
            } => break,
            _ => {}
        }
    }

    let stats = handle.stats();
    if json {
        println!("{}", serde_json::to_string(&stats)?);
    } else {
        println!(
            "stopped at {} ({}, {})",
            kadr_core::format_clock(stats.position),
            stats.state,
            stats.level_label.as_deref().unwrap_or("no level")
        );
    }

    handle.detach().await?;
    stop.cancel();
    driver.await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_quality() {
        assert_eq!(parse_quality("auto"), Ok(QualitySelection::Auto));
        assert_eq!(parse_quality("2"), Ok(QualitySelection::Manual(2)));
        assert!(parse_quality("best").is_err());
    }

    #[test]
    fn test_parse_skip_mark() {
        let mark = parse_skip_mark("intro:0-85.5").unwrap();
        assert_eq!(mark.kind, SkipKind::Intro);
        assert_eq!(mark.end, 85.5);
        assert!(parse_skip_mark("credits:1-2").is_err());
        assert!(parse_skip_mark("outro:10-5").is_err());
    }
}
