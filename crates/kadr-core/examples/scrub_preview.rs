//! Scrub preview example
//!
//! Demonstrates how to parse a thumbnail index and resolve the preview
//! frame for a hover position.
//!
//! Run with: cargo run -p kadr-core --example scrub_preview

use kadr_core::format_clock;
use kadr_core::scrub::{lookup, parse_with_base};
use url::Url;

fn main() {
    println!("Kadr Core - Scrub Preview Example");
    println!("==========================================\n");

    // Sprite sheet of 160x90 tiles, plus one standalone image
    let index = r#"WEBVTT

1
00:00:00.000 --> 00:00:05.000
sprites/sheet0.jpg#xywh=0,0,160,90

2
00:00:05.000 --> 00:00:10.000
sprites/sheet0.jpg#xywh=160,0,160,90

3
00:00:10.000 --> 00:00:15.000
sprites/sheet0.jpg#xywh=320,0,160,90

not a cue
garbage --> more garbage

4
00:00:15.000 --> 00:00:20.000
https://img.example.com/poster.jpg
"#;

    let base = Url::parse("https://cdn.example.com/vod/thumbs.vtt").expect("valid URL");
    let parsed = parse_with_base(index, Some(&base));
    println!(
        "Found {} cues ({} malformed blocks dropped)\n",
        parsed.cues.len(),
        parsed.skipped
    );

    for cue in &parsed.cues {
        println!(
            "  {} -> {}  {}",
            format_clock(cue.start),
            format_clock(cue.end),
            cue.sprite_url
        );
    }

    println!("\nHover lookups:");
    for time in [2.0, 7.5, 14.99, 17.0, 42.0] {
        match lookup(&parsed.cues, time) {
            Some(cue) => {
                let frame = cue.frame();
                println!(
                    "  {:>6.2}s  {}x{} background-position: {}px {}px",
                    time, frame.width, frame.height, frame.offset_x, frame.offset_y
                );
            }
            None => println!("  {:>6.2}s  (no preview)", time),
        }
    }
}
