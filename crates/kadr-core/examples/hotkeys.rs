//! Control surface example
//!
//! Demonstrates how engine notifications drive the control view and how
//! hotkeys turn into player intents.
//!
//! Run with: cargo run -p kadr-core --example hotkeys

use kadr_core::{ControlConfig, ControlSurface, KeyPress, Notification, PlaybackState};
use std::time::Instant;

fn main() {
    println!("Kadr Core - Control Surface Example");
    println!("==========================================\n");

    let mut controls = ControlSurface::new(ControlConfig::default());

    // What a session would broadcast after attaching 10 minutes of content
    let events = [
        Notification::DurationChanged { duration: 600.0 },
        Notification::StateChanged {
            from: PlaybackState::Idle,
            to: PlaybackState::Attaching,
        },
        Notification::StateChanged {
            from: PlaybackState::Attaching,
            to: PlaybackState::Buffering,
        },
        Notification::StateChanged {
            from: PlaybackState::Buffering,
            to: PlaybackState::Playing,
        },
        Notification::PositionChanged { position: 95.0 },
    ];
    for event in &events {
        controls.apply(event);
    }

    let view = controls.view();
    println!("State:    {}", view.state);
    println!("Time:     {}", view.time_label);
    println!("Progress: {:.1}%\n", view.progress_pct);

    let now = Instant::now();
    for press in [
        KeyPress::new('k'),
        KeyPress::new('l'),
        KeyPress::new('j'),
        KeyPress::new('>'),
        KeyPress::new('m'),
        KeyPress::new('f'),
        KeyPress::with_alt('s'),
    ] {
        match controls.key(press, now) {
            Some(intent) => println!("  {:?} -> {:?}", press, intent),
            None => println!("  {:?} -> (view only)", press),
        }
    }

    let view = controls.view();
    println!(
        "\nFullscreen: {}, stats overlay: {}",
        view.fullscreen, view.stats_visible
    );
}
