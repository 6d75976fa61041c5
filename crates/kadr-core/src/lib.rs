//! Kadr Core - Adaptive HLS playback engine
//!
//! This crate provides the core functionality for segmented video playback:
//! - HLS master/media playlist parsing into quality levels and timelines
//! - Forward buffer management with back-buffer and memory eviction
//! - Throughput-driven adaptive bitrate (ABR) selection with hysteresis
//! - Error classification and bounded recovery
//! - Resume-position persistence and scrub preview indexes
//! - A control-surface adapter with hotkeys and auxiliary timers
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Kadr Core                               │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐           │
//! │  │   Manifest   │  │    Buffer    │  │     ABR      │           │
//! │  │    Model     │  │   Manager    │  │  Controller  │           │
//! │  └──────┬───────┘  └──────┬───────┘  └──────┬───────┘           │
//! │         │                 │                 │                   │
//! │         └─────────────────┼─────────────────┘                   │
//! │                           │                                     │
//! │  ┌──────────────┐  ┌──────┴──────┐  ┌──────────────┐            │
//! │  │   Recovery   │──│  Playback   │──│    Audio     │            │
//! │  │  Supervisor  │  │   Engine    │  │    Chain     │            │
//! │  └──────────────┘  └──────┬──────┘  └──────────────┘            │
//! │                           │ Message / Command                   │
//! │  ┌──────────────┐  ┌──────┴──────┐  ┌──────────────┐            │
//! │  │    Resume    │──│   Player    │──│    Scrub     │            │
//! │  │    Store     │  │   Session   │  │    Index     │            │
//! │  └──────────────┘  └──────┬──────┘  └──────────────┘            │
//! │                           │ Notification                        │
//! │                    ┌──────┴──────┐                              │
//! │                    │   Control   │                              │
//! │                    │   Surface   │                              │
//! │                    └─────────────┘                              │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod error;
pub mod types;
pub mod manifest;
pub mod loader;
pub mod platform;
pub mod buffer;
pub mod abr;
pub mod recovery;
pub mod resume;
pub mod scrub;
pub mod audio;
pub mod engine;
pub mod control;
pub mod session;

pub use error::{Error, FetchError, ManifestError, Result, SinkError};
pub use types::*;
pub use manifest::{HlsParser, Level, Manifest, MediaPlaylist, SegmentInfo};
pub use loader::{HttpLoader, Loader, SegmentRequest};
pub use platform::{Capabilities, Capability, HeadlessPlatform, MediaSink, PipMode, Platform, VirtualSurface};
pub use buffer::{BufferConfig, BufferManager, SegmentPayload};
pub use abr::{AbrConfig, AbrController, AbrPolicy, ThroughputPolicy};
pub use recovery::{FaultClass, RecoveryAction, RecoveryConfig, Supervisor};
pub use resume::{FileResumeStore, MemoryResumeStore, PositionStore, ResumeConfig, ResumeStore};
pub use scrub::{PreviewFrame, ScrubCue};
pub use audio::{AudioChain, AudioGraph, AudioRouting, CompressorSettings};
pub use engine::{
    AttachRequest, Command, EngineStats, ErrorKind, Intent, Message, Notification, PlaybackEngine,
};
pub use control::{ControlConfig, ControlSurface, ControlView, KeyPress, SleepTimer};
pub use session::{PlayerSession, SessionHandle};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the player library with default configuration
pub fn init() {
    tracing::info!(version = VERSION, "Kadr Core initialized");
}
