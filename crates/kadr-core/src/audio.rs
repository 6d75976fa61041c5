//! Audio conditioning chain
//!
//! Two mutually exclusive routings: the source straight to the output
//! (`Dry`) or through a dynamics compressor (`Conditioned`). The chain is an
//! explicit per-attach resource: created on the first entry into `Playing`,
//! released on detach.

use crate::error::SinkError;
use crate::platform::Platform;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Audio routing mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioRouting {
    Dry,
    Conditioned,
}

impl AudioRouting {
    pub fn from_enabled(enabled: bool) -> Self {
        if enabled {
            AudioRouting::Conditioned
        } else {
            AudioRouting::Dry
        }
    }

    pub fn is_conditioned(&self) -> bool {
        matches!(self, AudioRouting::Conditioned)
    }
}

/// Dynamics compressor parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompressorSettings {
    pub threshold_db: f32,
    pub knee_db: f32,
    pub ratio: f32,
    /// Attack time in seconds
    pub attack: f32,
    /// Release time in seconds
    pub release: f32,
}

impl Default for CompressorSettings {
    fn default() -> Self {
        Self {
            threshold_db: -24.0,
            knee_db: 30.0,
            ratio: 12.0,
            attack: 0.003,
            release: 0.25,
        }
    }
}

/// A live audio graph owned by the platform
pub trait AudioGraph: Send {
    /// Connect source to output through `routing`
    fn connect(&mut self, routing: AudioRouting) -> Result<(), SinkError>;

    /// Remove every connection from the source
    fn disconnect(&mut self);

    /// Release the underlying audio context
    fn close(&mut self);
}

/// Routing state plus the lazily created graph of one attach
pub struct AudioChain {
    graph: Option<Box<dyn AudioGraph>>,
    connected: Option<AudioRouting>,
    desired: AudioRouting,
    attempted: bool,
}

impl AudioChain {
    pub fn new(desired: AudioRouting) -> Self {
        Self {
            graph: None,
            connected: None,
            desired,
            attempted: false,
        }
    }

    pub fn is_started(&self) -> bool {
        self.graph.is_some()
    }

    /// Routing requested by the user
    pub fn routing(&self) -> AudioRouting {
        self.desired
    }

    /// Routing currently wired in the graph
    pub fn connected(&self) -> Option<AudioRouting> {
        self.connected
    }

    /// Create the graph once. Later calls are no-ops, including after a
    /// failed creation. Returns true when a graph was created.
    pub fn start(&mut self, platform: &dyn Platform) -> Result<bool, SinkError> {
        if self.attempted {
            return Ok(false);
        }
        self.attempted = true;

        let mut graph = platform.create_audio_graph()?;
        graph.connect(self.desired)?;
        self.connected = Some(self.desired);
        self.graph = Some(graph);
        debug!(routing = ?self.desired, "Audio chain created");
        Ok(true)
    }

    /// Switch routing. Returns false when `routing` is already in effect.
    pub fn set_routing(&mut self, routing: AudioRouting) -> Result<bool, SinkError> {
        let changed = self.desired != routing;
        self.desired = routing;

        let Some(graph) = self.graph.as_mut() else {
            return Ok(changed);
        };
        if self.connected == Some(routing) {
            return Ok(changed);
        }

        graph.disconnect();
        self.connected = None;
        if let Err(err) = graph.connect(routing) {
            warn!(error = %err, ?routing, "Audio rewire failed, restoring dry path");
            graph.connect(AudioRouting::Dry)?;
            self.desired = AudioRouting::Dry;
            self.connected = Some(AudioRouting::Dry);
            return Err(err);
        }
        self.connected = Some(routing);
        Ok(true)
    }

    /// Close the graph; the chain may be started again by a new attach
    pub fn release(&mut self) {
        if let Some(mut graph) = self.graph.take() {
            graph.disconnect();
            graph.close();
            debug!("Audio chain released");
        }
        self.connected = None;
        self.attempted = false;
    }
}

impl Drop for AudioChain {
    fn drop(&mut self) {
        self.release();
    }
}

/// Feed-forward compressor with a soft knee, operating on mono `f32` blocks
#[derive(Debug, Clone)]
pub struct DynamicsCompressor {
    settings: CompressorSettings,
    attack_coeff: f32,
    release_coeff: f32,
    /// Smoothed gain in dB, always <= 0
    gain_db: f32,
}

impl DynamicsCompressor {
    pub fn new(settings: CompressorSettings, sample_rate: u32) -> Self {
        let coeff = |seconds: f32| {
            if seconds <= 0.0 {
                0.0
            } else {
                (-1.0 / (seconds * sample_rate as f32)).exp()
            }
        };
        Self {
            attack_coeff: coeff(settings.attack),
            release_coeff: coeff(settings.release),
            settings,
            gain_db: 0.0,
        }
    }

    /// Static curve: output level in dB for an input level in dB
    pub fn curve(&self, input_db: f32) -> f32 {
        let CompressorSettings {
            threshold_db: t,
            knee_db: w,
            ratio: r,
            ..
        } = self.settings;
        let over = input_db - t;

        if 2.0 * over < -w {
            input_db
        } else if w > 0.0 && 2.0 * over.abs() <= w {
            let x = over + w / 2.0;
            input_db + (1.0 / r - 1.0) * x * x / (2.0 * w)
        } else {
            t + over / r
        }
    }

    pub fn process(&mut self, block: &mut [f32]) {
        for sample in block.iter_mut() {
            let level_db = 20.0 * sample.abs().max(1e-6).log10();
            let target = (self.curve(level_db) - level_db).min(0.0);
            let coeff = if target < self.gain_db {
                self.attack_coeff
            } else {
                self.release_coeff
            };
            self.gain_db = coeff * self.gain_db + (1.0 - coeff) * target;
            *sample *= 10f32.powf(self.gain_db / 20.0);
        }
    }

    /// Current gain reduction in dB (<= 0)
    pub fn reduction_db(&self) -> f32 {
        self.gain_db
    }
}

/// In-process graph used by headless hosts
#[derive(Debug)]
pub struct SoftwareAudioGraph {
    routing: Option<AudioRouting>,
    compressor: DynamicsCompressor,
    connections: usize,
    closed: bool,
}

impl SoftwareAudioGraph {
    pub fn new(sample_rate: u32, settings: CompressorSettings) -> Self {
        Self {
            routing: None,
            compressor: DynamicsCompressor::new(settings, sample_rate),
            connections: 0,
            closed: false,
        }
    }

    /// Number of live source connections
    pub fn connections(&self) -> usize {
        self.connections
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Run one block through the current routing; silence when unrouted
    pub fn process(&mut self, block: &mut [f32]) {
        match self.routing {
            Some(AudioRouting::Dry) => {}
            Some(AudioRouting::Conditioned) => self.compressor.process(block),
            None => block.fill(0.0),
        }
    }
}

impl AudioGraph for SoftwareAudioGraph {
    fn connect(&mut self, routing: AudioRouting) -> Result<(), SinkError> {
        if self.closed {
            return Err(SinkError::Unrecoverable("audio context closed".into()));
        }
        if self.routing.is_some() {
            return Err(SinkError::Unrecoverable(
                "source already connected; disconnect first".into(),
            ));
        }
        self.routing = Some(routing);
        self.connections = 1;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.routing = None;
        self.connections = 0;
    }

    fn close(&mut self) {
        self.disconnect();
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::HeadlessPlatform;

    #[test]
    fn test_quiet_signal_passes_through() {
        let mut comp = DynamicsCompressor::new(CompressorSettings::default(), 48_000);
        let mut block = vec![0.01f32; 4800];
        comp.process(&mut block);
        assert!(block.iter().all(|s| (*s - 0.01).abs() < 1e-6));
    }

    #[test]
    fn test_loud_signal_is_compressed() {
        let mut comp = DynamicsCompressor::new(CompressorSettings::default(), 48_000);
        let mut block = vec![0.9f32; 48_000];
        comp.process(&mut block);

        let tail = block[block.len() - 1];
        assert!(tail < 0.2, "expected heavy reduction, got {}", tail);
        assert!(comp.reduction_db() < -15.0);
    }

    #[test]
    fn test_curve_above_knee_follows_ratio() {
        let comp = DynamicsCompressor::new(CompressorSettings::default(), 48_000);
        // 36 dB over threshold, outside the 30 dB knee
        assert!((comp.curve(12.0) - (-24.0 + 36.0 / 12.0)).abs() < 1e-4);
        assert_eq!(comp.curve(-60.0), -60.0);
    }

    #[test]
    fn test_chain_toggle_is_idempotent() {
        let platform = HeadlessPlatform::default();
        let mut chain = AudioChain::new(AudioRouting::Dry);

        assert!(chain.start(&platform).unwrap());
        assert!(!chain.start(&platform).unwrap());
        assert_eq!(chain.connected(), Some(AudioRouting::Dry));

        assert!(chain.set_routing(AudioRouting::Conditioned).unwrap());
        assert!(!chain.set_routing(AudioRouting::Conditioned).unwrap());
        assert_eq!(chain.connected(), Some(AudioRouting::Conditioned));

        assert!(chain.set_routing(AudioRouting::Dry).unwrap());
        assert_eq!(chain.connected(), Some(AudioRouting::Dry));
    }

    #[test]
    fn test_routing_before_start_is_applied_on_creation() {
        let platform = HeadlessPlatform::default();
        let mut chain = AudioChain::new(AudioRouting::Dry);
        assert!(chain.set_routing(AudioRouting::Conditioned).unwrap());
        assert!(!chain.is_started());

        chain.start(&platform).unwrap();
        assert_eq!(chain.connected(), Some(AudioRouting::Conditioned));

        chain.release();
        assert!(!chain.is_started());
        assert_eq!(chain.connected(), None);
    }

    #[test]
    fn test_software_graph_refuses_duplicate_connection() {
        let mut graph = SoftwareAudioGraph::new(48_000, CompressorSettings::default());
        graph.connect(AudioRouting::Dry).unwrap();
        assert!(graph.connect(AudioRouting::Conditioned).is_err());
        assert_eq!(graph.connections(), 1);

        graph.close();
        assert!(graph.is_closed());
        let mut block = vec![0.5f32; 8];
        graph.process(&mut block);
        assert!(block.iter().all(|s| *s == 0.0));
    }
}
