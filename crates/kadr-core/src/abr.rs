//! Adaptive Bitrate (ABR) controller
//!
//! Throughput is estimated with an EWMA over segment download samples. In
//! `Auto` mode a policy proposes a candidate level every tick; the switch is
//! taken once the same candidate has been proposed on `stable_ticks`
//! consecutive ticks. A critically low buffer bypasses that hysteresis and
//! drops one level at once.

use crate::error::{Error, Result};
use crate::manifest::Level;
use crate::types::QualitySelection;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// ABR configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AbrConfig {
    /// Fraction of the estimate a level's bandwidth may use
    pub safety_factor: f64,
    /// Consecutive ticks a candidate must persist before switching
    pub stable_ticks: u32,
    /// Forward buffer below which an emergency downshift fires (seconds)
    pub critical_buffer: f64,
    /// Weight of the newest throughput sample
    pub ewma_alpha: f64,
    /// Estimate assumed before the first sample (bits per second)
    pub initial_estimate_bps: u64,
}

impl Default for AbrConfig {
    fn default() -> Self {
        Self {
            safety_factor: 0.9,
            stable_ticks: 2,
            critical_buffer: 3.0,
            ewma_alpha: 0.2,
            initial_estimate_bps: 0,
        }
    }
}

/// Inputs to one ABR evaluation
#[derive(Debug, Clone, Copy, Default)]
pub struct AbrContext {
    /// Forward buffer in seconds
    pub buffer_lead: f64,
    /// Playing, or rebuffering after an underrun
    pub emergency_allowed: bool,
}

/// Candidate selection strategy
pub trait AbrPolicy: Send + Sync {
    /// Level index the policy would pick for `estimate_bps`
    fn candidate(&self, levels: &[Level], estimate_bps: u64, context: &AbrContext) -> Option<usize>;

    fn name(&self) -> &'static str;
}

/// Highest level whose bandwidth fits the discounted estimate
#[derive(Debug, Clone)]
pub struct ThroughputPolicy {
    safety_factor: f64,
}

impl ThroughputPolicy {
    pub fn new(safety_factor: f64) -> Self {
        Self { safety_factor }
    }
}

impl AbrPolicy for ThroughputPolicy {
    fn candidate(&self, levels: &[Level], estimate_bps: u64, _context: &AbrContext) -> Option<usize> {
        let budget = (estimate_bps as f64 * self.safety_factor) as u64;
        levels
            .iter()
            .filter(|l| l.bandwidth <= budget)
            .max_by_key(|l| l.bandwidth)
            .or_else(|| levels.iter().min_by_key(|l| l.bandwidth))
            .map(|l| l.index)
    }

    fn name(&self) -> &'static str {
        "throughput"
    }
}

/// Why a level change happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchReason {
    Throughput,
    Emergency,
    Manual,
}

/// A level change decided by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelSwitch {
    pub from: usize,
    pub to: usize,
    pub reason: SwitchReason,
}

impl LevelSwitch {
    pub fn is_auto(&self) -> bool {
        self.reason != SwitchReason::Manual
    }
}

/// ABR controller, sole writer of [`QualitySelection`]
pub struct AbrController {
    config: AbrConfig,
    policy: Box<dyn AbrPolicy>,
    selection: QualitySelection,
    current: usize,
    pending: Option<(usize, u32)>,
    estimate_bps: Option<f64>,
    /// Cleared by an emergency downshift, re-armed by the next sample
    emergency_armed: bool,
}

impl AbrController {
    pub fn new(config: AbrConfig) -> Self {
        let policy = Box::new(ThroughputPolicy::new(config.safety_factor));
        Self::with_policy(config, policy)
    }

    pub fn with_policy(config: AbrConfig, policy: Box<dyn AbrPolicy>) -> Self {
        let estimate_bps = (config.initial_estimate_bps > 0).then_some(config.initial_estimate_bps as f64);
        Self {
            config,
            policy,
            selection: QualitySelection::Auto,
            current: 0,
            pending: None,
            estimate_bps,
            emergency_armed: true,
        }
    }

    pub fn selection(&self) -> QualitySelection {
        self.selection
    }

    pub fn current_level(&self) -> usize {
        self.current
    }

    /// Smoothed throughput estimate
    pub fn estimate_bps(&self) -> Option<u64> {
        self.estimate_bps.map(|e| e as u64)
    }

    /// Pick the starting level for a fresh attach
    pub fn start(&mut self, levels: &[Level]) -> usize {
        self.pending = None;
        self.emergency_armed = true;
        self.current = match self.selection {
            QualitySelection::Manual(index) if levels.iter().any(|l| l.index == index) => index,
            _ => {
                let lowest = levels.iter().min_by_key(|l| l.bandwidth).map(|l| l.index);
                self.estimate_bps()
                    .and_then(|e| self.policy.candidate(levels, e, &AbrContext::default()))
                    .or(lowest)
                    .unwrap_or(0)
            }
        };
        debug!(
            policy = self.policy.name(),
            level = self.current,
            selection = ?self.selection,
            "ABR started"
        );
        self.current
    }

    /// Record one segment download
    pub fn record_sample(&mut self, bytes: usize, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 || bytes == 0 {
            return;
        }
        let sample = bytes as f64 * 8.0 / secs;
        let alpha = self.config.ewma_alpha;
        let estimate = match self.estimate_bps {
            Some(prev) => prev * (1.0 - alpha) + sample * alpha,
            None => sample,
        };
        self.estimate_bps = Some(estimate);
        self.emergency_armed = true;

        debug!(
            bytes,
            elapsed_ms = elapsed.as_millis() as u64,
            sample_kbps = (sample / 1000.0) as u64,
            estimate_kbps = (estimate / 1000.0) as u64,
            "Throughput sample"
        );
    }

    /// Change the selection mode.
    ///
    /// Returns the level to apply immediately for a manual override.
    /// Selecting `Auto` while in `Auto` changes nothing.
    pub fn set_selection(
        &mut self,
        selection: QualitySelection,
        levels: &[Level],
    ) -> Result<Option<LevelSwitch>> {
        match selection {
            QualitySelection::Auto => {
                if !self.selection.is_auto() {
                    self.selection = QualitySelection::Auto;
                    self.pending = None;
                    info!("Quality selection back to auto");
                }
                Ok(None)
            }
            QualitySelection::Manual(index) => {
                if !levels.iter().any(|l| l.index == index) {
                    return Err(Error::UnknownLevel(index));
                }
                self.selection = selection;
                self.pending = None;
                if index == self.current {
                    return Ok(None);
                }
                let switch = LevelSwitch {
                    from: self.current,
                    to: index,
                    reason: SwitchReason::Manual,
                };
                self.current = index;
                info!(from = switch.from, to = index, "Manual quality override");
                Ok(Some(switch))
            }
        }
    }

    /// Evaluate one tick. Only `Auto` mode ever switches here.
    pub fn on_tick(&mut self, levels: &[Level], context: &AbrContext) -> Option<LevelSwitch> {
        if !self.selection.is_auto() || levels.is_empty() {
            return None;
        }

        if context.emergency_allowed
            && self.emergency_armed
            && context.buffer_lead < self.config.critical_buffer
        {
            if let Some(lower) = self.next_lower(levels) {
                self.emergency_armed = false;
                self.pending = None;
                let switch = LevelSwitch {
                    from: self.current,
                    to: lower,
                    reason: SwitchReason::Emergency,
                };
                self.current = lower;
                info!(
                    from = switch.from,
                    to = lower,
                    lead = context.buffer_lead,
                    "Emergency downshift"
                );
                return Some(switch);
            }
        }

        let estimate = self.estimate_bps()?;
        let candidate = self.policy.candidate(levels, estimate, context)?;
        if candidate == self.current {
            self.pending = None;
            return None;
        }

        let streak = match self.pending {
            Some((pending, n)) if pending == candidate => n + 1,
            _ => 1,
        };
        if streak < self.config.stable_ticks {
            self.pending = Some((candidate, streak));
            return None;
        }

        self.pending = None;
        let switch = LevelSwitch {
            from: self.current,
            to: candidate,
            reason: SwitchReason::Throughput,
        };
        self.current = candidate;
        info!(
            from = switch.from,
            to = candidate,
            estimate_kbps = estimate / 1000,
            "ABR level switch"
        );
        Some(switch)
    }

    /// Forget partial hysteresis progress (on seek)
    pub fn reset_hysteresis(&mut self) {
        self.pending = None;
    }

    fn next_lower(&self, levels: &[Level]) -> Option<usize> {
        let current_bw = levels.iter().find(|l| l.index == self.current)?.bandwidth;
        levels
            .iter()
            .filter(|l| l.bandwidth < current_bw)
            .max_by_key(|l| l.bandwidth)
            .map(|l| l.index)
    }
}
