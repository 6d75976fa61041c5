//! Error recovery supervisor
//!
//! Classifies faults from loads and the media surface and answers with one
//! recovery action. At most one action per fault class is outstanding;
//! faults arriving while one is pending are suppressed.

use crate::error::{FetchError, SinkError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Recovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub backoff_base_ms: u64,
    pub backoff_factor: f64,
    pub backoff_cap_ms: u64,
    /// Retries before a network fault becomes an advisory
    pub max_network_retries: u32,
    /// Decoder resets allowed per level within one window
    pub decode_resets_per_window: usize,
    pub decode_window_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: 500,
            backoff_factor: 2.0,
            backoff_cap_ms: 8_000,
            max_network_retries: 3,
            decode_resets_per_window: 1,
            decode_window_ms: 10_000,
        }
    }
}

impl RecoveryConfig {
    /// Delay before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.backoff_factor.powi(attempt.saturating_sub(1) as i32);
        let ms = (self.backoff_base_ms as f64 * exp).min(self.backoff_cap_ms as f64);
        Duration::from_millis(ms as u64)
    }
}

/// Fault taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultClass {
    NetworkTransient,
    MediaDecodeTransient,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FatalKind {
    Unsupported,
    Unrecoverable,
}

/// Classify a surface failure
pub fn classify_sink(err: &SinkError) -> FaultClass {
    match err {
        SinkError::Decode(_) => FaultClass::MediaDecodeTransient,
        SinkError::Unsupported(_) | SinkError::Unrecoverable(_) => FaultClass::Fatal,
    }
}

/// Kind of a fatal surface failure
pub fn fatal_kind(err: &SinkError) -> Option<FatalKind> {
    match err {
        SinkError::Unsupported(_) => Some(FatalKind::Unsupported),
        SinkError::Unrecoverable(_) => Some(FatalKind::Unrecoverable),
        SinkError::Decode(_) => None,
    }
}

/// What the engine should do about a fault
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// Re-issue the failed load after `delay`
    Retry { attempt: u32, delay: Duration },
    /// Reset decode context for `level`, then refetch
    ResetDecoder { level: usize },
    /// Report a non-fatal error; optionally skip the failing segment and
    /// resume loading after a pause
    Advisory {
        class: FaultClass,
        skip_segment: bool,
        resume_after: Option<Duration>,
    },
    /// Enter `FatalError`
    Fatal(FatalKind),
    /// A recovery for this class is already pending
    Suppressed,
}

/// Per-attach supervisor state
#[derive(Debug)]
pub struct Supervisor {
    config: RecoveryConfig,
    network_attempts: u32,
    network_pending: bool,
    decode_pending: bool,
    decode_resets: HashMap<usize, VecDeque<Instant>>,
    fatal: bool,
}

impl Supervisor {
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            config,
            network_attempts: 0,
            network_pending: false,
            decode_pending: false,
            decode_resets: HashMap::new(),
            fatal: false,
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Forget all history (fresh attach)
    pub fn reset(&mut self) {
        *self = Self::new(self.config.clone());
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    pub fn is_pending(&self, class: FaultClass) -> bool {
        match class {
            FaultClass::NetworkTransient => self.network_pending,
            FaultClass::MediaDecodeTransient => self.decode_pending,
            FaultClass::Fatal => self.fatal,
        }
    }

    pub fn on_network_fault(&mut self, err: &FetchError) -> RecoveryAction {
        if self.fatal || matches!(err, FetchError::Cancelled) {
            return RecoveryAction::Suppressed;
        }
        if self.network_pending {
            debug!(error = %err, "Network recovery already pending");
            return RecoveryAction::Suppressed;
        }

        if self.network_attempts >= self.config.max_network_retries {
            warn!(
                error = %err,
                attempts = self.network_attempts,
                "Network retries exhausted"
            );
            self.network_attempts = 0;
            self.network_pending = true;
            return RecoveryAction::Advisory {
                class: FaultClass::NetworkTransient,
                skip_segment: false,
                resume_after: Some(Duration::from_millis(self.config.backoff_cap_ms)),
            };
        }

        self.network_attempts += 1;
        self.network_pending = true;
        let delay = self.config.backoff(self.network_attempts);
        debug!(
            error = %err,
            attempt = self.network_attempts,
            delay_ms = delay.as_millis() as u64,
            "Scheduling network retry"
        );
        RecoveryAction::Retry {
            attempt: self.network_attempts,
            delay,
        }
    }

    /// The retried load has reported back
    pub fn network_settled(&mut self) {
        self.network_pending = false;
    }

    /// A load succeeded; the retry budget starts over
    pub fn network_recovered(&mut self) {
        self.network_pending = false;
        self.network_attempts = 0;
    }

    pub fn on_decode_fault(&mut self, level: usize, now: Instant) -> RecoveryAction {
        if self.fatal {
            return RecoveryAction::Suppressed;
        }
        if self.decode_pending {
            debug!(level, "Decoder recovery already pending");
            return RecoveryAction::Suppressed;
        }

        let window = Duration::from_millis(self.config.decode_window_ms);
        let history = self.decode_resets.entry(level).or_default();
        while history
            .front()
            .is_some_and(|at| now.saturating_duration_since(*at) >= window)
        {
            history.pop_front();
        }

        self.decode_pending = true;
        if history.len() < self.config.decode_resets_per_window {
            history.push_back(now);
            debug!(level, resets = history.len(), "Resetting decoder");
            RecoveryAction::ResetDecoder { level }
        } else {
            warn!(level, "Decode faults exceed reset budget, skipping segment");
            RecoveryAction::Advisory {
                class: FaultClass::MediaDecodeTransient,
                skip_segment: true,
                resume_after: None,
            }
        }
    }

    /// The segment fetched after a decode recovery has reported back
    pub fn decode_settled(&mut self) {
        self.decode_pending = false;
    }

    pub fn on_sink_fault(&mut self, err: &SinkError, level: usize, now: Instant) -> RecoveryAction {
        match fatal_kind(err) {
            Some(kind) => self.on_fatal(kind),
            None => self.on_decode_fault(level, now),
        }
    }

    pub fn on_fatal(&mut self, kind: FatalKind) -> RecoveryAction {
        if self.fatal {
            return RecoveryAction::Suppressed;
        }
        self.fatal = true;
        RecoveryAction::Fatal(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeout() -> FetchError {
        FetchError::Timeout {
            url: "https://cdn.example.com/seg1.ts".into(),
        }
    }

    #[test]
    fn test_backoff_schedule_is_capped() {
        let config = RecoveryConfig::default();
        let delays: Vec<u64> = (1..=6).map(|n| config.backoff(n).as_millis() as u64).collect();
        assert_eq!(delays, vec![500, 1000, 2000, 4000, 8000, 8000]);
    }

    #[test]
    fn test_network_retries_then_advisory() {
        let mut sup = Supervisor::new(RecoveryConfig::default());
        let mut actions = Vec::new();
        for _ in 0..4 {
            actions.push(sup.on_network_fault(&timeout()));
            sup.network_settled();
        }
        assert!(matches!(actions[0], RecoveryAction::Retry { attempt: 1, .. }));
        assert!(matches!(actions[2], RecoveryAction::Retry { attempt: 3, .. }));
        assert!(matches!(
            actions[3],
            RecoveryAction::Advisory {
                class: FaultClass::NetworkTransient,
                skip_segment: false,
                ..
            }
        ));

        // budget starts over after the advisory
        assert!(matches!(sup.on_network_fault(&timeout()), RecoveryAction::Retry { attempt: 1, .. }));
    }

    #[test]
    fn test_duplicate_network_fault_is_suppressed() {
        let mut sup = Supervisor::new(RecoveryConfig::default());
        assert!(matches!(sup.on_network_fault(&timeout()), RecoveryAction::Retry { .. }));
        assert_eq!(sup.on_network_fault(&timeout()), RecoveryAction::Suppressed);
        assert!(sup.is_pending(FaultClass::NetworkTransient));
    }

    #[test]
    fn test_three_decode_faults_reset_once_then_escalate() {
        let mut sup = Supervisor::new(RecoveryConfig::default());
        let start = Instant::now();
        let mut actions = Vec::new();
        for i in 0..3 {
            actions.push(sup.on_decode_fault(1, start + Duration::from_secs(i)));
            sup.decode_settled();
        }
        assert_eq!(actions[0], RecoveryAction::ResetDecoder { level: 1 });
        for action in &actions[1..] {
            assert!(matches!(
                action,
                RecoveryAction::Advisory {
                    class: FaultClass::MediaDecodeTransient,
                    skip_segment: true,
                    ..
                }
            ));
        }
    }

    #[test]
    fn test_decode_window_expires_per_level() {
        let mut sup = Supervisor::new(RecoveryConfig::default());
        let start = Instant::now();
        assert!(matches!(sup.on_decode_fault(0, start), RecoveryAction::ResetDecoder { .. }));
        sup.decode_settled();
        // another level has its own budget
        assert!(matches!(sup.on_decode_fault(1, start), RecoveryAction::ResetDecoder { .. }));
        sup.decode_settled();
        // window elapsed for level 0
        let later = start + Duration::from_secs(11);
        assert!(matches!(sup.on_decode_fault(0, later), RecoveryAction::ResetDecoder { .. }));
    }

    #[test]
    fn test_fatal_is_terminal() {
        let mut sup = Supervisor::new(RecoveryConfig::default());
        let err = SinkError::Unsupported("hvc1".into());
        assert_eq!(classify_sink(&err), FaultClass::Fatal);
        assert_eq!(
            sup.on_sink_fault(&err, 0, Instant::now()),
            RecoveryAction::Fatal(FatalKind::Unsupported)
        );
        assert_eq!(sup.on_network_fault(&timeout()), RecoveryAction::Suppressed);

        sup.reset();
        assert!(!sup.is_fatal());
    }
}
