//! Budget-driven collaborative phase.
//!
//! Aggregate usage is the sum of per-document token estimates. Crossing the
//! upper threshold moves the mission into convergence; it only returns to
//! expansion once usage falls below the strictly lower threshold.

use crate::bus::{Notification, NotificationBus};
use crate::cache::ContentCache;
use crate::clock::SharedClock;
use crate::error::{CoordinationError, Result};
use crate::observability::CoordinationMetrics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    /// Agents may create new content freely
    #[default]
    Expansion,
    /// Agents should trim, deduplicate and consolidate
    Convergence,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Expansion => write!(f, "EXPANSION"),
            Phase::Convergence => write!(f, "CONVERGENCE"),
        }
    }
}

/// Upper/lower usage fractions forming the hysteresis band.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhaseThresholds {
    upper: f64,
    lower: f64,
}

impl PhaseThresholds {
    pub fn new(upper: f64, lower: f64) -> Result<Self> {
        if !(upper > 0.0 && upper <= 1.0) {
            return Err(CoordinationError::Config(format!(
                "phase upper threshold must be in (0, 1], got {upper}"
            )));
        }
        if !(lower >= 0.0 && lower < upper) {
            return Err(CoordinationError::Config(format!(
                "phase lower threshold must be in [0, {upper}), got {lower}"
            )));
        }
        Ok(Self { upper, lower })
    }

    pub fn upper(&self) -> f64 {
        self.upper
    }

    pub fn lower(&self) -> f64 {
        self.lower
    }

    /// Phase that follows `current` at the given usage fraction.
    pub fn next_phase(&self, current: Phase, fraction: f64) -> Phase {
        match current {
            Phase::Expansion if fraction >= self.upper => Phase::Convergence,
            Phase::Convergence if fraction < self.lower => Phase::Expansion,
            unchanged => unchanged,
        }
    }
}

impl Default for PhaseThresholds {
    fn default() -> Self {
        Self {
            upper: 0.6,
            lower: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseStatus {
    pub phase: Phase,
    pub usage: u64,
    pub capacity: u64,
    pub headroom: u64,
    pub usage_fraction: f64,
    pub upper_threshold: f64,
    pub lower_threshold: f64,
    pub last_transition: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseTransition {
    pub from: Phase,
    pub to: Phase,
    pub usage: u64,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct PhaseState {
    phase: Phase,
    usage: u64,
    last_transition: Option<DateTime<Utc>>,
}

/// Token estimate for a document of `bytes` bytes.
pub fn estimate_tokens(bytes: u64, bytes_per_token: u64) -> u64 {
    bytes.div_ceil(bytes_per_token.max(1))
}

pub struct PhaseController {
    cache: Arc<ContentCache>,
    bus: Arc<NotificationBus>,
    capacity: u64,
    thresholds: PhaseThresholds,
    bytes_per_token: u64,
    state: Mutex<PhaseState>,
    clock: SharedClock,
    metrics: Arc<CoordinationMetrics>,
}

impl fmt::Debug for PhaseController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhaseController")
            .field("capacity", &self.capacity)
            .field("thresholds", &self.thresholds)
            .finish()
    }
}

impl PhaseController {
    pub fn new(
        cache: Arc<ContentCache>,
        bus: Arc<NotificationBus>,
        capacity: u64,
        thresholds: PhaseThresholds,
        bytes_per_token: u64,
        clock: SharedClock,
        metrics: Arc<CoordinationMetrics>,
    ) -> Result<Self> {
        if capacity == 0 {
            return Err(CoordinationError::Config("phase capacity must be positive".to_string()));
        }
        Ok(Self {
            cache,
            bus,
            capacity,
            thresholds,
            bytes_per_token: bytes_per_token.max(1),
            state: Mutex::new(PhaseState::default()),
            clock,
            metrics,
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, PhaseState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Aggregate usage across every document the cache knows about.
    pub fn measure_usage(&self) -> u64 {
        self.cache
            .document_sizes()
            .iter()
            .map(|(_, bytes)| estimate_tokens(*bytes, self.bytes_per_token))
            .sum()
    }

    /// Re-measure usage and apply any phase transition. Measuring happens
    /// under the state lock so concurrent recomputes store their figures in
    /// the order they were taken.
    pub fn recompute(&self) -> PhaseStatus {
        let mut state = self.lock_state();
        let usage = self.measure_usage();
        self.apply_usage(&mut state, usage);
        self.status_of(&state)
    }

    /// Feed a usage value through the hysteresis rule. A transition publishes
    /// an urgent phase-changed notification.
    pub fn observe_usage(&self, usage: u64) -> Option<PhaseTransition> {
        let mut state = self.lock_state();
        self.apply_usage(&mut state, usage)
    }

    fn apply_usage(&self, state: &mut PhaseState, usage: u64) -> Option<PhaseTransition> {
        let fraction = usage as f64 / self.capacity as f64;
        state.usage = usage;

        let next = self.thresholds.next_phase(state.phase, fraction);
        if next == state.phase {
            debug!(usage, fraction, phase = %state.phase, "Phase unchanged");
            return None;
        }

        let at = self.clock.now();
        let transition = PhaseTransition {
            from: state.phase,
            to: next,
            usage,
            at,
        };
        state.phase = next;
        state.last_transition = Some(at);

        info!(
            from = %transition.from,
            to = %transition.to,
            usage,
            capacity = self.capacity,
            fraction,
            "Collaborative phase changed"
        );
        self.metrics.record_phase_transition();
        self.bus
            .publish(Notification::phase_changed(transition.from, transition.to, usage, self.capacity));
        Some(transition)
    }

    pub fn phase(&self) -> Phase {
        self.lock_state().phase
    }

    pub fn status(&self) -> PhaseStatus {
        self.status_of(&self.lock_state())
    }

    fn status_of(&self, state: &PhaseState) -> PhaseStatus {
        PhaseStatus {
            phase: state.phase,
            usage: state.usage,
            capacity: self.capacity,
            headroom: self.capacity.saturating_sub(state.usage),
            usage_fraction: state.usage as f64 / self.capacity as f64,
            upper_threshold: self.thresholds.upper(),
            lower_threshold: self.thresholds.lower(),
            last_transition: state.last_transition,
        }
    }
}
