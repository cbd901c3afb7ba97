//! Adaptive concurrency and rate control.
//!
//! The controller owns every tunable knob of a run: the per-stage worker
//! ceiling and pacing delay, and the global request rate pushed into the
//! [`TokenBucket`]. It adjusts them additively from closed metric windows:
//! one throttled window backs everything off a step and starts a cooldown;
//! a streak of healthy windows climbs back a step. A streak of throttled
//! windows trips a one-way stop flag.

use std::fmt::{Debug, Display, Formatter};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::throttling::TokenBucket;
use crate::ValidationError;

const COOLDOWN_POLL: Duration = Duration::from_secs(1);

/// The two enrichment stages, run strictly one after the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Identity,
    Sector,
}

impl Stage {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Sector => "sector",
        }
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Starting value of a knob and the range it is kept in.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Bounds<T> {
    pub initial: T,
    pub min: T,
    pub max: T,
}

impl<T: Copy + PartialOrd + Debug> Bounds<T> {
    pub const fn new(initial: T, min: T, max: T) -> Self {
        Self { initial, min, max }
    }

    pub fn contains(&self, value: T) -> bool {
        value >= self.min && value <= self.max
    }

    fn validate(&self, field: &'static str) -> Result<(), ValidationError> {
        if self.min > self.max {
            return Err(ValidationError::InvertedBounds {
                field,
                min: format!("{:?}", self.min),
                max: format!("{:?}", self.max),
            });
        }
        if !self.contains(self.initial) {
            return Err(ValidationError::InitialOutOfBounds {
                field,
                initial: format!("{:?}", self.initial),
                min: format!("{:?}", self.min),
                max: format!("{:?}", self.max),
            });
        }
        Ok(())
    }
}

/// Worker and pacing bounds for one stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StageKnobs {
    pub workers: Bounds<usize>,
    pub delay: Bounds<Duration>,
}

impl StageKnobs {
    fn validate(&self, workers: &'static str, delay: &'static str) -> Result<(), ValidationError> {
        if self.workers.min == 0 {
            return Err(ValidationError::NonPositiveValue { field: workers });
        }
        self.workers.validate(workers)?;
        self.delay.validate(delay)
    }

    fn initial_limits(&self) -> StageLimits {
        StageLimits {
            workers: self.workers.initial,
            delay: self.delay.initial,
        }
    }
}

/// Tunables of the adaptive controller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControllerConfig {
    pub identity: StageKnobs,
    pub sector: StageKnobs,
    /// Global request rate in requests per second.
    pub rate: Bounds<f64>,
    pub burst: u32,
    /// Calls per adaptive window.
    pub window_size: usize,
    /// A window is throttled when its rate-limited share exceeds this.
    pub throttle_threshold: f64,
    pub delay_step: Duration,
    pub rate_step: f64,
    pub healthy_windows_to_scale_up: u32,
    pub max_throttled_windows: u32,
    pub cooldown: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            identity: StageKnobs {
                workers: Bounds::new(2, 1, 4),
                delay: Bounds::new(
                    Duration::from_millis(180),
                    Duration::from_millis(80),
                    Duration::from_millis(1_200),
                ),
            },
            sector: StageKnobs {
                workers: Bounds::new(3, 1, 5),
                delay: Bounds::new(
                    Duration::from_millis(220),
                    Duration::from_millis(100),
                    Duration::from_millis(1_500),
                ),
            },
            rate: Bounds::new(1.5, 0.6, 1.5),
            burst: 3,
            window_size: 120,
            throttle_threshold: 0.03,
            delay_step: Duration::from_millis(80),
            rate_step: 0.2,
            healthy_windows_to_scale_up: 3,
            max_throttled_windows: 6,
            cooldown: Duration::from_secs(15),
        }
    }
}

impl ControllerConfig {
    pub fn stage(&self, stage: Stage) -> &StageKnobs {
        match stage {
            Stage::Identity => &self.identity,
            Stage::Sector => &self.sector,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.identity
            .validate("identity_workers", "identity_delay")?;
        self.sector.validate("sector_workers", "sector_delay")?;

        for (field, value) in [
            ("rate_initial", self.rate.initial),
            ("rate_min", self.rate.min),
            ("rate_max", self.rate.max),
            ("rate_step", self.rate_step),
            ("throttle_threshold", self.throttle_threshold),
        ] {
            if !value.is_finite() {
                return Err(ValidationError::NonFiniteValue { field });
            }
        }
        if self.rate.min <= 0.0 {
            return Err(ValidationError::NonPositiveValue { field: "rate_min" });
        }
        self.rate.validate("rate")?;
        if self.rate_step < 0.0 {
            return Err(ValidationError::NonPositiveValue { field: "rate_step" });
        }
        if self.throttle_threshold < 0.0 {
            return Err(ValidationError::NonPositiveValue {
                field: "throttle_threshold",
            });
        }

        for (field, value) in [
            ("burst", self.burst as usize),
            ("window_size", self.window_size),
            (
                "healthy_windows_to_scale_up",
                self.healthy_windows_to_scale_up as usize,
            ),
            ("max_throttled_windows", self.max_throttled_windows as usize),
        ] {
            if value == 0 {
                return Err(ValidationError::NonPositiveValue { field });
            }
        }

        Ok(())
    }
}

/// Live worker ceiling and pacing delay for a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StageLimits {
    pub workers: usize,
    pub delay: Duration,
}

/// What a closed window did to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    /// Empty window, nothing changed.
    Ignored,
    /// Throttled window: knobs backed off and cooldown extended.
    BackedOff { throttled_streak: u32, stopped: bool },
    /// Healthy window that has not completed a scale-up streak yet.
    Healthy { healthy_streak: u32 },
    /// Healthy streak completed: knobs scaled up one step.
    ScaledUp,
}

/// Final knob values, reported in the run summary.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ControllerSnapshot {
    pub identity_workers: usize,
    pub sector_workers: usize,
    pub identity_delay_ms: u64,
    pub sector_delay_ms: u64,
    pub global_rate: f64,
    pub healthy_streak: u32,
    pub throttled_streak: u32,
    pub stop_requested: bool,
}

#[derive(Debug)]
struct ControllerState {
    identity: StageLimits,
    sector: StageLimits,
    rate: f64,
    healthy_streak: u32,
    throttled_streak: u32,
    cooldown_until: Option<Instant>,
    stopped: bool,
}

impl ControllerState {
    fn stage_mut(&mut self, stage: Stage) -> &mut StageLimits {
        match stage {
            Stage::Identity => &mut self.identity,
            Stage::Sector => &mut self.sector,
        }
    }
}

/// Shared controller consulted by every worker before each call.
#[derive(Debug)]
pub struct AdaptiveController {
    config: ControllerConfig,
    limiter: Arc<TokenBucket>,
    state: Mutex<ControllerState>,
}

impl AdaptiveController {
    /// Builds a controller at the configured initial knob values and sets the
    /// limiter to the initial rate.
    pub fn new(config: ControllerConfig, limiter: Arc<TokenBucket>) -> Self {
        limiter.set_rate(config.rate.initial);
        let state = ControllerState {
            identity: config.identity.initial_limits(),
            sector: config.sector.initial_limits(),
            rate: config.rate.initial,
            healthy_streak: 0,
            throttled_streak: 0,
            cooldown_until: None,
            stopped: false,
        };

        Self {
            config,
            limiter,
            state: Mutex::new(state),
        }
    }

    /// Builds a controller together with a fresh limiter at the initial rate.
    pub fn with_limiter(config: ControllerConfig) -> Self {
        let limiter = Arc::new(TokenBucket::new(config.rate.initial, config.burst));
        Self::new(config, limiter)
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn limiter(&self) -> &TokenBucket {
        &self.limiter
    }

    /// Live limits for a stage. Callers must re-read these at every
    /// scheduling decision.
    pub fn current_limits(&self, stage: Stage) -> StageLimits {
        *self.lock().stage_mut(stage)
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    /// Time left until the cooldown deadline, if one is pending.
    pub fn cooldown_remaining(&self) -> Option<Duration> {
        let deadline = self.lock().cooldown_until?;
        let remaining = deadline.saturating_duration_since(Instant::now());
        (!remaining.is_zero()).then_some(remaining)
    }

    /// Waits until the cooldown deadline has passed or the stop flag is set.
    ///
    /// Sleeps in slices of at most one second so that an extended deadline
    /// or a stop set meanwhile is picked up.
    pub async fn await_cooldown(&self) {
        loop {
            if self.is_stopped() {
                return;
            }
            let Some(remaining) = self.cooldown_remaining() else {
                return;
            };
            tokio::time::sleep(remaining.min(COOLDOWN_POLL)).await;
        }
    }

    /// Feeds one closed window into the state machine.
    pub fn observe_window(&self, total: usize, throttled: usize) -> Adjustment {
        if total == 0 {
            return Adjustment::Ignored;
        }

        let ratio = throttled as f64 / total as f64;
        let config = &self.config;
        let mut state = self.lock();

        if ratio > config.throttle_threshold {
            state.healthy_streak = 0;
            state.throttled_streak = state.throttled_streak.saturating_add(1);

            for stage in [Stage::Identity, Stage::Sector] {
                let knobs = config.stage(stage);
                let limits = state.stage_mut(stage);
                limits.workers = limits.workers.saturating_sub(1).max(knobs.workers.min);
                limits.delay = (limits.delay + config.delay_step).min(knobs.delay.max);
            }
            state.rate = (state.rate - config.rate_step).max(config.rate.min);
            self.limiter.set_rate(state.rate);

            let deadline = Instant::now() + config.cooldown;
            state.cooldown_until = Some(match state.cooldown_until {
                Some(current) => current.max(deadline),
                None => deadline,
            });

            if state.throttled_streak >= config.max_throttled_windows {
                state.stopped = true;
            }

            tracing::warn!(
                total,
                throttled,
                ratio,
                identity_workers = state.identity.workers,
                sector_workers = state.sector.workers,
                global_rate = state.rate,
                throttled_streak = state.throttled_streak,
                "throttled window, backing off"
            );
            if state.stopped {
                tracing::error!(
                    throttled_streak = state.throttled_streak,
                    "sustained throttling, no new lookups will be started"
                );
            }

            return Adjustment::BackedOff {
                throttled_streak: state.throttled_streak,
                stopped: state.stopped,
            };
        }

        state.throttled_streak = 0;
        state.healthy_streak = state.healthy_streak.saturating_add(1);
        if state.healthy_streak < config.healthy_windows_to_scale_up {
            return Adjustment::Healthy {
                healthy_streak: state.healthy_streak,
            };
        }

        for stage in [Stage::Identity, Stage::Sector] {
            let knobs = config.stage(stage);
            let limits = state.stage_mut(stage);
            limits.workers = (limits.workers + 1).min(knobs.workers.max);
            limits.delay = limits
                .delay
                .saturating_sub(config.delay_step)
                .max(knobs.delay.min);
        }
        state.rate = (state.rate + config.rate_step).min(config.rate.max);
        self.limiter.set_rate(state.rate);
        state.healthy_streak = 0;

        tracing::info!(
            identity_workers = state.identity.workers,
            sector_workers = state.sector.workers,
            global_rate = state.rate,
            "healthy streak, scaling up"
        );

        Adjustment::ScaledUp
    }

    pub fn snapshot(&self) -> ControllerSnapshot {
        let state = self.lock();
        ControllerSnapshot {
            identity_workers: state.identity.workers,
            sector_workers: state.sector.workers,
            identity_delay_ms: state.identity.delay.as_millis() as u64,
            sector_delay_ms: state.sector.delay.as_millis() as u64,
            global_rate: state.rate,
            healthy_streak: state.healthy_streak,
            throttled_streak: state.throttled_streak,
            stop_requested: state.stopped,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ControllerState> {
        self.state
            .lock()
            .expect("adaptive controller lock is not poisoned")
    }
}
