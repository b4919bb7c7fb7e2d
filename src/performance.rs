//! Adaptive performance controller
//!
//! Turns the renderer's frame metrics into a live [`PerformanceSettings`]
//! snapshot. Every `adapt_interval` the controller picks a performance mode from
//! the smoothed FPS and nudges the Barnes-Hut theta: up (coarser, faster) when
//! frames are slow, down (finer) when there is headroom.
//!
//! The controller never fails; bad samples are ignored and out-of-range targets
//! are clamped.
//!
//! Consumers that live elsewhere (a [`SimulationHost`](crate::SimulationHost)
//! on another task) follow the settings through [`PerformanceController::subscribe`],
//! a `watch` channel that only ticks when the snapshot actually changes.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

use crate::error::{LayoutError, Result};
use crate::observer::{LayoutObserver, TracingObserver};

/// Theta step when FPS is below the minimum
const THETA_STEP_CRITICAL: f32 = 0.10;

/// Theta step when FPS is below 80% of target
const THETA_STEP_SLOW: f32 = 0.05;

/// Theta step back toward accuracy when FPS is above 95% of target
const THETA_STEP_RECOVER: f32 = 0.02;

/// Minimum FPS never drops below this, whatever the target
const MIN_FPS_FLOOR: f32 = 30.0;

/// Discrete fidelity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PerformanceMode {
    UltraPerformance,
    Performance,
    Balanced,
    Quality,
}

/// Render budget bundled with a mode
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModeProfile {
    pub edge_lod_distance: f32,
    pub label_lod_distance: f32,
    pub shadows_enabled: bool,
    pub node_limit: Option<usize>,
    pub edge_limit: Option<usize>,
}

impl PerformanceMode {
    /// Mode for `average_fps / target_fps`
    pub fn for_ratio(ratio: f32) -> Self {
        if ratio < 0.5 {
            PerformanceMode::UltraPerformance
        } else if ratio < 0.8 {
            PerformanceMode::Performance
        } else if ratio < 0.95 {
            PerformanceMode::Balanced
        } else {
            PerformanceMode::Quality
        }
    }

    pub fn profile(self) -> ModeProfile {
        match self {
            PerformanceMode::UltraPerformance => ModeProfile {
                edge_lod_distance: 200.0,
                label_lod_distance: 100.0,
                shadows_enabled: false,
                node_limit: Some(1_000),
                edge_limit: Some(2_000),
            },
            PerformanceMode::Performance => ModeProfile {
                edge_lod_distance: 500.0,
                label_lod_distance: 200.0,
                shadows_enabled: false,
                node_limit: Some(5_000),
                edge_limit: Some(10_000),
            },
            PerformanceMode::Balanced => ModeProfile {
                edge_lod_distance: 1_000.0,
                label_lod_distance: 400.0,
                shadows_enabled: true,
                node_limit: Some(20_000),
                edge_limit: Some(40_000),
            },
            PerformanceMode::Quality => ModeProfile {
                edge_lod_distance: 2_000.0,
                label_lod_distance: 800.0,
                shadows_enabled: true,
                node_limit: None,
                edge_limit: None,
            },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PerformanceMode::UltraPerformance => "ultra-performance",
            PerformanceMode::Performance => "performance",
            PerformanceMode::Balanced => "balanced",
            PerformanceMode::Quality => "quality",
        }
    }
}

impl fmt::Display for PerformanceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Frame metrics pushed by the renderer once per reporting interval
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSample {
    pub fps: f32,
    /// Milliseconds per frame
    pub frame_time: f32,
    pub node_count: usize,
    pub edge_count: usize,
    /// Bytes, when the renderer can measure it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_usage: Option<u64>,
}

impl PerformanceSample {
    pub fn new(fps: f32, node_count: usize, edge_count: usize) -> Self {
        Self {
            fps,
            frame_time: if fps > 0.0 { 1000.0 / fps } else { 0.0 },
            node_count,
            edge_count,
            memory_usage: None,
        }
    }
}

/// Settings read by the simulation host and the renderer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSettings {
    pub barnes_hut_theta: f32,
    #[serde(rename = "edgeLODDistance")]
    pub edge_lod_distance: f32,
    #[serde(rename = "labelLODDistance")]
    pub label_lod_distance: f32,
    pub shadows_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_render_limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_render_limit: Option<usize>,
}

/// Controller tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub target_fps: f32,
    /// Minimum time between two adaptations
    pub adapt_interval_ms: u64,
    /// Number of FPS samples in the moving average
    pub window_size: usize,
    pub theta_min: f32,
    pub theta_max: f32,
    pub initial_theta: f32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            target_fps: 60.0,
            adapt_interval_ms: 500,
            window_size: 10,
            theta_min: 0.3,
            theta_max: 0.9,
            initial_theta: 0.5,
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.target_fps.is_finite() || self.target_fps <= 0.0 {
            return Err(LayoutError::InvalidParameter(format!(
                "target_fps must be positive, got {}",
                self.target_fps
            )));
        }
        if self.window_size == 0 {
            return Err(LayoutError::InvalidParameter(
                "window_size must be at least 1".to_string(),
            ));
        }
        if !(0.0 <= self.theta_min && self.theta_min <= self.theta_max) {
            return Err(LayoutError::InvalidParameter(format!(
                "theta bounds must satisfy 0 <= min <= max, got [{}, {}]",
                self.theta_min, self.theta_max
            )));
        }
        if !(self.theta_min..=self.theta_max).contains(&self.initial_theta) {
            return Err(LayoutError::InvalidParameter(format!(
                "initial_theta {} is outside [{}, {}]",
                self.initial_theta, self.theta_min, self.theta_max
            )));
        }
        Ok(())
    }

    pub fn adapt_interval(&self) -> Duration {
        Duration::from_millis(self.adapt_interval_ms)
    }
}

/// Time source, injectable for tests
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Closed-loop FPS controller
pub struct PerformanceController {
    config: ControllerConfig,
    target_fps: f32,
    min_fps: f32,
    window: VecDeque<f32>,
    theta: f32,
    mode: PerformanceMode,
    forced_mode: Option<PerformanceMode>,
    last_adapted: Instant,
    last_sample: Option<PerformanceSample>,
    adaptations: u64,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn LayoutObserver>,
    settings: watch::Sender<PerformanceSettings>,
}

impl PerformanceController {
    pub fn new(config: ControllerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: ControllerConfig, clock: Arc<dyn Clock>) -> Self {
        let target_fps = sanitize_target(config.target_fps);
        let theta = clamp_theta(&config, config.initial_theta);
        let (settings, _) = watch::channel(settings_for(PerformanceMode::Balanced, theta, None));
        Self {
            target_fps,
            min_fps: min_fps_for(target_fps),
            window: VecDeque::with_capacity(config.window_size.max(1)),
            theta,
            mode: PerformanceMode::Balanced,
            forced_mode: None,
            last_adapted: clock.now(),
            last_sample: None,
            adaptations: 0,
            clock,
            observer: Arc::new(TracingObserver),
            settings,
            config,
        }
    }

    /// Replace the observer notified of mode and theta changes
    pub fn with_observer(mut self, observer: Arc<dyn LayoutObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Feed one frame-metrics sample
    pub fn record_sample(&mut self, sample: PerformanceSample) {
        if !sample.fps.is_finite() || sample.fps < 0.0 {
            debug!(fps = sample.fps, "ignoring invalid performance sample");
            return;
        }

        self.window.push_back(sample.fps);
        while self.window.len() > self.config.window_size.max(1) {
            self.window.pop_front();
        }
        self.last_sample = Some(sample);

        let now = self.clock.now();
        if now.saturating_duration_since(self.last_adapted) >= self.config.adapt_interval() {
            self.adapt(now);
        }
        self.publish();
    }

    fn adapt(&mut self, now: Instant) {
        let average = self.current_fps();
        self.last_adapted = now;
        self.adaptations += 1;

        if self.forced_mode.is_none() {
            self.set_mode(PerformanceMode::for_ratio(average / self.target_fps));
        }
        self.tune_theta(average);
    }

    fn tune_theta(&mut self, average: f32) {
        let min = self.config.theta_min;
        let before = self.theta;

        let next = if average < self.min_fps {
            before + THETA_STEP_CRITICAL
        } else if average < self.target_fps * 0.8 {
            before + THETA_STEP_SLOW
        } else if average > self.target_fps * 0.95 && before > min {
            before - THETA_STEP_RECOVER
        } else {
            before
        };
        self.theta = clamp_theta(&self.config, next);

        if self.theta != before {
            self.observer.theta_adjusted(before, self.theta, average);
        }
    }

    fn set_mode(&mut self, mode: PerformanceMode) {
        if mode == self.mode {
            return;
        }
        let previous = self.mode;
        self.mode = mode;
        self.observer.mode_changed(previous, mode);
    }

    /// Immutable snapshot of the current settings
    pub fn performance_settings(&self) -> PerformanceSettings {
        settings_for(self.mode, self.theta, self.last_sample.as_ref())
    }

    /// Follow the settings; the receiver sees a new value whenever the snapshot changes
    pub fn subscribe(&self) -> watch::Receiver<PerformanceSettings> {
        self.settings.subscribe()
    }

    fn publish(&self) {
        let snapshot = self.performance_settings();
        self.settings.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
    }

    /// Moving-average FPS over the sample window (0 before the first sample)
    pub fn current_fps(&self) -> f32 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().sum::<f32>() / self.window.len() as f32
    }

    pub fn mode(&self) -> PerformanceMode {
        self.mode
    }

    pub fn theta(&self) -> f32 {
        self.theta
    }

    pub fn target_fps(&self) -> f32 {
        self.target_fps
    }

    pub fn min_fps(&self) -> f32 {
        self.min_fps
    }

    pub fn forced_mode(&self) -> Option<PerformanceMode> {
        self.forced_mode
    }

    pub fn last_sample(&self) -> Option<&PerformanceSample> {
        self.last_sample.as_ref()
    }

    /// Number of adaptation ticks so far
    pub fn adaptation_count(&self) -> u64 {
        self.adaptations
    }

    /// Clear history and override, restoring the initial theta and `balanced`
    pub fn reset(&mut self) {
        self.window.clear();
        self.last_sample = None;
        self.forced_mode = None;
        self.theta = clamp_theta(&self.config, self.config.initial_theta);
        self.set_mode(PerformanceMode::Balanced);
        self.last_adapted = self.clock.now();
        self.publish();
    }

    /// Change the target; non-positive or non-finite values fall back to 1 FPS
    pub fn set_target_fps(&mut self, fps: f32) {
        self.target_fps = sanitize_target(fps);
        self.min_fps = min_fps_for(self.target_fps);
        debug!(target_fps = self.target_fps, min_fps = self.min_fps, "target fps updated");
    }

    /// Pin the mode; theta keeps adapting
    pub fn force_mode(&mut self, mode: PerformanceMode) {
        self.forced_mode = Some(mode);
        self.set_mode(mode);
        self.publish();
    }

    /// Return to automatic mode selection at the next adaptation
    pub fn clear_forced_mode(&mut self) {
        self.forced_mode = None;
    }
}

fn settings_for(
    mode: PerformanceMode,
    theta: f32,
    last_sample: Option<&PerformanceSample>,
) -> PerformanceSettings {
    let profile = mode.profile();
    let limit = |mode_limit: Option<usize>, actual: Option<usize>| match (mode_limit, actual) {
        (Some(limit), Some(actual)) => Some(limit.min(actual)),
        (limit, _) => limit,
    };

    PerformanceSettings {
        barnes_hut_theta: theta,
        edge_lod_distance: profile.edge_lod_distance,
        label_lod_distance: profile.label_lod_distance,
        shadows_enabled: profile.shadows_enabled,
        node_render_limit: limit(profile.node_limit, last_sample.map(|s| s.node_count)),
        edge_render_limit: limit(profile.edge_limit, last_sample.map(|s| s.edge_count)),
    }
}

/// Keep theta within the configured bounds without panicking on unvalidated configs
fn clamp_theta(config: &ControllerConfig, theta: f32) -> f32 {
    theta.min(config.theta_max).max(config.theta_min)
}

fn sanitize_target(fps: f32) -> f32 {
    if fps.is_finite() && fps > 0.0 { fps } else { 1.0 }
}

fn min_fps_for(target_fps: f32) -> f32 {
    MIN_FPS_FLOOR.max(target_fps * 0.5)
}
