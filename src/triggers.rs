//! Built-in triggers
//!
//! Triggers are polled after every leaf action completes and may run a
//! side-sequence before the next leaf starts. State persists across polls
//! within one run and is cleared by `initialize`.

use crate::device_ops::PierSide;
use crate::error::ItemError;
use crate::item::{EntityMeta, ExecutionContext, Trigger};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;

fn config_of<T: Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

// =============================================================================
// MERIDIAN FLIP
// =============================================================================

/// Timing policy for the meridian flip. All thresholds are configuration;
/// the defaults are tuned for a typical German equatorial mount.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeridianFlipConfig {
    /// Earliest point in the countdown at which a flip may fire, seconds
    /// before the crossing.
    pub minimum_time_remaining_secs: f64,
    /// Latest point: with more than this remaining the trigger stays quiet.
    pub maximum_time_remaining_secs: f64,
    /// How long past the countdown a "delayed flip" may still fire when the
    /// pier side never confirmed the crossing.
    pub grace_period_secs: f64,
    /// Minimum interval between two fires; a meridian crossing recurs about
    /// once per sidereal day, so anything under ~12 h is the same crossing.
    pub min_interval_between_flips_secs: f64,
    /// Settle time after the flip slew, seconds.
    pub settle_secs: f64,
    /// Consult the mount's reported pier side as the authoritative signal.
    pub use_pier_side: bool,
}

impl Default for MeridianFlipConfig {
    fn default() -> Self {
        Self {
            minimum_time_remaining_secs: 0.0,
            maximum_time_remaining_secs: 300.0,
            grace_period_secs: 300.0,
            min_interval_between_flips_secs: 11.0 * 3600.0,
            settle_secs: 10.0,
            use_pier_side: true,
        }
    }
}

/// Flips the mount when the target approaches the meridian.
///
/// The estimated countdown from the ephemeris arms the trigger inside
/// `[minimum, maximum]` seconds before the crossing. When the mount reports a
/// pier side, that signal wins over the estimate and any disagreement is
/// logged. If the countdown expires without pier-side confirmation the
/// trigger fires anyway ("delayed flip"), bounded by the grace period so it
/// cannot keep firing forever.
pub struct MeridianFlipTrigger {
    pub config: MeridianFlipConfig,
    last_fired: Option<DateTime<Utc>>,
    side_at_arm: Option<PierSide>,
    gave_up: bool,
}

impl MeridianFlipTrigger {
    pub fn new(config: MeridianFlipConfig) -> Self {
        Self {
            config,
            last_fired: None,
            side_at_arm: None,
            gave_up: false,
        }
    }

    pub fn last_fired(&self) -> Option<DateTime<Utc>> {
        self.last_fired
    }

    /// Read the pier side if configured and the mount reports one.
    async fn pier_side(&self, ctx: &ExecutionContext) -> Option<PierSide> {
        if !self.config.use_pier_side {
            return None;
        }
        match ctx.device_ops.mount_side_of_pier().await {
            Ok(PierSide::Unknown) | Err(_) => None,
            Ok(side) => Some(side),
        }
    }

    /// Decide based on a countdown (seconds until crossing, negative past it)
    /// and the optionally observed pier side. Split out for testability.
    fn decide(&mut self, remaining_secs: f64, observed_side: Option<PierSide>, now: DateTime<Utc>) -> bool {
        if let Some(last) = self.last_fired {
            let since = (now - last).num_seconds() as f64;
            if since < self.config.min_interval_between_flips_secs {
                return false;
            }
        }

        let already_flipped = match (self.side_at_arm, observed_side) {
            (Some(armed), Some(current)) => armed != current,
            _ => false,
        };

        if remaining_secs > self.config.maximum_time_remaining_secs {
            if already_flipped {
                // Authoritative signal says the flip happened while the
                // countdown claims it is far away. Trust the mount.
                tracing::warn!(
                    "Pier side changed with {:.0}s still on the countdown; treating crossing as done",
                    remaining_secs
                );
                self.consume_crossing(observed_side, now);
            }
            return false;
        }

        if remaining_secs >= self.config.minimum_time_remaining_secs {
            // Inside the window.
            if already_flipped {
                tracing::warn!(
                    "Countdown at {:.0}s but mount already reports the far pier side; skipping flip",
                    remaining_secs
                );
                self.consume_crossing(observed_side, now);
                return false;
            }
            return true;
        }

        // Countdown expired. Delayed-fire policy, bounded by the grace window.
        if already_flipped {
            self.consume_crossing(observed_side, now);
            return false;
        }
        let overdue = self.config.minimum_time_remaining_secs - remaining_secs;
        if overdue <= self.config.grace_period_secs {
            tracing::warn!(
                "Meridian countdown overdue by {:.0}s without pier-side confirmation; firing delayed flip",
                overdue
            );
            return true;
        }
        if !self.gave_up {
            tracing::warn!(
                "Meridian crossing missed by more than the {:.0}s grace period; giving up on this crossing",
                self.config.grace_period_secs
            );
            self.gave_up = true;
        }
        false
    }

    fn consume_crossing(&mut self, observed_side: Option<PierSide>, now: DateTime<Utc>) {
        self.last_fired = Some(now);
        self.side_at_arm = observed_side;
        self.gave_up = false;
    }
}

#[async_trait]
impl Trigger for MeridianFlipTrigger {
    fn type_tag(&self) -> &str {
        "MeridianFlip"
    }

    async fn initialize(&mut self, ctx: &ExecutionContext) {
        self.last_fired = None;
        self.gave_up = false;
        self.side_at_arm = self.pier_side(ctx).await;
    }

    async fn should_fire(&mut self, ctx: &ExecutionContext, _next: Option<&EntityMeta>) -> bool {
        let (target, longitude) = match (&ctx.target, ctx.longitude) {
            (Some(t), Some(lon)) => (t, lon),
            _ => return false,
        };

        let now = Utc::now();
        let remaining = ctx
            .ephemeris
            .time_to_meridian(target.ra_hours, longitude, now);
        let remaining_secs = remaining.num_milliseconds() as f64 / 1000.0;
        tracing::trace!("Meridian countdown: {:.0}s", remaining_secs);

        let observed_side = self.pier_side(ctx).await;
        self.decide(remaining_secs, observed_side, now)
    }

    async fn execute(&mut self, ctx: &ExecutionContext) -> Result<(), ItemError> {
        let target = ctx
            .target
            .clone()
            .ok_or_else(|| ItemError::Failed("no target for meridian flip".into()))?;

        tracing::info!("=== Meridian flip started ===");
        ctx.report("MeridianFlip", "Starting meridian flip");

        // Mark the crossing consumed up front so a failing flip cannot refire
        // in a tight loop; the inter-fire guard covers the retry.
        let side_before = self.pier_side(ctx).await;
        self.consume_crossing(side_before, Utc::now());

        let was_tracking = ctx.device_ops.mount_is_tracking().await.unwrap_or(true);
        if was_tracking {
            if let Err(e) = ctx.device_ops.mount_set_tracking(false).await {
                tracing::warn!("Could not stop tracking before flip: {}", e);
            }
        }

        // A flip is a slew to the same coordinates once past the meridian.
        ctx.device_ops
            .mount_slew_to_coordinates(target.ra_hours, target.dec_degrees)
            .await?;

        let slew_started = std::time::Instant::now();
        loop {
            if ctx.is_cancelled() {
                let _ = ctx.device_ops.mount_abort_slew().await;
                return Err(ItemError::Cancelled);
            }
            match ctx.device_ops.mount_is_slewing().await {
                Ok(false) => break,
                Ok(true) => {}
                Err(e) => return Err(ItemError::Failed(e)),
            }
            if slew_started.elapsed() > Duration::from_secs(300) {
                return Err(ItemError::Failed("flip slew timed out".into()));
            }
            sleep(Duration::from_millis(100)).await;
        }

        let side_after = self.pier_side(ctx).await;
        match (side_before, side_after) {
            (Some(before), Some(after)) if before == after => {
                tracing::warn!("Pier side did not change after flip ({:?})", after);
            }
            (Some(before), Some(after)) => {
                tracing::info!("Flip verified: pier side {:?} -> {:?}", before, after);
            }
            _ => {
                tracing::info!("Mount does not report pier side; assuming flip completed");
            }
        }
        self.side_at_arm = side_after;

        if was_tracking {
            ctx.device_ops.mount_set_tracking(true).await?;
        }

        let settle_steps = (self.config.settle_secs * 10.0) as u64;
        for _ in 0..settle_steps {
            if ctx.is_cancelled() {
                return Err(ItemError::Cancelled);
            }
            sleep(Duration::from_millis(100)).await;
        }

        ctx.report("MeridianFlip", "Meridian flip complete");
        Ok(())
    }

    fn config(&self) -> serde_json::Value {
        config_of(&self.config)
    }

    fn clone_boxed(&self) -> Box<dyn Trigger> {
        Box::new(MeridianFlipTrigger::new(self.config.clone()))
    }
}

// =============================================================================
// AUTOFOCUS
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutofocusConfig {
    /// Focuser steps between sample points.
    pub step_size: i32,
    /// Sample points on each side of the starting position.
    pub steps_each_side: u32,
    pub exposure_secs: f64,
    /// Refocus when the latest HFR exceeds the post-focus baseline by this
    /// fraction (0.15 = 15 %).
    pub hfr_increase_fraction: f64,
    /// Refocus after a filter change.
    pub refocus_on_filter_change: bool,
}

impl Default for AutofocusConfig {
    fn default() -> Self {
        Self {
            step_size: 100,
            steps_each_side: 3,
            exposure_secs: 3.0,
            hfr_increase_fraction: 0.15,
            refocus_on_filter_change: true,
        }
    }
}

/// Runs an autofocus sweep when focus quality degrades or the filter changes.
pub struct AutofocusTrigger {
    pub config: AutofocusConfig,
    baseline_hfr: Option<f64>,
    filter_at_last_focus: Option<String>,
}

impl AutofocusTrigger {
    pub fn new(config: AutofocusConfig) -> Self {
        Self {
            config,
            baseline_hfr: None,
            filter_at_last_focus: None,
        }
    }
}

#[async_trait]
impl Trigger for AutofocusTrigger {
    fn type_tag(&self) -> &str {
        "Autofocus"
    }

    async fn initialize(&mut self, ctx: &ExecutionContext) {
        self.baseline_hfr = None;
        self.filter_at_last_focus = ctx.stats().current_filter;
    }

    async fn should_fire(&mut self, ctx: &ExecutionContext, _next: Option<&EntityMeta>) -> bool {
        let stats = ctx.stats();

        if self.config.refocus_on_filter_change && stats.current_filter != self.filter_at_last_focus
        {
            tracing::info!(
                "Filter changed ({:?} -> {:?}), autofocus needed",
                self.filter_at_last_focus,
                stats.current_filter
            );
            return true;
        }

        if let (Some(baseline), Some(latest)) = (self.baseline_hfr, stats.latest_hfr()) {
            if latest > baseline * (1.0 + self.config.hfr_increase_fraction) {
                tracing::info!(
                    "HFR {:.2} exceeds baseline {:.2} by more than {:.0}%, autofocus needed",
                    latest,
                    baseline,
                    self.config.hfr_increase_fraction * 100.0
                );
                return true;
            }
        }

        false
    }

    async fn execute(&mut self, ctx: &ExecutionContext) -> Result<(), ItemError> {
        tracing::info!("Autofocus sweep started");
        ctx.report("Autofocus", "Starting focus sweep");

        let span = self.config.steps_each_side as i32;
        // Walk to the near end of the sweep, then sample across it.
        ctx.device_ops
            .focuser_move_relative(-span * self.config.step_size)
            .await?;

        let mut best: Option<(i32, f64)> = None;
        for point in 0..=(2 * span) {
            if ctx.is_cancelled() {
                return Err(ItemError::Cancelled);
            }
            if point > 0 {
                ctx.device_ops
                    .focuser_move_relative(self.config.step_size)
                    .await?;
            }

            let report = ctx
                .device_ops
                .camera_start_exposure(self.config.exposure_secs, None, 1)
                .await?;
            let Some(hfr) = report.hfr else {
                return Err(ItemError::Failed(
                    "autofocus requires HFR measurement from the broker".into(),
                ));
            };

            let offset = (point - span) * self.config.step_size;
            tracing::debug!("Focus sample at offset {}: HFR {:.2}", offset, hfr);
            if best.map(|(_, b)| hfr < b).unwrap_or(true) {
                best = Some((offset, hfr));
            }
        }

        let (best_offset, best_hfr) =
            best.ok_or_else(|| ItemError::Failed("autofocus collected no samples".into()))?;

        // Return from the far end of the sweep to the best position.
        let current_offset = span * self.config.step_size;
        ctx.device_ops
            .focuser_move_relative(best_offset - current_offset)
            .await?;

        self.baseline_hfr = Some(best_hfr);
        self.filter_at_last_focus = ctx.stats().current_filter;
        ctx.update_stats(|s| s.hfr_history.push(best_hfr));

        tracing::info!(
            "Autofocus complete: offset {}, HFR {:.2}",
            best_offset,
            best_hfr
        );
        ctx.report("Autofocus", format!("Focus complete, HFR {:.2}", best_hfr));
        Ok(())
    }

    fn config(&self) -> serde_json::Value {
        config_of(&self.config)
    }

    fn clone_boxed(&self) -> Box<dyn Trigger> {
        Box::new(AutofocusTrigger::new(self.config.clone()))
    }
}
