//! Built-in actions
//!
//! Each action is one domain operation against the device broker. Actions are
//! validated before execution (issues skip the node) and observe the run's
//! cancellation flag at least once per unit of work.

use crate::error::ItemError;
use crate::item::{Action, ExecutionContext};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;

fn config_of<T: Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

/// Poll interval for device state and cancellation checks.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

async fn wait_until_idle<F, Fut>(
    ctx: &ExecutionContext,
    timeout: Duration,
    mut still_busy: F,
) -> Result<(), ItemError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<bool, String>>,
{
    let started = std::time::Instant::now();
    loop {
        if ctx.is_cancelled() {
            return Err(ItemError::Cancelled);
        }
        match still_busy().await {
            Ok(false) => return Ok(()),
            Ok(true) => {}
            Err(e) => return Err(ItemError::Failed(e)),
        }
        if started.elapsed() > timeout {
            return Err(ItemError::Failed("timed out waiting for device".into()));
        }
        sleep(POLL_INTERVAL).await;
    }
}

// =============================================================================
// TAKE EXPOSURE
// =============================================================================

/// Take one or more exposures with the active camera.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TakeExposure {
    pub duration_secs: f64,
    pub count: u32,
    pub gain: Option<i32>,
    pub binning: u32,
}

impl Default for TakeExposure {
    fn default() -> Self {
        Self {
            duration_secs: 60.0,
            count: 1,
            gain: None,
            binning: 1,
        }
    }
}

#[async_trait]
impl Action for TakeExposure {
    fn type_tag(&self) -> &str {
        "TakeExposure"
    }

    async fn validate(&self, ctx: &ExecutionContext) -> Vec<String> {
        let mut issues = Vec::new();
        if !ctx.device_ops.camera_connected().await {
            issues.push("Camera not connected".to_string());
        }
        if self.duration_secs <= 0.0 {
            issues.push("Exposure duration must be positive".to_string());
        }
        issues
    }

    async fn execute(&mut self, ctx: &ExecutionContext) -> Result<(), ItemError> {
        for frame in 1..=self.count {
            if ctx.is_cancelled() {
                let _ = ctx.device_ops.camera_abort_exposure().await;
                return Err(ItemError::Cancelled);
            }

            ctx.report("TakeExposure", format!("Frame {}/{}", frame, self.count));

            let report = ctx
                .device_ops
                .camera_start_exposure(self.duration_secs, self.gain, self.binning)
                .await?;

            ctx.update_stats(|s| {
                s.completed_exposures += 1;
                s.completed_integration_secs += report.duration_secs;
                if let Some(hfr) = report.hfr {
                    s.hfr_history.push(hfr);
                }
            });
        }

        tracing::info!(
            "Completed {} exposures of {:.1}s",
            self.count,
            self.duration_secs
        );
        Ok(())
    }

    fn config(&self) -> serde_json::Value {
        config_of(self)
    }

    fn clone_boxed(&self) -> Box<dyn Action> {
        Box::new(self.clone())
    }
}

// =============================================================================
// SLEW TO TARGET
// =============================================================================

/// Slew the mount to fixed coordinates, or to the plan target if none given.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlewToTarget {
    pub ra_hours: Option<f64>,
    pub dec_degrees: Option<f64>,
}

impl SlewToTarget {
    fn coordinates(&self, ctx: &ExecutionContext) -> Option<(f64, f64)> {
        match (self.ra_hours, self.dec_degrees) {
            (Some(ra), Some(dec)) => Some((ra, dec)),
            _ => ctx.target.as_ref().map(|t| (t.ra_hours, t.dec_degrees)),
        }
    }
}

#[async_trait]
impl Action for SlewToTarget {
    fn type_tag(&self) -> &str {
        "SlewToTarget"
    }

    async fn validate(&self, ctx: &ExecutionContext) -> Vec<String> {
        let mut issues = Vec::new();
        if !ctx.device_ops.mount_connected().await {
            issues.push("Mount not connected".to_string());
        }
        if self.coordinates(ctx).is_none() {
            issues.push("No coordinates configured and no plan target set".to_string());
        }
        issues
    }

    async fn execute(&mut self, ctx: &ExecutionContext) -> Result<(), ItemError> {
        let (ra, dec) = self
            .coordinates(ctx)
            .ok_or_else(|| ItemError::Failed("no coordinates available".into()))?;

        tracing::info!("Slewing to RA={:.4}h, Dec={:.4}\u{b0}", ra, dec);
        ctx.report("Slew", format!("Slewing to RA={:.4}h Dec={:.4}", ra, dec));

        ctx.device_ops.mount_slew_to_coordinates(ra, dec).await?;

        let result = wait_until_idle(ctx, Duration::from_secs(300), || {
            ctx.device_ops.mount_is_slewing()
        })
        .await;

        if matches!(result, Err(ItemError::Cancelled)) {
            let _ = ctx.device_ops.mount_abort_slew().await;
        }
        result
    }

    fn config(&self) -> serde_json::Value {
        config_of(self)
    }

    fn clone_boxed(&self) -> Box<dyn Action> {
        Box::new(self.clone())
    }
}

// =============================================================================
// SWITCH FILTER
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchFilter {
    pub filter: String,
}

#[async_trait]
impl Action for SwitchFilter {
    fn type_tag(&self) -> &str {
        "SwitchFilter"
    }

    async fn validate(&self, ctx: &ExecutionContext) -> Vec<String> {
        if ctx.device_ops.filterwheel_connected().await {
            Vec::new()
        } else {
            vec!["Filter wheel not connected".to_string()]
        }
    }

    async fn execute(&mut self, ctx: &ExecutionContext) -> Result<(), ItemError> {
        if ctx.is_cancelled() {
            return Err(ItemError::Cancelled);
        }
        ctx.report("Filter", format!("Switching to {}", self.filter));
        ctx.device_ops.filterwheel_set_filter(&self.filter).await?;
        ctx.update_stats(|s| s.current_filter = Some(self.filter.clone()));
        Ok(())
    }

    fn config(&self) -> serde_json::Value {
        config_of(self)
    }

    fn clone_boxed(&self) -> Box<dyn Action> {
        Box::new(self.clone())
    }
}

// =============================================================================
// MOVE FOCUSER
// =============================================================================

/// Move the focuser by a signed number of steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveFocuserRelative {
    pub steps: i32,
}

#[async_trait]
impl Action for MoveFocuserRelative {
    fn type_tag(&self) -> &str {
        "MoveFocuserRelative"
    }

    async fn validate(&self, ctx: &ExecutionContext) -> Vec<String> {
        if ctx.device_ops.focuser_connected().await {
            Vec::new()
        } else {
            vec!["Focuser not connected".to_string()]
        }
    }

    async fn execute(&mut self, ctx: &ExecutionContext) -> Result<(), ItemError> {
        ctx.report("Focuser", format!("Moving {} steps", self.steps));
        ctx.device_ops.focuser_move_relative(self.steps).await?;
        wait_until_idle(ctx, Duration::from_secs(60), || {
            ctx.device_ops.focuser_is_moving()
        })
        .await
    }

    fn config(&self) -> serde_json::Value {
        config_of(self)
    }

    fn clone_boxed(&self) -> Box<dyn Action> {
        Box::new(self.clone())
    }
}

// =============================================================================
// FLAT PANEL BRIGHTNESS
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetPanelBrightness {
    pub brightness: u32,
}

#[async_trait]
impl Action for SetPanelBrightness {
    fn type_tag(&self) -> &str {
        "SetPanelBrightness"
    }

    async fn validate(&self, ctx: &ExecutionContext) -> Vec<String> {
        if ctx.device_ops.flat_panel_connected().await {
            Vec::new()
        } else {
            vec!["Flat panel not connected".to_string()]
        }
    }

    async fn execute(&mut self, ctx: &ExecutionContext) -> Result<(), ItemError> {
        if ctx.is_cancelled() {
            return Err(ItemError::Cancelled);
        }
        tracing::info!("Setting flat panel brightness to {}", self.brightness);
        ctx.device_ops
            .flat_panel_set_brightness(self.brightness)
            .await?;
        Ok(())
    }

    fn config(&self) -> serde_json::Value {
        config_of(self)
    }

    fn clone_boxed(&self) -> Box<dyn Action> {
        Box::new(self.clone())
    }
}

// =============================================================================
// WAIT
// =============================================================================

/// Wait a fixed duration, checking for cancellation every 100 ms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitForDuration {
    pub seconds: f64,
}

#[async_trait]
impl Action for WaitForDuration {
    fn type_tag(&self) -> &str {
        "WaitForDuration"
    }

    async fn execute(&mut self, ctx: &ExecutionContext) -> Result<(), ItemError> {
        let total_steps = (self.seconds * 10.0) as u64;
        for step in 0..total_steps {
            if ctx.is_cancelled() {
                return Err(ItemError::Cancelled);
            }
            if step % 10 == 0 {
                let remaining = self.seconds - step as f64 / 10.0;
                ctx.report("Wait", format!("{:.0}s remaining", remaining));
            }
            sleep(POLL_INTERVAL).await;
        }
        Ok(())
    }

    fn config(&self) -> serde_json::Value {
        config_of(self)
    }

    fn clone_boxed(&self) -> Box<dyn Action> {
        Box::new(self.clone())
    }
}

// =============================================================================
// ANNOTATION
// =============================================================================

/// Push a message to the progress channel and the log. No device interaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Annotation {
    pub message: String,
}

#[async_trait]
impl Action for Annotation {
    fn type_tag(&self) -> &str {
        "Annotation"
    }

    async fn execute(&mut self, ctx: &ExecutionContext) -> Result<(), ItemError> {
        tracing::info!("{}", self.message);
        ctx.report("Annotation", self.message.clone());
        Ok(())
    }

    fn config(&self) -> serde_json::Value {
        config_of(self)
    }

    fn clone_boxed(&self) -> Box<dyn Action> {
        Box::new(self.clone())
    }
}
