//! Device operations trait
//!
//! The engine never talks to hardware directly. Actions and triggers reach
//! equipment through this capability surface, which a broker implements on top
//! of the actual driver layer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Result type for device operations
pub type DeviceResult<T> = Result<T, String>;

/// Which side of the pier an equatorial mount is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PierSide {
    East,
    West,
    Unknown,
}

/// Summary of a completed exposure. The engine does not carry image payloads;
/// it only needs timing and the focus metric for triggers and loop conditions.
#[derive(Debug, Clone)]
pub struct ExposureReport {
    pub duration_secs: f64,
    /// Half-flux radius of the frame, if the broker measured one.
    pub hfr: Option<f64>,
}

/// Capability surface the sequencer needs from connected equipment.
///
/// Methods operate on whatever device the broker has designated active for
/// each role; the engine does not manage device identity.
#[async_trait]
pub trait DeviceOps: Send + Sync {
    // =========================================================================
    // MOUNT
    // =========================================================================

    async fn mount_connected(&self) -> bool;

    /// Slew to coordinates (RA in hours, Dec in degrees).
    async fn mount_slew_to_coordinates(&self, ra_hours: f64, dec_degrees: f64) -> DeviceResult<()>;

    async fn mount_abort_slew(&self) -> DeviceResult<()>;

    async fn mount_is_slewing(&self) -> DeviceResult<bool>;

    /// Reported side of pier, the authoritative signal for flip detection.
    async fn mount_side_of_pier(&self) -> DeviceResult<PierSide>;

    async fn mount_is_tracking(&self) -> DeviceResult<bool>;

    async fn mount_set_tracking(&self, enabled: bool) -> DeviceResult<()>;

    // =========================================================================
    // CAMERA
    // =========================================================================

    async fn camera_connected(&self) -> bool;

    /// Expose one frame and return its report. The broker owns download and
    /// storage; the engine only awaits completion.
    async fn camera_start_exposure(
        &self,
        duration_secs: f64,
        gain: Option<i32>,
        binning: u32,
    ) -> DeviceResult<ExposureReport>;

    async fn camera_abort_exposure(&self) -> DeviceResult<()>;

    // =========================================================================
    // FOCUSER
    // =========================================================================

    async fn focuser_connected(&self) -> bool;

    async fn focuser_get_position(&self) -> DeviceResult<i32>;

    /// Move by a signed number of steps from the current position.
    async fn focuser_move_relative(&self, steps: i32) -> DeviceResult<()>;

    async fn focuser_is_moving(&self) -> DeviceResult<bool>;

    // =========================================================================
    // FILTER WHEEL
    // =========================================================================

    async fn filterwheel_connected(&self) -> bool;

    async fn filterwheel_set_filter(&self, name: &str) -> DeviceResult<()>;

    async fn filterwheel_get_filter(&self) -> DeviceResult<String>;

    // =========================================================================
    // FLAT PANEL
    // =========================================================================

    async fn flat_panel_connected(&self) -> bool;

    async fn flat_panel_set_brightness(&self, brightness: u32) -> DeviceResult<()>;
}

/// Shared handle to device operations
pub type SharedDeviceOps = Arc<dyn DeviceOps>;

/// Device operations that accept every command and do nothing.
///
/// Used for dry runs and as the context default; every device reports
/// connected so validation passes.
pub struct NullDeviceOps;

#[async_trait]
impl DeviceOps for NullDeviceOps {
    async fn mount_connected(&self) -> bool {
        true
    }

    async fn mount_slew_to_coordinates(&self, _ra_hours: f64, _dec_degrees: f64) -> DeviceResult<()> {
        Ok(())
    }

    async fn mount_abort_slew(&self) -> DeviceResult<()> {
        Ok(())
    }

    async fn mount_is_slewing(&self) -> DeviceResult<bool> {
        Ok(false)
    }

    async fn mount_side_of_pier(&self) -> DeviceResult<PierSide> {
        Ok(PierSide::Unknown)
    }

    async fn mount_is_tracking(&self) -> DeviceResult<bool> {
        Ok(true)
    }

    async fn mount_set_tracking(&self, _enabled: bool) -> DeviceResult<()> {
        Ok(())
    }

    async fn camera_connected(&self) -> bool {
        true
    }

    async fn camera_start_exposure(
        &self,
        duration_secs: f64,
        _gain: Option<i32>,
        _binning: u32,
    ) -> DeviceResult<ExposureReport> {
        Ok(ExposureReport {
            duration_secs,
            hfr: None,
        })
    }

    async fn camera_abort_exposure(&self) -> DeviceResult<()> {
        Ok(())
    }

    async fn focuser_connected(&self) -> bool {
        true
    }

    async fn focuser_get_position(&self) -> DeviceResult<i32> {
        Ok(0)
    }

    async fn focuser_move_relative(&self, _steps: i32) -> DeviceResult<()> {
        Ok(())
    }

    async fn focuser_is_moving(&self) -> DeviceResult<bool> {
        Ok(false)
    }

    async fn filterwheel_connected(&self) -> bool {
        true
    }

    async fn filterwheel_set_filter(&self, _name: &str) -> DeviceResult<()> {
        Ok(())
    }

    async fn filterwheel_get_filter(&self) -> DeviceResult<String> {
        Ok(String::new())
    }

    async fn flat_panel_connected(&self) -> bool {
        true
    }

    async fn flat_panel_set_brightness(&self, _brightness: u32) -> DeviceResult<()> {
        Ok(())
    }
}
