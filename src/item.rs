//! Entity contracts and execution context
//!
//! Every node in a plan tree shares the [`EntityMeta`] capability set:
//! identity, display metadata, and a run status. Leaves implement [`Action`],
//! loop predicates implement [`Condition`], and interrupt handlers implement
//! [`Trigger`]. The [`ExecutionContext`] threads cancellation, device access,
//! the ephemeris, and the progress channel through a run.

use crate::device_ops::{NullDeviceOps, SharedDeviceOps};
use crate::ephemeris::{SharedEphemeris, SiderealEphemeris};
use crate::error::ItemError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// Run status of a plan node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemStatus {
    Created,
    Running,
    Finished,
    Skipped,
    Failed,
}

/// Capability set shared by every node in the plan tree.
#[derive(Debug, Clone)]
pub struct EntityMeta {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub category: String,
    pub icon: String,
    pub status: ItemStatus,
}

impl EntityMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: String::new(),
            category: String::new(),
            icon: String::new(),
            status: ItemStatus::Created,
        }
    }
}

/// Target the plan is pointed at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetInfo {
    pub name: String,
    pub ra_hours: f64,
    pub dec_degrees: f64,
}

/// One entry on the progress/status channel. Informational only; never used
/// for control flow.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub source: String,
    pub message: String,
}

pub type ProgressSink = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// Mutable observations accumulated during one run, shared between actions,
/// conditions, and triggers.
#[derive(Debug, Default, Clone)]
pub struct RunStats {
    pub current_filter: Option<String>,
    pub completed_exposures: u32,
    pub completed_integration_secs: f64,
    pub hfr_history: Vec<f64>,
}

impl RunStats {
    pub fn latest_hfr(&self) -> Option<f64> {
        self.hfr_history.last().copied()
    }
}

/// Context passed to every action, condition, and trigger during a run.
pub struct ExecutionContext {
    /// Cooperative cancellation flag, observed at every checkpoint.
    pub is_cancelled: Arc<AtomicBool>,
    pub device_ops: SharedDeviceOps,
    pub ephemeris: SharedEphemeris,
    pub progress: Option<ProgressSink>,
    /// Observer location in degrees.
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub target: Option<TargetInfo>,
    stats: Arc<RwLock<RunStats>>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self {
            is_cancelled: Arc::new(AtomicBool::new(false)),
            device_ops: Arc::new(NullDeviceOps),
            ephemeris: Arc::new(SiderealEphemeris),
            progress: None,
            latitude: None,
            longitude: None,
            target: None,
            stats: Arc::new(RwLock::new(RunStats::default())),
        }
    }

    pub fn with_device_ops(mut self, ops: SharedDeviceOps) -> Self {
        self.device_ops = ops;
        self
    }

    pub fn with_ephemeris(mut self, ephemeris: SharedEphemeris) -> Self {
        self.ephemeris = ephemeris;
        self
    }

    pub fn with_target(mut self, target: TargetInfo) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_location(mut self, latitude: f64, longitude: f64) -> Self {
        self.latitude = Some(latitude);
        self.longitude = Some(longitude);
        self
    }

    pub fn with_progress(mut self, sink: ProgressSink) -> Self {
        self.progress = Some(sink);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.is_cancelled.load(Ordering::Relaxed)
    }

    pub fn request_cancellation(&self) {
        self.is_cancelled.store(true, Ordering::Relaxed);
    }

    /// Push a status line to the progress channel.
    pub fn report(&self, source: impl Into<String>, message: impl Into<String>) {
        if let Some(sink) = &self.progress {
            sink(ProgressEvent {
                source: source.into(),
                message: message.into(),
            });
        }
    }

    /// Snapshot of the run statistics.
    pub fn stats(&self) -> RunStats {
        self.stats
            .read()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Mutate the run statistics. The lock is never held across an await.
    pub fn update_stats(&self, f: impl FnOnce(&mut RunStats)) {
        if let Ok(mut stats) = self.stats.write() {
            f(&mut stats);
        }
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

/// A leaf node performing one domain operation.
///
/// Stateless between runs except for fields bound to user configuration;
/// whatever per-run state an action needs is set up in `initialize` and
/// released in `teardown`.
#[async_trait]
pub trait Action: Send + Sync {
    /// Stable persistence tag for this action type.
    fn type_tag(&self) -> &str;

    async fn initialize(&mut self, _ctx: &ExecutionContext) {}

    /// Issues that currently prevent this action from running. A non-empty
    /// list makes the coordinator skip the node; it is not a fault.
    async fn validate(&self, _ctx: &ExecutionContext) -> Vec<String> {
        Vec::new()
    }

    /// Perform the operation. Must observe `ctx.is_cancelled()` at least once
    /// per unit of work.
    async fn execute(&mut self, ctx: &ExecutionContext) -> Result<(), ItemError>;

    async fn teardown(&mut self, _ctx: &ExecutionContext) {}

    /// Serializable configuration payload for persistence.
    fn config(&self) -> serde_json::Value;

    fn clone_boxed(&self) -> Box<dyn Action>;
}

/// Predicate deciding whether a container's loop body repeats.
///
/// All conditions on a container must allow continuation (logical AND); a
/// container with no conditions runs its body exactly once.
pub trait Condition: Send + Sync {
    fn type_tag(&self) -> &str;

    fn initialize(&mut self, _ctx: &ExecutionContext) {}

    /// Asked at the start of each pass over the container body (after
    /// `on_block_started`), against the would-be next item. Returning false
    /// prevents the pass, so a loop may run its body zero times. A pure read
    /// apart from bookkeeping the condition owns.
    fn check(&mut self, ctx: &ExecutionContext, next: Option<&EntityMeta>) -> bool;

    /// Called when a loop pass over the owning container begins.
    fn on_block_started(&mut self) {}

    /// Called when a loop pass over the owning container completes.
    fn on_block_finished(&mut self) {}

    /// Reset internal counters, e.g. remaining iterations.
    fn reset_progress(&mut self) {}

    fn config(&self) -> serde_json::Value;

    fn clone_boxed(&self) -> Box<dyn Condition>;
}

/// Polled interrupt handler that may run a side-sequence between leaves.
///
/// After every leaf action completes, each trigger in the active container
/// chain is asked `should_fire` (innermost container first). A firing
/// trigger's `execute` runs to completion before the next leaf starts.
/// Internal state persists across polls within one run and is cleared by
/// `initialize`.
#[async_trait]
pub trait Trigger: Send + Sync {
    fn type_tag(&self) -> &str;

    async fn initialize(&mut self, _ctx: &ExecutionContext) {}

    async fn should_fire(&mut self, ctx: &ExecutionContext, next: Option<&EntityMeta>) -> bool;

    /// The side-sequence.
    async fn execute(&mut self, ctx: &ExecutionContext) -> Result<(), ItemError>;

    async fn teardown(&mut self, _ctx: &ExecutionContext) {}

    fn on_block_started(&mut self) {}

    fn on_block_finished(&mut self) {}

    fn config(&self) -> serde_json::Value;

    fn clone_boxed(&self) -> Box<dyn Trigger>;
}
