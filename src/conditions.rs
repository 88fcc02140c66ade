//! Built-in loop conditions
//!
//! A condition answers "may this container's body run?". The coordinator
//! calls `on_block_started` at the top of each pass, then `check` against the
//! would-be next item to decide whether the pass runs at all, and
//! `on_block_finished` once the body completes.

use crate::item::{Condition, EntityMeta, ExecutionContext};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

fn config_of<T: Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

/// Repeat the container body a fixed number of times.
///
/// The pass counter is advanced by `on_block_finished`, never by `check`,
/// and is reset only by `reset_progress` or a container restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopForIterations {
    pub iterations: u32,
    #[serde(skip)]
    completed: u32,
}

impl LoopForIterations {
    pub fn new(iterations: u32) -> Self {
        Self {
            iterations,
            completed: 0,
        }
    }

    pub fn completed(&self) -> u32 {
        self.completed
    }
}

impl Condition for LoopForIterations {
    fn type_tag(&self) -> &str {
        "LoopForIterations"
    }

    fn check(&mut self, _ctx: &ExecutionContext, _next: Option<&EntityMeta>) -> bool {
        self.completed < self.iterations
    }

    fn on_block_finished(&mut self) {
        self.completed += 1;
    }

    fn reset_progress(&mut self) {
        self.completed = 0;
    }

    fn config(&self) -> serde_json::Value {
        config_of(self)
    }

    fn clone_boxed(&self) -> Box<dyn Condition> {
        Box::new(self.clone())
    }
}

/// Repeat until a wall-clock time budget has elapsed.
///
/// The deadline is anchored when the block first starts, so a saved plan
/// carries a duration, not an absolute time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopForTimeSpan {
    pub seconds: f64,
    #[serde(skip)]
    deadline: Option<DateTime<Utc>>,
}

impl LoopForTimeSpan {
    pub fn new(seconds: f64) -> Self {
        Self {
            seconds,
            deadline: None,
        }
    }
}

impl Condition for LoopForTimeSpan {
    fn type_tag(&self) -> &str {
        "LoopForTimeSpan"
    }

    fn on_block_started(&mut self) {
        if self.deadline.is_none() {
            self.deadline = Some(Utc::now() + Duration::milliseconds((self.seconds * 1000.0) as i64));
        }
    }

    fn check(&mut self, _ctx: &ExecutionContext, _next: Option<&EntityMeta>) -> bool {
        match self.deadline {
            Some(deadline) => Utc::now() < deadline,
            None => false,
        }
    }

    fn reset_progress(&mut self) {
        self.deadline = None;
    }

    fn config(&self) -> serde_json::Value {
        config_of(self)
    }

    fn clone_boxed(&self) -> Box<dyn Condition> {
        Box::new(self.clone())
    }
}

/// Repeat while the most recent frame's HFR stays under a limit.
///
/// Stops the loop once seeing or focus degrades past the threshold. With no
/// HFR measured yet the loop is allowed to continue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopWhileHfrBelow {
    pub limit: f64,
}

impl LoopWhileHfrBelow {
    pub fn new(limit: f64) -> Self {
        Self { limit }
    }
}

impl Condition for LoopWhileHfrBelow {
    fn type_tag(&self) -> &str {
        "LoopWhileHfrBelow"
    }

    fn check(&mut self, ctx: &ExecutionContext, _next: Option<&EntityMeta>) -> bool {
        match ctx.stats().latest_hfr() {
            Some(hfr) if hfr >= self.limit => {
                tracing::info!("HFR {:.2} reached limit {:.2}, ending loop", hfr, self.limit);
                false
            }
            _ => true,
        }
    }

    fn config(&self) -> serde_json::Value {
        config_of(self)
    }

    fn clone_boxed(&self) -> Box<dyn Condition> {
        Box::new(self.clone())
    }
}
