//! Sequence execution engine for imaging sessions.
//!
//! A plan is a tree of containers and leaf actions. Containers loop while
//! their conditions allow and carry triggers that interrupt between leaves;
//! the coordinator walks the tree, honors cooperative cancellation, and
//! reports how every node ended. Plans persist as versioned JSON and survive
//! item types this build does not know.
//!
//! The engine talks to equipment only through the [`device_ops::DeviceOps`]
//! trait, so it runs identically against real hardware, a broker, or the
//! null implementation used in dry runs and tests.

pub mod actions;
pub mod conditions;
pub mod coordinator;
pub mod device_ops;
pub mod ephemeris;
pub mod error;
pub mod item;
pub mod plan;
pub mod serializer;
pub mod triggers;

pub use coordinator::{run_plan, RunOutcome, RunReport};
pub use device_ops::{DeviceOps, DeviceResult, NullDeviceOps, PierSide, SharedDeviceOps};
pub use ephemeris::{Ephemeris, SiderealEphemeris};
pub use error::{ItemError, PlanError, SequenceError};
pub use item::{
    Action, Condition, EntityMeta, ExecutionContext, ItemStatus, TargetInfo, Trigger,
};
pub use plan::{Node, NodeId, NodeKind, Plan};
pub use serializer::{deserialize, serialize, ItemRegistry, LoadResult};
