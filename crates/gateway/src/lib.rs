#![forbid(unsafe_code)]

mod gateway;
mod query;
mod resource;
pub mod snapshot;

pub use gateway::{Freshness, Gateway, GatewayConfig, GatewayStats, Served};
pub use query::{BUST_PARAMS, Query};
pub use resource::ResourceKind;
pub use snapshot::{MemorySnapshots, Snapshot, SnapshotStore};
