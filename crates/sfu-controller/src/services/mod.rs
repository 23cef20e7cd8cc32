//! Service layer: worker registry, placement and resource lifecycle.

pub mod lifecycle;
pub mod placement;
pub mod worker_registry;

pub use lifecycle::{LifecycleService, NewProducer};
pub use placement::{NearestFirst, PlacementPolicy, RandomWithinTolerance, WorkerPicker};
pub use worker_registry::{WorkerDiff, WorkerRegistry};
