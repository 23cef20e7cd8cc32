//! Background tasks.
//!
//! Each task runs until its cancellation token fires.

pub mod lifecycle_events;
pub mod store_compaction;
pub mod worker_health;

pub use lifecycle_events::start_lifecycle_event_loop;
pub use store_compaction::start_store_compaction;
pub use worker_health::start_worker_health_tracker;
