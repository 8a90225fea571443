//! Background Tasks Module
//!
//! Contains background tasks that run periodically alongside a cache.
//!
//! # Tasks
//! - Stale Purge: Removes stale cache entries at configured intervals

mod purge;

pub use purge::spawn_purge_task;
