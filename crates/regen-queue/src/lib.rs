//! Regen Job Queue
//!
//! Transports for regeneration job messages: a Redis list per project for
//! workers in other processes, and an in-process queue for tests and
//! single-binary setups.

pub mod client;
pub mod queue;

pub use client::{init_pool, QueueError, QueueResult, RedisPool};
pub use queue::{jobs_key, LocalJobQueue, RedisJobQueue};
