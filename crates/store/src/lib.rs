#![warn(clippy::unwrap_used)]

pub mod redis_store;

pub use redis_store::RedisAssignmentStore;
