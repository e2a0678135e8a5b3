//! Infrastructure-backed event log implementations.
//!
//! The log abstraction and its in-memory implementation live in
//! `applyflow-events`; this module provides the Redis one.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsEventLog;
