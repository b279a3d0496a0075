//! Broker adapters backed by external systems.
//!
//! The in-memory broker lives in `courier-events`; adapters here need network
//! clients and are behind cargo features.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsBroker, RedisStreamsError};
