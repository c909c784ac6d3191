//! Queue backends.

pub mod disabled;
pub mod memory;
pub mod redis;

pub use self::disabled::DisabledQueue;
pub use self::memory::MemoryQueue;
pub use self::redis::RedisQueue;
