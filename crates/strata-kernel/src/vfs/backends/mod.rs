//! Storage backends.
//!
//! Backends implement [`StorageBackend`](super::StorageBackend) for different
//! storage types.

mod cached;
mod local;
mod memory;

pub use cached::CachedBackend;
pub use local::LocalBackend;
pub use memory::MemoryBackend;
