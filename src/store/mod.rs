//! Shipped [`CheckpointStore`](crate::checkpoint::CheckpointStore) backends
//!
//! - [`InMemoryCheckpointStore`]: lock-per-key maps, no durability. The
//!   default for tests and for embedding several processor instances in
//!   one process.
//! - [`FileCheckpointStore`]: JSON files under a base directory. Durable
//!   across restarts, scoped to instances sharing a filesystem.

pub mod file;
pub mod memory;

pub use file::FileCheckpointStore;
pub use memory::InMemoryCheckpointStore;
