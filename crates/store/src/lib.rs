//! Remote store adapters for the stowage transfer engine.
//!
//! The engine talks to destinations through [`RemoteStoreAdapter`], a narrow
//! capability interface: put-chunk, get-range, head, list, delete, plus a
//! metadata record and complete/abort of a pending object. Variants differ
//! only in how they map these calls onto their backing transport.
//!
//! This crate ships two adapters: [`MemoryStore`], the in-process reference
//! implementation used throughout the test suites, and
//! [`BackupChannelStore`], which stores chunks as messages in an external
//! broadcast channel via a pluggable [`ChannelClient`]. The S3 adapter lives
//! in `stowage-store-s3`.

mod adapter;
mod channel;
mod error;
mod memory;

pub use adapter::RemoteStoreAdapter;
pub use channel::{BackupChannelStore, ChannelClient};
pub use error::StoreError;
pub use memory::MemoryStore;
