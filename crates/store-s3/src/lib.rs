//! S3-compatible primary object store.
//!
//! Implements `RemoteStoreAdapter` over the AWS SDK against any
//! S3-compatible endpoint (Wasabi, MinIO, AWS itself). Chunk puts map onto
//! multipart-upload parts, completion and abort onto the store's own
//! multipart complete/abort, range reads onto ranged GETs.

mod client;

pub use client::{PrimaryObjectStore, S3Config};
