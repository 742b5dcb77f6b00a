//! Core types and capability seams shared across the blobmirror crates.
//!
//! This crate defines the [`BlobStore`] capability the cache engine consumes,
//! the [`CacheError`] taxonomy, and the parsers for the human-friendly size
//! and duration grammars used by the configuration surface.

mod error;
pub mod parse;
pub mod store;

pub use error::CacheError;
pub use store::{BlobStat, BlobStore, ByteStream, ObjectStoreBlob, build_object_store};

/// A type alias for a boxed error that is thread-safe and sendable across threads.
/// This is commonly used as a return type for functions that can return various error types.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
