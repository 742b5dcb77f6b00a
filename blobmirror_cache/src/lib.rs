//! Cache engine for blobmirror.
//!
//! The engine keeps an in-memory directory of remote objects ([`Item`]s)
//! owned by a [`Cache`]. Each item walks a small state machine: it is probed
//! for existence at most once, downloaded at most once at a time, and
//! streamed to any number of concurrent readers while the download is still
//! in flight. A background expirer bounds the total size of downloaded
//! bytes, the number of cached not-found answers, and the age of every
//! entry.
//!
//! The HTTP surface lives elsewhere; this crate only deals in keys, items
//! and readers.

mod cache;
mod item;
mod reader;

pub use cache::{Cache, CacheBuilder};
pub use item::{Item, ItemState};
pub use reader::ItemReader;
