//! The blob-store capability consumed by the cache engine.
//!
//! The engine only ever needs two operations from the remote side: `stat` to
//! learn an object's size and modification time, and `open_read` to stream
//! its bytes. [`BlobStore`] captures exactly that seam; [`ObjectStoreBlob`]
//! adapts any [`ObjectStore`] implementation to it, so the mirror can sit in
//! front of S3, an HTTP origin, a local directory or an in-memory store
//! without the engine knowing the difference.
//!
//! NotFound is a distinct signal throughout: the cache records it as a state
//! of its own and must never confuse it with a transient remote failure.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::BoxStream;
use object_store::{ObjectStore, local::LocalFileSystem, memory::InMemory, path::Path};

use crate::{BoxError, CacheError};

/// Byte stream produced by [`BlobStore::open_read`].
pub type ByteStream = BoxStream<'static, Result<bytes::Bytes, CacheError>>;

/// Remote metadata reported by [`BlobStore::stat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobStat {
    /// Object size in bytes, when the store reports one. An object without a
    /// known length cannot be mirrored and is treated as absent.
    pub length: Option<u64>,
    /// Remote modification timestamp.
    pub last_modified: DateTime<Utc>,
}

/// Minimal read-only capability the cache engine requires from a remote
/// store.
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    /// Reports size and modification time for `key`, or
    /// [`CacheError::NotFound`] when the remote has no such object.
    async fn stat(&self, key: &str) -> Result<BlobStat, CacheError>;

    /// Opens a byte stream over the object at `key`.
    async fn open_read(&self, key: &str) -> Result<ByteStream, CacheError>;
}

/// [`BlobStore`] adapter over any [`ObjectStore`] implementation.
///
/// You can find various implementations of [`ObjectStore`] at:
/// https://github.com/apache/arrow-rs-object-store
#[derive(Clone)]
pub struct ObjectStoreBlob {
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreBlob {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }
}

fn remote_error(key: &str, err: object_store::Error) -> CacheError {
    match err {
        object_store::Error::NotFound { .. } => CacheError::NotFound {
            key: key.to_string(),
        },
        err => CacheError::Remote {
            key: key.to_string(),
            message: err.to_string(),
        },
    }
}

#[async_trait]
impl BlobStore for ObjectStoreBlob {
    async fn stat(&self, key: &str) -> Result<BlobStat, CacheError> {
        let path = Path::from(key);
        let meta = self
            .store
            .head(&path)
            .await
            .map_err(|err| remote_error(key, err))?;
        Ok(BlobStat {
            length: Some(meta.size),
            last_modified: meta.last_modified,
        })
    }

    async fn open_read(&self, key: &str) -> Result<ByteStream, CacheError> {
        let path = Path::from(key);
        let res = self
            .store
            .get(&path)
            .await
            .map_err(|err| remote_error(key, err))?;
        let key = key.to_string();
        Ok(res
            .into_stream()
            .map(move |chunk| chunk.map_err(|err| remote_error(&key, err)))
            .boxed())
    }
}

/// Builds an [`ObjectStore`] from the `PRIMARY` connection string.
///
/// `memory:` yields a process-local store (useful for tests and demos),
/// `file://<dir>` serves a local directory, and any other URL is handed to
/// [`object_store::parse_url`], which covers the enabled remote schemes
/// (`s3://`, `http://`, `https://`).
pub fn build_object_store(primary: &str) -> Result<Arc<dyn ObjectStore>, BoxError> {
    match primary {
        "" => Err("PRIMARY connection string is empty".into()),
        "memory" | "memory:" | "memory://" => Ok(Arc::new(InMemory::new())),
        s if s.starts_with("file://") => {
            let os = LocalFileSystem::new_with_prefix(s.trim_start_matches("file://"))?;
            Ok(Arc::new(os))
        }
        s => {
            let url = url::Url::parse(s)?;
            let (os, _) = object_store::parse_url(&url)?;
            Ok(Arc::from(os))
        }
    }
}
