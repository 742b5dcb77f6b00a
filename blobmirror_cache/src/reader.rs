//! Streamed read access to an item's local cache file.

use blobmirror_core::CacheError;
use bytes::Bytes;
use futures::Stream;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;

const READ_CHUNK: usize = 64 * 1024;

pub(crate) struct TailHandles {
    pub download: watch::Receiver<Option<bool>>,
    pub progress: watch::Receiver<u64>,
}

/// Forward-only reader over an item's local cache file.
///
/// For a fully downloaded item this is a plain sequential file reader. For
/// an item still downloading it tails the file: a read past the currently
/// flushed length blocks until the writer makes progress or the attempt
/// settles. Bytes are observed in exactly the order the downloader wrote
/// them; nothing is buffered outside the file itself.
pub struct ItemReader {
    key: String,
    file: File,
    pos: u64,
    full_length: u64,
    tail: Option<TailHandles>,
}

impl ItemReader {
    pub(crate) fn new(key: String, file: File, full_length: u64, tail: Option<TailHandles>) -> Self {
        ItemReader {
            key,
            file,
            pos: 0,
            full_length,
            tail,
        }
    }

    /// Total length of the object as reported by the remote store.
    pub fn len(&self) -> u64 {
        self.full_length
    }

    pub fn is_empty(&self) -> bool {
        self.full_length == 0
    }

    /// Reads the next bytes into `buf`, waiting on download progress when
    /// the local file has not caught up yet. Returns `Ok(0)` at end of
    /// stream. Dropping the returned future cancels only this reader's
    /// wait, never the shared download.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, CacheError> {
        loop {
            let n = self.file.read(buf).await?;
            if n > 0 {
                self.pos += n as u64;
                return Ok(n);
            }
            if self.pos >= self.full_length {
                return Ok(0);
            }
            let Some(tail) = self.tail.as_mut() else {
                // Downloaded file shorter than the remote length; surface
                // the short read as end of stream.
                return Ok(0);
            };
            let settled = *tail.download.borrow_and_update();
            match settled {
                // Complete; the file now holds every byte, re-read.
                Some(true) => continue,
                Some(false) => {
                    return Err(CacheError::Remote {
                        key: self.key.clone(),
                        message: "download failed while streaming".to_string(),
                    });
                }
                None => {
                    tokio::select! {
                        _ = tail.progress.changed() => {}
                        _ = tail.download.changed() => {}
                    }
                    if tail.download.has_changed().is_err() && tail.download.borrow().is_none() {
                        return Err(CacheError::Remote {
                            key: self.key.clone(),
                            message: "download aborted before completion".to_string(),
                        });
                    }
                }
            }
        }
    }

    /// Converts the reader into a `Bytes` stream, e.g. for an HTTP response
    /// body.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, CacheError>> + Send + 'static {
        futures::stream::try_unfold(self, |mut reader| async move {
            let mut buf = vec![0u8; READ_CHUNK];
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Ok(None);
            }
            buf.truncate(n);
            Ok(Some((Bytes::from(buf), reader)))
        })
    }
}
