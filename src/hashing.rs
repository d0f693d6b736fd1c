//! An async reader adapter that computes a SHA-256 digest on the fly.
//!
//! Every byte read through this wrapper is fed into an incremental
//! [`Sha256`] so that after the underlying reader is exhausted the digest
//! is available without re-reading or buffering the payload.
//!
//! The digest state is kept behind an `Arc<Mutex<…>>` so the caller can
//! extract the final hash even after the reader has been moved into a
//! consumer (e.g. `tokio::io::copy`) that does not return it.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use pin_project_lite::pin_project;
use sha2::{Digest, Sha256};
use tokio::io::AsyncRead;

/// Shared accumulator for the incremental SHA-256 hash and byte count.
pub struct HashState {
    hasher: Sha256,
    pub bytes_read: u64,
}

impl std::fmt::Debug for HashState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashState")
            .field("bytes_read", &self.bytes_read)
            .finish_non_exhaustive()
    }
}

impl HashState {
    fn new() -> Self {
        Self {
            hasher: Sha256::new(),
            bytes_read: 0,
        }
    }

    fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes_read += data.len() as u64;
    }

    /// Finalize and return the digest as lowercase hex, resetting the
    /// internal state.
    pub fn hex_digest(&mut self) -> String {
        hex::encode(self.hasher.finalize_reset())
    }
}

pin_project! {
    /// Wraps an [`AsyncRead`] and incrementally hashes every byte that
    /// passes through.
    ///
    /// After the stream is exhausted, use the `Arc<Mutex<HashState>>`
    /// returned by [`new`](Self::new) to retrieve the digest via
    /// [`HashState::hex_digest`].
    pub struct HashingReader<R> {
        #[pin]
        inner: R,
        state: Arc<Mutex<HashState>>,
    }
}

impl<R> HashingReader<R> {
    /// Create a new hashing reader.
    ///
    /// Returns the reader and a shared handle to the hash state. The
    /// handle can be used to extract the digest after the reader has been
    /// fully consumed (even if the reader itself has been moved elsewhere).
    pub fn new(inner: R) -> (Self, Arc<Mutex<HashState>>) {
        let state = Arc::new(Mutex::new(HashState::new()));
        let reader = Self {
            inner,
            state: Arc::clone(&state),
        };
        (reader, state)
    }
}

impl<R: AsyncRead> AsyncRead for HashingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        let result = this.inner.poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let new_bytes = &buf.filled()[before..];
            if !new_bytes.is_empty() {
                this.state.lock().unwrap().update(new_bytes);
            }
        }
        result
    }
}
