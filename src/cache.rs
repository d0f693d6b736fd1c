// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! On-disk cache of downloaded publisher files.
//!
//! Files are stored in a flat directory under the basename of their URL.
//! NRTM v4 embeds content hashes in file names, so the name is a stable
//! cache key; the expected digest from the [`FileRef`] is still what
//! decides whether a cached file is usable. A name hit whose digest does
//! not match is treated as cache corruption and redownloaded.
//!
//! Downloads stream through a [`HashingReader`] into a uniquely-named
//! `.part` file which is atomically renamed into place once the digest
//! checks out. Partial files are deleted on error or cancellation.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::fetch::{FetchError, Fetcher};
use crate::hashing::HashingReader;
use crate::notification::FileRef;

/// Filename suffix marking gzip-compressed publisher files.
pub const GZIP_EXTENSION: &str = ".gz";

/// Cache directory handle.
pub struct FileCache {
    dir: PathBuf,
}

impl FileCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Return the cached path for `file_ref`, downloading and verifying it
    /// first if necessary.
    pub async fn fetch_and_verify(
        &self,
        fetcher: &dyn Fetcher,
        file_ref: &FileRef,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, FetchError> {
        fs::create_dir_all(&self.dir).await?;

        let name = file_name_for_url(&file_ref.url, &file_ref.hash);
        let target = self.dir.join(&name);
        let expected = file_ref.hash.to_ascii_lowercase();

        if fs::try_exists(&target).await? {
            let digest = digest_file(&target).await?;
            if digest == expected {
                debug!(file = %name, "cache hit");
                return Ok(target);
            }
            warn!(file = %name, "cached file digest mismatch, redownloading");
        }

        let tmp = self.dir.join(format!("{}.{}.part", name, Uuid::new_v4()));
        let outcome = self.download(fetcher, &file_ref.url, &tmp, cancel).await;
        match outcome {
            Ok(digest) if digest == expected => {
                fs::rename(&tmp, &target).await?;
                info!(file = %name, version = file_ref.version, "file downloaded and verified");
                Ok(target)
            }
            Ok(digest) => {
                let _ = fs::remove_file(&tmp).await;
                Err(FetchError::HashMismatch {
                    url: file_ref.url.clone(),
                    expected,
                    actual: digest,
                })
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp).await;
                Err(e)
            }
        }
    }

    async fn download(
        &self,
        fetcher: &dyn Fetcher,
        url: &str,
        tmp: &Path,
        cancel: &CancellationToken,
    ) -> Result<String, FetchError> {
        let body = fetcher.get(url).await?;
        let (mut reader, state) = HashingReader::new(body);
        let mut file = fs::File::create(tmp).await?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            copied = tokio::io::copy(&mut reader, &mut file) => {
                copied?;
            }
        }
        file.flush().await?;
        file.sync_all().await?;
        let digest = state.lock().unwrap().hex_digest();
        Ok(digest)
    }
}

/// Open a cached file for record reading, transparently decompressing
/// `.gz` files. Synchronous: callers run this on the blocking path.
pub fn open_decoded(path: &Path) -> std::io::Result<Box<dyn BufRead + Send>> {
    let file = std::fs::File::open(path)?;
    if path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(GZIP_EXTENSION))
    {
        Ok(Box::new(BufReader::new(GzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Compute the SHA-256 digest of a file on disk, streaming.
async fn digest_file(path: &Path) -> std::io::Result<String> {
    let file = fs::File::open(path).await?;
    let (mut reader, state) = HashingReader::new(file);
    tokio::io::copy(&mut reader, &mut tokio::io::sink()).await?;
    let digest = state.lock().unwrap().hex_digest();
    Ok(digest)
}

/// Cache key for a URL: the basename of its path, query and fragment
/// stripped. Falls back to the expected hash when the URL has no usable
/// basename.
fn file_name_for_url(url: &str, hash: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let name = path.rsplit('/').next().unwrap_or_default();
    if name.is_empty() {
        hash.to_string()
    } else {
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sha2::{Digest, Sha256};
    use std::collections::HashMap;
    use std::io::{Cursor, Read, Write};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use crate::fetch::ByteStream;
    use crate::notification::NotificationFile;

    struct StubFetcher {
        files: HashMap<String, Vec<u8>>,
        calls: AtomicUsize,
    }

    impl StubFetcher {
        fn with(url: &str, body: &[u8]) -> Self {
            let mut files = HashMap::new();
            files.insert(url.to_string(), body.to_vec());
            Self {
                files,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Fetcher for StubFetcher {
        async fn get(&self, url: &str) -> Result<ByteStream, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let body = self.files.get(url).cloned().ok_or(FetchError::Status {
                url: url.to_string(),
                status: 404,
            })?;
            Ok(Box::new(Cursor::new(body)))
        }

        async fn get_notification(&self, url: &str) -> Result<NotificationFile, FetchError> {
            Err(FetchError::Status {
                url: url.to_string(),
                status: 404,
            })
        }
    }

    fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    fn file_ref(url: &str, body: &[u8]) -> FileRef {
        FileRef {
            version: 1,
            url: url.to_string(),
            hash: sha256_hex(body),
        }
    }

    #[test]
    fn test_file_name_for_url() {
        assert_eq!(
            file_name_for_url("https://example.com/a/b/snapshot.2.json.gz", "h"),
            "snapshot.2.json.gz"
        );
        assert_eq!(
            file_name_for_url("https://example.com/delta.3.json?sig=x#frag", "h"),
            "delta.3.json"
        );
        assert_eq!(file_name_for_url("https://example.com/", "cafe"), "cafe");
    }

    #[tokio::test]
    async fn test_download_verify_and_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path());
        let body = b"\x1e{\"a\":1}\n";
        let url = "https://example.com/delta.1.json";
        let fetcher = StubFetcher::with(url, body);
        let cancel = CancellationToken::new();

        let path = cache
            .fetch_and_verify(&fetcher, &file_ref(url, body), &cancel)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), body);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

        // Second fetch is served from the cache
        cache
            .fetch_and_verify(&fetcher, &file_ref(url, body), &cancel)
            .await
            .unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_hash_mismatch_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path());
        let url = "https://example.com/delta.2.json";
        let fetcher = StubFetcher::with(url, b"actual body");
        let mut bad_ref = file_ref(url, b"actual body");
        bad_ref.hash = sha256_hex(b"some other body");

        let err = cache
            .fetch_and_verify(&fetcher, &bad_ref, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::HashMismatch { .. }));

        // Neither the target nor any .part leftovers exist
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(entries.is_empty(), "cache dir should be empty: {entries:?}");
    }

    #[tokio::test]
    async fn test_corrupt_cache_entry_is_redownloaded() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path());
        let body = b"good content";
        let url = "https://example.com/snapshot.1.json";
        std::fs::write(dir.path().join("snapshot.1.json"), b"corrupted").unwrap();

        let fetcher = StubFetcher::with(url, body);
        let path = cache
            .fetch_and_verify(&fetcher, &file_ref(url, body), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), body);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_download_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path());
        let url = "https://example.com/snapshot.9.json";
        let body = vec![7u8; 1024];
        let fetcher = StubFetcher::with(url, &body);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = cache
            .fetch_and_verify(&fetcher, &file_ref(url, &body), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Cancelled));
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_open_decoded_plain_and_gzip() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("file.json");
        std::fs::write(&plain, b"plain bytes").unwrap();

        let gz = dir.path().join("file.json.gz");
        let mut encoder = flate2::write::GzEncoder::new(
            std::fs::File::create(&gz).unwrap(),
            flate2::Compression::default(),
        );
        encoder.write_all(b"compressed bytes").unwrap();
        encoder.finish().unwrap();

        let mut out = String::new();
        open_decoded(&plain).unwrap().read_to_string(&mut out).unwrap();
        assert_eq!(out, "plain bytes");

        let mut out = String::new();
        open_decoded(&gz).unwrap().read_to_string(&mut out).unwrap();
        assert_eq!(out, "compressed bytes");
    }
}
