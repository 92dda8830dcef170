//! Remote resource retrieval.
//!
//! The build only ever needs "bytes at URL into a local file". Everything
//! network-specific sits behind [`Fetcher`] so the pipeline can be driven by
//! an in-memory fetcher in tests.

use std::fs;
use std::io::{self, Read};
use std::path::Path;
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::config::package::FetchConfig;
use crate::error::{Error, Result};
use crate::modules::util::write_atomically;

pub trait Fetcher: Send + Sync {
    /// Write the full body at `url` to `dest`. On error `dest` must not be
    /// left behind looking like a complete download.
    fn fetch(&self, url: &str, dest: &Path) -> Result<()>;
}

pub struct HttpFetcher {
    user_agent: String,
    timeout: Option<Duration>,
}

impl HttpFetcher {
    pub fn new(cfg: &FetchConfig) -> Self {
        Self {
            user_agent: cfg.user_agent.clone(),
            timeout: (cfg.timeout_secs > 0).then(|| Duration::from_secs(cfg.timeout_secs)),
        }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new(&FetchConfig::default())
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str, dest: &Path) -> Result<()> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(self.user_agent.clone())
            .timeout(self.timeout)
            .build()
            .map_err(|e| Error::transport(format!("failed to build HTTP client: {e}")))?;

        tracing::info!(%url, dest = %dest.display(), "downloading");
        let mut res = client
            .get(url)
            .send()
            .map_err(|e| Error::transport(format!("GET {url} failed: {e}")))?;
        if !res.status().is_success() {
            return Err(Error::transport(format!(
                "GET {url} failed with status {}",
                res.status()
            )));
        }

        write_atomically(dest, |file| {
            io::copy(&mut res, file)
                .map_err(|e| Error::transport(format!("reading body of {url} failed: {e}")))
        })?;
        Ok(())
    }
}

/// Ensure `cache_path` exists, fetching `url` only when it does not.
/// Presence is the only check; a stale file is reused until removed by hand.
/// Returns whether a download happened.
pub fn ensure_cached(fetcher: &dyn Fetcher, url: &str, cache_path: &Path) -> Result<bool> {
    if cache_path.is_file() {
        tracing::debug!(path = %cache_path.display(), "cached payload present, skipping download");
        return Ok(false);
    }
    fetcher.fetch(url, cache_path)?;
    if !cache_path.is_file() {
        return Err(Error::transport(format!(
            "fetch of {url} reported success but {} is missing",
            cache_path.display()
        )));
    }
    Ok(true)
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut f = fs::File::open(path).map_err(|e| Error::io("open", path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = f.read(&mut buf).map_err(|e| Error::io("read", path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn verify_sha256(path: &Path, expected: &str) -> Result<()> {
    let actual = sha256_file(path)?;
    if !actual.eq_ignore_ascii_case(expected.trim()) {
        return Err(Error::transport(format!(
            "sha256 mismatch for {}: expected {expected}, got {actual} (delete the cached file to re-download)",
            path.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: AtomicUsize,
        fail: bool,
    }

    impl Fetcher for Counting {
        fn fetch(&self, _url: &str, dest: &Path) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::transport("offline"));
            }
            write_atomically(dest, |f| {
                use std::io::Write;
                f.write_all(b"payload")?;
                Ok(7)
            })?;
            Ok(())
        }
    }

    #[test]
    fn cache_hit_skips_fetch() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cache = tmp.path().join("minio_bin");
        let fetcher = Counting {
            calls: AtomicUsize::new(0),
            fail: false,
        };

        assert!(ensure_cached(&fetcher, "http://x/minio", &cache).expect("first"));
        assert!(!ensure_cached(&fetcher, "http://x/minio", &cache).expect("second"));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fs::read(&cache).expect("read"), b"payload");
    }

    #[test]
    fn transport_failure_propagates_without_cache_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cache = tmp.path().join("minio_bin");
        let fetcher = Counting {
            calls: AtomicUsize::new(0),
            fail: true,
        };

        let err = ensure_cached(&fetcher, "http://x/minio", &cache).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Transport);
        assert!(!cache.exists());
    }

    #[test]
    fn digest_mismatch_is_reported() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let p = tmp.path().join("blob");
        fs::write(&p, b"abc").expect("write");
        verify_sha256(
            &p,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad",
        )
        .expect("matching digest");
        assert!(verify_sha256(&p, &"0".repeat(64)).is_err());
    }
}
