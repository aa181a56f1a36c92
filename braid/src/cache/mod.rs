//! Content-addressed result cache with at-most-once execution.
//!
//! Each cache entry lives under `root/<hex_key>/`:
//!
//! ```text
//! inputs.json    canonical input record
//! outputs.json   output bindings
//! files/         materialized file outputs
//! status         claimed | done | failed
//! .lock          exclusive claim
//! error          failure message, when status = failed
//! ```
//!
//! The claim protocol combines a filesystem lock (exclusive create of
//! `.lock`, safe across processes) with an in-process map of
//! [`tokio::sync::Notify`] handles so in-process waiters are woken without
//! polling. A failed execution releases the claim and records the error;
//! the next claimant re-executes; there is no negative caching.
//!
//! All entry i/o goes through [`tokio::fs`]: lookups, claims, publishes,
//! and failure releases run on the async dispatch path. The one exception
//! is claim abandonment in `Drop`, which cannot await and falls back to
//! blocking calls.

pub mod key;

pub use key::{canonical_bindings, canonical_value, derive_key, file_digest, CacheKey};

use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Notify;

use crate::lattice::TypeSpec;
use crate::task::FieldSpec;
use crate::value::Bindings;

const STATUS_CLAIMED: &str = "claimed";
const STATUS_DONE: &str = "done";
const STATUS_FAILED: &str = "failed";

/// Poll interval while waiting on a claim held by a foreign process.
const FOREIGN_CLAIM_POLL: Duration = Duration::from_millis(50);

/// Errors surfaced by the cache.
#[derive(Debug, Error, Diagnostic)]
pub enum CacheError {
    #[error("cache i/o: {0}")]
    #[diagnostic(code(braid::cache::io))]
    Io(#[from] std::io::Error),

    /// An entry claims to be done but its outputs are unreadable.
    #[error("corrupt cache entry `{key}`")]
    #[diagnostic(
        code(braid::cache::corruption),
        help("Purge the entry to force re-execution.")
    )]
    Corruption { key: String },

    #[error(transparent)]
    #[diagnostic(code(braid::cache::serde))]
    Serde(#[from] serde_json::Error),
}

struct CacheShared {
    root: PathBuf,
    inflight: Mutex<FxHashMap<String, Arc<Notify>>>,
}

impl CacheShared {
    fn entry_dir(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.as_hex())
    }

    async fn status(&self, key: &CacheKey) -> Option<String> {
        fs::read_to_string(self.entry_dir(key).join("status"))
            .await
            .ok()
            .map(|s| s.trim().to_string())
    }

    async fn read_outputs(&self, key: &CacheKey) -> Result<Bindings, CacheError> {
        let path = self.entry_dir(key).join("outputs.json");
        let raw = fs::read_to_string(&path)
            .await
            .map_err(|_| CacheError::Corruption {
                key: key.as_hex().to_string(),
            })?;
        serde_json::from_str(&raw).map_err(|_| CacheError::Corruption {
            key: key.as_hex().to_string(),
        })
    }

    fn notify_handle(&self, key: &CacheKey) -> Arc<Notify> {
        let mut map = self.inflight.lock();
        Arc::clone(
            map.entry(key.as_hex().to_string())
                .or_insert_with(|| Arc::new(Notify::new())),
        )
    }

    fn settle(&self, key: &CacheKey) {
        let handle = self.inflight.lock().remove(key.as_hex());
        if let Some(notify) = handle {
            notify.notify_waiters();
        }
    }

    /// Blocking claim release for `Drop`, which cannot await.
    fn release_failed_blocking(&self, key: &CacheKey, message: &str) {
        let dir = self.entry_dir(key);
        if let Err(e) = std::fs::write(dir.join("error"), message) {
            tracing::warn!(key = %key, error = %e, "failed to record cache error");
        }
        if let Err(e) = std::fs::write(dir.join("status"), STATUS_FAILED) {
            tracing::warn!(key = %key, error = %e, "failed to release cache claim");
        }
        let _ = std::fs::remove_file(dir.join(".lock"));
        self.settle(key);
    }
}

/// Result of a cache lookup.
pub enum Lookup {
    /// Outputs already materialized.
    Hit(Bindings),
    /// Another worker holds the claim; await its completion.
    InFlight(Waiter),
    /// The caller now holds the exclusive claim and must execute.
    Miss(Claim),
}

/// Filesystem-backed content-addressed cache.
#[derive(Clone)]
pub struct ContentCache {
    shared: Arc<CacheShared>,
}

impl ContentCache {
    /// Opens (and creates if needed) the cache root. One-time setup, so
    /// the directory creation is the one deliberate blocking call here.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            shared: Arc::new(CacheShared {
                root,
                inflight: Mutex::new(FxHashMap::default()),
            }),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.shared.root
    }

    /// Consults the cache for `key`, claiming it when absent.
    ///
    /// `canonical_inputs` is persisted into the entry's `inputs.json` on a
    /// successful claim.
    pub async fn lookup(
        &self,
        key: &CacheKey,
        canonical_inputs: &str,
    ) -> Result<Lookup, CacheError> {
        match self.shared.status(key).await.as_deref() {
            Some(STATUS_DONE) => Ok(Lookup::Hit(self.shared.read_outputs(key).await?)),
            Some(STATUS_CLAIMED) => Ok(Lookup::InFlight(self.waiter(key))),
            _ => self.try_claim(key, canonical_inputs).await,
        }
    }

    /// Removes one entry; a later lookup re-executes.
    pub async fn purge(&self, key: &CacheKey) -> Result<(), CacheError> {
        let dir = self.shared.entry_dir(key);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes every entry under the cache root.
    pub async fn purge_all(&self) -> Result<(), CacheError> {
        let mut entries = fs::read_dir(&self.shared.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                fs::remove_dir_all(entry.path()).await?;
            }
        }
        Ok(())
    }

    fn waiter(&self, key: &CacheKey) -> Waiter {
        Waiter {
            shared: Arc::clone(&self.shared),
            key: key.clone(),
        }
    }

    async fn try_claim(&self, key: &CacheKey, canonical_inputs: &str) -> Result<Lookup, CacheError> {
        let dir = self.shared.entry_dir(key);
        fs::create_dir_all(&dir).await?;
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(dir.join(".lock"))
            .await
        {
            Ok(_) => {
                fs::write(dir.join("status"), STATUS_CLAIMED).await?;
                fs::write(dir.join("inputs.json"), canonical_inputs).await?;
                // Register the in-flight handle before anyone can observe
                // the claimed status through this process.
                let _ = self.shared.notify_handle(key);
                Ok(Lookup::Miss(Claim {
                    shared: Arc::clone(&self.shared),
                    key: key.clone(),
                    released: false,
                }))
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Ok(Lookup::InFlight(self.waiter(key)))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Exclusive claim over one cache entry.
///
/// Dropping an unreleased claim records an abandonment failure so waiters
/// are not stranded.
pub struct Claim {
    shared: Arc<CacheShared>,
    key: CacheKey,
    released: bool,
}

impl Claim {
    #[must_use]
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Publishes outputs and releases the claim.
    ///
    /// File-typed outputs (per `output_specs`) whose paths exist are copied
    /// into the entry's `files/` directory and their bindings rewritten to
    /// the cache-local path; the rewritten bindings are returned.
    pub async fn publish(
        mut self,
        outputs: &Bindings,
        output_specs: &[FieldSpec],
    ) -> Result<Bindings, CacheError> {
        let dir = self.shared.entry_dir(&self.key);
        let mut published = outputs.clone();
        for spec in output_specs {
            let TypeSpec::File(_) = &spec.ty else {
                continue;
            };
            let Some(serde_json::Value::String(path)) = outputs.get(&spec.name) else {
                continue;
            };
            let source = Path::new(path);
            let is_file = fs::metadata(source)
                .await
                .map(|meta| meta.is_file())
                .unwrap_or(false);
            if is_file {
                let files = dir.join("files");
                fs::create_dir_all(&files).await?;
                let file_name = source
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| spec.name.clone());
                let target = files.join(file_name);
                fs::copy(source, &target).await?;
                published.insert(
                    spec.name.clone(),
                    serde_json::Value::String(target.to_string_lossy().into_owned()),
                );
            }
        }
        fs::write(dir.join("outputs.json"), serde_json::to_vec(&published)?).await?;
        fs::write(dir.join("status"), STATUS_DONE).await?;
        let _ = fs::remove_file(dir.join(".lock")).await;
        self.released = true;
        self.shared.settle(&self.key);
        Ok(published)
    }

    /// Records a failure and releases the claim; the next claimant
    /// re-executes.
    pub async fn fail(mut self, message: &str) {
        let dir = self.shared.entry_dir(&self.key);
        if let Err(e) = fs::write(dir.join("error"), message).await {
            tracing::warn!(key = %self.key, error = %e, "failed to record cache error");
        }
        if let Err(e) = fs::write(dir.join("status"), STATUS_FAILED).await {
            tracing::warn!(key = %self.key, error = %e, "failed to release cache claim");
        }
        let _ = fs::remove_file(dir.join(".lock")).await;
        self.released = true;
        self.shared.settle(&self.key);
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        if !self.released {
            self.shared
                .release_failed_blocking(&self.key, "claim abandoned");
            self.released = true;
        }
    }
}

/// Awaits another worker's in-flight execution of the same key.
pub struct Waiter {
    shared: Arc<CacheShared>,
    key: CacheKey,
}

impl Waiter {
    /// Resolves once the claim settles: `Some(outputs)` on success, `None`
    /// when the claimant failed (the caller may attempt its own claim).
    pub async fn wait(self) -> Result<Option<Bindings>, CacheError> {
        loop {
            let handle = {
                let map = self.shared.inflight.lock();
                map.get(self.key.as_hex()).cloned()
            };
            match self.shared.status(&self.key).await.as_deref() {
                Some(STATUS_DONE) => return Ok(Some(self.shared.read_outputs(&self.key).await?)),
                Some(STATUS_FAILED) | None => return Ok(None),
                _ => {}
            }
            match handle {
                Some(notify) => {
                    let notified = notify.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    // Re-check: the claim may have settled between the
                    // status read and waiter registration.
                    if !matches!(
                        self.shared.status(&self.key).await.as_deref(),
                        Some(STATUS_CLAIMED)
                    ) {
                        continue;
                    }
                    notified.await;
                }
                // Claim held by another process; fall back to polling.
                None => tokio::time::sleep(FOREIGN_CLAIM_POLL).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outputs(v: i64) -> Bindings {
        let mut b = Bindings::default();
        b.insert("out".into(), json!(v));
        b
    }

    #[tokio::test]
    async fn claim_publish_hit_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::new(dir.path()).unwrap();
        let key = derive_key("t", "local", "{}", None);

        let Lookup::Miss(claim) = cache.lookup(&key, "{}").await.unwrap() else {
            panic!("expected a miss on a cold cache");
        };
        claim.publish(&outputs(5), &[]).await.unwrap();

        let Lookup::Hit(cached) = cache.lookup(&key, "{}").await.unwrap() else {
            panic!("expected a hit after publish");
        };
        assert_eq!(cached["out"], json!(5));
    }

    #[tokio::test]
    async fn second_lookup_sees_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::new(dir.path()).unwrap();
        let key = derive_key("t", "local", "{}", None);

        let Lookup::Miss(_claim) = cache.lookup(&key, "{}").await.unwrap() else {
            panic!("expected a miss");
        };
        assert!(matches!(
            cache.lookup(&key, "{}").await.unwrap(),
            Lookup::InFlight(_)
        ));
    }

    #[tokio::test]
    async fn failed_claim_is_reclaimable() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::new(dir.path()).unwrap();
        let key = derive_key("t", "local", "{}", None);

        let Lookup::Miss(claim) = cache.lookup(&key, "{}").await.unwrap() else {
            panic!("expected a miss");
        };
        claim.fail("boom").await;
        assert!(matches!(
            cache.lookup(&key, "{}").await.unwrap(),
            Lookup::Miss(_)
        ));
    }

    #[tokio::test]
    async fn purge_forces_reexecution() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::new(dir.path()).unwrap();
        let key = derive_key("t", "local", "{}", None);
        let Lookup::Miss(claim) = cache.lookup(&key, "{}").await.unwrap() else {
            panic!("expected a miss");
        };
        claim.publish(&outputs(1), &[]).await.unwrap();
        cache.purge(&key).await.unwrap();
        assert!(matches!(
            cache.lookup(&key, "{}").await.unwrap(),
            Lookup::Miss(_)
        ));
    }

    #[tokio::test]
    async fn waiter_observes_published_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::new(dir.path()).unwrap();
        let key = derive_key("t", "local", "{}", None);

        let Lookup::Miss(claim) = cache.lookup(&key, "{}").await.unwrap() else {
            panic!("expected a miss");
        };
        let Lookup::InFlight(waiter) = cache.lookup(&key, "{}").await.unwrap() else {
            panic!("expected in-flight");
        };

        let waited = tokio::spawn(waiter.wait());
        tokio::task::yield_now().await;
        claim.publish(&outputs(7), &[]).await.unwrap();

        let got = waited.await.unwrap().unwrap().unwrap();
        assert_eq!(got["out"], json!(7));
    }

    #[tokio::test]
    async fn abandoned_claim_releases_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::new(dir.path()).unwrap();
        let key = derive_key("t", "local", "{}", None);

        {
            let Lookup::Miss(_claim) = cache.lookup(&key, "{}").await.unwrap() else {
                panic!("expected a miss");
            };
        }
        assert!(matches!(
            cache.lookup(&key, "{}").await.unwrap(),
            Lookup::Miss(_)
        ));
    }

    #[tokio::test]
    async fn corrupt_done_entry_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::new(dir.path()).unwrap();
        let key = derive_key("t", "local", "{}", None);
        let entry = dir.path().join(key.as_hex());
        std::fs::create_dir_all(&entry).unwrap();
        std::fs::write(entry.join("status"), "done").unwrap();
        std::fs::write(entry.join("outputs.json"), "not json").unwrap();
        assert!(matches!(
            cache.lookup(&key, "{}").await,
            Err(CacheError::Corruption { .. })
        ));
    }
}
