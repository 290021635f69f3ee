//! # Persistent Bloom Index
//!
//! The [`FilterIndex`] contract for a single tenant, with filter sets
//! serialized under `<data_dir>/<tenant>/bloom/<dataset>.bloom`.
//!
//! - Open scans the directory but reads nothing; a blob is decoded the first
//!   time its dataset is touched (or when stats need every filter).
//! - Builds are published in memory at once and written on [`flush`] or
//!   [`close`]. Dropping an unclosed index flushes as a last resort.
//! - Files are written to a temporary name and renamed into place.
//!
//! [`flush`]: PersistentBloomIndex::flush
//! [`close`]: PersistentBloomIndex::close

use super::manager::BloomManager;
use super::{FilterIndex, FilterKey, FilterMetadata, SearchOutcome};
use crate::clock::Clock;
use crate::formats::{PersistedFilter, filter_from_bytes, filter_to_bytes};
use crate::primitives::{BLOOM_DIR, BLOOM_FILE_EXTENSION};
use crate::sync::lock;
use crate::{Row, TenantId, VaultError};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Longest dataset name used verbatim as a file stem.
const MAX_PLAIN_STEM: usize = 100;

pub struct PersistentBloomIndex {
    tenant: TenantId,
    dir: PathBuf,
    memory: BloomManager,
    /// Blob files found on disk and not yet decoded.
    unloaded: Mutex<BTreeSet<PathBuf>>,
    /// Datasets built or rebuilt since the last flush.
    dirty: Mutex<BTreeSet<String>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for PersistentBloomIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentBloomIndex")
            .field("tenant", &self.tenant)
            .field("dir", &self.dir)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl PersistentBloomIndex {
    /// Open (creating if needed) the bloom directory of `tenant` under `data_dir`.
    pub fn open(
        data_dir: impl AsRef<Path>,
        tenant: TenantId,
        false_positive_rate: f64,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, VaultError> {
        let dir = data_dir.as_ref().join(tenant.as_str()).join(BLOOM_DIR);
        fs::create_dir_all(&dir).map_err(|e| {
            VaultError::StorageUnavailable(format!("{}: {}", dir.display(), e))
        })?;

        let mut unloaded = BTreeSet::new();
        let entries = fs::read_dir(&dir)
            .map_err(|e| VaultError::StorageUnavailable(format!("{}: {}", dir.display(), e)))?;
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == BLOOM_FILE_EXTENSION) {
                unloaded.insert(path);
            }
        }

        tracing::info!(
            tenant = %tenant,
            dir = %dir.display(),
            on_disk = unloaded.len(),
            "persistent bloom index opened"
        );

        Ok(Self {
            memory: BloomManager::with_config(false_positive_rate, clock)?,
            tenant,
            dir,
            unloaded: Mutex::new(unloaded),
            dirty: Mutex::new(BTreeSet::new()),
            closed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    fn path_for(&self, dataset: &str) -> PathBuf {
        let plain = dataset.len() <= MAX_PLAIN_STEM
            && !dataset.starts_with('.')
            && dataset
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        let stem = if plain {
            dataset.to_string()
        } else {
            let digest = blake3::hash(dataset.as_bytes()).to_hex();
            format!("x-{}", &digest.as_str()[..32])
        };
        self.dir.join(format!("{}.{}", stem, BLOOM_FILE_EXTENSION))
    }

    fn check_tenant(&self, tenant: &TenantId) -> Result<(), VaultError> {
        if tenant != &self.tenant {
            return Err(VaultError::InvalidArgument(format!(
                "bloom index is bound to tenant {}, not {}",
                self.tenant, tenant
            )));
        }
        Ok(())
    }

    /// Decode the on-disk blob for `dataset` if it has not been read yet.
    fn ensure_loaded(&self, dataset: &str) {
        let path = self.path_for(dataset);
        let mut unloaded = lock(&self.unloaded);
        if unloaded.remove(&path) {
            self.load_file(&path);
        }
    }

    fn load_all(&self) {
        let mut unloaded = lock(&self.unloaded);
        for path in std::mem::take(&mut *unloaded) {
            self.load_file(&path);
        }
    }

    /// Caller holds the `unloaded` lock. Unreadable blobs are skipped.
    fn load_file(&self, path: &Path) {
        let decoded = fs::read(path)
            .map_err(VaultError::from)
            .and_then(|bytes| filter_from_bytes(&bytes));
        match decoded {
            Ok(persisted) if persisted.tenant == self.tenant.as_str() => {
                match FilterKey::new(&self.tenant, &persisted.dataset) {
                    Ok(key) => {
                        tracing::debug!(filter = %key, "bloom filter loaded from disk");
                        self.memory.publish(key, Arc::new(persisted.index));
                    }
                    Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping bloom file"),
                }
            }
            Ok(persisted) => tracing::warn!(
                path = %path.display(),
                owner = %persisted.tenant,
                "skipping bloom file of another tenant"
            ),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable bloom file"),
        }
    }

    fn write_blob(&self, path: &Path, bytes: &[u8]) -> Result<(), VaultError> {
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Write every dataset built since the last flush. Returns the number written.
    pub fn flush(&self) -> Result<usize, VaultError> {
        let pending = std::mem::take(&mut *lock(&self.dirty));
        let mut written = 0;
        let mut first_error = None;

        for dataset in pending {
            let Ok(key) = FilterKey::new(&self.tenant, &dataset) else {
                continue;
            };
            // Removed after being built: nothing to write.
            let Some(index) = self.memory.index(&key) else {
                continue;
            };
            let result = filter_to_bytes(&PersistedFilter {
                tenant: self.tenant.to_string(),
                dataset: dataset.clone(),
                index: (*index).clone(),
            })
            .and_then(|bytes| self.write_blob(&self.path_for(&dataset), &bytes));

            match result {
                Ok(()) => written += 1,
                Err(e) => {
                    tracing::warn!(filter = %key, error = %e, "bloom flush failed");
                    lock(&self.dirty).insert(dataset);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                if written > 0 {
                    tracing::debug!(tenant = %self.tenant, written, "bloom filters flushed");
                }
                Ok(written)
            }
        }
    }

    /// Flush pending writes and refuse further builds. Later calls are no-ops.
    pub fn close(&self) -> Result<usize, VaultError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(0);
        }
        let written = self.flush()?;
        tracing::info!(tenant = %self.tenant, written, "persistent bloom index closed");
        Ok(written)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl FilterIndex for PersistentBloomIndex {
    fn build_filter(
        &self,
        tenant: &TenantId,
        dataset: &str,
        rows: &[Row],
        chunk_size: usize,
    ) -> Result<FilterMetadata, VaultError> {
        self.check_tenant(tenant)?;
        if self.is_closed() {
            return Err(VaultError::StorageUnavailable(format!(
                "bloom index for tenant {} is closed",
                self.tenant
            )));
        }
        // A stale blob must not be loaded over the new build later.
        self.ensure_loaded(dataset);
        let metadata = self.memory.build_filter(tenant, dataset, rows, chunk_size)?;
        lock(&self.dirty).insert(dataset.to_string());
        Ok(metadata)
    }

    fn search(
        &self,
        tenant: &TenantId,
        dataset: &str,
        terms: &[String],
        candidates: Option<&[Row]>,
    ) -> Result<SearchOutcome, VaultError> {
        self.check_tenant(tenant)?;
        self.ensure_loaded(dataset);
        self.memory.search(tenant, dataset, terms, candidates)
    }

    fn is_filter_available(&self, tenant: &TenantId, dataset: &str) -> bool {
        if self.check_tenant(tenant).is_err() {
            return false;
        }
        self.ensure_loaded(dataset);
        self.memory.is_filter_available(tenant, dataset)
    }

    fn filter_stats(&self) -> BTreeMap<String, FilterMetadata> {
        self.load_all();
        self.memory.filter_stats()
    }

    fn memory_usage(&self) -> usize {
        self.load_all();
        self.memory.memory_usage()
    }

    fn remove_filter(&self, tenant: &TenantId, dataset: &str) -> Result<(), VaultError> {
        self.check_tenant(tenant)?;
        self.ensure_loaded(dataset);
        self.memory.remove_filter(tenant, dataset)?;
        lock(&self.dirty).remove(dataset);

        let path = self.path_for(dataset);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn export_filter(&self, tenant: &TenantId, dataset: &str) -> Result<Vec<u8>, VaultError> {
        self.check_tenant(tenant)?;
        self.ensure_loaded(dataset);
        self.memory.export_filter(tenant, dataset)
    }
}

impl Drop for PersistentBloomIndex {
    fn drop(&mut self) {
        if !self.is_closed()
            && let Err(e) = self.flush()
        {
            tracing::warn!(tenant = %self.tenant, error = %e, "bloom flush on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use tempfile::tempdir;

    fn tenant(name: &str) -> TenantId {
        TenantId::new(name).expect("tenant")
    }

    fn open(dir: &Path, name: &str) -> PersistentBloomIndex {
        PersistentBloomIndex::open(dir, tenant(name), 0.01, Arc::new(SystemClock)).expect("open")
    }

    fn rows(n: usize) -> Vec<Row> {
        (0..n)
            .map(|i| Row::new().with("name", format!("leaf-{i}")))
            .collect()
    }

    fn pending(index: &PersistentBloomIndex) -> usize {
        lock(&index.unloaded).len()
    }

    #[test]
    fn filters_survive_reopen_and_load_lazily() {
        let temp = tempdir().expect("temp dir");
        {
            let index = open(temp.path(), "acme");
            index.build_filter(&tenant("acme"), "devices", &rows(40), 10).expect("build");
            index.build_filter(&tenant("acme"), "links", &rows(5), 10).expect("build");
            assert_eq!(index.close().expect("close"), 2);
        }

        let index = open(temp.path(), "acme");
        assert_eq!(pending(&index), 2);

        let data = rows(40);
        let outcome = index
            .search(&tenant("acme"), "devices", &["leaf-7".to_string()], Some(&data))
            .expect("search");
        assert_eq!(outcome.matched_count, 1);
        assert_eq!(pending(&index), 1);

        assert_eq!(index.filter_stats().len(), 2);
        assert_eq!(pending(&index), 0);
    }

    #[test]
    fn close_is_idempotent_and_blocks_builds() {
        let temp = tempdir().expect("temp dir");
        let index = open(temp.path(), "acme");
        index.build_filter(&tenant("acme"), "d", &rows(3), 10).expect("build");

        assert_eq!(index.close().expect("close"), 1);
        assert_eq!(index.close().expect("close again"), 0);
        assert!(matches!(
            index.build_filter(&tenant("acme"), "d", &rows(3), 10),
            Err(VaultError::StorageUnavailable(_))
        ));
        assert!(index.is_filter_available(&tenant("acme"), "d"));
    }

    #[test]
    fn drop_flushes_unclosed_index() {
        let temp = tempdir().expect("temp dir");
        {
            let index = open(temp.path(), "acme");
            index.build_filter(&tenant("acme"), "d", &rows(3), 10).expect("build");
        }
        let index = open(temp.path(), "acme");
        assert!(index.is_filter_available(&tenant("acme"), "d"));
    }

    #[test]
    fn foreign_tenant_rejected() {
        let temp = tempdir().expect("temp dir");
        let index = open(temp.path(), "acme");
        assert!(matches!(
            index.build_filter(&tenant("other"), "d", &rows(3), 10),
            Err(VaultError::InvalidArgument(_))
        ));
        assert!(!index.is_filter_available(&tenant("other"), "d"));
    }

    #[test]
    fn corrupt_blob_is_skipped() {
        let temp = tempdir().expect("temp dir");
        let dir = temp.path().join("acme").join(BLOOM_DIR);
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join("devices.bloom"), b"RVBF\x02garbage").expect("write");

        let index = open(temp.path(), "acme");
        assert!(!index.is_filter_available(&tenant("acme"), "devices"));
        assert!(index.filter_stats().is_empty());
    }

    #[test]
    fn remove_deletes_file() {
        let temp = tempdir().expect("temp dir");
        let index = open(temp.path(), "acme");
        index.build_filter(&tenant("acme"), "d", &rows(3), 10).expect("build");
        index.flush().expect("flush");
        let path = index.path_for("d");
        assert!(path.exists());

        index.remove_filter(&tenant("acme"), "d").expect("remove");
        assert!(!path.exists());
        assert_eq!(index.flush().expect("flush"), 0);
    }

    #[test]
    fn unusual_dataset_names_get_hashed_file_names() {
        let temp = tempdir().expect("temp dir");
        let index = open(temp.path(), "acme");
        let plain = index.path_for("FQ_devices-v2");
        let hashed = index.path_for("../etc/passwd");
        assert!(plain.ends_with("FQ_devices-v2.bloom"));
        assert_eq!(hashed.parent(), Some(index.dir.as_path()));
        assert!(
            hashed
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("x-"))
        );

        index
            .build_filter(&tenant("acme"), "sites / west", &rows(3), 10)
            .expect("build");
        index.close().expect("close");
        let reopened = open(temp.path(), "acme");
        assert!(reopened.filter_stats().contains_key("acme/sites / west"));
    }
}
