use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use floe_storage::{
    ObjectHead, ObjectInfo, ObjectStore, RestoreRequest, RestoreStatus, RestoreTier, StorageClass,
};
use floe_types::{FloeError, Result};
use zeroize::Zeroizing;

use crate::commands::mirror::{self, MirrorOptions, MirrorReport};
use crate::commands::util::ArchiveContext;
use crate::config::{FloeConfig, ResolvedPaths};
use crate::filter::key::test_params;
use crate::filter::PassphraseKey;
use crate::inventory::Inventory;
use crate::keys::is_bag_key;
use crate::mount::Mounter;

/// Calls seen by a [`MemoryStore`], failed attempts included.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CallCounts {
    pub puts: usize,
    pub gets: usize,
    pub lists: usize,
    pub heads: usize,
    pub deletes: usize,
    pub restores: usize,
}

impl CallCounts {
    pub fn total(&self) -> usize {
        self.puts + self.gets + self.lists + self.heads + self.deletes + self.restores
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    etag: String,
    class: StorageClass,
    last_modified: DateTime<Utc>,
    restore: RestoreStatus,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<String, StoredObject>,
    calls: CallCounts,
    failing_puts: usize,
    deletes_before_failure: Option<usize>,
    instant_thaw: bool,
}

/// In-memory object service with storage classes and thaw emulation.
/// Cold objects stay unreadable until [`MemoryStore::complete_thaws`].
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cold objects become readable as soon as a thaw is requested.
    pub fn with_instant_thaw(self) -> Self {
        self.inner.lock().unwrap().instant_thaw = true;
        self
    }

    pub fn calls(&self) -> CallCounts {
        self.inner.lock().unwrap().calls
    }

    pub fn reset_calls(&self) {
        self.inner.lock().unwrap().calls = CallCounts::default();
    }

    /// The next `n` PUTs fail with a transient error.
    pub fn fail_next_puts(&self, n: usize) {
        self.inner.lock().unwrap().failing_puts = n;
    }

    /// Allow `n` more DELETEs, then refuse every one after that.
    pub fn fail_deletes_after(&self, n: usize) {
        self.inner.lock().unwrap().deletes_before_failure = Some(n);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().objects.len()
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().unwrap().objects.keys().cloned().collect()
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .unwrap()
            .objects
            .get(key)
            .map(|o| o.data.clone())
    }

    pub fn class_of(&self, key: &str) -> Option<StorageClass> {
        self.inner
            .lock()
            .unwrap()
            .objects
            .get(key)
            .map(|o| o.class.clone())
    }

    /// Insert an object directly, bypassing the counters.
    pub fn insert(&self, key: &str, data: &[u8], class: StorageClass, last_modified: DateTime<Utc>) {
        self.inner.lock().unwrap().objects.insert(
            key.to_string(),
            StoredObject {
                data: data.to_vec(),
                etag: etag_of(data),
                class,
                last_modified,
                restore: RestoreStatus::NotRequested,
            },
        );
    }

    /// Remove an object directly, bypassing the counters.
    pub fn remove(&self, key: &str) {
        self.inner.lock().unwrap().objects.remove(key);
    }

    pub fn set_last_modified(&self, key: &str, when: DateTime<Utc>) {
        if let Some(o) = self.inner.lock().unwrap().objects.get_mut(key) {
            o.last_modified = when;
        }
    }

    /// Age every object.
    pub fn backdate_all(&self, by: chrono::Duration) {
        for o in self.inner.lock().unwrap().objects.values_mut() {
            o.last_modified -= by;
        }
    }

    pub fn restore_status(&self, key: &str) -> Option<RestoreStatus> {
        self.inner
            .lock()
            .unwrap()
            .objects
            .get(key)
            .map(|o| o.restore.clone())
    }

    /// Finish every thaw in progress.
    pub fn complete_thaws(&self) {
        for o in self.inner.lock().unwrap().objects.values_mut() {
            if o.restore == RestoreStatus::InProgress {
                o.restore = RestoreStatus::Available { expires: None };
            }
        }
    }

    fn readable(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.gets += 1;
        let Some(o) = inner.objects.get(key) else {
            return Ok(None);
        };
        if o.class.is_cold() && !matches!(o.restore, RestoreStatus::Available { .. }) {
            return Err(FloeError::transport(
                format!("GET {key}"),
                "InvalidObjectState",
                false,
            ));
        }
        Ok(Some(o.data.clone()))
    }
}

fn etag_of(data: &[u8]) -> String {
    use blake2::digest::consts::U16;
    use blake2::{Blake2b, Digest};
    hex::encode(Blake2b::<U16>::digest(data))
}

impl ObjectStore for MemoryStore {
    fn put_bytes(&self, key: &str, data: &[u8], class: &StorageClass) -> Result<String> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.puts += 1;
        if inner.failing_puts > 0 {
            inner.failing_puts -= 1;
            return Err(FloeError::transport(format!("PUT {key}"), "HTTP 503", true));
        }
        let etag = etag_of(data);
        inner.objects.insert(
            key.to_string(),
            StoredObject {
                data: data.to_vec(),
                etag: etag.clone(),
                class: class.clone(),
                last_modified: Utc::now(),
                restore: RestoreStatus::NotRequested,
            },
        );
        Ok(etag)
    }

    fn put_reader(
        &self,
        key: &str,
        reader: &mut dyn Read,
        len: u64,
        class: &StorageClass,
    ) -> Result<String> {
        let mut data = Vec::with_capacity(len as usize);
        reader.take(len).read_to_end(&mut data)?;
        if data.len() as u64 != len {
            return Err(FloeError::Other(format!("PUT {key}: short body")));
        }
        self.put_bytes(key, &data, class)
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.readable(key)
    }

    fn get_to_writer(&self, key: &str, writer: &mut dyn Write) -> Result<u64> {
        let data = self
            .readable(key)?
            .ok_or_else(|| FloeError::NotFound(key.to_string()))?;
        writer.write_all(&data)?;
        Ok(data.len() as u64)
    }

    fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.lists += 1;
        Ok(inner
            .objects
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, o)| info_of(k, o))
            .collect())
    }

    fn head(&self, key: &str) -> Result<Option<ObjectHead>> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.heads += 1;
        Ok(inner.objects.get(key).map(|o| ObjectHead {
            info: info_of(key, o),
            restore: o.restore.clone(),
        }))
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.deletes += 1;
        match inner.deletes_before_failure {
            Some(0) => return Err(FloeError::transport(format!("DELETE {key}"), "HTTP 403", false)),
            Some(left) => inner.deletes_before_failure = Some(left - 1),
            None => {}
        }
        inner.objects.remove(key);
        Ok(())
    }

    fn request_restore(&self, key: &str, _days: u32, _tier: RestoreTier) -> Result<RestoreRequest> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.restores += 1;
        let instant = inner.instant_thaw;
        let o = inner
            .objects
            .get_mut(key)
            .ok_or_else(|| FloeError::NotFound(key.to_string()))?;
        if !o.class.is_cold() {
            return Ok(RestoreRequest::AlreadyAvailable);
        }
        match o.restore {
            RestoreStatus::InProgress => Ok(RestoreRequest::AlreadyInProgress),
            RestoreStatus::Available { .. } => Ok(RestoreRequest::AlreadyAvailable),
            RestoreStatus::NotRequested => {
                o.restore = if instant {
                    RestoreStatus::Available { expires: None }
                } else {
                    RestoreStatus::InProgress
                };
                Ok(RestoreRequest::Accepted)
            }
        }
    }
}

fn info_of(key: &str, o: &StoredObject) -> ObjectInfo {
    ObjectInfo {
        key: key.to_string(),
        size: o.data.len() as u64,
        etag: o.etag.clone(),
        last_modified: o.last_modified,
        storage_class: o.class.clone(),
    }
}

/// Write `body` to `root/rel`, creating parents.
pub fn write_file(root: &Path, rel: &str, body: &[u8]) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, body).unwrap();
}

/// Mounter for fixtures, where every branch is local.
pub struct NoMount;

impl Mounter for NoMount {
    fn mount(&self, target: &str, _mount_point: &Path) -> Result<()> {
        Err(FloeError::Other(format!("unexpected mount of {target}")))
    }

    fn unmount(&self, _mount_point: &Path) -> Result<()> {
        Ok(())
    }
}

/// A data directory, a state directory and a context over a [`MemoryStore`].
pub struct Fixture {
    pub dir: tempfile::TempDir,
    pub store: Arc<MemoryStore>,
    pub ctx: ArchiveContext,
}

impl Fixture {
    /// `branches` are config branch lines; `{data}` expands to the data directory.
    pub fn new(bag_size: &str, branches: &[&str]) -> Self {
        Self::with_store(MemoryStore::new(), bag_size, branches)
    }

    pub fn with_store(store: MemoryStore, bag_size: &str, branches: &[&str]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        std::fs::create_dir_all(&data).unwrap();
        let lines: Vec<String> = branches
            .iter()
            .map(|b| format!("  - \"{}\"", b.replace("{data}", data.to_str().unwrap())))
            .collect();
        let yaml = format!(
            "remote:\n  url: memory\n  retry:\n    max_retries: 2\n    retry_delay_ms: 1\n    retry_max_delay_ms: 2\n\
             archive:\n  bag_size: \"{bag_size}\"\n  hostname: testhost\n\
             limits:\n  transfer_concurrency: 2\n\
             encryption:\n  passphrase: fixture-pass\n\
             branches:\n{}\n",
            lines.join("\n")
        );
        let config: FloeConfig = serde_yaml::from_str(&yaml).unwrap();
        config.validate().unwrap();

        let store = Arc::new(store);
        let key = PassphraseKey::with_params(
            Zeroizing::new("fixture-pass".to_string()),
            config.encryption.cipher,
            test_params(),
        );
        let ctx = ArchiveContext::with_parts(
            config,
            ResolvedPaths::under(&dir.path().join("state")),
            store.clone(),
            Arc::new(NoMount),
            Some(Arc::new(key)),
        )
        .unwrap();
        Self { dir, store, ctx }
    }

    pub fn data(&self) -> PathBuf {
        self.dir.path().join("data")
    }

    pub fn branch_path(&self, name: &str) -> String {
        self.data().join(name).to_string_lossy().into_owned()
    }

    /// Write a file relative to the data directory.
    pub fn write(&self, rel: &str, body: &[u8]) {
        write_file(&self.data(), rel, body);
    }

    pub fn inventory(&self) -> Inventory {
        self.ctx.inventory_store().load().unwrap()
    }

    pub fn inventory_bytes(&self) -> Option<Vec<u8>> {
        std::fs::read(&self.ctx.paths.inventory_file).ok()
    }

    pub fn mirror(&self) -> MirrorReport {
        mirror::run(
            &self.ctx,
            &MirrorOptions {
                dry_run: false,
                ..Default::default()
            },
        )
        .unwrap()
    }

    /// Bag keys currently stored, manifests and system files excluded.
    pub fn bag_keys(&self) -> Vec<String> {
        self.store
            .keys()
            .into_iter()
            .filter(|k| is_bag_key(k))
            .collect()
    }
}
