use std::fs;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use blake2::digest::consts::U16;
use blake2::{Blake2b, Digest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use floe_types::error::{FloeError, Result};

use crate::{
    ObjectHead, ObjectInfo, ObjectStore, RestoreRequest, RestoreStatus, RestoreTier, StorageClass,
};

type Blake2b128 = Blake2b<U16>;

/// Directory under the root holding per-object metadata sidecars.
const META_DIR: &str = ".floe-meta";

/// Object store on a local directory. Emulates storage classes and thaw
/// latency so that cold-tier workflows behave the same as against S3.
pub struct LocalStore {
    root: PathBuf,
    thaw_delay: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ObjectMeta {
    storage_class: StorageClass,
    uploaded_at: DateTime<Utc>,
    etag: String,
    #[serde(default)]
    restore_requested_at: Option<DateTime<Utc>>,
    #[serde(default)]
    restore_days: u32,
}

impl LocalStore {
    /// Create a store rooted at the given directory path.
    pub fn new(root: &str) -> Result<Self> {
        let root_path = PathBuf::from(root);
        let root = if root_path.exists() {
            fs::canonicalize(&root_path)?
        } else {
            fs::create_dir_all(&root_path)?;
            root_path
        };
        Ok(Self {
            root,
            thaw_delay: Duration::ZERO,
        })
    }

    /// Time between a restore request and the object becoming readable.
    pub fn with_thaw_delay(mut self, delay: Duration) -> Self {
        self.thaw_delay = delay;
        self
    }

    /// Reject storage keys that could escape the store root.
    fn validate_key(key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(FloeError::Other("unsafe storage key: empty".into()));
        }
        if key.starts_with('/') || key.starts_with('\\') {
            return Err(FloeError::Other(format!(
                "unsafe storage key: absolute path '{key}'"
            )));
        }
        if key.contains('\\') {
            return Err(FloeError::Other(format!(
                "unsafe storage key: contains backslash '{key}'"
            )));
        }
        if key.starts_with(META_DIR) {
            return Err(FloeError::Other(format!(
                "unsafe storage key: reserved prefix '{key}'"
            )));
        }
        for component in Path::new(key).components() {
            if component == Component::ParentDir {
                return Err(FloeError::Other(format!(
                    "unsafe storage key: parent traversal '{key}'"
                )));
            }
        }
        Ok(())
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        Self::validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.root.join(META_DIR).join(format!("{key}.json"))
    }

    fn read_meta(&self, key: &str, data_path: &Path) -> Result<Option<ObjectMeta>> {
        let data_meta = match fs::metadata(data_path) {
            Ok(m) if m.is_file() => m,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match fs::read(self.meta_path(key)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Files dropped into the directory by hand count as STANDARD.
                let uploaded_at = data_meta
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());
                Ok(Some(ObjectMeta {
                    storage_class: StorageClass::Standard,
                    uploaded_at,
                    etag: String::new(),
                    restore_requested_at: None,
                    restore_days: 0,
                }))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write_meta(&self, key: &str, meta: &ObjectMeta) -> Result<()> {
        let path = self.meta_path(key);
        atomic_write(&path, &serde_json::to_vec_pretty(meta)?)
    }

    fn restore_status(&self, meta: &ObjectMeta) -> RestoreStatus {
        let Some(requested) = meta.restore_requested_at else {
            return RestoreStatus::NotRequested;
        };
        let delay = chrono::Duration::from_std(self.thaw_delay).unwrap_or_default();
        let ready_at = requested + delay;
        let expires_at = ready_at + chrono::Duration::days(i64::from(meta.restore_days));
        let now = Utc::now();
        if now < ready_at {
            RestoreStatus::InProgress
        } else if now < expires_at {
            RestoreStatus::Available {
                expires: Some(expires_at.to_rfc2822()),
            }
        } else {
            RestoreStatus::NotRequested
        }
    }

    fn readable_path(&self, key: &str) -> Result<PathBuf> {
        let path = self.resolve(key)?;
        let meta = self
            .read_meta(key, &path)?
            .ok_or_else(|| FloeError::NotFound(key.to_string()))?;
        if meta.storage_class.is_cold()
            && !matches!(self.restore_status(&meta), RestoreStatus::Available { .. })
        {
            return Err(FloeError::transport(
                format!("LOCAL GET {key}"),
                "InvalidObjectState: object is in cold storage and has not been restored",
                false,
            ));
        }
        Ok(path)
    }

    /// Recursively list all files under `dir` as `/`-separated keys.
    fn list_recursive(&self, dir: &Path, keys: &mut Vec<String>) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                if entry.file_name() == META_DIR {
                    continue;
                }
                self.list_recursive(&entry.path(), keys)?;
            } else if file_type.is_file() {
                if let Ok(rel) = entry.path().strip_prefix(&self.root) {
                    let key = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    keys.push(key);
                }
            }
        }
        Ok(())
    }
}

/// Write data to a temp file in the same directory, then atomically rename
/// into place.
fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| FloeError::Other(format!("no parent for '{}'", path.display())))?;
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

impl ObjectStore for LocalStore {
    fn put_bytes(&self, key: &str, data: &[u8], class: &StorageClass) -> Result<String> {
        let mut cursor = std::io::Cursor::new(data);
        self.put_reader(key, &mut cursor, data.len() as u64, class)
    }

    fn put_reader(
        &self,
        key: &str,
        reader: &mut dyn Read,
        len: u64,
        class: &StorageClass,
    ) -> Result<String> {
        let path = self.resolve(key)?;
        let dir = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        let mut hasher = Blake2b128::new();
        let mut buf = vec![0u8; 1024 * 1024];
        let mut written = 0u64;
        let mut limited = reader.take(len);
        loop {
            let n = limited.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            tmp.write_all(&buf[..n])?;
            written += n as u64;
        }
        if written != len {
            return Err(FloeError::Other(format!(
                "LOCAL PUT {key}: source ended early ({written} of {len} bytes)"
            )));
        }
        tmp.persist(&path).map_err(|e| e.error)?;

        let etag = hex::encode(hasher.finalize());
        self.write_meta(
            key,
            &ObjectMeta {
                storage_class: class.clone(),
                uploaded_at: Utc::now(),
                etag: etag.clone(),
                restore_requested_at: None,
                restore_days: 0,
            },
        )?;
        Ok(etag)
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.readable_path(key) {
            Ok(path) => Ok(Some(fs::read(path)?)),
            Err(FloeError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn get_to_writer(&self, key: &str, writer: &mut dyn Write) -> Result<u64> {
        let path = self.readable_path(key)?;
        let mut file = fs::File::open(path)?;
        Ok(std::io::copy(&mut file, writer)?)
    }

    fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let mut keys = Vec::new();
        match fs::metadata(&self.root) {
            Ok(meta) if meta.is_dir() => self.list_recursive(&self.root, &mut keys)?,
            Ok(_) => return Ok(Vec::new()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        }
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();

        let mut objects = Vec::with_capacity(keys.len());
        for key in keys {
            let path = self.root.join(&key);
            let size = fs::metadata(&path)?.len();
            if let Some(meta) = self.read_meta(&key, &path)? {
                objects.push(ObjectInfo {
                    key,
                    size,
                    etag: meta.etag,
                    last_modified: meta.uploaded_at,
                    storage_class: meta.storage_class,
                });
            }
        }
        Ok(objects)
    }

    fn head(&self, key: &str) -> Result<Option<ObjectHead>> {
        let path = self.resolve(key)?;
        let Some(meta) = self.read_meta(key, &path)? else {
            return Ok(None);
        };
        let size = fs::metadata(&path)?.len();
        let restore = self.restore_status(&meta);
        Ok(Some(ObjectHead {
            info: ObjectInfo {
                key: key.to_string(),
                size,
                etag: meta.etag,
                last_modified: meta.uploaded_at,
                storage_class: meta.storage_class,
            },
            restore,
        }))
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.resolve(key)?;
        for p in [path, self.meta_path(key)] {
            match fs::remove_file(&p) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn request_restore(&self, key: &str, days: u32, tier: RestoreTier) -> Result<RestoreRequest> {
        let path = self.resolve(key)?;
        let mut meta = self
            .read_meta(key, &path)?
            .ok_or_else(|| FloeError::NotFound(key.to_string()))?;
        if !meta.storage_class.is_cold() {
            return Ok(RestoreRequest::AlreadyAvailable);
        }
        match self.restore_status(&meta) {
            RestoreStatus::InProgress => Ok(RestoreRequest::AlreadyInProgress),
            RestoreStatus::Available { .. } => Ok(RestoreRequest::AlreadyAvailable),
            RestoreStatus::NotRequested => {
                tracing::debug!("LOCAL RESTORE {key}: {days} days, tier {tier}");
                meta.restore_requested_at = Some(Utc::now());
                meta.restore_days = days;
                self.write_meta(key, &meta)?;
                Ok(RestoreRequest::Accepted)
            }
        }
    }
}
