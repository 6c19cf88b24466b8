pub mod http_util;
pub mod local_backend;
pub mod retry;
pub mod s3_backend;
mod sigv4;

use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use floe_types::error::{FloeError, Result};

pub use retry::retry_with_backoff;

/// Remote storage class. Cold classes need a thaw before their content can be read.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StorageClass {
    Standard,
    StandardIa,
    GlacierIr,
    Glacier,
    DeepArchive,
    Other(String),
}

impl StorageClass {
    pub fn as_str(&self) -> &str {
        match self {
            StorageClass::Standard => "STANDARD",
            StorageClass::StandardIa => "STANDARD_IA",
            StorageClass::GlacierIr => "GLACIER_IR",
            StorageClass::Glacier => "GLACIER",
            StorageClass::DeepArchive => "DEEP_ARCHIVE",
            StorageClass::Other(s) => s,
        }
    }

    /// Whether objects in this class must be restored before a GET succeeds.
    pub fn is_cold(&self) -> bool {
        matches!(self, StorageClass::Glacier | StorageClass::DeepArchive)
    }
}

impl From<&str> for StorageClass {
    fn from(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "" | "STANDARD" => StorageClass::Standard,
            "STANDARD_IA" => StorageClass::StandardIa,
            "GLACIER_IR" => StorageClass::GlacierIr,
            "GLACIER" => StorageClass::Glacier,
            "DEEP_ARCHIVE" => StorageClass::DeepArchive,
            other => StorageClass::Other(other.to_string()),
        }
    }
}

impl From<String> for StorageClass {
    fn from(s: String) -> Self {
        StorageClass::from(s.as_str())
    }
}

impl From<StorageClass> for String {
    fn from(c: StorageClass) -> Self {
        c.as_str().to_string()
    }
}

impl fmt::Display for StorageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retrieval speed for a thaw request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestoreTier {
    Expedited,
    Standard,
    Bulk,
}

impl RestoreTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestoreTier::Expedited => "Expedited",
            RestoreTier::Standard => "Standard",
            RestoreTier::Bulk => "Bulk",
        }
    }

    /// Typical wait in hours for a DEEP_ARCHIVE object, used for progress reports.
    pub fn typical_wait_hours(&self) -> u32 {
        match self {
            RestoreTier::Expedited => 1,
            RestoreTier::Standard => 12,
            RestoreTier::Bulk => 48,
        }
    }
}

impl FromStr for RestoreTier {
    type Err = FloeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "expedited" | "fast" => Ok(RestoreTier::Expedited),
            "standard" => Ok(RestoreTier::Standard),
            "bulk" | "cheap" => Ok(RestoreTier::Bulk),
            other => Err(FloeError::Config(format!(
                "unknown restore tier '{other}' (use expedited/standard/bulk)"
            ))),
        }
    }
}

impl fmt::Display for RestoreTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Thaw state of a single object as reported by HEAD.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestoreStatus {
    NotRequested,
    InProgress,
    Available { expires: Option<String> },
}

/// Outcome of a restore (thaw) request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreRequest {
    Accepted,
    AlreadyInProgress,
    AlreadyAvailable,
}

/// One entry of a remote listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub etag: String,
    pub last_modified: DateTime<Utc>,
    pub storage_class: StorageClass,
}

/// Object metadata plus thaw state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHead {
    pub info: ObjectInfo,
    pub restore: RestoreStatus,
}

impl ObjectHead {
    /// Whether a GET would succeed right now.
    pub fn is_readable(&self) -> bool {
        !self.info.storage_class.is_cold()
            || matches!(self.restore, RestoreStatus::Available { .. })
    }
}

/// Abstract object service. Keys are `/`-separated and relative to the
/// backend root.
pub trait ObjectStore: Send + Sync {
    /// Upload a small in-memory object. Returns the object's etag.
    fn put_bytes(&self, key: &str, data: &[u8], class: &StorageClass) -> Result<String>;

    /// Upload `len` bytes streamed from `reader`. Returns the object's etag.
    fn put_reader(
        &self,
        key: &str,
        reader: &mut dyn Read,
        len: u64,
        class: &StorageClass,
    ) -> Result<String>;

    /// Read a whole object. Returns `None` if not found.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Stream an object into `writer`. Returns the number of bytes written.
    fn get_to_writer(&self, key: &str, writer: &mut dyn Write) -> Result<u64>;

    /// List every object whose key starts with `prefix`.
    fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>>;

    /// Fetch object metadata. Returns `None` if not found.
    fn head(&self, key: &str) -> Result<Option<ObjectHead>>;

    /// Delete an object. Missing objects are not an error.
    fn delete(&self, key: &str) -> Result<()>;

    /// Ask the service to thaw a cold object for `days` days.
    fn request_restore(&self, key: &str, days: u32, tier: RestoreTier) -> Result<RestoreRequest>;
}

/// Retry configuration for transient transport errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

fn default_max_retries() -> usize {
    5
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_retry_max_delay_ms() -> u64 {
    60_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

/// Everything needed to build a backend.
#[derive(Debug, Clone, Default)]
pub struct StorageConfig {
    pub url: String,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Simulated thaw latency for the local backend.
    pub local_thaw_delay_secs: u64,
    pub retry: RetryConfig,
}

/// Parsed form of a storage URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedUrl {
    Local {
        path: String,
    },
    S3 {
        endpoint: String,
        bucket: String,
        root: String,
    },
}

/// Parse `s3://host[:port]/bucket[/root]`, `s3+http://...`, `file:///path` or a
/// bare filesystem path.
pub fn parse_store_url(url: &str) -> Result<ParsedUrl> {
    let url = url.trim();
    if url.is_empty() {
        return Err(FloeError::Config("remote url must not be empty".into()));
    }
    let (scheme, rest) = match url.split_once("://") {
        Some((scheme, rest)) => (scheme, rest),
        None => {
            return Ok(ParsedUrl::Local {
                path: url.to_string(),
            })
        }
    };
    match scheme {
        "file" => Ok(ParsedUrl::Local {
            path: rest.to_string(),
        }),
        "s3" | "s3+http" => {
            let mut parts = rest.splitn(3, '/');
            let host = parts.next().unwrap_or_default();
            let bucket = parts.next().unwrap_or_default();
            let root = parts.next().unwrap_or_default();
            if host.is_empty() || bucket.is_empty() {
                return Err(FloeError::Config(format!(
                    "invalid S3 url '{url}': expected s3://<endpoint>/<bucket>[/<root>]"
                )));
            }
            let http_scheme = if scheme == "s3+http" { "http" } else { "https" };
            Ok(ParsedUrl::S3 {
                endpoint: format!("{http_scheme}://{host}"),
                bucket: bucket.to_string(),
                root: root.trim_matches('/').to_string(),
            })
        }
        other => Err(FloeError::UnsupportedBackend(other.to_string())),
    }
}

/// Build a backend from a [`StorageConfig`].
pub fn backend_from_config(cfg: &StorageConfig) -> Result<Box<dyn ObjectStore>> {
    match parse_store_url(&cfg.url)? {
        ParsedUrl::Local { path } => Ok(Box::new(
            local_backend::LocalStore::new(&path)?
                .with_thaw_delay(std::time::Duration::from_secs(cfg.local_thaw_delay_secs)),
        )),
        ParsedUrl::S3 {
            endpoint,
            bucket,
            root,
        } => {
            let access_key_id = cfg
                .access_key_id
                .clone()
                .or_else(|| std::env::var("AWS_ACCESS_KEY_ID").ok())
                .ok_or_else(|| FloeError::Config("S3 access_key_id is not set".into()))?;
            let secret_access_key = cfg
                .secret_access_key
                .clone()
                .or_else(|| std::env::var("AWS_SECRET_ACCESS_KEY").ok())
                .ok_or_else(|| FloeError::Config("S3 secret_access_key is not set".into()))?;
            let region = cfg.region.clone().unwrap_or_else(|| "us-east-1".into());
            Ok(Box::new(s3_backend::S3Store::new(
                &bucket,
                &region,
                &root,
                &endpoint,
                &access_key_id,
                &secret_access_key,
                cfg.retry.clone(),
            )?))
        }
    }
}
