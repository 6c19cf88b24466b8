use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use floe_storage::{RestoreTier, RetryConfig, StorageClass, StorageConfig};
use floe_types::error::{FloeError, Result};

use super::defaults::*;
use super::util::expand_tilde;
use crate::branch::{Branch, BranchInput, BranchTag};

/// Remote object-service settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    /// `s3://endpoint/bucket[/root]` or a local directory.
    pub url: String,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Key prefix for everything a run writes. `{year}` expands to the
    /// current year.
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default = "default_bag_storage_class")]
    pub bag_storage_class: StorageClass,
    /// Simulated thaw latency, local directory backend only.
    #[serde(default)]
    pub local_thaw_delay_secs: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl RemoteConfig {
    /// Prefix for objects written at `now`.
    pub fn dated_prefix(&self, now: DateTime<Utc>) -> String {
        let mut prefix = self.prefix.replace("{year}", &now.year().to_string());
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }
        prefix
    }

    /// Static part of the prefix, used when listing every year at once.
    pub fn listing_prefix(&self) -> String {
        match self.prefix.find('{') {
            Some(idx) => self.prefix[..idx].to_string(),
            None => self.prefix.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FingerprintMode {
    /// Hash every byte plus size and mtime.
    Content,
    /// Hash relative path, size and mtime only.
    Metadata,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveConfig {
    /// Target bag capacity, e.g. "40G".
    #[serde(default = "default_bag_size")]
    pub bag_size: String,
    #[serde(default = "default_min_retention_days")]
    pub min_retention_days: u32,
    #[serde(default = "default_scan_interval_days")]
    pub scan_interval_days: u32,
    #[serde(default = "default_fingerprint")]
    pub fingerprint: FingerprintMode,
    /// How long a thawed copy stays readable.
    #[serde(default = "default_restore_days")]
    pub restore_days: u32,
    pub restore_tier: Option<String>,
    /// Overrides the detected hostname in bag names.
    pub hostname: Option<String>,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            bag_size: default_bag_size(),
            min_retention_days: default_min_retention_days(),
            scan_interval_days: default_scan_interval_days(),
            fingerprint: default_fingerprint(),
            restore_days: default_restore_days(),
            restore_tier: None,
            hostname: None,
        }
    }
}

impl ArchiveConfig {
    pub fn bag_capacity(&self) -> Result<u64> {
        let size = parse_human_size(&self.bag_size)?;
        if size == 0 {
            return Err(FloeError::Config("archive.bag_size must be greater than zero".into()));
        }
        Ok(size)
    }

    pub fn default_tier(&self) -> Result<RestoreTier> {
        match &self.restore_tier {
            Some(t) => t.parse(),
            None => Ok(RestoreTier::Bulk),
        }
    }
}

/// Local directories. Unset entries live under `state_dir`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    pub state_dir: Option<String>,
    pub inventory_file: Option<String>,
    pub inventory_backup_dir: Option<String>,
    pub staging_dir: Option<String>,
    pub manifest_dir: Option<String>,
    pub log_dir: Option<String>,
    pub mount_base: Option<String>,
}

/// Fully resolved local directories.
#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub state_dir: PathBuf,
    pub inventory_file: PathBuf,
    pub inventory_backup_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub manifest_dir: PathBuf,
    pub log_dir: PathBuf,
    pub mount_base: PathBuf,
}

impl ResolvedPaths {
    /// Persisted restore jobs.
    pub fn restore_state_file(&self) -> PathBuf {
        self.state_dir.join("restores.json")
    }

    /// All paths under one directory. Used by tests and `--state-dir`.
    pub fn under(state_dir: &Path) -> Self {
        Self {
            state_dir: state_dir.to_path_buf(),
            inventory_file: state_dir.join("inventory.json"),
            inventory_backup_dir: state_dir.join("inventory_bak"),
            staging_dir: state_dir.join("staging"),
            manifest_dir: state_dir.join("manifests"),
            log_dir: state_dir.join("logs"),
            mount_base: state_dir.join("mnt"),
        }
    }
}

impl PathsConfig {
    pub fn resolve(&self) -> ResolvedPaths {
        let state_dir = self
            .state_dir
            .as_deref()
            .map(|p| PathBuf::from(expand_tilde(p)))
            .or_else(|| dirs::data_dir().map(|d| d.join("floe")))
            .unwrap_or_else(|| PathBuf::from(".floe"));
        let base = ResolvedPaths::under(&state_dir);
        let pick = |opt: &Option<String>, fallback: PathBuf| {
            opt.as_deref()
                .map(|p| PathBuf::from(expand_tilde(p)))
                .unwrap_or(fallback)
        };
        ResolvedPaths {
            inventory_file: pick(&self.inventory_file, base.inventory_file.clone()),
            inventory_backup_dir: pick(&self.inventory_backup_dir, base.inventory_backup_dir.clone()),
            staging_dir: pick(&self.staging_dir, base.staging_dir.clone()),
            manifest_dir: pick(&self.manifest_dir, base.manifest_dir.clone()),
            log_dir: pick(&self.log_dir, base.log_dir.clone()),
            mount_base: pick(&self.mount_base, base.mount_base.clone()),
            state_dir,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    Gzip,
    Zstd,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompressionConfig {
    #[serde(default = "default_algorithm")]
    pub algorithm: CompressionAlgorithm,
    /// Defaults to 6 for gzip and 3 for zstd.
    pub level: Option<i32>,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            level: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CipherKind {
    Aes256Gcm,
    Chacha20Poly1305,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EncryptionConfig {
    pub passphrase: Option<String>,
    /// Shell command whose stdout is the passphrase.
    pub passcommand: Option<String>,
    #[serde(default = "default_cipher")]
    pub cipher: CipherKind,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            passphrase: None,
            passcommand: None,
            cipher: default_cipher(),
        }
    }
}

impl EncryptionConfig {
    fn has_secret_source(&self) -> bool {
        self.passphrase.is_some()
            || self.passcommand.is_some()
            || std::env::var_os("FLOE_PASSPHRASE").is_some()
    }

    /// Resolve the passphrase: inline value, then `FLOE_PASSPHRASE`, then passcommand.
    pub fn resolve_passphrase(&self) -> Result<Option<Zeroizing<String>>> {
        if let Some(p) = &self.passphrase {
            return Ok(Some(Zeroizing::new(p.clone())));
        }
        if let Ok(p) = std::env::var("FLOE_PASSPHRASE") {
            if !p.is_empty() {
                return Ok(Some(Zeroizing::new(p)));
            }
        }
        if let Some(cmd) = &self.passcommand {
            let out = crate::platform::shell::run_capture(cmd)?;
            let trimmed = out.trim_end_matches(&['\n', '\r'][..]).to_string();
            if trimmed.is_empty() {
                return Err(FloeError::Config("passcommand returned an empty passphrase".into()));
            }
            return Ok(Some(Zeroizing::new(trimmed)));
        }
        Ok(None)
    }
}

/// Throughput and parallelism. Zero means unlimited.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    #[serde(default)]
    pub upload_mib_per_sec: u64,
    #[serde(default)]
    pub download_mib_per_sec: u64,
    #[serde(default = "default_transfer_concurrency")]
    pub transfer_concurrency: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            upload_mib_per_sec: 0,
            download_mib_per_sec: 0,
            transfer_concurrency: default_transfer_concurrency(),
        }
    }
}

/// Pricing table, used for reports only.
#[derive(Debug, Clone, Deserialize)]
pub struct PricingConfig {
    #[serde(default = "default_price_per_gb_month")]
    pub price_per_gb_month: f64,
    #[serde(default = "default_price_per_1000_puts")]
    pub price_per_1000_puts: f64,
    #[serde(default = "default_price_egress_per_gb")]
    pub egress_per_gb: f64,
    #[serde(default = "default_price_thaw_standard_per_gb")]
    pub thaw_standard_per_gb: f64,
    #[serde(default = "default_price_thaw_bulk_per_gb")]
    pub thaw_bulk_per_gb: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            price_per_gb_month: default_price_per_gb_month(),
            price_per_1000_puts: default_price_per_1000_puts(),
            egress_per_gb: default_price_egress_per_gb(),
            thaw_standard_per_gb: default_price_thaw_standard_per_gb(),
            thaw_bulk_per_gb: default_price_thaw_bulk_per_gb(),
            currency: default_currency(),
        }
    }
}

/// Top-level configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct FloeConfig {
    pub remote: RemoteConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default)]
    pub encryption: EncryptionConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
    /// Gitignore-style patterns applied to every branch.
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    #[serde(default)]
    pub branches: Vec<BranchInput>,
    /// File the configuration was loaded from.
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

impl FloeConfig {
    /// Resolve branch entries into [`Branch`] records.
    pub fn branches(&self) -> Result<Vec<Branch>> {
        self.branches
            .iter()
            .map(|input| Branch::from_input(input, self.archive.scan_interval_days))
            .collect()
    }

    pub fn storage_config(&self) -> StorageConfig {
        StorageConfig {
            url: self.remote.url.clone(),
            region: self.remote.region.clone(),
            access_key_id: self.remote.access_key_id.clone(),
            secret_access_key: self.remote.secret_access_key.clone(),
            local_thaw_delay_secs: self.remote.local_thaw_delay_secs,
            retry: self.remote.retry.clone(),
        }
    }

    pub fn hostname(&self) -> String {
        self.archive
            .hostname
            .clone()
            .unwrap_or_else(crate::platform::hostname)
    }

    /// Fail fast on settings that would break a run halfway.
    pub fn validate(&self) -> Result<()> {
        if self.remote.url.trim().is_empty() {
            return Err(FloeError::Config("remote.url must be set".into()));
        }
        self.archive.bag_capacity()?;
        self.archive.default_tier()?;
        if self.limits.transfer_concurrency == 0 {
            return Err(FloeError::Config(
                "limits.transfer_concurrency must be at least 1".into(),
            ));
        }
        if self.archive.restore_days == 0 {
            return Err(FloeError::Config("archive.restore_days must be at least 1".into()));
        }

        let branches = self.branches()?;
        let mut seen = HashSet::new();
        for branch in &branches {
            if !seen.insert(branch.path.as_str()) {
                return Err(FloeError::Config(format!(
                    "branch '{}' is configured more than once",
                    branch.path
                )));
            }
        }
        if branches.iter().any(|b| b.tags.contains(&BranchTag::Encrypt))
            && !self.encryption.has_secret_source()
        {
            return Err(FloeError::Config(
                "a branch is tagged ENCRYPT but no encryption passphrase or passcommand is set"
                    .into(),
            ));
        }
        Ok(())
    }
}
