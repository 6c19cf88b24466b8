//! Remote key layout.
//!
//! ```text
//! <prefix><host>_<branch>_bag_<NNNNN>_<run>.tar     cold class
//! <prefix>manifests/<bag stem>.txt                  standard class
//! <prefix>system/<name>                             standard class
//! ```

use chrono::{DateTime, Utc};

use floe_types::{BagId, RunId};

use crate::branch::{slugify, Branch};
use crate::config::RemoteConfig;

pub const MANIFEST_DIR: &str = "manifests/";
pub const SYSTEM_DIR: &str = "system/";
const BAG_EXT: &str = ".tar";

#[derive(Debug, Clone)]
pub struct KeyLayout {
    prefix: String,
    host: String,
}

impl KeyLayout {
    pub fn new(remote: &RemoteConfig, host: &str, now: DateTime<Utc>) -> Self {
        Self {
            prefix: remote.dated_prefix(now),
            host: slugify(host),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn bag_key(&self, branch: &Branch, id: BagId, run: RunId) -> String {
        format!(
            "{}{}_{}_{id}_{run}{BAG_EXT}",
            self.prefix, self.host, branch.name
        )
    }

    pub fn system_key(&self, name: &str) -> String {
        format!("{}{SYSTEM_DIR}{name}", self.prefix)
    }
}

/// File name of a bag key without directory or extension.
pub fn bag_stem(bag_key: &str) -> &str {
    let name = bag_key.rsplit('/').next().unwrap_or(bag_key);
    name.strip_suffix(BAG_EXT).unwrap_or(name)
}

/// Manifest key living beside the bag, under the bag's own prefix.
pub fn manifest_key_for(bag_key: &str) -> String {
    let dir = match bag_key.rfind('/') {
        Some(idx) => &bag_key[..=idx],
        None => "",
    };
    format!("{dir}{MANIFEST_DIR}{}.txt", bag_stem(bag_key))
}

/// Whether a listed key names a bag rather than a manifest or system file.
pub fn is_bag_key(key: &str) -> bool {
    let name = key.rsplit('/').next().unwrap_or(key);
    let in_side_dir = key
        .split('/')
        .any(|seg| format!("{seg}/") == MANIFEST_DIR || format!("{seg}/") == SYSTEM_DIR);
    !in_side_dir && name.ends_with(BAG_EXT) && BagId::from_remote_key(key).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::PackingMode;
    use chrono::TimeZone;

    fn layout() -> KeyLayout {
        let remote: RemoteConfig =
            serde_yaml::from_str("url: /tmp/remote\nprefix: \"{year}-backup/\"").unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        KeyLayout::new(&remote, "nas 1", now)
    }

    #[test]
    fn bag_and_manifest_keys() {
        let branch = Branch::new("/srv/media", PackingMode::Shared).unwrap();
        let key = layout().bag_key(&branch, BagId(7), RunId([0xab, 0xcd, 0x01, 0x02]));
        assert_eq!(key, "2026-backup/nas_1_media_bag_00007_abcd0102.tar");
        assert_eq!(
            manifest_key_for(&key),
            "2026-backup/manifests/nas_1_media_bag_00007_abcd0102.txt"
        );
        assert_eq!(BagId::from_remote_key(&key), Some(BagId(7)));
        assert!(is_bag_key(&key));
    }

    #[test]
    fn side_files_are_not_bags() {
        assert!(!is_bag_key("2026-backup/manifests/h_m_bag_00001_aa.txt"));
        assert!(!is_bag_key("2026-backup/system/inventory.json"));
        assert!(!is_bag_key("2026-backup/system/h_m_bag_00001_aa.tar"));
        assert!(!is_bag_key("2026-backup/random.tar"));
    }

    #[test]
    fn system_key_uses_prefix() {
        assert_eq!(layout().system_key("inventory.json"), "2026-backup/system/inventory.json");
    }
}
