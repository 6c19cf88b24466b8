use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Numeric bag identifier. Rendered as `bag_NNNNN`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BagId(pub u32);

impl BagId {
    pub fn next(self) -> BagId {
        BagId(self.0 + 1)
    }

    /// Extract the bag number from a remote key such as
    /// `2026-backup/host_media_bag_00007_1a2b3c4d.tar`.
    pub fn from_remote_key(key: &str) -> Option<BagId> {
        let name = key.rsplit('/').next()?;
        let idx = name.rfind("_bag_")?;
        let digits: String = name[idx + 5..]
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        digits.parse().ok().map(BagId)
    }
}

impl fmt::Debug for BagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BagId({})", self.0)
    }
}

impl fmt::Display for BagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bag_{:05}", self.0)
    }
}

impl FromStr for BagId {
    type Err = String;

    /// Accepts `7`, `00007`, `bag_7` or `bag_00007`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let digits = s.trim().strip_prefix("bag_").unwrap_or(s.trim());
        digits
            .parse::<u32>()
            .map(BagId)
            .map_err(|_| format!("invalid bag id: '{s}'"))
    }
}
