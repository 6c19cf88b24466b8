//! Configured branches and their resolved behavior flags.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use floe_types::error::{FloeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackingMode {
    /// Each immediate child is an atom; atoms are bin-packed together.
    Shared,
    /// The whole branch is one atom that never shares a bag.
    Sovereign,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchTag {
    Compress,
    Encrypt,
    Locked,
}

/// Operations gated by the `Locked` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchAction {
    Mirror,
    Reset,
    Repack,
    Delete,
}

impl fmt::Display for BranchAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BranchAction::Mirror => "mirror",
            BranchAction::Reset => "reset",
            BranchAction::Repack => "repack",
            BranchAction::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// Config input: either the compact line form or a mapping.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BranchInput {
    Line(String),
    Rich {
        path: String,
        #[serde(default)]
        mode: Option<PackingMode>,
        #[serde(default)]
        tags: Vec<BranchTag>,
        #[serde(default)]
        exclude: Vec<String>,
        #[serde(default)]
        scan_interval_days: Option<u32>,
    },
}

/// Where a branch's data lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchLocation {
    Local(PathBuf),
    /// `user@host:/path`, mounted before scanning.
    Remote {
        target: String,
        host: String,
        path: String,
    },
}

/// Closed set of behavior flags, resolved once per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BehaviorFlags {
    pub sovereign: bool,
    pub compress: bool,
    pub encrypt: bool,
    pub locked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Branch {
    /// Configured path; also the branch key in the inventory.
    pub path: String,
    /// Short file-name-safe label used in bag names and archive paths.
    pub name: String,
    pub mode: PackingMode,
    pub tags: BTreeSet<BranchTag>,
    pub exclude: Vec<String>,
    pub scan_interval_days: u32,
    pub location: BranchLocation,
}

impl Branch {
    pub fn new(path: &str, mode: PackingMode) -> Result<Self> {
        let path = path.trim();
        if path.is_empty() {
            return Err(FloeError::Config("branch path must not be empty".into()));
        }
        let location = parse_location(path);
        let base = match &location {
            BranchLocation::Local(p) => p
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "root".into()),
            BranchLocation::Remote { path, .. } => path
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .filter(|s| !s.is_empty())
                .unwrap_or("root")
                .to_string(),
        };
        Ok(Self {
            path: path.to_string(),
            name: slugify(&base),
            mode,
            tags: BTreeSet::new(),
            exclude: Vec::new(),
            scan_interval_days: 0,
            location,
        })
    }

    pub fn from_input(input: &BranchInput, default_interval: u32) -> Result<Self> {
        match input {
            BranchInput::Line(line) => {
                let mut branch = Self::parse_line(line)?;
                if branch.scan_interval_days == 0 {
                    branch.scan_interval_days = default_interval;
                }
                Ok(branch)
            }
            BranchInput::Rich {
                path,
                mode,
                tags,
                exclude,
                scan_interval_days,
            } => {
                let mut branch = Self::new(path, mode.unwrap_or(PackingMode::Shared))?;
                branch.tags = tags.iter().copied().collect();
                branch.exclude = exclude.clone();
                branch.scan_interval_days = scan_interval_days.unwrap_or(default_interval);
                Ok(branch)
            }
        }
    }

    /// Parse `"/path ::IMMUTABLE ::COMPRESS ::EXCLUDE cache ::INTERVAL 30"`.
    pub fn parse_line(line: &str) -> Result<Self> {
        let mut parts = line.split("::");
        let path = parts.next().unwrap_or_default().trim();
        let mut mode = PackingMode::Shared;
        let mut tags = BTreeSet::new();
        let mut exclude = Vec::new();
        let mut interval = 0;

        for raw in parts {
            let raw = raw.trim();
            let (word, arg) = match raw.split_once(char::is_whitespace) {
                Some((w, a)) => (w, a.trim()),
                None => (raw, ""),
            };
            match word.to_ascii_uppercase().as_str() {
                "IMMUTABLE" | "SOVEREIGN" => mode = PackingMode::Sovereign,
                "MUTABLE" | "SHARED" => mode = PackingMode::Shared,
                "COMPRESS" => {
                    tags.insert(BranchTag::Compress);
                }
                "ENCRYPT" => {
                    tags.insert(BranchTag::Encrypt);
                }
                "LOCKED" => {
                    tags.insert(BranchTag::Locked);
                }
                "EXCLUDE" if !arg.is_empty() => exclude.push(arg.to_string()),
                "INTERVAL" => {
                    interval = arg.parse().map_err(|_| {
                        FloeError::Config(format!("invalid INTERVAL '{arg}' in branch '{line}'"))
                    })?;
                }
                other => {
                    return Err(FloeError::Config(format!(
                        "unknown branch tag '{other}' in '{line}'"
                    )))
                }
            }
        }

        let mut branch = Self::new(path, mode)?;
        branch.tags = tags;
        branch.exclude = exclude;
        branch.scan_interval_days = interval;
        Ok(branch)
    }

    pub fn flags(&self) -> BehaviorFlags {
        BehaviorFlags {
            sovereign: self.mode == PackingMode::Sovereign,
            compress: self.tags.contains(&BranchTag::Compress),
            encrypt: self.tags.contains(&BranchTag::Encrypt),
            locked: self.tags.contains(&BranchTag::Locked),
        }
    }

    /// Reject actions a `Locked` branch forbids.
    pub fn check_permitted(&self, action: BranchAction) -> Result<()> {
        if self.flags().locked {
            return Err(FloeError::PolicyViolation(format!(
                "branch '{}' is LOCKED; {action} is not permitted",
                self.path
            )));
        }
        Ok(())
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.location, BranchLocation::Remote { .. })
    }

    /// Local directory to scan: the path itself, or the mount point for
    /// remote branches.
    pub fn local_root(&self, mount_base: &Path) -> PathBuf {
        match &self.location {
            BranchLocation::Local(p) => p.clone(),
            BranchLocation::Remote { host, .. } => {
                mount_base.join(format!("{}_{}", slugify(host), self.name))
            }
        }
    }

    /// Match a user-supplied selector against path or name.
    pub fn matches(&self, selector: &str) -> bool {
        let selector = selector.trim_end_matches('/');
        self.path.trim_end_matches('/') == selector || self.name == selector
    }

    pub fn describe_tags(&self) -> String {
        let mut words = vec![match self.mode {
            PackingMode::Shared => "SHARED",
            PackingMode::Sovereign => "SOVEREIGN",
        }];
        for tag in &self.tags {
            words.push(match tag {
                BranchTag::Compress => "COMPRESS",
                BranchTag::Encrypt => "ENCRYPT",
                BranchTag::Locked => "LOCKED",
            });
        }
        words.join(" ")
    }
}

fn parse_location(path: &str) -> BranchLocation {
    if !path.starts_with('/') && !path.starts_with('~') && !path.starts_with('.') {
        if let Some((target, remote_path)) = path.split_once(':') {
            if !target.is_empty() && !target.contains('/') {
                let host = target.rsplit('@').next().unwrap_or(target).to_string();
                return BranchLocation::Remote {
                    target: target.to_string(),
                    host,
                    path: remote_path.to_string(),
                };
            }
        }
    }
    BranchLocation::Local(PathBuf::from(crate::config::expand_tilde(path)))
}

/// Replace anything outside `[A-Za-z0-9._-]` with `_`.
pub fn slugify(s: &str) -> String {
    let slug: String = s
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if slug.is_empty() {
        "root".into()
    } else {
        slug
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_form_with_tags_and_excludes() {
        let b = Branch::parse_line("/data/media ::IMMUTABLE ::COMPRESS ::EXCLUDE cache ::INTERVAL 30")
            .unwrap();
        assert_eq!(b.path, "/data/media");
        assert_eq!(b.name, "media");
        assert_eq!(b.mode, PackingMode::Sovereign);
        assert!(b.flags().compress);
        assert!(!b.flags().encrypt);
        assert_eq!(b.exclude, vec!["cache"]);
        assert_eq!(b.scan_interval_days, 30);
    }

    #[test]
    fn plain_line_is_shared() {
        let b = Branch::parse_line("/data/photos").unwrap();
        assert_eq!(b.mode, PackingMode::Shared);
        assert!(b.tags.is_empty());
        assert_eq!(b.location, BranchLocation::Local(PathBuf::from("/data/photos")));
    }

    #[test]
    fn unknown_tag_is_config_error() {
        let err = Branch::parse_line("/data ::SPARKLY").unwrap_err();
        assert!(matches!(err, FloeError::Config(_)));
    }

    #[test]
    fn remote_branch_mounts_under_base() {
        let b = Branch::parse_line("backup@nas:/volume1/photos ::LOCKED").unwrap();
        assert!(b.is_remote());
        assert_eq!(b.name, "photos");
        assert_eq!(
            b.local_root(Path::new("/mnt/floe")),
            PathBuf::from("/mnt/floe/nas_photos")
        );
        assert!(b.flags().locked);
    }

    #[test]
    fn locked_branch_rejects_actions() {
        let b = Branch::parse_line("/data/thesis ::LOCKED").unwrap();
        let err = b.check_permitted(BranchAction::Repack).unwrap_err();
        assert!(matches!(err, FloeError::PolicyViolation(_)));
        assert!(Branch::parse_line("/data/x")
            .unwrap()
            .check_permitted(BranchAction::Repack)
            .is_ok());
    }

    #[test]
    fn rich_input_uses_default_interval() {
        let input = BranchInput::Rich {
            path: "/data/docs".into(),
            mode: Some(PackingMode::Sovereign),
            tags: vec![BranchTag::Encrypt],
            exclude: vec![],
            scan_interval_days: None,
        };
        let b = Branch::from_input(&input, 190).unwrap();
        assert_eq!(b.scan_interval_days, 190);
        assert!(b.flags().sovereign && b.flags().encrypt);
        assert_eq!(b.describe_tags(), "SOVEREIGN ENCRYPT");
    }

    #[test]
    fn selector_matches_path_or_name() {
        let b = Branch::parse_line("/data/media").unwrap();
        assert!(b.matches("/data/media/"));
        assert!(b.matches("media"));
        assert!(!b.matches("/data"));
    }
}
