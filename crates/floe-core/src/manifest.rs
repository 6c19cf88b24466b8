//! Per-bag file listings, kept locally and in the standard storage class so
//! they can be searched without a thaw.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use floe_types::{BagId, FloeError, Result};

use crate::keys::bag_stem;

const HEADER_MARK: &str = "# ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub bag: BagId,
    pub bag_key: String,
    pub branch: String,
    pub atoms: Vec<String>,
    pub created: DateTime<Utc>,
    pub fragment: Option<(u32, u32)>,
    pub files: Vec<String>,
}

impl Manifest {
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("{HEADER_MARK}bag: {}\n", self.bag));
        out.push_str(&format!("{HEADER_MARK}key: {}\n", self.bag_key));
        out.push_str(&format!("{HEADER_MARK}branch: {}\n", self.branch));
        out.push_str(&format!("{HEADER_MARK}created: {}\n", self.created.to_rfc3339()));
        if let Some((index, count)) = self.fragment {
            out.push_str(&format!("{HEADER_MARK}fragment: {} of {count}\n", index + 1));
        }
        for atom in &self.atoms {
            out.push_str(&format!("{HEADER_MARK}atom: {atom}\n"));
        }
        for file in &self.files {
            out.push_str(file);
            out.push('\n');
        }
        out
    }

    /// File paths from a rendered manifest, skipping header lines.
    pub fn file_lines(text: &str) -> impl Iterator<Item = &str> {
        text.lines()
            .filter(|l| !l.is_empty() && !l.starts_with(HEADER_MARK))
    }
}

/// Local manifest directory.
#[derive(Debug, Clone)]
pub struct ManifestDir {
    root: PathBuf,
}

/// A manifest line matching a search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestHit {
    pub bag: Option<BagId>,
    pub bag_stem: String,
    pub path: String,
}

impl ManifestDir {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn path_for(&self, bag_key: &str) -> PathBuf {
        self.root.join(format!("{}.txt", bag_stem(bag_key)))
    }

    pub fn write(&self, manifest: &Manifest) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.root)?;
        let path = self.path_for(&manifest.bag_key);
        let mut tmp = tempfile::NamedTempFile::new_in(&self.root)?;
        tmp.write_all(manifest.render().as_bytes())?;
        tmp.persist(&path).map_err(|e| FloeError::Io(e.error))?;
        Ok(path)
    }

    pub fn remove(&self, bag_key: &str) -> Result<()> {
        match std::fs::remove_file(self.path_for(bag_key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn read_files(&self, bag_key: &str) -> Result<Option<Vec<String>>> {
        match std::fs::read_to_string(self.path_for(bag_key)) {
            Ok(text) => Ok(Some(Manifest::file_lines(&text).map(str::to_string).collect())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn manifest_files(&self) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        let rd = match std::fs::read_dir(&self.root) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        for entry in rd {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "txt") {
                out.push(path);
            }
        }
        out.sort();
        Ok(out)
    }

    /// Case-insensitive substring search over every local manifest.
    pub fn search(&self, term: &str) -> Result<Vec<ManifestHit>> {
        let needle = term.to_lowercase();
        let mut hits = Vec::new();
        for path in self.manifest_files()? {
            let text = std::fs::read_to_string(&path)?;
            let stem = stem_of(&path);
            for line in Manifest::file_lines(&text) {
                if line.to_lowercase().contains(&needle) {
                    hits.push(ManifestHit {
                        bag: BagId::from_remote_key(&stem),
                        bag_stem: stem.clone(),
                        path: line.to_string(),
                    });
                }
            }
        }
        Ok(hits)
    }

    /// Exact path (or directory prefix) lookup, grouped by bag stem.
    pub fn locate(&self, wanted: &str) -> Result<BTreeMap<String, Vec<String>>> {
        let wanted = wanted.trim_end_matches('/');
        let mut found: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for path in self.manifest_files()? {
            let text = std::fs::read_to_string(&path)?;
            let stem = stem_of(&path);
            for line in Manifest::file_lines(&text) {
                let hit = line == wanted
                    || line
                        .strip_prefix(wanted)
                        .is_some_and(|rest| rest.starts_with('/'));
                if hit {
                    found.entry(stem.clone()).or_default().push(line.to_string());
                }
            }
        }
        Ok(found)
    }
}

fn stem_of(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}
