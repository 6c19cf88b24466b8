//! Atom discovery and fingerprinting.
//!
//! A branch is split into atoms, each atom's subtree is walked in a stable
//! order, and a Blake2b-256 digest over entry metadata (and, in content mode,
//! file bytes) is compared with the inventory to classify the atom.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::Read;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use ignore::gitignore::Gitignore;
use ignore::WalkBuilder;
use tracing::{debug, warn};

use floe_types::{FloeError, Result};

use crate::branch::{Branch, PackingMode};
use crate::config::FingerprintMode;
use crate::inventory::Inventory;

type Blake2b256 = Blake2b<U32>;

/// Name of the atom holding the loose files at a Shared branch root.
pub const ROOT_CLUSTER: &str = "__BRANCH_ROOT__";

const READ_BUF_SIZE: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomKind {
    /// An immediate subdirectory of a Shared branch.
    Directory,
    /// Regular files directly under a Shared branch root.
    LooseFiles,
    /// The whole of a Sovereign branch.
    WholeBranch,
}

/// A discovered atom and where its data lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtomSource {
    /// Inventory key of the owning branch.
    pub branch: String,
    /// Inventory key of the atom.
    pub logical_path: String,
    /// Path inside the bag, `<branch name>/<child>`.
    pub archive_name: String,
    /// Branch root on the local (or mounted) filesystem.
    pub branch_root: PathBuf,
    /// Directory walked for this atom.
    pub root: PathBuf,
    pub kind: AtomKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EntryKind {
    Dir,
    File,
    Symlink,
}

impl EntryKind {
    fn tag(self) -> &'static str {
        match self {
            EntryKind::Dir => "d",
            EntryKind::File => "f",
            EntryKind::Symlink => "l",
        }
    }
}

/// One filesystem entry under an atom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtomEntry {
    /// `/`-separated path relative to the atom root.
    pub rel: String,
    pub abs: PathBuf,
    pub kind: EntryKind,
    pub size: u64,
    pub mtime_ns: i64,
    pub mode: u32,
}

pub(crate) fn build_excludes(branch_root: &Path, patterns: &[String]) -> Result<Gitignore> {
    let mut builder = ignore::gitignore::GitignoreBuilder::new(branch_root);
    for pat in patterns {
        builder
            .add_line(None, pat)
            .map_err(|e| FloeError::Config(format!("invalid exclude pattern '{pat}': {e}")))?;
    }
    builder
        .build()
        .map_err(|e| FloeError::Config(format!("exclude matcher build failed: {e}")))
}

fn scan_error(path: &Path, reason: impl std::fmt::Display) -> FloeError {
    FloeError::Scan {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

fn mtime_ns(meta: &std::fs::Metadata) -> i64 {
    meta.mtime()
        .saturating_mul(1_000_000_000)
        .saturating_add(meta.mtime_nsec())
}

/// Split a branch into atoms. Fails only when the branch root itself cannot be read.
pub fn discover_atoms(branch: &Branch, root: &Path, excludes: &Gitignore) -> Result<Vec<AtomSource>> {
    let meta = std::fs::metadata(root).map_err(|e| scan_error(root, e))?;
    if !meta.is_dir() {
        return Err(scan_error(root, "branch root is not a directory"));
    }

    if branch.mode == PackingMode::Sovereign {
        return Ok(vec![AtomSource {
            branch: branch.path.clone(),
            logical_path: branch.path.clone(),
            archive_name: branch.name.clone(),
            branch_root: root.to_path_buf(),
            root: root.to_path_buf(),
            kind: AtomKind::WholeBranch,
        }]);
    }

    let mut dirs = BTreeSet::new();
    let mut has_loose = false;
    let rd = std::fs::read_dir(root).map_err(|e| scan_error(root, e))?;
    for entry in rd {
        let entry = entry.map_err(|e| scan_error(root, e))?;
        let ft = entry.file_type().map_err(|e| scan_error(&entry.path(), e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if excludes
            .matched_path_or_any_parents(Path::new(&name), ft.is_dir())
            .is_ignore()
        {
            continue;
        }
        if ft.is_dir() {
            dirs.insert(name);
        } else {
            has_loose = true;
        }
    }

    let base = branch.path.trim_end_matches('/');
    let mut atoms: Vec<AtomSource> = dirs
        .into_iter()
        .map(|name| AtomSource {
            branch: branch.path.clone(),
            logical_path: format!("{base}/{name}"),
            archive_name: format!("{}/{name}", branch.name),
            branch_root: root.to_path_buf(),
            root: root.join(&name),
            kind: AtomKind::Directory,
        })
        .collect();
    if has_loose {
        atoms.push(AtomSource {
            branch: branch.path.clone(),
            logical_path: format!("{base}/{ROOT_CLUSTER}"),
            archive_name: format!("{}/{ROOT_CLUSTER}", branch.name),
            branch_root: root.to_path_buf(),
            root: root.to_path_buf(),
            kind: AtomKind::LooseFiles,
        });
    }
    Ok(atoms)
}

/// Walk an atom in file-name order. Any unreadable entry is a scan error.
pub fn list_atom_entries(atom: &AtomSource, excludes: &Gitignore) -> Result<Vec<AtomEntry>> {
    let mut entries = Vec::new();

    if atom.kind == AtomKind::LooseFiles {
        let rd = std::fs::read_dir(&atom.root).map_err(|e| scan_error(&atom.root, e))?;
        let mut paths = Vec::new();
        for entry in rd {
            let entry = entry.map_err(|e| scan_error(&atom.root, e))?;
            paths.push(entry.path());
        }
        paths.sort();
        for path in paths {
            let meta = std::fs::symlink_metadata(&path).map_err(|e| scan_error(&path, e))?;
            if meta.is_dir() {
                continue;
            }
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if excludes
                .matched_path_or_any_parents(Path::new(&name), false)
                .is_ignore()
            {
                continue;
            }
            if let Some(e) = make_entry(name, path, &meta) {
                entries.push(e);
            }
        }
        return Ok(entries);
    }

    let mut walk = WalkBuilder::new(&atom.root);
    walk.follow_links(false);
    walk.hidden(false);
    walk.ignore(false);
    walk.git_global(false);
    walk.git_exclude(false);
    walk.git_ignore(false);
    walk.parents(false);
    walk.require_git(false);
    walk.sort_by_file_name(std::ffi::OsStr::cmp);

    let branch_root = atom.branch_root.clone();
    let atom_root = atom.root.clone();
    let matcher = excludes.clone();
    walk.filter_entry(move |entry| {
        let path = entry.path();
        if path == atom_root {
            return true;
        }
        let rel = path.strip_prefix(&branch_root).unwrap_or(path);
        let is_dir = entry.file_type().is_some_and(|ft| ft.is_dir());
        !matcher.matched_path_or_any_parents(rel, is_dir).is_ignore()
    });

    for result in walk.build() {
        let entry = result.map_err(|e| scan_error(&atom.root, e))?;
        let path = entry.path();
        if path == atom.root {
            continue;
        }
        let rel = path
            .strip_prefix(&atom.root)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned();
        let meta = std::fs::symlink_metadata(path).map_err(|e| scan_error(path, e))?;
        if let Some(e) = make_entry(rel, path.to_path_buf(), &meta) {
            entries.push(e);
        }
    }
    Ok(entries)
}

fn make_entry(rel: String, abs: PathBuf, meta: &std::fs::Metadata) -> Option<AtomEntry> {
    let ft = meta.file_type();
    let kind = if ft.is_symlink() {
        EntryKind::Symlink
    } else if ft.is_dir() {
        EntryKind::Dir
    } else if ft.is_file() {
        EntryKind::File
    } else {
        // sockets, fifos and devices are not archived
        debug!(path = %abs.display(), "skipping special file");
        return None;
    };
    Some(AtomEntry {
        rel,
        abs,
        kind,
        size: if kind == EntryKind::File { meta.len() } else { 0 },
        mtime_ns: mtime_ns(meta),
        mode: meta.mode(),
    })
}

/// Digest of an atom's entries. `Content` also hashes file bytes;
/// `Metadata` still opens every file so unreadable data is caught.
pub fn fingerprint(entries: &[AtomEntry], mode: FingerprintMode) -> Result<String> {
    let mut hasher = Blake2b256::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    for entry in entries {
        hasher.update(entry.rel.as_bytes());
        hasher.update([0u8]);
        hasher.update(entry.kind.tag().as_bytes());
        hasher.update([0u8]);
        hasher.update(entry.size.to_le_bytes());
        hasher.update(entry.mtime_ns.to_le_bytes());
        match entry.kind {
            EntryKind::File => {
                let mut file = File::open(&entry.abs).map_err(|e| scan_error(&entry.abs, e))?;
                if mode == FingerprintMode::Content {
                    loop {
                        let n = file.read(&mut buf).map_err(|e| scan_error(&entry.abs, e))?;
                        if n == 0 {
                            break;
                        }
                        hasher.update(&buf[..n]);
                    }
                }
            }
            EntryKind::Symlink => {
                let target =
                    std::fs::read_link(&entry.abs).map_err(|e| scan_error(&entry.abs, e))?;
                hasher.update(target.to_string_lossy().as_bytes());
            }
            EntryKind::Dir => {}
        }
        hasher.update([0u8]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    New,
    Dirty,
    Unchanged,
    /// The atom could not be read; its inventory record is left as is.
    Errored(String),
}

impl ScanOutcome {
    pub fn needs_packing(&self) -> bool {
        matches!(self, ScanOutcome::New | ScanOutcome::Dirty)
    }
}

#[derive(Debug, Clone)]
pub struct ScannedAtom {
    pub source: AtomSource,
    pub outcome: ScanOutcome,
    pub fingerprint: Option<String>,
    pub size: u64,
    pub file_count: u64,
    /// The entries the fingerprint was computed over; packed as-is.
    pub entries: Vec<AtomEntry>,
}

/// Result of scanning one branch.
#[derive(Debug, Clone, Default)]
pub struct BranchScan {
    pub atoms: Vec<ScannedAtom>,
    /// Atoms recorded in the inventory that no longer exist on disk.
    pub removed: Vec<String>,
}

impl BranchScan {
    pub fn count(&self, pred: impl Fn(&ScanOutcome) -> bool) -> usize {
        self.atoms.iter().filter(|a| pred(&a.outcome)).count()
    }

    pub fn errored(&self) -> impl Iterator<Item = &ScannedAtom> {
        self.atoms
            .iter()
            .filter(|a| matches!(a.outcome, ScanOutcome::Errored(_)))
    }
}

/// Classifies atoms against the inventory. Read-only.
#[derive(Debug, Clone)]
pub struct ChangeDetector {
    mode: FingerprintMode,
    global_excludes: Vec<String>,
}

impl ChangeDetector {
    pub fn new(mode: FingerprintMode, global_excludes: Vec<String>) -> Self {
        Self {
            mode,
            global_excludes,
        }
    }

    fn excludes_for(&self, branch: &Branch, root: &Path) -> Result<Gitignore> {
        let mut patterns = self.global_excludes.clone();
        patterns.extend(branch.exclude.iter().cloned());
        build_excludes(root, &patterns)
    }

    pub fn scan_branch(&self, branch: &Branch, root: &Path, inventory: &Inventory) -> Result<BranchScan> {
        let excludes = self.excludes_for(branch, root)?;
        let sources = discover_atoms(branch, root, &excludes)?;

        let mut seen = BTreeSet::new();
        let mut atoms = Vec::with_capacity(sources.len());
        for source in sources {
            seen.insert(source.logical_path.clone());
            atoms.push(self.scan_atom(source, &excludes, inventory));
        }

        let removed = inventory
            .branches
            .get(&branch.path)
            .map(|rec| {
                rec.atoms
                    .keys()
                    .filter(|k| !seen.contains(*k))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        Ok(BranchScan { atoms, removed })
    }

    fn scan_atom(&self, source: AtomSource, excludes: &Gitignore, inventory: &Inventory) -> ScannedAtom {
        let listed = list_atom_entries(&source, excludes);
        self.assess(source, listed, inventory)
    }

    /// Fingerprint a listed atom and compare it with the inventory. Entries
    /// that vanished since the listing make the atom errored.
    fn assess(
        &self,
        source: AtomSource,
        listed: Result<Vec<AtomEntry>>,
        inventory: &Inventory,
    ) -> ScannedAtom {
        let measured = listed.and_then(|entries| {
            let fp = fingerprint(&entries, self.mode)?;
            let size = entries.iter().map(|e| e.size).sum::<u64>();
            let files = entries.iter().filter(|e| e.kind != EntryKind::Dir).count() as u64;
            Ok((fp, size, files, entries))
        });

        match measured {
            Ok((fp, size, file_count, entries)) => {
                let outcome = match inventory.atom(&source.branch, &source.logical_path) {
                    None => ScanOutcome::New,
                    Some(rec) if rec.needs_upload() => ScanOutcome::New,
                    Some(rec) if rec.fingerprint == fp => ScanOutcome::Unchanged,
                    Some(_) => ScanOutcome::Dirty,
                };
                debug!(atom = %source.logical_path, ?outcome, size, "scanned atom");
                ScannedAtom {
                    source,
                    outcome,
                    fingerprint: Some(fp),
                    size,
                    file_count,
                    entries,
                }
            }
            Err(e) => {
                warn!(atom = %source.logical_path, "scan failed: {e}");
                ScannedAtom {
                    source,
                    outcome: ScanOutcome::Errored(e.to_string()),
                    fingerprint: None,
                    size: 0,
                    file_count: 0,
                    entries: Vec::new(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::AtomRecord;
    use std::os::unix::fs::PermissionsExt;

    fn tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("alpha/sub")).unwrap();
        std::fs::write(root.join("alpha/a.txt"), b"aaaa").unwrap();
        std::fs::write(root.join("alpha/sub/b.txt"), b"bb").unwrap();
        std::fs::create_dir_all(root.join("beta")).unwrap();
        std::fs::write(root.join("beta/c.bin"), vec![7u8; 100]).unwrap();
        std::fs::write(root.join("loose.txt"), b"loose").unwrap();
        dir
    }

    fn shared(root: &Path) -> Branch {
        Branch::new(&root.to_string_lossy(), PackingMode::Shared).unwrap()
    }

    #[test]
    fn shared_branch_splits_children_and_loose_cluster() {
        let dir = tree();
        let branch = shared(dir.path());
        let ex = build_excludes(dir.path(), &[]).unwrap();
        let atoms = discover_atoms(&branch, dir.path(), &ex).unwrap();
        let kinds: Vec<_> = atoms.iter().map(|a| a.kind).collect();
        assert_eq!(
            kinds,
            vec![AtomKind::Directory, AtomKind::Directory, AtomKind::LooseFiles]
        );
        assert!(atoms[0].logical_path.ends_with("/alpha"));
        assert!(atoms[2].logical_path.ends_with(ROOT_CLUSTER));
    }

    #[test]
    fn sovereign_branch_is_one_atom() {
        let dir = tree();
        let branch = Branch::new(&dir.path().to_string_lossy(), PackingMode::Sovereign).unwrap();
        let ex = build_excludes(dir.path(), &[]).unwrap();
        let atoms = discover_atoms(&branch, dir.path(), &ex).unwrap();
        assert_eq!(atoms.len(), 1);
        assert_eq!(atoms[0].logical_path, branch.path);
        let entries = list_atom_entries(&atoms[0], &ex).unwrap();
        assert!(entries.iter().any(|e| e.rel == "alpha/sub/b.txt"));
    }

    #[test]
    fn excludes_drop_children_and_nested_files() {
        let dir = tree();
        let mut branch = shared(dir.path());
        branch.exclude = vec!["beta".into(), "*.txt".into()];
        let detector = ChangeDetector::new(FingerprintMode::Content, vec![]);
        let scan = detector
            .scan_branch(&branch, dir.path(), &Inventory::default())
            .unwrap();
        let names: Vec<_> = scan.atoms.iter().map(|a| a.source.archive_name.clone()).collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].ends_with("/alpha"));
        // alpha holds only .txt files plus the sub dir
        assert_eq!(scan.atoms[0].size, 0);
    }

    #[test]
    fn fingerprint_tracks_content_changes() {
        let dir = tree();
        let branch = shared(dir.path());
        let detector = ChangeDetector::new(FingerprintMode::Content, vec![]);
        let first = detector
            .scan_branch(&branch, dir.path(), &Inventory::default())
            .unwrap();
        assert_eq!(first.count(|o| *o == ScanOutcome::New), 3);

        let mut inv = Inventory::default();
        let rec = inv.branches.entry(branch.path.clone()).or_default();
        for atom in &first.atoms {
            rec.atoms.insert(
                atom.source.logical_path.clone(),
                AtomRecord {
                    fingerprint: atom.fingerprint.clone().unwrap(),
                    size: atom.size,
                    file_count: atom.file_count,
                    bags: vec![floe_types::BagId(1)],
                    pinned: false,
                    last_upload: None,
                },
            );
        }
        let again = detector.scan_branch(&branch, dir.path(), &inv).unwrap();
        assert_eq!(again.count(|o| *o == ScanOutcome::Unchanged), 3);

        // Same length, same mtime is unlikely; content mode catches it anyway.
        std::fs::write(dir.path().join("alpha/a.txt"), b"zzzz").unwrap();
        let after = detector.scan_branch(&branch, dir.path(), &inv).unwrap();
        let alpha = after
            .atoms
            .iter()
            .find(|a| a.source.logical_path.ends_with("/alpha"))
            .unwrap();
        assert_eq!(alpha.outcome, ScanOutcome::Dirty);
        assert_eq!(after.count(|o| *o == ScanOutcome::Unchanged), 2);
    }

    #[test]
    fn removed_atoms_are_reported() {
        let dir = tree();
        let branch = shared(dir.path());
        let mut inv = Inventory::default();
        inv.branches
            .entry(branch.path.clone())
            .or_default()
            .atoms
            .insert(
                format!("{}/gone", branch.path),
                AtomRecord {
                    fingerprint: "x".into(),
                    size: 1,
                    file_count: 1,
                    bags: vec![],
                    pinned: false,
                    last_upload: None,
                },
            );
        let detector = ChangeDetector::new(FingerprintMode::Metadata, vec![]);
        let scan = detector.scan_branch(&branch, dir.path(), &inv).unwrap();
        assert_eq!(scan.removed, vec![format!("{}/gone", branch.path)]);
    }

    #[test]
    fn unreadable_file_marks_atom_errored() {
        if nix::unistd::geteuid().is_root() {
            // root reads everything
            return;
        }
        let dir = tree();
        let locked = dir.path().join("beta/c.bin");
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o000)).unwrap();
        let branch = shared(dir.path());
        let detector = ChangeDetector::new(FingerprintMode::Metadata, vec![]);
        let scan = detector
            .scan_branch(&branch, dir.path(), &Inventory::default())
            .unwrap();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o644)).unwrap();
        let errored: Vec<_> = scan.errored().collect();
        assert_eq!(errored.len(), 1);
        assert!(errored[0].source.logical_path.ends_with("/beta"));
        assert!(errored[0].fingerprint.is_none());
    }

    #[test]
    fn file_removed_after_listing_marks_atom_errored() {
        let dir = tree();
        let branch = shared(dir.path());
        let excludes = build_excludes(dir.path(), &[]).unwrap();
        let beta = discover_atoms(&branch, dir.path(), &excludes)
            .unwrap()
            .into_iter()
            .find(|a| a.logical_path.ends_with("/beta"))
            .unwrap();
        let listed = list_atom_entries(&beta, &excludes);
        assert_eq!(listed.as_ref().unwrap().len(), 1);
        std::fs::remove_file(dir.path().join("beta/c.bin")).unwrap();

        let detector = ChangeDetector::new(FingerprintMode::Metadata, vec![]);
        let scanned = detector.assess(beta, listed, &Inventory::default());
        assert!(matches!(scanned.outcome, ScanOutcome::Errored(_)));
        assert!(scanned.fingerprint.is_none());
        assert_eq!(scanned.size, 0);
    }

    #[test]
    fn missing_root_is_scan_error() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("nope");
        let branch = shared(&gone);
        let detector = ChangeDetector::new(FingerprintMode::Content, vec![]);
        let err = detector
            .scan_branch(&branch, &gone, &Inventory::default())
            .unwrap_err();
        assert!(matches!(err, FloeError::Scan { .. }));
    }
}
