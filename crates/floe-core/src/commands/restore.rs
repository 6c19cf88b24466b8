//! Two-phase restore out of cold storage.
//!
//! The first call asks for a thaw and returns. Later calls pick up each bag
//! where it stopped, using the state recorded in `restores.json`, and carry
//! it through download and extraction once the object is readable.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

use blake2::digest::consts::U8;
use blake2::{Blake2b, Digest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use floe_storage::{RestoreRequest, RestoreStatus, RestoreTier};
use floe_types::{BagId, FloeError, Result, RunId};

use crate::container::{assemble_parts, extract_atom_stream, extract_bag, Selection, StagedPart};
use crate::filter::FilterSpec;
use crate::inventory::{BagRecord, Fragment, Inventory};
use crate::keys::bag_stem;
use crate::transfer::TransferCoordinator;

use super::util::ArchiveContext;

const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreStage {
    Frozen,
    ThawRequested,
    Thawing,
    Ready,
    Downloading,
    Downloaded,
    Decrypting,
    Decompressing,
    Extracting,
    Done,
    Failed,
}

impl RestoreStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestoreStage::Frozen => "frozen",
            RestoreStage::ThawRequested => "thaw-requested",
            RestoreStage::Thawing => "thawing",
            RestoreStage::Ready => "ready",
            RestoreStage::Downloading => "downloading",
            RestoreStage::Downloaded => "downloaded",
            RestoreStage::Decrypting => "decrypting",
            RestoreStage::Decompressing => "decompressing",
            RestoreStage::Extracting => "extracting",
            RestoreStage::Done => "done",
            RestoreStage::Failed => "failed",
        }
    }

    /// Still waiting on the object service.
    pub fn is_waiting(&self) -> bool {
        matches!(self, RestoreStage::ThawRequested | RestoreStage::Thawing)
    }
}

impl std::fmt::Display for RestoreStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of one bag towards one destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreJob {
    pub bag: BagId,
    pub key: String,
    pub dest: PathBuf,
    pub tier: RestoreTier,
    /// Manifest paths to extract; `None` restores the whole bag.
    #[serde(default)]
    pub files: Option<Vec<String>>,
    pub stage: RestoreStage,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default)]
    pub compressed: bool,
    #[serde(default)]
    pub fragment: Option<Fragment>,
    #[serde(default)]
    pub thaw_requested_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub restored_files: usize,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl RestoreJob {
    fn new(bag: &BagRecord, dest: &Path, tier: RestoreTier, files: Option<Vec<String>>) -> Self {
        Self {
            bag: bag.id,
            key: bag.remote_key.clone(),
            dest: dest.to_path_buf(),
            tier,
            files,
            stage: RestoreStage::Frozen,
            encrypted: bag.encrypted,
            compressed: bag.compressed,
            fragment: bag.fragment,
            thaw_requested_at: None,
            updated_at: Utc::now(),
            restored_files: 0,
            last_error: None,
        }
    }

    fn set(&mut self, stage: RestoreStage) {
        debug!(bag = %self.bag, from = %self.stage, to = %stage, "restore stage");
        self.stage = stage;
        self.updated_at = Utc::now();
    }

    /// Stages extraction records for this bag's filters, in order.
    pub fn extraction_stages(&self) -> Vec<RestoreStage> {
        let mut stages = Vec::with_capacity(3);
        if self.encrypted {
            stages.push(RestoreStage::Decrypting);
        }
        if self.compressed {
            stages.push(RestoreStage::Decompressing);
        }
        stages.push(RestoreStage::Extracting);
        stages
    }

    /// Hours left on a typical thaw for this tier, if one is under way.
    pub fn thaw_hours_left(&self, now: DateTime<Utc>) -> Option<i64> {
        let started = self.thaw_requested_at?;
        let elapsed = (now - started).num_hours();
        Some((i64::from(self.tier.typical_wait_hours()) - elapsed).max(0))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PartRecord {
    stem: String,
    index: u32,
    count: u32,
    path: PathBuf,
}

/// Parts of one oversized atom gathered for one destination.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct PartGroup {
    dest: PathBuf,
    #[serde(default)]
    files: Option<Vec<String>>,
    parts: Vec<PartRecord>,
}

/// Persistent restore state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreBook {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    jobs: BTreeMap<String, RestoreJob>,
    #[serde(default)]
    parts: BTreeMap<String, PartGroup>,
}

impl Default for RestoreBook {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            jobs: BTreeMap::new(),
            parts: BTreeMap::new(),
        }
    }
}

impl RestoreBook {
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read(path) {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write atomically beside the target.
    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = path
            .parent()
            .ok_or_else(|| FloeError::Config(format!("invalid state path {}", path.display())))?;
        std::fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&serde_json::to_vec_pretty(self)?)?;
        tmp.persist(path).map_err(|e| FloeError::Io(e.error))?;
        Ok(())
    }

    pub fn jobs(&self) -> impl Iterator<Item = &RestoreJob> {
        self.jobs.values()
    }

    /// Fragment parts still waiting for their siblings.
    pub fn pending_parts(&self) -> usize {
        self.parts.values().map(|g| g.parts.len()).sum()
    }
}

fn job_id(key: &str, dest: &Path) -> String {
    format!("{}@{}", bag_stem(key), dest.display())
}

/// Scratch directory for one destination, so restores of the same bag to
/// different places never share staged files.
fn dest_scratch(work_dir: &Path, dest: &Path) -> PathBuf {
    let digest = Blake2b::<U8>::digest(dest.to_string_lossy().as_bytes());
    work_dir.join(hex::encode(digest))
}

/// Union of two file selections. `None` stands for the whole bag.
fn merge_selection(a: Option<&[String]>, b: Option<&[String]>) -> Option<Vec<String>> {
    let (a, b) = (a?, b?);
    let mut all: Vec<String> = a.iter().chain(b).cloned().collect();
    all.sort();
    all.dedup();
    Some(all)
}

/// Whether extracting `have` already yields everything `want` asks for.
fn covers(have: Option<&[String]>, want: Option<&[String]>) -> bool {
    match (have, want) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(have), Some(want)) => want.iter().all(|w| Selection::Paths(have).matches(w)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreTarget {
    /// A file or directory path as listed in manifests.
    File(String),
    Bags(Vec<BagId>),
    /// Branch path or name.
    Branch(String),
    Tree,
}

#[derive(Debug, Clone)]
pub struct RestoreOptions {
    pub target: RestoreTarget,
    pub dest: PathBuf,
    pub tier: Option<RestoreTier>,
    /// How long thawed copies stay readable.
    pub days: Option<u32>,
    pub dry_run: bool,
}

#[derive(Debug, Clone)]
pub struct RestoreReport {
    pub run_id: RunId,
    pub dry_run: bool,
    pub dest: PathBuf,
    pub jobs: Vec<RestoreJob>,
}

impl RestoreReport {
    pub fn is_complete(&self) -> bool {
        !self.jobs.is_empty() && self.jobs.iter().all(|j| j.stage == RestoreStage::Done)
    }

    pub fn waiting(&self) -> usize {
        self.jobs.iter().filter(|j| j.stage.is_waiting()).count()
    }

    pub fn failed(&self) -> usize {
        self.jobs
            .iter()
            .filter(|j| j.stage == RestoreStage::Failed)
            .count()
    }
}

/// Bags to fetch for a target, each with an optional file selection.
pub fn resolve_targets(
    ctx: &ArchiveContext,
    inventory: &Inventory,
    target: &RestoreTarget,
) -> Result<Vec<(BagRecord, Option<Vec<String>>)>> {
    let mut picked: BTreeMap<BagId, Option<Vec<String>>> = BTreeMap::new();
    match target {
        RestoreTarget::Tree => {
            picked.extend(inventory.bags.keys().map(|id| (*id, None)));
        }
        RestoreTarget::Branch(selector) => {
            let key = match ctx.find_branch(selector) {
                Ok(b) => b.path.clone(),
                Err(_) => selector.trim_end_matches('/').to_string(),
            };
            picked.extend(
                inventory
                    .bags
                    .values()
                    .filter(|b| b.branch.trim_end_matches('/') == key.trim_end_matches('/'))
                    .map(|b| (b.id, None)),
            );
            if picked.is_empty() {
                return Err(FloeError::NotFound(format!("no bags recorded for branch '{selector}'")));
            }
        }
        RestoreTarget::Bags(ids) => {
            for id in ids {
                let bag = inventory
                    .bags
                    .get(id)
                    .ok_or_else(|| FloeError::NotFound(format!("{id} is not a live bag")))?;
                picked.insert(bag.id, None);
            }
        }
        RestoreTarget::File(path) => {
            let manifests = ctx.manifests();
            let mut found = manifests.locate(path)?;
            if found.is_empty() {
                for hit in manifests.search(path)? {
                    found.entry(hit.bag_stem).or_default().push(hit.path);
                }
            }
            if found.is_empty() {
                return Err(FloeError::NotFound(format!("no manifest lists '{path}'")));
            }
            let by_stem: BTreeMap<&str, BagId> = inventory
                .bags
                .values()
                .map(|b| (bag_stem(&b.remote_key), b.id))
                .collect();
            for (stem, files) in found {
                match by_stem.get(stem.as_str()) {
                    Some(id) => {
                        picked
                            .entry(*id)
                            .or_insert_with(|| Some(Vec::new()))
                            .get_or_insert_with(Vec::new)
                            .extend(files);
                    }
                    None => warn!(stem = %stem, "manifest names a bag the inventory no longer tracks"),
                }
            }
            if picked.is_empty() {
                return Err(FloeError::NotFound(format!("'{path}' is only listed in retired bags")));
            }
        }
    }

    // A fragment is useless without the rest of its run.
    let fragments: Vec<(BagId, Option<Vec<String>>)> = picked
        .iter()
        .filter_map(|(id, files)| inventory.bags.get(id).map(|b| (b, files)))
        .filter(|(b, _)| b.fragment.is_some())
        .flat_map(|(b, files)| {
            b.atoms
                .iter()
                .filter_map(|path| inventory.atom(&b.branch, path))
                .flat_map(|atom| atom.bags.iter().map(|id| (*id, files.clone())))
                .collect::<Vec<_>>()
        })
        .collect();
    for (id, files) in fragments {
        picked.entry(id).or_insert(files);
    }

    Ok(picked
        .into_iter()
        .filter_map(|(id, files)| inventory.bags.get(&id).map(|b| (b.clone(), files)))
        .collect())
}

/// Advance every bag of the target as far as it can go right now.
pub fn run(ctx: &ArchiveContext, opts: &RestoreOptions) -> Result<RestoreReport> {
    let run = RunId::generate();
    let inventory = ctx.inventory_store().load()?;
    let targets = resolve_targets(ctx, &inventory, &opts.target)?;
    let tier = match opts.tier {
        Some(t) => t,
        None => ctx.config.archive.default_tier()?,
    };
    let days = opts.days.unwrap_or(ctx.config.archive.restore_days);

    if opts.dry_run {
        let jobs = targets
            .iter()
            .map(|(bag, files)| RestoreJob::new(bag, &opts.dest, tier, files.clone()))
            .collect();
        info!("dry run: no thaw requested, nothing downloaded");
        return Ok(RestoreReport {
            run_id: run,
            dry_run: true,
            dest: opts.dest.clone(),
            jobs,
        });
    }

    let state_file = ctx.restore_state_file();
    let mut book = RestoreBook::load(&state_file)?;
    let tc = ctx.coordinator(ctx.ledger(run, false));
    let work_dir = ctx.paths.staging_dir.join("restore");
    let mut ids = Vec::with_capacity(targets.len());

    for (bag, files) in &targets {
        let id = job_id(&bag.remote_key, &opts.dest);
        let job = book
            .jobs
            .entry(id.clone())
            .or_insert_with(|| RestoreJob::new(bag, &opts.dest, tier, files.clone()));
        if !covers(job.files.as_deref(), files.as_deref()) {
            if job.stage == RestoreStage::Done {
                // Only the files not yet restored need another pass.
                *job = RestoreJob::new(bag, &opts.dest, tier, files.clone());
            } else {
                job.files = merge_selection(job.files.as_deref(), files.as_deref());
            }
        }
        if job.stage == RestoreStage::Failed {
            job.last_error = None;
            job.set(RestoreStage::Frozen);
        }
        ids.push(id);
    }
    book.save(&state_file)?;

    for id in &ids {
        tc.check_interrupted()?;
        let Some(mut job) = book.jobs.get(id).cloned() else {
            continue;
        };
        let result = advance(ctx, &tc, &mut job, &mut book, &state_file, days, &work_dir);
        if let Err(e) = result {
            if matches!(e, FloeError::Interrupted) {
                book.jobs.insert(id.clone(), job);
                book.save(&state_file)?;
                return Err(e);
            }
            warn!(bag = %job.bag, "restore failed: {e}");
            job.last_error = Some(e.to_string());
            job.set(RestoreStage::Failed);
        }
        book.jobs.insert(id.clone(), job);
        book.save(&state_file)?;
    }

    assemble_ready(ctx, &mut book, &opts.dest, &work_dir)?;
    book.save(&state_file)?;

    let jobs: Vec<RestoreJob> = ids.iter().filter_map(|id| book.jobs.get(id).cloned()).collect();
    let report = RestoreReport {
        run_id: run,
        dry_run: false,
        dest: opts.dest.clone(),
        jobs,
    };
    info!(
        bags = report.jobs.len(),
        waiting = report.waiting(),
        failed = report.failed(),
        complete = report.is_complete(),
        "restore pass finished"
    );
    Ok(report)
}

/// Drive one job through the state machine, persisting at each stage.
fn advance(
    ctx: &ArchiveContext,
    tc: &TransferCoordinator,
    job: &mut RestoreJob,
    book: &mut RestoreBook,
    state_file: &Path,
    days: u32,
    work_dir: &Path,
) -> Result<()> {
    let checkpoint = |book: &mut RestoreBook, job: &RestoreJob| -> Result<()> {
        book.jobs.insert(job_id(&job.key, &job.dest), job.clone());
        book.save(state_file)
    };
    let scratch = dest_scratch(work_dir, &job.dest);
    let download = scratch.join(format!("{}.tar", bag_stem(&job.key)));

    loop {
        match job.stage {
            RestoreStage::Frozen | RestoreStage::ThawRequested | RestoreStage::Thawing => {
                let head = tc
                    .head(&job.key)?
                    .ok_or_else(|| FloeError::NotFound(format!("{} is missing remotely", job.key)))?;
                if head.is_readable() {
                    job.set(RestoreStage::Ready);
                    continue;
                }
                match head.restore {
                    RestoreStatus::InProgress => {
                        job.set(RestoreStage::Thawing);
                        return Ok(());
                    }
                    RestoreStatus::Available { .. } => {
                        job.set(RestoreStage::Ready);
                    }
                    RestoreStatus::NotRequested => match tc.request_thaw(&job.key, days, job.tier)? {
                        RestoreRequest::AlreadyAvailable => job.set(RestoreStage::Ready),
                        RestoreRequest::Accepted | RestoreRequest::AlreadyInProgress => {
                            job.thaw_requested_at = Some(Utc::now());
                            job.set(RestoreStage::ThawRequested);
                            info!(
                                bag = %job.bag,
                                tier = %job.tier,
                                hours = job.tier.typical_wait_hours(),
                                "thaw requested"
                            );
                            return Ok(());
                        }
                    },
                }
            }
            RestoreStage::Ready | RestoreStage::Downloading => {
                job.set(RestoreStage::Downloading);
                checkpoint(book, job)?;
                tc.download(&job.key, &download)?;
                job.set(RestoreStage::Downloaded);
                checkpoint(book, job)?;
            }
            RestoreStage::Downloaded
            | RestoreStage::Decrypting
            | RestoreStage::Decompressing
            | RestoreStage::Extracting => {
                if !download.exists() {
                    // Staged copy lost; the thawed object is still readable.
                    job.set(RestoreStage::Ready);
                    continue;
                }
                if job.encrypted && ctx.key().is_none() {
                    return Err(FloeError::Config(format!(
                        "{} is encrypted but no passphrase is configured",
                        job.bag
                    )));
                }
                // Filters are undone while the bag streams through extraction.
                for stage in job.extraction_stages() {
                    job.set(stage);
                    checkpoint(book, job)?;
                }

                let selection = match &job.files {
                    Some(paths) => Selection::Paths(paths),
                    None => Selection::All,
                };
                std::fs::create_dir_all(&job.dest)?;
                let reader = BufReader::new(File::open(&download)?);
                let extracted = extract_bag(
                    reader,
                    &job.dest,
                    job.encrypted || job.compressed,
                    ctx.key(),
                    selection,
                    &scratch.join("parts"),
                )?;
                job.restored_files = extracted.files.len();
                for part in extracted.parts {
                    let group = book
                        .parts
                        .entry(format!("{}@{}", part.stem, job.dest.display()))
                        .or_insert_with(|| PartGroup {
                            dest: job.dest.clone(),
                            files: job.files.clone(),
                            parts: Vec::new(),
                        });
                    group.files = merge_selection(group.files.as_deref(), job.files.as_deref());
                    group.parts.retain(|p| p.index != part.index);
                    group.parts.push(PartRecord {
                        stem: part.stem,
                        index: part.index,
                        count: part.count,
                        path: part.path,
                    });
                }
                std::fs::remove_file(&download)?;
                job.set(RestoreStage::Done);
                return Ok(());
            }
            RestoreStage::Done | RestoreStage::Failed => return Ok(()),
        }
    }
}

/// Join and extract every oversized atom whose parts have all arrived.
fn assemble_ready(ctx: &ArchiveContext, book: &mut RestoreBook, dest: &Path, work_dir: &Path) -> Result<()> {
    let ready: Vec<String> = book
        .parts
        .iter()
        .filter(|(_, g)| g.dest == dest)
        .filter(|(_, g)| g.parts.first().is_some_and(|p| g.parts.len() == p.count as usize))
        .map(|(k, _)| k.clone())
        .collect();

    for key in ready {
        let Some(group) = book.parts.remove(&key) else {
            continue;
        };
        let parts: Vec<StagedPart> = group
            .parts
            .iter()
            .map(|p| StagedPart {
                stem: p.stem.clone(),
                index: p.index,
                count: p.count,
                path: p.path.clone(),
            })
            .collect();
        let stem_with_suffix = parts[0].stem.clone();
        let (stem, spec) = FilterSpec::parse_entry_name(&stem_with_suffix).ok_or_else(|| {
            FloeError::Consistency(format!("unrecognised fragment entry '{stem_with_suffix}'"))
        })?;

        let joined = dest_scratch(work_dir, dest).join(format!("{}.joined", stem.replace('/', "__")));
        assemble_parts(&parts, &joined)?;
        let selection = match &group.files {
            Some(paths) => Selection::Paths(paths),
            None => Selection::All,
        };
        let files = extract_atom_stream(
            BufReader::new(File::open(&joined)?),
            stem,
            spec,
            dest,
            ctx.key(),
            selection,
        )?;
        info!(atom = %stem, files = files.len(), "reassembled oversized atom");
        std::fs::remove_file(&joined)?;
        for part in &parts {
            let _ = std::fs::remove_file(&part.path);
        }
    }
    Ok(())
}

/// Recorded restore jobs, oldest first.
pub fn status(ctx: &ArchiveContext) -> Result<Vec<RestoreJob>> {
    let book = RestoreBook::load(&ctx.restore_state_file())?;
    let mut jobs: Vec<RestoreJob> = book.jobs().cloned().collect();
    jobs.sort_by_key(|j| j.updated_at);
    Ok(jobs)
}

/// Forget finished jobs. Returns how many were removed.
pub fn clear_finished(ctx: &ArchiveContext) -> Result<usize> {
    let path = ctx.restore_state_file();
    let mut book = RestoreBook::load(&path)?;
    let before = book.jobs.len();
    book.jobs.retain(|_, j| j.stage != RestoreStage::Done);
    let removed = before - book.jobs.len();
    if removed > 0 {
        book.save(&path)?;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn book_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("restores.json");
        let mut book = RestoreBook::default();
        book.jobs.insert(
            "a@/r".into(),
            RestoreJob {
                bag: BagId(3),
                key: "p/h_d_bag_00003_01020304.tar".into(),
                dest: "/r".into(),
                tier: RestoreTier::Bulk,
                files: Some(vec!["d/x".into()]),
                stage: RestoreStage::ThawRequested,
                encrypted: false,
                compressed: true,
                fragment: None,
                thaw_requested_at: Some(Utc::now()),
                updated_at: Utc::now(),
                restored_files: 0,
                last_error: None,
            },
        );
        book.save(&path).unwrap();
        let loaded = RestoreBook::load(&path).unwrap();
        assert_eq!(loaded, book);
        assert!(RestoreBook::load(&dir.path().join("absent.json"))
            .unwrap()
            .jobs
            .is_empty());
    }

    #[test]
    fn selections_merge_and_cover() {
        let a = vec!["p/a.jpg".to_string()];
        let b = vec!["p/b.jpg".to_string(), "p/a.jpg".to_string()];
        assert_eq!(
            merge_selection(Some(&a[..]), Some(&b[..])),
            Some(vec!["p/a.jpg".to_string(), "p/b.jpg".to_string()])
        );
        assert_eq!(merge_selection(None, Some(&a[..])), None);

        let dir = vec!["p".to_string()];
        assert!(covers(Some(&dir[..]), Some(&b[..])));
        assert!(covers(None, Some(&a[..])));
        assert!(!covers(Some(&a[..]), Some(&b[..])));
        assert!(!covers(Some(&a[..]), None));
    }

    #[test]
    fn extraction_stages_follow_filters() {
        let mut job = RestoreJob {
            bag: BagId(1),
            key: "k".into(),
            dest: "/r".into(),
            tier: RestoreTier::Standard,
            files: None,
            stage: RestoreStage::Downloaded,
            encrypted: true,
            compressed: true,
            fragment: None,
            thaw_requested_at: None,
            updated_at: Utc::now(),
            restored_files: 0,
            last_error: None,
        };
        assert_eq!(
            job.extraction_stages(),
            vec![
                RestoreStage::Decrypting,
                RestoreStage::Decompressing,
                RestoreStage::Extracting
            ]
        );
        job.encrypted = false;
        job.compressed = false;
        assert_eq!(job.extraction_stages(), vec![RestoreStage::Extracting]);
    }

    #[test]
    fn destinations_get_separate_scratch() {
        let work = Path::new("/w");
        assert_ne!(
            dest_scratch(work, Path::new("/r1")),
            dest_scratch(work, Path::new("/r2"))
        );
        assert_eq!(
            dest_scratch(work, Path::new("/r1")),
            dest_scratch(work, Path::new("/r1"))
        );
    }

    #[test]
    fn thaw_estimate_counts_down() {
        let now = Utc::now();
        let job = RestoreJob {
            bag: BagId(1),
            key: "k".into(),
            dest: "/r".into(),
            tier: RestoreTier::Standard,
            files: None,
            stage: RestoreStage::Thawing,
            encrypted: false,
            compressed: false,
            fragment: None,
            thaw_requested_at: Some(now - chrono::Duration::hours(5)),
            updated_at: now,
            restored_files: 0,
            last_error: None,
        };
        assert_eq!(job.thaw_hours_left(now), Some(7));
    }
}
