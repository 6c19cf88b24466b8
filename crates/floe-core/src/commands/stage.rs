//! Shared by mirror and repack: turn planned bins into staged bag files,
//! upload them, publish their manifests and record the result.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::debug;

use floe_storage::StorageClass;
use floe_types::{BagId, FloeError, Result, RunId};

use crate::branch::Branch;
use crate::container::{manifest_lines, write_bag, write_fragments, AtomStream, PackedAtom};
use crate::filter::FilterSpec;
use crate::inventory::{AtomRecord, BagRecord, Inventory};
use crate::keys::{bag_stem, manifest_key_for, KeyLayout};
use crate::manifest::Manifest;
use crate::mount::MountGuard;
use crate::packer::{fragment_bins, PlannedBin};
use crate::scan::{BranchScan, ChangeDetector, ScannedAtom};
use crate::transfer::{TransferCoordinator, UploadJob, UploadOutcome};

use super::util::ArchiveContext;

/// A bag ready for upload. `path` is `None` in dry runs, where nothing is
/// written and `size` is the planned payload.
#[derive(Debug, Clone)]
pub(crate) struct StagedBag {
    pub id: BagId,
    pub key: String,
    pub manifest_key: String,
    pub bin: PlannedBin,
    pub path: Option<PathBuf>,
    pub size: u64,
    pub files: Vec<String>,
}

pub(crate) fn detector(ctx: &ArchiveContext) -> ChangeDetector {
    ChangeDetector::new(
        ctx.config.archive.fingerprint,
        ctx.config.exclude_patterns.clone(),
    )
}

/// Mount (when remote) and scan a branch. The guard must outlive staging,
/// since scanned entries point into the mount.
pub(crate) fn scan_mounted<'a>(
    ctx: &'a ArchiveContext,
    branch: &Branch,
    inventory: &Inventory,
) -> Result<(MountGuard<'a>, BranchScan)> {
    let guard = MountGuard::acquire(ctx.mounter.as_ref(), branch, &ctx.paths.mount_base)?;
    let scan = detector(ctx).scan_branch(branch, guard.root(), inventory)?;
    Ok((guard, scan))
}

/// Allocate ids for the bins, one contiguous block per fragment run.
pub(crate) fn assign_ids(inventory: &mut Inventory, bins: &[PlannedBin], recycle: bool) -> Result<Vec<BagId>> {
    let mut ids = Vec::with_capacity(bins.len());
    let mut i = 0;
    while i < bins.len() {
        let n = run_len(bins, i)?;
        ids.extend(inventory.allocate_ids(n as u32, recycle));
        i += n;
    }
    Ok(ids)
}

/// Length of the run starting at `i`: the fragment count, or 1.
fn run_len(bins: &[PlannedBin], i: usize) -> Result<usize> {
    let bin = &bins[i];
    let Some(frag) = bin.fragment else {
        return Ok(1);
    };
    let n = frag.count as usize;
    let complete = frag.index == 0
        && i + n <= bins.len()
        && bins[i..i + n]
            .iter()
            .enumerate()
            .all(|(k, b)| b.atoms == bin.atoms && b.fragment.map(|f| f.index as usize) == Some(k));
    if !complete {
        return Err(FloeError::Consistency(format!(
            "fragment run for {} is not contiguous in the plan",
            bin.atoms.first().map(String::as_str).unwrap_or("?")
        )));
    }
    Ok(n)
}

fn scanned<'a>(atoms: &BTreeMap<String, &'a ScannedAtom>, path: &str) -> Result<&'a ScannedAtom> {
    atoms
        .get(path)
        .copied()
        .ok_or_else(|| FloeError::Consistency(format!("atom {path} was planned but not scanned")))
}

fn packed(atom: &ScannedAtom) -> PackedAtom<'_> {
    PackedAtom {
        source: &atom.source,
        entries: &atom.entries,
    }
}

/// Build the container stream of every oversized atom in `bins` and re-cut
/// its run to the number of bags that stream really needs. Raw sizes
/// understate it: tar headers and padding, or incompressible data, can push
/// a run past the planned count.
pub(crate) fn settle_fragments(
    ctx: &ArchiveContext,
    branch: &Branch,
    bins: &[PlannedBin],
    atoms: &BTreeMap<String, &ScannedAtom>,
    capacity: u64,
    scratch: &Path,
) -> Result<(Vec<PlannedBin>, BTreeMap<String, AtomStream>)> {
    let spec = ctx.filter_spec(branch);
    let mut settled = Vec::with_capacity(bins.len());
    let mut streams = BTreeMap::new();
    let mut i = 0;

    while i < bins.len() {
        let n = run_len(bins, i)?;
        let first = &bins[i];
        if first.fragment.is_none() {
            settled.push(first.clone());
            i += 1;
            continue;
        }
        let path = &first.atoms[0];
        let atom = scanned(atoms, path)?;
        let stream = AtomStream::build(packed(atom), spec, ctx.key(), scratch)?;
        let count = stream.part_count(capacity);
        if count as usize != n {
            debug!(atom = %path, planned = n, count, "fragment run resized to its stream");
        }
        settled.extend(fragment_bins(&first.branch, path, atom.size, count));
        streams.insert(path.clone(), stream);
        i += n;
    }
    Ok((settled, streams))
}

/// Write the bag files for `bins` under `scratch`, or only describe them
/// when `scratch` is `None`. Fragment runs are cut from `streams`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn stage_bins(
    ctx: &ArchiveContext,
    tc: &TransferCoordinator,
    layout: &KeyLayout,
    run: RunId,
    branch: &Branch,
    bins: &[PlannedBin],
    ids: &[BagId],
    atoms: &BTreeMap<String, &ScannedAtom>,
    streams: &mut BTreeMap<String, AtomStream>,
    capacity: u64,
    scratch: Option<&Path>,
) -> Result<Vec<StagedBag>> {
    let spec = ctx.filter_spec(branch);
    let mut staged = Vec::with_capacity(bins.len());
    let mut i = 0;

    while i < bins.len() {
        tc.check_interrupted()?;
        let n = run_len(bins, i)?;
        let run_bins = &bins[i..i + n];
        let run_ids = &ids[i..i + n];
        let keys: Vec<String> = run_ids
            .iter()
            .map(|id| layout.bag_key(branch, *id, run))
            .collect();

        let built: Vec<(Option<PathBuf>, u64, Vec<String>)> = if run_bins[0].fragment.is_some() {
            let path = &run_bins[0].atoms[0];
            let atom = scanned(atoms, path)?;
            match scratch {
                Some(dir) => {
                    let mut stream = streams.remove(path).ok_or_else(|| {
                        FloeError::Consistency(format!("no staged stream for oversized atom {path}"))
                    })?;
                    let outs: Vec<PathBuf> = keys
                        .iter()
                        .map(|k| dir.join(format!("{}.tar", bag_stem(k))))
                        .collect();
                    write_fragments(&outs, &mut stream, capacity)?
                        .into_iter()
                        .map(|b| (Some(b.path), b.size, b.manifest))
                        .collect()
                }
                None => {
                    let files = manifest_lines(packed(atom));
                    run_bins
                        .iter()
                        .map(|b| (None, b.payload, files.clone()))
                        .collect()
                }
            }
        } else {
            let bin = &run_bins[0];
            let members: Vec<&ScannedAtom> = bin
                .atoms
                .iter()
                .map(|p| scanned(atoms, p))
                .collect::<Result<_>>()?;
            match scratch {
                Some(dir) => {
                    let out = dir.join(format!("{}.tar", bag_stem(&keys[0])));
                    let list: Vec<PackedAtom<'_>> = members.iter().map(|a| packed(a)).collect();
                    let b = write_bag(&out, &list, spec, ctx.key(), dir)?;
                    vec![(Some(b.path), b.size, b.manifest)]
                }
                None => {
                    let files = members.iter().flat_map(|a| manifest_lines(packed(a))).collect();
                    vec![(None, bin.payload, files)]
                }
            }
        };

        for (((bin, id), key), (path, size, files)) in
            run_bins.iter().zip(run_ids).zip(keys).zip(built)
        {
            debug!(bag = %id, key = %key, size, "staged");
            staged.push(StagedBag {
                id: *id,
                manifest_key: manifest_key_for(&key),
                key,
                bin: bin.clone(),
                path,
                size,
                files,
            });
        }
        i += n;
    }
    Ok(staged)
}

pub(crate) fn upload_staged(
    tc: &TransferCoordinator,
    staged: &[StagedBag],
    class: &StorageClass,
) -> Result<Vec<UploadOutcome>> {
    let jobs: Vec<UploadJob> = staged
        .iter()
        .map(|s| UploadJob {
            bag: s.id,
            key: s.key.clone(),
            path: s.path.clone().unwrap_or_default(),
            size: s.size,
            class: class.clone(),
        })
        .collect();
    tc.upload_all(&jobs)
}

/// Upload each bag's manifest in the standard class and keep a local copy.
pub(crate) fn publish_manifests(
    ctx: &ArchiveContext,
    tc: &TransferCoordinator,
    branch: &Branch,
    staged: &[StagedBag],
    now: DateTime<Utc>,
) -> Result<()> {
    let dir = ctx.manifests();
    for s in staged {
        let manifest = Manifest {
            bag: s.id,
            bag_key: s.key.clone(),
            branch: branch.path.clone(),
            atoms: s.bin.atoms.clone(),
            created: now,
            fragment: s.bin.fragment.map(|f| (f.index, f.count)),
            files: s.files.clone(),
        };
        tc.put_small(&s.manifest_key, manifest.render().as_bytes(), &StorageClass::Standard)?;
        if !tc.is_dry_run() {
            dir.write(&manifest)?;
        }
    }
    Ok(())
}

/// Record uploaded bags and point their atoms at them.
#[allow(clippy::too_many_arguments)]
pub(crate) fn record_uploads(
    inventory: &mut Inventory,
    branch: &Branch,
    spec: FilterSpec,
    capacity: u64,
    class: &StorageClass,
    staged: &[StagedBag],
    outcomes: &[UploadOutcome],
    atoms: &BTreeMap<String, &ScannedAtom>,
    now: DateTime<Utc>,
) -> Result<()> {
    let mut placed: BTreeMap<&str, Vec<BagId>> = BTreeMap::new();
    for (s, o) in staged.iter().zip(outcomes) {
        inventory.bags.insert(
            s.id,
            BagRecord {
                id: s.id,
                branch: branch.path.clone(),
                remote_key: s.key.clone(),
                manifest_key: s.manifest_key.clone(),
                size: o.size,
                payload_size: s.bin.payload,
                capacity,
                etag: o.etag.clone().unwrap_or_default(),
                uploaded_at: now,
                storage_class: class.clone(),
                atoms: s.bin.atoms.clone(),
                fragment: s.bin.fragment,
                compressed: spec.compression.is_some(),
                encrypted: spec.encrypt,
            },
        );
        for path in &s.bin.atoms {
            placed.entry(path.as_str()).or_default().push(s.id);
        }
    }

    let record = inventory.branches.entry(branch.path.clone()).or_default();
    for (path, bags) in placed {
        let atom = scanned(atoms, path)?;
        let fingerprint = atom.fingerprint.clone().ok_or_else(|| {
            FloeError::Consistency(format!("atom {path} has no fingerprint"))
        })?;
        let entry = record
            .atoms
            .entry(path.to_string())
            .or_insert_with(|| AtomRecord {
                fingerprint: String::new(),
                size: 0,
                file_count: 0,
                bags: Vec::new(),
                pinned: false,
                last_upload: None,
            });
        entry.fingerprint = fingerprint;
        entry.size = atom.size;
        entry.file_count = atom.file_count;
        entry.bags = bags;
        entry.last_upload = Some(now);
    }
    Ok(())
}

/// Outcome of building and shipping one branch's bins.
#[derive(Debug, Clone, Default)]
pub(crate) struct Shipped {
    pub bags: usize,
    pub bytes: u64,
}

/// Stage, upload, publish manifests and record, for bins that need uploading.
#[allow(clippy::too_many_arguments)]
pub(crate) fn ship(
    ctx: &ArchiveContext,
    tc: &TransferCoordinator,
    layout: &KeyLayout,
    run: RunId,
    branch: &Branch,
    work: &mut Inventory,
    bins: &[PlannedBin],
    recycle: bool,
    atoms: &BTreeMap<String, &ScannedAtom>,
    scratch: Option<&Path>,
    now: DateTime<Utc>,
) -> Result<Shipped> {
    if bins.is_empty() {
        return Ok(Shipped::default());
    }
    let class = ctx.config.remote.bag_storage_class.clone();
    let capacity = ctx.config.archive.bag_capacity()?;
    // Dry runs build nothing and keep the planned counts.
    let (bins, mut streams) = match scratch {
        Some(dir) => settle_fragments(ctx, branch, bins, atoms, capacity, dir)?,
        None => (bins.to_vec(), BTreeMap::new()),
    };
    let ids = assign_ids(work, &bins, recycle)?;
    let staged = stage_bins(
        ctx,
        tc,
        layout,
        run,
        branch,
        &bins,
        &ids,
        atoms,
        &mut streams,
        capacity,
        scratch,
    )?;
    let outcomes = upload_staged(tc, &staged, &class)?;
    publish_manifests(ctx, tc, branch, &staged, now)?;
    record_uploads(
        work,
        branch,
        ctx.filter_spec(branch),
        capacity,
        &class,
        &staged,
        &outcomes,
        atoms,
        now,
    )?;

    // Per-bag staging files are no longer needed once uploaded.
    for s in &staged {
        if let Some(path) = &s.path {
            let _ = std::fs::remove_file(path);
        }
    }
    Ok(Shipped {
        bags: outcomes.len(),
        bytes: outcomes.iter().map(|o| o.size).sum(),
    })
}
