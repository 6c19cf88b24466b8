//! Bag container layout.
//!
//! A bag is a plain tar. Plain atoms contribute their files directly under
//! `<branch>/<atom>/...`. Filtered atoms contribute a single entry
//! `<branch>/<atom>.tar[.gz|.zst][.enc]` holding their own inner tar.
//! An oversized atom's container stream is cut into parts sized so that each
//! bag of its run, tar framing included, stays within the bag capacity. Each
//! part is one `...part-NNNN-of-MMMM` entry.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

use tar::{Builder, EntryType, Header};
use tracing::debug;

use floe_types::{FloeError, Result};

use crate::filter::{lift_io_error, FilterReader, FilterSpec, FilterWriter, PassphraseKey};
use crate::scan::{AtomEntry, AtomKind, AtomSource, EntryKind, ROOT_CLUSTER};

const PART_MARKER: &str = ".part-";
const BLOCK: u64 = 512;

/// An atom ready to be written, with the entries it was fingerprinted from.
#[derive(Debug, Clone, Copy)]
pub struct PackedAtom<'a> {
    pub source: &'a AtomSource,
    pub entries: &'a [AtomEntry],
}

/// Where an atom's files land relative to the restore destination.
pub fn extract_base(source: &AtomSource) -> String {
    match source.kind {
        AtomKind::LooseFiles => base_for_stem(&source.archive_name).to_string(),
        _ => source.archive_name.clone(),
    }
}

fn base_for_stem(stem: &str) -> &str {
    stem.strip_suffix(ROOT_CLUSTER)
        .map(|s| s.trim_end_matches('/'))
        .unwrap_or(stem)
}

fn join_name(base: &str, rel: &str) -> String {
    if base.is_empty() {
        rel.to_string()
    } else {
        format!("{base}/{rel}")
    }
}

/// Paths a restore would produce for this atom, as listed in manifests.
pub fn manifest_lines(atom: PackedAtom<'_>) -> Vec<String> {
    let base = extract_base(atom.source);
    atom.entries
        .iter()
        .filter(|e| e.kind != EntryKind::Dir)
        .map(|e| join_name(&base, &e.rel))
        .collect()
}

pub fn fragment_entry_name(name: &str, index: u32, count: u32) -> String {
    format!("{name}{PART_MARKER}{:04}-of-{:04}", index + 1, count)
}

/// Split `stem.part-NNNN-of-MMMM` into `(stem, zero-based index, count)`.
pub fn parse_fragment_name(name: &str) -> Option<(&str, u32, u32)> {
    let pos = name.rfind(PART_MARKER)?;
    let (stem, tail) = name.split_at(pos);
    let tail = &tail[PART_MARKER.len()..];
    let (idx, count) = tail.split_once("-of-")?;
    let idx: u32 = idx.parse().ok()?;
    let count: u32 = count.parse().ok()?;
    if idx == 0 || idx > count {
        return None;
    }
    Some((stem, idx - 1, count))
}

fn entry_header(entry: &AtomEntry) -> Header {
    let mut header = Header::new_gnu();
    header.set_mtime((entry.mtime_ns.max(0) / 1_000_000_000) as u64);
    header.set_mode(entry.mode & 0o7777);
    header.set_uid(0);
    header.set_gid(0);
    header
}

fn scan_err(path: &Path, e: impl std::fmt::Display) -> FloeError {
    FloeError::Scan {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}

/// Append an atom's entries as loose tar members under `base`.
fn append_entries<W: Write>(builder: &mut Builder<W>, base: &str, entries: &[AtomEntry]) -> Result<()> {
    for entry in entries {
        let name = join_name(base, &entry.rel);
        let mut header = entry_header(entry);
        match entry.kind {
            EntryKind::Dir => {
                header.set_entry_type(EntryType::Directory);
                header.set_size(0);
                builder.append_data(&mut header, &name, io::empty())?;
            }
            EntryKind::File => {
                let file = File::open(&entry.abs).map_err(|e| scan_err(&entry.abs, e))?;
                let len = file.metadata().map_err(|e| scan_err(&entry.abs, e))?.len();
                if len != entry.size {
                    return Err(scan_err(&entry.abs, "file changed size while archiving"));
                }
                header.set_entry_type(EntryType::Regular);
                header.set_size(len);
                builder.append_data(&mut header, &name, file)?;
            }
            EntryKind::Symlink => {
                let target = std::fs::read_link(&entry.abs).map_err(|e| scan_err(&entry.abs, e))?;
                header.set_entry_type(EntryType::Symlink);
                header.set_size(0);
                builder.append_link(&mut header, &name, &target)?;
            }
        }
    }
    Ok(())
}

/// Write one atom as an inner tar through the filter pipeline.
fn write_filtered_stream<W: Write>(
    out: W,
    atom: PackedAtom<'_>,
    spec: FilterSpec,
    key: Option<&PassphraseKey>,
) -> Result<W> {
    let filtered = FilterWriter::new(out, spec, key)?;
    let mut inner = Builder::new(filtered);
    append_entries(&mut inner, "", atom.entries)?;
    inner.finish()?;
    let filtered = inner.into_inner()?;
    filtered.finish()
}

fn unbuffer(w: BufWriter<File>) -> Result<File> {
    w.into_inner().map_err(|e| FloeError::Io(e.into_error()))
}

/// A bag written to staging.
#[derive(Debug, Clone)]
pub struct BuiltBag {
    pub path: PathBuf,
    pub size: u64,
    pub manifest: Vec<String>,
}

/// Write a bag holding whole atoms.
pub fn write_bag(
    out: &Path,
    atoms: &[PackedAtom<'_>],
    spec: FilterSpec,
    key: Option<&PassphraseKey>,
    scratch: &Path,
) -> Result<BuiltBag> {
    let file = File::create(out)?;
    let mut builder = Builder::new(BufWriter::new(file));
    let mut manifest = Vec::new();

    for atom in atoms {
        manifest.extend(manifest_lines(*atom));
        if spec.is_plain() {
            append_entries(&mut builder, &extract_base(atom.source), atom.entries)?;
            continue;
        }
        let buffered = BufWriter::new(tempfile::tempfile_in(scratch)?);
        let mut tmp = unbuffer(write_filtered_stream(buffered, *atom, spec, key)?)?;
        let len = tmp.stream_position()?;
        tmp.seek(SeekFrom::Start(0))?;
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(len);
        header.set_mode(0o600);
        header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
        let name = format!("{}{}", atom.source.archive_name, spec.entry_suffix());
        builder.append_data(&mut header, &name, tmp)?;
    }

    builder.finish()?;
    let mut writer = builder.into_inner()?;
    writer.flush()?;
    let size = std::fs::metadata(out)?.len();
    debug!(path = %out.display(), size, "bag written");
    Ok(BuiltBag {
        path: out.to_path_buf(),
        size,
        manifest,
    })
}

/// Tar framing around a single member named `entry_name`: its header, a GNU
/// long-name record when the name overflows the header, and the two zero
/// blocks closing the archive.
fn single_entry_framing(entry_name: &str) -> u64 {
    let long_name = if entry_name.len() >= 100 {
        BLOCK + (entry_name.len() as u64 + 1).div_ceil(BLOCK) * BLOCK
    } else {
        0
    };
    BLOCK + long_name + 2 * BLOCK
}

/// Stream bytes one fragment may carry so that its bag is at most
/// `capacity` bytes. Never less than one block, so tiny capacities still
/// make progress.
pub fn fragment_part_len(name: &str, capacity: u64) -> u64 {
    let widest = fragment_entry_name(name, u32::MAX - 1, u32::MAX);
    let room = capacity.saturating_sub(single_entry_framing(&widest));
    (room / BLOCK * BLOCK).max(BLOCK)
}

/// An oversized atom's container stream, staged once and later cut into
/// fragment bags.
#[derive(Debug)]
pub struct AtomStream {
    file: File,
    len: u64,
    name: String,
    manifest: Vec<String>,
}

impl AtomStream {
    pub fn build(
        atom: PackedAtom<'_>,
        spec: FilterSpec,
        key: Option<&PassphraseKey>,
        scratch: &Path,
    ) -> Result<Self> {
        let stream = BufWriter::new(tempfile::tempfile_in(scratch)?);
        let mut file = unbuffer(if spec.is_plain() {
            let mut b = Builder::new(stream);
            append_entries(&mut b, "", atom.entries)?;
            b.finish()?;
            b.into_inner()?
        } else {
            write_filtered_stream(stream, atom, spec, key)?
        })?;
        let len = file.stream_position()?;
        Ok(Self {
            file,
            len,
            name: format!("{}{}", atom.source.archive_name, spec.entry_suffix()),
            manifest: manifest_lines(atom),
        })
    }

    pub fn stream_len(&self) -> u64 {
        self.len
    }

    /// Bags the run needs so that none exceeds `capacity`.
    pub fn part_count(&self, capacity: u64) -> u32 {
        let parts = self.len.div_ceil(fragment_part_len(&self.name, capacity)).max(1);
        u32::try_from(parts).unwrap_or(u32::MAX)
    }
}

/// Write the run of bags for one oversized atom. `outs` has one path per
/// bag and must match [`AtomStream::part_count`] for `capacity`.
pub fn write_fragments(outs: &[PathBuf], stream: &mut AtomStream, capacity: u64) -> Result<Vec<BuiltBag>> {
    let count = stream.part_count(capacity);
    if outs.len() != count as usize {
        return Err(FloeError::Consistency(format!(
            "{} needs {count} fragment bags, {} were allocated",
            stream.name,
            outs.len()
        )));
    }

    let part_len = fragment_part_len(&stream.name, capacity);
    let total = stream.len;
    let mut built = Vec::with_capacity(outs.len());

    for (index, out) in outs.iter().enumerate() {
        let start = part_len * index as u64;
        let len = part_len.min(total.saturating_sub(start));
        stream.file.seek(SeekFrom::Start(start.min(total)))?;
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(len);
        header.set_mode(0o600);
        header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);

        let mut builder = Builder::new(BufWriter::new(File::create(out)?));
        builder.append_data(
            &mut header,
            fragment_entry_name(&stream.name, index as u32, count),
            (&mut stream.file).take(len),
        )?;
        builder.finish()?;
        builder.into_inner()?.flush()?;

        built.push(BuiltBag {
            path: out.clone(),
            size: std::fs::metadata(out)?.len(),
            manifest: stream.manifest.clone(),
        });
    }
    Ok(built)
}

/// Which files to restore, by manifest path. A directory path selects everything under it.
#[derive(Debug, Clone, Copy)]
pub enum Selection<'a> {
    All,
    Paths(&'a [String]),
}

impl Selection<'_> {
    pub fn matches(&self, path: &str) -> bool {
        match self {
            Selection::All => true,
            Selection::Paths(paths) => paths.iter().any(|sel| {
                let sel = sel.trim_end_matches('/');
                path == sel
                    || path
                        .strip_prefix(sel)
                        .is_some_and(|rest| rest.starts_with('/'))
            }),
        }
    }
}

/// Part of an oversized atom staged during extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedPart {
    /// Entry name without the part suffix.
    pub stem: String,
    pub index: u32,
    pub count: u32,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct Extracted {
    pub files: Vec<PathBuf>,
    pub parts: Vec<StagedPart>,
}

fn safe_relative(name: &str) -> Result<PathBuf> {
    let p = Path::new(name);
    if p.components().all(|c| matches!(c, Component::Normal(_))) {
        Ok(p.to_path_buf())
    } else {
        Err(FloeError::Consistency(format!(
            "refusing unsafe archive path '{name}'"
        )))
    }
}

fn filter_io_error(e: io::Error) -> FloeError {
    match lift_io_error(e) {
        FloeError::Io(e)
            if matches!(
                e.kind(),
                io::ErrorKind::InvalidData
                    | io::ErrorKind::InvalidInput
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::Other
            ) =>
        {
            FloeError::Decompression(e.to_string())
        }
        other => other,
    }
}

/// Extract a downloaded bag into `dest`. Fragment entries are copied to
/// `part_dir` for later assembly instead of being extracted.
pub fn extract_bag<R: Read>(
    reader: R,
    dest: &Path,
    filtered: bool,
    key: Option<&PassphraseKey>,
    selection: Selection<'_>,
    part_dir: &Path,
) -> Result<Extracted> {
    let mut archive = tar::Archive::new(reader);
    let mut out = Extracted::default();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();

        let fragment = parse_fragment_name(&name)
            .filter(|(stem, _, _)| FilterSpec::parse_entry_name(stem).is_some());
        if let Some((stem, index, count)) = fragment {
            std::fs::create_dir_all(part_dir)?;
            let file_name = format!("{}.{:04}", stem.replace('/', "__"), index);
            let path = part_dir.join(file_name);
            let mut f = File::create(&path)?;
            io::copy(&mut entry, &mut f)?;
            out.parts.push(StagedPart {
                stem: stem.to_string(),
                index,
                count,
                path,
            });
            continue;
        }

        if filtered {
            let Some((stem, spec)) = FilterSpec::parse_entry_name(&name) else {
                return Err(FloeError::Consistency(format!(
                    "unexpected entry '{name}' in filtered bag"
                )));
            };
            let stem = stem.to_string();
            let files = extract_atom_stream(&mut entry, &stem, spec, dest, key, selection)?;
            out.files.extend(files);
            continue;
        }

        if !selection.matches(&name) {
            continue;
        }
        safe_relative(name.trim_end_matches('/'))?;
        if entry.unpack_in(dest)? && entry.header().entry_type().is_file() {
            out.files.push(dest.join(&name));
        }
    }
    Ok(out)
}

/// Extract one atom's container stream (a filtered entry, or assembled parts).
pub fn extract_atom_stream<R: Read>(
    reader: R,
    stem: &str,
    spec: FilterSpec,
    dest: &Path,
    key: Option<&PassphraseKey>,
    selection: Selection<'_>,
) -> Result<Vec<PathBuf>> {
    let base = base_for_stem(stem).to_string();
    let base_dir = if base.is_empty() {
        dest.to_path_buf()
    } else {
        dest.join(safe_relative(&base)?)
    };

    let filtered = FilterReader::new(reader, spec, key)?;
    let mut inner = tar::Archive::new(filtered);
    let mut files = Vec::new();
    for entry in inner.entries().map_err(filter_io_error)? {
        let mut entry = entry.map_err(filter_io_error)?;
        let rel = entry
            .path()
            .map_err(filter_io_error)?
            .to_string_lossy()
            .into_owned();
        let full = join_name(&base, &rel);
        if !selection.matches(&full) {
            // Entries must still be read in order through the stream.
            io::copy(&mut entry, &mut io::sink()).map_err(filter_io_error)?;
            continue;
        }
        std::fs::create_dir_all(&base_dir)?;
        let unpacked = entry.unpack_in(&base_dir).map_err(filter_io_error)?;
        if unpacked && entry.header().entry_type().is_file() {
            files.push(base_dir.join(&rel));
        }
    }
    // Drain so the final frame is authenticated.
    let mut rest = inner.into_inner();
    io::copy(&mut rest, &mut io::sink()).map_err(filter_io_error)?;
    Ok(files)
}

/// Concatenate staged parts in order. All parts must be present.
pub fn assemble_parts(parts: &[StagedPart], out: &Path) -> Result<()> {
    let Some(first) = parts.first() else {
        return Err(FloeError::Consistency("no parts to assemble".into()));
    };
    let mut sorted: Vec<&StagedPart> = parts.iter().collect();
    sorted.sort_by_key(|p| p.index);
    let complete = sorted.len() == first.count as usize
        && sorted.iter().enumerate().all(|(i, p)| p.index as usize == i);
    if !complete {
        return Err(FloeError::Consistency(format!(
            "incomplete fragment set for {}: have {} of {}",
            first.stem,
            sorted.len(),
            first.count
        )));
    }
    let mut writer = BufWriter::new(File::create(out)?);
    for part in sorted {
        let mut reader = BufReader::new(File::open(&part.path)?);
        io::copy(&mut reader, &mut writer)?;
    }
    writer.flush()?;
    Ok(())
}

/// Read the member names of a tar without extracting.
pub fn list_entries<R: Read>(reader: R) -> Result<Vec<String>> {
    let mut archive = tar::Archive::new(reader);
    let mut names = Vec::new();
    for entry in archive.entries()? {
        let entry = entry?;
        names.push(entry.path()?.to_string_lossy().into_owned());
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::{Branch, PackingMode};
    use crate::config::{CipherKind, CompressionAlgorithm};
    use crate::filter::key::test_params;
    use crate::scan::{build_excludes, discover_atoms, list_atom_entries};
    use zeroize::Zeroizing;

    struct Fixture {
        _dir: tempfile::TempDir,
        scratch: tempfile::TempDir,
        atoms: Vec<(AtomSource, Vec<AtomEntry>)>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("photos");
        std::fs::create_dir_all(root.join("2019/raw")).unwrap();
        std::fs::write(root.join("2019/a.jpg"), b"jpeg-a").unwrap();
        std::fs::write(root.join("2019/raw/b.cr2"), vec![3u8; 4096]).unwrap();
        std::fs::create_dir_all(root.join("2020")).unwrap();
        std::fs::write(root.join("2020/c.jpg"), b"jpeg-c").unwrap();
        std::fs::write(root.join("notes.txt"), b"loose").unwrap();
        let branch = Branch::new(&root.to_string_lossy(), PackingMode::Shared).unwrap();
        let ex = build_excludes(&root, &[]).unwrap();
        let atoms = discover_atoms(&branch, &root, &ex)
            .unwrap()
            .into_iter()
            .map(|a| {
                let e = list_atom_entries(&a, &ex).unwrap();
                (a, e)
            })
            .collect();
        Fixture {
            _dir: dir,
            scratch: tempfile::tempdir().unwrap(),
            atoms,
        }
    }

    fn packed(f: &Fixture) -> Vec<PackedAtom<'_>> {
        f.atoms
            .iter()
            .map(|(s, e)| PackedAtom {
                source: s,
                entries: e,
            })
            .collect()
    }

    fn key() -> PassphraseKey {
        PassphraseKey::with_params(Zeroizing::new("pw".into()), CipherKind::Aes256Gcm, test_params())
    }

    #[test]
    fn plain_bag_is_ordinary_tar() {
        let f = fixture();
        let out = f.scratch.path().join("bag.tar");
        let built = write_bag(&out, &packed(&f), FilterSpec::plain(), None, f.scratch.path()).unwrap();
        assert!(built.manifest.contains(&"photos/2019/raw/b.cr2".to_string()));
        assert!(built.manifest.contains(&"photos/notes.txt".to_string()));

        let names = list_entries(File::open(&out).unwrap()).unwrap();
        assert!(names.iter().any(|n| n == "photos/2019/a.jpg"));
        assert!(names.iter().any(|n| n == "photos/notes.txt"));

        let dest = tempfile::tempdir().unwrap();
        let got = extract_bag(
            File::open(&out).unwrap(),
            dest.path(),
            false,
            None,
            Selection::All,
            f.scratch.path(),
        )
        .unwrap();
        assert_eq!(got.files.len(), 4);
        assert_eq!(
            std::fs::read(dest.path().join("photos/2020/c.jpg")).unwrap(),
            b"jpeg-c"
        );
    }

    #[test]
    fn filtered_bag_has_one_entry_per_atom_and_restores() {
        let f = fixture();
        let spec = FilterSpec {
            compression: Some(CompressionAlgorithm::Gzip),
            level: None,
            encrypt: true,
        };
        let k = key();
        let out = f.scratch.path().join("bag.tar");
        write_bag(&out, &packed(&f), spec, Some(&k), f.scratch.path()).unwrap();

        let names = list_entries(File::open(&out).unwrap()).unwrap();
        assert_eq!(
            names,
            vec![
                "photos/2019.tar.gz.enc",
                "photos/2020.tar.gz.enc",
                "photos/__BRANCH_ROOT__.tar.gz.enc"
            ]
        );

        let dest = tempfile::tempdir().unwrap();
        let wanted = vec!["photos/2019/raw".to_string(), "photos/notes.txt".to_string()];
        let got = extract_bag(
            File::open(&out).unwrap(),
            dest.path(),
            true,
            Some(&k),
            Selection::Paths(&wanted),
            f.scratch.path(),
        )
        .unwrap();
        let mut files: Vec<_> = got
            .files
            .iter()
            .map(|p| p.strip_prefix(dest.path()).unwrap().to_string_lossy().into_owned())
            .collect();
        files.sort();
        assert_eq!(files, vec!["photos/2019/raw/b.cr2", "photos/notes.txt"]);
        assert!(!dest.path().join("photos/2020").exists());
    }

    #[test]
    fn fragments_reassemble() {
        let f = fixture();
        let (source, entries) = &f.atoms[0];
        let atom = PackedAtom { source, entries };
        let spec = FilterSpec::plain();
        let capacity = 2048;
        let mut stream = AtomStream::build(atom, spec, None, f.scratch.path()).unwrap();
        let count = stream.part_count(capacity);
        assert!(count > 1);
        let outs: Vec<PathBuf> = (0..count)
            .map(|i| f.scratch.path().join(format!("frag{i}.tar")))
            .collect();
        let built = write_fragments(&outs, &mut stream, capacity).unwrap();
        assert_eq!(built.len(), count as usize);
        assert!(built.iter().all(|b| b.size <= capacity));

        let parts_dir = f.scratch.path().join("parts");
        let dest = tempfile::tempdir().unwrap();
        let mut parts = Vec::new();
        for out in outs.iter().rev() {
            let got = extract_bag(
                File::open(out).unwrap(),
                dest.path(),
                false,
                None,
                Selection::All,
                &parts_dir,
            )
            .unwrap();
            assert!(got.files.is_empty());
            parts.extend(got.parts);
        }
        assert_eq!(parts[0].stem, "photos/2019.tar");

        let joined = f.scratch.path().join("joined");
        assemble_parts(&parts, &joined).unwrap();
        let (stem, parsed) = FilterSpec::parse_entry_name(&parts[0].stem).unwrap();
        let files = extract_atom_stream(
            File::open(&joined).unwrap(),
            stem,
            parsed,
            dest.path(),
            None,
            Selection::All,
        )
        .unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(
            std::fs::read(dest.path().join("photos/2019/a.jpg")).unwrap(),
            b"jpeg-a"
        );
    }

    #[test]
    fn many_small_files_stay_within_fragment_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("vault");
        std::fs::create_dir_all(&root).unwrap();
        for i in 0..400 {
            std::fs::write(root.join(format!("f{i:04}.dat")), vec![9u8; 1000]).unwrap();
        }
        let branch = Branch::new(&root.to_string_lossy(), PackingMode::Sovereign).unwrap();
        let ex = build_excludes(&root, &[]).unwrap();
        let source = discover_atoms(&branch, &root, &ex).unwrap().remove(0);
        let entries = list_atom_entries(&source, &ex).unwrap();
        let raw: u64 = entries.iter().map(|e| e.size).sum();

        let capacity = 100_000;
        let scratch = tempfile::tempdir().unwrap();
        let mut stream = AtomStream::build(
            PackedAtom { source: &source, entries: &entries },
            FilterSpec::plain(),
            None,
            scratch.path(),
        )
        .unwrap();
        // headers and padding make the stream much larger than the data
        assert!(stream.stream_len() > raw);
        let count = stream.part_count(capacity);
        assert!(u64::from(count) > raw.div_ceil(capacity));

        let outs: Vec<PathBuf> = (0..count)
            .map(|i| scratch.path().join(format!("p{i}.tar")))
            .collect();
        let built = write_fragments(&outs, &mut stream, capacity).unwrap();
        for b in &built {
            assert!(b.size <= capacity, "{} is {} bytes", b.path.display(), b.size);
        }
    }

    #[test]
    fn fragment_count_mismatch_is_rejected() {
        let f = fixture();
        let (source, entries) = &f.atoms[0];
        let mut stream =
            AtomStream::build(PackedAtom { source, entries }, FilterSpec::plain(), None, f.scratch.path())
                .unwrap();
        let outs = vec![f.scratch.path().join("only.tar")];
        assert!(matches!(
            write_fragments(&outs, &mut stream, 2048),
            Err(FloeError::Consistency(_))
        ));
    }

    #[test]
    fn part_len_leaves_room_for_framing() {
        let len = fragment_part_len("vault.tar", 1_000_000);
        assert_eq!(len % BLOCK, 0);
        assert!(len + 3 * BLOCK <= 1_000_000);
        let long = "x".repeat(120);
        assert!(fragment_part_len(&long, 1_000_000) < len);
        assert_eq!(fragment_part_len("vault.tar", 10), BLOCK);
    }

    #[test]
    fn incomplete_parts_are_rejected() {
        let part = StagedPart {
            stem: "x.tar".into(),
            index: 1,
            count: 2,
            path: PathBuf::from("/nonexistent"),
        };
        assert!(matches!(
            assemble_parts(&[part], Path::new("/tmp/never")),
            Err(FloeError::Consistency(_))
        ));
    }

    #[test]
    fn fragment_names_round_trip() {
        let n = fragment_entry_name("b/huge.tar", 2, 12);
        assert_eq!(n, "b/huge.tar.part-0003-of-0012");
        assert_eq!(parse_fragment_name(&n), Some(("b/huge.tar", 2, 12)));
        assert_eq!(parse_fragment_name("b/plain.txt"), None);
    }

    #[test]
    fn selection_matches_directories() {
        let sel = vec!["photos/2019".to_string()];
        let s = Selection::Paths(&sel);
        assert!(s.matches("photos/2019/a.jpg"));
        assert!(s.matches("photos/2019"));
        assert!(!s.matches("photos/20190/a.jpg"));
    }
}
