//! Patch diffing: hash what earlier archives already ship and drop the
//! candidates that would not change anything.

use super::seekopt::{SeekOptMode, SeekOptParams, SeekOptSummary, SeekOptimizer};
use crate::collect::collector::BuildEntry;
use crate::container::trailer::VERSION_DELETE_RECORDS;
use crate::crypto::keychain::KeyChain;
use crate::error::{PakError, Result};
use crate::hash::content::{Hash128, hash128_reader};
use crate::read::opened::PakReader;
use crate::util::paths::{self, MOUNT_PREFIX};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// What the previous archives hold for one logical path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileHashRecord {
    pub hash: Hash128,
    pub size: u64,
    pub patch_index: i32,
    pub is_delete_record: bool,
    pub force_include: bool,
}

#[derive(Clone, Debug, Default)]
pub struct PriorArchives {
    pub records: HashMap<String, FileHashRecord>,
    /// Lowest version among prior patch archives, if any were found.
    pub lowest_patch_version: Option<u8>,
}

#[derive(Clone, Debug)]
pub struct DiffOptions {
    pub seek_opt: SeekOptParams,
    /// Keep `.uasset`/`.umap` and `.uexp` halves in the same archive.
    pub guarantee_pairs: bool,
    /// Writes the source path of every changed candidate here.
    pub changed_files_list: Option<PathBuf>,
    /// Folder scanned for legacy moves; defaults to the folder of the first
    /// prior archive.
    pub legacy_scan_dir: Option<PathBuf>,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            seek_opt: SeekOptParams::default(),
            guarantee_pairs: true,
            changed_files_list: None,
            legacy_scan_dir: None,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct DiffOutcome {
    /// Surviving candidates in their original order, delete records included.
    pub entries: Vec<BuildEntry>,
    pub delete_records: usize,
    pub removed: usize,
    pub changed_files: Vec<String>,
    pub seek_opt: Option<SeekOptSummary>,
}

/// Expands a directory or a file-name wildcard into the archives it names.
pub fn resolve_prior_archives(pattern: &Path) -> Result<Vec<PathBuf>> {
    if pattern.is_dir() {
        return list_paks(pattern, "*.pak");
    }
    let name = pattern
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if name.contains(['*', '?']) {
        let dir = match pattern.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        return list_paks(dir, &name);
    }
    if !pattern.is_file() {
        return Err(PakError::config(format!(
            "no prior archive at {}",
            pattern.display()
        )));
    }
    Ok(vec![pattern.to_path_buf()])
}

fn list_paks(dir: &Path, wildcard: &str) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for de in fs::read_dir(dir)? {
        let de = de?;
        let name = de.file_name().to_string_lossy().into_owned();
        if de.file_type()?.is_file() && paths::wildcard_match(wildcard, &name) {
            out.push(de.path());
        }
    }
    out.sort();
    Ok(out)
}

fn logical_path(mount_point: &str, filename: &str) -> String {
    format!("{}{filename}", paths::as_directory(paths::strip_mount_prefix(mount_point)))
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Hashes the decompressed content of every entry in `archives`, keeping the
/// record from the highest patch level per path. `dest_pak` is skipped so a
/// patch level can be regenerated in place.
pub fn hash_prior_archives(archives: &[PathBuf], dest_pak: &Path, keys: &KeyChain) -> Result<PriorArchives> {
    let mut prior = PriorArchives::default();
    for pak in archives {
        if same_file(pak, dest_pak) {
            info!(pak = %pak.display(), "skipping output archive while hashing prior content");
            continue;
        }
        let reader = PakReader::open(pak, keys)?;
        let patch_index = paths::pak_priority_from_filename(&pak.to_string_lossy());
        if patch_index != -1 {
            let v = reader.trailer.version;
            prior.lowest_patch_version = Some(prior.lowest_patch_version.map_or(v, |l| l.min(v)));
        }
        info!(pak = %pak.display(), patch_index, entries = reader.entries().len(), "hashing prior archive");

        for ie in reader.entries() {
            let path = logical_path(reader.mount_point(), &ie.filename);
            let record = if ie.entry.is_delete_record() {
                FileHashRecord {
                    hash: [0; 16],
                    size: 0,
                    patch_index,
                    is_delete_record: true,
                    force_include: false,
                }
            } else {
                match reader.content_hash(&ie.entry) {
                    Ok(hash) => FileHashRecord {
                        hash,
                        size: ie.entry.uncompressed_size,
                        patch_index,
                        is_delete_record: false,
                        force_include: false,
                    },
                    Err(e) => {
                        error!(pak = %pak.display(), file = %path, error = %e, "cannot hash prior entry");
                        continue;
                    }
                }
            };
            match prior.records.get(&path) {
                Some(existing) if existing.patch_index >= patch_index => {}
                _ => {
                    prior.records.insert(path, record);
                }
            }
        }
    }
    Ok(prior)
}

/// Delete records for every path the prior archives ship that the new
/// candidate set no longer contains.
pub fn new_delete_records(candidates: &[BuildEntry], records: &HashMap<String, FileHashRecord>) -> Vec<BuildEntry> {
    let present: HashSet<&str> = candidates
        .iter()
        .map(|c| paths::strip_mount_prefix(&c.dest))
        .collect();
    let mut deletes: Vec<BuildEntry> = records
        .iter()
        .filter(|(path, r)| !r.is_delete_record && !present.contains(path.as_str()))
        .map(|(path, _)| {
            info!(file = %path, "removed since the last patch, adding delete record");
            BuildEntry {
                source: path.clone(),
                ..BuildEntry::delete_record(format!("{MOUNT_PREFIX}{path}"))
            }
        })
        .collect();
    deletes.sort_by(|a, b| a.dest.cmp(&b.dest));
    deletes
}

#[derive(Clone, Debug)]
struct Revision {
    priority: i32,
    chunk: i32,
    version: u8,
}

fn keep_latest(map: &mut HashMap<String, Revision>, path: String, rev: Revision) {
    match map.get(&path) {
        Some(existing) if existing.priority >= rev.priority => {}
        _ => {
            map.insert(path, rev);
        }
    }
}

/// Archives from before delete records existed moved files between chunks
/// without leaving a trace. Drops delete records for files whose latest
/// revision now lives in another chunk, and force-includes files whose latest
/// revision sits in a legacy archive of another chunk.
pub fn process_legacy_file_moves(
    deletes: &mut Vec<BuildEntry>,
    records: &mut HashMap<String, FileHashRecord>,
    scan_dir: &Path,
    candidates: &[BuildEntry],
    current_chunk: i32,
    keys: &KeyChain,
) -> Result<()> {
    let delete_sources: HashSet<String> = deletes.iter().map(|d| d.source.clone()).collect();
    let added: HashSet<&str> = candidates.iter().map(|c| c.dest.as_str()).collect();
    let mut deleted_revisions: HashMap<String, Revision> = HashMap::new();
    let mut required_revisions: HashMap<String, Revision> = HashMap::new();

    for pak in list_paks(scan_dir, "*.pak")? {
        let name = pak.to_string_lossy().into_owned();
        let reader = match PakReader::open(&pak, keys) {
            Ok(r) => r,
            Err(e) => {
                warn!(pak = %pak.display(), error = %e, "cannot open archive while scanning for legacy moves");
                continue;
            }
        };
        let rev = Revision {
            priority: paths::pak_priority_from_filename(&name),
            chunk: paths::pak_chunk_index_from_filename(&name),
            version: reader.trailer.version,
        };
        for ie in reader.entries() {
            let asset = logical_path(reader.mount_point(), &ie.filename);
            if delete_sources.contains(&asset) {
                keep_latest(&mut deleted_revisions, asset, rev.clone());
            } else if records.contains_key(&asset) && added.contains(format!("{MOUNT_PREFIX}{asset}").as_str()) {
                keep_latest(&mut required_revisions, asset, rev.clone());
            }
        }
    }

    for (asset, rev) in &deleted_revisions {
        if rev.chunk != current_chunk {
            info!(file = %asset, chunk = rev.chunk, "moved to another chunk, dropping delete record");
            deletes.retain(|d| &d.source != asset);
        }
    }
    for (asset, rev) in &required_revisions {
        if rev.version < VERSION_DELETE_RECORDS && rev.chunk != current_chunk {
            if let Some(r) = records.get_mut(asset) {
                info!(file = %asset, chunk = rev.chunk, "latest revision in a legacy archive of another chunk, forcing inclusion");
                r.force_include = true;
            }
        }
    }
    Ok(())
}

/// Index of each `.uasset`/`.umap` candidate's `.uexp` and back.
fn companion_pairs(entries: &[BuildEntry]) -> Vec<Option<usize>> {
    let by_source: HashMap<&str, usize> = entries
        .iter()
        .enumerate()
        .filter(|(_, e)| !e.is_delete_record)
        .map(|(i, e)| (e.source.as_str(), i))
        .collect();
    let mut pairs = vec![None; entries.len()];
    for (i, e) in entries.iter().enumerate() {
        if e.is_delete_record || !paths::is_package(&e.source) {
            continue;
        }
        if let Some(&j) = by_source.get(paths::change_extension(&e.source, "uexp").as_str()) {
            pairs[i] = Some(j);
            pairs[j] = Some(i);
        }
    }
    pairs
}

fn source_hash(source: &str) -> std::io::Result<(Hash128, u64)> {
    hash128_reader(BufReader::new(File::open(source)?))
}

/// Drops candidates whose content the prior archives already ship.
pub fn remove_identical_files(
    candidates: Vec<BuildEntry>,
    records: &HashMap<String, FileHashRecord>,
    opts: &DiffOptions,
) -> Result<DiffOutcome> {
    opts.seek_opt.validate()?;
    let mut keep = vec![true; candidates.len()];
    let mut sizes = vec![0u64; candidates.len()];
    let mut changed = Vec::new();

    for (i, c) in candidates.iter().enumerate() {
        if c.is_delete_record {
            continue;
        }
        let record = records
            .get(paths::strip_mount_prefix(&c.dest))
            .or_else(|| records.get(&c.dest));
        let force = record.is_some_and(|r| r.force_include) && !(opts.guarantee_pairs && paths::is_uexp(&c.dest));
        let identical = match source_hash(&c.source) {
            Ok((hash, size)) => {
                sizes[i] = size;
                record.is_some_and(|r| !r.is_delete_record && r.size == size && r.hash == hash)
            }
            Err(e) => {
                warn!(file = %c.source, error = %e, "cannot hash source file, treating as changed");
                false
            }
        };
        if !identical {
            changed.push(c.source.clone());
        }
        if force {
            debug!(file = %c.dest, "force-included");
        } else if identical {
            debug!(file = %c.dest, "unchanged, removing from patch");
            keep[i] = false;
        }
    }

    let pairs = companion_pairs(&candidates);
    if opts.guarantee_pairs {
        for (i, pair) in pairs.iter().enumerate() {
            if let Some(j) = *pair {
                if keep[i] && !keep[j] {
                    info!(kept = %candidates[i].dest, added = %candidates[j].dest, "keeping both halves of a companion pair");
                    keep[j] = true;
                }
            }
        }
    }

    let seek_opt = match opts.seek_opt.mode {
        SeekOptMode::None => None,
        _ => {
            let optimizer = SeekOptimizer::new(&candidates, &sizes, &pairs, opts.seek_opt.max_adjacent_order_diff);
            Some(optimizer.apply(&mut keep, &opts.seek_opt)?)
        }
    };

    if let Some(p) = &opts.changed_files_list {
        let mut w = BufWriter::new(File::create(p)?);
        for c in &changed {
            writeln!(w, "{c}")?;
        }
        w.flush()?;
    }

    let total = candidates.len();
    let entries: Vec<BuildEntry> = candidates
        .into_iter()
        .zip(keep)
        .filter_map(|(c, k)| k.then_some(c))
        .collect();
    let delete_records = entries.iter().filter(|e| e.is_delete_record).count();
    Ok(DiffOutcome {
        removed: total - entries.len(),
        delete_records,
        entries,
        changed_files: changed,
        seek_opt,
    })
}

/// Full patch diff of `candidates` against `prior` archives for an output
/// archive at `dest_pak`.
pub fn diff(
    prior: &[PathBuf],
    dest_pak: &Path,
    mut candidates: Vec<BuildEntry>,
    keys: &KeyChain,
    opts: &DiffOptions,
) -> Result<DiffOutcome> {
    opts.seek_opt.validate()?;
    let PriorArchives {
        mut records,
        lowest_patch_version,
    } = hash_prior_archives(prior, dest_pak, keys)?;
    info!(records = records.len(), "hashed prior archives");

    let mut deletes = new_delete_records(&candidates, &records);
    if lowest_patch_version.is_some_and(|v| v < VERSION_DELETE_RECORDS) {
        let scan_dir = opts
            .legacy_scan_dir
            .clone()
            .or_else(|| prior.first().and_then(|p| p.parent()).map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."));
        let chunk = paths::pak_chunk_index_from_filename(&dest_pak.to_string_lossy());
        process_legacy_file_moves(&mut deletes, &mut records, &scan_dir, &candidates, chunk, keys)?;
    }
    candidates.append(&mut deletes);

    let outcome = remove_identical_files(candidates, &records, opts)?;
    info!(
        kept = outcome.entries.len(),
        removed = outcome.removed,
        delete_records = outcome.delete_records,
        "patch diff finished"
    );
    Ok(outcome)
}
