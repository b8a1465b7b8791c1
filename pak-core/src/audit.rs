//! Revision audit over a folder of base and patch archives.

use crate::crypto::keychain::KeyChain;
use crate::error::{PakError, Result};
use crate::order::map::{NO_ORDER, OrderMap};
use crate::patch::diff::resolve_prior_archives;
use crate::read::opened::PakReader;
use crate::util::paths::{self, MOUNT_PREFIX};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuditState {
    /// Latest revision is in the highest patch level.
    Fresh,
    /// Latest revision comes from an older patch level.
    Inherited,
    /// Deleted and re-added at the same patch level.
    Moved,
    Deleted,
    /// Re-added after an earlier delete.
    Restored,
    /// A delete record with no revision of the file in any archive.
    DeletedWithoutRevision,
}

impl fmt::Display for AuditState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuditState::Fresh => "Fresh",
            AuditState::Inherited => "Inherited",
            AuditState::Moved => "Moved",
            AuditState::Deleted | AuditState::DeletedWithoutRevision => "Deleted",
            AuditState::Restored => "Restored",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, Default)]
pub struct AuditOptions {
    pub only_deleted: bool,
    pub csv: Option<PathBuf>,
    pub order: Option<OrderMap>,
    pub sort_by_order: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuditRow {
    pub asset_name: String,
    pub state: AuditState,
    pub pak: String,
    pub prev_pak: Option<String>,
    pub revision: i32,
    pub prev_revision: Option<i32>,
    pub size: Option<u64>,
    pub asset_path: String,
    pub patch_chunk: String,
    pub open_order: Option<u64>,
}

impl AuditRow {
    fn csv_line(&self) -> String {
        let opt = |v: Option<String>| v.unwrap_or_default();
        let prev_pak = match self.state {
            AuditState::DeletedWithoutRevision => "Error".to_string(),
            _ => opt(self.prev_pak.clone()),
        };
        format!(
            "{},{},{},{},{},{},{},{},{},{}",
            self.asset_name,
            self.state,
            self.pak,
            prev_pak,
            self.revision,
            opt(self.prev_revision.map(|r| r.to_string())),
            opt(self.size.map(|s| s.to_string())),
            self.asset_path,
            self.patch_chunk,
            opt(self.open_order.map(|o| o.to_string())),
        )
    }
}

#[derive(Clone, Debug, Default)]
pub struct AuditReport {
    pub rows: Vec<AuditRow>,
    /// Files read in open order, and how many of them start a new archive.
    pub reads: usize,
    pub seeks: usize,
}

#[derive(Clone, Debug)]
struct Revision {
    pak: String,
    priority: i32,
    size: u64,
}

fn record_latest(map: &mut HashMap<String, Revision>, path: String, rev: Revision) {
    match map.get(&path) {
        Some(existing) if existing.priority >= rev.priority => {}
        _ => {
            map.insert(path, rev);
        }
    }
}

fn patch_dot_chunk(pak_path: &str, priority: i32) -> String {
    let chunk = paths::pak_chunk_index_from_filename(pak_path);
    match chunk {
        -1 => format!("{}.", priority + 1),
        c => format!("{}.{c}", priority + 1),
    }
}

fn sorted_paths(
    map: &HashMap<String, Revision>,
    order_of: &impl Fn(&str) -> u64,
    by_order: bool,
) -> Vec<String> {
    let mut keys: Vec<String> = map.keys().cloned().collect();
    keys.sort_by(|a, b| match by_order {
        true => order_of(a).cmp(&order_of(b)).then_with(|| a.cmp(b)),
        false => {
            let c = a.to_lowercase().cmp(&b.to_lowercase());
            if c == Ordering::Equal { a.cmp(b) } else { c }
        }
    });
    keys
}

/// Reports the latest revision of every file and delete record across the
/// archives in `input` (a folder or a file-name wildcard).
pub fn audit(input: &Path, keys: &KeyChain, opts: &AuditOptions) -> Result<AuditReport> {
    let paks = resolve_prior_archives(input)?;
    if paks.is_empty() {
        return Err(PakError::config(format!(
            "no pak files found searching {}",
            input.display()
        )));
    }

    let mut files: HashMap<String, Revision> = HashMap::new();
    let mut deleted: HashMap<String, Revision> = HashMap::new();
    let mut patch_chunks: HashMap<String, String> = HashMap::new();
    let mut highest = -1;
    for pak in &paks {
        let full = pak.to_string_lossy().into_owned();
        let name = paths::clean_filename(&paths::normalize(&full)).to_string();
        let priority = paths::pak_priority_from_filename(&full);
        highest = highest.max(priority);
        let reader = PakReader::open(pak, keys)?;
        let mount = paths::as_directory(paths::strip_mount_prefix(reader.mount_point()));
        for ie in reader.entries() {
            let rev = Revision {
                pak: name.clone(),
                priority,
                size: ie.entry.size,
            };
            let target = match ie.entry.is_delete_record() {
                true => &mut deleted,
                false => &mut files,
            };
            record_latest(target, format!("{mount}{}", ie.filename), rev);
        }
        patch_chunks.insert(name, patch_dot_chunk(&full, priority));
    }

    let has_order = opts.order.as_ref().is_some_and(|o| !o.is_empty());
    let by_order = opts.sort_by_order && has_order;
    let order_of = |path: &str| -> u64 {
        match &opts.order {
            Some(o) => o.order_or_none(&format!("{MOUNT_PREFIX}{path}"), false),
            None => NO_ORDER,
        }
    };
    let lookup_order = |path: &str| Some(order_of(path)).filter(|&o| o != NO_ORDER);
    info!(
        archives = paks.len(),
        by_order, "sorting pak audit data"
    );

    let mut report = AuditReport::default();
    let mut previous_chunk: Option<String> = None;
    for path in sorted_paths(&files, &order_of, by_order) {
        let rev = &files[&path];
        let patch_chunk = patch_chunks.get(&rev.pak).cloned().unwrap_or_default();
        let base = AuditRow {
            asset_name: paths::clean_filename(&path).to_string(),
            state: AuditState::Fresh,
            pak: rev.pak.clone(),
            prev_pak: None,
            revision: rev.priority,
            prev_revision: None,
            size: Some(rev.size),
            asset_path: path.clone(),
            patch_chunk: patch_chunk.clone(),
            open_order: lookup_order(&path),
        };
        let mut exists = true;
        let row = match deleted.get(&path) {
            None if opts.only_deleted => None,
            None if rev.priority == highest => Some(base),
            None => Some(AuditRow {
                state: AuditState::Inherited,
                ..base
            }),
            Some(d) if d.priority == rev.priority => Some(AuditRow {
                state: AuditState::Moved,
                prev_pak: Some(d.pak.clone()),
                ..base
            }),
            Some(d) if d.priority > rev.priority => {
                exists = false;
                Some(AuditRow {
                    state: AuditState::Deleted,
                    pak: d.pak.clone(),
                    prev_pak: Some(rev.pak.clone()),
                    revision: d.priority,
                    prev_revision: Some(rev.priority),
                    size: None,
                    ..base
                })
            }
            Some(d) => Some(AuditRow {
                state: AuditState::Restored,
                prev_pak: Some(d.pak.clone()),
                prev_revision: Some(d.priority),
                ..base
            }),
        };
        if let Some(r) = row {
            report.rows.push(r);
        }
        if exists && by_order {
            report.reads += 1;
            if previous_chunk.as_deref() != Some(patch_chunk.as_str()) {
                previous_chunk = Some(patch_chunk);
                report.seeks += 1;
            }
        }
    }

    for path in sorted_paths(&deleted, &order_of, by_order) {
        if files.contains_key(&path) {
            continue;
        }
        let d = &deleted[&path];
        report.rows.push(AuditRow {
            asset_name: paths::clean_filename(&path).to_string(),
            state: AuditState::DeletedWithoutRevision,
            pak: d.pak.clone(),
            prev_pak: None,
            revision: d.priority,
            prev_revision: None,
            size: None,
            asset_path: path.clone(),
            patch_chunk: patch_chunks.get(&d.pak).cloned().unwrap_or_default(),
            open_order: lookup_order(&path),
        });
    }

    let header = "AssetName,State,Pak,Prev.Pak,Rev,Prev.Rev,Size,AssetPath,Patch.Chunk,OpenOrder";
    match &opts.csv {
        Some(p) => {
            info!(path = %p.display(), "writing pak audit CSV file");
            let mut w = BufWriter::new(File::create(p)?);
            writeln!(w, "{header}")?;
            for r in &report.rows {
                writeln!(w, "{}", r.csv_line())?;
            }
            w.flush()?;
        }
        None => {
            info!("{header}");
            for r in &report.rows {
                info!("{}", r.csv_line());
            }
        }
    }
    if report.reads > 0 {
        info!(
            "{} guaranteed seeks out of {} files read ({:.2}%) with the given open order",
            report.seeks,
            report.reads,
            report.seeks as f64 * 100.0 / report.reads as f64
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::collector::BuildEntry;
    use crate::pack::writer::{BuildOptions, build};
    use std::fs;

    fn pak(dir: &Path, name: &str, files: &[&str], deletes: &[&str]) {
        let src = dir.join("src").join(name);
        fs::create_dir_all(&src).unwrap();
        let mut entries: Vec<BuildEntry> = files
            .iter()
            .map(|n| {
                fs::write(src.join(n), n.as_bytes()).unwrap();
                BuildEntry::new(src.join(n).to_string_lossy(), format!("../../../Game/{n}"))
            })
            .collect();
        for d in deletes {
            entries.push(BuildEntry::delete_record(format!("../../../Game/{d}")));
        }
        let opts = BuildOptions {
            mount_point: Some("../../../Game/".to_string()),
            ..Default::default()
        };
        build(&entries, &KeyChain::default(), &opts, &dir.join("paks").join(name), None).unwrap();
    }

    #[test]
    fn classifies_revisions() {
        let td = tempfile::tempdir().unwrap();
        fs::create_dir_all(td.path().join("paks")).unwrap();
        pak(td.path(), "pakchunk0-T.pak", &["a.txt", "b.txt", "c.txt", "d.txt"], &[]);
        pak(td.path(), "pakchunk0-T_0_P.pak", &["b.txt", "d.txt"], &["c.txt", "e.txt"]);
        pak(td.path(), "pakchunk0-T_1_P.pak", &["a.txt"], &["d.txt"]);

        let csv = td.path().join("audit.csv");
        let opts = AuditOptions {
            csv: Some(csv.clone()),
            ..Default::default()
        };
        let report = audit(&td.path().join("paks"), &KeyChain::default(), &opts).unwrap();
        let states: Vec<(&str, AuditState)> = report
            .rows
            .iter()
            .map(|r| (r.asset_name.as_str(), r.state))
            .collect();
        assert_eq!(
            states,
            vec![
                ("a.txt", AuditState::Fresh),
                ("b.txt", AuditState::Inherited),
                ("c.txt", AuditState::Deleted),
                ("d.txt", AuditState::Deleted),
                ("e.txt", AuditState::DeletedWithoutRevision),
            ]
        );
        assert_eq!(report.rows[0].patch_chunk, "2.0");
        let text = fs::read_to_string(csv).unwrap();
        assert!(text.contains("e.txt,Deleted,pakchunk0-T_0_P.pak,Error,0,,,Game/e.txt,1.0,"));
    }

    #[test]
    fn counts_seeks_in_open_order() {
        let td = tempfile::tempdir().unwrap();
        fs::create_dir_all(td.path().join("paks")).unwrap();
        pak(td.path(), "pakchunk0-T.pak", &["a.txt", "b.txt", "c.txt"], &[]);
        pak(td.path(), "pakchunk0-T_0_P.pak", &["b.txt"], &[]);
        let mut order = OrderMap::new();
        order.load_str("../../../Game/a.txt\n../../../Game/b.txt\n../../../Game/c.txt\n", false);
        let opts = AuditOptions {
            order: Some(order),
            sort_by_order: true,
            ..Default::default()
        };
        let report = audit(&td.path().join("paks"), &KeyChain::default(), &opts).unwrap();
        assert_eq!(report.reads, 3);
        assert_eq!(report.seeks, 3);
        assert_eq!(report.rows[1].open_order, Some(1));
    }
}
