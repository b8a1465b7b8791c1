//! Expands raw inputs (files, wildcards, directories, delete records) into
//! the ordered, de-duplicated list the builder consumes.

use crate::error::Result;
use crate::order::map::{NO_ORDER, OrderMap, UBULK_ORDER_BIAS, UEXP_ORDER_BIAS, UNORDERED_FILE_ORDER};
use crate::util::paths;
use std::collections::HashMap;
use tracing::{debug, info};
use walkdir::WalkDir;

/// One file headed for the archive. Before collection `dest` is the
/// destination directory (with a trailing `/`); afterwards it is the full
/// destination path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildEntry {
    pub source: String,
    pub dest: String,
    pub suggested_order: u64,
    pub needs_compression: bool,
    pub needs_encryption: bool,
    pub is_delete_record: bool,
    pub is_primary_order: bool,
}

impl BuildEntry {
    pub fn new(source: impl Into<String>, dest: impl Into<String>) -> Self {
        Self {
            source: paths::normalize(&source.into()),
            dest: paths::normalize(&dest.into()),
            suggested_order: NO_ORDER,
            needs_compression: false,
            needs_encryption: false,
            is_delete_record: false,
            is_primary_order: false,
        }
    }

    /// Entry that removes `dest` from the mounted view.
    pub fn delete_record(dest: impl Into<String>) -> Self {
        let dest = paths::normalize(&dest.into());
        Self {
            source: dest.clone(),
            is_delete_record: true,
            ..Self::new(String::new(), dest)
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct CollectOptions {
    /// Let single files without an order of their own borrow the order of
    /// their `.uasset`/`.umap`.
    pub fallback_order_for_non_uasset_files: bool,
}

pub fn collect(
    raw: &[BuildEntry],
    order_map: &OrderMap,
    opts: &CollectOptions,
) -> Result<Vec<BuildEntry>> {
    let mut out: Vec<BuildEntry> = Vec::new();
    let mut by_source: HashMap<String, usize> = HashMap::new();

    for input in raw {
        if input.is_delete_record {
            out.push(input.clone());
            continue;
        }
        let source = paths::normalize(&input.source);
        let mut name = paths::clean_filename(&source).to_string();
        let dir = paths::as_directory(paths::directory(&source));
        if name.is_empty() {
            name = "*.*".to_string();
        }

        if name.contains('*') {
            let mut found = 0usize;
            for f in enumerate_matching(&dir, &name)? {
                let dest = paths::replace_prefix_ignore_case(&f, &dir, &input.dest);
                let lookup = order_map.priority_of(&dest, false);
                let (order, is_primary) = match lookup.order {
                    Some(o) => (o, lookup.is_primary.unwrap_or(false)),
                    None => companion_order(&dest, order_map),
                };
                let entry = BuildEntry {
                    source: f,
                    dest,
                    suggested_order: order,
                    is_primary_order: is_primary,
                    ..input.clone()
                };
                merge_or_push(&mut out, &mut by_source, entry);
                found += 1;
            }
            debug!(pattern = %source, files = found, "expanded wildcard input");
        } else {
            let dest = paths::replace_prefix_ignore_case(&source, &dir, &input.dest);
            let lookup = order_map.priority_of(&dest, opts.fallback_order_for_non_uasset_files);
            let entry = BuildEntry {
                source,
                dest,
                suggested_order: lookup.order.unwrap_or(NO_ORDER),
                is_primary_order: lookup.is_primary.unwrap_or(false),
                ..input.clone()
            };
            merge_or_push(&mut out, &mut by_source, entry);
        }
    }

    out.sort_by(|a, b| {
        (a.is_delete_record, a.suggested_order, &a.dest).cmp(&(
            b.is_delete_record,
            b.suggested_order,
            &b.dest,
        ))
    });
    info!(files = out.len(), "collected files to add");
    Ok(out)
}

/// Order for a wildcard match that has none of its own. A `.uexp` or
/// `.ubulk` takes the primary flag of the counterpart it borrowed from.
fn companion_order(dest: &str, order_map: &OrderMap) -> (u64, bool) {
    let bias = if paths::is_uexp(dest) {
        UEXP_ORDER_BIAS
    } else if paths::is_ubulk(dest) {
        UBULK_ORDER_BIAS
    } else {
        return (UNORDERED_FILE_ORDER, false);
    };
    let base = paths::base_filename(dest);
    let (base_order, is_primary) = ["uasset", "umap"]
        .iter()
        .map(|ext| order_map.priority_of(&format!("{base}.{ext}"), false))
        .find_map(|l| l.order.map(|o| (o, l.is_primary.unwrap_or(false))))
        .unwrap_or((0, false));
    (base_order.saturating_add(bias), is_primary)
}

fn merge_or_push(out: &mut Vec<BuildEntry>, by_source: &mut HashMap<String, usize>, entry: BuildEntry) {
    match by_source.get(&entry.source) {
        Some(&i) => {
            let existing = &mut out[i];
            existing.needs_compression |= entry.needs_compression;
            existing.needs_encryption |= entry.needs_encryption;
            if entry.suggested_order < existing.suggested_order {
                existing.suggested_order = entry.suggested_order;
                existing.is_primary_order = entry.is_primary_order;
            }
        }
        None => {
            by_source.insert(entry.source.clone(), out.len());
            out.push(entry);
        }
    }
}

fn enumerate_matching(dir: &str, pattern: &str) -> Result<Vec<String>> {
    let mut files = Vec::new();
    let root = if dir.is_empty() { "." } else { dir };
    for e in WalkDir::new(root).follow_links(true).sort_by_file_name() {
        let e = e?;
        if !e.file_type().is_file() {
            continue;
        }
        let name = e.file_name().to_string_lossy();
        if paths::wildcard_match(pattern, &name) {
            let p = paths::normalize(&e.path().to_string_lossy());
            files.push(match dir.is_empty() {
                true => p.trim_start_matches("./").to_string(),
                false => p,
            });
        }
    }
    Ok(files)
}
