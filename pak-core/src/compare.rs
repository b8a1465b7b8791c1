//! Content comparison of two archives.

use crate::container::index::IndexEntry;
use crate::error::Result;
use crate::read::opened::PakReader;
use std::collections::HashMap;
use tracing::{info, warn};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ArchiveComparison {
    pub unique_to_first: Vec<String>,
    pub unique_to_second: Vec<String>,
    /// Path with the uncompressed size on each side.
    pub size_different: Vec<(String, u64, u64)>,
    pub content_different: Vec<String>,
    /// Entries whose payload could not be read back.
    pub unreadable: Vec<String>,
    pub equal: usize,
}

impl ArchiveComparison {
    pub fn is_identical(&self) -> bool {
        self.unique_to_first.is_empty()
            && self.unique_to_second.is_empty()
            && self.size_different.is_empty()
            && self.content_different.is_empty()
            && self.unreadable.is_empty()
    }
}

fn by_full_path(reader: &PakReader) -> HashMap<String, &IndexEntry> {
    reader
        .entries()
        .iter()
        .filter(|e| !e.entry.is_delete_record())
        .map(|e| (reader.index.full_path(&e.filename), e))
        .collect()
}

/// Compares files by full path; contents are compared decompressed, so
/// archives built with different compression still match.
pub fn compare(first: &PakReader, second: &PakReader) -> Result<ArchiveComparison> {
    let mut out = ArchiveComparison::default();
    let others = by_full_path(second);

    for ie in first.entries().iter().filter(|e| !e.entry.is_delete_record()) {
        let path = first.index.full_path(&ie.filename);
        let Some(other) = others.get(&path) else {
            info!("UniqueToFirstPak, {path}, {}, 0", ie.entry.uncompressed_size);
            out.unique_to_first.push(path);
            continue;
        };
        let (a, b) = (ie.entry.uncompressed_size, other.entry.uncompressed_size);
        if a != b {
            info!("FilesizeDifferent, {path}, {a}, {b}");
            out.size_different.push((path, a, b));
            continue;
        }
        let hashes = first
            .content_hash(&ie.entry)
            .and_then(|h1| Ok((h1, second.content_hash(&other.entry)?)));
        match hashes {
            Ok((h1, h2)) if h1 == h2 => out.equal += 1,
            Ok(_) => {
                info!("ContentsDifferent, {path}, {a}, {b}");
                out.content_different.push(path);
            }
            Err(e) => {
                warn!(file = %path, error = %e, "cannot read entry for comparison");
                out.unreadable.push(path);
            }
        }
    }

    let firsts = by_full_path(first);
    let mut unique_second: Vec<(&String, &&IndexEntry)> = others
        .iter()
        .filter(|(p, _)| !firsts.contains_key(*p))
        .collect();
    unique_second.sort_by_key(|(_, e)| e.entry.offset);
    for (path, ie) in unique_second {
        info!("UniqueToSecondPak, {path}, 0, {}", ie.entry.uncompressed_size);
        out.unique_to_second.push(path.clone());
    }

    info!(
        unique_first = out.unique_to_first.len(),
        unique_second = out.unique_to_second.len(),
        size_different = out.size_different.len(),
        content_different = out.content_different.len(),
        equal = out.equal,
        "comparison finished"
    );
    Ok(out)
}
