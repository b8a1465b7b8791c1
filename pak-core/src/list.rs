use crate::error::Result;
use crate::read::opened::PakReader;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use tracing::info;

#[derive(Clone, Debug, Default)]
pub struct ListOptions {
    /// Only report entries whose stored size is at least this many bytes.
    pub size_filter: u64,
    pub include_deleted: bool,
    /// Also write every entry (unfiltered) to this CSV file.
    pub csv: Option<PathBuf>,
    /// Prefix names with the mount point.
    pub use_mount_point: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListRow {
    pub path: String,
    pub offset: u64,
    pub size: u64,
    pub uncompressed_size: u64,
    pub hash: String,
    pub deleted: bool,
    pub method: String,
}

/// Entries sorted by offset, filtered by size.
pub fn list(reader: &PakReader, opts: &ListOptions) -> Result<Vec<ListRow>> {
    info!("Mount point {}", reader.mount_point());
    let prefix = if opts.use_mount_point {
        reader.mount_point()
    } else {
        ""
    };
    let mut all: Vec<ListRow> = reader
        .entries()
        .iter()
        .filter(|ie| opts.include_deleted || !ie.entry.is_delete_record())
        .map(|ie| ListRow {
            path: format!("{prefix}{}", ie.filename),
            offset: ie.entry.offset,
            size: ie.entry.size,
            uncompressed_size: ie.entry.uncompressed_size,
            hash: hex::encode(ie.entry.hash),
            deleted: ie.entry.is_delete_record(),
            method: reader
                .trailer
                .method_name(ie.entry.compression_method_index)
                .to_string(),
        })
        .collect();
    all.sort_by_key(|r| r.offset);

    if let Some(p) = &opts.csv {
        let mut w = BufWriter::new(File::create(p)?);
        writeln!(w, "Filename, Offset, Size, Hash, Deleted, Compressed, CompressionMethod")?;
        for r in &all {
            writeln!(
                w,
                "{}, {}, {}, {}, {}, {}, {}",
                r.path,
                r.offset,
                r.size,
                r.hash,
                r.deleted,
                r.method != "None",
                r.method
            )?;
        }
        w.flush()?;
        info!(path = %p.display(), "saved CSV file");
    }

    let total: u64 = all.iter().map(|r| r.size).sum();
    let count = all.len();
    let rows: Vec<ListRow> = all
        .into_iter()
        .filter(|r| r.size >= opts.size_filter)
        .collect();
    let filtered: u64 = rows.iter().map(|r| r.size).sum();
    for r in &rows {
        info!(
            "\"{}\" offset: {}, size: {} bytes, hash: {}, compression: {}",
            r.path, r.offset, r.size, r.hash, r.method
        );
    }
    info!("{count} files ({total} bytes), ({filtered} filtered bytes)");
    Ok(rows)
}
