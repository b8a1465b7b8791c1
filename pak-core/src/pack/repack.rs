//! Rebuilds an existing archive with the settings it was written with.

use super::writer::{BuildOptions, build};
use crate::codec::CompressionMethod;
use crate::collect::collector::BuildEntry;
use crate::crypto::keychain::KeyChain;
use crate::crypto::signing::sig_path_for;
use crate::error::{PakError, Result};
use crate::read::extract::safe_join;
use crate::read::opened::PakReader;
use crate::stats::BuildStats;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Clone, Debug, Default)]
pub struct RepackOptions {
    /// Write here instead of replacing the source archive.
    pub output: Option<PathBuf>,
    /// Base options; formats, index encryption, version, mount point and
    /// signing are taken from the source archive.
    pub build: BuildOptions,
}

/// Extracts `source` to a scratch folder and builds it again in offset
/// order. The destination is only replaced once the new archive is sealed.
pub fn repack(source: &Path, keys: &KeyChain, opts: &RepackOptions) -> Result<BuildStats> {
    let out = opts.output.clone().unwrap_or_else(|| source.to_path_buf());
    let signed = sig_path_for(source).exists();
    let has_private = keys
        .signing_key
        .as_ref()
        .is_some_and(|k| k.private.is_some());
    if signed && !has_private {
        return Err(PakError::crypto(
            "source archive is signed but no private key is available to re-sign it",
        ));
    }

    let scratch = tempfile::tempdir()?;
    let (entries, build_opts) = {
        let reader = PakReader::open(source, keys)?;
        info!(
            source = %source.display(),
            entries = reader.entries().len(),
            "repacking archive"
        );
        let mut ordered: Vec<_> = reader.entries().iter().collect();
        ordered.sort_by_key(|ie| (ie.entry.is_delete_record(), ie.entry.offset));

        let mut entries = Vec::with_capacity(ordered.len());
        let mut block_size = None;
        for (order, ie) in ordered.into_iter().enumerate() {
            let dest = reader.index.full_path(&ie.filename);
            if ie.entry.is_delete_record() {
                entries.push(BuildEntry::delete_record(dest));
                continue;
            }
            let path = safe_join(scratch.path(), &ie.filename)?;
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut w = BufWriter::new(File::create(&path)?);
            reader.read_entry(&ie.entry, &mut w)?;
            w.flush()?;
            debug!(file = %dest, "staged for repack");

            if ie.entry.is_compressed() && block_size.is_none() {
                block_size = Some(ie.entry.compression_block_size);
            }
            let mut e = BuildEntry::new(path.to_string_lossy(), dest);
            e.suggested_order = order as u64;
            e.needs_compression = ie.entry.is_compressed();
            e.needs_encryption = ie.entry.is_encrypted();
            entries.push(e);
        }

        let mut build_opts = opts.build.clone();
        let formats: Vec<CompressionMethod> = reader
            .trailer
            .formats
            .iter()
            .filter_map(|n| CompressionMethod::from_name(n))
            .collect();
        if !formats.is_empty() {
            build_opts.compression.formats = formats;
        }
        if let Some(b) = block_size.filter(|b| *b > 0) {
            build_opts.compression.block_size = b;
        }
        build_opts.encrypt_index = reader.trailer.encrypted_index;
        build_opts.version = reader.trailer.version;
        build_opts.mount_point = Some(reader.mount_point().to_string());
        build_opts.sign = signed;
        (entries, build_opts)
    };

    let (_, stats) = build(&entries, keys, &build_opts, &out, None)?;
    info!(out = %out.display(), files = stats.files, "repack finished");
    Ok(stats)
}
