use super::compressor::{BlockCompressor, CompressedBuffer, CompressionCache, CompressionOptions};
use super::pool::WorkerPool;
use crate::collect::collector::BuildEntry;
use crate::container::entry::PakEntry;
use crate::container::index::{IndexEntry, PakIndex};
use crate::container::trailer::{Trailer, VERSION_DELETE_RECORDS, VERSION_LATEST};
use crate::crypto::aes::{AES_BLOCK, pad_deterministic};
use crate::crypto::keychain::{KeyChain, NamedKey};
use crate::crypto::signing::{SignatureFile, SigningWriter, sig_path_for};
use crate::error::{PakError, Result};
use crate::hash::content::{Hash128, hash128};
use crate::stats::BuildStats;
use crate::util::counting::CountingWriter;
use crate::util::paths;
use crate::util::size::align_up;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

#[derive(Clone, Debug)]
pub struct BuildOptions {
    pub compression: CompressionOptions,
    pub encrypt_index: bool,
    /// Keep small entries inside one filesystem block. 0 disables.
    pub fs_block_size: u64,
    /// Align entries so patch tools can diff whole blocks. 0 disables.
    pub patch_padding_align: u64,
    /// Alignment of `.m.ubulk` payloads. 0 disables.
    pub align_for_memory_mapping: u64,
    /// Compress the next batch while the current one is written.
    pub async_compression: bool,
    pub batch_files: usize,
    pub sign: bool,
    pub version: u8,
    pub threads: Option<usize>,
    /// Overrides the common root of the destinations.
    pub mount_point: Option<String>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            compression: CompressionOptions::default(),
            encrypt_index: false,
            fs_block_size: 0,
            patch_padding_align: 0,
            align_for_memory_mapping: 0,
            async_compression: false,
            batch_files: 32,
            sign: false,
            version: VERSION_LATEST,
            threads: None,
            mount_point: None,
        }
    }
}

/// A file's payload ready to be written: compressed, padded, hashed and
/// encrypted.
#[derive(Default)]
struct PreparedEntry {
    buf: CompressedBuffer,
    hash: Hash128,
    encrypted: bool,
    cache_hit: Option<bool>,
}

struct ArchiveSink {
    out: CountingWriter<SigningWriter<BufWriter<File>>>,
    trailer: Trailer,
    index: PakIndex,
    stats: BuildStats,
}

/// Writes `entries` (already collected and ordered) to `out`.
///
/// The archive is written to a temporary file next to `out` and moved into
/// place only when every step succeeded; the `.sig` file likewise.
pub fn build(
    entries: &[BuildEntry],
    keys: &KeyChain,
    opts: &BuildOptions,
    out: &Path,
    cache: Option<&dyn CompressionCache>,
) -> Result<(PakIndex, BuildStats)> {
    let needs_key = opts.encrypt_index
        || entries
            .iter()
            .any(|e| e.needs_encryption && !e.is_delete_record);
    let key: Option<&NamedKey> = match needs_key {
        true => Some(keys.master_key().ok_or_else(|| {
            PakError::crypto("encryption requested but the key chain has no master key")
        })?),
        false => None,
    };
    let signing_key = match opts.sign {
        true => Some(
            keys.signing_key
                .as_ref()
                .and_then(|k| k.private.as_ref())
                .ok_or_else(|| PakError::crypto("signing requested but no private key is set"))?,
        ),
        false => None,
    };
    let deletes = entries.iter().filter(|e| e.is_delete_record).count();
    if deletes > 0 && opts.version < VERSION_DELETE_RECORDS {
        return Err(PakError::config(format!(
            "archive version {} cannot hold delete records",
            opts.version
        )));
    }

    let mount_point = match &opts.mount_point {
        Some(m) => paths::as_directory(m),
        None => paths::common_root(entries.iter().map(|e| e.dest.as_str())),
    };
    info!(
        out = %out.display(),
        files = entries.len() - deletes,
        deletes,
        mount = %mount_point,
        "building archive"
    );

    let pool = WorkerPool::new(opts.threads)?;
    let compressor = BlockCompressor::new(&opts.compression, &pool, cache);
    let dir = out
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let tmp = tempfile::Builder::new()
        .prefix(".pak-")
        .suffix(".tmp")
        .tempfile_in(dir)?;

    let file = tmp.as_file().try_clone()?;
    let mut sink = ArchiveSink {
        out: CountingWriter::new(SigningWriter::new(BufWriter::new(file))),
        trailer: Trailer {
            version: opts.version,
            encryption_key_guid: key.map(|k| k.guid).unwrap_or_default(),
            ..Default::default()
        },
        index: PakIndex {
            mount_point,
            entries: Vec::with_capacity(entries.len()),
        },
        stats: BuildStats::default(),
    };

    let files: Vec<&BuildEntry> = entries.iter().filter(|e| !e.is_delete_record).collect();
    let prepare_batch = |batch: &[&BuildEntry]| -> Result<(Vec<PreparedEntry>, Duration)> {
        let started = Instant::now();
        let prepared = batch
            .iter()
            .map(|e| prepare(e, &compressor, key, cache.is_some()))
            .collect::<Result<Vec<_>>>()?;
        Ok((prepared, started.elapsed()))
    };

    debug!(
        async_compression = opts.async_compression,
        threads = pool.threads(),
        "compressing and writing entries"
    );
    let batch = opts.batch_files.max(1);
    if opts.async_compression && files.len() > batch {
        let batches: Vec<&[&BuildEntry]> = files.chunks(batch).collect();
        let (mut pending, spent) = prepare_batch(batches[0])?;
        sink.stats.compression_time += spent;
        for k in 0..batches.len() {
            let current = std::mem::take(&mut pending);
            let next = batches.get(k + 1).copied();
            let first = k * batch;
            let sink_ref = &mut sink;
            let files_ref = &files;
            let (written, prepared) = pool.install(|| {
                rayon::join(
                    move || sink_ref.write_batch(files_ref, first, current, opts),
                    || next.map(prepare_batch).transpose(),
                )
            });
            written?;
            if let Some((p, spent)) = prepared? {
                pending = p;
                sink.stats.compression_time += spent;
            }
        }
    } else {
        for (i, e) in files.iter().enumerate() {
            let (mut p, spent) = prepare_batch(std::slice::from_ref(e))?;
            sink.stats.compression_time += spent;
            if let Some(prepared) = p.pop() {
                sink.write_entry(&files, i, prepared, opts)?;
            }
        }
    }
    pool.release_scratch();

    for e in entries.iter().filter(|e| e.is_delete_record) {
        let mut entry = PakEntry::default();
        entry.set_delete_record(true);
        let filename = paths::replace_prefix_ignore_case(&e.dest, &sink.index.mount_point, "");
        debug!(file = %filename, "delete record");
        sink.index.entries.push(IndexEntry { filename, entry });
        sink.stats.delete_records += 1;
    }

    info!(entries = sink.index.entries.len(), "writing index");
    let ArchiveSink {
        out: mut w,
        mut trailer,
        index,
        mut stats,
    } = sink;
    let mut index_bytes = Vec::new();
    index.write_to(&mut index_bytes)?;
    if opts.encrypt_index {
        if let Some(k) = key {
            pad_deterministic(&mut index_bytes, AES_BLOCK);
            k.key.encrypt_in_place(&mut index_bytes)?;
        }
    }
    trailer.index_offset = w.position();
    trailer.index_size = index_bytes.len() as u64;
    trailer.index_hash = hash128(&index_bytes);
    trailer.encrypted_index = opts.encrypt_index;
    w.write_all(&index_bytes)?;
    trailer.write_to(&mut w)?;
    stats.index_bytes = index_bytes.len() as u64;

    let (buffered, chunk_hashes) = w.into_inner().finish();
    let file = buffered.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    tmp.persist(out).map_err(|e| e.error)?;

    if let Some(private) = signing_key {
        let sig = SignatureFile::sign(chunk_hashes, private)?;
        let mut sig_tmp = tempfile::Builder::new()
            .prefix(".sig-")
            .suffix(".tmp")
            .tempfile_in(dir)?;
        let mut sw = BufWriter::new(sig_tmp.as_file_mut());
        sig.write_to(&mut sw)?;
        sw.flush()?;
        drop(sw);
        let sig_path = sig_path_for(out);
        sig_tmp.persist(&sig_path).map_err(|e| e.error)?;
        info!(path = %sig_path.display(), "wrote signature");
    }

    info!(
        files = stats.files,
        bytes_in = stats.bytes_in,
        bytes_out = stats.bytes_out,
        "archive sealed"
    );
    Ok((index, stats))
}

fn prepare(
    e: &BuildEntry,
    compressor: &BlockCompressor<'_>,
    key: Option<&NamedKey>,
    caching: bool,
) -> Result<PreparedEntry> {
    let bytes = fs::read(&e.source).map_err(|err| {
        PakError::Io(std::io::Error::new(
            err.kind(),
            format!("{}: {err}", e.source),
        ))
    })?;
    let compress = e.needs_compression && !bytes.is_empty();
    let mut buf = compressor.compress_file(&e.dest, bytes, compress, e.needs_encryption)?;
    let cache_hit = match (caching && compress, buf.from_cache) {
        (false, _) => None,
        (true, hit) => Some(hit),
    };
    let hash = hash128(&buf.data);
    if e.needs_encryption {
        if let Some(k) = key {
            k.key.encrypt_in_place(&mut buf.data)?;
        }
    }
    Ok(PreparedEntry {
        buf,
        hash,
        encrypted: e.needs_encryption,
        cache_hit,
    })
}

/// `.uasset` immediately followed by its `.uexp`.
fn is_pair(asset: &str, uexp: &str) -> bool {
    paths::has_extension(asset, "uasset")
        && paths::is_uexp(uexp)
        && paths::base_filename(asset).eq_ignore_ascii_case(paths::base_filename(uexp))
}

impl ArchiveSink {
    fn write_batch(
        &mut self,
        files: &[&BuildEntry],
        first: usize,
        prepared: Vec<PreparedEntry>,
        opts: &BuildOptions,
    ) -> Result<()> {
        for (k, p) in prepared.into_iter().enumerate() {
            self.write_entry(files, first + k, p, opts)?;
        }
        Ok(())
    }

    fn write_entry(
        &mut self,
        files: &[&BuildEntry],
        i: usize,
        p: PreparedEntry,
        opts: &BuildOptions,
    ) -> Result<()> {
        let e = files[i];
        let compressed = p.buf.method.is_some();
        let header_len = PakEntry::serialized_size_for(compressed, p.buf.blocks.len());
        let total = header_len + p.buf.data.len() as u64;
        let uexp_of_pair = i > 0 && is_pair(&files[i - 1].dest, &e.dest);
        let next_uexp = files.get(i + 1).filter(|n| is_pair(&e.dest, &n.dest));

        let pos = self.out.position();
        let mut target = pos;
        let bs = opts.fs_block_size;
        if bs > 0 && total <= bs && !uexp_of_pair && target % bs + total > bs {
            target = align_up(target, bs);
        }
        let mapped_bulk = opts.align_for_memory_mapping > 0 && paths::is_mapped_bulk(&e.dest);
        if mapped_bulk && !p.encrypted {
            target = align_up(target + header_len, opts.align_for_memory_mapping) - header_len;
        } else if opts.patch_padding_align > 0 && !mapped_bulk && !uexp_of_pair {
            let align = opts.patch_padding_align;
            let in_block = target % align;
            let mut pad = total >= align || in_block + total > align;
            if let Some(uexp) = next_uexp {
                let guess = fs::metadata(&uexp.source).map(|m| m.len() / 2).unwrap_or(0);
                pad |= in_block + total + guess > align;
            }
            if pad {
                target = align_up(target, align);
            }
        }
        if target > pos {
            trace!(file = %e.dest, from = pos, to = target, "padding");
            self.out.write_zeros(target - pos)?;
            self.stats.padding_bytes += target - pos;
        }

        let compression_method_index = match p.buf.method {
            Some(m) => self.trailer.format_index(m)?,
            None => 0,
        };
        let mut entry = PakEntry {
            offset: 0,
            size: p.buf.data.len() as u64,
            uncompressed_size: p.buf.uncompressed_size,
            compression_method_index,
            blocks: p
                .buf
                .blocks
                .iter()
                .map(|b| crate::container::entry::CompressionBlock {
                    start: b.start + header_len,
                    end: b.end + header_len,
                })
                .collect(),
            compression_block_size: if compressed { p.buf.block_size } else { 0 },
            hash: p.hash,
            flags: 0,
        };
        entry.set_encrypted(p.encrypted);
        entry.write_to(&mut self.out)?;
        self.out.write_all(&p.buf.data)?;
        entry.offset = target;

        let filename = paths::replace_prefix_ignore_case(&e.dest, &self.index.mount_point, "");
        debug!(
            file = %filename,
            offset = target,
            size = entry.size,
            uncompressed = entry.uncompressed_size,
            method = self.trailer.method_name(compression_method_index),
            "added"
        );

        let s = &mut self.stats;
        s.files += 1;
        s.bytes_in += entry.uncompressed_size;
        s.bytes_out += entry.size;
        s.header_bytes += header_len;
        if let Some(m) = p.buf.method {
            s.compressed_files += 1;
            *s.files_per_format.entry(m.name().to_string()).or_default() += 1;
        }
        match p.cache_hit {
            Some(true) => s.cache_hits += 1,
            Some(false) => s.cache_misses += 1,
            None => {}
        }
        self.index.entries.push(IndexEntry { filename, entry });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CompressionMethod;
    use crate::container::trailer::read_trailer_at_eof;
    use std::io::{Read, Seek, SeekFrom};

    fn entry(dir: &Path, name: &str, bytes: &[u8]) -> BuildEntry {
        let p = dir.join(name);
        fs::write(&p, bytes).unwrap();
        BuildEntry::new(p.to_string_lossy(), format!("../../../Game/{name}"))
    }

    #[test]
    fn writes_entries_index_and_trailer() {
        let td = tempfile::tempdir().unwrap();
        let mut c = entry(td.path(), "big.txt", &vec![b'z'; 200_000]);
        c.needs_compression = true;
        let entries = vec![
            entry(td.path(), "a.txt", b"a"),
            c,
            BuildEntry::delete_record("../../../Game/old.txt"),
        ];
        let out = td.path().join("out.pak");
        let (index, stats) =
            build(&entries, &KeyChain::default(), &BuildOptions::default(), &out, None).unwrap();

        assert_eq!(index.mount_point, "../../../Game/");
        assert_eq!(index.entries.len(), 3);
        assert_eq!(stats.files, 2);
        assert_eq!(stats.delete_records, 1);
        assert_eq!(stats.compressed_files, 1);
        assert!(index.entries[2].entry.is_delete_record());
        assert_eq!(index.entries[0].entry.offset, 0);

        let mut f = File::open(&out).unwrap();
        let (trailer, len) = read_trailer_at_eof(&mut f).unwrap();
        assert_eq!(trailer.method_at(1).unwrap(), Some(CompressionMethod::Zlib));
        f.seek(SeekFrom::Start(trailer.index_offset)).unwrap();
        let mut raw = vec![0u8; trailer.index_size as usize];
        f.read_exact(&mut raw).unwrap();
        assert_eq!(hash128(&raw), trailer.index_hash);
        assert_eq!(PakIndex::read_from(&raw).unwrap(), index);
        assert!(trailer.index_offset + trailer.index_size < len);
        // nothing but the archive is left behind
        assert_eq!(fs::read_dir(td.path()).unwrap().count(), 3);
    }

    #[test]
    fn encryption_without_key_fails_and_leaves_nothing() {
        let td = tempfile::tempdir().unwrap();
        let mut e = entry(td.path(), "a.txt", b"secret");
        e.needs_encryption = true;
        let out = td.path().join("out.pak");
        let err = build(&[e], &KeyChain::default(), &BuildOptions::default(), &out, None);
        assert!(matches!(err, Err(PakError::Crypto(_))));
        assert!(!out.exists());
    }

    #[test]
    fn legacy_version_rejects_delete_records() {
        let td = tempfile::tempdir().unwrap();
        let opts = BuildOptions {
            version: crate::container::trailer::VERSION_LEGACY,
            ..Default::default()
        };
        let out = td.path().join("out.pak");
        let err = build(
            &[BuildEntry::delete_record("../../../x")],
            &KeyChain::default(),
            &opts,
            &out,
            None,
        );
        assert!(matches!(err, Err(PakError::Config(_))));
    }

    #[test]
    fn alignment_rules_place_payloads() {
        let td = tempfile::tempdir().unwrap();
        let entries = vec![
            entry(td.path(), "a.txt", &[1u8; 100]),
            entry(td.path(), "b.m.ubulk", &[2u8; 5000]),
            entry(td.path(), "c.txt", &[3u8; 3000]),
        ];
        let out = td.path().join("out.pak");
        let opts = BuildOptions {
            align_for_memory_mapping: 4096,
            patch_padding_align: 2048,
            ..Default::default()
        };
        let (index, stats) = build(&entries, &KeyChain::default(), &opts, &out, None).unwrap();
        let header = PakEntry::serialized_size_for(false, 0);
        let b = &index.entries[1].entry;
        assert_eq!((b.offset + header) % 4096, 0);
        let c = &index.entries[2].entry;
        assert_eq!(c.offset % 2048, 0);
        assert!(stats.padding_bytes > 0);
    }

    #[test]
    fn encrypted_mapped_bulk_skips_both_alignments() {
        let td = tempfile::tempdir().unwrap();
        let mut bulk = entry(td.path(), "b.m.ubulk", &[2u8; 5000]);
        bulk.needs_encryption = true;
        let entries = vec![entry(td.path(), "a.txt", &[1u8; 100]), bulk];
        let out = td.path().join("out.pak");
        let opts = BuildOptions {
            align_for_memory_mapping: 4096,
            patch_padding_align: 2048,
            ..Default::default()
        };
        let keys = KeyChain::with_master_key([5u8; 32]);
        let (index, stats) = build(&entries, &keys, &opts, &out, None).unwrap();
        let header = PakEntry::serialized_size_for(false, 0);
        assert_eq!(index.entries[1].entry.offset, header + 100);
        assert_eq!(stats.padding_bytes, 0);
    }

    #[test]
    fn pair_is_not_split_by_block_rule() {
        assert!(is_pair("G/hero.uasset", "G/HERO.uexp"));
        assert!(!is_pair("G/hero.umap", "G/hero.uexp"));
        assert!(!is_pair("G/hero.uasset", "G/other.uexp"));
    }

    #[test]
    fn async_batches_match_sequential_output() {
        let td = tempfile::tempdir().unwrap();
        let entries: Vec<BuildEntry> = (0..10)
            .map(|i| {
                let mut e = entry(td.path(), &format!("f{i}.txt"), &vec![i as u8; 30_000 + i * 7]);
                e.needs_compression = i % 2 == 0;
                e
            })
            .collect();
        let seq = td.path().join("seq.pak");
        let par = td.path().join("par.pak");
        build(&entries, &KeyChain::default(), &BuildOptions::default(), &seq, None).unwrap();
        let opts = BuildOptions {
            async_compression: true,
            batch_files: 3,
            ..Default::default()
        };
        build(&entries, &KeyChain::default(), &opts, &par, None).unwrap();
        assert_eq!(fs::read(seq).unwrap(), fs::read(par).unwrap());
    }
}
