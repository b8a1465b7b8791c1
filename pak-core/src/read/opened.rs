use crate::codec::compressor_for;
use crate::container::entry::PakEntry;
use crate::container::index::{IndexEntry, PakIndex};
use crate::container::trailer::{TRAILER_LEN, Trailer, read_trailer_at_eof};
use crate::crypto::aes::{AES_BLOCK, AesKey};
use crate::crypto::keychain::KeyChain;
use crate::crypto::signing::{SignatureFile, compute_chunk_hashes, sig_path_for};
use crate::error::{PakError, Result};
use crate::hash::content::{Hash128, hash128, truncate};
use crate::util::size::align_up;
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

const COPY_CHUNK: usize = 64 * 1024;

/// An archive opened for reading: trailer and index are loaded and checked,
/// payloads are read on demand.
pub struct PakReader {
    pub path: PathBuf,
    pub trailer: Trailer,
    pub index: PakIndex,
    pub file_len: u64,
    key: Option<AesKey>,
    f: Arc<Mutex<File>>,
}

/// Maps truncation and decode failures onto `PakError::Format`.
pub(crate) fn corrupt(e: std::io::Error) -> PakError {
    match e.kind() {
        ErrorKind::InvalidData | ErrorKind::UnexpectedEof => PakError::Format(e.to_string()),
        _ => PakError::Io(e),
    }
}

impl PakReader {
    pub fn open(path: &Path, keys: &KeyChain) -> Result<Self> {
        let mut f = File::open(path)?;
        let (trailer, file_len) = read_trailer_at_eof(&mut f).map_err(corrupt)?;
        let index_end = trailer.index_offset.saturating_add(trailer.index_size);
        if index_end.saturating_add(TRAILER_LEN) > file_len {
            return Err(PakError::format(format!(
                "index at {}+{} runs past the end of a {file_len} byte archive",
                trailer.index_offset, trailer.index_size
            )));
        }

        f.seek(SeekFrom::Start(trailer.index_offset))?;
        let mut raw = vec![0u8; trailer.index_size as usize];
        f.read_exact(&mut raw).map_err(corrupt)?;
        if hash128(&raw) != trailer.index_hash {
            return Err(PakError::format("index hash mismatch"));
        }

        let key = keys
            .key_for(&trailer.encryption_key_guid)
            .or_else(|| keys.master_key())
            .map(|k| k.key.clone());
        if trailer.encrypted_index {
            let k = key.as_ref().ok_or_else(|| {
                PakError::crypto(format!(
                    "index is encrypted with key {} which is not in the key chain",
                    trailer.encryption_key_guid
                ))
            })?;
            k.decrypt_in_place(&mut raw)?;
        }
        let index = PakIndex::read_from(&raw).map_err(corrupt)?;

        for ie in index.entries.iter().filter(|e| !e.entry.is_delete_record()) {
            let end = ie
                .entry
                .offset
                .saturating_add(ie.entry.serialized_size())
                .saturating_add(ie.entry.size);
            if end > trailer.index_offset {
                return Err(PakError::format(format!(
                    "entry {} extends into the index",
                    ie.filename
                )));
            }
        }
        info!(
            path = %path.display(),
            entries = index.entries.len(),
            version = trailer.version,
            "opened archive"
        );
        Ok(Self {
            path: path.to_path_buf(),
            trailer,
            index,
            file_len,
            key,
            f: Arc::new(Mutex::new(f)),
        })
    }

    pub fn mount_point(&self) -> &str {
        &self.index.mount_point
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.index.entries
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut f = self
            .f
            .lock()
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        f.seek(SeekFrom::Start(offset))?;
        f.read_exact(buf).map_err(corrupt)
    }

    fn key_for_entry(&self, entry: &PakEntry) -> Result<Option<&AesKey>> {
        if !entry.is_encrypted() {
            return Ok(None);
        }
        self.key.as_ref().map(Some).ok_or_else(|| {
            PakError::crypto(format!(
                "entry is encrypted with key {} which is not in the key chain",
                self.trailer.encryption_key_guid
            ))
        })
    }

    /// Re-reads the inline header of `entry` and compares it with the index.
    pub fn check_header(&self, entry: &PakEntry) -> Result<()> {
        let mut raw = vec![0u8; entry.serialized_size() as usize];
        self.read_at(entry.offset, &mut raw)?;
        let inline = PakEntry::read_from(&raw[..]).map_err(corrupt)?;
        if !inline.same_header(entry) {
            return Err(PakError::format("serialized header mismatch"));
        }
        Ok(())
    }

    /// Stored payload, decrypted but still compressed and padded. This is
    /// what the entry hash covers.
    pub fn stored_bytes(&self, entry: &PakEntry) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; entry.size as usize];
        self.read_at(entry.offset + entry.serialized_size(), &mut buf)?;
        if let Some(k) = self.key_for_entry(entry)? {
            k.decrypt_in_place(&mut buf)?;
        }
        Ok(buf)
    }

    /// Writes the uncompressed content of `entry` to `out`.
    pub fn read_entry(&self, entry: &PakEntry, out: &mut dyn Write) -> Result<u64> {
        if entry.is_delete_record() {
            return Err(PakError::format("delete records have no content"));
        }
        self.check_header(entry)?;
        let key = self.key_for_entry(entry)?;
        let payload = entry.offset + entry.serialized_size();

        let Some(method) = self.trailer.method_at(entry.compression_method_index)? else {
            let mut buf = vec![0u8; COPY_CHUNK];
            let mut pos = 0u64;
            let mut remaining = entry.uncompressed_size;
            while remaining > 0 {
                let want = (remaining as usize).min(COPY_CHUNK);
                let read = match key {
                    Some(_) => align_up(want as u64, AES_BLOCK as u64) as usize,
                    None => want,
                };
                self.read_at(payload + pos, &mut buf[..read])?;
                if let Some(k) = key {
                    k.decrypt_in_place(&mut buf[..read])?;
                }
                out.write_all(&buf[..want])?;
                pos += read as u64;
                remaining -= want as u64;
            }
            return Ok(entry.uncompressed_size);
        };

        let codec = compressor_for(method);
        check_block_layout(entry)?;
        let block_size = (entry.compression_block_size as u64).min(entry.uncompressed_size);
        let largest = entry.blocks.iter().map(|b| b.len()).max().unwrap_or(0) as usize;
        let bound = codec.compress_bound(block_size as usize);
        let mut compressed = vec![0u8; align_up(bound.max(largest) as u64, AES_BLOCK as u64) as usize];
        let mut plain: Vec<u8> = Vec::with_capacity(block_size as usize);
        let mut written = 0u64;
        for (i, b) in entry.blocks.iter().enumerate() {
            let len = b.len() as usize;
            let read = match key {
                Some(_) => align_up(len as u64, AES_BLOCK as u64) as usize,
                None => len,
            };
            self.read_at(entry.offset + b.start, &mut compressed[..read])?;
            if let Some(k) = key {
                k.decrypt_in_place(&mut compressed[..read])?;
            }
            plain.clear();
            codec.decompress(&mut &compressed[..len], &mut plain)?;
            let expected = block_size.min(entry.uncompressed_size.saturating_sub(i as u64 * block_size));
            if plain.len() as u64 != expected {
                return Err(PakError::format(format!(
                    "block {i} decompressed to {} bytes, expected {expected}",
                    plain.len()
                )));
            }
            out.write_all(&plain)?;
            written += expected;
        }
        if written != entry.uncompressed_size {
            return Err(PakError::format(format!(
                "entry decompressed to {written} bytes, expected {}",
                entry.uncompressed_size
            )));
        }
        Ok(written)
    }

    pub fn read_to_vec(&self, entry: &PakEntry) -> Result<Vec<u8>> {
        let mut v = Vec::with_capacity(entry.uncompressed_size as usize);
        self.read_entry(entry, &mut v)?;
        Ok(v)
    }

    /// Hash of the uncompressed content, as the patch diff compares it.
    pub fn content_hash(&self, entry: &PakEntry) -> Result<Hash128> {
        let mut hasher = blake3::Hasher::new();
        self.read_entry(entry, &mut hasher)?;
        Ok(truncate(hasher.finalize()))
    }

    /// Checks the `.sig` file next to the archive. Returns `false` when there
    /// is no signature file or no public key to check it with.
    pub fn verify_signature(&self, keys: &KeyChain) -> Result<bool> {
        let sig_path = sig_path_for(&self.path);
        if !sig_path.exists() {
            debug!(path = %sig_path.display(), "no signature file");
            return Ok(false);
        }
        let Some(signing) = &keys.signing_key else {
            warn!(path = %sig_path.display(), "signature present but no public key to check it");
            return Ok(false);
        };
        let sig = SignatureFile::read_from(BufReader::new(File::open(&sig_path)?)).map_err(corrupt)?;
        let actual = compute_chunk_hashes(BufReader::new(File::open(&self.path)?))?;
        sig.verify(&signing.public, &actual)?;
        info!(path = %self.path.display(), chunks = actual.len(), "signature verified");
        Ok(true)
    }
}

/// Rejects block tables that cannot describe `entry`, before any buffer is
/// sized from them.
fn check_block_layout(entry: &PakEntry) -> Result<()> {
    let block_size = entry.compression_block_size as u64;
    if block_size == 0 {
        return Err(PakError::format("compressed entry has a zero block size"));
    }
    let expected_blocks = entry.uncompressed_size.div_ceil(block_size);
    if entry.blocks.len() as u64 != expected_blocks {
        return Err(PakError::format(format!(
            "{} compression blocks for {} bytes at block size {block_size}",
            entry.blocks.len(),
            entry.uncompressed_size
        )));
    }
    let payload_end = entry.serialized_size() + entry.size;
    for (i, b) in entry.blocks.iter().enumerate() {
        if b.end < b.start || b.len() > entry.size || b.end > payload_end {
            return Err(PakError::format(format!(
                "block {i} ({}..{}) lies outside the {} byte payload",
                b.start, b.end, entry.size
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::collector::BuildEntry;
    use crate::pack::writer::{BuildOptions, build};

    fn archive(dir: &Path, compress: bool, encrypt: bool) -> (PathBuf, Vec<u8>, KeyChain) {
        let data: Vec<u8> = (0..150_000u32).map(|i| (i % 251) as u8 ^ (i / 4096) as u8).collect();
        let src = dir.join("data.bin");
        std::fs::write(&src, &data).unwrap();
        let mut e = BuildEntry::new(src.to_string_lossy(), "../../../Game/data.bin");
        e.needs_compression = compress;
        e.needs_encryption = encrypt;
        let keys = KeyChain::with_master_key([7u8; 32]);
        let opts = BuildOptions {
            encrypt_index: encrypt,
            ..Default::default()
        };
        let out = dir.join("t.pak");
        build(&[e], &keys, &opts, &out, None).unwrap();
        (out, data, keys)
    }

    #[test]
    fn reads_back_every_storage_mode() {
        for (compress, encrypt) in [(false, false), (true, false), (false, true), (true, true)] {
            let td = tempfile::tempdir().unwrap();
            let (out, data, keys) = archive(td.path(), compress, encrypt);
            let r = PakReader::open(&out, &keys).unwrap();
            let e = &r.entries()[0].entry;
            assert_eq!(e.is_compressed(), compress);
            assert_eq!(e.is_encrypted(), encrypt);
            assert_eq!(r.read_to_vec(e).unwrap(), data);
            assert_eq!(hash128(&r.stored_bytes(e).unwrap()), e.hash);
        }
    }

    #[test]
    fn encrypted_index_needs_the_key() {
        let td = tempfile::tempdir().unwrap();
        let (out, _, _) = archive(td.path(), true, true);
        let err = PakReader::open(&out, &KeyChain::default());
        assert!(matches!(err, Err(PakError::Crypto(_))));
    }

    #[test]
    fn corrupted_header_is_detected() {
        let td = tempfile::tempdir().unwrap();
        let (out, _, keys) = archive(td.path(), true, false);
        let mut bytes = std::fs::read(&out).unwrap();
        // uncompressed size field of the first inline header
        bytes[16] ^= 0xFF;
        std::fs::write(&out, &bytes).unwrap();
        let r = PakReader::open(&out, &keys).unwrap();
        let err = r.read_to_vec(&r.entries()[0].entry).unwrap_err();
        assert!(err.to_string().contains("serialized header mismatch"));
    }

    #[test]
    fn block_table_is_bounded_by_the_entry() {
        let td = tempfile::tempdir().unwrap();
        let (out, _, keys) = archive(td.path(), true, false);
        let r = PakReader::open(&out, &keys).unwrap();
        let good = r.entries()[0].entry.clone();
        assert!(check_block_layout(&good).is_ok());

        let mut huge = good.clone();
        huge.blocks[0].end = huge.blocks[0].start + (1 << 40);
        assert!(matches!(check_block_layout(&huge), Err(PakError::Format(_))));

        let mut missing = good.clone();
        missing.blocks.pop();
        assert!(matches!(check_block_layout(&missing), Err(PakError::Format(_))));

        let mut zero = good;
        zero.compression_block_size = 0;
        assert!(matches!(check_block_layout(&zero), Err(PakError::Format(_))));
    }

    #[test]
    fn damaged_index_fails_hash_check() {
        let td = tempfile::tempdir().unwrap();
        let (out, _, keys) = archive(td.path(), false, false);
        let mut bytes = std::fs::read(&out).unwrap();
        let at = bytes.len() - TRAILER_LEN as usize - 3;
        bytes[at] ^= 0x55;
        std::fs::write(&out, &bytes).unwrap();
        assert!(matches!(PakReader::open(&out, &keys), Err(PakError::Format(_))));
    }
}
