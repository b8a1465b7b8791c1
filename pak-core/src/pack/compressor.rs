//! Per-file block compression with format fallback.

use super::pool::WorkerPool;
use crate::codec::{CompressionMethod, compressor_for};
use crate::container::entry::CompressionBlock;
use crate::crypto::aes::{AES_BLOCK, pad_deterministic};
use crate::error::Result;
use crate::hash::content::{Hash128, hash128};
use crate::util::paths;
use rayon::prelude::*;
use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, trace, warn};

pub const DEFAULT_BLOCK_SIZE: u32 = 64 * 1024;

#[derive(Clone, Debug)]
pub struct CompressionOptions {
    /// Candidate formats in priority order.
    pub formats: Vec<CompressionMethod>,
    pub block_size: u32,
    /// Codec level; 0 or below picks each codec's default.
    pub level: i32,
    /// A result is rejected when it is above this ratio and also saves less
    /// than `min_saved_bytes`.
    pub ratio_limit: f64,
    pub min_saved_bytes: u64,
    /// Lower-case extension (no dot) to a format that is always used.
    pub forced_formats: HashMap<String, CompressionMethod>,
}

impl Default for CompressionOptions {
    fn default() -> Self {
        Self {
            formats: vec![CompressionMethod::Zlib],
            block_size: DEFAULT_BLOCK_SIZE,
            level: 0,
            ratio_limit: 0.9,
            min_saved_bytes: 64 * 1024,
            forced_formats: HashMap::new(),
        }
    }
}

impl CompressionOptions {
    pub fn force_format_for(&mut self, extensions: &str, method: CompressionMethod) {
        for ext in extensions.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            self.forced_formats
                .insert(ext.trim_start_matches('.').to_ascii_lowercase(), method);
        }
    }

    fn accepts(&self, original: u64, compressed: u64) -> bool {
        let ratio = compressed as f64 / original as f64;
        let saved = original.saturating_sub(compressed);
        !(ratio > self.ratio_limit && saved < self.min_saved_bytes)
    }
}

/// Stored form of one file's payload, before encryption.
#[derive(Clone, Debug, Default)]
pub struct CompressedBuffer {
    /// `None` when stored uncompressed.
    pub method: Option<CompressionMethod>,
    pub data: Vec<u8>,
    /// Block ranges relative to the start of `data`.
    pub blocks: Vec<CompressionBlock>,
    pub uncompressed_size: u64,
    pub block_size: u32,
    pub from_cache: bool,
}

impl CompressedBuffer {
    pub fn stored(bytes: Vec<u8>, pad_for_encryption: bool) -> Self {
        let uncompressed_size = bytes.len() as u64;
        let mut data = bytes;
        if pad_for_encryption {
            pad_deterministic(&mut data, AES_BLOCK);
        }
        Self {
            uncompressed_size,
            data,
            ..Default::default()
        }
    }

    /// Concatenates compressed blocks, padding each to the cipher block
    /// when the entry will be encrypted.
    fn assemble(
        method: CompressionMethod,
        blocks: &[Vec<u8>],
        uncompressed_size: u64,
        block_size: u32,
        pad_for_encryption: bool,
    ) -> Self {
        let mut data = Vec::with_capacity(blocks.iter().map(Vec::len).sum::<usize>());
        let mut ranges = Vec::with_capacity(blocks.len());
        for b in blocks {
            let start = data.len() as u64;
            data.extend_from_slice(b);
            ranges.push(CompressionBlock {
                start,
                end: data.len() as u64,
            });
            if pad_for_encryption {
                pad_deterministic(&mut data, AES_BLOCK);
            }
        }
        Self {
            method: Some(method),
            data,
            blocks: ranges,
            uncompressed_size,
            block_size,
            from_cache: false,
        }
    }

    /// Compressed bytes without encryption padding.
    pub fn compressed_len(&self) -> u64 {
        match self.method {
            Some(_) => self.blocks.iter().map(|b| b.len()).sum(),
            None => self.uncompressed_size,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub method: CompressionMethod,
    pub block_size: u32,
    pub level: i32,
    pub content: Hash128,
}

/// Content-addressed store of already compressed block lists.
pub trait CompressionCache: Send + Sync {
    fn get(&self, key: &CacheKey) -> Option<Vec<Vec<u8>>>;
    fn put(&self, key: &CacheKey, blocks: &[Vec<u8>]);
}

#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<CacheKey, Vec<Vec<u8>>>>,
}

impl MemoryCache {
    pub fn len(&self) -> usize {
        self.entries.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CompressionCache for MemoryCache {
    fn get(&self, key: &CacheKey) -> Option<Vec<Vec<u8>>> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    fn put(&self, key: &CacheKey, blocks: &[Vec<u8>]) {
        if let Ok(mut m) = self.entries.lock() {
            m.insert(*key, blocks.to_vec());
        }
    }
}

/// One file per key under `root`. Failures to read or write are logged and
/// treated as misses.
pub struct DirCache {
    root: PathBuf,
}

impl DirCache {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.root.join(format!(
            "{}-{}-{}-{}.blocks",
            hex::encode(key.content),
            key.method.name().to_ascii_lowercase(),
            key.block_size,
            key.level
        ))
    }

    fn read_blocks(&self, key: &CacheKey) -> std::io::Result<Vec<Vec<u8>>> {
        let bytes = fs::read(self.path_for(key))?;
        let mut r = &bytes[..];
        let count = read_len(&mut r)?;
        let mut blocks = Vec::with_capacity(count.min(1 << 16));
        for _ in 0..count {
            let n = read_len(&mut r)?;
            let mut b = vec![0u8; n];
            r.read_exact(&mut b)?;
            blocks.push(b);
        }
        Ok(blocks)
    }

    fn write_blocks(&self, key: &CacheKey, blocks: &[Vec<u8>]) -> std::io::Result<()> {
        let mut tmp = tempfile::NamedTempFile::new_in(&self.root)?;
        tmp.write_all(&(blocks.len() as u32).to_le_bytes())?;
        for b in blocks {
            tmp.write_all(&(b.len() as u32).to_le_bytes())?;
            tmp.write_all(b)?;
        }
        tmp.persist(self.path_for(key)).map_err(|e| e.error)?;
        Ok(())
    }
}

fn read_len(r: &mut &[u8]) -> std::io::Result<usize> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b) as usize)
}

impl CompressionCache for DirCache {
    fn get(&self, key: &CacheKey) -> Option<Vec<Vec<u8>>> {
        match self.read_blocks(key) {
            Ok(b) => Some(b),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(error = %e, "unreadable compression cache entry");
                None
            }
        }
    }

    fn put(&self, key: &CacheKey, blocks: &[Vec<u8>]) {
        if let Err(e) = self.write_blocks(key, blocks) {
            warn!(error = %e, "failed to store compression cache entry");
        }
    }
}

pub struct BlockCompressor<'a> {
    opts: &'a CompressionOptions,
    pool: &'a WorkerPool,
    cache: Option<&'a dyn CompressionCache>,
}

impl<'a> BlockCompressor<'a> {
    pub fn new(
        opts: &'a CompressionOptions,
        pool: &'a WorkerPool,
        cache: Option<&'a dyn CompressionCache>,
    ) -> Self {
        Self { opts, pool, cache }
    }

    /// Picks the stored form of one file: the first acceptable candidate
    /// format, or the raw bytes.
    pub fn compress_file(
        &self,
        dest: &str,
        bytes: Vec<u8>,
        compress: bool,
        pad_for_encryption: bool,
    ) -> Result<CompressedBuffer> {
        if !compress || bytes.is_empty() {
            return Ok(CompressedBuffer::stored(bytes, pad_for_encryption));
        }
        let forced = self
            .opts
            .forced_formats
            .get(&paths::extension(dest).to_ascii_lowercase())
            .copied();
        let candidates = forced.into_iter().chain(
            self.opts
                .formats
                .iter()
                .copied()
                .filter(|m| Some(*m) != forced),
        );
        let original = bytes.len() as u64;
        for method in candidates {
            let buf = self.compress(&bytes, method, pad_for_encryption)?;
            let compressed = buf.compressed_len();
            if Some(method) == forced || self.opts.accepts(original, compressed) {
                trace!(dest, %method, original, compressed, "compressed");
                return Ok(buf);
            }
            debug!(dest, %method, original, compressed, "compression rejected");
        }
        debug!(dest, "storing uncompressed");
        Ok(CompressedBuffer::stored(bytes, pad_for_encryption))
    }

    /// Compresses `bytes` as independent blocks of the configured size.
    pub fn compress(
        &self,
        bytes: &[u8],
        method: CompressionMethod,
        pad_for_encryption: bool,
    ) -> Result<CompressedBuffer> {
        let key = CacheKey {
            method,
            block_size: self.opts.block_size,
            level: self.opts.level,
            content: hash128(bytes),
        };
        if let Some(blocks) = self.cache.and_then(|c| c.get(&key)) {
            let mut buf = CompressedBuffer::assemble(
                method,
                &blocks,
                bytes.len() as u64,
                self.opts.block_size,
                pad_for_encryption,
            );
            buf.from_cache = true;
            return Ok(buf);
        }

        let codec = compressor_for(method);
        let level = self.opts.level;
        let block_size = self.opts.block_size.max(1) as usize;
        let pool = self.pool;
        let blocks: Vec<Vec<u8>> = pool.install(|| {
            bytes
                .par_chunks(block_size)
                .map(|chunk| {
                    pool.with_scratch(|scratch| -> Result<Vec<u8>> {
                        codec.compress(&mut &chunk[..], scratch, level)?;
                        Ok(scratch.clone())
                    })
                })
                .collect::<Result<Vec<_>>>()
        })?;
        if let Some(c) = self.cache {
            c.put(&key, &blocks);
        }
        Ok(CompressedBuffer::assemble(
            method,
            &blocks,
            bytes.len() as u64,
            self.opts.block_size,
            pad_for_encryption,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compressible(n: usize) -> Vec<u8> {
        (0..n).map(|i| (i / 100) as u8).collect()
    }

    fn noise(n: usize) -> Vec<u8> {
        let mut x = 0x9E37_79B9u32;
        (0..n)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 17;
                x ^= x << 5;
                x as u8
            })
            .collect()
    }

    #[test]
    fn acceptance_needs_ratio_or_savings() {
        let o = CompressionOptions::default();
        assert!(o.accepts(1000, 800));
        assert!(!o.accepts(1000, 950));
        // poor ratio but large absolute savings
        assert!(o.accepts(10_000_000, 9_500_000));
        assert!(!o.accepts(100, 120));
    }

    #[test]
    fn splits_into_blocks_and_pads_for_encryption() {
        let pool = WorkerPool::new(Some(2)).unwrap();
        let opts = CompressionOptions {
            block_size: 4096,
            ..Default::default()
        };
        let c = BlockCompressor::new(&opts, &pool, None);
        let input = compressible(10_000);
        let buf = c.compress(&input, CompressionMethod::Zlib, true).unwrap();
        assert_eq!(buf.blocks.len(), 3);
        for b in &buf.blocks {
            assert_eq!(b.start % AES_BLOCK as u64, 0);
        }
        assert_eq!(buf.data.len() % AES_BLOCK, 0);

        let mut restored = Vec::new();
        for b in &buf.blocks {
            let mut block = &buf.data[b.start as usize..b.end as usize];
            compressor_for(CompressionMethod::Zlib)
                .decompress(&mut block, &mut restored)
                .unwrap();
        }
        assert_eq!(restored, input);
    }

    #[test]
    fn incompressible_data_falls_back_to_stored_unless_forced() {
        let pool = WorkerPool::new(Some(1)).unwrap();
        let mut opts = CompressionOptions::default();
        let c = BlockCompressor::new(&opts, &pool, None);
        let buf = c.compress_file("x.bin", noise(8192), true, false).unwrap();
        assert!(buf.method.is_none());
        assert_eq!(buf.data.len(), 8192);

        opts.force_format_for("bin", CompressionMethod::Zlib);
        let c = BlockCompressor::new(&opts, &pool, None);
        let buf = c.compress_file("x.bin", noise(8192), true, false).unwrap();
        assert_eq!(buf.method, Some(CompressionMethod::Zlib));

        let empty = c.compress_file("x.bin", Vec::new(), true, false).unwrap();
        assert!(empty.method.is_none());
    }

    #[test]
    fn caches_hit_on_identical_content() {
        let pool = WorkerPool::new(Some(1)).unwrap();
        let opts = CompressionOptions::default();
        let td = tempfile::tempdir().unwrap();
        let dir = DirCache::new(td.path()).unwrap();
        let mem = MemoryCache::default();
        for cache in [&dir as &dyn CompressionCache, &mem] {
            let c = BlockCompressor::new(&opts, &pool, Some(cache));
            let first = c.compress(&compressible(70_000), CompressionMethod::Zstd, false).unwrap();
            let second = c.compress(&compressible(70_000), CompressionMethod::Zstd, false).unwrap();
            assert!(!first.from_cache);
            assert!(second.from_cache);
            assert_eq!(first.data, second.data);
            assert_eq!(first.blocks, second.blocks);
        }
        assert_eq!(mem.len(), 1);
    }
}
