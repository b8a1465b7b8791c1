use crate::error::Result;
use std::io::{Read, Write};

/// Block compression formats an archive can reference from its format table.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CompressionMethod {
    Zlib,
    Zstd,
    Lz4,
}

impl CompressionMethod {
    pub const ALL: [CompressionMethod; 3] = [
        CompressionMethod::Zlib,
        CompressionMethod::Zstd,
        CompressionMethod::Lz4,
    ];

    pub fn name(self) -> &'static str {
        match self {
            CompressionMethod::Zlib => "Zlib",
            CompressionMethod::Zstd => "Zstd",
            CompressionMethod::Lz4 => "Lz4",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|m| m.name().eq_ignore_ascii_case(name.trim()))
    }
}

impl std::fmt::Display for CompressionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

pub trait Compressor: Send + Sync {
    fn method(&self) -> CompressionMethod;
    fn compress(&self, src: &mut dyn Read, dst: &mut dyn Write, level: i32) -> Result<u64>;
    fn decompress(&self, src: &mut dyn Read, dst: &mut dyn Write) -> Result<u64>;
    /// Worst-case compressed size of `len` input bytes.
    fn compress_bound(&self, len: usize) -> usize;
}

pub mod lz4c;
pub mod zlibc;
pub mod zstdc;

static ZLIB: zlibc::ZlibCompressor = zlibc::ZlibCompressor;
static ZSTD: zstdc::ZstdCompressor = zstdc::ZstdCompressor;
static LZ4: lz4c::Lz4Compressor = lz4c::Lz4Compressor;

pub fn compressor_for(method: CompressionMethod) -> &'static dyn Compressor {
    match method {
        CompressionMethod::Zlib => &ZLIB,
        CompressionMethod::Zstd => &ZSTD,
        CompressionMethod::Lz4 => &LZ4,
    }
}

/// Parses a comma separated format list and appends the Zlib fallback when
/// it is not already present.
pub fn parse_format_list(list: &str) -> Result<Vec<CompressionMethod>> {
    let mut out = Vec::new();
    for name in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let m = CompressionMethod::from_name(name).ok_or_else(|| {
            crate::error::PakError::config(format!("unknown compression format: {name}"))
        })?;
        if !out.contains(&m) {
            out.push(m);
        }
    }
    if !out.contains(&CompressionMethod::Zlib) {
        out.push(CompressionMethod::Zlib);
    }
    Ok(out)
}
