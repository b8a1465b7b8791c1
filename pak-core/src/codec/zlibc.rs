use super::{CompressionMethod, Compressor};
use crate::error::Result;
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use std::io::{Read, Write};

pub struct ZlibCompressor;

impl Compressor for ZlibCompressor {
    fn method(&self) -> CompressionMethod {
        CompressionMethod::Zlib
    }

    fn compress(&self, src: &mut dyn Read, dst: &mut dyn Write, level: i32) -> Result<u64> {
        let level = if level <= 0 { 6 } else { level.min(9) as u32 };
        let mut enc = ZlibEncoder::new(dst, Compression::new(level));
        let written_uncompressed = std::io::copy(src, &mut enc)?;
        enc.finish()?;
        Ok(written_uncompressed)
    }

    fn decompress(&self, src: &mut dyn Read, dst: &mut dyn Write) -> Result<u64> {
        let mut dec = ZlibDecoder::new(src);
        Ok(std::io::copy(&mut dec, dst)?)
    }

    fn compress_bound(&self, len: usize) -> usize {
        // deflate worst case plus the zlib header and adler trailer
        len + (len >> 12) + (len >> 14) + (len >> 25) + 13 + 6
    }
}
