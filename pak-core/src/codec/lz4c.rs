use super::{CompressionMethod, Compressor};
use crate::error::Result;
use lz4_flex::frame::{FrameDecoder, FrameEncoder};
use std::io::{Read, Write};

pub struct Lz4Compressor;

impl Compressor for Lz4Compressor {
    fn method(&self) -> CompressionMethod {
        CompressionMethod::Lz4
    }

    fn compress(&self, src: &mut dyn Read, dst: &mut dyn Write, _level: i32) -> Result<u64> {
        let mut enc = FrameEncoder::new(dst);
        let written_uncompressed = std::io::copy(src, &mut enc)?;
        enc.finish().map_err(std::io::Error::other)?;
        Ok(written_uncompressed)
    }

    fn decompress(&self, src: &mut dyn Read, dst: &mut dyn Write) -> Result<u64> {
        let mut dec = FrameDecoder::new(src);
        Ok(std::io::copy(&mut dec, dst)?)
    }

    fn compress_bound(&self, len: usize) -> usize {
        // frame header, per 64 KiB block headers, end mark
        lz4_flex::block::get_maximum_output_size(len) + 32 + 4 * (len / 65536 + 1)
    }
}
