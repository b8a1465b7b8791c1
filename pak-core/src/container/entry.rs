use crate::hash::content::{HASH_LEN, Hash128};
use std::io::{Read, Write};

pub const FLAG_ENCRYPTED: u8 = 0x01;
pub const FLAG_DELETED: u8 = 0x02;

/// Byte range of one compressed block, relative to the entry's header offset.
/// `end` excludes any encryption padding.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CompressionBlock {
    pub start: u64,
    pub end: u64,
}

impl CompressionBlock {
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// Per-entry metadata. The same encoding is used for the header in front of
/// each payload (with `offset` zeroed) and for the copy held in the index.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PakEntry {
    /// Physical offset of the header; only meaningful in the index copy.
    pub offset: u64,
    /// Stored payload bytes, encryption padding included.
    pub size: u64,
    pub uncompressed_size: u64,
    /// 0 = stored, otherwise a 1-based slot in the trailer's format table.
    pub compression_method_index: u32,
    pub blocks: Vec<CompressionBlock>,
    pub compression_block_size: u32,
    pub hash: Hash128,
    pub flags: u8,
}

impl PakEntry {
    pub fn is_encrypted(&self) -> bool {
        self.flags & FLAG_ENCRYPTED != 0
    }

    pub fn is_delete_record(&self) -> bool {
        self.flags & FLAG_DELETED != 0
    }

    pub fn is_compressed(&self) -> bool {
        self.compression_method_index != 0
    }

    pub fn set_encrypted(&mut self, on: bool) {
        self.set_flag(FLAG_ENCRYPTED, on)
    }

    pub fn set_delete_record(&mut self, on: bool) {
        self.set_flag(FLAG_DELETED, on)
    }

    fn set_flag(&mut self, flag: u8, on: bool) {
        if on {
            self.flags |= flag;
        } else {
            self.flags &= !flag;
        }
    }

    /// Encoded length of this header.
    pub fn serialized_size(&self) -> u64 {
        let mut n = 8 + 8 + 8 + 4;
        if self.is_compressed() {
            n += 4 + 16 * self.blocks.len() as u64 + 4;
        }
        n + HASH_LEN as u64 + 1
    }

    /// Header size for an entry with `block_count` compression blocks.
    pub fn serialized_size_for(compressed: bool, block_count: usize) -> u64 {
        let mut probe = PakEntry {
            compression_method_index: compressed as u32,
            ..Default::default()
        };
        probe.blocks.resize(block_count, CompressionBlock::default());
        probe.serialized_size()
    }

    /// Equality of everything a header carries on disk; `offset` is ignored
    /// because the inline copy never records it.
    pub fn same_header(&self, other: &PakEntry) -> bool {
        self.size == other.size
            && self.uncompressed_size == other.uncompressed_size
            && self.compression_method_index == other.compression_method_index
            && self.blocks == other.blocks
            && self.compression_block_size == other.compression_block_size
            && self.hash == other.hash
            && self.flags == other.flags
    }

    pub fn write_to<W: Write>(&self, mut w: W) -> std::io::Result<()> {
        w.write_all(&(self.offset as i64).to_le_bytes())?;
        w.write_all(&(self.size as i64).to_le_bytes())?;
        w.write_all(&(self.uncompressed_size as i64).to_le_bytes())?;
        w.write_all(&(self.compression_method_index as i32).to_le_bytes())?;
        if self.is_compressed() {
            w.write_all(&(self.blocks.len() as u32).to_le_bytes())?;
            for b in &self.blocks {
                w.write_all(&(b.start as i64).to_le_bytes())?;
                w.write_all(&(b.end as i64).to_le_bytes())?;
            }
            w.write_all(&self.compression_block_size.to_le_bytes())?;
        }
        w.write_all(&self.hash)?;
        w.write_all(&[self.flags])?;
        Ok(())
    }

    pub fn read_from<R: Read>(mut r: R) -> std::io::Result<Self> {
        let mut e = PakEntry {
            offset: read_i64(&mut r)?,
            size: read_i64(&mut r)?,
            uncompressed_size: read_i64(&mut r)?,
            ..Default::default()
        };
        let method = read_i32(&mut r)?;
        if method < 0 {
            return Err(invalid("negative compression method index"));
        }
        e.compression_method_index = method as u32;
        if e.is_compressed() {
            let count = read_u32(&mut r)? as u64;
            // each block spans at least one stored byte
            if count > e.size.max(1) {
                return Err(invalid("block count exceeds entry size"));
            }
            e.blocks.reserve(count as usize);
            for _ in 0..count {
                let start = read_i64(&mut r)?;
                let end = read_i64(&mut r)?;
                if end < start {
                    return Err(invalid("compression block ends before it starts"));
                }
                e.blocks.push(CompressionBlock { start, end });
            }
            e.compression_block_size = read_u32(&mut r)?;
        }
        r.read_exact(&mut e.hash)?;
        let mut flags = [0u8; 1];
        r.read_exact(&mut flags)?;
        e.flags = flags[0];
        Ok(e)
    }
}

fn invalid(msg: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg.to_string())
}

fn read_i64<R: Read>(r: &mut R) -> std::io::Result<u64> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    let v = i64::from_le_bytes(b);
    if v < 0 {
        return Err(invalid("negative size or offset"));
    }
    Ok(v as u64)
}

fn read_i32<R: Read>(r: &mut R) -> std::io::Result<i32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(i32::from_le_bytes(b))
}

pub(crate) fn read_u32<R: Read>(r: &mut R) -> std::io::Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compressed_entry() -> PakEntry {
        PakEntry {
            offset: 4096,
            size: 48,
            uncompressed_size: 70_000,
            compression_method_index: 2,
            blocks: vec![
                CompressionBlock { start: 73, end: 100 },
                CompressionBlock { start: 112, end: 121 },
            ],
            compression_block_size: 65_536,
            hash: [5; HASH_LEN],
            flags: FLAG_ENCRYPTED,
        }
    }

    #[test]
    fn serialized_size_matches_encoding() {
        let e = compressed_entry();
        let mut buf = Vec::new();
        e.write_to(&mut buf).unwrap();
        assert_eq!(buf.len() as u64, e.serialized_size());
        assert_eq!(PakEntry::serialized_size_for(true, 2), e.serialized_size());
        assert_eq!(PakEntry::serialized_size_for(false, 0), 45);
    }

    #[test]
    fn decodes_what_it_encodes() {
        let e = compressed_entry();
        let mut buf = Vec::new();
        e.write_to(&mut buf).unwrap();
        let back = PakEntry::read_from(&buf[..]).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn same_header_ignores_offset_only() {
        let a = compressed_entry();
        let mut b = a.clone();
        b.offset = 0;
        assert!(a.same_header(&b));
        b.hash[0] ^= 1;
        assert!(!a.same_header(&b));
    }

    #[test]
    fn rejects_negative_fields() {
        let mut buf = Vec::new();
        PakEntry::default().write_to(&mut buf).unwrap();
        buf[8..16].copy_from_slice(&(-1i64).to_le_bytes());
        assert!(PakEntry::read_from(&buf[..]).is_err());
    }
}
