use crate::codec::CompressionMethod;
use crate::error::{PakError, Result};
use crate::hash::content::{HASH_LEN, Hash128};
use std::io::{Read, Seek, SeekFrom, Write};
use uuid::Uuid;

pub const PAK_MAGIC: u32 = 0x5A6F_12E1;
pub const FORMAT_SLOTS: usize = 5;
pub const FORMAT_NAME_LEN: usize = 32;
pub const TRAILER_LEN: u64 =
    4 + 8 + 8 + HASH_LEN as u64 + (FORMAT_SLOTS * FORMAT_NAME_LEN) as u64 + 1 + 16 + 1;

/// Archives written before per-file delete records existed.
pub const VERSION_LEGACY: u8 = 1;
pub const VERSION_DELETE_RECORDS: u8 = 2;
pub const VERSION_LATEST: u8 = VERSION_DELETE_RECORDS;

/// Fixed-size record at the very end of an archive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Trailer {
    pub index_offset: u64,
    pub index_size: u64,
    pub index_hash: Hash128,
    /// Names of the formats referenced by 1-based method indices.
    pub formats: Vec<String>,
    pub encrypted_index: bool,
    pub encryption_key_guid: Uuid,
    pub version: u8,
}

impl Default for Trailer {
    fn default() -> Self {
        Self {
            index_offset: 0,
            index_size: 0,
            index_hash: [0; HASH_LEN],
            formats: Vec::new(),
            encrypted_index: false,
            encryption_key_guid: Uuid::nil(),
            version: VERSION_LATEST,
        }
    }
}

impl Trailer {
    /// 1-based slot of `method`, registering it on first use.
    pub fn format_index(&mut self, method: CompressionMethod) -> Result<u32> {
        if let Some(i) = self
            .formats
            .iter()
            .position(|n| n.eq_ignore_ascii_case(method.name()))
        {
            return Ok(i as u32 + 1);
        }
        if self.formats.len() == FORMAT_SLOTS {
            return Err(PakError::config(format!(
                "more than {FORMAT_SLOTS} compression formats in one archive"
            )));
        }
        self.formats.push(method.name().to_string());
        Ok(self.formats.len() as u32)
    }

    /// Method for a 1-based slot; `None` for slot 0 (stored).
    pub fn method_at(&self, index: u32) -> Result<Option<CompressionMethod>> {
        if index == 0 {
            return Ok(None);
        }
        let name = self
            .formats
            .get(index as usize - 1)
            .ok_or_else(|| PakError::format(format!("compression slot {index} is empty")))?;
        CompressionMethod::from_name(name)
            .map(Some)
            .ok_or_else(|| PakError::format(format!("unsupported compression format {name}")))
    }

    pub fn method_name(&self, index: u32) -> &str {
        match index {
            0 => "None",
            i => self
                .formats
                .get(i as usize - 1)
                .map(String::as_str)
                .unwrap_or("Unknown"),
        }
    }

    pub fn write_to<W: Write>(&self, mut w: W) -> std::io::Result<()> {
        w.write_all(&PAK_MAGIC.to_le_bytes())?;
        w.write_all(&(self.index_offset as i64).to_le_bytes())?;
        w.write_all(&(self.index_size as i64).to_le_bytes())?;
        w.write_all(&self.index_hash)?;
        for slot in 0..FORMAT_SLOTS {
            let mut name = [0u8; FORMAT_NAME_LEN];
            if let Some(n) = self.formats.get(slot) {
                let b = n.as_bytes();
                let len = b.len().min(FORMAT_NAME_LEN);
                name[..len].copy_from_slice(&b[..len]);
            }
            w.write_all(&name)?;
        }
        w.write_all(&[self.encrypted_index as u8])?;
        w.write_all(self.encryption_key_guid.as_bytes())?;
        w.write_all(&[self.version])?;
        Ok(())
    }

    pub fn read_from<R: Read>(mut r: R) -> std::io::Result<Self> {
        let mut b4 = [0u8; 4];
        r.read_exact(&mut b4)?;
        if u32::from_le_bytes(b4) != PAK_MAGIC {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "bad trailer magic",
            ));
        }
        let mut b8 = [0u8; 8];
        r.read_exact(&mut b8)?;
        let index_offset = i64::from_le_bytes(b8);
        r.read_exact(&mut b8)?;
        let index_size = i64::from_le_bytes(b8);
        if index_offset < 0 || index_size < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "negative index location",
            ));
        }
        let mut t = Trailer {
            index_offset: index_offset as u64,
            index_size: index_size as u64,
            ..Default::default()
        };
        r.read_exact(&mut t.index_hash)?;
        for _ in 0..FORMAT_SLOTS {
            let mut name = [0u8; FORMAT_NAME_LEN];
            r.read_exact(&mut name)?;
            let end = name.iter().position(|&b| b == 0).unwrap_or(FORMAT_NAME_LEN);
            if end > 0 {
                t.formats.push(String::from_utf8_lossy(&name[..end]).into_owned());
            }
        }
        let mut b1 = [0u8; 1];
        r.read_exact(&mut b1)?;
        t.encrypted_index = b1[0] != 0;
        let mut guid = [0u8; 16];
        r.read_exact(&mut guid)?;
        t.encryption_key_guid = Uuid::from_bytes(guid);
        r.read_exact(&mut b1)?;
        t.version = b1[0];
        if t.version == 0 || t.version > VERSION_LATEST {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unsupported archive version {}", t.version),
            ));
        }
        Ok(t)
    }
}

/// Locate the trailer by reading the last [`TRAILER_LEN`] bytes of the file.
pub fn read_trailer_at_eof<F: Read + Seek>(f: &mut F) -> std::io::Result<(Trailer, u64)> {
    let len = f.seek(SeekFrom::End(0))?;
    if len < TRAILER_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "file too small for trailer",
        ));
    }
    f.seek(SeekFrom::End(-(TRAILER_LEN as i64)))?;
    Ok((Trailer::read_from(f)?, len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn trailer_has_fixed_size_and_decodes() {
        let mut t = Trailer {
            index_offset: 1234,
            index_size: 56,
            index_hash: [9; HASH_LEN],
            encrypted_index: true,
            encryption_key_guid: Uuid::from_u128(42),
            ..Default::default()
        };
        assert_eq!(t.format_index(CompressionMethod::Zstd).unwrap(), 1);
        assert_eq!(t.format_index(CompressionMethod::Zlib).unwrap(), 2);
        assert_eq!(t.format_index(CompressionMethod::Zstd).unwrap(), 1);

        let mut buf = vec![0xAA; 10];
        t.write_to(&mut buf).unwrap();
        assert_eq!(buf.len() as u64, 10 + TRAILER_LEN);

        let (back, len) = read_trailer_at_eof(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(len, buf.len() as u64);
        assert_eq!(back, t);
        assert_eq!(back.method_at(2).unwrap(), Some(CompressionMethod::Zlib));
        assert_eq!(back.method_at(0).unwrap(), None);
        assert!(back.method_at(3).is_err());
        assert_eq!(back.method_name(1), "Zstd");
    }

    #[test]
    fn rejects_bad_magic_and_short_files() {
        let mut buf = Vec::new();
        Trailer::default().write_to(&mut buf).unwrap();
        buf[0] ^= 0xff;
        assert!(read_trailer_at_eof(&mut Cursor::new(&buf)).is_err());
        assert!(read_trailer_at_eof(&mut Cursor::new(vec![0u8; 8])).is_err());
    }
}
