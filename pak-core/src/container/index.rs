use super::entry::{PakEntry, read_u32};
use std::io::{Read, Write};

/// Upper bound on a serialized path, to reject corrupt lengths early.
const MAX_STRING_LEN: u32 = 64 * 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    /// Path relative to the mount point.
    pub filename: String,
    pub entry: PakEntry,
}

/// Mount point plus every entry with its physical offset.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PakIndex {
    pub mount_point: String,
    pub entries: Vec<IndexEntry>,
}

impl PakIndex {
    pub fn write_to<W: Write>(&self, mut w: W) -> std::io::Result<()> {
        write_string(&mut w, &self.mount_point)?;
        w.write_all(&(self.entries.len() as u32).to_le_bytes())?;
        for ie in &self.entries {
            write_string(&mut w, &ie.filename)?;
            ie.entry.write_to(&mut w)?;
        }
        Ok(())
    }

    pub fn read_from(bytes: &[u8]) -> std::io::Result<Self> {
        let mut r = bytes;
        let mount_point = read_string(&mut r)?;
        let count = read_u32(&mut r)? as usize;
        // smallest possible record: empty name + uncompressed header
        let min_record = 4 + PakEntry::serialized_size_for(false, 0) as usize;
        if count > r.len() / min_record {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("index claims {count} entries but holds {} bytes", r.len()),
            ));
        }
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let filename = read_string(&mut r)?;
            let entry = PakEntry::read_from(&mut r)?;
            entries.push(IndexEntry { filename, entry });
        }
        Ok(Self {
            mount_point,
            entries,
        })
    }

    pub fn find(&self, filename: &str) -> Option<&IndexEntry> {
        self.entries.iter().find(|e| e.filename == filename)
    }

    /// Mount point joined with `filename`.
    pub fn full_path(&self, filename: &str) -> String {
        format!("{}{}", self.mount_point, filename)
    }
}

fn write_string<W: Write>(w: &mut W, s: &str) -> std::io::Result<()> {
    w.write_all(&(s.len() as u32).to_le_bytes())?;
    w.write_all(s.as_bytes())
}

fn read_string<R: Read>(r: &mut R) -> std::io::Result<String> {
    let len = read_u32(r)?;
    if len > MAX_STRING_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("string length {len} out of range"),
        ));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_decodes_what_it_encodes() {
        let idx = PakIndex {
            mount_point: "../../../Game/".into(),
            entries: vec![
                IndexEntry {
                    filename: "Content/a.uasset".into(),
                    entry: PakEntry {
                        offset: 0,
                        size: 3,
                        uncompressed_size: 3,
                        ..Default::default()
                    },
                },
                IndexEntry {
                    filename: "Content/gone.uasset".into(),
                    entry: PakEntry {
                        flags: crate::container::entry::FLAG_DELETED,
                        ..Default::default()
                    },
                },
            ],
        };
        let mut buf = Vec::new();
        idx.write_to(&mut buf).unwrap();
        let back = PakIndex::read_from(&buf).unwrap();
        assert_eq!(back, idx);
        assert!(back.find("Content/gone.uasset").unwrap().entry.is_delete_record());
        assert_eq!(back.full_path("x"), "../../../Game/x");
    }

    #[test]
    fn truncated_index_is_an_error() {
        let mut buf = Vec::new();
        write_string(&mut buf, "/").unwrap();
        buf.extend_from_slice(&1000u32.to_le_bytes());
        assert!(PakIndex::read_from(&buf).is_err());
    }
}
