use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Counters collected while building one archive.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BuildStats {
    pub files: u64,
    pub delete_records: u64,
    /// Uncompressed input bytes.
    pub bytes_in: u64,
    /// Stored payload bytes, encryption padding included.
    pub bytes_out: u64,
    pub compressed_files: u64,
    pub files_per_format: BTreeMap<String, u64>,
    /// Alignment padding written between entries.
    pub padding_bytes: u64,
    pub header_bytes: u64,
    pub index_bytes: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub compression_time: Duration,
}

impl BuildStats {
    pub fn compression_ratio(&self) -> f32 {
        if self.bytes_in == 0 {
            return 1.0;
        }
        (self.bytes_out as f64 / self.bytes_in as f64) as f32
    }
}

impl std::fmt::Display for BuildStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "files: {} ({} compressed, {} delete records)",
            self.files, self.compressed_files, self.delete_records
        )?;
        writeln!(
            f,
            "bytes: {} in, {} out ({:.1}%), {} padding, {} headers, {} index",
            self.bytes_in,
            self.bytes_out,
            self.compression_ratio() * 100.0,
            self.padding_bytes,
            self.header_bytes,
            self.index_bytes
        )?;
        for (name, n) in &self.files_per_format {
            writeln!(f, "  {name}: {n} files")?;
        }
        if self.cache_hits + self.cache_misses > 0 {
            writeln!(f, "cache: {} hits, {} misses", self.cache_hits, self.cache_misses)?;
        }
        write!(f, "compression time: {:.2?}", self.compression_time)
    }
}
