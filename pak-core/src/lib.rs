#![forbid(unsafe_code)]

pub mod error;
pub mod stats;

pub mod util {
    pub mod counting;
    pub mod paths;
    pub mod size;
}

pub mod hash {
    pub mod content;
}

pub mod codec;

pub mod crypto {
    pub mod aes;
    pub mod hex;
    pub mod keychain;
    pub mod signing;
}

pub mod container {
    pub mod entry;
    pub mod index;
    pub mod trailer;
}

pub mod order {
    pub mod map;
}

pub mod collect {
    pub mod collector;
    pub mod response;
}

pub mod pack {
    pub mod compressor;
    pub mod pool;
    pub mod repack;
    pub mod writer;
}

pub mod read {
    pub mod extract;
    pub mod opened;
}

pub mod patch {
    pub mod diff;
    pub mod seekopt;
}

pub mod audit;
pub mod compare;
pub mod list;

// Re-exports: stable API surface
pub use audit::{AuditOptions, audit};
pub use collect::collector::{BuildEntry, CollectOptions, collect};
pub use compare::compare;
pub use crypto::keychain::KeyChain;
pub use error::{PakError, Result};
pub use list::{ListOptions, list};
pub use order::map::OrderMap;
pub use pack::repack::{RepackOptions, repack};
pub use pack::writer::{BuildOptions, build};
pub use patch::diff::{DiffOptions, DiffOutcome, diff};
pub use patch::seekopt::{SeekOptMode, SeekOptParams};
pub use read::extract::{ExtractOptions, extract, verify};
pub use read::opened::PakReader;
pub use stats::BuildStats;
