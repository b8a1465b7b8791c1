use clap::{Args, Parser, Subcommand, ValueEnum};
use pak_core::SeekOptMode;
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about = "pakdev: build, patch and inspect pak archives", long_about = None)]
pub struct Cli {
    /// Log at debug level (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Where encryption and signing keys come from.
#[derive(Args, Clone, Default)]
pub struct KeyArgs {
    /// Key chain JSON (encryption keys, signing key)
    #[arg(long = "crypto-keys")]
    pub crypto_keys: Option<PathBuf>,

    /// GUID of the key chain entry to use as the master key
    #[arg(long = "encryption-key-guid")]
    pub encryption_key_guid: Option<String>,

    /// 32-byte hex AES key, registered under the zero GUID
    #[arg(long = "aes-key")]
    pub aes_key_hex: Option<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum SeekOptModeArg {
    None,
    OnePass,
    Incremental,
    IncrementalPrimaryOnly,
    IncrementalPrimaryThenSecondary,
}

impl From<SeekOptModeArg> for SeekOptMode {
    fn from(m: SeekOptModeArg) -> Self {
        match m {
            SeekOptModeArg::None => SeekOptMode::None,
            SeekOptModeArg::OnePass => SeekOptMode::OnePass,
            SeekOptModeArg::Incremental => SeekOptMode::Incremental,
            SeekOptModeArg::IncrementalPrimaryOnly => SeekOptMode::IncrementalPrimaryOnly,
            SeekOptModeArg::IncrementalPrimaryThenSecondary => {
                SeekOptMode::IncrementalPrimaryThenSecondary
            }
        }
    }
}

#[derive(Args, Clone)]
pub struct PatchArgs {
    /// Prior archives (folder or file wildcard); turns the build into a patch
    #[arg(long = "generate-patch")]
    pub generate_patch: Option<PathBuf>,

    #[arg(long = "patch-seek-opt-mode", value_enum, default_value_t = SeekOptModeArg::None)]
    pub seek_opt_mode: SeekOptModeArg,

    /// Largest run of unchanged bytes to pull in (accepts KB/MB/GB)
    #[arg(long = "patch-seek-opt-max-gap-size", default_value = "0")]
    pub max_gap_size: String,

    #[arg(long = "patch-seek-opt-max-inflation-percent", default_value_t = 0.0)]
    pub max_inflation_percent: f64,

    #[arg(long = "patch-seek-opt-max-adjacent-order-diff", default_value_t = 128)]
    pub max_adjacent_order_diff: u64,

    /// Write the source path of every changed file here
    #[arg(long = "changed-files-list")]
    pub changed_files_list: Option<PathBuf>,

    /// Let a kept .uasset/.umap and its .uexp land in different archives
    #[arg(long = "no-pair-guarantee")]
    pub no_pair_guarantee: bool,
}

#[derive(Args, Clone)]
pub struct CreateArgs {
    /// Output archive
    pub out: PathBuf,

    /// Source files, directories or wildcards (used without --response-file)
    pub inputs: Vec<String>,

    /// Response file: `"source" "dest" [-compress] [-encrypt] [-delete]` per line
    #[arg(long = "response-file")]
    pub response_file: Option<PathBuf>,

    /// Destination directory for positional inputs, e.g. ../../../Game/
    #[arg(long)]
    pub dest: Option<String>,

    /// Override the mount point instead of using the common root
    #[arg(long = "mount-point")]
    pub mount_point: Option<String>,

    #[arg(long)]
    pub compress: bool,

    #[arg(long)]
    pub encrypt: bool,

    #[arg(long = "encrypt-index")]
    pub encrypt_index: bool,

    #[arg(long)]
    pub sign: bool,

    /// Comma separated, in preference order; zlib is appended if missing
    #[arg(long = "compression-formats", default_value = "zlib")]
    pub compression_formats: String,

    #[arg(long = "compression-block-size", default_value = "64KB")]
    pub compression_block_size: String,

    #[arg(long = "compression-level", default_value_t = 0)]
    pub compression_level: i32,

    /// Directory for cached compressed blocks
    #[arg(long = "compression-cache")]
    pub compression_cache: Option<PathBuf>,

    /// Primary order files, later files extend earlier ones
    #[arg(long = "order", value_delimiter = ',')]
    pub order: Vec<PathBuf>,

    /// Secondary order files, numbered after every primary entry
    #[arg(long = "secondary-order", value_delimiter = ',')]
    pub secondary_order: Vec<PathBuf>,

    #[arg(long = "fallback-order-for-non-uasset-files")]
    pub fallback_order_for_non_uasset_files: bool,

    /// Avoid payloads straddling blocks of this size (accepts KB/MB/GB)
    #[arg(long = "block-size", default_value = "0")]
    pub fs_block_size: String,

    #[arg(long = "patch-padding-align", default_value = "0")]
    pub patch_padding_align: String,

    #[arg(long = "align-for-memory-mapping", default_value = "0")]
    pub align_for_memory_mapping: String,

    /// Compress the next batch while writing the current one
    #[arg(long = "async-compression")]
    pub async_compression: bool,

    #[arg(long)]
    pub threads: Option<usize>,

    /// Write an archive without delete record support
    #[arg(long)]
    pub legacy: bool,

    /// Also write the build statistics as JSON
    #[arg(long = "stats-json")]
    pub stats_json: Option<PathBuf>,

    #[command(flatten)]
    pub patch: PatchArgs,

    #[command(flatten)]
    pub keys: KeyArgs,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build an archive (or a patch archive with --generate-patch)
    Create(Box<CreateArgs>),

    /// Extract archive to destination
    Extract {
        archive: PathBuf,
        dest: PathBuf,

        /// Wildcard on paths inside the archive
        #[arg(long)]
        filter: Option<String>,

        #[arg(long = "extract-to-mount-point")]
        use_mount_point: bool,

        /// Write a response file that rebuilds the archive
        #[arg(long = "response-file")]
        response_file: Option<PathBuf>,

        /// Write an order file in archive order
        #[arg(long = "order-file")]
        order_file: Option<PathBuf>,

        #[command(flatten)]
        keys: KeyArgs,
    },

    /// List archive contents by offset
    List {
        archive: PathBuf,

        /// Only show entries at least this large (accepts KB/MB/GB)
        #[arg(long = "size-filter", default_value = "0")]
        size_filter: String,

        #[arg(long = "include-deleted")]
        include_deleted: bool,

        #[arg(long)]
        csv: Option<PathBuf>,

        #[arg(long = "extract-to-mount-point")]
        use_mount_point: bool,

        #[command(flatten)]
        keys: KeyArgs,
    },

    /// Compare the decompressed contents of two archives
    Diff {
        first: PathBuf,
        second: PathBuf,

        #[command(flatten)]
        keys: KeyArgs,
    },

    /// Rebuild an archive with its own settings
    Repack {
        archive: PathBuf,

        /// Write here instead of replacing the archive
        #[arg(long)]
        output: Option<PathBuf>,

        #[arg(long)]
        threads: Option<usize>,

        #[command(flatten)]
        keys: KeyArgs,
    },

    /// Latest revision of every file across a folder of archives
    Audit {
        /// Folder or file wildcard
        input: PathBuf,

        #[arg(long = "only-deleted")]
        only_deleted: bool,

        #[arg(long)]
        csv: Option<PathBuf>,

        #[arg(long)]
        order: Option<PathBuf>,

        #[arg(long = "sort-by-ordering")]
        sort_by_ordering: bool,

        #[command(flatten)]
        keys: KeyArgs,
    },

    /// Verify headers, payload hashes and the signature
    Verify {
        archive: PathBuf,

        #[command(flatten)]
        keys: KeyArgs,
    },
}
