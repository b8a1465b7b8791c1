use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use pak_core::codec::parse_format_list;
use pak_core::collect::response::{ResponseOptions, entries_from_paths, load_response_file};
use pak_core::crypto::hex::parse_hex_array;
use pak_core::crypto::keychain::parse_guid;
use pak_core::pack::compressor::{CompressionCache, DirCache};
use pak_core::patch::diff::resolve_prior_archives;
use pak_core::util::size::parse_size;
use pak_core::{
    AuditOptions, BuildOptions, CollectOptions, DiffOptions, ExtractOptions, KeyChain,
    ListOptions, OrderMap, PakReader, RepackOptions, SeekOptParams, audit, build, collect,
    compare, diff, extract, list, repack, verify,
};
use tracing::{info, warn};

use crate::presentation::cli::{CreateArgs, KeyArgs};

fn load_keys(args: &KeyArgs) -> Result<KeyChain> {
    let mut keys = match &args.crypto_keys {
        Some(p) => KeyChain::load_json(p)
            .with_context(|| format!("loading key chain {}", p.display()))?,
        None => KeyChain::default(),
    };
    if let Some(hex) = &args.aes_key_hex {
        let raw = KeyChain::with_master_key(parse_hex_array::<32>(hex)?);
        let master = keys.master_guid.or(raw.master_guid);
        keys.encryption_keys.extend(raw.encryption_keys);
        keys.master_guid = master;
    }
    if let Some(g) = &args.encryption_key_guid {
        keys.select_master(parse_guid(g)?)?;
    }
    Ok(keys)
}

fn open(archive: &Path, keys: &KeyChain) -> Result<PakReader> {
    PakReader::open(archive, keys).with_context(|| format!("opening {}", archive.display()))
}

pub fn handle_create(args: CreateArgs) -> Result<()> {
    let keys = load_keys(&args.keys)?;

    let mut order_map = OrderMap::new();
    for p in &args.order {
        order_map.load(p, false)?;
    }
    for p in &args.secondary_order {
        order_map.load(p, true)?;
    }

    let align_for_memory_mapping = parse_size(&args.align_for_memory_mapping)?;
    let response_opts = ResponseOptions {
        compress: args.compress,
        encrypt: args.encrypt,
        align_for_memory_mapping,
    };
    let raw = match &args.response_file {
        Some(p) => load_response_file(p, &response_opts)
            .with_context(|| format!("reading response file {}", p.display()))?,
        None => entries_from_paths(&args.inputs, args.dest.as_deref(), &response_opts),
    };
    if raw.is_empty() {
        bail!("no input files: pass paths or --response-file");
    }
    let collect_opts = CollectOptions {
        fallback_order_for_non_uasset_files: args.fallback_order_for_non_uasset_files,
    };
    let mut entries = collect(&raw, &order_map, &collect_opts)?;
    info!(files = entries.len(), "collected input files");

    if let Some(pattern) = &args.patch.generate_patch {
        let prior = resolve_prior_archives(pattern)?;
        if prior.is_empty() {
            bail!("no prior archives found at {}", pattern.display());
        }
        let diff_opts = DiffOptions {
            seek_opt: SeekOptParams {
                mode: args.patch.seek_opt_mode.into(),
                max_gap_size: parse_size(&args.patch.max_gap_size)?,
                max_inflation_percent: args.patch.max_inflation_percent,
                max_adjacent_order_diff: args.patch.max_adjacent_order_diff,
            },
            guarantee_pairs: !args.patch.no_pair_guarantee,
            changed_files_list: args.patch.changed_files_list.clone(),
            legacy_scan_dir: None,
        };
        let outcome = diff(&prior, &args.out, entries, &keys, &diff_opts)?;
        if outcome.entries.is_empty() {
            warn!("patch has no changed files");
        }
        entries = outcome.entries;
    }

    let mut opts = BuildOptions {
        encrypt_index: args.encrypt_index,
        fs_block_size: parse_size(&args.fs_block_size)?,
        patch_padding_align: parse_size(&args.patch_padding_align)?,
        align_for_memory_mapping,
        async_compression: args.async_compression,
        sign: args.sign,
        threads: args.threads,
        mount_point: args.mount_point.clone(),
        ..Default::default()
    };
    if args.legacy {
        opts.version = pak_core::container::trailer::VERSION_LEGACY;
    }
    opts.compression.formats = parse_format_list(&args.compression_formats)?;
    opts.compression.block_size = u32::try_from(parse_size(&args.compression_block_size)?)
        .context("compression block size does not fit in 32 bits")?;
    opts.compression.level = args.compression_level;

    let cache = args
        .compression_cache
        .as_ref()
        .map(|p| DirCache::new(p.clone()))
        .transpose()?;
    let (_, stats) = build(
        &entries,
        &keys,
        &opts,
        &args.out,
        cache.as_ref().map(|c| c as &dyn CompressionCache),
    )?;
    println!("{stats}");
    if let Some(p) = &args.stats_json {
        fs::write(p, serde_json::to_string_pretty(&stats)?)
            .with_context(|| format!("writing {}", p.display()))?;
    }
    eprintln!("create: wrote {}", args.out.display());
    Ok(())
}

pub fn handle_extract(
    archive: PathBuf,
    dest: PathBuf,
    filter: Option<String>,
    use_mount_point: bool,
    response_file: Option<PathBuf>,
    order_file: Option<PathBuf>,
    keys: KeyArgs,
) -> Result<()> {
    let keys = load_keys(&keys)?;
    let reader = open(&archive, &keys)?;
    let opts = ExtractOptions {
        filter,
        use_mount_point,
        response_file,
        order_file,
    };
    let report = extract(&reader, &dest, &opts)?;
    if !report.is_ok() {
        for (file, err) in &report.failures {
            eprintln!("  {file}: {err}");
        }
        bail!(
            "{} of {} files failed to extract",
            report.failures.len(),
            report.failures.len() + report.extracted.len()
        );
    }
    eprintln!("extract: {} files to {}", report.extracted.len(), dest.display());
    Ok(())
}

pub fn handle_list(
    archive: PathBuf,
    size_filter: String,
    include_deleted: bool,
    csv: Option<PathBuf>,
    use_mount_point: bool,
    keys: KeyArgs,
) -> Result<()> {
    let keys = load_keys(&keys)?;
    let reader = open(&archive, &keys)?;
    let opts = ListOptions {
        size_filter: parse_size(&size_filter)?,
        include_deleted,
        csv,
        use_mount_point,
    };
    for r in list(&reader, &opts)? {
        println!(
            "{:>12} {:>10} {:>10} {} {:<5} {}{}",
            r.offset,
            r.size,
            r.uncompressed_size,
            r.hash,
            r.method,
            r.path,
            if r.deleted { " (deleted)" } else { "" }
        );
    }
    Ok(())
}

pub fn handle_diff(first: PathBuf, second: PathBuf, keys: KeyArgs) -> Result<()> {
    let keys = load_keys(&keys)?;
    let a = open(&first, &keys)?;
    let b = open(&second, &keys)?;
    let cmp = compare(&a, &b)?;
    for p in &cmp.unique_to_first {
        println!("UniqueToFirstPak, {p}");
    }
    for p in &cmp.unique_to_second {
        println!("UniqueToSecondPak, {p}");
    }
    for (p, s1, s2) in &cmp.size_different {
        println!("FilesizeDifferent, {p}, {s1}, {s2}");
    }
    for p in &cmp.content_different {
        println!("ContentsDifferent, {p}");
    }
    for p in &cmp.unreadable {
        println!("Unreadable, {p}");
    }
    eprintln!(
        "diff: {} equal, {} different",
        cmp.equal,
        cmp.size_different.len() + cmp.content_different.len()
    );
    Ok(())
}

pub fn handle_repack(
    archive: PathBuf,
    output: Option<PathBuf>,
    threads: Option<usize>,
    keys: KeyArgs,
) -> Result<()> {
    let keys = load_keys(&keys)?;
    let opts = RepackOptions {
        output,
        build: BuildOptions {
            threads,
            ..Default::default()
        },
    };
    let stats = repack(&archive, &keys, &opts)
        .with_context(|| format!("repacking {}", archive.display()))?;
    println!("{stats}");
    Ok(())
}

pub fn handle_audit(
    input: PathBuf,
    only_deleted: bool,
    csv: Option<PathBuf>,
    order: Option<PathBuf>,
    sort_by_ordering: bool,
    keys: KeyArgs,
) -> Result<()> {
    let keys = load_keys(&keys)?;
    let order = match order {
        Some(p) => {
            let mut m = OrderMap::new();
            m.load(&p, false)?;
            Some(m)
        }
        None => None,
    };
    let opts = AuditOptions {
        only_deleted,
        csv,
        order,
        sort_by_order: sort_by_ordering,
    };
    let report = audit(&input, &keys, &opts)?;
    eprintln!("audit: {} rows", report.rows.len());
    Ok(())
}

pub fn handle_verify(archive: PathBuf, keys: KeyArgs) -> Result<()> {
    let keys = load_keys(&keys)?;
    let reader = open(&archive, &keys)?;
    let report = verify(&reader, &keys);
    if !report.is_ok() {
        for (file, err) in &report.failures {
            eprintln!("  {file}: {err}");
        }
        bail!(
            "{} of {} entries failed verification",
            report.failures.len(),
            report.checked
        );
    }
    match report.signature_checked {
        Some(true) => eprintln!("verify: OK ({} entries, signature valid)", report.checked),
        _ => eprintln!("verify: OK ({} entries, unsigned)", report.checked),
    }
    Ok(())
}
