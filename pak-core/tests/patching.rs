use pak_core::patch::diff::resolve_prior_archives;
use pak_core::{
    BuildEntry, BuildOptions, CollectOptions, DiffOptions, KeyChain, OrderMap, PakReader,
    SeekOptMode, SeekOptParams, build, collect, diff,
};
use pretty_assertions::assert_eq;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Writes `count` numbered 1 KiB files and an order file listing them in
/// sequence.
fn numbered_build(dir: &Path, count: usize, changed: &[usize]) -> (Vec<BuildEntry>, OrderMap) {
    fs::create_dir_all(dir).unwrap();
    let mut order_text = String::new();
    for i in 0..count {
        let mut body = vec![i as u8; 1024];
        if changed.contains(&i) {
            body[0] ^= 0xff;
        }
        fs::write(dir.join(format!("f{i:03}.bin")), body).unwrap();
        order_text.push_str(&format!("\"../../../Game/f{i:03}.bin\" {i}\n"));
    }
    let mut order = OrderMap::new();
    order.load_str(&order_text, false);
    let raw = BuildEntry::new(format!("{}/*.bin", dir.display()), "../../../Game/");
    let mut entries = collect(&[raw], &order, &CollectOptions::default()).unwrap();
    for e in &mut entries {
        e.is_primary_order = true;
    }
    (entries, order)
}

fn names(entries: &[BuildEntry]) -> BTreeSet<String> {
    entries
        .iter()
        .map(|e| e.dest.trim_start_matches("../../../Game/").to_string())
        .collect()
}

#[test]
fn patch_then_mount_order_resolves_latest_content() {
    let td = TempDir::new().unwrap();
    let paks = td.path().join("paks");
    fs::create_dir_all(&paks).unwrap();
    let keys = KeyChain::default();

    let (v1, _) = numbered_build(&td.path().join("v1"), 6, &[]);
    build(&v1, &keys, &BuildOptions::default(), &paks.join("pakchunk0-G.pak"), None).unwrap();

    let (mut v2, _) = numbered_build(&td.path().join("v2"), 5, &[2]);
    v2.retain(|e| !e.dest.ends_with("f004.bin"));
    let prior = resolve_prior_archives(&paks).unwrap();
    let patch = paks.join("pakchunk0-G_0_P.pak");
    let outcome = diff(&prior, &patch, v2, &keys, &DiffOptions::default()).unwrap();
    assert_eq!(
        names(&outcome.entries),
        BTreeSet::from(["f002.bin", "f004.bin", "f005.bin"].map(String::from))
    );
    assert_eq!(outcome.delete_records, 2);
    build(&outcome.entries, &keys, &BuildOptions::default(), &patch, None).unwrap();

    // a second diff against base + patch finds nothing new
    let (mut v2_again, _) = numbered_build(&td.path().join("v2"), 5, &[2]);
    v2_again.retain(|e| !e.dest.ends_with("f004.bin"));
    let prior = resolve_prior_archives(&paks).unwrap();
    assert_eq!(prior.len(), 2);
    let next = paks.join("pakchunk0-G_1_P.pak");
    let outcome = diff(&prior, &next, v2_again, &keys, &DiffOptions::default()).unwrap();
    assert!(outcome.entries.is_empty(), "{:?}", names(&outcome.entries));

    let reader = PakReader::open(&patch, &keys).unwrap();
    let f002 = reader.index.find("f002.bin").unwrap();
    assert_eq!(reader.read_to_vec(&f002.entry).unwrap()[0], 2 ^ 0xff);
    assert!(reader.index.find("f004.bin").unwrap().entry.is_delete_record());
}

#[test]
fn seek_optimization_fills_small_gaps_within_budget() {
    let td = TempDir::new().unwrap();
    let paks = td.path().join("paks");
    fs::create_dir_all(&paks).unwrap();
    let keys = KeyChain::default();

    let (v1, _) = numbered_build(&td.path().join("v1"), 20, &[]);
    build(&v1, &keys, &BuildOptions::default(), &paks.join("pakchunk0-G.pak"), None).unwrap();
    let (v2, _) = numbered_build(&td.path().join("v2"), 20, &[3, 5, 15]);
    let prior = resolve_prior_archives(&paks).unwrap();
    let out = paks.join("pakchunk0-G_0_P.pak");

    let plain = diff(&prior, &out, v2.clone(), &keys, &DiffOptions::default()).unwrap();
    assert_eq!(plain.entries.len(), 3);

    let opts = DiffOptions {
        seek_opt: SeekOptParams {
            mode: SeekOptMode::Incremental,
            max_gap_size: 64 * 1024,
            max_inflation_percent: 50.0,
            ..Default::default()
        },
        ..Default::default()
    };
    let optimized = diff(&prior, &out, v2, &keys, &opts).unwrap();
    // f004 is a 1 KiB gap between two changed files; the run before f015 is too long
    assert_eq!(
        names(&optimized.entries),
        BTreeSet::from(["f003.bin", "f004.bin", "f005.bin", "f015.bin"].map(String::from))
    );
    let summary = optimized.seek_opt.unwrap();
    assert!(summary.final_size as f64 <= summary.original_size as f64 * 1.5);
    assert!(summary.fragmentation_after < summary.fragmentation_before);
}
