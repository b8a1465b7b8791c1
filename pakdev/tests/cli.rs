//! Integration tests for the pakdev CLI

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;

fn pakdev(args: &[&str]) -> assert_cmd::assert::Assert {
    Command::cargo_bin("pakdev")
        .unwrap()
        .args(args)
        .env("RUST_LOG", "warn")
        .assert()
}

fn write_tree(root: &Path, files: &[(&str, &str)]) {
    for (rel, body) in files {
        let p = root.join(rel);
        fs::create_dir_all(p.parent().unwrap()).unwrap();
        fs::write(p, body).unwrap();
    }
}

fn s(p: &Path) -> String {
    p.to_string_lossy().into_owned()
}

#[test]
fn create_patch_extract_and_verify() {
    let td = tempfile::tempdir().unwrap();
    let v1 = td.path().join("v1");
    let v2 = td.path().join("v2");
    let paks = td.path().join("paks");
    fs::create_dir_all(&paks).unwrap();
    write_tree(&v1, &[("Data/a.txt", "a"), ("Data/b.txt", "b"), ("Data/c.txt", "c")]);
    write_tree(&v2, &[("Data/a.txt", "a"), ("Data/b.txt", "b2")]);

    let base = paks.join("pakchunk0-Test.pak");
    pakdev(&[
        "create",
        &s(&base),
        &format!("{}/", s(&v1)),
        "--dest",
        "../../../Game/",
        "--compress",
        "--compression-formats",
        "zstd",
    ])
    .success();

    let patch = paks.join("pakchunk0-Test_0_P.pak");
    let changed = td.path().join("changed.txt");
    pakdev(&[
        "create",
        &s(&patch),
        &format!("{}/", s(&v2)),
        "--dest",
        "../../../Game/",
        "--generate-patch",
        &s(&base),
        "--changed-files-list",
        &s(&changed),
    ])
    .success();
    assert!(fs::read_to_string(&changed).unwrap().contains("b.txt"));

    let dest = td.path().join("out");
    pakdev(&["extract", &s(&patch), &s(&dest)]).success();
    let extracted: Vec<String> = walkdir::WalkDir::new(&dest)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(extracted, vec!["b.txt".to_string()]);
    assert_eq!(fs::read_to_string(dest.join("b.txt")).unwrap(), "b2");

    pakdev(&["list", &s(&patch), "--include-deleted"])
        .success()
        .stdout(predicate::str::contains("c.txt (deleted)"));

    pakdev(&["verify", &s(&base)])
        .success()
        .stderr(predicate::str::contains("verify: OK"));
}

#[test]
fn failures_exit_non_zero() {
    let td = tempfile::tempdir().unwrap();
    pakdev(&["verify", &s(&td.path().join("missing.pak"))])
        .failure()
        .stderr(predicate::str::contains("error:"));

    write_tree(td.path(), &[("a.txt", "a")]);
    pakdev(&[
        "create",
        &s(&td.path().join("x.pak")),
        &s(&td.path().join("a.txt")),
        "--generate-patch",
        &s(td.path()),
        "--patch-seek-opt-mode",
        "incremental",
    ])
    .failure();
}
