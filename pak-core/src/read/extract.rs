use super::opened::PakReader;
use crate::container::index::IndexEntry;
use crate::error::{PakError, Result};
use crate::hash::content::hash128;
use crate::util::paths;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Clone, Debug, Default)]
pub struct ExtractOptions {
    /// Wildcard matched against each entry's path inside the archive.
    pub filter: Option<String>,
    /// Prefix output paths with the mount point (minus `../../../`).
    pub use_mount_point: bool,
    /// Write a response file that rebuilds the archive from the output.
    pub response_file: Option<PathBuf>,
    /// Write an order file listing entries by offset.
    pub order_file: Option<PathBuf>,
}

/// Per-file failures are collected here rather than aborting the run.
#[derive(Clone, Debug, Default)]
pub struct ExtractReport {
    pub extracted: Vec<PathBuf>,
    pub delete_records: usize,
    pub failures: Vec<(String, String)>,
}

impl ExtractReport {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Clone, Debug, Default)]
pub struct VerifyReport {
    pub checked: usize,
    pub failures: Vec<(String, String)>,
    /// `Some(true)` when a signature file was present and verified.
    pub signature_checked: Option<bool>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Rejects absolute paths and any `..` component.
pub fn safe_join(root: &Path, rel: &str) -> Result<PathBuf> {
    let p = Path::new(rel);
    let escapes = p
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes || rel.contains("..\\") {
        return Err(PakError::format(format!("unsafe path: {rel}")));
    }
    Ok(root.join(p))
}

fn selected<'a>(reader: &'a PakReader, filter: Option<&'a str>) -> impl Iterator<Item = &'a IndexEntry> {
    reader
        .entries()
        .iter()
        .filter(move |e| filter.is_none_or(|f| paths::wildcard_match(f, &e.filename)))
}

pub fn extract(reader: &PakReader, dest: &Path, opts: &ExtractOptions) -> Result<ExtractReport> {
    let mut report = ExtractReport::default();
    let prefix = match opts.use_mount_point {
        true => paths::strip_mount_prefix(reader.mount_point()).to_string(),
        false => String::new(),
    };
    let mut response_lines = Vec::new();
    let mut order_lines: Vec<(u64, String)> = Vec::new();

    for ie in selected(reader, opts.filter.as_deref()) {
        let full = reader.index.full_path(&ie.filename);
        if ie.entry.is_delete_record() {
            debug!(file = %full, "skipping delete record");
            report.delete_records += 1;
            response_lines.push(format!("\"{full}\" -delete"));
            continue;
        }
        let rel = format!("{prefix}{}", ie.filename);
        match extract_one(reader, ie, dest, &rel) {
            Ok(out) => {
                let mut line = format!("\"{}\" \"{full}\"", out.display());
                if ie.entry.is_compressed() {
                    line.push_str(" -compress");
                }
                if ie.entry.is_encrypted() {
                    line.push_str(" -encrypt");
                }
                response_lines.push(line);
                order_lines.push((ie.entry.offset, full));
                report.extracted.push(out);
            }
            Err(e) => {
                warn!(file = %full, error = %e, "extraction failed");
                report.failures.push((full, e.to_string()));
            }
        }
    }

    if let Some(p) = &opts.response_file {
        write_lines(p, response_lines.iter())?;
        info!(path = %p.display(), "wrote response file");
    }
    if let Some(p) = &opts.order_file {
        order_lines.sort();
        let lines = order_lines
            .iter()
            .enumerate()
            .map(|(i, (_, path))| format!("\"{path}\" {i}"));
        write_lines(p, lines)?;
        info!(path = %p.display(), "wrote order file");
    }
    info!(
        extracted = report.extracted.len(),
        failed = report.failures.len(),
        "extraction finished"
    );
    Ok(report)
}

fn extract_one(reader: &PakReader, ie: &IndexEntry, dest: &Path, rel: &str) -> Result<PathBuf> {
    let out = safe_join(dest, rel)?;
    if let Some(parent) = out.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut w = BufWriter::new(File::create(&out)?);
    reader.read_entry(&ie.entry, &mut w)?;
    w.flush()?;
    debug!(file = %out.display(), size = ie.entry.uncompressed_size, "extracted");
    Ok(out)
}

fn write_lines<I, S>(path: &Path, lines: I) -> Result<()>
where
    I: Iterator<Item = S>,
    S: AsRef<str>,
{
    let mut w = BufWriter::new(File::create(path)?);
    for l in lines {
        writeln!(w, "{}", l.as_ref())?;
    }
    w.flush()?;
    Ok(())
}

/// Re-reads every header and payload and checks them against the index.
/// The signature is checked too when a `.sig` file and public key exist.
pub fn verify(reader: &PakReader, keys: &crate::crypto::keychain::KeyChain) -> VerifyReport {
    let mut report = VerifyReport::default();
    for ie in reader.entries().iter().filter(|e| !e.entry.is_delete_record()) {
        report.checked += 1;
        let result = reader.check_header(&ie.entry).and_then(|_| {
            let stored = reader.stored_bytes(&ie.entry)?;
            if hash128(&stored) != ie.entry.hash {
                return Err(PakError::format("payload hash mismatch"));
            }
            Ok(())
        });
        if let Err(e) = result {
            warn!(file = %ie.filename, error = %e, "verification failed");
            report.failures.push((ie.filename.clone(), e.to_string()));
        }
    }
    match reader.verify_signature(keys) {
        Ok(checked) => report.signature_checked = Some(checked),
        Err(e) => {
            warn!(error = %e, "signature verification failed");
            report.signature_checked = Some(false);
            report.failures.push(("<signature>".to_string(), e.to_string()));
        }
    }
    info!(
        checked = report.checked,
        failed = report.failures.len(),
        "verification finished"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::collector::BuildEntry;
    use crate::crypto::keychain::KeyChain;
    use crate::pack::writer::{BuildOptions, build};

    #[test]
    fn safe_join_rejects_escapes() {
        let root = Path::new("/tmp/out");
        assert!(safe_join(root, "Game/a.txt").is_ok());
        assert!(safe_join(root, "../a.txt").is_err());
        assert!(safe_join(root, "Game/../../a.txt").is_err());
        assert!(safe_join(root, "/etc/passwd").is_err());
    }

    #[test]
    fn extracts_filtered_entries_with_reproduction_files() {
        let td = tempfile::tempdir().unwrap();
        let src = td.path().join("src");
        fs::create_dir_all(&src).unwrap();
        let mut entries = Vec::new();
        for (name, body) in [("a.txt", "alpha"), ("b.ini", "beta")] {
            fs::write(src.join(name), body).unwrap();
            entries.push(BuildEntry::new(
                src.join(name).to_string_lossy(),
                format!("../../../Game/{name}"),
            ));
        }
        entries.push(BuildEntry::delete_record("../../../Game/gone.txt"));
        let pak = td.path().join("t.pak");
        let keys = KeyChain::default();
        build(&entries, &keys, &BuildOptions::default(), &pak, None).unwrap();

        let reader = PakReader::open(&pak, &keys).unwrap();
        let out = td.path().join("out");
        let opts = ExtractOptions {
            use_mount_point: true,
            response_file: Some(td.path().join("resp.txt")),
            order_file: Some(td.path().join("order.txt")),
            ..Default::default()
        };
        let report = extract(&reader, &out, &opts).unwrap();
        assert!(report.is_ok());
        assert_eq!(report.delete_records, 1);
        assert_eq!(fs::read_to_string(out.join("Game/a.txt")).unwrap(), "alpha");
        let order = fs::read_to_string(td.path().join("order.txt")).unwrap();
        assert_eq!(
            order,
            "\"../../../Game/a.txt\" 0\n\"../../../Game/b.ini\" 1\n"
        );
        let resp = fs::read_to_string(td.path().join("resp.txt")).unwrap();
        assert!(resp.contains("\"../../../Game/gone.txt\" -delete"));

        let only_ini = ExtractOptions {
            filter: Some("*.ini".to_string()),
            ..Default::default()
        };
        let out2 = td.path().join("out2");
        let report = extract(&reader, &out2, &only_ini).unwrap();
        assert_eq!(report.extracted, vec![out2.join("b.ini")]);

        let v = verify(&reader, &keys);
        assert!(v.is_ok());
        assert_eq!(v.checked, 2);
        assert_eq!(v.signature_checked, Some(false));
    }
}
