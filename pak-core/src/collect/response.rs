//! Response files and positional inputs.
//!
//! A response file has one input per line:
//!
//! ```text
//! "C:/Cooked/Game/*.*" "../../../Game/" -compress
//! "C:/Cooked/Game/Old.uasset" -delete
//! ```

use super::collector::BuildEntry;
use crate::error::Result;
use crate::util::paths;
use std::path::Path;
use tracing::{info, warn};

/// Flags applied to every input on top of its own switches.
#[derive(Clone, Debug, Default)]
pub struct ResponseOptions {
    pub compress: bool,
    pub encrypt: bool,
    pub align_for_memory_mapping: u64,
}

pub fn load_response_file(path: &Path, opts: &ResponseOptions) -> Result<Vec<BuildEntry>> {
    let text = std::fs::read_to_string(path)?;
    let entries = parse_response_text(&text, opts);
    info!(path = %path.display(), entries = entries.len(), "loaded response file");
    Ok(entries)
}

pub fn parse_response_text(text: &str, opts: &ResponseOptions) -> Vec<BuildEntry> {
    let mut out = Vec::new();
    for line in text.lines() {
        let (tokens, switches) = tokenize(line);
        let Some(source) = tokens.first() else {
            continue;
        };
        let source = paths::normalize(source);
        let has = |name: &str| switches.iter().any(|s| s.eq_ignore_ascii_case(name));

        if has("delete") {
            out.push(BuildEntry::delete_record(source));
            continue;
        }
        let dest_dir = match tokens.get(1) {
            Some(d) => paths::directory(&paths::normalize(d)).to_string(),
            None => paths::directory(&source).to_string(),
        };
        let mut e = BuildEntry::new(source, paths::as_directory(&dest_dir));
        e.needs_compression = has("compress") || opts.compress;
        e.needs_encryption = has("encrypt") || opts.encrypt;
        if e.needs_compression
            && opts.align_for_memory_mapping > 0
            && !e.needs_encryption
            && paths::is_mapped_bulk(&e.source)
        {
            e.needs_compression = false;
        }
        if tokens.len() > 2 {
            warn!(line, "ignoring extra tokens in response file line");
        }
        out.push(e);
    }
    out
}

/// Inputs given on the command line. With a mount point each source
/// directory maps onto it; otherwise files keep their own directory.
pub fn entries_from_paths(
    sources: &[String],
    mount_point: Option<&str>,
    opts: &ResponseOptions,
) -> Vec<BuildEntry> {
    sources
        .iter()
        .map(|s| {
            let source = paths::normalize(s);
            let dest = match mount_point {
                Some(m) => paths::as_directory(m),
                None => paths::as_directory(paths::directory(&source)),
            };
            let mut e = BuildEntry::new(source, dest);
            e.needs_compression = opts.compress;
            e.needs_encryption = opts.encrypt;
            e
        })
        .collect()
}

/// Splits a line into quoted or bare tokens and `-switch` words.
fn tokenize(line: &str) -> (Vec<String>, Vec<String>) {
    let mut tokens = Vec::new();
    let mut switches = Vec::new();
    let mut chars = line.trim_end_matches('\r').chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c == '"' {
            chars.next();
            let tok: String = chars.by_ref().take_while(|&c| c != '"').collect();
            tokens.push(tok);
            continue;
        }
        let mut tok = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_whitespace() {
                break;
            }
            tok.push(c);
            chars.next();
        }
        match tok.strip_prefix('-') {
            Some(sw) => switches.push(sw.to_string()),
            None => tokens.push(tok),
        }
    }
    (tokens, switches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_destinations_and_switches() {
        let text = "\"C:/Cooked/Game/*.*\" \"../../../Game/\" -compress\r\n\
                    \r\n\
                    C:\\Cooked\\Game\\a.ini ../../../Game/Config/a.ini -Encrypt\r\n\
                    \"C:/Cooked/Game/old.uasset\" -delete\n\
                    \"C:/Cooked/Game/solo.txt\"\n";
        let got = parse_response_text(text, &ResponseOptions::default());
        assert_eq!(got.len(), 4);
        assert_eq!(got[0].dest, "../../../Game/");
        assert!(got[0].needs_compression && !got[0].needs_encryption);
        assert_eq!(got[1].source, "C:/Cooked/Game/a.ini");
        assert_eq!(got[1].dest, "../../../Game/Config/");
        assert!(got[1].needs_encryption);
        assert!(got[2].is_delete_record);
        assert_eq!(got[2].dest, "C:/Cooked/Game/old.uasset");
        assert_eq!(got[3].dest, "C:/Cooked/Game/");
    }

    #[test]
    fn mapped_bulk_drops_compression_when_aligned() {
        let opts = ResponseOptions {
            compress: true,
            align_for_memory_mapping: 16384,
            ..Default::default()
        };
        let got = parse_response_text("\"d/x.m.ubulk\" \"../../../G/\"\n\"d/y.ubulk\" \"../../../G/\"", &opts);
        assert!(!got[0].needs_compression);
        assert!(got[1].needs_compression);
    }

    #[test]
    fn positional_paths_use_mount_point() {
        let got = entries_from_paths(
            &["/data/in/*.*".to_string(), "/data/one.txt".to_string()],
            Some("../../../Game"),
            &ResponseOptions::default(),
        );
        assert_eq!(got[0].dest, "../../../Game/");
        assert_eq!(got[1].dest, "../../../Game/");
        let got = entries_from_paths(&["/data/one.txt".to_string()], None, &ResponseOptions::default());
        assert_eq!(got[0].dest, "/data/");
    }
}
