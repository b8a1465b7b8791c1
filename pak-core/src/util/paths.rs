//! String path helpers. Archive paths always use `/` separators and are
//! compared the way the loader compares them, so these work on `&str`
//! rather than `Path`.

/// Prefix that destination paths carry relative to the engine root.
pub const MOUNT_PREFIX: &str = "../../../";

pub fn normalize(path: &str) -> String {
    path.replace('\\', "/")
}

/// Portion before the last `/`, without the separator.
pub fn directory(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[..i],
        None => "",
    }
}

pub fn clean_filename(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[i + 1..],
        None => path,
    }
}

/// Extension of the final component, without the dot.
pub fn extension(path: &str) -> &str {
    let name = clean_filename(path);
    match name.rfind('.') {
        Some(i) => &name[i + 1..],
        None => "",
    }
}

/// Full path with the extension of the final component removed.
pub fn base_filename(path: &str) -> &str {
    let name_start = path.rfind('/').map(|i| i + 1).unwrap_or(0);
    match path[name_start..].rfind('.') {
        Some(i) => &path[..name_start + i],
        None => path,
    }
}

pub fn change_extension(path: &str, ext: &str) -> String {
    format!("{}.{}", base_filename(path), ext)
}

pub fn has_extension(path: &str, ext: &str) -> bool {
    extension(path).eq_ignore_ascii_case(ext)
}

pub fn is_uexp(path: &str) -> bool {
    has_extension(path, "uexp")
}

pub fn is_ubulk(path: &str) -> bool {
    has_extension(path, "ubulk")
}

/// Primary half of a companion pair.
pub fn is_package(path: &str) -> bool {
    has_extension(path, "uasset") || has_extension(path, "umap")
}

/// Bulk data that the runtime memory-maps straight out of the archive.
pub fn is_mapped_bulk(path: &str) -> bool {
    path.to_ascii_lowercase().ends_with(".m.ubulk")
}

/// Directory form with a trailing slash, as used for mount points and
/// destination directories.
pub fn as_directory(path: &str) -> String {
    let mut p = normalize(path);
    if !p.is_empty() && !p.ends_with('/') {
        p.push('/');
    }
    p
}

pub fn strip_mount_prefix(path: &str) -> &str {
    path.strip_prefix(MOUNT_PREFIX).unwrap_or(path)
}

/// Replaces `from` with `to` when `path` starts with it, ignoring ASCII case.
pub fn replace_prefix_ignore_case(path: &str, from: &str, to: &str) -> String {
    if path.len() >= from.len()
        && path.is_char_boundary(from.len())
        && path[..from.len()].eq_ignore_ascii_case(from)
    {
        format!("{}{}", to, &path[from.len()..])
    } else {
        path.to_string()
    }
}

/// Longest directory prefix (ending in `/`) shared by every path, compared
/// case-insensitively.
pub fn common_root<'a, I>(paths: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut root: Option<String> = None;
    for p in paths {
        let dir = format!("{}/", directory(p));
        root = Some(match root {
            None => dir,
            Some(r) => {
                let mut common = 0;
                for (i, (a, b)) in r.bytes().zip(dir.bytes()).enumerate() {
                    if !a.eq_ignore_ascii_case(&b) {
                        break;
                    }
                    if a == b'/' {
                        common = i + 1;
                    }
                }
                r[..common].to_string()
            }
        });
    }
    root.unwrap_or_default()
}

/// `*` and `?` matching over a single file name, ignoring ASCII case.
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    let p: Vec<u8> = pattern.bytes().map(|b| b.to_ascii_lowercase()).collect();
    let n: Vec<u8> = name.bytes().map(|b| b.to_ascii_lowercase()).collect();
    let (mut pi, mut ni) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while ni < n.len() {
        if pi < p.len() && (p[pi] == b'?' || p[pi] == n[ni]) {
            pi += 1;
            ni += 1;
        } else if pi < p.len() && p[pi] == b'*' {
            star = Some((pi, ni));
            pi += 1;
        } else if let Some((sp, sn)) = star {
            pi = sp + 1;
            ni = sn + 1;
            star = Some((sp, sn + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == b'*' {
        pi += 1;
    }
    // "*.*" also matches names without an extension
    pi == p.len() || &p[pi..] == b".*"
}

/// Patch level encoded as `_<N>_P.pak`; the base archive is -1.
pub fn pak_priority_from_filename(path: &str) -> i32 {
    let name = clean_filename(path);
    let Some(stem) = name.strip_suffix("_P.pak") else {
        return -1;
    };
    match stem.rfind('_') {
        Some(i) => stem[i + 1..].parse::<i32>().unwrap_or(-1),
        None => -1,
    }
}

/// Chunk index encoded as `pakchunk<N>`, or -1.
pub fn pak_chunk_index_from_filename(path: &str) -> i32 {
    let name = clean_filename(path).to_ascii_lowercase();
    let Some(i) = name.find("pakchunk") else {
        return -1;
    };
    let digits: String = name[i + "pakchunk".len()..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse::<i32>().unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_path_parts() {
        assert_eq!(directory("a/b/c.uasset"), "a/b");
        assert_eq!(clean_filename("a/b/c.uasset"), "c.uasset");
        assert_eq!(extension("a/b.dir/c"), "");
        assert_eq!(base_filename("a/b/c.m.ubulk"), "a/b/c.m");
        assert_eq!(change_extension("a/b/c.uasset", "uexp"), "a/b/c.uexp");
    }

    #[test]
    fn common_root_stops_at_separator() {
        let root = common_root(["../../../Game/Content/a.uasset", "../../../Game/Config/b.ini"]);
        assert_eq!(root, "../../../Game/");
        let root = common_root(["x/abc/1.txt", "x/abd/2.txt"]);
        assert_eq!(root, "x/");
    }

    #[test]
    fn wildcards() {
        assert!(wildcard_match("*.*", "readme"));
        assert!(wildcard_match("*.uasset", "Hero.UASSET"));
        assert!(wildcard_match("h?ro*", "hero_01.umap"));
        assert!(!wildcard_match("*.uexp", "hero.uasset"));
    }

    #[test]
    fn priorities_and_chunks_from_names() {
        assert_eq!(pak_priority_from_filename("dir/pakchunk0-Windows_3_P.pak"), 3);
        assert_eq!(pak_priority_from_filename("dir/pakchunk0-Windows.pak"), -1);
        assert_eq!(pak_chunk_index_from_filename("dir/pakchunk12-Windows_0_P.pak"), 12);
        assert_eq!(pak_chunk_index_from_filename("dir/Game.pak"), -1);
    }

    #[test]
    fn prefix_replacement_ignores_case() {
        assert_eq!(
            replace_prefix_ignore_case("C:/Cooked/Game/a.txt", "c:/cooked/", "../../../"),
            "../../../Game/a.txt"
        );
        assert_eq!(replace_prefix_ignore_case("x/a.txt", "y/", "z/"), "x/a.txt");
    }
}
