//! Placement priorities loaded from open-order logs.

use crate::error::Result;
use crate::util::paths;
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

/// Returned by lookups that found nothing.
pub const NO_ORDER: u64 = u64::MAX;
/// Where the collector puts files that have no order of their own.
pub const UNORDERED_FILE_ORDER: u64 = 1 << 28;
pub const UEXP_ORDER_BIAS: u64 = 1 << 29;
pub const UBULK_ORDER_BIAS: u64 = 1 << 30;

const L10N_PREFIX: &str = "/content/l10n/";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OrderLookup {
    pub order: Option<u64>,
    /// Set only on a direct hit.
    pub is_primary: Option<bool>,
    /// Region segment removed from a localized path.
    pub region: Option<String>,
}

#[derive(Clone, Debug)]
pub struct OrderMap {
    orders: HashMap<String, u64>,
    max_primary_order: u64,
}

impl Default for OrderMap {
    fn default() -> Self {
        Self {
            orders: HashMap::new(),
            max_primary_order: NO_ORDER,
        }
    }
}

impl OrderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    /// Merges an order file. A secondary file is numbered after everything
    /// loaded so far and never replaces an existing path.
    pub fn load(&mut self, path: &Path, secondary: bool) -> Result<()> {
        info!(path = %path.display(), secondary, "loading pak order file");
        let text = std::fs::read_to_string(path).inspect_err(|e| {
            warn!(path = %path.display(), error = %e, "unable to load pak order file");
        })?;
        self.load_str(&text, secondary);
        Ok(())
    }

    pub fn load_str(&mut self, text: &str, secondary: bool) {
        let offset = if secondary {
            self.max_primary_order = self.orders.len() as u64;
            self.orders.len() as u64
        } else {
            0
        };
        let lines = text
            .split('\n')
            .map(|l| l.trim_end_matches('\r'))
            .filter(|l| !l.trim().is_empty());
        for (line_index, line) in lines.enumerate() {
            let (raw_path, explicit) = split_order_line(line);
            let order = explicit.unwrap_or(line_index as u64) + offset;
            let key = paths::normalize(raw_path).to_lowercase();
            if secondary && self.orders.contains_key(&key) {
                continue;
            }
            self.orders.insert(key, order);
        }
    }

    pub fn insert(&mut self, path: &str, order: u64) {
        self.orders
            .insert(paths::normalize(path).to_lowercase(), order);
    }

    pub fn priority_of(&self, path: &str, allow_fallback: bool) -> OrderLookup {
        let lower = paths::normalize(path).to_lowercase();
        let (key, region) = remap_localized_path(&lower);
        let mut out = OrderLookup {
            region,
            ..Default::default()
        };
        if let Some(&order) = self.orders.get(&key) {
            out.order = Some(order);
            out.is_primary = Some(order < self.max_primary_order);
        } else if allow_fallback && (lower.ends_with("uexp") || lower.ends_with("ubulk")) {
            let base = paths::base_filename(path);
            let counterpart = self
                .priority_of(&format!("{base}.uasset"), false)
                .order
                .or_else(|| self.priority_of(&format!("{base}.umap"), false).order);
            if let Some(c) = counterpart {
                let bias = if lower.ends_with("uexp") {
                    UEXP_ORDER_BIAS
                } else {
                    UBULK_ORDER_BIAS
                };
                out.order = Some(c | bias);
            }
        }
        out
    }

    /// Shorthand for the order alone, `NO_ORDER` when absent.
    pub fn order_or_none(&self, path: &str, allow_fallback: bool) -> u64 {
        self.priority_of(path, allow_fallback)
            .order
            .unwrap_or(NO_ORDER)
    }
}

/// Splits `"path" 12`, `path 12`, `"path"` or `path` into path and number.
fn split_order_line(line: &str) -> (&str, Option<u64>) {
    let line = line.trim();
    if let Some(q) = line.rfind('"') {
        let tail = line[q + 1..].trim();
        let head = line[..=q].trim_matches('"');
        return (head, tail.parse::<u64>().ok());
    }
    if let Some(sp) = line.rfind(char::is_whitespace) {
        if let Ok(n) = line[sp + 1..].parse::<u64>() {
            return (line[..sp].trim(), Some(n));
        }
    }
    (line, None)
}

/// `/content/l10n/<region>/x` becomes `/content/x` when that `/content/` is
/// the first one in the path and the region has at least two characters.
fn remap_localized_path(lower: &str) -> (String, Option<String>) {
    if let Some(found) = lower.find(L10N_PREFIX) {
        if found > 0 && lower.find("/content/") == Some(found) {
            let region_start = found + L10N_PREFIX.len();
            if let Some(rel_slash) = lower[region_start..].find('/') {
                if rel_slash >= 2 {
                    let next_slash = region_start + rel_slash;
                    let neutral = format!("{}/content{}", &lower[..found], &lower[next_slash..]);
                    return (neutral, Some(lower[region_start..next_slash].to_string()));
                }
            }
        }
    }
    (lower.to_string(), None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_quoted_bare_and_numbered_lines() {
        let mut m = OrderMap::new();
        m.load_str(
            "\"../../../Game/Content/A.uasset\" 40\r\n\n../../../Game/Content/b.uasset\n\"../../../Game/Content/with space.uasset\"\n../../../Game/Content/c.uasset 7\n",
            false,
        );
        assert_eq!(m.order_or_none("../../../game/content/a.uasset", false), 40);
        assert_eq!(m.order_or_none("../../../Game/Content/b.uasset", false), 1);
        assert_eq!(m.order_or_none("../../../Game/Content/with space.uasset", false), 2);
        assert_eq!(m.order_or_none("../../../Game/Content/c.uasset", false), 7);
    }

    #[test]
    fn companion_fallback_uses_distinct_biased_ranges() {
        let mut m = OrderMap::new();
        m.insert("foo.uasset", 5);
        let uexp = m.order_or_none("foo.uexp", true);
        let ubulk = m.order_or_none("foo.ubulk", true);
        assert_eq!(uexp, 5 | UEXP_ORDER_BIAS);
        assert_eq!(ubulk, 5 | UBULK_ORDER_BIAS);
        assert!(uexp > 5 && uexp != ubulk);
        assert_eq!(m.order_or_none("foo.uexp", false), NO_ORDER);

        let mut maps = OrderMap::new();
        maps.insert("level.umap", 3);
        assert_eq!(maps.order_or_none("level.uexp", true), 3 | UEXP_ORDER_BIAS);
        assert_eq!(maps.priority_of("level.uexp", true).is_primary, None);
    }

    #[test]
    fn secondary_orders_follow_primary_and_never_replace() {
        let mut m = OrderMap::new();
        m.load_str("a.uasset\nb.uasset\n", false);
        m.load_str("b.uasset\nc.uasset\n", true);
        assert_eq!(m.order_or_none("b.uasset", false), 1);
        assert_eq!(m.order_or_none("c.uasset", false), 3);
        assert_eq!(m.priority_of("a.uasset", false).is_primary, Some(true));
        assert_eq!(m.priority_of("c.uasset", false).is_primary, Some(false));
    }

    #[test]
    fn localized_paths_map_to_neutral_entries() {
        let mut m = OrderMap::new();
        m.insert("../../../Game/Content/UI/logo.uasset", 9);
        let hit = m.priority_of("../../../Game/Content/L10N/fr/UI/logo.uasset", false);
        assert_eq!(hit.order, Some(9));
        assert_eq!(hit.region.as_deref(), Some("fr"));

        // single-letter regions are not treated as localization folders
        assert_eq!(
            m.order_or_none("../../../Game/Content/L10N/f/UI/logo.uasset", false),
            NO_ORDER
        );
    }

    #[test]
    fn missing_file_is_reported() {
        let mut m = OrderMap::new();
        assert!(m.load(Path::new("/definitely/not/here.txt"), false).is_err());
        assert!(m.is_empty());
    }
}
