use crate::error::{PakError, Result};

/// Parses a byte count with an optional `KB`/`MB`/`GB` suffix (binary units).
pub fn parse_size(text: &str) -> Result<u64> {
    let t = text.trim();
    let upper = t.to_ascii_uppercase();
    let (digits, mul) = if let Some(d) = upper.strip_suffix("GB") {
        (d, 1u64 << 30)
    } else if let Some(d) = upper.strip_suffix("MB") {
        (d, 1u64 << 20)
    } else if let Some(d) = upper.strip_suffix("KB") {
        (d, 1u64 << 10)
    } else {
        (upper.as_str(), 1u64)
    };
    let n: u64 = digits
        .trim()
        .parse()
        .map_err(|_| PakError::config(format!("invalid size: {text}")))?;
    n.checked_mul(mul)
        .ok_or_else(|| PakError::config(format!("size overflows: {text}")))
}

pub fn align_up(value: u64, align: u64) -> u64 {
    if align == 0 {
        return value;
    }
    value.div_ceil(align) * align
}
