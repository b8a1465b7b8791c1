use crate::error::{PakError, Result};

/// Parses a fixed-size byte array from hex, e.g. a raw AES key passed on the
/// command line.
pub fn parse_hex_array<const N: usize>(hex_str: &str) -> Result<[u8; N]> {
    let mut out = [0u8; N];
    let bytes = hex::decode(hex_str.trim().trim_start_matches("0x"))
        .map_err(|e| PakError::config(format!("invalid hex: {e}")))?;
    if bytes.len() != N {
        return Err(PakError::config(format!(
            "expected {N} bytes ({} hex chars), got {}",
            N * 2,
            bytes.len()
        )));
    }
    out.copy_from_slice(&bytes);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_exact_length_only() {
        let k: [u8; 4] = parse_hex_array("0xdeadbeef").unwrap();
        assert_eq!(k, [0xde, 0xad, 0xbe, 0xef]);
        assert!(parse_hex_array::<4>("dead").is_err());
        assert!(parse_hex_array::<1>("zz").is_err());
    }
}
