use std::io::Read;

pub const HASH_LEN: usize = 16;

/// 128-bit content digest: a truncated BLAKE3.
pub type Hash128 = [u8; HASH_LEN];

pub fn hash128(bytes: &[u8]) -> Hash128 {
    truncate(blake3::hash(bytes))
}

pub fn hash128_reader<R: Read>(mut r: R) -> std::io::Result<(Hash128, u64)> {
    let mut h = blake3::Hasher::new();
    let mut buf = vec![0u8; 1 << 16];
    let mut total = 0u64;
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        h.update(&buf[..n]);
        total += n as u64;
    }
    Ok((truncate(h.finalize()), total))
}

pub fn truncate(h: blake3::Hash) -> Hash128 {
    let mut out = [0u8; HASH_LEN];
    out.copy_from_slice(&h.as_bytes()[..HASH_LEN]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_and_slice_agree() {
        let data = vec![7u8; 200_000];
        let (h, n) = hash128_reader(&data[..]).unwrap();
        assert_eq!(n, 200_000);
        assert_eq!(h, hash128(&data));
        assert_ne!(h, hash128(&data[1..]));
    }
}
