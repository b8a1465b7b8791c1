//! Archive signatures.
//!
//! The archive bytes are split into 64 KiB chunks and a CRC32 is kept per
//! chunk. The `.sig` file next to the archive stores that table together with
//! a raw RSA signature over its BLAKE3 digest, so a loader can verify any
//! chunk it reads without hashing the whole archive.

use crate::error::{PakError, Result};
use rsa::BigUint;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

pub const SIGNATURE_CHUNK: usize = 64 * 1024;
const SIG_MAGIC: [u8; 8] = *b"PAKSIG\0\x01";

/// One half of an RSA key: `(exponent, modulus)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RsaKeyParts {
    pub exponent: BigUint,
    pub modulus: BigUint,
}

/// Write adapter that forwards everything to `inner` while recording the
/// CRC32 of every 64 KiB chunk that passes through.
pub struct SigningWriter<W: Write> {
    inner: W,
    chunk_hashes: Vec<u32>,
    current: crc32fast::Hasher,
    current_len: usize,
}

impl<W: Write> SigningWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            chunk_hashes: Vec::new(),
            current: crc32fast::Hasher::new(),
            current_len: 0,
        }
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    /// Flushes the trailing partial chunk and returns the inner writer with
    /// the complete chunk table.
    pub fn finish(mut self) -> (W, Vec<u32>) {
        if self.current_len > 0 {
            let h = std::mem::replace(&mut self.current, crc32fast::Hasher::new());
            self.chunk_hashes.push(h.finalize());
        }
        (self.inner, self.chunk_hashes)
    }

    fn record(&mut self, mut buf: &[u8]) {
        while !buf.is_empty() {
            let take = (SIGNATURE_CHUNK - self.current_len).min(buf.len());
            self.current.update(&buf[..take]);
            self.current_len += take;
            buf = &buf[take..];
            if self.current_len == SIGNATURE_CHUNK {
                let h = std::mem::replace(&mut self.current, crc32fast::Hasher::new());
                self.chunk_hashes.push(h.finalize());
                self.current_len = 0;
            }
        }
    }
}

impl<W: Write> Write for SigningWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.record(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Chunk table of an existing archive, as [`SigningWriter`] would have
/// produced it.
pub fn compute_chunk_hashes<R: Read>(mut r: R) -> std::io::Result<Vec<u32>> {
    let mut out = Vec::new();
    let mut buf = vec![0u8; SIGNATURE_CHUNK];
    loop {
        let mut filled = 0;
        while filled < SIGNATURE_CHUNK {
            let n = r.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            break;
        }
        out.push(crc32fast::hash(&buf[..filled]));
        if filled < SIGNATURE_CHUNK {
            break;
        }
    }
    Ok(out)
}

pub fn sig_path_for(archive: &Path) -> PathBuf {
    archive.with_extension("sig")
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignatureFile {
    pub chunk_hashes: Vec<u32>,
    pub signature: Vec<u8>,
}

impl SignatureFile {
    pub fn sign(chunk_hashes: Vec<u32>, private: &RsaKeyParts) -> Result<Self> {
        let m = table_digest(&chunk_hashes);
        if m >= private.modulus {
            return Err(PakError::crypto("signing modulus is too small for the digest"));
        }
        let s = m.modpow(&private.exponent, &private.modulus);
        Ok(Self {
            chunk_hashes,
            signature: s.to_bytes_le(),
        })
    }

    /// Checks the signature against `public` and the chunk table against the
    /// archive's actual chunk hashes.
    pub fn verify(&self, public: &RsaKeyParts, actual_chunks: &[u32]) -> Result<()> {
        let s = BigUint::from_bytes_le(&self.signature);
        let recovered = s.modpow(&public.exponent, &public.modulus);
        if recovered != table_digest(&self.chunk_hashes) {
            return Err(PakError::crypto("signature does not match the chunk table"));
        }
        if self.chunk_hashes.len() != actual_chunks.len() {
            return Err(PakError::crypto(format!(
                "chunk table has {} entries, archive has {} chunks",
                self.chunk_hashes.len(),
                actual_chunks.len()
            )));
        }
        if let Some(i) = self
            .chunk_hashes
            .iter()
            .zip(actual_chunks)
            .position(|(a, b)| a != b)
        {
            return Err(PakError::crypto(format!("chunk {i} failed its signature check")));
        }
        Ok(())
    }

    pub fn write_to<W: Write>(&self, mut w: W) -> std::io::Result<()> {
        w.write_all(&SIG_MAGIC)?;
        w.write_all(&(self.chunk_hashes.len() as u32).to_le_bytes())?;
        for h in &self.chunk_hashes {
            w.write_all(&h.to_le_bytes())?;
        }
        w.write_all(&(self.signature.len() as u32).to_le_bytes())?;
        w.write_all(&self.signature)?;
        Ok(())
    }

    pub fn read_from<R: Read>(mut r: R) -> std::io::Result<Self> {
        let mut magic = [0u8; 8];
        r.read_exact(&mut magic)?;
        if magic != SIG_MAGIC {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "bad signature magic",
            ));
        }
        let mut b4 = [0u8; 4];
        r.read_exact(&mut b4)?;
        let count = u32::from_le_bytes(b4) as usize;
        let mut chunk_hashes = Vec::with_capacity(count.min(1 << 20));
        for _ in 0..count {
            r.read_exact(&mut b4)?;
            chunk_hashes.push(u32::from_le_bytes(b4));
        }
        r.read_exact(&mut b4)?;
        let mut signature = vec![0u8; u32::from_le_bytes(b4) as usize];
        r.read_exact(&mut signature)?;
        Ok(Self {
            chunk_hashes,
            signature,
        })
    }
}

fn table_digest(chunk_hashes: &[u32]) -> BigUint {
    let mut h = blake3::Hasher::new();
    for c in chunk_hashes {
        h.update(&c.to_le_bytes());
    }
    BigUint::from_bytes_le(h.finalize().as_bytes())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rsa::traits::{PrivateKeyParts, PublicKeyParts};

    /// Deterministic test key built from two Mersenne primes.
    pub(crate) fn test_key_pair() -> (RsaKeyParts, RsaKeyParts) {
        let one = BigUint::from(1u32);
        let p = (BigUint::from(1u32) << 127usize) - &one;
        let q = (BigUint::from(1u32) << 521usize) - &one;
        let key = rsa::RsaPrivateKey::from_p_q(p, q, BigUint::from(65537u32)).unwrap();
        let public = RsaKeyParts {
            exponent: key.e().clone(),
            modulus: key.n().clone(),
        };
        let private = RsaKeyParts {
            exponent: key.d().clone(),
            modulus: key.n().clone(),
        };
        (public, private)
    }

    #[test]
    fn writer_records_one_crc_per_chunk() {
        let data = vec![3u8; SIGNATURE_CHUNK * 2 + 10];
        let mut w = SigningWriter::new(Vec::new());
        for piece in data.chunks(1000) {
            w.write_all(piece).unwrap();
        }
        let (inner, chunks) = w.finish();
        assert_eq!(inner, data);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks, compute_chunk_hashes(&data[..]).unwrap());
    }

    #[test]
    fn sign_and_verify() {
        let (public, private) = test_key_pair();
        let chunks = vec![1, 2, 3];
        let sig = SignatureFile::sign(chunks.clone(), &private).unwrap();

        let mut bytes = Vec::new();
        sig.write_to(&mut bytes).unwrap();
        let back = SignatureFile::read_from(&bytes[..]).unwrap();
        assert_eq!(back, sig);

        back.verify(&public, &chunks).unwrap();
        assert!(back.verify(&public, &[1, 2, 4]).is_err());

        let mut forged = back.clone();
        forged.chunk_hashes[0] = 9;
        assert!(forged.verify(&public, &[9, 2, 3]).is_err());
    }
}
