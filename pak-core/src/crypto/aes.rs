use crate::error::{PakError, Result};
use aes::Aes256;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};

pub const AES_BLOCK: usize = 16;

/// Raw AES-256 key. Data is processed block by block, so every encrypted
/// region must be a multiple of [`AES_BLOCK`].
#[derive(Clone, PartialEq, Eq)]
pub struct AesKey(pub [u8; 32]);

impl std::fmt::Debug for AesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AesKey(..)")
    }
}

impl AesKey {
    pub fn encrypt_in_place(&self, data: &mut [u8]) -> Result<()> {
        check_len(data.len())?;
        let cipher = Aes256::new(GenericArray::from_slice(&self.0));
        for block in data.chunks_exact_mut(AES_BLOCK) {
            cipher.encrypt_block(GenericArray::from_mut_slice(block));
        }
        Ok(())
    }

    pub fn decrypt_in_place(&self, data: &mut [u8]) -> Result<()> {
        check_len(data.len())?;
        let cipher = Aes256::new(GenericArray::from_slice(&self.0));
        for block in data.chunks_exact_mut(AES_BLOCK) {
            cipher.decrypt_block(GenericArray::from_mut_slice(block));
        }
        Ok(())
    }
}

fn check_len(len: usize) -> Result<()> {
    if len % AES_BLOCK != 0 {
        return Err(PakError::crypto(format!(
            "encrypted region of {len} bytes is not a multiple of {AES_BLOCK}"
        )));
    }
    Ok(())
}

/// Extends `buf` to the next multiple of `align` by repeating its own bytes
/// from the start, so padding never depends on a random source.
pub fn pad_deterministic(buf: &mut Vec<u8>, align: usize) {
    let size = buf.len();
    if size == 0 || align == 0 {
        return;
    }
    let target = size.div_ceil(align) * align;
    for i in size..target {
        let b = buf[i % size];
        buf.push(b);
    }
}
