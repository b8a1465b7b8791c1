//! Key chain: the master encryption key, any secondary named keys, and the
//! optional signing key pair, loaded from the JSON crypto settings file.

use super::aes::AesKey;
use super::signing::RsaKeyParts;
use crate::error::{PakError, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rsa::BigUint;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct NamedKey {
    pub guid: Uuid,
    pub name: String,
    pub key: AesKey,
}

#[derive(Clone, Debug)]
pub struct SigningKeyPair {
    pub public: RsaKeyParts,
    pub private: Option<RsaKeyParts>,
}

#[derive(Clone, Debug, Default)]
pub struct KeyChain {
    pub signing_key: Option<SigningKeyPair>,
    pub encryption_keys: HashMap<Uuid, NamedKey>,
    pub master_guid: Option<Uuid>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KeyChainJson {
    encryption_key: Option<EncryptionKeyJson>,
    signing_key: Option<SigningKeyJson>,
    #[serde(default)]
    secondary_encryption_keys: Vec<EncryptionKeyJson>,
    encryption_key_override_guid: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EncryptionKeyJson {
    key: String,
    name: Option<String>,
    guid: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SigningKeyJson {
    public_key: RsaPartsJson,
    private_key: Option<RsaPartsJson>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RsaPartsJson {
    exponent: String,
    modulus: String,
}

impl KeyChain {
    /// Key chain holding a single master key under the zero GUID.
    pub fn with_master_key(key: [u8; 32]) -> Self {
        let mut kc = KeyChain::default();
        kc.encryption_keys.insert(
            Uuid::nil(),
            NamedKey {
                guid: Uuid::nil(),
                name: "Default".to_string(),
                key: AesKey(key),
            },
        );
        kc.master_guid = Some(Uuid::nil());
        kc
    }

    pub fn load_json(path: &Path) -> Result<Self> {
        info!(path = %path.display(), "loading key chain");
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let raw: KeyChainJson = serde_json::from_str(text)
            .map_err(|e| PakError::config(format!("key chain JSON: {e}")))?;
        let mut kc = KeyChain::default();

        if let Some(master) = raw.encryption_key {
            kc.encryption_keys.insert(
                Uuid::nil(),
                NamedKey {
                    guid: Uuid::nil(),
                    name: master.name.unwrap_or_else(|| "Default".to_string()),
                    key: decode_aes_key(&master.key)?,
                },
            );
            kc.master_guid = Some(Uuid::nil());
        }

        for k in raw.secondary_encryption_keys {
            let guid_text = k
                .guid
                .ok_or_else(|| PakError::config("secondary encryption key without Guid"))?;
            let guid = parse_guid(&guid_text)?;
            debug!(%guid, "secondary encryption key");
            kc.encryption_keys.insert(
                guid,
                NamedKey {
                    guid,
                    name: k.name.unwrap_or_default(),
                    key: decode_aes_key(&k.key)?,
                },
            );
        }

        if let Some(s) = raw.signing_key {
            kc.signing_key = Some(SigningKeyPair {
                public: decode_rsa(&s.public_key)?,
                private: s.private_key.as_ref().map(decode_rsa).transpose()?,
            });
        }

        if let Some(g) = raw.encryption_key_override_guid {
            kc.select_master(parse_guid(&g)?)?;
        }
        Ok(kc)
    }

    /// Makes the key registered under `guid` the master key.
    pub fn select_master(&mut self, guid: Uuid) -> Result<()> {
        if !self.encryption_keys.contains_key(&guid) {
            return Err(PakError::crypto(format!("no encryption key with guid {guid}")));
        }
        self.master_guid = Some(guid);
        Ok(())
    }

    pub fn master_key(&self) -> Option<&NamedKey> {
        self.master_guid.and_then(|g| self.encryption_keys.get(&g))
    }

    pub fn key_for(&self, guid: &Uuid) -> Option<&NamedKey> {
        self.encryption_keys.get(guid)
    }
}

pub fn parse_guid(text: &str) -> Result<Uuid> {
    Uuid::parse_str(text.trim().trim_start_matches("0x"))
        .map_err(|e| PakError::config(format!("invalid guid {text}: {e}")))
}

fn decode_b64(text: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(text.trim())
        .map_err(|e| PakError::config(format!("invalid base64: {e}")))
}

fn decode_aes_key(text: &str) -> Result<AesKey> {
    let bytes = decode_b64(text)?;
    let key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
        PakError::crypto(format!("encryption key must be 32 bytes, got {}", bytes.len()))
    })?;
    Ok(AesKey(key))
}

fn decode_rsa(parts: &RsaPartsJson) -> Result<RsaKeyParts> {
    Ok(RsaKeyParts {
        exponent: BigUint::from_bytes_le(&decode_b64(&parts.exponent)?),
        modulus: BigUint::from_bytes_le(&decode_b64(&parts.modulus)?),
    })
}
