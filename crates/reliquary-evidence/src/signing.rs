//! Manifest signing (RSA-PSS, SHA-256, MGF1-SHA256, maximum salt length).
//!
//! # Signing Process
//!
//! ```text
//! 1. Check manifest_hash == SHA256(JCS(manifest without manifest_hash))
//! 2. signature = RSASSA-PSS-SIGN(private_key, JCS(manifest without manifest_hash))
//! 3. record = { manifest_hash, base64(signature), "RSA-PSS-SHA256", key_id }
//! ```
//!
//! The signed bytes are exactly the bytes that were hashed. `key_id` is
//! `sha256:` over the SPKI DER of the public key.

use crate::crypto::sha256_prefixed;
use crate::manifest::{verify_integrity, Manifest, ManifestError};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePublicKey};
use rsa::pss::BlindedSigningKey;
use rsa::signature::{RandomizedSigner, SignatureEncoding};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::path::Path;

pub const SIGNATURE_ALGORITHM: &str = "RSA-PSS-SHA256";
pub const MIN_RSA_KEY_BITS: usize = 3072;

/// SHA-256 output length in bytes.
const DIGEST_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum SignError {
    #[error("RSA key is {bits} bits; at least {min} required")]
    KeyTooSmall { bits: usize, min: usize },

    #[error("failed to load key from {source_name}: {reason}")]
    KeyLoad { source_name: String, reason: String },

    #[error("refusing to sign: {0}")]
    Manifest(#[from] ManifestError),

    #[error("signing failed: {0}")]
    Crypto(String),
}

/// Detached signature over one manifest hash. Written as `manifest.sig`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureRecord {
    pub manifest_hash: String,
    /// Base64 (standard alphabet, padded) signature bytes.
    pub signature: String,
    pub algorithm: String,
    pub key_id: String,
}

impl SignatureRecord {
    pub fn to_json_vec(&self) -> Result<Vec<u8>, SignError> {
        crate::crypto::jcs::to_vec(self).map_err(|e| SignError::Crypto(e.to_string()))
    }
}

/// Holds a private key and signs manifests with it.
pub struct ManifestSigner {
    key: RsaPrivateKey,
    key_id: String,
}

impl std::fmt::Debug for ManifestSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManifestSigner")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl ManifestSigner {
    pub fn new(key: RsaPrivateKey) -> Result<Self, SignError> {
        ensure_key_size(&key.to_public_key())?;
        let key_id = compute_key_id(&key.to_public_key())?;
        Ok(Self { key, key_id })
    }

    pub fn from_pem(pem: &str) -> Result<Self, SignError> {
        Self::new(load_private_key_pem(pem, "inline PEM")?)
    }

    pub fn from_pem_file(path: &Path) -> Result<Self, SignError> {
        let pem = std::fs::read_to_string(path).map_err(|e| SignError::KeyLoad {
            source_name: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::new(load_private_key_pem(&pem, &path.display().to_string())?)
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn public_key(&self) -> RsaPublicKey {
        self.key.to_public_key()
    }

    /// Sign a manifest. The manifest's own hash must be intact.
    pub fn sign(&self, manifest: &Manifest) -> Result<SignatureRecord, SignError> {
        verify_integrity(manifest)?;
        let content = manifest.canonical_content()?;

        let salt_len = max_pss_salt_len(&self.key.to_public_key());
        let signing_key = BlindedSigningKey::<Sha256>::new_with_salt_len(self.key.clone(), salt_len);
        let mut rng = rand::thread_rng();
        let signature = signing_key
            .try_sign_with_rng(&mut rng, &content)
            .map_err(|e| SignError::Crypto(e.to_string()))?;

        Ok(SignatureRecord {
            manifest_hash: manifest.manifest_hash.clone(),
            signature: BASE64.encode(signature.to_bytes()),
            algorithm: SIGNATURE_ALGORITHM.to_string(),
            key_id: self.key_id.clone(),
        })
    }
}

/// Sign with a bare private key.
pub fn sign(manifest: &Manifest, private_key: &RsaPrivateKey) -> Result<SignatureRecord, SignError> {
    ManifestSigner::new(private_key.clone())?.sign(manifest)
}

/// Compute key_id from the SPKI DER encoding of a public key.
///
/// Returns `sha256:<lowercase-hex>`.
pub fn compute_key_id(public_key: &RsaPublicKey) -> Result<String, SignError> {
    let der = public_key
        .to_public_key_der()
        .map_err(|e| SignError::Crypto(format!("failed to encode public key as SPKI DER: {e}")))?;
    Ok(sha256_prefixed(der.as_bytes()))
}

pub fn key_bits(public_key: &RsaPublicKey) -> usize {
    public_key.n().bits() as usize
}

pub fn ensure_key_size(public_key: &RsaPublicKey) -> Result<(), SignError> {
    let bits = key_bits(public_key);
    if bits < MIN_RSA_KEY_BITS {
        return Err(SignError::KeyTooSmall {
            bits,
            min: MIN_RSA_KEY_BITS,
        });
    }
    Ok(())
}

/// Maximum PSS salt length: emLen - hLen - 2, with emLen = ceil((modBits - 1) / 8).
pub(crate) fn max_pss_salt_len(public_key: &RsaPublicKey) -> usize {
    let em_len = (key_bits(public_key) + 6) / 8;
    em_len.saturating_sub(DIGEST_LEN + 2)
}

/// Parse a private key from PKCS#8 or PKCS#1 PEM.
pub fn load_private_key_pem(pem: &str, source_name: &str) -> Result<RsaPrivateKey, SignError> {
    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|e| SignError::KeyLoad {
            source_name: source_name.to_string(),
            reason: e.to_string(),
        })
}

/// Parse a public key from SPKI or PKCS#1 PEM.
pub fn load_public_key_pem(pem: &str, source_name: &str) -> Result<RsaPublicKey, SignError> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| SignError::KeyLoad {
            source_name: source_name.to_string(),
            reason: e.to_string(),
        })
}

pub fn load_public_key_file(path: &Path) -> Result<RsaPublicKey, SignError> {
    let pem = std::fs::read_to_string(path).map_err(|e| SignError::KeyLoad {
        source_name: path.display().to_string(),
        reason: e.to_string(),
    })?;
    load_public_key_pem(&pem, &path.display().to_string())
}
