//! Symmetric payload encryption keyed by the TLS shared secret.
//!
//! Parallel-transfer data connections carry payloads encrypted with the
//! secret sent during the TLS bootstrap. Only AES-256-CBC with PKCS#7
//! padding is supported.

use std::str::FromStr;

use aes::Aes256;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Result, TransportError};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Random key sent to the server after the TLS handshake.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret(Vec<u8>);

impl SharedSecret {
    /// Generates a random secret of `size` bytes.
    pub fn generate(size: usize) -> Self {
        let mut bytes = vec![0u8; size];
        rand::thread_rng().fill_bytes(&mut bytes);
        SharedSecret(bytes)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        SharedSecret(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SharedSecret([REDACTED; {}])", self.0.len())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionAlgorithm {
    Aes256Cbc,
}

impl EncryptionAlgorithm {
    pub fn block_size(&self) -> usize {
        match self {
            EncryptionAlgorithm::Aes256Cbc => 16,
        }
    }

    pub fn key_size(&self) -> usize {
        match self {
            EncryptionAlgorithm::Aes256Cbc => 32,
        }
    }

    /// Upper bound of the ciphertext length for `len` plaintext bytes.
    pub fn encrypted_len(&self, len: usize) -> usize {
        let block = self.block_size();
        (len / block + 1) * block
    }
}

impl FromStr for EncryptionAlgorithm {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "AES-256-CBC" => Ok(EncryptionAlgorithm::Aes256Cbc),
            other => Err(TransportError::Encryption {
                reason: format!("unknown encryption algorithm {:?}", other),
            }),
        }
    }
}

/// A fresh random IV of one block.
pub fn new_iv(algorithm: EncryptionAlgorithm) -> Vec<u8> {
    let mut iv = vec![0u8; algorithm.block_size()];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}

fn check_inputs(algorithm: EncryptionAlgorithm, key: &[u8], iv: &[u8]) -> Result<()> {
    if key.len() != algorithm.key_size() {
        return Err(TransportError::Encryption {
            reason: format!(
                "key of {} bytes, {} bytes required",
                key.len(),
                algorithm.key_size()
            ),
        });
    }
    if iv.len() < algorithm.block_size() {
        return Err(TransportError::Encryption {
            reason: format!(
                "iv of {} bytes is shorter than the block size {}",
                iv.len(),
                algorithm.block_size()
            ),
        });
    }
    Ok(())
}

fn copy_out(out: &[u8], dst: &mut [u8]) -> Result<usize> {
    if dst.len() < out.len() {
        return Err(TransportError::Encryption {
            reason: format!(
                "destination of {} bytes is too short for {} bytes",
                dst.len(),
                out.len()
            ),
        });
    }
    dst[..out.len()].copy_from_slice(out);
    Ok(out.len())
}

/// Encrypts `src` into `dst` and returns the ciphertext length. Only the
/// first block of `iv` is used.
pub fn encrypt(
    algorithm: EncryptionAlgorithm,
    key: &[u8],
    iv: &[u8],
    src: &[u8],
    dst: &mut [u8],
) -> Result<usize> {
    check_inputs(algorithm, key, iv)?;
    let iv = &iv[..algorithm.block_size()];
    let out = match algorithm {
        EncryptionAlgorithm::Aes256Cbc => Aes256CbcEnc::new_from_slices(key, iv)
            .map_err(|e| TransportError::Encryption {
                reason: e.to_string(),
            })?
            .encrypt_padded_vec_mut::<Pkcs7>(src),
    };
    copy_out(&out, dst)
}

/// Decrypts `src` into `dst`, strips the padding and returns the plaintext
/// length.
pub fn decrypt(
    algorithm: EncryptionAlgorithm,
    key: &[u8],
    iv: &[u8],
    src: &[u8],
    dst: &mut [u8],
) -> Result<usize> {
    check_inputs(algorithm, key, iv)?;
    if src.is_empty() {
        return Ok(0);
    }
    let iv = &iv[..algorithm.block_size()];
    let out = match algorithm {
        EncryptionAlgorithm::Aes256Cbc => Aes256CbcDec::new_from_slices(key, iv)
            .map_err(|e| TransportError::Encryption {
                reason: e.to_string(),
            })?
            .decrypt_padded_vec_mut::<Pkcs7>(src)
            .map_err(|_| TransportError::Encryption {
                reason: "invalid pkcs7 padding".to_string(),
            })?,
    };
    copy_out(&out, dst)
}
