//! Transforms applied to frames leaving the backend
//!
//! Every frame read from a backend connection passes through one
//! [`FrameTransform`] before it is base64-encoded for the agent.

use aes::Aes256;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use cbc::cipher::block_padding::{NoPadding, Pkcs7};
use cbc::cipher::{BlockEncryptMut, KeyIvInit};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;

pub const AES_KEY_LEN: usize = 32;
pub const AES_BLOCK_LEN: usize = 16;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TransformError {
    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Payload of {0} bytes is not a multiple of the {1}-byte block size")]
    Misaligned(usize, usize),
}

pub trait FrameTransform: Send + Sync {
    fn apply(&self, payload: &[u8]) -> Result<Vec<u8>, TransformError>;

    fn name(&self) -> &'static str;
}

/// Leaves frames untouched
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl FrameTransform for Passthrough {
    fn apply(&self, payload: &[u8]) -> Result<Vec<u8>, TransformError> {
        Ok(payload.to_vec())
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

/// Block padding used by [`AesCbc`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CbcPadding {
    /// Frames must already be block aligned
    #[default]
    None,
    Pkcs7,
}

/// AES-256-CBC with a fixed key and IV
pub struct AesCbc {
    key: [u8; AES_KEY_LEN],
    iv: [u8; AES_BLOCK_LEN],
    padding: CbcPadding,
}

impl AesCbc {
    pub fn new(key: &[u8], iv: &[u8], padding: CbcPadding) -> Result<Self, TransformError> {
        let key: [u8; AES_KEY_LEN] = key.try_into().map_err(|_| {
            TransformError::InvalidKey(format!("key must be {} bytes, got {}", AES_KEY_LEN, key.len()))
        })?;
        let iv: [u8; AES_BLOCK_LEN] = iv.try_into().map_err(|_| {
            TransformError::InvalidKey(format!("IV must be {} bytes, got {}", AES_BLOCK_LEN, iv.len()))
        })?;
        Ok(Self { key, iv, padding })
    }

    /// Build from base64-encoded key and IV
    pub fn from_base64(key: &str, iv: &str, padding: CbcPadding) -> Result<Self, TransformError> {
        let key = BASE64
            .decode(key.trim())
            .map_err(|e| TransformError::InvalidKey(format!("key: {}", e)))?;
        let iv = BASE64
            .decode(iv.trim())
            .map_err(|e| TransformError::InvalidKey(format!("IV: {}", e)))?;
        Self::new(&key, &iv, padding)
    }
}

impl FrameTransform for AesCbc {
    fn apply(&self, payload: &[u8]) -> Result<Vec<u8>, TransformError> {
        let cipher = Aes256CbcEnc::new(&self.key.into(), &self.iv.into());
        match self.padding {
            CbcPadding::None => {
                if payload.len() % AES_BLOCK_LEN != 0 {
                    return Err(TransformError::Misaligned(payload.len(), AES_BLOCK_LEN));
                }
                Ok(cipher.encrypt_padded_vec_mut::<NoPadding>(payload))
            }
            CbcPadding::Pkcs7 => Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(payload)),
        }
    }

    fn name(&self) -> &'static str {
        "aes-cbc"
    }
}

impl std::fmt::Debug for AesCbc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesCbc")
            .field("padding", &self.padding)
            .finish_non_exhaustive()
    }
}

pub type SharedTransform = Arc<dyn FrameTransform>;
