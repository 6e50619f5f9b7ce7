//! Envelope encryption for per-channel credentials.
//!
//! One symmetric data-encryption key (32 bytes, base64 in `ENCRYPTION_KEY`)
//! seals every credential with AES-256-GCM and a fresh nonce. Credentials
//! enter in plaintext exactly once, at channel registration, and leave the
//! vault only as short-lived in-memory plaintext for an outbound call.
//! Plaintext is never logged and never persisted.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::Engine;
use rand::RngCore;
use std::fmt;
use thiserror::Error;

/// Environment variable carrying the base64-encoded 32-byte key.
pub const ENCRYPTION_KEY_ENV: &str = "ENCRYPTION_KEY";

const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("{ENCRYPTION_KEY_ENV} is not set")]
    MissingKey,

    #[error("Invalid encryption key: {0}")]
    BadKey(String),

    #[error("Credential unavailable for channel {channel} ({kind})")]
    CredentialUnavailable { channel: String, kind: String },

    #[error("Encryption failed")]
    Encrypt,
}

/// The kinds of credentials a channel can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialKind {
    PlanningToken,
    UploadRefreshToken,
    ModelProviderKey,
}

impl CredentialKind {
    pub const ALL: &'static [CredentialKind] = &[
        CredentialKind::PlanningToken,
        CredentialKind::UploadRefreshToken,
        CredentialKind::ModelProviderKey,
    ];

    pub fn as_db_str(&self) -> &'static str {
        match self {
            CredentialKind::PlanningToken => "planning_token",
            CredentialKind::UploadRefreshToken => "upload_refresh_token",
            CredentialKind::ModelProviderKey => "model_provider_key",
        }
    }

    pub fn parse(value: &str) -> Option<CredentialKind> {
        Self::ALL.iter().copied().find(|k| k.as_db_str() == value)
    }
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

/// An encrypted credential: nonce plus ciphertext, both opaque bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

/// The sealing/opening handle. Cheap to clone; holds only the cipher.
#[derive(Clone)]
pub struct Vault {
    cipher: Aes256Gcm,
}

impl Vault {
    /// Build from `ENCRYPTION_KEY` in the environment.
    pub fn from_env() -> Result<Self, VaultError> {
        let encoded = std::env::var(ENCRYPTION_KEY_ENV).map_err(|_| VaultError::MissingKey)?;
        Self::from_base64(&encoded)
    }

    /// Build from a base64-encoded 32-byte key.
    pub fn from_base64(encoded: &str) -> Result<Self, VaultError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| VaultError::BadKey(format!("not valid base64: {e}")))?;
        Self::from_key_bytes(&bytes)
    }

    pub fn from_key_bytes(bytes: &[u8]) -> Result<Self, VaultError> {
        if bytes.len() != 32 {
            return Err(VaultError::BadKey(format!(
                "expected 32 bytes, got {}",
                bytes.len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(bytes)
            .map_err(|_| VaultError::BadKey("cipher rejected key".to_string()))?;
        Ok(Self { cipher })
    }

    /// Encrypt a plaintext credential under a fresh nonce.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Envelope, VaultError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| VaultError::Encrypt)?;

        Ok(Envelope {
            nonce: nonce_bytes.to_vec(),
            ciphertext,
        })
    }

    /// Decrypt an envelope. The error deliberately names the channel and
    /// credential kind but never the payload.
    pub fn open(
        &self,
        envelope: &Envelope,
        channel: &str,
        kind: CredentialKind,
    ) -> Result<Vec<u8>, VaultError> {
        if envelope.nonce.len() != NONCE_LEN {
            return Err(VaultError::CredentialUnavailable {
                channel: channel.to_string(),
                kind: kind.as_db_str().to_string(),
            });
        }
        let nonce = Nonce::from_slice(&envelope.nonce);
        self.cipher
            .decrypt(nonce, envelope.ciphertext.as_slice())
            .map_err(|_| VaultError::CredentialUnavailable {
                channel: channel.to_string(),
                kind: kind.as_db_str().to_string(),
            })
    }

    /// Decrypt an envelope into a UTF-8 token.
    pub fn open_string(
        &self,
        envelope: &Envelope,
        channel: &str,
        kind: CredentialKind,
    ) -> Result<String, VaultError> {
        let bytes = self.open(envelope, channel, kind)?;
        String::from_utf8(bytes).map_err(|_| VaultError::CredentialUnavailable {
            channel: channel.to_string(),
            kind: kind.as_db_str().to_string(),
        })
    }
}

impl fmt::Debug for Vault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The cipher (and therefore the key) never appears in debug output.
        f.debug_struct("Vault").finish_non_exhaustive()
    }
}
