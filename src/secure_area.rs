//! Signing keys bound to credentials.
//!
//! The hardware-backed implementations live with the embedding application; this
//! crate only calls into [SecureArea] for device authentication and key binding
//! signatures.

use std::collections::BTreeMap;

use async_trait::async_trait;
use p256::{
    ecdsa::{signature::Signer, Signature, SigningKey},
    PublicKey,
};
use rand::rngs::OsRng;
use tokio::sync::Mutex;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SecureAreaError {
    /// The key needs user authentication before it can be used.
    #[error("key '{0}' is locked")]
    KeyLocked(String),
    /// The user dismissed the authentication prompt.
    #[error("unlocking key '{0}' was cancelled")]
    UnlockCancelled(String),
    #[error("invalid key '{alias}': {reason}")]
    InvalidKey { alias: String, reason: String },
    #[error("signing failed: {0}")]
    Signing(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum KeyPurpose {
    Sign,
    AgreeKey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInfo {
    pub alias: String,
    pub public_key: PublicKey,
    pub purposes: Vec<KeyPurpose>,
    /// Whether [SecureArea::sign] may fail with [SecureAreaError::KeyLocked].
    pub user_authentication_required: bool,
}

impl KeyInfo {
    pub fn can_sign(&self) -> bool {
        self.purposes.contains(&KeyPurpose::Sign)
    }
}

/// Proof of user authentication, handed back to [SecureArea::sign].
#[derive(Clone, PartialEq, Eq)]
pub enum KeyUnlockData {
    Passphrase(String),
    /// The platform has already authenticated the user out of band.
    Authenticated,
}

impl std::fmt::Debug for KeyUnlockData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Passphrase(_) => f.write_str("Passphrase(..)"),
            Self::Authenticated => f.write_str("Authenticated"),
        }
    }
}

#[async_trait]
pub trait SecureArea: Send + Sync {
    /// Identifier of the secure area implementation, for logging.
    fn identifier(&self) -> &str;

    async fn key_info(&self, alias: &str) -> Result<KeyInfo, SecureAreaError>;

    /// Signs `data` with ES256 and returns the raw `r || s` signature.
    async fn sign(
        &self,
        alias: &str,
        data: &[u8],
        unlock: Option<&KeyUnlockData>,
    ) -> Result<Vec<u8>, SecureAreaError>;
}

struct SoftwareKey {
    signing_key: SigningKey,
    purposes: Vec<KeyPurpose>,
    passphrase: Option<String>,
}

/// A software key store. Not for production use!
///
/// # Warning
/// Keys are kept in process memory, unprotected. Use this for tests and tooling only.
#[derive(Default)]
pub struct SoftwareSecureArea {
    keys: Mutex<BTreeMap<String, SoftwareKey>>,
}

impl SoftwareSecureArea {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a fresh P-256 key. With a `passphrase`, signing fails with
    /// [SecureAreaError::KeyLocked] until the passphrase is supplied.
    pub async fn create_key(
        &self,
        alias: &str,
        purposes: Vec<KeyPurpose>,
        passphrase: Option<String>,
    ) -> PublicKey {
        let signing_key = SigningKey::random(&mut OsRng);
        self.import_key(alias, signing_key, purposes, passphrase).await
    }

    pub async fn import_key(
        &self,
        alias: &str,
        signing_key: SigningKey,
        purposes: Vec<KeyPurpose>,
        passphrase: Option<String>,
    ) -> PublicKey {
        let public_key = signing_key.verifying_key().into();
        self.keys.lock().await.insert(
            alias.to_string(),
            SoftwareKey {
                signing_key,
                purposes,
                passphrase,
            },
        );
        public_key
    }
}

#[async_trait]
impl SecureArea for SoftwareSecureArea {
    fn identifier(&self) -> &str {
        "SoftwareSecureArea"
    }

    async fn key_info(&self, alias: &str) -> Result<KeyInfo, SecureAreaError> {
        let keys = self.keys.lock().await;
        let key = keys.get(alias).ok_or_else(|| SecureAreaError::InvalidKey {
            alias: alias.to_string(),
            reason: "no such key".into(),
        })?;
        Ok(KeyInfo {
            alias: alias.to_string(),
            public_key: key.signing_key.verifying_key().into(),
            purposes: key.purposes.clone(),
            user_authentication_required: key.passphrase.is_some(),
        })
    }

    async fn sign(
        &self,
        alias: &str,
        data: &[u8],
        unlock: Option<&KeyUnlockData>,
    ) -> Result<Vec<u8>, SecureAreaError> {
        let keys = self.keys.lock().await;
        let key = keys.get(alias).ok_or_else(|| SecureAreaError::InvalidKey {
            alias: alias.to_string(),
            reason: "no such key".into(),
        })?;

        if !key.purposes.contains(&KeyPurpose::Sign) {
            return Err(SecureAreaError::InvalidKey {
                alias: alias.to_string(),
                reason: "key does not have the signing purpose".into(),
            });
        }

        if let Some(expected) = &key.passphrase {
            match unlock {
                Some(KeyUnlockData::Passphrase(given)) if given == expected => {}
                _ => return Err(SecureAreaError::KeyLocked(alias.to_string())),
            }
        }

        let signature: Signature = key
            .signing_key
            .try_sign(data)
            .map_err(|e| SecureAreaError::Signing(e.to_string()))?;
        Ok(signature.to_bytes().to_vec())
    }
}
