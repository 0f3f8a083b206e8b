//! Trust decisions about requesters and issuers.
//!
//! A [TrustManager] answers whether an X.509 chain (or a website origin) is
//! anchored in one of its [TrustPoint]s. Results are advisory for presentment:
//! an untrusted requester is shown as such in the consent prompt, it is never a
//! hard stop.

use std::sync::Arc;

use anyhow::Error;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error as ThisError;
use x509_cert::Certificate;

pub mod chain;
pub mod composite;
pub mod entry;
pub mod local;
pub mod storage;
pub mod vical;

pub use chain::TrustChainValidator;
pub use composite::CompositeTrustManager;
pub use entry::{TrustEntry, TrustEntryKind};
pub use local::LocalTrustManager;
pub use storage::{MemoryStorageTable, StorageError, StorageTable};
pub use vical::{Vical, VicalTrustManager};

#[derive(ThisError, Debug)]
pub enum TrustError {
    /// A certificate with the same Subject Key Identifier, an identical VICAL or
    /// the same origin is already present.
    #[error("trust entry `{0}` already exists")]
    AlreadyExists(String),
    #[error("certificate has no Subject Key Identifier")]
    MissingSubjectKeyIdentifier,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("unable to decode {what}: {reason}")]
    Decoding { what: &'static str, reason: String },
}

impl TrustError {
    pub(crate) fn decoding(what: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Decoding {
            what,
            reason: err.to_string(),
        }
    }
}

/// Display information attached to a trust point.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustMetadata {
    pub display_name: Option<String>,
    pub display_icon: Option<Vec<u8>>,
    pub privacy_policy_url: Option<String>,
    pub disclaimer: Option<String>,
    /// Anchors registered for testing; UIs should flag them.
    pub test_only: bool,
}

impl TrustMetadata {
    pub fn named(display_name: impl Into<String>) -> Self {
        Self {
            display_name: Some(display_name.into()),
            ..Default::default()
        }
    }
}

/// A verified trust anchor, owned by exactly one [TrustManager].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustPoint {
    X509 {
        certificate: Certificate,
        /// Hex encoded Subject Key Identifier.
        ski: String,
        metadata: TrustMetadata,
        trust_manager_id: String,
    },
    Origin {
        origin: String,
        metadata: TrustMetadata,
        trust_manager_id: String,
    },
}

impl TrustPoint {
    pub fn certificate(&self) -> Option<&Certificate> {
        match self {
            TrustPoint::X509 { certificate, .. } => Some(certificate),
            TrustPoint::Origin { .. } => None,
        }
    }

    pub fn metadata(&self) -> &TrustMetadata {
        match self {
            TrustPoint::X509 { metadata, .. } | TrustPoint::Origin { metadata, .. } => metadata,
        }
    }

    pub fn trust_manager_id(&self) -> &str {
        match self {
            TrustPoint::X509 {
                trust_manager_id, ..
            }
            | TrustPoint::Origin {
                trust_manager_id, ..
            } => trust_manager_id,
        }
    }
}

/// Verdict of a [TrustManager].
///
/// `is_trusted` implies a `trust_chain` and at least one trust point. Origin
/// verdicts carry an empty chain. A chain can be present without being trusted,
/// in which case `error` says why.
#[derive(Debug, Clone)]
pub struct TrustResult {
    pub is_trusted: bool,
    /// Leaf first, root last.
    pub trust_chain: Option<Vec<Certificate>>,
    pub trust_points: Vec<TrustPoint>,
    pub error: Option<Arc<Error>>,
}

impl TrustResult {
    pub fn trusted(trust_chain: Vec<Certificate>, trust_points: Vec<TrustPoint>) -> Self {
        Self {
            is_trusted: true,
            trust_chain: Some(trust_chain),
            trust_points,
            error: None,
        }
    }

    pub fn untrusted(error: Error) -> Self {
        Self {
            is_trusted: false,
            trust_chain: None,
            trust_points: vec![],
            error: Some(Arc::new(error)),
        }
    }
}

#[async_trait]
pub trait TrustManager: Send + Sync {
    fn identifier(&self) -> &str;

    /// Whether this manager is backed by a curated VICAL. Such managers are
    /// consulted before certificate stores when composed.
    fn is_vical_backed(&self) -> bool {
        false
    }

    async fn trust_points(&self) -> anyhow::Result<Vec<TrustPoint>>;

    /// Verifies a DER encoded chain, leaf first, at `at`.
    async fn verify(&self, chain: &[Vec<u8>], at: DateTime<Utc>) -> anyhow::Result<TrustResult>;

    async fn verify_origin(&self, origin: &str) -> anyhow::Result<TrustResult>;
}
