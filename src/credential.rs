//! Credentials as seen by the presentment flow, and the source that stores them.

use std::{
    collections::BTreeSet,
    fmt::Debug,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

use crate::{
    core::claim_request::{ClaimRequest, RequestedClaim, RequestedFormat, Requester},
    mdoc::IssuerSigned,
    sd_jwt::SdJwt,
    secure_area::SecureArea,
    trust::{TrustManager, TrustPoint},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialFormat {
    Mdoc { doc_type: String },
    SdJwtVc { vct: String },
}

impl CredentialFormat {
    /// Whether this credential can answer `request`.
    pub fn matches(&self, request: &ClaimRequest) -> bool {
        match (self, request.format) {
            (CredentialFormat::Mdoc { doc_type }, RequestedFormat::Mdoc) => *doc_type == request.doc_type,
            (CredentialFormat::SdJwtVc { vct }, RequestedFormat::SdJwt) => *vct == request.doc_type,
            _ => false,
        }
    }
}

/// A key held by a [SecureArea].
#[derive(Clone)]
pub struct KeyReference {
    pub alias: String,
    pub secure_area: Arc<dyn SecureArea>,
}

impl Debug for KeyReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyReference")
            .field("alias", &self.alias)
            .field("secure_area", &self.secure_area.identifier())
            .finish()
    }
}

/// A certified credential.
///
/// Clones share the usage counter.
#[derive(Debug, Clone)]
pub struct Credential {
    pub id: String,
    pub format: CredentialFormat,
    /// `IssuerSigned` CBOR for mdocs, the compact SD-JWT for SD-JWT VCs.
    pub issuer_provided_data: Vec<u8>,
    pub key: KeyReference,
    usage_count: Arc<AtomicU64>,
}

impl Credential {
    pub fn new(
        id: impl Into<String>,
        format: CredentialFormat,
        issuer_provided_data: Vec<u8>,
        key: KeyReference,
    ) -> Self {
        Self {
            id: id.into(),
            format,
            issuer_provided_data,
            key,
            usage_count: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn usage_count(&self) -> u64 {
        self.usage_count.load(Ordering::SeqCst)
    }

    /// Records one presentation. Callers invoke this once per successful send.
    pub fn increase_usage_count(&self) {
        let count = self.usage_count.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(credential = %self.id, count, "usage count increased");
    }

    pub fn issuer_signed(&self) -> Result<IssuerSigned> {
        IssuerSigned::from_slice(&self.issuer_provided_data)
            .with_context(|| format!("credential '{}' holds invalid IssuerSigned data", self.id))
    }

    pub fn sd_jwt(&self) -> Result<SdJwt> {
        let serialized = std::str::from_utf8(&self.issuer_provided_data)
            .with_context(|| format!("credential '{}' holds a non UTF-8 SD-JWT", self.id))?;
        SdJwt::parse(serialized)
    }

    /// Availability predicate over requested claims, for consent display.
    pub fn claim_availability(&self) -> Result<impl Fn(&RequestedClaim) -> bool> {
        let available: BTreeSet<(String, String)> = match &self.format {
            CredentialFormat::Mdoc { .. } => self
                .issuer_signed()?
                .name_spaces()
                .flat_map(|(namespace, items)| {
                    items
                        .iter()
                        .map(move |item| (namespace.to_string(), item.element_identifier.clone()))
                })
                .collect(),
            CredentialFormat::SdJwtVc { vct } => self
                .sd_jwt()?
                .claim_names()
                .into_iter()
                .map(|name| (vct.clone(), name))
                .collect(),
        };

        Ok(move |claim: &RequestedClaim| {
            available.contains(&(claim.namespace.clone(), claim.name.clone()))
        })
    }
}

/// Application-provided access to stored credentials and consent policy.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Credentials able to satisfy `request`.
    ///
    /// `pre_selected` is the document the user already picked, if the platform
    /// offered a picker before the request reached this crate.
    async fn select_credential_for_presentment(
        &self,
        request: &ClaimRequest,
        pre_selected: Option<&Credential>,
    ) -> Result<Vec<Credential>>;

    async fn should_show_consent_prompt(
        &self,
        credential: &Credential,
        request: &ClaimRequest,
    ) -> Result<bool>;

    /// The trust point vouching for the requester, if any.
    async fn find_trust_point(&self, request: &ClaimRequest) -> Result<Option<TrustPoint>>;
}

/// A fixed list of credentials. Not for production use!
///
/// # Warning
/// Matching is by format and document type only, in insertion order.
pub struct SimpleCredentialSource {
    credentials: Vec<Credential>,
    reader_trust: Option<Arc<dyn TrustManager>>,
    always_show_consent: bool,
}

impl SimpleCredentialSource {
    pub fn new(credentials: Vec<Credential>) -> Self {
        Self {
            credentials,
            reader_trust: None,
            always_show_consent: true,
        }
    }

    pub fn with_reader_trust(mut self, trust_manager: Arc<dyn TrustManager>) -> Self {
        self.reader_trust = Some(trust_manager);
        self
    }

    pub fn with_consent_prompt(mut self, always_show_consent: bool) -> Self {
        self.always_show_consent = always_show_consent;
        self
    }
}

#[async_trait]
impl CredentialSource for SimpleCredentialSource {
    async fn select_credential_for_presentment(
        &self,
        request: &ClaimRequest,
        pre_selected: Option<&Credential>,
    ) -> Result<Vec<Credential>> {
        Ok(self
            .credentials
            .iter()
            .filter(|credential| credential.format.matches(request))
            .filter(|credential| pre_selected.map_or(true, |p| p.id == credential.id))
            .cloned()
            .collect())
    }

    async fn should_show_consent_prompt(
        &self,
        _credential: &Credential,
        _request: &ClaimRequest,
    ) -> Result<bool> {
        Ok(self.always_show_consent)
    }

    async fn find_trust_point(&self, request: &ClaimRequest) -> Result<Option<TrustPoint>> {
        let Some(trust_manager) = &self.reader_trust else {
            return Ok(None);
        };

        let result = match &request.requester {
            Requester::CertificateChain(chain) => {
                trust_manager.verify(chain, chrono::Utc::now()).await?
            }
            Requester::Website(origin) => trust_manager.verify_origin(origin).await?,
            Requester::App(_) | Requester::Anonymous => return Ok(None),
        };

        if let Some(error) = &result.error {
            debug!("requester is not trusted: {error:#}");
        }
        Ok(result.trust_points.into_iter().next())
    }
}
