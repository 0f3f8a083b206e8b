//! Protocol-agnostic description of what a relying party asks for.

use std::collections::BTreeMap;

use crate::utils::to_human_readable_string;

/// A single requested data element.
///
/// For SD-JWT VC requests the namespace is the requested `vct` and the name is the
/// top-level claim name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestedClaim {
    pub namespace: String,
    pub name: String,
    pub intent_to_retain: bool,
}

impl RequestedClaim {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, intent_to_retain: bool) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            intent_to_retain,
        }
    }
}

/// Who is asking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requester {
    Anonymous,
    /// A native application identified by its package or app id.
    App(String),
    /// A website identified by its origin.
    Website(String),
    /// A reader presenting an X.509 chain, DER encoded, leaf first.
    CertificateChain(Vec<Vec<u8>>),
}

impl Requester {
    pub fn origin(&self) -> Option<&str> {
        match self {
            Requester::Website(origin) => Some(origin),
            _ => None,
        }
    }

    pub fn certificate_chain(&self) -> Option<&[Vec<u8>]> {
        match self {
            Requester::CertificateChain(chain) => Some(chain),
            _ => None,
        }
    }
}

/// Which family of credential a request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestedFormat {
    Mdoc,
    SdJwt,
}

/// The normalized request every protocol adapter produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRequest {
    pub format: RequestedFormat,
    /// mdoc `docType`, or the `vct` for SD-JWT VC.
    pub doc_type: String,
    pub claims: Vec<RequestedClaim>,
    pub requester: Requester,
}

impl ClaimRequest {
    pub fn mdoc(doc_type: impl Into<String>, claims: Vec<RequestedClaim>, requester: Requester) -> Self {
        Self {
            format: RequestedFormat::Mdoc,
            doc_type: doc_type.into(),
            claims,
            requester,
        }
    }

    pub fn sd_jwt(vct: impl Into<String>, claims: Vec<RequestedClaim>, requester: Requester) -> Self {
        Self {
            format: RequestedFormat::SdJwt,
            doc_type: vct.into(),
            claims,
            requester,
        }
    }

    /// Requested claims grouped by namespace; duplicate names collapse, last write wins.
    pub fn namespaces(&self) -> BTreeMap<String, BTreeMap<String, bool>> {
        let mut namespaces: BTreeMap<String, BTreeMap<String, bool>> = BTreeMap::new();
        for claim in &self.claims {
            namespaces
                .entry(claim.namespace.clone())
                .or_default()
                .insert(claim.name.clone(), claim.intent_to_retain);
        }
        namespaces
    }

    /// Resolves every claim against `availability`, or against nothing when the
    /// credential is not yet known.
    pub fn resolve<F>(&self, availability: Option<F>) -> Vec<ResolvedClaim>
    where
        F: Fn(&RequestedClaim) -> bool,
    {
        self.namespaces()
            .into_iter()
            .flat_map(|(namespace, names)| {
                names
                    .into_iter()
                    .map(move |(name, intent_to_retain)| {
                        RequestedClaim::new(namespace.clone(), name, intent_to_retain)
                    })
            })
            .map(|claim| ResolvedClaim {
                display_name: to_human_readable_string(claim.name.as_str()),
                available: availability.as_ref().map(|f| f(&claim)),
                claim,
            })
            .collect()
    }
}

/// A requested claim annotated for display in the consent prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedClaim {
    pub claim: RequestedClaim,
    pub display_name: String,
    /// `None` until resolved against a concrete credential.
    pub available: Option<bool>,
}
