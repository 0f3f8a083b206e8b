//! Verified Issuer Certificate Authority Lists (ISO/IEC 18013-5 Annex C).

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ciborium::Value as Cbor;
use coset::{iana, AsCborValue, CoseSign1, RegisteredLabelWithPrivate};
use tracing::warn;
use x509_cert::{der::referenced::OwnedToRef, Certificate};

use super::{
    chain::{parse_certificate, subject_key_identifier, TrustChainValidator},
    TrustManager, TrustMetadata, TrustPoint, TrustResult,
};
use crate::{
    core::{
        cbor,
        verifier::{P256Verifier, Verifier},
    },
    mdoc::device_request::x5chain,
};

/// One `CertificateInfo` of a VICAL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VicalCertificateInfo {
    pub certificate: Certificate,
    /// Hex encoded Subject Key Identifier.
    pub ski: String,
    pub doc_types: Vec<String>,
    pub issuing_authority: Option<String>,
}

/// A decoded VICAL. The signature is *not* verified by [Vical::parse].
#[derive(Debug, Clone)]
pub struct Vical {
    pub version: String,
    pub provider: String,
    pub date: DateTime<Utc>,
    pub issue_id: Option<u64>,
    pub certificate_infos: Vec<VicalCertificateInfo>,
    sign1: CoseSign1,
}

fn tdate(value: &Cbor, what: &str) -> Result<DateTime<Utc>> {
    let text = match value {
        Cbor::Tag(0, inner) => inner.as_text(),
        other => other.as_text(),
    }
    .with_context(|| format!("'{what}' is not a tdate"))?;

    Ok(DateTime::parse_from_rfc3339(text)
        .with_context(|| format!("'{what}' is not an RFC 3339 date"))?
        .with_timezone(&Utc))
}

impl Vical {
    pub fn parse(encoded_signed_vical: &[u8]) -> Result<Self> {
        let value: Cbor = cbor::from_slice(encoded_signed_vical)?;
        let sign1 = CoseSign1::from_cbor_value(value)
            .map_err(|e| anyhow::anyhow!("{e:?}"))
            .context("VICAL is not a COSE_Sign1")?;
        let payload = sign1.payload.as_deref().context("VICAL has no payload")?;

        let vical: Cbor = cbor::from_slice(payload).context("VICAL payload was not valid CBOR")?;
        let map = cbor::as_map(&vical, "VICAL")?;

        let issue_id = match cbor::map_get(map, "vicalIssueID") {
            None => None,
            Some(id) => Some(
                id.as_integer()
                    .and_then(|id| u64::try_from(id).ok())
                    .context("'vicalIssueID' is not an unsigned integer")?,
            ),
        };

        let certificate_infos = cbor::as_array(cbor::required(map, "certificateInfos")?, "certificateInfos")?
            .iter()
            .enumerate()
            .map(|(index, info)| {
                Self::parse_certificate_info(info)
                    .with_context(|| format!("invalid CertificateInfo at index {index}"))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            version: cbor::required_text(map, "version")?.to_string(),
            provider: cbor::required_text(map, "vicalProvider")?.to_string(),
            date: tdate(cbor::required(map, "date")?, "date")?,
            issue_id,
            certificate_infos,
            sign1,
        })
    }

    fn parse_certificate_info(value: &Cbor) -> Result<VicalCertificateInfo> {
        let map = cbor::as_map(value, "CertificateInfo")?;
        let certificate = parse_certificate(cbor::required_bytes(map, "certificate")?)?;

        let ski = match cbor::map_get(map, "ski").and_then(Cbor::as_bytes) {
            Some(ski) => hex::encode(ski),
            None => subject_key_identifier(&certificate)?
                .context("certificate has no Subject Key Identifier")?,
        };

        let doc_types = match cbor::map_get(map, "docType") {
            None => vec![],
            Some(doc_types) => cbor::as_array(doc_types, "docType")?
                .iter()
                .map(|d| d.as_text().map(str::to_string).context("docType entry is not text"))
                .collect::<Result<_>>()?,
        };

        Ok(VicalCertificateInfo {
            certificate,
            ski,
            doc_types,
            issuing_authority: cbor::optional_text(map, "issuingAuthority"),
        })
    }

    /// The COSE signature bytes, used to detect duplicate imports.
    pub fn signature(&self) -> &[u8] {
        &self.sign1.signature
    }

    /// Verifies the VICAL signature with the leaf of its `x5chain` and returns
    /// the signer chain, DER encoded.
    pub fn verify_signature(&self) -> Result<Vec<Vec<u8>>> {
        let alg = self.sign1.protected.header.alg.as_ref();
        if alg != Some(&RegisteredLabelWithPrivate::Assigned(iana::Algorithm::ES256)) {
            bail!("unsupported VICAL signature algorithm: {alg:?}");
        }

        let chain = x5chain(&self.sign1).context("VICAL signer chain is unusable")?;
        let signer = parse_certificate(chain.first().context("x5chain is empty")?)?;
        let verifier = P256Verifier::from_spki(
            signer.tbs_certificate.subject_public_key_info.owned_to_ref(),
            "ES256",
        )?;
        self.sign1
            .verify_signature(&[], |signature, data| verifier.verify(data, signature))
            .context("VICAL signature could not be verified")?;

        Ok(chain)
    }
}

/// Trusts the issuer certificates listed in one VICAL.
#[derive(Debug, Clone)]
pub struct VicalTrustManager {
    identifier: String,
    trust_points: BTreeMap<String, TrustPoint>,
}

impl VicalTrustManager {
    pub fn new(identifier: impl Into<String>, vical: &Vical, metadata: &TrustMetadata) -> Self {
        let identifier = identifier.into();
        let mut trust_points = BTreeMap::new();
        for info in &vical.certificate_infos {
            if trust_points.contains_key(&info.ski) {
                warn!(ski = %info.ski, provider = %vical.provider, "duplicate SKI in VICAL, keeping the first");
                continue;
            }
            trust_points.insert(
                info.ski.clone(),
                TrustPoint::X509 {
                    certificate: info.certificate.clone(),
                    ski: info.ski.clone(),
                    metadata: TrustMetadata {
                        display_name: metadata
                            .display_name
                            .clone()
                            .or_else(|| info.issuing_authority.clone()),
                        ..metadata.clone()
                    },
                    trust_manager_id: identifier.clone(),
                },
            );
        }

        Self {
            identifier,
            trust_points,
        }
    }

    pub(crate) fn verify_certificates(&self, chain: &[Certificate], at: DateTime<Utc>) -> TrustResult {
        TrustChainValidator::new(&self.trust_points).verify(chain, at)
    }

    pub(crate) fn all_trust_points(&self) -> impl Iterator<Item = &TrustPoint> {
        self.trust_points.values()
    }
}

#[async_trait]
impl TrustManager for VicalTrustManager {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn is_vical_backed(&self) -> bool {
        true
    }

    async fn trust_points(&self) -> Result<Vec<TrustPoint>> {
        Ok(self.trust_points.values().cloned().collect())
    }

    async fn verify(&self, chain: &[Vec<u8>], at: DateTime<Utc>) -> Result<TrustResult> {
        let chain = chain
            .iter()
            .map(|der| parse_certificate(der))
            .collect::<Result<Vec<_>>>()?;
        Ok(self.verify_certificates(&chain, at))
    }

    async fn verify_origin(&self, origin: &str) -> Result<TrustResult> {
        Ok(TrustResult::untrusted(anyhow::anyhow!(
            "VICAL trust manager '{}' does not vouch for origins like '{origin}'",
            self.identifier
        )))
    }
}
