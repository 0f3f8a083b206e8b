//! X.509 chain building and validation against an SKI-indexed trust map.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use tracing::debug;
use x509_cert::{
    der::{oid::ObjectIdentifier, referenced::OwnedToRef, Decode, Encode},
    ext::pkix::{AuthorityKeyIdentifier, KeyUsage, SubjectKeyIdentifier},
    time::Time,
    Certificate,
};

use super::{TrustPoint, TrustResult};
use crate::core::verifier::{P256Verifier, Verifier};

/// `ecdsa-with-SHA256`
pub const ECDSA_WITH_SHA256: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.2");

pub fn parse_certificate(der: &[u8]) -> Result<Certificate> {
    Certificate::from_der(der).context("certificate was not valid DER")
}

/// Hex encoded Subject Key Identifier, if the extension is present.
pub fn subject_key_identifier(certificate: &Certificate) -> Result<Option<String>> {
    Ok(certificate
        .tbs_certificate
        .get::<SubjectKeyIdentifier>()
        .context("unable to parse SubjectKeyIdentifier")?
        .map(|(_, ski)| hex::encode(ski.0.as_bytes())))
}

/// Hex encoded key identifier from the Authority Key Identifier, if present.
pub fn authority_key_identifier(certificate: &Certificate) -> Option<String> {
    match certificate.tbs_certificate.get::<AuthorityKeyIdentifier>() {
        Ok(Some((_, aki))) => aki.key_identifier.map(|id| hex::encode(id.as_bytes())),
        Ok(None) => None,
        Err(e) => {
            debug!("unable to parse AuthorityKeyIdentifier from DER: {e}");
            None
        }
    }
}

pub fn is_self_signed(certificate: &Certificate) -> bool {
    certificate.tbs_certificate.issuer == certificate.tbs_certificate.subject
}

fn key_usage(certificate: &Certificate) -> Result<KeyUsage> {
    certificate
        .tbs_certificate
        .get::<KeyUsage>()
        .context("unable to parse KeyUsage")?
        .map(|(_, usage)| usage)
        .context("certificate has no KeyUsage extension")
}

fn unix_nanos(time: &Time) -> i128 {
    time.to_unix_duration().as_nanos() as i128
}

/// Checks `not_before <= at <= not_after`.
pub fn check_validity(certificate: &Certificate, at: DateTime<Utc>) -> Result<()> {
    let validity = &certificate.tbs_certificate.validity;
    let at_nanos = i128::from(at.timestamp()) * 1_000_000_000 + i128::from(at.timestamp_subsec_nanos());

    if at_nanos < unix_nanos(&validity.not_before) {
        bail!("certificate is not yet valid (notBefore {:?})", validity.not_before);
    }
    if at_nanos > unix_nanos(&validity.not_after) {
        bail!("certificate has expired (notAfter {:?})", validity.not_after);
    }
    Ok(())
}

/// Verifies that `certificate` was signed by the key of `issuer`.
pub fn check_signature(certificate: &Certificate, issuer: &Certificate) -> Result<()> {
    if certificate.signature_algorithm.oid != ECDSA_WITH_SHA256 {
        bail!(
            "unsupported certificate signature algorithm {}",
            certificate.signature_algorithm.oid
        );
    }

    let verifier = P256Verifier::from_spki(
        issuer
            .tbs_certificate
            .subject_public_key_info
            .owned_to_ref(),
        "ES256",
    )
    .context("issuer key is not a P-256 key")?;

    let tbs = certificate
        .tbs_certificate
        .to_der()
        .context("failed to encode TBSCertificate")?;
    let signature = certificate
        .signature
        .as_bytes()
        .context("certificate signature has unused bits")?;

    verifier.verify_der(&tbs, signature)
}

/// Builds and validates chains against trust points keyed by hex SKI.
#[derive(Debug, Clone, Copy)]
pub struct TrustChainValidator<'a> {
    trust_points: &'a BTreeMap<String, TrustPoint>,
}

impl<'a> TrustChainValidator<'a> {
    pub fn new(trust_points: &'a BTreeMap<String, TrustPoint>) -> Self {
        Self { trust_points }
    }

    fn lookup(&self, certificate: &Certificate) -> Option<&'a TrustPoint> {
        authority_key_identifier(certificate).and_then(|aki| self.trust_points.get(&aki))
    }

    /// Finds the first certificate of `chain` whose issuer is a trust point, then
    /// follows issuers through the trust map until a self-signed certificate or a
    /// missing link. Returns the index of that first certificate and the trust
    /// points in issuer order.
    fn find_trust_points(&self, chain: &[Certificate]) -> Option<(usize, Vec<TrustPoint>)> {
        let (index, first) = chain
            .iter()
            .enumerate()
            .find_map(|(index, certificate)| Some((index, self.lookup(certificate)?)))?;

        let mut trust_points: Vec<TrustPoint> = vec![];
        let mut next = Some(first);
        while let Some(trust_point) = next {
            // Bounded by the map size so a cross-signed loop cannot spin forever.
            if trust_points.contains(trust_point) || trust_points.len() >= self.trust_points.len() {
                break;
            }
            trust_points.push(trust_point.clone());

            next = match trust_point.certificate() {
                Some(certificate) if !is_self_signed(certificate) => self.lookup(certificate),
                _ => None,
            };
        }

        Some((index, trust_points))
    }

    pub fn verify(&self, chain: &[Certificate], at: DateTime<Utc>) -> TrustResult {
        let Some(leaf) = chain.first() else {
            return TrustResult::untrusted(anyhow::anyhow!("certificate chain is empty"));
        };

        let Some((index, trust_points)) = self.find_trust_points(chain) else {
            return self.verify_single(chain, at);
        };

        let mut complete_chain = chain[..=index].to_vec();
        for certificate in trust_points.iter().filter_map(TrustPoint::certificate) {
            if !complete_chain.contains(certificate) {
                complete_chain.push(certificate.clone());
            }
        }

        debug!(
            subject = %leaf.tbs_certificate.subject,
            length = complete_chain.len(),
            "validating certification path"
        );

        match validate_path(&complete_chain, at) {
            Ok(()) => TrustResult::trusted(complete_chain, trust_points),
            Err(error) => TrustResult {
                is_trusted: false,
                trust_chain: Some(complete_chain),
                trust_points,
                error: Some(error.into()),
            },
        }
    }

    /// A lone certificate that is itself a registered trust point.
    fn verify_single(&self, chain: &[Certificate], at: DateTime<Utc>) -> TrustResult {
        let registered = match chain {
            [certificate] => subject_key_identifier(certificate)
                .ok()
                .flatten()
                .and_then(|ski| self.trust_points.get(&ski))
                .map(|tp| (certificate, tp)),
            _ => None,
        };

        let Some((certificate, trust_point)) = registered else {
            return TrustResult::untrusted(anyhow::anyhow!("no trusted root certificate could be found"));
        };

        match check_validity(certificate, at) {
            Ok(()) => TrustResult::trusted(chain.to_vec(), vec![trust_point.clone()]),
            Err(error) => TrustResult {
                is_trusted: false,
                trust_chain: Some(chain.to_vec()),
                trust_points: vec![trust_point.clone()],
                error: Some(error.into()),
            },
        }
    }
}

/// Leaf: digitalSignature and valid at `at`. Every following certificate: a CA
/// with keyCertSign that issued and signed its predecessor. A self-signed root
/// must also verify itself.
fn validate_path(chain: &[Certificate], at: DateTime<Utc>) -> Result<()> {
    let leaf = chain.first().context("certificate chain is empty")?;

    if !key_usage(leaf)?.digital_signature() {
        bail!("leaf certificate lacks the digitalSignature key usage");
    }
    check_validity(leaf, at).context("leaf certificate is outside its validity period")?;

    for pair in chain.windows(2) {
        let (certificate, ca) = (&pair[0], &pair[1]);

        if !key_usage(ca)?.key_cert_sign() {
            bail!("CA certificate {} lacks the keyCertSign key usage", ca.tbs_certificate.subject);
        }
        if certificate.tbs_certificate.issuer != ca.tbs_certificate.subject {
            bail!(
                "issuer of {} does not match {}",
                certificate.tbs_certificate.subject,
                ca.tbs_certificate.subject
            );
        }
        check_signature(certificate, ca).with_context(|| {
            format!(
                "signature of {} does not verify with {}",
                certificate.tbs_certificate.subject, ca.tbs_certificate.subject
            )
        })?;
    }

    if let Some(root) = chain.last().filter(|root| is_self_signed(root)) {
        check_signature(root, root).context("root self-signature does not verify")?;
    }

    Ok(())
}
