//! Compact JWS handling for signed requests carrying an `x5c` header.

use anyhow::{bail, Context, Result};
use base64::prelude::*;
use serde_json::{Map, Value as Json};
use tracing::debug;
use x509_cert::{
    der::{referenced::OwnedToRef, Decode},
    Certificate,
};

use super::verifier::Verifier;

/// A JWS whose signature has been checked against the leaf of its `x5c` chain.
#[derive(Debug, Clone)]
pub struct VerifiedJws {
    pub payload: Map<String, Json>,
    /// DER certificates from the `x5c` header, leaf first.
    pub x5c: Vec<Vec<u8>>,
}

fn split_jws(jws: &str) -> Result<(&str, &str, &str)> {
    let mut parts = jws.split('.');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(header), Some(payload), Some(signature), None) => Ok((header, payload, signature)),
        _ => bail!("JWS must have exactly three segments"),
    }
}

fn decode_json_segment(segment: &str, what: &str) -> Result<Map<String, Json>> {
    let bytes = BASE64_URL_SAFE_NO_PAD
        .decode(segment)
        .with_context(|| format!("jwt {what} were not valid base64url"))?;
    serde_json::from_slice(&bytes).with_context(|| format!("jwt {what} were not valid json"))
}

/// Decodes the claims of a JWS without checking its signature.
///
/// Only for structural checks that must happen before any cryptography.
pub fn decode_payload_unverified(jws: &str) -> Result<Map<String, Json>> {
    let (_, body_b64, _) = split_jws(jws)?;
    decode_json_segment(body_b64, "claims")
}

/// Verifies `jws` with the public key of the first certificate in its `x5c` header.
pub fn verify_with_x5c<V: Verifier>(jws: &str) -> Result<VerifiedJws> {
    let (headers_b64, body_b64, sig_b64) = split_jws(jws)?;
    let mut headers = decode_json_segment(headers_b64, "headers")?;

    let Json::String(alg) = headers
        .remove("alg")
        .context("'alg' was missing from jwt headers")?
    else {
        bail!("'alg' header was not a string")
    };

    let Json::Array(x5chain) = headers
        .remove("x5c")
        .context("'x5c' was missing from jwt headers")?
    else {
        bail!("'x5c' header was not an array")
    };

    let x5c = x5chain
        .iter()
        .map(|entry| {
            let Json::String(b64_x509) = entry else {
                bail!("'x5c' header was not an array of strings");
            };
            BASE64_STANDARD_NO_PAD
                .decode(b64_x509.trim_end_matches('='))
                .context("certificate in 'x5c' was not valid base64")
        })
        .collect::<Result<Vec<_>>>()?;

    let leaf_cert_der = x5c.first().context("'x5c' was an empty array")?;
    let leaf_cert = Certificate::from_der(leaf_cert_der)
        .context("leaf certificate in 'x5c' was not valid DER")?;

    debug!(subject = %leaf_cert.tbs_certificate.subject, "verifying request signature");

    let verifier = V::from_spki(
        leaf_cert
            .tbs_certificate
            .subject_public_key_info
            .owned_to_ref(),
        &alg,
    )
    .context("unable to parse SPKI")?;

    let payload = [headers_b64.as_bytes(), b".", body_b64.as_bytes()].concat();
    let signature = BASE64_URL_SAFE_NO_PAD
        .decode(sig_b64)
        .context("could not decode base64url encoded jwt signature")?;

    verifier
        .verify(&payload, &signature)
        .context("request signature could not be verified")?;

    Ok(VerifiedJws {
        payload: decode_json_segment(body_b64, "claims")?,
        x5c,
    })
}
