//! Adapters for requests carrying an ISO 18013-5 `DeviceRequest` and an
//! `EncryptionInfo`: Austroads request forwarding and ISO 18013-7 Annex C.
//!
//! Both share the envelope `{deviceRequest, encryptionInfo}` (base64url CBOR)
//! and differ in tags, field names and the handover.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use ciborium::Value as Cbor;
use p256::PublicKey;
use serde::Deserialize;
use serde_json::{Map, Value as Json};
use tracing::warn;

use super::{
    assembler,
    error::PresentmentError,
    flow::{FlowContext, FlowOutcome},
    ProtocolAdapter,
};
use crate::{
    core::{
        cbor,
        claim_request::{ClaimRequest, Requester},
        cose_key, hpke,
        session_transcript::{Handover, SessionTranscript},
    },
    mdoc::{device_response, DeviceRequest},
    utils::{decode_base64url, encode_base64url},
};

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    device_request: String,
    encryption_info: String,
}

/// Per-protocol constants of a DeviceRequest based adapter.
pub(super) struct DeviceRequestAdapter {
    /// First element of `EncryptionInfo`.
    encryption_info_tag: &'static str,
    /// Field of the `EncryptionInfo` parameters holding the recipient COSE_Key.
    recipient_key_field: &'static str,
    /// First element of the encrypted response array.
    response_tag: &'static str,
    /// Field of the response parameters holding the encapsulated key.
    encapsulated_key_field: &'static str,
    /// JSON key of the response envelope.
    response_field: &'static str,
    handover: fn(&str, &str) -> Result<Handover>,
}

pub(super) static ARF: DeviceRequestAdapter = DeviceRequestAdapter {
    encryption_info_tag: "ARFEncryptionv2",
    recipient_key_field: "readerPublicKey",
    response_tag: "ARFencryptionv2",
    encapsulated_key_field: "pkEM",
    response_field: "encryptedResponse",
    handover: arf_handover,
};

pub(super) static MDOC_API: DeviceRequestAdapter = DeviceRequestAdapter {
    encryption_info_tag: "dcapi",
    recipient_key_field: "recipientPublicKey",
    response_tag: "dcapi",
    encapsulated_key_field: "enc",
    response_field: "Response",
    handover: Handover::iso_dc_api,
};

fn arf_handover(encryption_info: &str, origin: &str) -> Result<Handover> {
    Ok(Handover::arf(encryption_info, origin))
}

impl DeviceRequestAdapter {
    /// `EncryptionInfo = [tag, {..., <recipient key field>: COSE_Key}]`
    fn recipient_key(&self, encryption_info: &[u8]) -> Result<PublicKey> {
        let value: Cbor = cbor::from_slice(encryption_info).context("encryptionInfo was not valid CBOR")?;
        let [tag, parameters] = cbor::as_array(&value, "encryptionInfo")? else {
            bail!("encryptionInfo must have two elements");
        };
        if tag.as_text() != Some(self.encryption_info_tag) {
            bail!(
                "encryptionInfo is tagged {tag:?}, expected '{}'",
                self.encryption_info_tag
            );
        }

        let parameters = cbor::as_map(parameters, "encryptionParameters")?;
        cose_key::from_cose_key_cbor(cbor::required(parameters, self.recipient_key_field)?)
            .with_context(|| format!("invalid {}", self.recipient_key_field))
    }

    fn encrypted_response(&self, sealed: hpke::HpkeSealed) -> Result<String> {
        let response = Cbor::Array(vec![
            Cbor::Text(self.response_tag.into()),
            cbor::text_map([
                (self.encapsulated_key_field, Cbor::Bytes(sealed.encapsulated_key)),
                ("cipherText", Cbor::Bytes(sealed.cipher_text)),
            ]),
        ]);
        Ok(encode_base64url(cbor::to_vec(&response)?))
    }
}

#[async_trait]
impl ProtocolAdapter for DeviceRequestAdapter {
    async fn handle(&self, flow: &FlowContext<'_>) -> Result<FlowOutcome> {
        let envelope: Envelope = serde_json::from_str(flow.mechanism.request())
            .map_err(|e| PresentmentError::invalid_request(format!("malformed {} request: {e}", flow.protocol)))?;
        let origin = flow.required_origin()?;

        let device_request = DeviceRequest::from_slice(&decode_base64url(&envelope.device_request, "deviceRequest")?)
            .map_err(|e| PresentmentError::invalid_request(format!("{e:#}")))?;
        let reader_key = self
            .recipient_key(&decode_base64url(&envelope.encryption_info, "encryptionInfo")?)
            .map_err(|e| PresentmentError::invalid_request(format!("{e:#}")))?;

        if device_request.doc_requests.len() > 1 {
            warn!(
                protocol = %flow.protocol,
                count = device_request.doc_requests.len(),
                "only the first DocRequest is answered"
            );
        }
        let doc_request = device_request
            .doc_requests
            .first()
            .context("DeviceRequest contains no docRequests")?;

        let claim_request = ClaimRequest::mdoc(
            doc_request.items_request.doc_type.clone(),
            doc_request.items_request.claims.clone(),
            Requester::Website(origin.to_string()),
        );
        let Some(credential) = flow.select(&claim_request).await? else {
            return Ok(FlowOutcome::NoMatchingCredential);
        };

        // The transcript is bound to the base64url text exactly as received.
        let transcript = SessionTranscript::new((self.handover)(&envelope.encryption_info, origin)?);

        let requester = if doc_request.has_reader_auth() {
            match doc_request.verify_reader_auth(&transcript) {
                Ok(chain) => Requester::CertificateChain(chain),
                Err(e) if flow.config.require_reader_auth_verification => {
                    return Err(PresentmentError::PolicyViolation(format!(
                        "readerAuth did not verify: {e:#}"
                    ))
                    .into())
                }
                Err(e) => {
                    warn!(protocol = %flow.protocol, "readerAuth did not verify, identifying the requester by origin: {e:#}");
                    Requester::Website(origin.to_string())
                }
            }
        } else {
            Requester::Website(origin.to_string())
        };
        let claim_request = ClaimRequest {
            requester,
            ..claim_request
        };

        if !flow.consent(&credential, &claim_request).await? {
            return Ok(FlowOutcome::ConsentDeclined);
        }

        let document = assembler::build_document(flow.prompt, &credential, &claim_request, &transcript).await?;
        let device_response = device_response(vec![document])?;
        let sealed = hpke::seal(&reader_key, &device_response, &transcript.to_cbor_bytes()?)
            .map_err(|e| PresentmentError::Crypto(format!("{e:#}")))?;

        let mut response = Map::new();
        response.insert(
            self.response_field.to_string(),
            Json::String(self.encrypted_response(sealed)?),
        );
        flow.send(&credential, Json::Object(response)).await
    }
}
