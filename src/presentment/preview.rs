//! The Android "preview" protocol.

use anyhow::{Context, Result};
use async_trait::async_trait;
use ciborium::Value as Cbor;
use serde::Deserialize;
use serde_json::json;

use super::{
    assembler,
    error::PresentmentError,
    flow::{FlowContext, FlowOutcome},
    ProtocolAdapter,
};
use crate::{
    core::{
        cbor,
        claim_request::{ClaimRequest, RequestedClaim, Requester},
        cose_key, hpke,
        session_transcript::{Handover, SessionTranscript},
    },
    mdoc::device_response,
    utils::{decode_base64url, encode_base64url},
};

pub(crate) const PREVIEW_HPKE_VERSION: &str = "ANDROID-HPKE-v1";

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct Field {
    namespace: String,
    name: String,
    #[serde(default)]
    intent_to_retain: bool,
}

#[derive(Deserialize, Debug)]
struct Selector {
    doctype: String,
    fields: Vec<Field>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct PreviewRequest {
    selector: Selector,
    nonce: String,
    reader_public_key: String,
}

pub(super) struct PreviewAdapter;

#[async_trait]
impl ProtocolAdapter for PreviewAdapter {
    async fn handle(&self, flow: &FlowContext<'_>) -> Result<FlowOutcome> {
        let request: PreviewRequest = serde_json::from_str(flow.mechanism.request())
            .map_err(|e| PresentmentError::invalid_request(format!("malformed preview request: {e}")))?;

        let nonce = decode_base64url(&request.nonce, "nonce")?;
        let reader_key_bytes = decode_base64url(&request.reader_public_key, "readerPublicKey")?;
        let reader_key = cose_key::from_sec1(&reader_key_bytes).context("invalid readerPublicKey")?;

        let (handover, requester) = match flow.mechanism.web_origin() {
            Some(origin) => (
                Handover::browser(&nonce, origin, &reader_key_bytes),
                Requester::Website(origin.to_string()),
            ),
            None => {
                let app_id = flow.mechanism.app_id();
                (
                    Handover::android(&nonce, app_id, &reader_key_bytes),
                    Requester::App(app_id.to_string()),
                )
            }
        };

        let claims = request
            .selector
            .fields
            .into_iter()
            .map(|f| RequestedClaim::new(f.namespace, f.name, f.intent_to_retain))
            .collect();
        let claim_request = ClaimRequest::mdoc(request.selector.doctype, claims, requester);

        let Some(credential) = flow.select(&claim_request).await? else {
            return Ok(FlowOutcome::NoMatchingCredential);
        };

        let transcript = SessionTranscript::new(handover);

        if !flow.consent(&credential, &claim_request).await? {
            return Ok(FlowOutcome::ConsentDeclined);
        }

        let document = assembler::build_document(flow.prompt, &credential, &claim_request, &transcript).await?;
        let device_response = device_response(vec![document])?;

        let sealed = hpke::seal(&reader_key, &device_response, &transcript.to_cbor_bytes()?)
            .map_err(|e| PresentmentError::Crypto(format!("{e:#}")))?;
        let token = cbor::to_vec(&cbor::text_map([
            ("version", Cbor::Text(PREVIEW_HPKE_VERSION.into())),
            (
                "encryptionParameters",
                cbor::text_map([("pkEm", Cbor::Bytes(sealed.encapsulated_key))]),
            ),
            ("cipherText", Cbor::Bytes(sealed.cipher_text)),
        ]))?;

        flow.send(&credential, json!({ "token": encode_base64url(token) }))
            .await
    }
}
