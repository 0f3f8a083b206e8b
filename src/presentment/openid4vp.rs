//! OpenID4VP over the Digital Credentials API (`dc_api` and `dc_api.jwt`).

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Map, Value as Json};
use tracing::{debug, warn};
use url::Url;

use super::{
    assembler,
    error::PresentmentError,
    flow::{FlowContext, FlowOutcome},
    ProtocolAdapter,
};
use crate::{
    core::{
        claim_request::{ClaimRequest, RequestedClaim, Requester},
        jwe::{find_encryption_jwk, negotiate_enc, EncryptionJwkInfo, JweBuilder},
        jws::{decode_payload_unverified, verify_with_x5c},
        session_transcript::{Handover, SessionTranscript},
        util::get_json,
        verifier::P256Verifier,
    },
    credential::Credential,
    mdoc::device_response,
    sd_jwt::{ClaimPathElement, KeyBindingJwt},
    utils::encode_base64url,
};

pub(crate) const RESPONSE_MODE_DC_API: &str = "dc_api";
pub(crate) const RESPONSE_MODE_DC_API_JWT: &str = "dc_api.jwt";

pub(crate) const FORMAT_MSO_MDOC: &str = "mso_mdoc";
pub(crate) const FORMAT_DC_SD_JWT: &str = "dc+sd-jwt";

/// Prefix of the client identifier derived for unsigned requests.
pub(crate) const WEB_ORIGIN_PREFIX: &str = "web-origin:";

#[derive(Deserialize, Debug)]
struct DcqlClaim {
    path: Vec<Json>,
    #[serde(default)]
    intent_to_retain: bool,
}

#[derive(Deserialize, Debug)]
struct DcqlCredential {
    id: String,
    format: String,
    #[serde(default)]
    meta: Map<String, Json>,
    #[serde(default)]
    claims: Vec<DcqlClaim>,
}

#[derive(Deserialize, Debug)]
struct DcqlQuery {
    credentials: Vec<DcqlCredential>,
}

fn default_response_mode() -> String {
    RESPONSE_MODE_DC_API.to_string()
}

#[derive(Deserialize, Debug)]
struct AuthorizationRequest {
    nonce: String,
    #[serde(default = "default_response_mode")]
    response_mode: String,
    dcql_query: DcqlQuery,
    #[serde(default)]
    client_metadata: Map<String, Json>,
    #[serde(default)]
    expected_origins: Option<Vec<String>>,
}

/// A request with the client identifier rules applied.
#[derive(Debug)]
struct ParsedRequest {
    request: AuthorizationRequest,
    /// Used verbatim in the handover and as the key binding audience.
    client_id: String,
    requester: Requester,
}

/// Parses a request, verifying it first if it is signed.
///
/// Unsigned requests: any `client_id` is replaced by `web-origin:<origin>`.
/// Signed requests (`{"request": <JWS>}`): `client_id` must be present. That is
/// checked before the signature so a malformed request never reaches crypto.
fn parse_request(request: &str, origin: &str) -> Result<ParsedRequest> {
    let envelope: Map<String, Json> = serde_json::from_str(request)
        .map_err(|e| PresentmentError::invalid_request(format!("request was not a JSON object: {e}")))?;

    let (claims, client_id, requester) = match envelope.get("request") {
        Some(Json::String(jws)) => {
            let unverified = decode_payload_unverified(jws)
                .map_err(|e| PresentmentError::invalid_request(format!("{e:#}")))?;
            let client_id = unverified
                .get("client_id")
                .and_then(Json::as_str)
                .ok_or_else(|| PresentmentError::invalid_request("signed request is missing 'client_id'"))?
                .to_string();

            let verified = verify_with_x5c::<P256Verifier>(jws)
                .map_err(|e| PresentmentError::Crypto(format!("request signature: {e:#}")))?;
            debug!(%client_id, chain = verified.x5c.len(), "signed request verified");
            (
                verified.payload,
                client_id,
                Requester::CertificateChain(verified.x5c),
            )
        }
        Some(_) => return Err(PresentmentError::invalid_request("'request' is not a compact JWS")),
        None => {
            if let Some(client_id) = envelope.get("client_id") {
                debug!(%client_id, "ignoring client_id of an unsigned request");
            }
            (
                envelope,
                format!("{WEB_ORIGIN_PREFIX}{origin}"),
                Requester::Website(origin.to_string()),
            )
        }
    };
    let signed = matches!(requester, Requester::CertificateChain(_));

    let request: AuthorizationRequest = serde_json::from_value(Json::Object(claims))
        .map_err(|e| PresentmentError::invalid_request(format!("malformed authorization request: {e}")))?;

    if ![RESPONSE_MODE_DC_API, RESPONSE_MODE_DC_API_JWT].contains(&request.response_mode.as_str()) {
        return Err(PresentmentError::invalid_request(format!(
            "unsupported response_mode '{}'",
            request.response_mode
        )));
    }

    if let Some(expected_origins) = request.expected_origins.as_ref().filter(|_| signed) {
        if !expected_origins.iter().any(|o| o == origin) {
            return Err(PresentmentError::PolicyViolation(format!(
                "origin '{origin}' is not among the request's expected_origins"
            ))
            .into());
        }
    }

    Ok(ParsedRequest {
        request,
        client_id,
        requester,
    })
}

/// The single credential query this wallet answers.
fn credential_query(request: &AuthorizationRequest) -> Result<&DcqlCredential> {
    let credentials = &request.dcql_query.credentials;
    if credentials.len() > 1 {
        warn!(count = credentials.len(), "only the first DCQL credential query is answered");
    }
    credentials
        .first()
        .ok_or_else(|| PresentmentError::invalid_request("dcql_query has no credentials"))
}

fn path_segment<'a>(claim: &'a DcqlClaim, index: usize) -> Result<&'a str> {
    claim
        .path
        .get(index)
        .and_then(Json::as_str)
        .ok_or_else(|| PresentmentError::invalid_request(format!("unsupported claim path {:?}", claim.path)))
}

fn mdoc_claim_request(query: &DcqlCredential, requester: Requester) -> Result<ClaimRequest> {
    let doc_type = query
        .meta
        .get("doctype_value")
        .and_then(Json::as_str)
        .ok_or_else(|| PresentmentError::invalid_request("mso_mdoc query is missing meta.doctype_value"))?;

    let claims = query
        .claims
        .iter()
        .map(|claim| {
            if claim.path.len() != 2 {
                bail!(PresentmentError::InvalidRequest(format!(
                    "mso_mdoc claim path must be [namespace, element], got {:?}",
                    claim.path
                )));
            }
            Ok(RequestedClaim::new(
                path_segment(claim, 0)?,
                path_segment(claim, 1)?,
                claim.intent_to_retain,
            ))
        })
        .collect::<Result<_>>()?;

    Ok(ClaimRequest::mdoc(doc_type, claims, requester))
}

/// One candidate request per accepted `vct`, in the order the verifier listed them.
fn sd_jwt_claim_requests(query: &DcqlCredential, requester: &Requester) -> Result<Vec<ClaimRequest>> {
    let vct_values: Vec<&str> = query
        .meta
        .get("vct_values")
        .and_then(Json::as_array)
        .map(|values| values.iter().filter_map(Json::as_str).collect())
        .unwrap_or_default();
    if vct_values.is_empty() {
        return Err(PresentmentError::invalid_request("dc+sd-jwt query is missing meta.vct_values"));
    }

    let names = query
        .claims
        .iter()
        .map(|claim| path_segment(claim, 0).map(str::to_string))
        .collect::<Result<Vec<_>>>()?;

    Ok(vct_values
        .into_iter()
        .map(|vct| {
            let claims = names
                .iter()
                .map(|name| RequestedClaim::new(vct, name.as_str(), false))
                .collect();
            ClaimRequest::sd_jwt(vct, claims, requester.clone())
        })
        .collect())
}

/// Full claim paths of a `dc+sd-jwt` query, for selective disclosure.
fn sd_jwt_claim_paths(query: &DcqlCredential) -> Result<Vec<Vec<ClaimPathElement>>> {
    query
        .claims
        .iter()
        .map(|claim| {
            claim
                .path
                .iter()
                .map(|segment| {
                    ClaimPathElement::from_json(segment).ok_or_else(|| {
                        PresentmentError::invalid_request(format!("unsupported claim path {:?}", claim.path))
                    })
                })
                .collect()
        })
        .collect()
}

pub(super) struct OpenId4VpAdapter;

impl OpenId4VpAdapter {
    /// Picks the recipient key and content encryption for `dc_api.jwt`.
    async fn response_encryption(
        &self,
        flow: &FlowContext<'_>,
        client_metadata: &Map<String, Json>,
    ) -> Result<(EncryptionJwkInfo, String)> {
        let jwks = match (client_metadata.get("jwks"), client_metadata.get("jwks_uri")) {
            (Some(Json::Object(jwks)), _) => jwks.clone(),
            (None, Some(Json::String(jwks_uri))) => {
                let url = Url::parse(jwks_uri).context("jwks_uri is not a URL")?;
                get_json::<Map<String, Json>>(flow.http_client, &url)
                    .await
                    .map_err(|e| PresentmentError::Transport(format!("{e:#}")))?
            }
            _ => bail!(PresentmentError::InvalidRequest(
                "dc_api.jwt requires client_metadata.jwks or jwks_uri".into()
            )),
        };

        let keys = jwks
            .get("keys")
            .and_then(Json::as_array)
            .context("JWKS has no 'keys' array")?;
        let recipient = find_encryption_jwk(keys.iter().filter_map(Json::as_object))
            .map_err(|e| PresentmentError::InvalidRequest(format!("{e:#}")))?;
        let enc = negotiate_enc(client_metadata, &flow.config.supported_jwe_enc)
            .map_err(|e| PresentmentError::InvalidRequest(format!("{e:#}")))?;

        debug!(kid = ?recipient.kid, %enc, "response encryption negotiated");
        Ok((recipient, enc))
    }

    async fn mdoc_token(
        &self,
        flow: &FlowContext<'_>,
        credential: &Credential,
        claim_request: &ClaimRequest,
        transcript: &SessionTranscript,
    ) -> Result<String> {
        let document = assembler::build_document(flow.prompt, credential, claim_request, transcript).await?;
        Ok(encode_base64url(device_response(vec![document])?))
    }

    async fn sd_jwt_token(
        &self,
        flow: &FlowContext<'_>,
        credential: &Credential,
        paths: &[Vec<ClaimPathElement>],
        nonce: &str,
        audience: &str,
    ) -> Result<String> {
        let presentation = credential.sd_jwt()?.disclose(paths);

        let key_binding = KeyBindingJwt::new(presentation, nonce, audience, Utc::now().timestamp());
        let signature = flow.sign(credential, key_binding.signing_input()).await?;
        Ok(key_binding.finish(&signature))
    }
}

#[async_trait]
impl ProtocolAdapter for OpenId4VpAdapter {
    async fn handle(&self, flow: &FlowContext<'_>) -> Result<FlowOutcome> {
        let origin = flow.required_origin()?;
        let ParsedRequest {
            request,
            client_id,
            requester,
        } = parse_request(flow.mechanism.request(), origin)?;

        let encryption = if request.response_mode == RESPONSE_MODE_DC_API_JWT {
            Some(self.response_encryption(flow, &request.client_metadata).await?)
        } else {
            None
        };

        let query = credential_query(&request)?;
        let (candidates, sd_jwt_paths) = match query.format.as_str() {
            FORMAT_MSO_MDOC => (vec![mdoc_claim_request(query, requester)?], vec![]),
            FORMAT_DC_SD_JWT => (
                sd_jwt_claim_requests(query, &requester)?,
                sd_jwt_claim_paths(query)?,
            ),
            other => {
                return Err(PresentmentError::invalid_request(format!(
                    "unsupported credential format '{other}'"
                )))
            }
        };

        let mut selected = None;
        for claim_request in candidates {
            if let Some(credential) = flow.select(&claim_request).await? {
                selected = Some((credential, claim_request));
                break;
            }
        }
        let Some((credential, claim_request)) = selected else {
            return Ok(FlowOutcome::NoMatchingCredential);
        };

        let transcript = SessionTranscript::new(Handover::openid4vp_dc_api(origin, &client_id, &request.nonce)?);

        if !flow.consent(&credential, &claim_request).await? {
            return Ok(FlowOutcome::ConsentDeclined);
        }

        let token = match query.format.as_str() {
            FORMAT_MSO_MDOC => self.mdoc_token(flow, &credential, &claim_request, &transcript).await?,
            _ => {
                self.sd_jwt_token(flow, &credential, &sd_jwt_paths, &request.nonce, &client_id)
                    .await?
            }
        };

        let mut vp_token = Map::new();
        vp_token.insert(query.id.clone(), Json::String(token));
        let vp_token = Json::Object(vp_token);
        let response = match encryption {
            Some((recipient, enc)) => {
                let mut payload = Map::new();
                payload.insert("vp_token".into(), vp_token);
                let jwe = JweBuilder::new()
                    .payload(payload)
                    .recipient(recipient)
                    .enc(enc)
                    .build()
                    .map_err(|e| PresentmentError::Crypto(format!("{e:#}")))?;
                json!({ "response": jwe })
            }
            None => json!({ "vp_token": vp_token }),
        };

        flow.send(&credential, response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORIGIN: &str = "https://verifier.example";

    fn unsigned(extra: Json) -> String {
        let mut request = json!({
            "nonce": "n-0S6_WzA2Mj",
            "dcql_query": {
                "credentials": [{
                    "id": "mdl",
                    "format": "mso_mdoc",
                    "meta": { "doctype_value": "org.iso.18013.5.1.mDL" },
                    "claims": [{ "path": ["org.iso.18013.5.1", "given_name"], "intent_to_retain": true }]
                }]
            }
        });
        if let (Json::Object(request), Json::Object(extra)) = (&mut request, extra) {
            request.extend(extra);
        }
        request.to_string()
    }

    #[test]
    fn unsigned_client_id_is_replaced_by_the_origin() {
        let parsed = parse_request(&unsigned(json!({ "client_id": "x509_san_dns:evil.example" })), ORIGIN).unwrap();
        assert_eq!(parsed.client_id, "web-origin:https://verifier.example");
        assert_eq!(parsed.requester, Requester::Website(ORIGIN.into()));
        assert_eq!(parsed.request.response_mode, RESPONSE_MODE_DC_API);
    }

    #[test]
    fn signed_request_without_client_id_fails_before_verification() {
        let header = encode_base64url(json!({ "alg": "ES256" }).to_string());
        let payload = encode_base64url(json!({ "nonce": "n" }).to_string());
        // The signature is garbage; the missing client_id must be reported first.
        let request = json!({ "request": format!("{header}.{payload}.AAAA") }).to_string();

        let err = parse_request(&request, ORIGIN).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PresentmentError>(),
            Some(PresentmentError::InvalidRequest(reason)) if reason.contains("client_id")
        ));
    }

    #[test]
    fn unknown_response_mode_is_rejected() {
        let err = parse_request(&unsigned(json!({ "response_mode": "direct_post" })), ORIGIN).unwrap_err();
        assert!(format!("{err:#}").contains("direct_post"));
    }

    #[test]
    fn mdoc_paths_become_namespaced_claims() {
        let parsed = parse_request(&unsigned(json!({})), ORIGIN).unwrap();
        let request = mdoc_claim_request(credential_query(&parsed.request).unwrap(), parsed.requester).unwrap();
        assert_eq!(request.doc_type, "org.iso.18013.5.1.mDL");
        assert_eq!(
            request.claims,
            [RequestedClaim::new("org.iso.18013.5.1", "given_name", true)]
        );
    }

    #[test]
    fn sd_jwt_candidates_follow_vct_order() {
        let query: DcqlCredential = serde_json::from_value(json!({
            "id": "pid",
            "format": "dc+sd-jwt",
            "meta": { "vct_values": ["urn:eudi:pid:1", "urn:eudi:pid:de:1"] },
            "claims": [{ "path": ["given_name"] }, { "path": ["address", "locality"] }]
        }))
        .unwrap();

        let candidates = sd_jwt_claim_requests(&query, &Requester::Anonymous).unwrap();
        assert_eq!(
            candidates.iter().map(|c| c.doc_type.as_str()).collect::<Vec<_>>(),
            ["urn:eudi:pid:1", "urn:eudi:pid:de:1"]
        );
        assert_eq!(
            candidates[0].claims.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            ["given_name", "address"]
        );
        assert_eq!(
            sd_jwt_claim_paths(&query).unwrap()[1],
            [
                ClaimPathElement::Name("address".into()),
                ClaimPathElement::Name("locality".into())
            ]
        );
    }

    #[test]
    fn malformed_sd_jwt_paths_are_rejected() {
        let query: DcqlCredential = serde_json::from_value(json!({
            "id": "pid",
            "format": "dc+sd-jwt",
            "meta": { "vct_values": ["urn:eudi:pid:1"] },
            "claims": [{ "path": ["nationalities", -1] }]
        }))
        .unwrap();
        let err = sd_jwt_claim_paths(&query).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PresentmentError>(),
            Some(PresentmentError::InvalidRequest(_))
        ));
    }
}
