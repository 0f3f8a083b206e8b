use anyhow::{bail, Context, Result};
use josekit::{
    jwe::{JweHeader, ECDH_ES},
    jwk::Jwk,
    jwt::{encode_with_encrypter, JwtPayload},
};
use serde_json::{Map, Value as Json};

/// Default content encryption algorithm for `dc_api.jwt` responses.
pub const DEFAULT_ENC: &str = "A128GCM";

/// The only key agreement algorithm accepted for encrypted responses.
pub const ECDH_ES_ALG: &str = "ECDH-ES";

/// An encryption key chosen from the relying party's JWKS.
#[derive(Debug, Clone)]
pub struct EncryptionJwkInfo {
    pub jwk: Jwk,
    pub alg: String,
    pub kid: Option<String>,
}

/// Builder for JWE-encrypted `dc_api.jwt` responses.
#[derive(Debug, Clone, Default)]
pub struct JweBuilder {
    payload: Option<Map<String, Json>>,
    recipient: Option<EncryptionJwkInfo>,
    enc: Option<String>,
}

impl JweBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// The JSON object to encrypt, e.g. `{"vp_token": {...}}`.
    pub fn payload(mut self, payload: Map<String, Json>) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn recipient(mut self, recipient: EncryptionJwkInfo) -> Self {
        self.recipient = Some(recipient);
        self
    }

    /// Sets the content encryption algorithm (default: "A128GCM").
    pub fn enc(mut self, enc: impl Into<String>) -> Self {
        self.enc = Some(enc.into());
        self
    }

    /// Builds the compact JWE.
    ///
    /// The JWE `alg` always equals the `alg` of the chosen JWK, and its `kid` is
    /// copied into the header when present.
    pub fn build(self) -> Result<String> {
        let payload = self.payload.context("payload is required")?;
        let recipient = self.recipient.context("recipient key is required")?;
        let enc = self.enc.unwrap_or_else(|| DEFAULT_ENC.to_string());

        if recipient.alg != ECDH_ES_ALG {
            bail!(
                "unsupported algorithm: {} (only {ECDH_ES_ALG} is supported)",
                recipient.alg
            );
        }

        let mut jwt_payload = JwtPayload::new();
        for (key, value) in payload {
            jwt_payload.set_claim(&key, Some(value))?;
        }

        let mut header = JweHeader::new();
        header.set_token_type("JWT");
        header.set_algorithm(&recipient.alg);
        header.set_content_encryption(&enc);
        if let Some(kid) = recipient.kid.as_deref().or(recipient.jwk.key_id()) {
            header.set_key_id(kid);
        }

        let encrypter = ECDH_ES
            .encrypter_from_jwk(&recipient.jwk)
            .context("unable to build ECDH-ES encrypter")?;
        encode_with_encrypter(&jwt_payload, &header, &encrypter)
            .context("JWE encryption failed")
    }
}

/// Finds a suitable encryption JWK in a JWKS `keys` array.
///
/// Keys must be P-256, carry `alg: "ECDH-ES"`, and either have `use: "enc"` or no
/// `use` at all.
pub fn find_encryption_jwk<'a, I>(keys: I) -> Result<EncryptionJwkInfo>
where
    I: Iterator<Item = &'a Map<String, Json>>,
{
    for jwk_map in keys {
        let Some(alg) = jwk_map.get("alg").and_then(Json::as_str) else {
            tracing::debug!("JWK missing required 'alg' parameter, skipping");
            continue;
        };
        if alg != ECDH_ES_ALG {
            tracing::debug!("JWK has unsupported alg '{alg}', skipping");
            continue;
        }

        match jwk_map.get("crv").and_then(Json::as_str) {
            Some("P-256") => {}
            other => {
                tracing::debug!(crv = ?other, "JWK is not a P-256 key, skipping");
                continue;
            }
        }

        match jwk_map.get("use").and_then(Json::as_str) {
            Some("enc") => {}
            Some(other) => {
                tracing::debug!("JWK has use='{other}', not suitable for encryption");
                continue;
            }
            None => {
                tracing::warn!("JWK missing 'use' parameter, assuming it can be used for encryption");
            }
        }

        let jwk = Jwk::from_map(jwk_map.clone()).context("failed to parse JWK")?;
        let kid = jwk_map.get("kid").and_then(Json::as_str).map(String::from);

        return Ok(EncryptionJwkInfo {
            jwk,
            alg: alg.to_string(),
            kid,
        });
    }

    bail!("no suitable encryption key found in JWKS (requires P-256 key with alg='ECDH-ES' and use='enc')")
}

/// Picks the content encryption algorithm from the relying party's metadata.
///
/// An explicit `authorization_encrypted_response_enc` wins; otherwise the first
/// entry of `encrypted_response_enc_values_supported` that the wallet supports is
/// used. Without either, the default `A128GCM` applies. The result must be in
/// `supported`.
pub fn negotiate_enc(client_metadata: &Map<String, Json>, supported: &[String]) -> Result<String> {
    let is_supported = |enc: &str| supported.iter().any(|s| s == enc);

    if let Some(enc) = client_metadata
        .get("authorization_encrypted_response_enc")
        .and_then(Json::as_str)
    {
        if !is_supported(enc) {
            bail!("requested content encryption '{enc}' is not supported");
        }
        return Ok(enc.to_string());
    }

    if let Some(values) = client_metadata
        .get("encrypted_response_enc_values_supported")
        .and_then(Json::as_array)
    {
        return values
            .iter()
            .filter_map(Json::as_str)
            .find(|enc| is_supported(enc))
            .map(str::to_string)
            .context("none of the offered content encryption algorithms are supported");
    }

    if !is_supported(DEFAULT_ENC) {
        bail!("default content encryption '{DEFAULT_ENC}' is not enabled");
    }
    Ok(DEFAULT_ENC.to_string())
}
