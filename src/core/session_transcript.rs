//! Session transcripts and the per-protocol handovers they carry.
//!
//! Both sides derive the transcript independently from public inputs; it is
//! never transmitted, only signed over (device authentication) and used as HPKE
//! associated data.

use anyhow::{Context, Result};
use ciborium::Value as Cbor;
use serde::Serialize;
use sha2::{Digest, Sha256};

use super::cbor;

/// Handover identifier for native apps using the preview protocol.
pub const ANDROID_HANDOVER_V1: &str = "AndroidHandoverv1";

/// Handover identifier for websites using the preview protocol.
pub const BROWSER_HANDOVER_V1: &str = "BrowserHandoverv1";

/// Handover identifier for OpenID4VP over the Digital Credentials API.
pub const DC_API_HANDOVER_TYPE_IDENTIFIER: &str = "OpenID4VPDCAPIHandover";

/// Handover identifier for Austroads request forwarding, version 2.
pub const ARF_HANDOVER_V2: &str = "ARFHandoverv2";

/// Handover identifier for ISO 18013-7 Annex C (`org.iso.mdoc`).
pub const ISO_DC_API_HANDOVER: &str = "dcapi";

/// The protocol-distinguishing third element of a [SessionTranscript].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handover {
    /// `["AndroidHandoverv1", nonce, packageName bytes, SHA-256(reader key)]`
    Android {
        nonce: Vec<u8>,
        package_name: String,
        reader_key_hash: [u8; 32],
    },
    /// `["BrowserHandoverv1", nonce, OriginInfoBytes, SHA-256(reader key)]`
    Browser {
        nonce: Vec<u8>,
        origin: String,
        reader_key_hash: [u8; 32],
    },
    /// `["OpenID4VPDCAPIHandover", SHA-256(cbor([origin, clientId, nonce]))]`
    OpenId4VpDcApi { handover_info_hash: [u8; 32] },
    /// `["ARFHandoverv2", encryptionInfo base64, origin]`
    Arf {
        encryption_info: String,
        origin: String,
    },
    /// `["dcapi", SHA-256(cbor([encryptionInfo base64, origin]))]`
    IsoDcApi { dcapi_info_hash: [u8; 32] },
}

impl Handover {
    /// Builds the preview handover for a native app.
    ///
    /// * `reader_public_key` - the uncompressed SEC1 encoding of the reader key
    pub fn android(nonce: &[u8], package_name: &str, reader_public_key: &[u8]) -> Self {
        Self::Android {
            nonce: nonce.to_vec(),
            package_name: package_name.to_owned(),
            reader_key_hash: Sha256::digest(reader_public_key).into(),
        }
    }

    /// Builds the preview handover for a website.
    pub fn browser(nonce: &[u8], origin: &str, reader_public_key: &[u8]) -> Self {
        Self::Browser {
            nonce: nonce.to_vec(),
            origin: origin.to_owned(),
            reader_key_hash: Sha256::digest(reader_public_key).into(),
        }
    }

    /// Builds the OpenID4VP DC-API handover.
    ///
    /// # Arguments
    ///
    /// * `origin` - The Origin of the request. MUST NOT be prefixed with "origin:".
    /// * `client_id` - The effective client identifier (see the client id rules of the
    ///   OpenID4VP adapter).
    /// * `nonce` - The nonce from the request.
    pub fn openid4vp_dc_api(origin: &str, client_id: &str, nonce: &str) -> Result<Self> {
        let handover_info = Cbor::Array(vec![
            Cbor::Text(origin.to_owned()),
            Cbor::Text(client_id.to_owned()),
            Cbor::Text(nonce.to_owned()),
        ]);
        let handover_info_bytes = cbor::to_vec(&handover_info)
            .context("failed to encode OpenID4VPDCAPIHandoverInfo CBOR")?;

        Ok(Self::OpenId4VpDcApi {
            handover_info_hash: Sha256::digest(&handover_info_bytes).into(),
        })
    }

    pub fn arf(encryption_info: &str, origin: &str) -> Self {
        Self::Arf {
            encryption_info: encryption_info.to_owned(),
            origin: origin.to_owned(),
        }
    }

    /// Builds the ISO 18013-7 Annex C handover.
    pub fn iso_dc_api(encryption_info: &str, origin: &str) -> Result<Self> {
        let dcapi_info = Cbor::Array(vec![
            Cbor::Text(encryption_info.to_owned()),
            Cbor::Text(origin.to_owned()),
        ]);
        let dcapi_info_bytes =
            cbor::to_vec(&dcapi_info).context("failed to encode dcapiInfo CBOR")?;

        Ok(Self::IsoDcApi {
            dcapi_info_hash: Sha256::digest(&dcapi_info_bytes).into(),
        })
    }

    pub fn to_cbor(&self) -> Result<Cbor> {
        Ok(match self {
            Handover::Android {
                nonce,
                package_name,
                reader_key_hash,
            } => Cbor::Array(vec![
                Cbor::Text(ANDROID_HANDOVER_V1.to_owned()),
                Cbor::Bytes(nonce.clone()),
                Cbor::Bytes(package_name.as_bytes().to_vec()),
                Cbor::Bytes(reader_key_hash.to_vec()),
            ]),
            Handover::Browser {
                nonce,
                origin,
                reader_key_hash,
            } => Cbor::Array(vec![
                Cbor::Text(BROWSER_HANDOVER_V1.to_owned()),
                Cbor::Bytes(nonce.clone()),
                Cbor::Bytes(origin_info_bytes(origin)?),
                Cbor::Bytes(reader_key_hash.to_vec()),
            ]),
            Handover::OpenId4VpDcApi { handover_info_hash } => Cbor::Array(vec![
                Cbor::Text(DC_API_HANDOVER_TYPE_IDENTIFIER.to_owned()),
                Cbor::Bytes(handover_info_hash.to_vec()),
            ]),
            Handover::Arf {
                encryption_info,
                origin,
            } => Cbor::Array(vec![
                Cbor::Text(ARF_HANDOVER_V2.to_owned()),
                Cbor::Text(encryption_info.clone()),
                Cbor::Text(origin.clone()),
            ]),
            Handover::IsoDcApi { dcapi_info_hash } => Cbor::Array(vec![
                Cbor::Text(ISO_DC_API_HANDOVER.to_owned()),
                Cbor::Bytes(dcapi_info_hash.to_vec()),
            ]),
        })
    }
}

/// `OriginInfo` for browser presentations: `{cat: 1, type: 1, details: {baseUrl}}`.
fn origin_info_bytes(origin: &str) -> Result<Vec<u8>> {
    let origin_info = cbor::text_map([
        ("cat", Cbor::Integer(1.into())),
        ("type", Cbor::Integer(1.into())),
        (
            "details",
            cbor::text_map([("baseUrl", Cbor::Text(origin.to_owned()))]),
        ),
    ]);
    cbor::to_vec(&origin_info).context("failed to encode OriginInfo CBOR")
}

/// `SessionTranscript = [DeviceEngagementBytes, EReaderKeyBytes, Handover]`
///
/// The first two elements are always `null` for the browser and app based
/// protocols handled here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTranscript {
    handover: Handover,
}

impl SessionTranscript {
    pub fn new(handover: Handover) -> Self {
        Self { handover }
    }

    pub fn handover(&self) -> &Handover {
        &self.handover
    }

    /// The transcript as a CBOR value, for embedding in larger structures.
    pub fn to_cbor(&self) -> Result<Cbor> {
        Ok(Cbor::Array(vec![
            Cbor::Null,
            Cbor::Null,
            self.handover.to_cbor()?,
        ]))
    }

    /// Serializes the SessionTranscript to CBOR bytes.
    ///
    /// The output is: `[null, null, Handover]`
    pub fn to_cbor_bytes(&self) -> Result<Vec<u8>> {
        cbor::to_vec(&self.to_cbor()?).context("failed to serialize SessionTranscript to CBOR")
    }
}

impl Serialize for SessionTranscript {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_cbor()
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}
