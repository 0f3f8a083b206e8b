use anyhow::{Context, Result};
use ciborium::Value as Cbor;
use coset::{iana, AsCborValue, CoseSign1, CoseSign1Builder, HeaderBuilder};

use super::issuer_signed::IssuerSigned;
use crate::core::{cbor, session_transcript::SessionTranscript};

pub const DEVICE_RESPONSE_VERSION: &str = "1.0";

/// DeviceResponse status code for a successful response.
pub const STATUS_OK: u64 = 0;

/// A document waiting for its device signature.
///
/// The signing key lives in a secure area that may need user interaction, so the
/// signature is produced outside of this type: call [Self::signing_input], sign it
/// with ES256, and pass the raw signature to [Self::finish].
#[derive(Debug, Clone)]
pub struct UnsignedDocument {
    doc_type: String,
    issuer_signed: IssuerSigned,
    device_name_spaces_bytes: Cbor,
    device_signature: CoseSign1,
    device_authentication_bytes: Vec<u8>,
}

impl UnsignedDocument {
    /// Prepares a document disclosing `issuer_signed` (already filtered).
    ///
    /// `DeviceAuthentication = ["DeviceAuthentication", SessionTranscript, DocType,
    /// DeviceNameSpacesBytes]`, signed as a detached tag-24 payload.
    pub fn new(issuer_signed: IssuerSigned, transcript: &SessionTranscript) -> Result<Self> {
        let doc_type = issuer_signed
            .doc_type()
            .context("unable to read docType from the MSO")?;

        // No device-signed elements are released.
        let device_name_spaces_bytes = cbor::tag24(&Cbor::Map(vec![]))?;

        let device_authentication = Cbor::Array(vec![
            Cbor::Text("DeviceAuthentication".into()),
            transcript.to_cbor()?,
            Cbor::Text(doc_type.clone()),
            device_name_spaces_bytes.clone(),
        ]);
        let device_authentication_bytes = cbor::to_vec(&cbor::tag24(&device_authentication)?)?;

        let device_signature = CoseSign1Builder::new()
            .protected(HeaderBuilder::new().algorithm(iana::Algorithm::ES256).build())
            .build();

        Ok(Self {
            doc_type,
            issuer_signed,
            device_name_spaces_bytes,
            device_signature,
            device_authentication_bytes,
        })
    }

    pub fn doc_type(&self) -> &str {
        &self.doc_type
    }

    /// The COSE `Sig_structure` bytes to sign.
    pub fn signing_input(&self) -> Vec<u8> {
        self.device_signature
            .tbs_detached_data(&self.device_authentication_bytes, &[])
    }

    /// Attaches the raw `r || s` signature and returns the encoded `Document`.
    pub fn finish(self, signature: Vec<u8>) -> Result<Cbor> {
        let mut device_signature = self.device_signature;
        device_signature.signature = signature;
        let device_signature = device_signature
            .to_cbor_value()
            .map_err(|e| anyhow::anyhow!("{e:?}"))
            .context("failed to encode deviceSignature")?;

        Ok(cbor::text_map([
            ("docType", Cbor::Text(self.doc_type)),
            ("issuerSigned", self.issuer_signed.to_cbor()),
            (
                "deviceSigned",
                cbor::text_map([
                    ("nameSpaces", self.device_name_spaces_bytes),
                    (
                        "deviceAuth",
                        cbor::text_map([("deviceSignature", device_signature)]),
                    ),
                ]),
            ),
        ]))
    }
}

/// `DeviceResponse = {version, documents, status}`, always with status OK.
pub fn device_response(documents: Vec<Cbor>) -> Result<Vec<u8>> {
    cbor::to_vec(&cbor::text_map([
        ("version", Cbor::Text(DEVICE_RESPONSE_VERSION.into())),
        ("documents", Cbor::Array(documents)),
        ("status", Cbor::Integer(STATUS_OK.into())),
    ]))
    .context("failed to encode DeviceResponse")
}
