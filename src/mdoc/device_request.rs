use anyhow::{bail, Context, Result};
use ciborium::Value as Cbor;
use coset::{iana, AsCborValue, CoseSign1, Label, RegisteredLabelWithPrivate};
use x509_cert::{
    der::{referenced::OwnedToRef, Decode},
    Certificate,
};

use crate::core::{
    cbor,
    claim_request::RequestedClaim,
    session_transcript::SessionTranscript,
    verifier::{P256Verifier, Verifier},
};

/// COSE header label carrying the X.509 chain.
pub const X5CHAIN_LABEL: i64 = 33;

/// `ItemsRequest`, decoded from its tag-24 wrapper.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemsRequest {
    pub doc_type: String,
    /// Requested elements in request order.
    pub claims: Vec<RequestedClaim>,
}

impl ItemsRequest {
    fn from_cbor(value: &Cbor) -> Result<Self> {
        let map = cbor::as_map(value, "ItemsRequest")?;
        let doc_type = cbor::required_text(map, "docType")?.to_string();

        let mut claims = vec![];
        for (namespace, elements) in cbor::as_map(cbor::required(map, "nameSpaces")?, "nameSpaces")? {
            let namespace = namespace
                .as_text()
                .context("namespace key is not a text string")?;
            for (name, intent_to_retain) in cbor::as_map(elements, namespace)? {
                claims.push(RequestedClaim::new(
                    namespace,
                    name.as_text().context("data element identifier is not a text string")?,
                    intent_to_retain
                        .as_bool()
                        .context("IntentToRetain is not a boolean")?,
                ));
            }
        }

        Ok(Self { doc_type, claims })
    }
}

#[derive(Debug, Clone)]
pub struct DocRequest {
    pub items_request: ItemsRequest,
    /// `ItemsRequestBytes`, as received, for reader authentication.
    items_request_bytes: Cbor,
    reader_auth: Option<CoseSign1>,
}

impl DocRequest {
    fn from_cbor(value: &Cbor) -> Result<Self> {
        let map = cbor::as_map(value, "DocRequest")?;
        let items_request_bytes = cbor::required(map, "itemsRequest")?.clone();
        let items_request = ItemsRequest::from_cbor(
            &cbor::untag24(&items_request_bytes).context("itemsRequest is not ItemsRequestBytes")?,
        )?;

        let reader_auth = cbor::map_get(map, "readerAuth")
            .map(|value| {
                CoseSign1::from_cbor_value(value.clone())
                    .map_err(|e| anyhow::anyhow!("{e:?}"))
                    .context("readerAuth is not a COSE_Sign1")
            })
            .transpose()?;

        Ok(Self {
            items_request,
            items_request_bytes,
            reader_auth,
        })
    }

    pub fn has_reader_auth(&self) -> bool {
        self.reader_auth.is_some()
    }

    /// Verifies `readerAuth` over `ReaderAuthenticationBytes` and returns the
    /// reader's certificate chain, DER encoded, leaf first.
    ///
    /// `ReaderAuthentication = ["ReaderAuthentication", SessionTranscript, ItemsRequestBytes]`
    pub fn verify_reader_auth(&self, transcript: &SessionTranscript) -> Result<Vec<Vec<u8>>> {
        let reader_auth = self.reader_auth.as_ref().context("request has no readerAuth")?;

        let alg = reader_auth.protected.header.alg.as_ref();
        if alg != Some(&RegisteredLabelWithPrivate::Assigned(iana::Algorithm::ES256)) {
            bail!("unsupported readerAuth algorithm: {alg:?}");
        }

        let chain = x5chain(reader_auth)?;
        let leaf = Certificate::from_der(chain.first().context("x5chain is empty")?)
            .context("reader certificate was not valid DER")?;
        let verifier = P256Verifier::from_spki(
            leaf.tbs_certificate.subject_public_key_info.owned_to_ref(),
            "ES256",
        )?;

        let reader_authentication = Cbor::Array(vec![
            Cbor::Text("ReaderAuthentication".into()),
            transcript.to_cbor()?,
            self.items_request_bytes.clone(),
        ]);
        let payload = cbor::to_vec(&cbor::tag24(&reader_authentication)?)?;

        reader_auth
            .verify_detached_signature(&payload, &[], |signature, data| {
                verifier.verify(data, signature)
            })
            .context("readerAuth signature could not be verified")?;

        Ok(chain)
    }
}

/// Reads `x5chain` from the unprotected header, falling back to the protected one.
pub(crate) fn x5chain(sign1: &CoseSign1) -> Result<Vec<Vec<u8>>> {
    let label = Label::Int(X5CHAIN_LABEL);
    let value = sign1
        .unprotected
        .rest
        .iter()
        .chain(sign1.protected.header.rest.iter())
        .find(|(l, _)| *l == label)
        .map(|(_, v)| v)
        .context("COSE_Sign1 has no x5chain")?;

    match value {
        Cbor::Bytes(der) => Ok(vec![der.clone()]),
        Cbor::Array(certs) => certs
            .iter()
            .map(|c| {
                c.as_bytes()
                    .cloned()
                    .context("x5chain entry is not a byte string")
            })
            .collect(),
        _ => bail!("x5chain is neither a byte string nor an array"),
    }
}

/// `DeviceRequest = {version, docRequests: [+ DocRequest]}`
#[derive(Debug, Clone)]
pub struct DeviceRequest {
    pub version: String,
    pub doc_requests: Vec<DocRequest>,
}

impl DeviceRequest {
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let value: Cbor = cbor::from_slice(bytes).context("DeviceRequest was not valid CBOR")?;
        let map = cbor::as_map(&value, "DeviceRequest")?;

        let version = cbor::required_text(map, "version")?.to_string();
        if !version.starts_with("1.") {
            bail!("unsupported DeviceRequest version '{version}'");
        }

        let doc_requests = cbor::as_array(cbor::required(map, "docRequests")?, "docRequests")?
            .iter()
            .map(DocRequest::from_cbor)
            .collect::<Result<Vec<_>>>()?;
        if doc_requests.is_empty() {
            bail!("DeviceRequest contains no docRequests");
        }

        Ok(Self {
            version,
            doc_requests,
        })
    }
}
