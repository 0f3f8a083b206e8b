#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use ciborium::Value as Cbor;
use coset::{iana, AsCborValue, CoseSign1, CoseSign1Builder, HeaderBuilder};
use http::{Request, Response};
use mdoc_presentment::{
    core::{cbor, session_transcript::SessionTranscript, util::AsyncHttpClient},
    credential::{Credential, CredentialFormat, KeyReference},
    presentment::{ConsentRequest, PresentmentError, PresentmentMechanism, PresentmentPrompt},
    secure_area::{KeyInfo, KeyPurpose, KeyUnlockData, SoftwareSecureArea},
};
use p256::{
    ecdsa::{signature::Signer, Signature, SigningKey},
    pkcs8::DecodePrivateKey,
    PublicKey,
};
use rcgen::{
    BasicConstraints, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose,
    PKCS_ECDSA_P256_SHA256,
};
use serde_json::Value as Json;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

pub const MDL: &str = "org.iso.18013.5.1.mDL";
pub const MDL_NS: &str = "org.iso.18013.5.1";
pub const PID_VCT: &str = "urn:eudi:pid:1";
pub const ORIGIN: &str = "https://verifier.example";

// ---------------------------------------------------------------------------
// Certificates
// ---------------------------------------------------------------------------

/// A certificate minted with rcgen, with its key.
pub struct TestCert {
    pub cert: rcgen::Certificate,
    pub key: KeyPair,
}

impl TestCert {
    pub fn der(&self) -> Vec<u8> {
        self.cert.der().to_vec()
    }

    pub fn signing_key(&self) -> SigningKey {
        SigningKey::from_pkcs8_der(&self.key.serialize_der()).unwrap()
    }
}

pub struct CertSpec<'a> {
    pub common_name: &'a str,
    pub ca: bool,
    pub issuer: Option<&'a TestCert>,
    pub validity: ((i32, u8, u8), (i32, u8, u8)),
    pub authority_key_identifier: bool,
    pub key_usages: Option<Vec<KeyUsagePurpose>>,
}

impl<'a> CertSpec<'a> {
    pub fn ca(common_name: &'a str) -> Self {
        Self {
            common_name,
            ca: true,
            issuer: None,
            validity: ((2020, 1, 1), (2040, 1, 1)),
            authority_key_identifier: true,
            key_usages: None,
        }
    }

    pub fn leaf(common_name: &'a str, issuer: &'a TestCert) -> Self {
        Self {
            common_name,
            ca: false,
            issuer: Some(issuer),
            validity: ((2020, 1, 1), (2040, 1, 1)),
            authority_key_identifier: true,
            key_usages: None,
        }
    }

    pub fn issued_by(mut self, issuer: &'a TestCert) -> Self {
        self.issuer = Some(issuer);
        self
    }

    pub fn valid(mut self, from: (i32, u8, u8), to: (i32, u8, u8)) -> Self {
        self.validity = (from, to);
        self
    }

    pub fn key_usages(mut self, key_usages: Vec<KeyUsagePurpose>) -> Self {
        self.key_usages = Some(key_usages);
        self
    }

    pub fn without_authority_key_identifier(mut self) -> Self {
        self.authority_key_identifier = false;
        self
    }

    pub fn build(self) -> TestCert {
        let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap();
        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, self.common_name);
        let ((y1, m1, d1), (y2, m2, d2)) = self.validity;
        params.not_before = rcgen::date_time_ymd(y1, m1, d1);
        params.not_after = rcgen::date_time_ymd(y2, m2, d2);
        params.use_authority_key_identifier_extension = self.authority_key_identifier;
        if self.ca {
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            params.key_usages = vec![
                KeyUsagePurpose::KeyCertSign,
                KeyUsagePurpose::CrlSign,
                KeyUsagePurpose::DigitalSignature,
            ];
        } else {
            params.is_ca = IsCa::ExplicitNoCa;
            params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        }
        if let Some(key_usages) = self.key_usages {
            params.key_usages = key_usages;
        }

        let cert = match self.issuer {
            Some(issuer) => params.signed_by(&key, &issuer.cert, &issuer.key).unwrap(),
            None => params.self_signed(&key).unwrap(),
        };
        TestCert { cert, key }
    }
}

/// Reader chain `[leaf, intermediate]` under `root`.
pub fn reader_chain() -> (TestCert, TestCert, TestCert) {
    let root = CertSpec::ca("Reader Root").build();
    let intermediate = CertSpec::ca("Reader Intermediate").issued_by(&root).build();
    let leaf = CertSpec::leaf("Reader", &intermediate).build();
    (root, intermediate, leaf)
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

fn item(digest_id: i64, name: &str, value: Cbor) -> Cbor {
    cbor::tag24(&cbor::text_map([
        ("digestID", Cbor::Integer(digest_id.into())),
        ("random", Cbor::Bytes(vec![digest_id as u8; 16])),
        ("elementIdentifier", Cbor::Text(name.into())),
        ("elementValue", value),
    ]))
    .unwrap()
}

/// `IssuerSigned` of an mDL; the issuer signature is a placeholder.
pub fn mdl_issuer_signed() -> Vec<u8> {
    let mso = cbor::text_map([
        ("version", Cbor::Text("1.0".into())),
        ("digestAlgorithm", Cbor::Text("SHA-256".into())),
        ("docType", Cbor::Text(MDL.into())),
    ]);
    let issuer_auth = CoseSign1Builder::new()
        .protected(HeaderBuilder::new().algorithm(iana::Algorithm::ES256).build())
        .payload(cbor::to_vec(&cbor::tag24(&mso).unwrap()).unwrap())
        .signature(vec![0; 64])
        .build();

    cbor::to_vec(&cbor::text_map([
        (
            "nameSpaces",
            Cbor::Map(vec![(
                Cbor::Text(MDL_NS.into()),
                Cbor::Array(vec![
                    item(0, "family_name", Cbor::Text("Mustermann".into())),
                    item(1, "given_name", Cbor::Text("Erika".into())),
                    item(2, "age_over_18", Cbor::Bool(true)),
                    item(3, "portrait", Cbor::Bytes(vec![0xff, 0xd8])),
                ]),
            )]),
        ),
        ("issuerAuth", issuer_auth.to_cbor_value().unwrap()),
    ]))
    .unwrap()
}

fn b64url(bytes: impl AsRef<[u8]>) -> String {
    mdoc_presentment::utils::encode_base64url(bytes)
}

fn disclosure(name: &str, value: Json) -> String {
    b64url(serde_json::json!(["c2FsdA", name, value]).to_string())
}

fn digest(disclosure: &str) -> String {
    b64url(Sha256::digest(disclosure.as_bytes()))
}

/// PID with `given_name`, `family_name` and an `address` whose
/// `street_address` and `locality` are disclosed separately.
pub fn pid_sd_jwt() -> String {
    let given_name = disclosure("given_name", serde_json::json!("Erika"));
    let family_name = disclosure("family_name", serde_json::json!("Mustermann"));
    let street_address = disclosure("street_address", serde_json::json!("Heidestrasse 17"));
    let locality = disclosure("locality", serde_json::json!("Koeln"));
    let address = disclosure(
        "address",
        serde_json::json!({ "_sd": [digest(&street_address), digest(&locality)] }),
    );

    let header = b64url(r#"{"alg":"ES256","typ":"dc+sd-jwt"}"#);
    let payload = b64url(
        serde_json::json!({
            "iss": "https://issuer.example",
            "vct": PID_VCT,
            "_sd": [digest(&given_name), digest(&family_name), digest(&address)],
            "_sd_alg": "sha-256"
        })
        .to_string(),
    );
    format!("{header}.{payload}.c2ln~{given_name}~{family_name}~{street_address}~{locality}~{address}~")
}

pub struct Holder {
    pub secure_area: Arc<SoftwareSecureArea>,
    pub device_key: PublicKey,
}

impl Holder {
    pub async fn new(passphrase: Option<&str>) -> Self {
        let secure_area = Arc::new(SoftwareSecureArea::new());
        let device_key = secure_area
            .create_key("device", vec![KeyPurpose::Sign], passphrase.map(str::to_string))
            .await;
        Self {
            secure_area,
            device_key,
        }
    }

    fn key(&self) -> KeyReference {
        KeyReference {
            alias: "device".into(),
            secure_area: self.secure_area.clone(),
        }
    }

    pub fn mdl(&self) -> Credential {
        Credential::new(
            "mdl-1",
            CredentialFormat::Mdoc {
                doc_type: MDL.into(),
            },
            mdl_issuer_signed(),
            self.key(),
        )
    }

    pub fn pid(&self) -> Credential {
        Credential::new(
            "pid-1",
            CredentialFormat::SdJwtVc {
                vct: PID_VCT.into(),
            },
            pid_sd_jwt().into_bytes(),
            self.key(),
        )
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// `DeviceRequest` bytes for `elements` of the mDL namespace, optionally reader
/// authenticated by the first certificate of `chain`.
pub fn device_request(elements: &[(&str, bool)], reader_auth: Option<(&[&TestCert], &SessionTranscript)>) -> Vec<u8> {
    let items_request = cbor::tag24(&cbor::text_map([
        ("docType", Cbor::Text(MDL.into())),
        (
            "nameSpaces",
            Cbor::Map(vec![(
                Cbor::Text(MDL_NS.into()),
                Cbor::Map(
                    elements
                        .iter()
                        .map(|(name, retain)| (Cbor::Text(name.to_string()), Cbor::Bool(*retain)))
                        .collect(),
                ),
            )]),
        ),
    ]))
    .unwrap();

    let mut doc_request = vec![("itemsRequest", items_request.clone())];
    if let Some((chain, transcript)) = reader_auth {
        let reader = chain[0];
        let x5chain = match chain {
            [single] => Cbor::Bytes(single.der()),
            _ => Cbor::Array(chain.iter().map(|c| Cbor::Bytes(c.der())).collect()),
        };
        let reader_authentication = Cbor::Array(vec![
            Cbor::Text("ReaderAuthentication".into()),
            transcript.to_cbor().unwrap(),
            items_request,
        ]);
        let payload = cbor::to_vec(&cbor::tag24(&reader_authentication).unwrap()).unwrap();
        let key = reader.signing_key();
        let sign1 = CoseSign1Builder::new()
            .protected(HeaderBuilder::new().algorithm(iana::Algorithm::ES256).build())
            .unprotected(HeaderBuilder::new().value(33, x5chain).build())
            .create_detached_signature(&payload, &[], |data| {
                let signature: Signature = key.sign(data);
                signature.to_bytes().to_vec()
            })
            .build();
        doc_request.push(("readerAuth", sign1.to_cbor_value().unwrap()));
    }

    cbor::to_vec(&cbor::text_map([
        ("version", Cbor::Text("1.0".into())),
        ("docRequests", Cbor::Array(vec![cbor::text_map(doc_request)])),
    ]))
    .unwrap()
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// Elements disclosed in the first document of a `DeviceResponse`, after
/// checking its device signature against `device_key` and `transcript`.
pub fn verify_device_response(bytes: &[u8], transcript: &SessionTranscript, device_key: &PublicKey) -> Vec<String> {
    use mdoc_presentment::core::verifier::{P256Verifier, Verifier};

    let response: Cbor = cbor::from_slice(bytes).unwrap();
    let response = cbor::as_map(&response, "DeviceResponse").unwrap();
    assert_eq!(cbor::required_text(response, "version").unwrap(), "1.0");
    assert_eq!(cbor::required_int(response, "status").unwrap(), 0);

    let documents = cbor::as_array(cbor::required(response, "documents").unwrap(), "documents").unwrap();
    assert_eq!(documents.len(), 1);
    let document = cbor::as_map(&documents[0], "Document").unwrap();
    let doc_type = cbor::required_text(document, "docType").unwrap();

    let device_signed = cbor::as_map(cbor::required(document, "deviceSigned").unwrap(), "deviceSigned").unwrap();
    let device_auth = cbor::as_map(cbor::required(device_signed, "deviceAuth").unwrap(), "deviceAuth").unwrap();
    let signature = CoseSign1::from_cbor_value(cbor::required(device_auth, "deviceSignature").unwrap().clone()).unwrap();

    let device_authentication = Cbor::Array(vec![
        Cbor::Text("DeviceAuthentication".into()),
        transcript.to_cbor().unwrap(),
        Cbor::Text(doc_type.into()),
        cbor::required(device_signed, "nameSpaces").unwrap().clone(),
    ]);
    let payload = cbor::to_vec(&cbor::tag24(&device_authentication).unwrap()).unwrap();
    let verifier = P256Verifier::from_key(device_key);
    signature
        .verify_detached_signature(&payload, &[], |sig, data| verifier.verify(data, sig))
        .expect("device signature must verify against the session transcript");

    let issuer_signed = cbor::as_map(cbor::required(document, "issuerSigned").unwrap(), "issuerSigned").unwrap();
    let name_spaces = cbor::as_map(cbor::required(issuer_signed, "nameSpaces").unwrap(), "nameSpaces").unwrap();
    name_spaces
        .iter()
        .flat_map(|(_, items)| items.as_array().unwrap().iter())
        .map(|item| {
            let item = cbor::untag24(item).unwrap();
            let item = cbor::as_map(&item, "IssuerSignedItem").unwrap();
            cbor::required_text(item, "elementIdentifier").unwrap().to_string()
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

pub struct TestMechanism {
    pub protocol: String,
    pub request: String,
    pub web_origin: Option<String>,
    pub app_id: String,
    pub document: Option<Credential>,
    pub sent: Mutex<Vec<String>>,
    pub fail_send: bool,
}

impl TestMechanism {
    pub fn web(protocol: &str, request: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            request: request.into(),
            web_origin: Some(ORIGIN.into()),
            app_id: "com.android.chrome".into(),
            document: None,
            sent: Mutex::new(vec![]),
            fail_send: false,
        }
    }

    pub fn app(protocol: &str, request: impl Into<String>, app_id: &str) -> Self {
        Self {
            web_origin: None,
            app_id: app_id.into(),
            ..Self::web(protocol, request)
        }
    }

    pub fn sent(&self) -> Vec<Json> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|s| serde_json::from_str(s).unwrap())
            .collect()
    }
}

#[async_trait]
impl PresentmentMechanism for TestMechanism {
    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn request(&self) -> &str {
        &self.request
    }

    fn web_origin(&self) -> Option<&str> {
        self.web_origin.as_deref()
    }

    fn app_id(&self) -> &str {
        &self.app_id
    }

    fn document(&self) -> Option<&Credential> {
        self.document.as_ref()
    }

    async fn send_response(&self, response: String) -> Result<()> {
        if self.fail_send {
            anyhow::bail!("transport closed");
        }
        self.sent.lock().unwrap().push(response);
        Ok(())
    }
}

#[derive(Default)]
pub struct TestPrompt {
    pub decline: bool,
    /// The consent prompt is dismissed rather than answered.
    pub dismiss_consent: bool,
    pub passphrase: Option<String>,
    /// Fired from inside the consent prompt, which then never returns.
    pub cancel_on_consent: Option<CancellationToken>,
    pub consent_requests: Mutex<Vec<ConsentRequest>>,
    pub unlock_requests: Mutex<usize>,
}

impl TestPrompt {
    pub fn accepting() -> Self {
        Self::default()
    }

    pub fn declining() -> Self {
        Self {
            decline: true,
            ..Self::default()
        }
    }

    pub fn last_consent(&self) -> ConsentRequest {
        self.consent_requests.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl PresentmentPrompt for TestPrompt {
    async fn request_consent(&self, request: &ConsentRequest) -> Result<bool> {
        self.consent_requests.lock().unwrap().push(request.clone());
        if let Some(token) = &self.cancel_on_consent {
            token.cancel();
            std::future::pending::<()>().await;
        }
        if self.dismiss_consent {
            return Err(PresentmentError::Cancelled.into());
        }
        Ok(!self.decline)
    }

    async fn unlock_key(&self, _key: &KeyInfo) -> Result<Option<KeyUnlockData>> {
        *self.unlock_requests.lock().unwrap() += 1;
        Ok(self.passphrase.clone().map(KeyUnlockData::Passphrase))
    }
}

/// Serves one JSON document for every request.
pub struct JsonClient(pub Json);

#[async_trait]
impl AsyncHttpClient for JsonClient {
    async fn execute(&self, _request: Request<Vec<u8>>) -> Result<Response<Vec<u8>>> {
        Ok(Response::builder()
            .status(200)
            .body(serde_json::to_vec(&self.0)?)?)
    }
}
