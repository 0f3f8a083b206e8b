use anyhow::{bail, Error, Result};
use p256::ecdsa::signature::Verifier as _;
use x509_cert::spki::SubjectPublicKeyInfoRef;

pub trait Verifier: Sized {
    /// Construct a [Verifier] from [SubjectPublicKeyInfoRef].
    ///
    /// ## Params
    /// * `spki` - the public key information necessary to construct a [Verifier].
    /// * `algorithm` - the JOSE/COSE algorithm name the signature claims to use.
    fn from_spki(spki: SubjectPublicKeyInfoRef<'_>, algorithm: &str) -> Result<Self>;

    /// Verifies a raw `r || s` signature.
    fn verify(&self, payload: &[u8], signature: &[u8]) -> Result<()>;

    /// Verifies a DER encoded signature, as found in X.509 certificates.
    fn verify_der(&self, payload: &[u8], signature: &[u8]) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct P256Verifier(p256::ecdsa::VerifyingKey);

impl P256Verifier {
    pub fn from_key(key: &p256::PublicKey) -> Self {
        Self(key.into())
    }
}

impl Verifier for P256Verifier {
    fn from_spki(spki: SubjectPublicKeyInfoRef<'_>, algorithm: &str) -> Result<Self> {
        if algorithm != "ES256" {
            bail!("P256Verifier cannot verify signatures made with '{algorithm}'")
        }
        spki.try_into().map(Self).map_err(Error::from)
    }

    fn verify(&self, payload: &[u8], signature: &[u8]) -> Result<()> {
        let signature = p256::ecdsa::Signature::from_slice(signature)?;
        self.0.verify(payload, &signature).map_err(Error::from)
    }

    fn verify_der(&self, payload: &[u8], signature: &[u8]) -> Result<()> {
        let signature = p256::ecdsa::Signature::from_der(signature)?;
        self.0.verify(payload, &signature).map_err(Error::from)
    }
}
