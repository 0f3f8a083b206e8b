//! HPKE base mode with DHKEM(P-256, HKDF-SHA256), HKDF-SHA256 and AES-128-GCM.
//!
//! `info` is always empty; the encoded session transcript is passed as `aad`.

use anyhow::{anyhow, Context, Result};
use ::hpke::{
    aead::AesGcm128, kdf::HkdfSha256, kem::DhP256HkdfSha256, Deserializable, Kem, OpModeR,
    OpModeS, Serializable,
};
use p256::{elliptic_curve::sec1::ToEncodedPoint, PublicKey, SecretKey};
use rand::rngs::OsRng;

type RecipientPublicKey = <DhP256HkdfSha256 as Kem>::PublicKey;
type RecipientPrivateKey = <DhP256HkdfSha256 as Kem>::PrivateKey;
type EncappedKey = <DhP256HkdfSha256 as Kem>::EncappedKey;

/// Output of [seal].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HpkeSealed {
    /// The ephemeral public key, uncompressed SEC1 encoding.
    pub encapsulated_key: Vec<u8>,
    pub cipher_text: Vec<u8>,
}

/// Encrypts `plaintext` to `recipient`, binding it to `aad`.
pub fn seal(recipient: &PublicKey, plaintext: &[u8], aad: &[u8]) -> Result<HpkeSealed> {
    let recipient = RecipientPublicKey::from_bytes(
        recipient.to_encoded_point(false).as_bytes(),
    )
    .map_err(|e| anyhow!("{e:?}"))
    .context("invalid HPKE recipient key")?;

    let (encapsulated_key, cipher_text) =
        ::hpke::single_shot_seal::<AesGcm128, HkdfSha256, DhP256HkdfSha256, _>(
            &OpModeS::Base,
            &recipient,
            &[],
            plaintext,
            aad,
            &mut OsRng,
        )
        .map_err(|e| anyhow!("{e:?}"))
        .context("HPKE seal failed")?;

    Ok(HpkeSealed {
        encapsulated_key: encapsulated_key.to_bytes().to_vec(),
        cipher_text,
    })
}

/// Decrypts a payload produced by [seal]. Fails if `aad` differs from the one
/// used at encryption time.
pub fn open(
    recipient: &SecretKey,
    encapsulated_key: &[u8],
    cipher_text: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let recipient = RecipientPrivateKey::from_bytes(recipient.to_bytes().as_slice())
        .map_err(|e| anyhow!("{e:?}"))
        .context("invalid HPKE recipient private key")?;
    let encapsulated_key = EncappedKey::from_bytes(encapsulated_key)
        .map_err(|e| anyhow!("{e:?}"))
        .context("invalid HPKE encapsulated key")?;

    ::hpke::single_shot_open::<AesGcm128, HkdfSha256, DhP256HkdfSha256>(
        &OpModeR::Base,
        &recipient,
        &encapsulated_key,
        &[],
        cipher_text,
        aad,
    )
    .map_err(|e| anyhow!("{e:?}"))
    .context("HPKE open failed")
}
