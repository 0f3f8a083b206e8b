//! Conversion between P-256 public keys and EC2 `COSE_Key` structures.

use anyhow::{bail, Context, Result};
use ciborium::Value as Cbor;
use coset::{iana, AsCborValue, CoseKey, CoseKeyBuilder, KeyType, Label};
use p256::{
    elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint},
    EncodedPoint, PublicKey,
};

pub fn to_cose_key(key: &PublicKey) -> Result<CoseKey> {
    let point = key.to_encoded_point(false);
    let x = point.x().context("public key has no x coordinate")?;
    let y = point.y().context("public key has no y coordinate")?;
    Ok(CoseKeyBuilder::new_ec2_pub_key(iana::EllipticCurve::P_256, x.to_vec(), y.to_vec()).build())
}

pub fn to_cose_key_cbor(key: &PublicKey) -> Result<Cbor> {
    to_cose_key(key)?
        .to_cbor_value()
        .map_err(|e| anyhow::anyhow!("{e:?}"))
        .context("failed to encode COSE_Key")
}

pub fn from_cose_key(key: &CoseKey) -> Result<PublicKey> {
    if key.kty != KeyType::Assigned(iana::KeyType::EC2) {
        bail!("COSE_Key is not an EC2 key: {:?}", key.kty);
    }

    let param = |label: iana::Ec2KeyParameter| {
        key.params
            .iter()
            .find(|(l, _)| *l == Label::Int(label as i64))
            .map(|(_, v)| v)
    };

    let crv = param(iana::Ec2KeyParameter::Crv)
        .and_then(Cbor::as_integer)
        .context("COSE_Key is missing 'crv'")?;
    if i128::from(crv) != iana::EllipticCurve::P_256 as i128 {
        bail!("COSE_Key curve is not P-256");
    }

    let x = param(iana::Ec2KeyParameter::X)
        .and_then(Cbor::as_bytes)
        .context("COSE_Key is missing 'x'")?;
    let y = param(iana::Ec2KeyParameter::Y)
        .and_then(Cbor::as_bytes)
        .context("COSE_Key is missing 'y'")?;
    if x.len() != 32 || y.len() != 32 {
        bail!("COSE_Key coordinates must be 32 bytes");
    }

    let point = EncodedPoint::from_affine_coordinates(x.as_slice().into(), y.as_slice().into(), false);
    Option::<PublicKey>::from(PublicKey::from_encoded_point(&point))
        .context("COSE_Key is not a valid P-256 point")
}

pub fn from_cose_key_cbor(value: &Cbor) -> Result<PublicKey> {
    let key = CoseKey::from_cbor_value(value.clone())
        .map_err(|e| anyhow::anyhow!("{e:?}"))
        .context("failed to decode COSE_Key")?;
    from_cose_key(&key)
}

/// Decodes an uncompressed (or compressed) SEC1 point.
pub fn from_sec1(bytes: &[u8]) -> Result<PublicKey> {
    PublicKey::from_sec1_bytes(bytes).context("invalid SEC1 P-256 public key")
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::SecretKey;
    use rand::rngs::OsRng;

    #[test]
    fn cose_key_round_trip() {
        let key = SecretKey::random(&mut OsRng).public_key();
        let value = to_cose_key_cbor(&key).unwrap();
        assert_eq!(from_cose_key_cbor(&value).unwrap(), key);
    }

    #[test]
    fn rejects_okp_keys() {
        let key = CoseKeyBuilder::new_okp_key().build();
        assert!(from_cose_key(&key).is_err());
    }
}
