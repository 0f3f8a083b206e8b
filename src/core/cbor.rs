//! Small helpers over [ciborium] values.
//!
//! mdoc structures are mostly text-keyed maps and tag-24 wrapped byte strings, so
//! most decoding here works on [Cbor] values directly rather than through serde
//! derives. That keeps the original bytes of signed structures intact.

use anyhow::{bail, Context, Result};
use ciborium::Value as Cbor;
use serde::{de::DeserializeOwned, Serialize};

/// CBOR tag for an embedded, encoded CBOR data item (`#6.24(bstr .cbor T)`).
pub const TAG_ENCODED_CBOR: u64 = 24;

pub fn to_vec<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes).context("failed to encode CBOR")?;
    Ok(bytes)
}

pub fn from_slice<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::from_reader(bytes).context("failed to decode CBOR")
}

/// Wraps `value` as `#6.24(bstr .cbor value)`.
pub fn tag24(value: &Cbor) -> Result<Cbor> {
    Ok(Cbor::Tag(TAG_ENCODED_CBOR, Box::new(Cbor::Bytes(to_vec(value)?))))
}

/// Unwraps `#6.24(bstr)` and decodes the embedded item.
pub fn untag24(value: &Cbor) -> Result<Cbor> {
    match value {
        Cbor::Tag(TAG_ENCODED_CBOR, inner) => match inner.as_ref() {
            Cbor::Bytes(bytes) => from_slice(bytes),
            other => bail!("tag 24 does not wrap a byte string: {other:?}"),
        },
        other => bail!("expected a tag 24 item, found {other:?}"),
    }
}

/// Text-keyed lookup in a CBOR map.
pub fn map_get<'a>(map: &'a [(Cbor, Cbor)], key: &str) -> Option<&'a Cbor> {
    map.iter()
        .find(|(k, _)| k.as_text() == Some(key))
        .map(|(_, v)| v)
}

pub fn as_map<'a>(value: &'a Cbor, what: &str) -> Result<&'a [(Cbor, Cbor)]> {
    value
        .as_map()
        .map(Vec::as_slice)
        .with_context(|| format!("'{what}' is not a map"))
}

pub fn as_array<'a>(value: &'a Cbor, what: &str) -> Result<&'a [Cbor]> {
    value
        .as_array()
        .map(Vec::as_slice)
        .with_context(|| format!("'{what}' is not an array"))
}

pub fn required<'a>(map: &'a [(Cbor, Cbor)], key: &str) -> Result<&'a Cbor> {
    map_get(map, key).with_context(|| format!("'{key}' is missing"))
}

pub fn required_text<'a>(map: &'a [(Cbor, Cbor)], key: &str) -> Result<&'a str> {
    required(map, key)?
        .as_text()
        .with_context(|| format!("'{key}' is not a text string"))
}

pub fn required_bytes<'a>(map: &'a [(Cbor, Cbor)], key: &str) -> Result<&'a [u8]> {
    required(map, key)?
        .as_bytes()
        .map(Vec::as_slice)
        .with_context(|| format!("'{key}' is not a byte string"))
}

pub fn required_int(map: &[(Cbor, Cbor)], key: &str) -> Result<i128> {
    required(map, key)?
        .as_integer()
        .map(i128::from)
        .with_context(|| format!("'{key}' is not an integer"))
}

pub fn optional_text(map: &[(Cbor, Cbor)], key: &str) -> Option<String> {
    map_get(map, key).and_then(Cbor::as_text).map(str::to_owned)
}

/// Builds a text-keyed map preserving insertion order.
pub fn text_map<I>(entries: I) -> Cbor
where
    I: IntoIterator<Item = (&'static str, Cbor)>,
{
    Cbor::Map(
        entries
            .into_iter()
            .map(|(k, v)| (Cbor::Text(k.to_owned()), v))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag24_wraps_and_unwraps() {
        let value = text_map([("docType", Cbor::Text("org.iso.18013.5.1.mDL".into()))]);
        let tagged = tag24(&value).unwrap();
        assert!(matches!(tagged, Cbor::Tag(24, _)));
        assert_eq!(untag24(&tagged).unwrap(), value);
    }

    #[test]
    fn untag24_rejects_other_tags() {
        let value = Cbor::Tag(0, Box::new(Cbor::Bytes(vec![0xa0])));
        assert!(untag24(&value).is_err());
    }

    #[test]
    fn typed_lookups() {
        let value = text_map([
            ("version", Cbor::Text("1.0".into())),
            ("status", Cbor::Integer(0.into())),
            ("random", Cbor::Bytes(vec![1, 2, 3])),
        ]);
        let map = as_map(&value, "root").unwrap();
        assert_eq!(required_text(map, "version").unwrap(), "1.0");
        assert_eq!(required_int(map, "status").unwrap(), 0);
        assert_eq!(required_bytes(map, "random").unwrap(), &[1, 2, 3]);
        assert!(required_text(map, "status").is_err());
        assert!(required(map, "missing").is_err());
    }
}
