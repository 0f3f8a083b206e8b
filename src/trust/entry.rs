//! Persisted rows of a [LocalTrustManager](super::LocalTrustManager).

use chrono::{DateTime, TimeZone, Utc};
use ciborium::Value as Cbor;

use super::{TrustError, TrustMetadata};
use crate::core::cbor;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustEntryKind {
    X509 {
        /// Hex encoded Subject Key Identifier, also the storage key.
        ski: String,
        certificate: Vec<u8>,
    },
    Vical {
        num_certificates: usize,
        encoded_signed_vical: Vec<u8>,
    },
    Origin {
        origin: String,
    },
}

/// A stored trust entry.
///
/// `id` is the storage key: the SKI for X.509 entries, a generated id otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustEntry {
    pub id: String,
    pub time_added: DateTime<Utc>,
    pub metadata: TrustMetadata,
    pub kind: TrustEntryKind,
}

fn metadata_to_cbor(metadata: &TrustMetadata) -> Cbor {
    let mut entries = vec![];
    if let Some(name) = &metadata.display_name {
        entries.push(("displayName", Cbor::Text(name.clone())));
    }
    if let Some(icon) = &metadata.display_icon {
        entries.push(("displayIcon", Cbor::Bytes(icon.clone())));
    }
    if let Some(url) = &metadata.privacy_policy_url {
        entries.push(("privacyPolicyUrl", Cbor::Text(url.clone())));
    }
    if let Some(disclaimer) = &metadata.disclaimer {
        entries.push(("disclaimer", Cbor::Text(disclaimer.clone())));
    }
    entries.push(("testOnly", Cbor::Bool(metadata.test_only)));
    cbor::text_map(entries)
}

fn metadata_from_cbor(value: &Cbor) -> anyhow::Result<TrustMetadata> {
    let map = cbor::as_map(value, "metadata")?;
    Ok(TrustMetadata {
        display_name: cbor::optional_text(map, "displayName"),
        display_icon: cbor::map_get(map, "displayIcon")
            .and_then(Cbor::as_bytes)
            .cloned(),
        privacy_policy_url: cbor::optional_text(map, "privacyPolicyUrl"),
        disclaimer: cbor::optional_text(map, "disclaimer"),
        test_only: cbor::map_get(map, "testOnly")
            .and_then(Cbor::as_bool)
            .unwrap_or(false),
    })
}

impl TrustEntry {
    pub fn to_cbor(&self) -> Result<Vec<u8>, TrustError> {
        let (kind, mut fields) = match &self.kind {
            TrustEntryKind::X509 { ski, certificate } => (
                "x509",
                vec![
                    ("ski", Cbor::Text(ski.clone())),
                    ("certificate", Cbor::Bytes(certificate.clone())),
                ],
            ),
            TrustEntryKind::Vical {
                num_certificates,
                encoded_signed_vical,
            } => (
                "vical",
                vec![
                    ("numCertificates", Cbor::Integer((*num_certificates as u64).into())),
                    ("encodedSignedVical", Cbor::Bytes(encoded_signed_vical.clone())),
                ],
            ),
            TrustEntryKind::Origin { origin } => ("origin", vec![("origin", Cbor::Text(origin.clone()))]),
        };

        let mut entries = vec![
            ("type", Cbor::Text(kind.into())),
            ("timeAddedSec", Cbor::Integer(self.time_added.timestamp().into())),
            (
                "timeAddedNSec",
                Cbor::Integer(self.time_added.timestamp_subsec_nanos().into()),
            ),
            ("metadata", metadata_to_cbor(&self.metadata)),
        ];
        entries.append(&mut fields);

        cbor::to_vec(&cbor::text_map(entries)).map_err(|e| TrustError::decoding("trust entry", e))
    }

    /// Decodes a row stored under `id`.
    pub fn from_cbor(id: &str, bytes: &[u8]) -> Result<Self, TrustError> {
        Self::decode(id, bytes).map_err(|e| TrustError::decoding("trust entry", format!("{e:#}")))
    }

    fn decode(id: &str, bytes: &[u8]) -> anyhow::Result<Self> {
        let value: Cbor = cbor::from_slice(bytes)?;
        let map = cbor::as_map(&value, "trust entry")?;

        let seconds = i64::try_from(cbor::required_int(map, "timeAddedSec")?)?;
        let nanos = u32::try_from(cbor::required_int(map, "timeAddedNSec")?)?;
        let time_added = Utc
            .timestamp_opt(seconds, nanos)
            .single()
            .ok_or_else(|| anyhow::anyhow!("timeAdded is out of range"))?;

        let kind = match cbor::required_text(map, "type")? {
            "x509" => {
                let ski = cbor::required_text(map, "ski")?;
                if ski != id {
                    anyhow::bail!("row under '{id}' holds the certificate with SKI '{ski}'");
                }
                TrustEntryKind::X509 {
                    ski: ski.to_string(),
                    certificate: cbor::required_bytes(map, "certificate")?.to_vec(),
                }
            }
            "vical" => TrustEntryKind::Vical {
                num_certificates: usize::try_from(cbor::required_int(map, "numCertificates")?)?,
                encoded_signed_vical: cbor::required_bytes(map, "encodedSignedVical")?.to_vec(),
            },
            "origin" => TrustEntryKind::Origin {
                origin: cbor::required_text(map, "origin")?.to_string(),
            },
            other => anyhow::bail!("unknown trust entry type '{other}'"),
        };

        Ok(Self {
            id: id.to_string(),
            time_added,
            metadata: metadata_from_cbor(cbor::required(map, "metadata")?)?,
            kind,
        })
    }
}
