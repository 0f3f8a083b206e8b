use std::collections::BTreeMap;

use anyhow::{Context, Result};
use ciborium::Value as Cbor;
use coset::{AsCborValue, CoseSign1};

use crate::core::cbor;

const COSE_SIGN1_TAG: u64 = 18;

/// One `IssuerSignedItemBytes` entry, kept exactly as the issuer encoded it.
#[derive(Debug, Clone, PartialEq)]
pub struct IssuerSignedItem {
    pub element_identifier: String,
    tagged: Cbor,
}

impl IssuerSignedItem {
    fn from_cbor(tagged: &Cbor) -> Result<Self> {
        let item = cbor::untag24(tagged)?;
        let map = cbor::as_map(&item, "IssuerSignedItem")?;
        Ok(Self {
            element_identifier: cbor::required_text(map, "elementIdentifier")?.to_string(),
            tagged: tagged.clone(),
        })
    }

    pub fn element_value(&self) -> Result<Cbor> {
        let item = cbor::untag24(&self.tagged)?;
        let map = cbor::as_map(&item, "IssuerSignedItem")?;
        cbor::required(map, "elementValue").cloned()
    }
}

/// The issuer-provided half of an mdoc credential.
#[derive(Debug, Clone, PartialEq)]
pub struct IssuerSigned {
    name_spaces: Vec<(String, Vec<IssuerSignedItem>)>,
    issuer_auth: Cbor,
}

impl IssuerSigned {
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let value: Cbor = cbor::from_slice(bytes).context("IssuerSigned was not valid CBOR")?;
        Self::from_cbor(&value)
    }

    pub fn from_cbor(value: &Cbor) -> Result<Self> {
        let map = cbor::as_map(value, "IssuerSigned")?;

        let name_spaces = match cbor::map_get(map, "nameSpaces") {
            None => vec![],
            Some(name_spaces) => cbor::as_map(name_spaces, "nameSpaces")?
                .iter()
                .map(|(namespace, items)| {
                    let namespace = namespace
                        .as_text()
                        .context("namespace key is not a text string")?;
                    let items = cbor::as_array(items, namespace)?
                        .iter()
                        .map(IssuerSignedItem::from_cbor)
                        .collect::<Result<Vec<_>>>()
                        .with_context(|| format!("invalid item in namespace '{namespace}'"))?;
                    Ok((namespace.to_string(), items))
                })
                .collect::<Result<Vec<_>>>()?,
        };

        Ok(Self {
            name_spaces,
            issuer_auth: cbor::required(map, "issuerAuth")?.clone(),
        })
    }

    pub fn to_cbor(&self) -> Cbor {
        let name_spaces = self
            .name_spaces
            .iter()
            .map(|(namespace, items)| {
                (
                    Cbor::Text(namespace.clone()),
                    Cbor::Array(items.iter().map(|item| item.tagged.clone()).collect()),
                )
            })
            .collect();

        cbor::text_map([
            ("nameSpaces", Cbor::Map(name_spaces)),
            ("issuerAuth", self.issuer_auth.clone()),
        ])
    }

    pub fn name_spaces(&self) -> impl Iterator<Item = (&str, &[IssuerSignedItem])> {
        self.name_spaces
            .iter()
            .map(|(namespace, items)| (namespace.as_str(), items.as_slice()))
    }

    pub fn contains(&self, namespace: &str, element_identifier: &str) -> bool {
        self.name_spaces
            .iter()
            .filter(|(ns, _)| ns == namespace)
            .flat_map(|(_, items)| items)
            .any(|item| item.element_identifier == element_identifier)
    }

    /// Keeps exactly the requested `(namespace, element)` pairs.
    ///
    /// Output order follows the stored data, so duplicates or reordering in
    /// `requested` do not change the result. Requested elements the issuer never
    /// provided are skipped, and namespaces left empty are dropped.
    pub fn filter(&self, requested: &BTreeMap<String, BTreeMap<String, bool>>) -> IssuerSigned {
        let name_spaces = self
            .name_spaces
            .iter()
            .filter_map(|(namespace, items)| {
                let wanted = requested.get(namespace)?;
                let items: Vec<_> = items
                    .iter()
                    .filter(|item| wanted.contains_key(&item.element_identifier))
                    .cloned()
                    .collect();
                (!items.is_empty()).then(|| (namespace.clone(), items))
            })
            .collect();

        IssuerSigned {
            name_spaces,
            issuer_auth: self.issuer_auth.clone(),
        }
    }

    pub fn issuer_auth(&self) -> &Cbor {
        &self.issuer_auth
    }

    /// Decodes the `MobileSecurityObject` carried as the payload of `issuerAuth`.
    pub fn mobile_security_object(&self) -> Result<Cbor> {
        let untagged = match &self.issuer_auth {
            Cbor::Tag(COSE_SIGN1_TAG, inner) => inner.as_ref().clone(),
            other => other.clone(),
        };
        let issuer_auth = CoseSign1::from_cbor_value(untagged)
            .map_err(|e| anyhow::anyhow!("{e:?}"))
            .context("issuerAuth is not a COSE_Sign1")?;
        let payload = issuer_auth
            .payload
            .context("issuerAuth has no payload")?;
        let tagged: Cbor = cbor::from_slice(&payload).context("MSO payload was not valid CBOR")?;
        cbor::untag24(&tagged).context("MSO payload is not MobileSecurityObjectBytes")
    }

    pub fn doc_type(&self) -> Result<String> {
        let mso = self.mobile_security_object()?;
        let map = cbor::as_map(&mso, "MobileSecurityObject")?;
        Ok(cbor::required_text(map, "docType")?.to_string())
    }
}
