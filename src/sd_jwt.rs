//! SD-JWT VC presentations: selective disclosure and key binding.

use std::collections::{BTreeSet, HashMap};

use anyhow::{bail, Context, Result};
use base64::prelude::*;
use serde_json::{json, Map, Value as Json};
use sha2::{Digest, Sha256};

use crate::utils::decode_base64url;

/// Claims of the issuer JWT that describe the token rather than the subject.
const RESERVED_CLAIMS: [&str; 9] = [
    "iss", "iat", "nbf", "exp", "cnf", "vct", "status", "_sd", "_sd_alg",
];

/// Key for a disclosed array element, `{"...": <digest>}`.
const ARRAY_DIGEST_KEY: &str = "...";

/// One step of a claim path, as used in DCQL queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimPathElement {
    Name(String),
    Index(usize),
    /// Every element of an array.
    All,
}

impl ClaimPathElement {
    /// Reads a DCQL path element: a string, a non-negative integer or `null`.
    pub fn from_json(value: &Json) -> Option<Self> {
        match value {
            Json::String(name) => Some(Self::Name(name.clone())),
            Json::Number(n) => n.as_u64().and_then(|i| usize::try_from(i).ok()).map(Self::Index),
            Json::Null => Some(Self::All),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disclosure {
    encoded: String,
    /// `None` for array element disclosures.
    pub name: Option<String>,
    pub value: Json,
}

impl Disclosure {
    fn parse(encoded: &str) -> Result<Self> {
        let bytes = decode_base64url(encoded, "disclosure")?;
        let Json::Array(parts) = serde_json::from_slice(&bytes).context("disclosure was not valid json")?
        else {
            bail!("disclosure is not a JSON array");
        };

        let (name, value) = match parts.as_slice() {
            [_salt, Json::String(name), value] => (Some(name.clone()), value.clone()),
            [_salt, value] => (None, value.clone()),
            _ => bail!("disclosure must have two or three elements"),
        };

        Ok(Self {
            encoded: encoded.to_string(),
            name,
            value,
        })
    }

    /// The digest an issuer embeds to refer to this disclosure.
    fn digest(&self) -> String {
        BASE64_URL_SAFE_NO_PAD.encode(Sha256::digest(self.encoded.as_bytes()))
    }
}

/// Walks claim paths through the payload, collecting the disclosures that
/// reveal them.
struct Selection<'a> {
    disclosures: &'a [Disclosure],
    by_digest: HashMap<String, usize>,
    selected: BTreeSet<usize>,
}

impl<'a> Selection<'a> {
    fn new(disclosures: &'a [Disclosure]) -> Self {
        Self {
            disclosures,
            by_digest: disclosures
                .iter()
                .enumerate()
                .map(|(index, d)| (d.digest(), index))
                .collect(),
            selected: BTreeSet::new(),
        }
    }

    /// Marks the disclosure behind `digest` and returns its value.
    fn take(&mut self, digest: &Json) -> Option<&'a Json> {
        let index = *self.by_digest.get(digest.as_str()?)?;
        Some(self.mark(index))
    }

    fn mark(&mut self, index: usize) -> &'a Json {
        let disclosures = self.disclosures;
        self.selected.insert(index);
        &disclosures[index].value
    }

    fn named(&mut self, object: &Map<String, Json>, name: &str) -> Option<&'a Json> {
        let digests = object.get("_sd").and_then(Json::as_array)?;
        let index = digests.iter().find_map(|digest| {
            let index = *self.by_digest.get(digest.as_str()?)?;
            (self.disclosures[index].name.as_deref() == Some(name)).then_some(index)
        })?;
        Some(self.mark(index))
    }

    fn select(&mut self, value: &Json, path: &[ClaimPathElement]) {
        let Some((head, rest)) = path.split_first() else {
            self.select_all(value);
            return;
        };

        match (value, head) {
            (Json::Object(object), ClaimPathElement::Name(name)) => {
                if let Some(plain) = object.get(name) {
                    self.select(plain, rest);
                } else if let Some(disclosed) = self.named(object, name) {
                    self.select(disclosed, rest);
                }
            }
            (Json::Array(items), ClaimPathElement::Index(index)) => {
                if let Some(item) = items.get(*index) {
                    self.select_element(item, rest);
                }
            }
            (Json::Array(items), ClaimPathElement::All) => {
                for item in items {
                    self.select_element(item, rest);
                }
            }
            _ => {}
        }
    }

    fn select_element(&mut self, item: &Json, rest: &[ClaimPathElement]) {
        match item.as_object().and_then(|o| o.get(ARRAY_DIGEST_KEY).filter(|_| o.len() == 1)) {
            Some(digest) => {
                if let Some(disclosed) = self.take(digest) {
                    self.select(disclosed, rest);
                }
            }
            None => self.select(item, rest),
        }
    }

    /// Reveals everything below `value`.
    fn select_all(&mut self, value: &Json) {
        match value {
            Json::Object(object) => {
                for (key, nested) in object {
                    if key == "_sd" {
                        for digest in nested.as_array().into_iter().flatten() {
                            if let Some(disclosed) = self.take(digest) {
                                self.select_all(disclosed);
                            }
                        }
                    } else {
                        self.select_all(nested);
                    }
                }
            }
            Json::Array(items) => {
                for item in items {
                    self.select_element(item, &[]);
                }
            }
            _ => {}
        }
    }
}

/// An issued SD-JWT VC: `<issuer-jwt>~<disclosure>~...~`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdJwt {
    issuer_jwt: String,
    claims: Map<String, Json>,
    disclosures: Vec<Disclosure>,
}

impl SdJwt {
    pub fn parse(serialized: &str) -> Result<Self> {
        let mut parts = serialized.split('~');
        let issuer_jwt = parts.next().unwrap_or_default().to_string();

        let payload = issuer_jwt
            .split('.')
            .nth(1)
            .context("issuer JWT is not a compact JWS")?;
        let claims: Map<String, Json> =
            serde_json::from_slice(&decode_base64url(payload, "issuer JWT payload")?)
                .context("issuer JWT payload was not a JSON object")?;
        if let Some(alg) = claims.get("_sd_alg") {
            if alg != "sha-256" {
                bail!("unsupported _sd_alg {alg}");
            }
        }

        let disclosures = parts
            .filter(|part| !part.is_empty())
            .map(Disclosure::parse)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            issuer_jwt,
            claims,
            disclosures,
        })
    }

    pub fn vct(&self) -> Option<&str> {
        self.claims.get("vct").and_then(Json::as_str)
    }

    /// Top-level claim names available for disclosure, selectively disclosable
    /// or not.
    pub fn claim_names(&self) -> BTreeSet<String> {
        let top_level: BTreeSet<&str> = self
            .claims
            .get("_sd")
            .and_then(Json::as_array)
            .into_iter()
            .flatten()
            .filter_map(Json::as_str)
            .collect();

        self.claims
            .keys()
            .filter(|name| !RESERVED_CLAIMS.contains(&name.as_str()))
            .cloned()
            .chain(
                self.disclosures
                    .iter()
                    .filter(|d| top_level.contains(d.digest().as_str()))
                    .filter_map(|d| d.name.clone()),
            )
            .collect()
    }

    /// `<issuer-jwt>~<selected disclosures>~`, ready for a key binding JWT.
    ///
    /// Every disclosure on the way to each path is revealed, and everything
    /// below its end. Disclosures keep their issued order; paths that lead
    /// nowhere are ignored.
    pub fn disclose(&self, paths: &[Vec<ClaimPathElement>]) -> String {
        let mut selection = Selection::new(&self.disclosures);
        let payload = Json::Object(self.claims.clone());
        for path in paths.iter().filter(|path| !path.is_empty()) {
            selection.select(&payload, path);
        }

        selection
            .selected
            .iter()
            .map(|&index| &self.disclosures[index])
            .fold(format!("{}~", self.issuer_jwt), |acc, d| {
                format!("{acc}{}~", d.encoded)
            })
    }
}

fn compute_sd_hash(sd_jwt_without_kb: &str) -> String {
    BASE64_URL_SAFE_NO_PAD.encode(Sha256::digest(sd_jwt_without_kb.as_bytes()))
}

/// An unsigned key binding JWT for a presentation.
#[derive(Debug, Clone)]
pub struct KeyBindingJwt {
    presentation: String,
    signing_input: String,
}

impl KeyBindingJwt {
    pub fn new(presentation: String, nonce: &str, audience: &str, issued_at: i64) -> Self {
        let header = json!({ "alg": "ES256", "typ": "kb+jwt" });
        let payload = json!({
            "nonce": nonce,
            "aud": audience,
            "iat": issued_at,
            "sd_hash": compute_sd_hash(&presentation),
        });

        let signing_input = format!(
            "{}.{}",
            BASE64_URL_SAFE_NO_PAD.encode(header.to_string().as_bytes()),
            BASE64_URL_SAFE_NO_PAD.encode(payload.to_string().as_bytes())
        );

        Self {
            presentation,
            signing_input,
        }
    }

    pub fn signing_input(&self) -> &[u8] {
        self.signing_input.as_bytes()
    }

    /// Appends the signed key binding JWT to the presentation.
    pub fn finish(self, signature: &[u8]) -> String {
        format!(
            "{}{}.{}",
            self.presentation,
            self.signing_input,
            BASE64_URL_SAFE_NO_PAD.encode(signature)
        )
    }
}
