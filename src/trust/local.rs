//! A trust manager persisting its entries in a [StorageTable].

use std::{collections::BTreeMap, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use url::Url;
use x509_cert::Certificate;

use super::{
    chain::{parse_certificate, subject_key_identifier, TrustChainValidator},
    entry::{TrustEntry, TrustEntryKind},
    storage::{StorageError, StorageTable},
    vical::{Vical, VicalTrustManager},
    TrustError, TrustManager, TrustMetadata, TrustPoint, TrustResult,
};
use crate::config::TrustStoreConfig;

struct StoredVical {
    entry_id: String,
    signature: Vec<u8>,
    manager: VicalTrustManager,
}

/// In-memory view of the table, rebuilt once and then kept in step with it.
#[derive(Default)]
struct Indices {
    entries: Vec<TrustEntry>,
    /// Keyed by hex SKI.
    certificates: BTreeMap<String, TrustPoint>,
    origins: BTreeMap<String, TrustPoint>,
    vicals: Vec<StoredVical>,
}

impl Indices {
    fn add(&mut self, identifier: &str, entry: TrustEntry) -> Result<(), TrustError> {
        match &entry.kind {
            TrustEntryKind::X509 { ski, certificate } => {
                let certificate =
                    parse_certificate(certificate).map_err(|e| TrustError::decoding("certificate", e))?;
                self.certificates.insert(
                    ski.clone(),
                    TrustPoint::X509 {
                        certificate,
                        ski: ski.clone(),
                        metadata: entry.metadata.clone(),
                        trust_manager_id: identifier.to_string(),
                    },
                );
            }
            TrustEntryKind::Vical {
                encoded_signed_vical,
                ..
            } => {
                let vical = Vical::parse(encoded_signed_vical)
                    .map_err(|e| TrustError::decoding("VICAL", format!("{e:#}")))?;
                self.vicals.push(StoredVical {
                    entry_id: entry.id.clone(),
                    signature: vical.signature().to_vec(),
                    manager: VicalTrustManager::new(identifier, &vical, &entry.metadata),
                });
            }
            TrustEntryKind::Origin { origin } => {
                self.origins.insert(
                    origin.clone(),
                    TrustPoint::Origin {
                        origin: origin.clone(),
                        metadata: entry.metadata.clone(),
                        trust_manager_id: identifier.to_string(),
                    },
                );
            }
        }
        self.entries.push(entry);
        Ok(())
    }

    fn remove(&mut self, entry: &TrustEntry) {
        self.entries.retain(|e| e.id != entry.id);
        match &entry.kind {
            TrustEntryKind::X509 { ski, .. } => {
                self.certificates.remove(ski);
            }
            TrustEntryKind::Vical { .. } => self.vicals.retain(|v| v.entry_id != entry.id),
            TrustEntryKind::Origin { origin } => {
                self.origins.remove(origin);
            }
        }
    }

    fn position(&self, entry: &TrustEntry) -> Option<usize> {
        self.entries.iter().position(|e| e == entry)
    }
}

enum InitState {
    Uninitialized,
    /// A load started but did not finish, e.g. because its future was dropped.
    Initializing,
    Ready(Indices),
}

/// Trust points added at runtime and persisted across sessions.
///
/// Entries are loaded lazily on first use. One mutex guards both the load and
/// every mutation, so concurrent adds of the same certificate cannot both win.
pub struct LocalTrustManager {
    config: TrustStoreConfig,
    storage: Arc<dyn StorageTable>,
    state: Mutex<InitState>,
}

fn normalize_origin(origin: &str) -> Result<String, TrustError> {
    let url = Url::parse(origin)
        .map_err(|e| TrustError::InvalidArgument(format!("'{origin}' is not a URL: {e}")))?;
    let origin = url.origin();
    if !origin.is_tuple() {
        return Err(TrustError::InvalidArgument(format!(
            "'{url}' does not have a tuple origin"
        )));
    }
    Ok(origin.ascii_serialization())
}

fn already_exists(err: StorageError) -> TrustError {
    match err {
        StorageError::KeyExists(key) => TrustError::AlreadyExists(key),
        other => other.into(),
    }
}

impl LocalTrustManager {
    /// Fails if `storage` is not the table named in `config`.
    pub fn new(config: TrustStoreConfig, storage: Arc<dyn StorageTable>) -> Result<Self, TrustError> {
        if storage.name() != config.table_name {
            return Err(TrustError::InvalidArgument(format!(
                "trust store '{}' expects table '{}', got '{}'",
                config.identifier,
                config.table_name,
                storage.name()
            )));
        }
        Ok(Self {
            config,
            storage,
            state: Mutex::new(InitState::Uninitialized),
        })
    }

    async fn load(&self) -> Result<Indices, TrustError> {
        let rows = self.storage.enumerate(&self.config.partition_id).await?;
        let mut indices = Indices::default();
        for (key, data) in rows {
            let entry = match TrustEntry::from_cbor(&key, &data) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(table = self.storage.name(), key = %key, "skipping unreadable trust entry: {e}");
                    continue;
                }
            };
            if let Err(e) = indices.add(&self.config.identifier, entry) {
                warn!(table = self.storage.name(), key = %key, "skipping invalid trust entry: {e}");
            }
        }

        debug!(
            trust_manager = %self.config.identifier,
            entries = indices.entries.len(),
            "trust store loaded"
        );
        Ok(indices)
    }

    async fn indices(&self) -> Result<MappedMutexGuard<'_, Indices>, TrustError> {
        let mut state = self.state.lock().await;
        if !matches!(*state, InitState::Ready(_)) {
            if matches!(*state, InitState::Initializing) {
                debug!(trust_manager = %self.config.identifier, "retrying interrupted trust store load");
            }
            *state = InitState::Initializing;
            *state = InitState::Ready(self.load().await?);
        }

        MutexGuard::try_map(state, |state| match state {
            InitState::Ready(indices) => Some(indices),
            _ => None,
        })
        .map_err(|_| TrustError::InvalidArgument("trust store is not initialized".into()))
    }

    async fn store(
        &self,
        indices: &mut Indices,
        key: Option<&str>,
        entry: TrustEntry,
    ) -> Result<TrustEntry, TrustError> {
        let id = self
            .storage
            .insert(&self.config.partition_id, key, entry.to_cbor()?)
            .await
            .map_err(already_exists)?;
        let entry = TrustEntry { id, ..entry };
        indices.add(&self.config.identifier, entry.clone())?;

        info!(
            trust_manager = %self.config.identifier,
            id = %entry.id,
            "trust entry added"
        );
        Ok(entry)
    }

    /// Adds a certificate as a trust point. The Subject Key Identifier is the
    /// storage key, so a second certificate with the same SKI is rejected.
    pub async fn add_x509_cert(&self, der: &[u8], metadata: TrustMetadata) -> Result<TrustEntry, TrustError> {
        let certificate = parse_certificate(der).map_err(|e| TrustError::decoding("certificate", e))?;
        let ski = subject_key_identifier(&certificate)
            .map_err(|e| TrustError::decoding("certificate", e))?
            .ok_or(TrustError::MissingSubjectKeyIdentifier)?;

        let mut indices = self.indices().await?;
        if indices.certificates.contains_key(&ski) {
            return Err(TrustError::AlreadyExists(ski));
        }

        let entry = TrustEntry {
            id: ski.clone(),
            time_added: Utc::now(),
            metadata,
            kind: TrustEntryKind::X509 {
                ski: ski.clone(),
                certificate: der.to_vec(),
            },
        };
        self.store(&mut indices, Some(&ski), entry).await
    }

    /// Adds a signed VICAL. Its signature is expected to have been checked by the
    /// caller and is not verified again.
    pub async fn add_vical(&self, encoded_signed_vical: &[u8], metadata: TrustMetadata) -> Result<TrustEntry, TrustError> {
        let vical = Vical::parse(encoded_signed_vical)
            .map_err(|e| TrustError::decoding("VICAL", format!("{e:#}")))?;

        let mut indices = self.indices().await?;
        if let Some(existing) = indices.vicals.iter().find(|v| v.signature == vical.signature()) {
            return Err(TrustError::AlreadyExists(existing.entry_id.clone()));
        }

        let entry = TrustEntry {
            id: String::new(),
            time_added: Utc::now(),
            metadata,
            kind: TrustEntryKind::Vical {
                num_certificates: vical.certificate_infos.len(),
                encoded_signed_vical: encoded_signed_vical.to_vec(),
            },
        };
        self.store(&mut indices, None, entry).await
    }

    /// Trusts a website origin. `origin` may be any URL; only its origin is kept.
    pub async fn add_origin(&self, origin: &str, metadata: TrustMetadata) -> Result<TrustEntry, TrustError> {
        let origin = normalize_origin(origin)?;

        let mut indices = self.indices().await?;
        if indices.origins.contains_key(&origin) {
            return Err(TrustError::AlreadyExists(origin));
        }

        let entry = TrustEntry {
            id: String::new(),
            time_added: Utc::now(),
            metadata,
            kind: TrustEntryKind::Origin { origin },
        };
        self.store(&mut indices, None, entry).await
    }

    /// All entries, oldest first.
    pub async fn entries(&self) -> Result<Vec<TrustEntry>, TrustError> {
        let indices = self.indices().await?;
        let mut entries = indices.entries.clone();
        entries.sort_by_key(|entry| entry.time_added);
        Ok(entries)
    }

    /// Returns `false` if `entry` is not (or no longer) in the store.
    pub async fn delete_entry(&self, entry: &TrustEntry) -> Result<bool, TrustError> {
        let mut indices = self.indices().await?;
        if indices.position(entry).is_none() {
            return Ok(false);
        }

        let deleted = self.storage.delete(&self.config.partition_id, &entry.id).await?;
        indices.remove(entry);
        debug!(trust_manager = %self.config.identifier, id = %entry.id, deleted, "trust entry deleted");
        Ok(deleted)
    }

    /// Replaces the metadata of `entry`. The returned entry keeps the storage key
    /// and gets a new `time_added`.
    pub async fn update_metadata(&self, entry: &TrustEntry, metadata: TrustMetadata) -> Result<TrustEntry, TrustError> {
        let mut indices = self.indices().await?;
        if indices.position(entry).is_none() {
            return Err(TrustError::InvalidArgument(format!(
                "trust entry `{}` is not in the store",
                entry.id
            )));
        }

        let updated = TrustEntry {
            time_added: Utc::now(),
            metadata,
            ..entry.clone()
        };
        self.storage
            .update(&self.config.partition_id, &entry.id, updated.to_cbor()?)
            .await?;

        indices.remove(entry);
        indices.add(&self.config.identifier, updated.clone())?;
        Ok(updated)
    }
}

#[async_trait]
impl TrustManager for LocalTrustManager {
    fn identifier(&self) -> &str {
        &self.config.identifier
    }

    async fn trust_points(&self) -> Result<Vec<TrustPoint>> {
        let indices = self.indices().await?;
        Ok(indices
            .vicals
            .iter()
            .flat_map(|v| v.manager.all_trust_points())
            .chain(indices.certificates.values())
            .chain(indices.origins.values())
            .cloned()
            .collect())
    }

    async fn verify(&self, chain: &[Vec<u8>], at: DateTime<Utc>) -> Result<TrustResult> {
        let chain = chain
            .iter()
            .map(|der| parse_certificate(der))
            .collect::<Result<Vec<Certificate>>>()?;
        let indices = self.indices().await?;

        let mut fallback = None;
        for stored in &indices.vicals {
            let result = stored.manager.verify_certificates(&chain, at);
            if result.is_trusted {
                return Ok(result);
            }
            if fallback.is_none() && result.trust_chain.is_some() {
                fallback = Some(result);
            }
        }

        let result = TrustChainValidator::new(&indices.certificates).verify(&chain, at);
        if result.is_trusted || result.trust_chain.is_some() {
            return Ok(result);
        }
        Ok(fallback.unwrap_or(result))
    }

    async fn verify_origin(&self, origin: &str) -> Result<TrustResult> {
        let origin = normalize_origin(origin)?;
        let indices = self.indices().await?;
        Ok(match indices.origins.get(&origin) {
            Some(trust_point) => TrustResult::trusted(vec![], vec![trust_point.clone()]),
            None => TrustResult::untrusted(anyhow::anyhow!("origin '{origin}' is not trusted")),
        })
    }
}
