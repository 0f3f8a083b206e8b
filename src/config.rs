use serde::Deserialize;

/// Content encryption algorithms accepted for `dc_api.jwt` responses.
pub const DEFAULT_JWE_ENC: [&str; 3] = ["A128GCM", "A192GCM", "A256GCM"];

/// Behaviour switches for [Presentment](crate::presentment::Presentment).
///
/// Passed explicitly to the dispatcher rather than read from process-wide state.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct PresentmentConfig {
    /// Emit `info` level lifecycle events (request received, credential selected,
    /// response sent) in addition to the usual diagnostics.
    pub event_logging: bool,
    /// JWE `enc` values the wallet is willing to produce.
    pub supported_jwe_enc: Vec<String>,
    /// Abort instead of falling back to the web origin when an mdoc `readerAuth`
    /// signature does not verify.
    pub require_reader_auth_verification: bool,
}

impl Default for PresentmentConfig {
    fn default() -> Self {
        Self {
            event_logging: false,
            supported_jwe_enc: DEFAULT_JWE_ENC.iter().map(|s| s.to_string()).collect(),
            require_reader_auth_verification: false,
        }
    }
}

/// Location of a [LocalTrustManager](crate::trust::local::LocalTrustManager)'s entries.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TrustStoreConfig {
    /// Identifier reported on every trust point owned by the manager.
    pub identifier: String,
    /// Name of the storage table, usually the logical role (e.g. "issuers", "readers").
    /// The table handed to the manager must report this name.
    pub table_name: String,
    /// Partition within the table.
    #[serde(default)]
    pub partition_id: String,
}

impl TrustStoreConfig {
    pub fn new(identifier: impl Into<String>, table_name: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            table_name: table_name.into(),
            partition_id: String::new(),
        }
    }

    pub fn with_partition(mut self, partition_id: impl Into<String>) -> Self {
        self.partition_id = partition_id.into();
        self
    }
}
