use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::{TrustManager, TrustPoint, TrustResult};

/// Consults several [TrustManager]s in turn.
///
/// VICAL backed managers go first, the others keep the order they were given in.
/// The first trusting verdict wins.
pub struct CompositeTrustManager {
    identifier: String,
    managers: Vec<Arc<dyn TrustManager>>,
}

impl CompositeTrustManager {
    pub fn new(identifier: impl Into<String>, mut managers: Vec<Arc<dyn TrustManager>>) -> Self {
        managers.sort_by_key(|manager| !manager.is_vical_backed());
        Self {
            identifier: identifier.into(),
            managers,
        }
    }

    pub fn managers(&self) -> &[Arc<dyn TrustManager>] {
        &self.managers
    }

    fn combine(&self, results: Vec<TrustResult>) -> TrustResult {
        let mut fallback = None;
        for result in results {
            if result.is_trusted {
                return result;
            }
            if fallback.is_none() && result.trust_chain.is_some() {
                fallback = Some(result);
            }
        }
        fallback.unwrap_or_else(|| {
            TrustResult::untrusted(anyhow::anyhow!(
                "no trust manager of '{}' trusts the requester",
                self.identifier
            ))
        })
    }
}

#[async_trait]
impl TrustManager for CompositeTrustManager {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn is_vical_backed(&self) -> bool {
        self.managers.iter().any(|manager| manager.is_vical_backed())
    }

    async fn trust_points(&self) -> Result<Vec<TrustPoint>> {
        let mut trust_points = vec![];
        for manager in &self.managers {
            trust_points.extend(manager.trust_points().await?);
        }
        Ok(trust_points)
    }

    async fn verify(&self, chain: &[Vec<u8>], at: DateTime<Utc>) -> Result<TrustResult> {
        let mut results = vec![];
        for manager in &self.managers {
            let result = manager.verify(chain, at).await?;
            debug!(manager = manager.identifier(), trusted = result.is_trusted, "chain verdict");
            let trusted = result.is_trusted;
            results.push(result);
            if trusted {
                break;
            }
        }
        Ok(self.combine(results))
    }

    async fn verify_origin(&self, origin: &str) -> Result<TrustResult> {
        let mut results = vec![];
        for manager in &self.managers {
            let result = manager.verify_origin(origin).await?;
            let trusted = result.is_trusted;
            results.push(result);
            if trusted {
                break;
            }
        }
        Ok(self.combine(results))
    }
}
