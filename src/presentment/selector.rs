use anyhow::Result;
use tracing::{debug, warn};

use super::error::PresentmentError;
use crate::{
    core::claim_request::{ClaimRequest, RequestedClaim},
    credential::{Credential, CredentialSource},
};

/// Asks `source` for credentials matching `request` and keeps exactly one.
///
/// Claims are resolved against no credential at this point. Zero matches yield
/// `None`; several matches keep the first in the source's order.
pub async fn select_credential(
    source: &dyn CredentialSource,
    request: &ClaimRequest,
    pre_selected: Option<&Credential>,
) -> Result<Option<Credential>> {
    let placeholder = request.resolve(None::<fn(&RequestedClaim) -> bool>);
    debug!(
        doc_type = %request.doc_type,
        claims = placeholder.len(),
        pre_selected = ?pre_selected.map(|c| &c.id),
        "selecting credential"
    );

    let mut matches = source
        .select_credential_for_presentment(request, pre_selected)
        .await
        .map_err(|e| PresentmentError::CredentialSource(format!("{e:#}")))?;

    match matches.len() {
        0 => {
            debug!(doc_type = %request.doc_type, "no credential matches the request");
            Ok(None)
        }
        1 => Ok(matches.pop()),
        n => {
            warn!(
                doc_type = %request.doc_type,
                matches = n,
                "expected exactly one matching credential, using the first"
            );
            Ok(Some(matches.swap_remove(0)))
        }
    }
}
