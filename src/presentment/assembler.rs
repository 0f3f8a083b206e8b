use anyhow::{Context, Result};
use ciborium::Value as Cbor;
use tracing::debug;

use super::{error::PresentmentError, PresentmentPrompt};
use crate::{
    core::{claim_request::ClaimRequest, session_transcript::SessionTranscript},
    credential::{Credential, KeyReference},
    mdoc::UnsignedDocument,
    secure_area::SecureAreaError,
};

/// Signs `data` with the credential key, asking the user to unlock it as often
/// as the secure area requires.
///
/// A dismissed unlock prompt ends with [SecureAreaError::UnlockCancelled].
pub async fn sign_with_key(
    prompt: &dyn PresentmentPrompt,
    key: &KeyReference,
    data: &[u8],
) -> Result<Vec<u8>> {
    let key_info = key
        .secure_area
        .key_info(&key.alias)
        .await
        .map_err(|e| PresentmentError::Crypto(e.to_string()))?;
    if !key_info.can_sign() {
        return Err(PresentmentError::PolicyViolation(format!(
            "key '{}' does not have the signing purpose",
            key.alias
        ))
        .into());
    }

    let mut unlock = None;
    loop {
        match key.secure_area.sign(&key.alias, data, unlock.as_ref()).await {
            Ok(signature) => return Ok(signature),
            Err(SecureAreaError::KeyLocked(_)) => {
                debug!(alias = %key.alias, secure_area = key.secure_area.identifier(), "key is locked, prompting");
                match prompt
                    .unlock_key(&key_info)
                    .await
                    .context("key unlock prompt failed")?
                {
                    Some(data) => unlock = Some(data),
                    None => return Err(SecureAreaError::UnlockCancelled(key.alias.clone()).into()),
                }
            }
            Err(e @ SecureAreaError::UnlockCancelled(_)) => return Err(e.into()),
            Err(e) => return Err(PresentmentError::Crypto(e.to_string()).into()),
        }
    }
}

/// Builds the signed `Document` for `credential`, disclosing exactly the
/// requested elements that the issuer data holds.
pub async fn build_document(
    prompt: &dyn PresentmentPrompt,
    credential: &Credential,
    request: &ClaimRequest,
    transcript: &SessionTranscript,
) -> Result<Cbor> {
    let issuer_signed = credential.issuer_signed()?.filter(&request.namespaces());
    let document = UnsignedDocument::new(issuer_signed, transcript)?;

    debug!(
        credential = %credential.id,
        doc_type = document.doc_type(),
        "signing DeviceAuthentication"
    );
    let signature = sign_with_key(prompt, &credential.key, &document.signing_input()).await?;
    document.finish(signature)
}
