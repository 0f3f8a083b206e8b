//! Steps shared by every protocol adapter.

use anyhow::{Context, Result};
use serde_json::Value as Json;
use tracing::{debug, info, warn};

use super::{
    assembler, error::PresentmentError, selector, ConsentRequest, PresentmentMechanism,
    PresentmentPrompt, ProtocolKind,
};
use crate::{
    config::PresentmentConfig,
    core::{claim_request::ClaimRequest, util::AsyncHttpClient},
    credential::{Credential, CredentialSource},
};

/// How an adapter finished, short of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum FlowOutcome {
    Sent,
    NoMatchingCredential,
    ConsentDeclined,
}

pub(super) struct FlowContext<'a> {
    pub protocol: ProtocolKind,
    pub config: &'a PresentmentConfig,
    pub http_client: &'a dyn AsyncHttpClient,
    pub mechanism: &'a dyn PresentmentMechanism,
    pub source: &'a dyn CredentialSource,
    pub prompt: &'a dyn PresentmentPrompt,
}

impl FlowContext<'_> {
    /// Lifecycle event, logged only when enabled in the configuration.
    pub fn event(&self, message: &str) {
        if self.config.event_logging {
            info!(protocol = %self.protocol, "{message}");
        }
    }

    /// The caller's web origin, which the protocol requires.
    pub fn required_origin(&self) -> Result<&str> {
        self.mechanism
            .web_origin()
            .ok_or_else(|| PresentmentError::invalid_request(format!("{} requests need a web origin", self.protocol)))
    }

    pub async fn select(&self, request: &ClaimRequest) -> Result<Option<Credential>> {
        let credential = selector::select_credential(self.source, request, self.mechanism.document()).await?;
        if let Some(credential) = &credential {
            self.event(&format!("credential '{}' selected", credential.id));
        }
        Ok(credential)
    }

    /// Resolves the request against `credential`, looks up the requester's trust
    /// point and asks for consent when the source wants it.
    pub async fn consent(&self, credential: &Credential, request: &ClaimRequest) -> Result<bool> {
        let claims = request.resolve(Some(credential.claim_availability()?));

        // Trust is advisory; a failing lookup only means an unknown requester.
        let trust_point = match self.source.find_trust_point(request).await {
            Ok(trust_point) => trust_point,
            Err(e) => {
                warn!(protocol = %self.protocol, "trust point lookup failed: {e:#}");
                None
            }
        };
        debug!(
            protocol = %self.protocol,
            requester = ?request.requester,
            trusted = trust_point.is_some(),
            "requester resolved"
        );

        let show_prompt = self
            .source
            .should_show_consent_prompt(credential, request)
            .await
            .map_err(|e| PresentmentError::CredentialSource(format!("{e:#}")))?;
        if !show_prompt {
            return Ok(true);
        }

        self.prompt
            .request_consent(&ConsentRequest {
                credential: credential.clone(),
                claims,
                requester: request.requester.clone(),
                trust_point,
            })
            .await
            .context("consent prompt failed")
    }

    pub async fn sign(&self, credential: &Credential, data: &[u8]) -> Result<Vec<u8>> {
        assembler::sign_with_key(self.prompt, &credential.key, data).await
    }

    /// Sends `response` and records the presentation on `credential`.
    pub async fn send(&self, credential: &Credential, response: Json) -> Result<FlowOutcome> {
        self.mechanism
            .send_response(response.to_string())
            .await
            .map_err(|e| PresentmentError::Transport(format!("{e:#}")))?;

        credential.increase_usage_count();
        self.event(&format!("response sent for credential '{}'", credential.id));
        Ok(FlowOutcome::Sent)
    }
}
