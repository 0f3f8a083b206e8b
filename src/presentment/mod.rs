//! Presentation of credentials over the supported request protocols.
//!
//! The transport hands a [PresentmentMechanism] (raw request plus caller
//! metadata) to [Presentment::present]. The matching protocol adapter parses the
//! request into a [ClaimRequest], computes the session transcript, selects a
//! credential, asks for consent, and sends back an encrypted response.

use std::{fmt, str::FromStr, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
    config::PresentmentConfig,
    core::{
        claim_request::{ClaimRequest, Requester, ResolvedClaim},
        util::AsyncHttpClient,
    },
    credential::{Credential, CredentialSource},
    secure_area::{KeyInfo, KeyUnlockData},
    trust::TrustPoint,
};

pub mod assembler;
pub mod error;
mod flow;
mod iso_mdoc;
pub mod model;
mod openid4vp;
mod preview;
pub mod selector;

pub use error::PresentmentError;
pub use model::{AbortReason, Outcome, PresentmentModel, Status};

use flow::{FlowContext, FlowOutcome};

/// The request protocols this crate answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolKind {
    /// The legacy Android "preview" protocol.
    Preview,
    OpenId4Vp,
    /// Austroads request forwarding, version 2.
    Arf,
    /// ISO/IEC 18013-7 Annex C.
    MdocApi,
}

impl ProtocolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolKind::Preview => "preview",
            ProtocolKind::OpenId4Vp => "openid4vp",
            ProtocolKind::Arf => "austroads-request-forwarding-v2",
            ProtocolKind::MdocApi => "org.iso.mdoc",
        }
    }

    fn adapter(&self) -> &'static dyn ProtocolAdapter {
        match self {
            ProtocolKind::Preview => &preview::PreviewAdapter,
            ProtocolKind::OpenId4Vp => &openid4vp::OpenId4VpAdapter,
            ProtocolKind::Arf => &iso_mdoc::ARF,
            ProtocolKind::MdocApi => &iso_mdoc::MDOC_API,
        }
    }
}

impl FromStr for ProtocolKind {
    type Err = PresentmentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            ProtocolKind::Preview,
            ProtocolKind::OpenId4Vp,
            ProtocolKind::Arf,
            ProtocolKind::MdocApi,
        ]
        .into_iter()
        .find(|kind| kind.as_str() == s)
        .ok_or_else(|| PresentmentError::UnsupportedProtocol(s.to_string()))
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The transport a request arrived over.
#[async_trait]
pub trait PresentmentMechanism: Send + Sync {
    /// Protocol identifier, e.g. "openid4vp".
    fn protocol(&self) -> &str;

    /// The raw request, JSON encoded.
    fn request(&self) -> &str;

    /// Origin of the calling website, if the caller is a website.
    fn web_origin(&self) -> Option<&str>;

    /// Package name or app id of the calling application.
    fn app_id(&self) -> &str;

    /// A document the user already picked in a platform credential picker.
    fn document(&self) -> Option<&Credential>;

    /// Delivers the JSON encoded response.
    async fn send_response(&self, response: String) -> Result<()>;
}

/// What the user is asked to agree to.
#[derive(Debug, Clone)]
pub struct ConsentRequest {
    pub credential: Credential,
    pub claims: Vec<ResolvedClaim>,
    pub requester: Requester,
    /// `None` if no trust manager vouches for the requester.
    pub trust_point: Option<TrustPoint>,
}

/// User interaction during a presentation.
#[async_trait]
pub trait PresentmentPrompt: Send + Sync {
    /// Returns `false` if the user declined.
    async fn request_consent(&self, request: &ConsentRequest) -> Result<bool>;

    /// Collects unlock data for a locked key. `None` means the user cancelled.
    async fn unlock_key(&self, key: &KeyInfo) -> Result<Option<KeyUnlockData>>;
}

#[async_trait]
trait ProtocolAdapter: Send + Sync {
    async fn handle(&self, flow: &FlowContext<'_>) -> Result<FlowOutcome>;
}

/// Entry point for presentations.
pub struct Presentment {
    config: PresentmentConfig,
    http_client: Arc<dyn AsyncHttpClient>,
}

impl Presentment {
    pub fn new(config: PresentmentConfig, http_client: Arc<dyn AsyncHttpClient>) -> Self {
        Self {
            config,
            http_client,
        }
    }

    pub fn config(&self) -> &PresentmentConfig {
        &self.config
    }

    /// Runs one presentation to completion.
    ///
    /// Never fails: every outcome, errors included, is returned and also
    /// published as [Status::Completed] on `model`. Firing `cancel` ends the
    /// session as [AbortReason::Cancelled] without a response.
    pub async fn present(
        &self,
        model: &PresentmentModel,
        mechanism: &dyn PresentmentMechanism,
        source: &dyn CredentialSource,
        prompt: &dyn PresentmentPrompt,
        cancel: &CancellationToken,
    ) -> Outcome {
        model.set_dismissible(false);
        model.set_processing();

        let protocol = mechanism.protocol().to_string();
        if self.config.event_logging {
            info!(%protocol, app_id = mechanism.app_id(), origin = ?mechanism.web_origin(), "presentment request received");
        }

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(%protocol, "presentment cancelled");
                Outcome::Aborted(AbortReason::Cancelled)
            }
            result = self.dispatch(mechanism, source, prompt) => match result {
                Ok(FlowOutcome::Sent) => Outcome::Success,
                Ok(FlowOutcome::NoMatchingCredential) => Outcome::Aborted(AbortReason::NoMatchingCredential),
                Ok(FlowOutcome::ConsentDeclined) => Outcome::Aborted(AbortReason::ConsentDeclined),
                Err(err) => match PresentmentError::abort_reason(&err) {
                    Some(reason) => {
                        info!(%protocol, ?reason, "presentment cancelled by the user");
                        Outcome::Aborted(reason)
                    }
                    None => {
                        error!(%protocol, "presentment failed: {err:#}");
                        Outcome::Error(Arc::new(err))
                    }
                },
            },
        };

        model.complete(outcome.clone());
        outcome
    }

    async fn dispatch(
        &self,
        mechanism: &dyn PresentmentMechanism,
        source: &dyn CredentialSource,
        prompt: &dyn PresentmentPrompt,
    ) -> Result<FlowOutcome> {
        let protocol: ProtocolKind = mechanism.protocol().parse()?;
        let flow = FlowContext {
            protocol,
            config: &self.config,
            http_client: self.http_client.as_ref(),
            mechanism,
            source,
            prompt,
        };
        protocol.adapter().handle(&flow).await
    }
}
