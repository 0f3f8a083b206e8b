//! This library implements the holder side of mdoc ([ISO/IEC 18013-5]) and
//! SD-JWT VC presentations over several request protocols, together with the
//! X.509 and VICAL trust machinery needed to identify the requester.
//!
//! [ISO/IEC 18013-5]: <https://www.iso.org/standard/69084.html>
//!
//! # Presentment Usage
//!
//! A transport (NFC, the Digital Credentials API, an app-to-app intent) receives a
//! request and wraps it in a [`PresentmentMechanism`]. The application supplies a
//! [`CredentialSource`] and a [`PresentmentPrompt`], then runs the presentation:
//!
//! ```ignore
//! use std::sync::Arc;
//! use mdoc_presentment::config::PresentmentConfig;
//! use mdoc_presentment::core::util::ReqwestClient;
//! use mdoc_presentment::presentment::{Presentment, PresentmentModel, Outcome};
//! use tokio_util::sync::CancellationToken;
//!
//! let presentment = Presentment::new(PresentmentConfig::default(), Arc::new(ReqwestClient::new()?));
//! let model = PresentmentModel::new();
//! let cancel = CancellationToken::new();
//!
//! match presentment.present(&model, &mechanism, &source, &prompt, &cancel).await {
//!     Outcome::Success => println!("response sent"),
//!     Outcome::Aborted(reason) => println!("nothing sent: {reason:?}"),
//!     Outcome::Error(err) => println!("presentation failed: {err:#}"),
//! }
//! ```
//!
//! [`present`] never returns an error. Every outcome is also published on the
//! [`PresentmentModel`], which UIs can observe.
//!
//! [`PresentmentMechanism`]: crate::presentment::PresentmentMechanism
//! [`CredentialSource`]: crate::credential::CredentialSource
//! [`PresentmentPrompt`]: crate::presentment::PresentmentPrompt
//! [`PresentmentModel`]: crate::presentment::PresentmentModel
//! [`present`]: crate::presentment::Presentment::present
//!
//! # Protocols
//!
//! | Protocol id | Handover | Response |
//! |---|---|---|
//! | `preview` | `AndroidHandoverv1` / `BrowserHandoverv1` | HPKE, `{"token": ...}` |
//! | `openid4vp` | `OpenID4VPDCAPIHandover` | `vp_token`, or a JWE for `dc_api.jwt` |
//! | `austroads-request-forwarding-v2` | `ARFHandoverv2` | HPKE, `{"encryptedResponse": ...}` |
//! | `org.iso.mdoc` | `dcapi` | HPKE, `{"Response": ...}` |
//!
//! Session transcripts are built in [`core::session_transcript`], documents in
//! [`mdoc`], and SD-JWT presentations in [`sd_jwt`].
//!
//! [`core::session_transcript`]: crate::core::session_transcript
//! [`mdoc`]: crate::mdoc
//! [`sd_jwt`]: crate::sd_jwt
//!
//! # Trust
//!
//! A [`TrustManager`] decides whether a certificate chain or a website origin is
//! anchored in one of its trust points:
//! - [`LocalTrustManager`] persists certificates, VICALs and origins in a
//!   [`StorageTable`].
//! - [`VicalTrustManager`] trusts the issuers listed in a single VICAL.
//! - [`CompositeTrustManager`] consults several managers, VICAL backed ones first.
//!
//! Trust verdicts are advisory: they are shown in the consent prompt and never
//! block a presentation on their own.
//!
//! [`TrustManager`]: crate::trust::TrustManager
//! [`LocalTrustManager`]: crate::trust::LocalTrustManager
//! [`VicalTrustManager`]: crate::trust::VicalTrustManager
//! [`CompositeTrustManager`]: crate::trust::CompositeTrustManager
//! [`StorageTable`]: crate::trust::StorageTable

pub mod config;
pub mod core;
pub mod credential;
pub mod mdoc;
pub mod presentment;
pub mod sd_jwt;
pub mod secure_area;
pub mod trust;
pub mod utils;
