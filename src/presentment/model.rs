//! Observable state of one presentation session.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::sync::watch;

/// Why a presentation ended without a response. None of these are errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    NoMatchingCredential,
    ConsentDeclined,
    /// The user dismissed a key unlock prompt.
    UnlockCancelled,
    /// The session's cancellation token fired.
    Cancelled,
}

#[derive(Debug, Clone)]
pub enum Outcome {
    /// A response was sent.
    Success,
    Aborted(AbortReason),
    Error(Arc<anyhow::Error>),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Outcome::Error(_))
    }
}

#[derive(Debug, Clone)]
pub enum Status {
    Waiting,
    Processing,
    Completed(Outcome),
}

/// Session state shared with the UI.
///
/// Status changes can be observed through [Self::subscribe].
#[derive(Debug)]
pub struct PresentmentModel {
    status: watch::Sender<Status>,
    dismissible: AtomicBool,
}

impl Default for PresentmentModel {
    fn default() -> Self {
        Self::new()
    }
}

impl PresentmentModel {
    pub fn new() -> Self {
        // Receivers are created on demand; `send_replace` works without any.
        let (status, _) = watch::channel(Status::Waiting);
        Self {
            status,
            dismissible: AtomicBool::new(true),
        }
    }

    pub fn status(&self) -> Status {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.status.subscribe()
    }

    /// Whether the UI may let the user dismiss the session.
    pub fn is_dismissible(&self) -> bool {
        self.dismissible.load(Ordering::SeqCst)
    }

    pub fn set_dismissible(&self, dismissible: bool) {
        self.dismissible.store(dismissible, Ordering::SeqCst);
    }

    pub(crate) fn set_processing(&self) {
        self.status.send_replace(Status::Processing);
    }

    pub(crate) fn complete(&self, outcome: Outcome) {
        self.status.send_replace(Status::Completed(outcome));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribers_see_completion() {
        let model = PresentmentModel::new();
        let mut rx = model.subscribe();
        assert!(matches!(model.status(), Status::Waiting));

        model.set_processing();
        model.complete(Outcome::Aborted(AbortReason::ConsentDeclined));

        assert!(rx.has_changed().unwrap());
        assert!(matches!(
            &*rx.borrow_and_update(),
            Status::Completed(Outcome::Aborted(AbortReason::ConsentDeclined))
        ));
    }
}
