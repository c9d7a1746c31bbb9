use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

use crate::error::{CrewGraphError, Result};
use crate::types::RunStatus;

/// Cooperative, status-bearing cancellation signal shared by every node of a run.
///
/// The status is assigned exactly once; later `set` calls are ignored.
#[derive(Debug, Clone, Default)]
pub struct StopEvent {
    token: CancellationToken,
    status: Arc<OnceLock<RunStatus>>,
}

impl StopEvent {
    /// Create an unset event.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `status` and cancel. Returns `true` only for the first writer.
    pub fn set(&self, status: RunStatus) -> bool {
        let first = self.status.set(status).is_ok();
        if first {
            self.token.cancel();
        }
        first
    }

    /// The recorded status, if any.
    pub fn status(&self) -> Option<RunStatus> {
        self.status.get().copied()
    }

    /// Whether any status has been recorded.
    pub fn is_set(&self) -> bool {
        self.status.get().is_some()
    }

    /// Resolves once the event has been set.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// `Err(Cancelled(status))` once set.
    pub fn check(&self) -> Result<()> {
        match self.status() {
            Some(status) => Err(CrewGraphError::Cancelled(status)),
            None => Ok(()),
        }
    }

    /// Underlying token, for `select!` arms and child tokens.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Whether `other` is a clone of this event rather than an independent one.
    pub fn same_as(&self, other: &StopEvent) -> bool {
        Arc::ptr_eq(&self.status, &other.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn first_writer_wins() {
        let stop = StopEvent::new();
        assert!(stop.check().is_ok());
        assert!(stop.set(RunStatus::Stop));
        assert!(!stop.set(RunStatus::Expired));
        assert_eq!(stop.status(), Some(RunStatus::Stop));
        assert!(matches!(
            stop.check(),
            Err(CrewGraphError::Cancelled(RunStatus::Stop))
        ));
    }

    #[test]
    fn clones_are_the_same_event() {
        let stop = StopEvent::new();
        assert!(stop.same_as(&stop.clone()));
        assert!(!stop.same_as(&StopEvent::new()));
    }

    #[tokio::test]
    async fn clones_share_state_and_wake_waiters() {
        let stop = StopEvent::new();
        let waiter = stop.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            waiter.status()
        });
        stop.set(RunStatus::Expired);
        let status = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status, Some(RunStatus::Expired));
    }
}
