use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{CoreError, CoreResult};

/// Cooperative pause switch shared by every chunk task of one download.
///
/// Tasks call [`PauseCoordinator::wait_while_paused`] at their checkpoints. The
/// wait ends on resume or on cancellation, whichever comes first.
#[derive(Debug)]
pub struct PauseCoordinator {
    paused: watch::Sender<bool>,
}

impl Default for PauseCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseCoordinator {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self { paused }
    }

    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub async fn wait_while_paused(&self, cancel: &CancellationToken) -> CoreResult<()> {
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        let mut rx = self.paused.subscribe();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CoreError::Cancelled),
            resumed = rx.wait_for(|paused| !*paused) => resumed
                .map(|_| ())
                .map_err(|_| CoreError::InvalidState("pause coordinator dropped".to_string())),
        }
    }
}
