//! Cross-thread access to the main loop.

use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::error;

use crate::error::ServerError;
use crate::server::state::ServerState;

pub(crate) type MainJob = Box<dyn FnOnce(&mut ServerState) + Send>;

/// Posts work onto the main loop, which owns every registry.
///
/// Other threads never touch [`ServerState`] directly; they either post a
/// closure ([`MainHandle::post`]) or run one and wait for its result with a
/// bounded wait ([`MainHandle::call`]).
#[derive(Clone)]
pub struct MainHandle {
    jobs: mpsc::UnboundedSender<MainJob>,
    call_timeout: Duration,
}

impl MainHandle {
    pub(crate) fn new(call_timeout: Duration) -> (Self, mpsc::UnboundedReceiver<MainJob>) {
        let (jobs, receiver) = mpsc::unbounded_channel();
        (Self { jobs, call_timeout }, receiver)
    }

    /// Queues `job` without waiting. Returns `false` once the main loop has
    /// stopped.
    pub fn post<F>(&self, job: F) -> bool
    where
        F: FnOnce(&mut ServerState) + Send + 'static,
    {
        self.jobs.send(Box::new(job)).is_ok()
    }

    /// Runs `job` on the main loop and returns its result.
    ///
    /// Must not be awaited from the main loop itself.
    pub async fn call<F, T>(&self, job: F) -> Result<T, ServerError>
    where
        F: FnOnce(&mut ServerState) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let posted = self.post(move |state| {
            let _ = tx.send(job(state));
        });
        if !posted {
            return Err(ServerError::Internal("main loop has stopped".to_string()));
        }

        match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(ServerError::Internal(
                "main loop dropped the call".to_string(),
            )),
            Err(_) => {
                error!(
                    "💀 Main loop did not answer within {:?}; it may be stalled",
                    self.call_timeout
                );
                Err(ServerError::MainLoopTimeout(self.call_timeout))
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.jobs.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_call_times_out_when_loop_stalls() {
        let (handle, _receiver) = MainHandle::new(Duration::from_millis(50));
        let result = handle.call(|_state| 1).await;
        assert!(matches!(result, Err(ServerError::MainLoopTimeout(_))));
    }

    #[tokio::test]
    async fn test_call_fails_fast_when_loop_is_gone() {
        let (handle, receiver) = MainHandle::new(Duration::from_secs(5));
        drop(receiver);
        assert!(!handle.post(|_state| {}));
        assert!(matches!(
            handle.call(|_state| 1).await,
            Err(ServerError::Internal(_))
        ));
    }
}
