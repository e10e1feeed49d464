// ABOUTME: Readiness waiter polling a freshly created resource until it serves traffic
// ABOUTME: Bounded fixed-interval polling with a hard wall-clock timeout

use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::backends::{BackendError, ProviderHandle, ProvisioningBackend, RuntimeInfo, RuntimeState};

#[derive(Error, Debug)]
pub enum ReadinessError {
    #[error("resource never became ready within {0:?}")]
    TimedOut(Duration),

    #[error("resource failed while provisioning: {0}")]
    Failed(String),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

pub struct ReadinessWaiter {
    poll_interval: Duration,
    timeout: Duration,
}

impl ReadinessWaiter {
    pub fn new(poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            poll_interval,
            timeout,
        }
    }

    /// Poll the backend until the resource reports a running state, then
    /// apply the backend's readiness grace. Transient unreachable errors
    /// keep the poll going; a failed or halted resource aborts early.
    pub async fn wait_until_running(
        &self,
        backend: &dyn ProvisioningBackend,
        handle: &ProviderHandle,
    ) -> Result<RuntimeInfo, ReadinessError> {
        let deadline = Instant::now() + self.timeout;

        loop {
            match backend.inspect(handle).await {
                Ok(info) => match &info.state {
                    RuntimeState::Running => {
                        let grace = backend.readiness_grace();
                        if !grace.is_zero() {
                            debug!(
                                "Resource {} active; settling for {:?}",
                                handle.resource_id, grace
                            );
                            tokio::time::sleep(grace).await;
                        }
                        return Ok(info);
                    }
                    RuntimeState::Failed(msg) => {
                        return Err(ReadinessError::Failed(msg.clone()));
                    }
                    RuntimeState::Halted => {
                        return Err(ReadinessError::Failed(
                            "resource halted before becoming ready".to_string(),
                        ));
                    }
                    // Providers can briefly not know a just-created
                    // resource; keep polling.
                    RuntimeState::Provisioning | RuntimeState::Missing => {}
                },
                Err(BackendError::Unreachable(e)) => {
                    warn!(
                        "Backend unreachable while waiting on {}: {}",
                        handle.resource_id, e
                    );
                }
                Err(e) => return Err(ReadinessError::Backend(e)),
            }

            if Instant::now() >= deadline {
                return Err(ReadinessError::TimedOut(self.timeout));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
