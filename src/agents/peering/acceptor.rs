//! Cross-Account Acceptance
//!
//! Drives a peering connection from pending-acceptance to active from inside
//! the peer account. The connection can take a while to become visible there
//! (cross-account propagation lag), so the describe loop backs off
//! exponentially until the invocation budget runs out.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use super::network::{NetworkApi, NetworkScope};
use super::types::{AcceptedStatus, BackoffPolicy, Deadline, PeeringError, PeeringStatus};

pub struct CrossAccountAcceptor {
    network: Arc<dyn NetworkApi>,
    backoff: BackoffPolicy,
}

impl CrossAccountAcceptor {
    pub fn new(network: Arc<dyn NetworkApi>, backoff: BackoffPolicy) -> Self {
        Self { network, backoff }
    }

    /// Accept `connection_id` inside the peer account.
    ///
    /// Idempotent: an already-active connection returns success without
    /// issuing the accept call, which keeps retried invocations safe when a
    /// prior attempt succeeded but its response was lost. Authorization
    /// failures propagate immediately; waiting will not fix them.
    pub async fn accept(
        &self,
        scope: &NetworkScope,
        connection_id: &str,
        deadline: Deadline,
    ) -> Result<AcceptedStatus, PeeringError> {
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            match self.network.describe_peering(scope, connection_id).await {
                Ok(Some(conn)) => match conn.status {
                    PeeringStatus::Active => {
                        info!(connection_id, attempt, "connection already active");
                        return Ok(AcceptedStatus {
                            connection_id: connection_id.to_string(),
                            accepted_at: chrono::Utc::now(),
                            already_active: true,
                            attempts: attempt,
                        });
                    }
                    PeeringStatus::PendingAcceptance => {
                        let accepted = self.network.accept_peering(scope, connection_id).await?;
                        info!(
                            connection_id,
                            attempt,
                            status = %accepted.status,
                            "connection accepted"
                        );
                        return Ok(AcceptedStatus {
                            connection_id: connection_id.to_string(),
                            accepted_at: chrono::Utc::now(),
                            already_active: false,
                            attempts: attempt,
                        });
                    }
                    PeeringStatus::Initiated => {
                        debug!(connection_id, attempt, "connection not yet actionable");
                    }
                    PeeringStatus::Failed | PeeringStatus::Deleted => {
                        return Err(PeeringError::Api {
                            operation: "AcceptVpcPeeringConnection",
                            message: format!(
                                "connection {} is {} and cannot be accepted",
                                connection_id, conn.status
                            ),
                        });
                    }
                },
                Ok(None) => {
                    debug!(
                        connection_id,
                        attempt, "connection not yet visible in the peer account"
                    );
                }
                Err(err) if err.is_transient() => {
                    warn!(connection_id, attempt, error = %err, "transient describe failure");
                }
                Err(err) => return Err(err),
            }

            let delay = self.backoff.delay(attempt - 1);
            if deadline.remaining() <= delay {
                return Err(PeeringError::AcceptanceTimeout {
                    connection_id: connection_id.to_string(),
                    waited_ms: started.elapsed().as_millis(),
                });
            }
            tokio::time::sleep(delay).await;
        }
    }
}
