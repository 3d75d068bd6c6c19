//! Route Reconciliation
//!
//! Ensures each route table carries exactly one entry sending the peer's
//! address range across the peering connection. Ownership is scoped by
//! destination-range equality: the reconciler never touches any other row in
//! a table, and a row under the owned destination that points somewhere else
//! is a conflict, not something to overwrite.

use std::future::Future;
use std::sync::Arc;

use ipnetwork::Ipv4Network;
use tracing::{debug, info, warn};

use super::network::{NetworkApi, NetworkScope};
use super::types::{
    BackoffPolicy, Deadline, PeeringError, RouteAction, RouteEntry, RouteSyncResult,
};

pub struct RouteReconciler {
    network: Arc<dyn NetworkApi>,
    backoff: BackoffPolicy,
    max_transient_retries: u32,
}

impl RouteReconciler {
    pub fn new(
        network: Arc<dyn NetworkApi>,
        backoff: BackoffPolicy,
        max_transient_retries: u32,
    ) -> Self {
        Self {
            network,
            backoff,
            max_transient_retries,
        }
    }

    /// Ensure every table routes `destination` at `target`.
    ///
    /// Idempotent per (table, destination): an entry already pointing at the
    /// target is a no-op, an absent entry is created, and a foreign entry
    /// fails with a conflict. Tables are deduplicated first; several subnets
    /// commonly share one table.
    pub async fn ensure_routes(
        &self,
        scope: &NetworkScope,
        route_tables: &[String],
        destination: Ipv4Network,
        target: &str,
        deadline: Deadline,
    ) -> Result<Vec<RouteSyncResult>, PeeringError> {
        let destination = destination.to_string();
        let mut results = Vec::new();

        for table in dedup(route_tables) {
            let existing = self
                .retry_transient("DescribeRouteTables", deadline, || {
                    self.network.describe_routes(scope, &table)
                })
                .await?;

            match existing.iter().find(|entry| entry.destination == destination) {
                Some(entry) if entry.target == target => {
                    debug!(route_table_id = %table, %destination, "route unchanged");
                    results.push(RouteSyncResult {
                        route_table_id: table,
                        destination: destination.clone(),
                        action: RouteAction::Unchanged,
                    });
                }
                Some(entry) => {
                    return Err(PeeringError::RouteConflict {
                        route_table_id: table,
                        destination,
                        existing_target: entry.target.clone(),
                    });
                }
                None => {
                    let route = RouteEntry {
                        route_table_id: table.clone(),
                        destination: destination.clone(),
                        target: target.to_string(),
                    };
                    self.retry_transient("CreateRoute", deadline, || {
                        self.network.create_route(scope, &route)
                    })
                    .await?;

                    results.push(RouteSyncResult {
                        route_table_id: table,
                        destination: destination.clone(),
                        action: RouteAction::Created,
                    });
                }
            }
        }

        info!(
            destination = %destination,
            target,
            tables = results.len(),
            "routes reconciled"
        );

        Ok(results)
    }

    /// Remove the owned destination from every table.
    ///
    /// Already-absent entries are success. When `expected_target` is known,
    /// a row pointing somewhere else is not ours and is left in place.
    pub async fn remove_routes(
        &self,
        scope: &NetworkScope,
        route_tables: &[String],
        destination: Ipv4Network,
        expected_target: Option<&str>,
        deadline: Deadline,
    ) -> Result<Vec<RouteSyncResult>, PeeringError> {
        let destination = destination.to_string();
        let mut results = Vec::new();

        for table in dedup(route_tables) {
            let existing = self
                .retry_transient("DescribeRouteTables", deadline, || {
                    self.network.describe_routes(scope, &table)
                })
                .await?;

            let action = match existing.iter().find(|entry| entry.destination == destination) {
                None => {
                    debug!(route_table_id = %table, %destination, "route already absent");
                    RouteAction::AlreadyAbsent
                }
                Some(entry)
                    if expected_target.is_some_and(|target| entry.target != target) =>
                {
                    warn!(
                        route_table_id = %table,
                        %destination,
                        target = %entry.target,
                        "route under owned destination targets another object, leaving it"
                    );
                    RouteAction::Skipped
                }
                Some(_) => {
                    self.retry_transient("DeleteRoute", deadline, || {
                        self.network.delete_route(scope, &table, &destination)
                    })
                    .await?;
                    RouteAction::Removed
                }
            };

            results.push(RouteSyncResult {
                route_table_id: table,
                destination: destination.clone(),
                action,
            });
        }

        Ok(results)
    }

    async fn retry_transient<T, F, Fut>(
        &self,
        operation: &'static str,
        deadline: Deadline,
        mut call: F,
    ) -> Result<T, PeeringError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PeeringError>>,
    {
        let mut attempt: u32 = 0;

        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_transient_retries => {
                    let delay = self.backoff.delay(attempt);
                    if deadline.remaining() <= delay {
                        return Err(PeeringError::DeadlineExceeded(operation));
                    }
                    warn!(operation, attempt, error = %err, "transient provider error, backing off");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn dedup(route_tables: &[String]) -> Vec<String> {
    let mut seen = Vec::new();
    for table in route_tables {
        if !seen.contains(table) {
            seen.push(table.clone());
        }
    }
    seen
}
