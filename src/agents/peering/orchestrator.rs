//! Peering Lifecycle Orchestrator
//!
//! Receives Create/Update/Delete notifications from the external lifecycle
//! controller and drives the provider to the declared state:
//! connection → cross-account acceptance → route reconciliation on both
//! sides, with the mirror sequence on teardown. Every invocation yields
//! exactly one terminal response before its deadline.
//!
//! The orchestrator keeps no state of its own. The provider's current state
//! is the single source of truth, so a retried invocation resumes from
//! whatever a previous attempt achieved instead of duplicating work.

use std::sync::Arc;

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::tools::ParameterStoreTool;

use super::acceptor::CrossAccountAcceptor;
use super::credentials::CredentialBroker;
use super::network::{NetworkApi, NetworkScope};
use super::routes::RouteReconciler;
use super::types::{
    Deadline, LifecycleEvent, LifecycleResponse, PeeringConfig, PeeringConnection, PeeringError,
    PeeringOutputs, PeeringRequest, PeeringStatus, RequestType,
};

pub struct PeeringOrchestrator {
    network: Arc<dyn NetworkApi>,
    broker: Arc<dyn CredentialBroker>,
    parameter_store: Option<Arc<ParameterStoreTool>>,
    config: PeeringConfig,
}

impl PeeringOrchestrator {
    pub fn new(
        network: Arc<dyn NetworkApi>,
        broker: Arc<dyn CredentialBroker>,
        config: PeeringConfig,
    ) -> Self {
        Self {
            network,
            broker,
            parameter_store: None,
            config,
        }
    }

    /// Publish created connection ids to the shared parameter store for
    /// downstream discovery. One-way; nothing here reads them back.
    pub fn with_parameter_store(mut self, store: Arc<ParameterStoreTool>) -> Self {
        self.parameter_store = Some(store);
        self
    }

    /// Handle one lifecycle notification.
    ///
    /// Never returns an error: every outcome, including deadline pressure,
    /// becomes exactly one terminal response. A silent timeout would leave
    /// the controller unable to tell "still working" from "crashed".
    pub async fn handle(&self, event: LifecycleEvent) -> LifecycleResponse {
        let invocation = Uuid::new_v4();
        let deadline = Deadline::in_seconds(event.response_deadline_seconds);
        let budget = deadline.shortened_by(self.config.safety_margin);

        info!(
            %invocation,
            request_type = %event.request_type,
            local_vpc = %event.resource_properties.local_vpc_id,
            peer_vpc = %event.resource_properties.peer_vpc_id,
            peer_account = %event.resource_properties.peer_account_id,
            deadline_secs = event.response_deadline_seconds,
            "handling lifecycle event"
        );

        let outcome = tokio::time::timeout(budget.remaining(), self.dispatch(&event, budget)).await;

        match outcome {
            Ok(Ok((physical_id, data))) => {
                info!(%invocation, physical_id = %physical_id, "lifecycle event succeeded");
                LifecycleResponse::success(physical_id, data)
            }
            Ok(Err(err)) => {
                error!(%invocation, error = %err, "lifecycle event failed");
                LifecycleResponse::failed(fallback_physical_id(&event), err.to_string())
            }
            Err(_) => {
                error!(%invocation, "invocation budget exhausted before completion");
                LifecycleResponse::failed(
                    fallback_physical_id(&event),
                    "invocation deadline exhausted before the operation completed".to_string(),
                )
            }
        }
    }

    /// Read-only view of the provider state for a declared request.
    pub async fn current_state(
        &self,
        request: &PeeringRequest,
    ) -> Result<Option<PeeringConnection>, PeeringError> {
        let local = NetworkScope::local(&request.local_region);
        self.network.find_peering(&local, request).await
    }

    async fn dispatch(
        &self,
        event: &LifecycleEvent,
        budget: Deadline,
    ) -> Result<(String, Option<PeeringOutputs>), PeeringError> {
        let request = &event.resource_properties;

        match event.request_type {
            RequestType::Create => {
                let physical_id = request.physical_id();
                let outputs = self.create(request, &physical_id, budget).await?;
                Ok((physical_id, Some(outputs)))
            }
            RequestType::Update => {
                // Peering connections cannot be re-parented, so a property
                // change is a replacement: returning a new physical identity
                // tells the controller to delete the old resource afterwards.
                let physical_id = request.physical_id();
                match event.physical_resource_id.as_deref() {
                    Some(current) if current == physical_id => {
                        info!("properties unchanged, re-reconciling in place");
                    }
                    Some(current) => {
                        info!(replaces = current, "properties changed, provisioning replacement");
                    }
                    None => {}
                }
                let outputs = self.create(request, &physical_id, budget).await?;
                Ok((physical_id, Some(outputs)))
            }
            RequestType::Delete => {
                let physical_id = fallback_physical_id(event);
                self.delete(request, budget).await?;
                Ok((physical_id, None))
            }
        }
    }

    async fn create(
        &self,
        request: &PeeringRequest,
        physical_id: &str,
        budget: Deadline,
    ) -> Result<PeeringOutputs, PeeringError> {
        // Overlapping ranges can never route; fail before any provider call.
        if request.ranges_overlap() {
            return Err(PeeringError::InvalidTopology {
                local: request.local_cidr,
                peer: request.peer_cidr,
            });
        }

        let local = NetworkScope::local(&request.local_region);

        // 1. Create the connection, or resume one left by a prior attempt.
        let connection = match self.network.find_peering(&local, request).await? {
            Some(existing)
                if matches!(
                    existing.status,
                    PeeringStatus::Initiated
                        | PeeringStatus::PendingAcceptance
                        | PeeringStatus::Active
                ) =>
            {
                info!(
                    connection_id = %existing.connection_id,
                    status = %existing.status,
                    "resuming existing peering connection"
                );
                existing
            }
            other => {
                if let Some(defunct) = other {
                    warn!(
                        connection_id = %defunct.connection_id,
                        status = %defunct.status,
                        "ignoring defunct peering connection"
                    );
                }
                self.network.create_peering(&local, request).await?
            }
        };

        // 2. Accept from inside the peer account.
        let peer_scope = self.peer_scope(request, physical_id, budget).await?;
        let acceptor = CrossAccountAcceptor::new(self.network.clone(), self.config.backoff);
        let accepted = acceptor
            .accept(&peer_scope, &connection.connection_id, budget)
            .await?;

        // 3. Local routes toward the peer range, then 4. peer routes back.
        // Peer-side reconciliation depends on the acceptance above, so there
        // is no fan-out here.
        let reconciler = RouteReconciler::new(
            self.network.clone(),
            self.config.backoff,
            self.config.max_transient_retries,
        );
        let local_routes = reconciler
            .ensure_routes(
                &local,
                &request.local_route_table_ids,
                request.peer_cidr,
                &connection.connection_id,
                budget,
            )
            .await?;
        let peer_routes = reconciler
            .ensure_routes(
                &peer_scope,
                &request.peer_route_table_ids,
                request.local_cidr,
                &connection.connection_id,
                budget,
            )
            .await?;

        // 5. Best-effort pointer for downstream stacks.
        if let Some(store) = &self.parameter_store {
            if let Err(err) = store
                .publish_connection_id(physical_id, &connection.connection_id)
                .await
            {
                warn!(error = %err, "failed to publish connection id to the parameter store");
            }
        }

        Ok(PeeringOutputs {
            connection_id: connection.connection_id,
            accepted_at: Some(accepted.accepted_at),
            routes_reconciled: local_routes.len() + peer_routes.len(),
        })
    }

    /// Teardown mirror: routes first on both sides, then the connection.
    /// The provider refuses to delete a connection that routes still
    /// reference. Every already-gone condition is success.
    async fn delete(&self, request: &PeeringRequest, budget: Deadline) -> Result<(), PeeringError> {
        let local = NetworkScope::local(&request.local_region);
        let connection = self.network.find_peering(&local, request).await?;
        let owned_target = connection.as_ref().map(|conn| conn.connection_id.as_str());

        let reconciler = RouteReconciler::new(
            self.network.clone(),
            self.config.backoff,
            self.config.max_transient_retries,
        );
        reconciler
            .remove_routes(
                &local,
                &request.local_route_table_ids,
                request.peer_cidr,
                owned_target,
                budget,
            )
            .await?;

        let peer_scope = self
            .peer_scope(request, &request.physical_id(), budget)
            .await?;
        reconciler
            .remove_routes(
                &peer_scope,
                &request.peer_route_table_ids,
                request.local_cidr,
                owned_target,
                budget,
            )
            .await?;

        match connection {
            Some(conn) if conn.status != PeeringStatus::Deleted => {
                self.network.delete_peering(&local, &conn.connection_id).await?;
            }
            _ => {
                info!("peering connection already gone");
            }
        }

        Ok(())
    }

    async fn peer_scope(
        &self,
        request: &PeeringRequest,
        physical_id: &str,
        budget: Deadline,
    ) -> Result<NetworkScope, PeeringError> {
        let session_name = format!("lornu-peering-{}", physical_id);
        let credentials = self
            .broker
            .delegated_credentials(
                &request.peer_account_id,
                &request.peer_role_arn,
                &session_name,
                budget.remaining(),
            )
            .await?;

        Ok(NetworkScope::delegated(request.peer_region(), credentials))
    }
}

fn fallback_physical_id(event: &LifecycleEvent) -> String {
    event
        .physical_resource_id
        .clone()
        .unwrap_or_else(|| event.resource_properties.physical_id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::peering::mock::{
        sample_request, DenyingBroker, MockNetwork, StaticBroker,
    };
    use crate::agents::peering::types::ResponseStatus;
    use std::time::Duration;

    fn fast_config() -> PeeringConfig {
        PeeringConfig {
            backoff: crate::agents::peering::types::BackoffPolicy {
                base: Duration::from_millis(1),
                cap: Duration::from_millis(4),
            },
            safety_margin: Duration::ZERO,
            op_timeout: Duration::from_secs(5),
            max_transient_retries: 3,
        }
    }

    fn orchestrator(network: Arc<MockNetwork>) -> PeeringOrchestrator {
        PeeringOrchestrator::new(network, Arc::new(StaticBroker), fast_config())
    }

    fn event(request_type: RequestType, request: PeeringRequest) -> LifecycleEvent {
        LifecycleEvent {
            request_type,
            physical_resource_id: None,
            resource_properties: request,
            response_deadline_seconds: 5,
        }
    }

    #[tokio::test]
    async fn test_create_scenario_with_visibility_lag() {
        // Connection created, acceptance succeeds after exactly one
        // simulated "not yet visible" retry, one route per side.
        let network = MockNetwork::with_peer_lag(1);
        let sut = orchestrator(network.clone());

        let response = sut.handle(event(RequestType::Create, sample_request())).await;

        assert_eq!(response.status, ResponseStatus::Success);
        let data = response.data.unwrap();
        assert_eq!(data.routes_reconciled, 2);
        assert!(data.accepted_at.is_some());

        assert_eq!(network.create_calls(), 1);
        assert_eq!(network.accept_calls(), 1);

        let local_routes = network.routes_in("rtb-local-1");
        assert_eq!(local_routes.len(), 1);
        assert_eq!(local_routes[0].destination, "10.1.0.0/16");
        assert_eq!(local_routes[0].target, data.connection_id);

        let peer_routes = network.routes_in("rtb-peer-1");
        assert_eq!(peer_routes.len(), 1);
        assert_eq!(peer_routes[0].destination, "10.0.0.0/16");
        assert_eq!(peer_routes[0].target, data.connection_id);
    }

    #[tokio::test]
    async fn test_overlapping_ranges_fail_before_any_call() {
        let network = MockNetwork::new();
        let sut = orchestrator(network.clone());

        let mut request = sample_request();
        request.peer_cidr = "10.0.5.0/24".parse().unwrap();

        let response = sut.handle(event(RequestType::Create, request)).await;

        assert_eq!(response.status, ResponseStatus::Failed);
        assert!(response.reason.unwrap().contains("overlap"));
        assert_eq!(network.create_calls(), 0);
        assert_eq!(network.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_retried_create_resumes_without_duplicating_work() {
        let network = MockNetwork::new();
        let sut = orchestrator(network.clone());

        let first = sut.handle(event(RequestType::Create, sample_request())).await;
        assert_eq!(first.status, ResponseStatus::Success);
        let mutations_after_first = network.mutations();

        // The controller retries Create after losing the response.
        let second = sut.handle(event(RequestType::Create, sample_request())).await;
        assert_eq!(second.status, ResponseStatus::Success);

        assert_eq!(first.physical_resource_id, second.physical_resource_id);
        assert_eq!(
            first.data.unwrap().connection_id,
            second.data.as_ref().unwrap().connection_id
        );
        assert_eq!(network.create_calls(), 1);
        assert_eq!(network.accept_calls(), 1);
        assert_eq!(network.mutations(), mutations_after_first);
    }

    #[tokio::test]
    async fn test_connection_id_is_stable_across_describes() {
        let network = MockNetwork::new();
        let sut = orchestrator(network.clone());

        let response = sut.handle(event(RequestType::Create, sample_request())).await;
        let connection_id = response.data.unwrap().connection_id;

        for _ in 0..3 {
            let state = sut.current_state(&sample_request()).await.unwrap().unwrap();
            assert_eq!(state.connection_id, connection_id);
        }
    }

    #[tokio::test]
    async fn test_delete_tears_down_routes_then_connection() {
        let network = MockNetwork::new();
        let sut = orchestrator(network.clone());

        sut.handle(event(RequestType::Create, sample_request())).await;
        assert_eq!(network.connection_count(), 1);

        let response = sut.handle(event(RequestType::Delete, sample_request())).await;

        assert_eq!(response.status, ResponseStatus::Success);
        assert_eq!(network.connection_count(), 0);
        assert!(network.routes_in("rtb-local-1").is_empty());
        assert!(network.routes_in("rtb-peer-1").is_empty());
    }

    #[tokio::test]
    async fn test_delete_of_out_of_band_removed_resource_succeeds() {
        // Nothing exists on the provider side at all.
        let network = MockNetwork::new();
        let sut = orchestrator(network.clone());

        let mut delete = event(RequestType::Delete, sample_request());
        delete.physical_resource_id = Some("peering-vpc-old-vpc-gone-deadbeef".to_string());

        let response = sut.handle(delete).await;

        assert_eq!(response.status, ResponseStatus::Success);
        assert_eq!(
            response.physical_resource_id,
            "peering-vpc-old-vpc-gone-deadbeef"
        );
        assert_eq!(network.mutations(), 0);
    }

    #[tokio::test]
    async fn test_update_with_changed_properties_signals_replacement() {
        let network = MockNetwork::new();
        let sut = orchestrator(network.clone());

        let create = sut.handle(event(RequestType::Create, sample_request())).await;
        let old_id = create.physical_resource_id.clone();

        let mut changed = sample_request();
        changed.peer_vpc_id = "vpc-0replacement00000".to_string();
        let mut update = event(RequestType::Update, changed);
        update.physical_resource_id = Some(old_id.clone());

        let response = sut.handle(update).await;

        assert_eq!(response.status, ResponseStatus::Success);
        assert_ne!(response.physical_resource_id, old_id);
        assert_eq!(network.create_calls(), 2);
    }

    #[tokio::test]
    async fn test_acceptance_timeout_yields_failed_before_deadline() {
        let network = MockNetwork::with_peer_lag(u32::MAX);
        let sut = orchestrator(network.clone());

        let mut create = event(RequestType::Create, sample_request());
        create.response_deadline_seconds = 1;

        let started = std::time::Instant::now();
        let response = sut.handle(create).await;

        assert_eq!(response.status, ResponseStatus::Failed);
        assert!(started.elapsed() < Duration::from_millis(1500));
        let reason = response.reason.unwrap();
        assert!(reason.contains("not accepted") || reason.contains("deadline"));
    }

    #[tokio::test]
    async fn test_denied_trust_is_fatal() {
        let network = MockNetwork::new();
        let sut = PeeringOrchestrator::new(
            network.clone(),
            Arc::new(DenyingBroker),
            fast_config(),
        );

        let response = sut.handle(event(RequestType::Create, sample_request())).await;

        assert_eq!(response.status, ResponseStatus::Failed);
        assert!(response.reason.unwrap().contains("trust denied"));
        // The connection request went out before acceptance; it is left in
        // an inspectable state rather than rolled back.
        assert_eq!(network.create_calls(), 1);
    }
}
