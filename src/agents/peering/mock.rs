//! In-memory provider fixtures for the peering scenario tests.
//!
//! `MockNetwork` records every mutating call and can simulate the
//! cross-account visibility lag; `StaticBroker`/`DenyingBroker` stand in for
//! the credential exchange.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::credentials::{CredentialBroker, DelegatedCredentials};
use super::network::{NetworkApi, NetworkScope};
use super::types::{
    PeeringConnection, PeeringError, PeeringRequest, PeeringStatus, RouteEntry,
};

#[derive(Default)]
struct MockState {
    connections: HashMap<String, PeeringConnection>,
    /// (local vpc, peer vpc) -> connection id
    request_index: HashMap<String, String>,
    routes: HashMap<String, Vec<RouteEntry>>,
    /// Peer-side describes that see nothing before the connection appears.
    peer_visible_after: u32,
    peer_describes: u32,
    throttled_describes: u32,
    next_connection: u32,
    create_calls: u32,
    accept_calls: u32,
    mutations: u32,
}

pub struct MockNetwork {
    state: Mutex<MockState>,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState::default()),
        })
    }

    pub fn with_peer_lag(lag: u32) -> Arc<Self> {
        let mock = Self::new();
        mock.state.lock().unwrap().peer_visible_after = lag;
        mock
    }

    pub fn seed_connection(&self, connection_id: &str, status: PeeringStatus) {
        self.state.lock().unwrap().connections.insert(
            connection_id.to_string(),
            PeeringConnection {
                connection_id: connection_id.to_string(),
                status,
                status_message: None,
            },
        );
    }

    pub fn seed_route(&self, route_table_id: &str, destination: &str, target: &str) {
        self.state
            .lock()
            .unwrap()
            .routes
            .entry(route_table_id.to_string())
            .or_default()
            .push(RouteEntry {
                route_table_id: route_table_id.to_string(),
                destination: destination.to_string(),
                target: target.to_string(),
            });
    }

    /// Fail the next `count` route describes with a throttle error.
    pub fn throttle_describes(&self, count: u32) {
        self.state.lock().unwrap().throttled_describes = count;
    }

    pub fn routes_in(&self, route_table_id: &str) -> Vec<RouteEntry> {
        self.state
            .lock()
            .unwrap()
            .routes
            .get(route_table_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().unwrap().connections.len()
    }

    pub fn create_calls(&self) -> u32 {
        self.state.lock().unwrap().create_calls
    }

    pub fn accept_calls(&self) -> u32 {
        self.state.lock().unwrap().accept_calls
    }

    /// Total mutating provider calls issued so far.
    pub fn mutations(&self) -> u32 {
        self.state.lock().unwrap().mutations
    }
}

fn request_key(request: &PeeringRequest) -> String {
    format!("{}|{}", request.local_vpc_id, request.peer_vpc_id)
}

#[async_trait]
impl NetworkApi for MockNetwork {
    async fn create_peering(
        &self,
        _scope: &NetworkScope,
        request: &PeeringRequest,
    ) -> Result<PeeringConnection, PeeringError> {
        let mut state = self.state.lock().unwrap();
        state.create_calls += 1;
        state.mutations += 1;
        state.next_connection += 1;

        let connection = PeeringConnection {
            connection_id: format!("pcx-{:08x}", state.next_connection),
            status: PeeringStatus::PendingAcceptance,
            status_message: None,
        };

        state
            .connections
            .insert(connection.connection_id.clone(), connection.clone());
        state
            .request_index
            .insert(request_key(request), connection.connection_id.clone());

        Ok(connection)
    }

    async fn find_peering(
        &self,
        _scope: &NetworkScope,
        request: &PeeringRequest,
    ) -> Result<Option<PeeringConnection>, PeeringError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .request_index
            .get(&request_key(request))
            .and_then(|id| state.connections.get(id))
            .cloned())
    }

    async fn describe_peering(
        &self,
        scope: &NetworkScope,
        connection_id: &str,
    ) -> Result<Option<PeeringConnection>, PeeringError> {
        let mut state = self.state.lock().unwrap();

        if scope.is_delegated() {
            state.peer_describes += 1;
            if state.peer_describes <= state.peer_visible_after {
                return Ok(None);
            }
        }

        Ok(state.connections.get(connection_id).cloned())
    }

    async fn accept_peering(
        &self,
        _scope: &NetworkScope,
        connection_id: &str,
    ) -> Result<PeeringConnection, PeeringError> {
        let mut state = self.state.lock().unwrap();
        state.accept_calls += 1;
        state.mutations += 1;

        match state.connections.get_mut(connection_id) {
            Some(conn) => {
                conn.status = PeeringStatus::Active;
                Ok(conn.clone())
            }
            None => Err(PeeringError::Api {
                operation: "AcceptVpcPeeringConnection",
                message: format!("connection {} does not exist", connection_id),
            }),
        }
    }

    async fn delete_peering(
        &self,
        _scope: &NetworkScope,
        connection_id: &str,
    ) -> Result<(), PeeringError> {
        let mut state = self.state.lock().unwrap();
        state.mutations += 1;
        state.connections.remove(connection_id);
        state.request_index.retain(|_, id| id != connection_id);
        Ok(())
    }

    async fn describe_routes(
        &self,
        _scope: &NetworkScope,
        route_table_id: &str,
    ) -> Result<Vec<RouteEntry>, PeeringError> {
        let mut state = self.state.lock().unwrap();

        if state.throttled_describes > 0 {
            state.throttled_describes -= 1;
            return Err(PeeringError::ProviderThrottled {
                operation: "DescribeRouteTables",
                message: "Request limit exceeded".to_string(),
            });
        }

        Ok(state
            .routes
            .get(route_table_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_route(
        &self,
        _scope: &NetworkScope,
        route: &RouteEntry,
    ) -> Result<(), PeeringError> {
        let mut state = self.state.lock().unwrap();
        state.mutations += 1;

        let table = state
            .routes
            .entry(route.route_table_id.clone())
            .or_default();

        if table.iter().any(|r| r.destination == route.destination) {
            return Err(PeeringError::Api {
                operation: "CreateRoute",
                message: "RouteAlreadyExists: a route with that destination exists".to_string(),
            });
        }

        table.push(route.clone());
        Ok(())
    }

    async fn delete_route(
        &self,
        _scope: &NetworkScope,
        route_table_id: &str,
        destination: &str,
    ) -> Result<(), PeeringError> {
        let mut state = self.state.lock().unwrap();
        state.mutations += 1;

        if let Some(table) = state.routes.get_mut(route_table_id) {
            table.retain(|r| r.destination != destination);
        }
        Ok(())
    }
}

pub fn mock_credentials() -> DelegatedCredentials {
    DelegatedCredentials {
        access_key_id: "ASIAMOCKED".to_string(),
        secret_access_key: "mock-secret".to_string(),
        session_token: "mock-session".to_string(),
        expires_at: Instant::now() + Duration::from_secs(900),
    }
}

/// Broker that always issues credentials.
pub struct StaticBroker;

#[async_trait]
impl CredentialBroker for StaticBroker {
    async fn delegated_credentials(
        &self,
        _account_id: &str,
        _role_arn: &str,
        _session_name: &str,
        _ttl: Duration,
    ) -> Result<DelegatedCredentials, PeeringError> {
        Ok(mock_credentials())
    }
}

/// Broker whose trust policy rejects this caller.
pub struct DenyingBroker;

#[async_trait]
impl CredentialBroker for DenyingBroker {
    async fn delegated_credentials(
        &self,
        _account_id: &str,
        _role_arn: &str,
        _session_name: &str,
        _ttl: Duration,
    ) -> Result<DelegatedCredentials, PeeringError> {
        Err(PeeringError::TrustDenied(
            "peering role is not assumable by this principal".to_string(),
        ))
    }
}

pub fn sample_request() -> PeeringRequest {
    PeeringRequest {
        local_vpc_id: "vpc-0aa11bb22cc33dd44".to_string(),
        local_account_id: "111111111111".to_string(),
        local_region: "eu-west-1".to_string(),
        local_cidr: "10.0.0.0/16".parse().unwrap(),
        local_route_table_ids: vec!["rtb-local-1".to_string()],
        peer_vpc_id: "vpc-0ee55ff66aa77bb88".to_string(),
        peer_account_id: "222222222222".to_string(),
        peer_region: Some("us-east-2".to_string()),
        peer_cidr: "10.1.0.0/16".parse().unwrap(),
        peer_route_table_ids: vec!["rtb-peer-1".to_string()],
        peer_role_arn: "arn:aws:iam::222222222222:role/lornu-peering-acceptor".to_string(),
    }
}
