//! Provider Network API
//!
//! Narrow seam over the provider's peering and routing control plane. The
//! trait carries only the operations the lifecycle needs, expressed in this
//! module's own value types; provider SDK object graphs stop here.

use std::time::Duration;

use async_trait::async_trait;
use aws_config::timeout::TimeoutConfig;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_ec2::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_ec2::types::{Filter, Route, VpcPeeringConnection};
use tracing::{debug, info};

use super::credentials::DelegatedCredentials;
use super::types::{PeeringConnection, PeeringError, PeeringRequest, PeeringStatus, RouteEntry};

/// Which account/region a call executes in.
///
/// `credentials: None` means the workload's own (local-account) identity;
/// `Some` carries delegated credentials for the peer account. Threading the
/// scope explicitly keeps any call from silently running under the wrong
/// account.
#[derive(Debug, Clone)]
pub struct NetworkScope {
    pub region: String,
    pub credentials: Option<DelegatedCredentials>,
}

impl NetworkScope {
    pub fn local(region: &str) -> Self {
        Self {
            region: region.to_string(),
            credentials: None,
        }
    }

    pub fn delegated(region: &str, credentials: DelegatedCredentials) -> Self {
        Self {
            region: region.to_string(),
            credentials: Some(credentials),
        }
    }

    pub fn is_delegated(&self) -> bool {
        self.credentials.is_some()
    }
}

/// Peering and routing operations against the provider.
#[async_trait]
pub trait NetworkApi: Send + Sync {
    /// Request a new peering connection from the local side.
    async fn create_peering(
        &self,
        scope: &NetworkScope,
        request: &PeeringRequest,
    ) -> Result<PeeringConnection, PeeringError>;

    /// Look up the connection owned by `request`, if the provider knows one.
    async fn find_peering(
        &self,
        scope: &NetworkScope,
        request: &PeeringRequest,
    ) -> Result<Option<PeeringConnection>, PeeringError>;

    /// Read-only status query by connection id.
    async fn describe_peering(
        &self,
        scope: &NetworkScope,
        connection_id: &str,
    ) -> Result<Option<PeeringConnection>, PeeringError>;

    /// Accept a pending connection (runs in the peer account).
    async fn accept_peering(
        &self,
        scope: &NetworkScope,
        connection_id: &str,
    ) -> Result<PeeringConnection, PeeringError>;

    /// Delete the connection; an already-absent connection is success.
    async fn delete_peering(
        &self,
        scope: &NetworkScope,
        connection_id: &str,
    ) -> Result<(), PeeringError>;

    async fn describe_routes(
        &self,
        scope: &NetworkScope,
        route_table_id: &str,
    ) -> Result<Vec<RouteEntry>, PeeringError>;

    async fn create_route(
        &self,
        scope: &NetworkScope,
        route: &RouteEntry,
    ) -> Result<(), PeeringError>;

    /// Delete a route by destination; an already-absent route is success.
    async fn delete_route(
        &self,
        scope: &NetworkScope,
        route_table_id: &str,
        destination: &str,
    ) -> Result<(), PeeringError>;
}

/// Throttle codes the provider uses across the EC2 surface.
const THROTTLE_CODES: [&str; 3] = ["Throttling", "RequestLimitExceeded", "RequestThrottled"];

/// `NetworkApi` backed by the provider SDK.
///
/// Clients are built per call from the scope, so delegated credentials can
/// never outlive the invocation that obtained them.
pub struct Ec2NetworkClient {
    op_timeout: Duration,
}

impl Ec2NetworkClient {
    pub fn new(op_timeout: Duration) -> Self {
        Self { op_timeout }
    }

    async fn client(&self, scope: &NetworkScope) -> aws_sdk_ec2::Client {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(scope.region.clone()))
            .timeout_config(
                TimeoutConfig::builder()
                    .operation_timeout(self.op_timeout)
                    .build(),
            );

        if let Some(creds) = &scope.credentials {
            loader = loader.credentials_provider(aws_credential_types::Credentials::new(
                creds.access_key_id.clone(),
                creds.secret_access_key.clone(),
                Some(creds.session_token.clone()),
                None,
                "lornu-peering-broker",
            ));
        }

        aws_sdk_ec2::Client::new(&loader.load().await)
    }
}

fn classify<E>(operation: &'static str, err: SdkError<E>) -> PeeringError
where
    E: ProvideErrorMetadata,
{
    let code = err.code().unwrap_or_default().to_string();
    let message = err
        .message()
        .map(str::to_string)
        .unwrap_or_else(|| format!("{} failed without a provider message", operation));

    if THROTTLE_CODES.contains(&code.as_str()) {
        PeeringError::ProviderThrottled { operation, message }
    } else if code.is_empty() {
        PeeringError::Api { operation, message }
    } else {
        PeeringError::Api {
            operation,
            message: format!("{}: {}", code, message),
        }
    }
}

fn is_not_found<E>(err: &SdkError<E>) -> bool
where
    E: ProvideErrorMetadata,
{
    err.code().is_some_and(|code| code.ends_with(".NotFound"))
}

fn connection_from_sdk(conn: &VpcPeeringConnection) -> Option<PeeringConnection> {
    let connection_id = conn.vpc_peering_connection_id()?.to_string();

    let (status, status_message) = match conn.status() {
        Some(state) => (
            PeeringStatus::from_provider_code(
                state.code().map(|code| code.as_str()).unwrap_or_default(),
            ),
            state.message().map(str::to_string),
        ),
        None => (PeeringStatus::Initiated, None),
    };

    Some(PeeringConnection {
        connection_id,
        status,
        status_message,
    })
}

fn route_target(route: &Route) -> String {
    route
        .vpc_peering_connection_id()
        .or(route.gateway_id())
        .or(route.nat_gateway_id())
        .or(route.transit_gateway_id())
        .or(route.network_interface_id())
        .or(route.instance_id())
        .unwrap_or("unknown")
        .to_string()
}

#[async_trait]
impl NetworkApi for Ec2NetworkClient {
    async fn create_peering(
        &self,
        scope: &NetworkScope,
        request: &PeeringRequest,
    ) -> Result<PeeringConnection, PeeringError> {
        let client = self.client(scope).await;

        let output = client
            .create_vpc_peering_connection()
            .vpc_id(request.local_vpc_id.as_str())
            .peer_vpc_id(request.peer_vpc_id.as_str())
            .peer_owner_id(request.peer_account_id.as_str())
            .peer_region(request.peer_region())
            .send()
            .await
            .map_err(|e| classify("CreateVpcPeeringConnection", e))?;

        let connection = output
            .vpc_peering_connection()
            .and_then(connection_from_sdk)
            .ok_or_else(|| PeeringError::Api {
                operation: "CreateVpcPeeringConnection",
                message: "response carried no connection".to_string(),
            })?;

        info!(
            connection_id = %connection.connection_id,
            local_vpc = %request.local_vpc_id,
            peer_vpc = %request.peer_vpc_id,
            "peering connection requested"
        );

        Ok(connection)
    }

    async fn find_peering(
        &self,
        scope: &NetworkScope,
        request: &PeeringRequest,
    ) -> Result<Option<PeeringConnection>, PeeringError> {
        let client = self.client(scope).await;

        let output = client
            .describe_vpc_peering_connections()
            .filters(
                Filter::builder()
                    .name("requester-vpc-info.vpc-id")
                    .values(request.local_vpc_id.as_str())
                    .build(),
            )
            .filters(
                Filter::builder()
                    .name("accepter-vpc-info.vpc-id")
                    .values(request.peer_vpc_id.as_str())
                    .build(),
            )
            .filters(
                Filter::builder()
                    .name("accepter-vpc-info.owner-id")
                    .values(request.peer_account_id.as_str())
                    .build(),
            )
            .send()
            .await
            .map_err(|e| classify("DescribeVpcPeeringConnections", e))?;

        Ok(output
            .vpc_peering_connections()
            .iter()
            .filter_map(connection_from_sdk)
            .find(|conn| conn.status != PeeringStatus::Deleted))
    }

    async fn describe_peering(
        &self,
        scope: &NetworkScope,
        connection_id: &str,
    ) -> Result<Option<PeeringConnection>, PeeringError> {
        let client = self.client(scope).await;

        match client
            .describe_vpc_peering_connections()
            .vpc_peering_connection_ids(connection_id)
            .send()
            .await
        {
            Ok(output) => Ok(output
                .vpc_peering_connections()
                .first()
                .and_then(connection_from_sdk)),
            Err(err) if is_not_found(&err) => Ok(None),
            Err(err) => Err(classify("DescribeVpcPeeringConnections", err)),
        }
    }

    async fn accept_peering(
        &self,
        scope: &NetworkScope,
        connection_id: &str,
    ) -> Result<PeeringConnection, PeeringError> {
        let client = self.client(scope).await;

        let output = client
            .accept_vpc_peering_connection()
            .vpc_peering_connection_id(connection_id)
            .send()
            .await
            .map_err(|e| classify("AcceptVpcPeeringConnection", e))?;

        let connection = output
            .vpc_peering_connection()
            .and_then(connection_from_sdk)
            .ok_or_else(|| PeeringError::Api {
                operation: "AcceptVpcPeeringConnection",
                message: "response carried no connection state".to_string(),
            })?;

        info!(connection_id, status = %connection.status, "peering connection accepted");
        Ok(connection)
    }

    async fn delete_peering(
        &self,
        scope: &NetworkScope,
        connection_id: &str,
    ) -> Result<(), PeeringError> {
        let client = self.client(scope).await;

        match client
            .delete_vpc_peering_connection()
            .vpc_peering_connection_id(connection_id)
            .send()
            .await
        {
            Ok(_) => {
                info!(connection_id, "peering connection deleted");
                Ok(())
            }
            Err(err) if is_not_found(&err) => {
                debug!(connection_id, "peering connection already gone");
                Ok(())
            }
            Err(err) => Err(classify("DeleteVpcPeeringConnection", err)),
        }
    }

    async fn describe_routes(
        &self,
        scope: &NetworkScope,
        route_table_id: &str,
    ) -> Result<Vec<RouteEntry>, PeeringError> {
        let client = self.client(scope).await;

        match client
            .describe_route_tables()
            .route_table_ids(route_table_id)
            .send()
            .await
        {
            Ok(output) => {
                let mut entries = Vec::new();
                for table in output.route_tables() {
                    for route in table.routes() {
                        let Some(destination) = route.destination_cidr_block() else {
                            continue;
                        };
                        entries.push(RouteEntry {
                            route_table_id: route_table_id.to_string(),
                            destination: destination.to_string(),
                            target: route_target(route),
                        });
                    }
                }
                Ok(entries)
            }
            // A table that no longer exists has no routes left to reconcile.
            Err(err) if is_not_found(&err) => Ok(Vec::new()),
            Err(err) => Err(classify("DescribeRouteTables", err)),
        }
    }

    async fn create_route(
        &self,
        scope: &NetworkScope,
        route: &RouteEntry,
    ) -> Result<(), PeeringError> {
        let client = self.client(scope).await;

        client
            .create_route()
            .route_table_id(route.route_table_id.as_str())
            .destination_cidr_block(route.destination.as_str())
            .vpc_peering_connection_id(route.target.as_str())
            .send()
            .await
            .map_err(|e| classify("CreateRoute", e))?;

        info!(
            route_table_id = %route.route_table_id,
            destination = %route.destination,
            target = %route.target,
            "route created"
        );

        Ok(())
    }

    async fn delete_route(
        &self,
        scope: &NetworkScope,
        route_table_id: &str,
        destination: &str,
    ) -> Result<(), PeeringError> {
        let client = self.client(scope).await;

        match client
            .delete_route()
            .route_table_id(route_table_id)
            .destination_cidr_block(destination)
            .send()
            .await
        {
            Ok(_) => {
                info!(route_table_id, destination, "route deleted");
                Ok(())
            }
            Err(err) if is_not_found(&err) => {
                debug!(route_table_id, destination, "route already gone");
                Ok(())
            }
            Err(err) => Err(classify("DeleteRoute", err)),
        }
    }
}
