//! Peering Lifecycle Types
//!
//! Core types for the cross-account peering lifecycle: the inbound
//! notification contract, the declared peering intent, the provider-side
//! connection state, and the error taxonomy shared by every component.

use std::env;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Lifecycle operation requested by the external controller.
///
/// Decoding rejects any tag outside these three; the controller contract is
/// closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestType {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for RequestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestType::Create => write!(f, "Create"),
            RequestType::Update => write!(f, "Update"),
            RequestType::Delete => write!(f, "Delete"),
        }
    }
}

/// A single lifecycle notification, consumed exactly once per attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEvent {
    pub request_type: RequestType,
    /// Present on Update/Delete; absent on the first Create.
    #[serde(default)]
    pub physical_resource_id: Option<String>,
    pub resource_properties: PeeringRequest,
    /// Seconds the controller will wait for a response before giving up.
    pub response_deadline_seconds: u64,
}

/// The declared peering intent.
///
/// Immutable once submitted for a given physical identity: peering
/// connections cannot be re-parented, so any field change produces a new
/// identity and the controller replaces the resource instead of mutating it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeeringRequest {
    pub local_vpc_id: String,
    pub local_account_id: String,
    pub local_region: String,
    pub local_cidr: Ipv4Network,
    /// Route tables on the local side that need a route to the peer range.
    #[serde(default)]
    pub local_route_table_ids: Vec<String>,
    pub peer_vpc_id: String,
    pub peer_account_id: String,
    /// Defaults to the local region when unset.
    #[serde(default)]
    pub peer_region: Option<String>,
    pub peer_cidr: Ipv4Network,
    #[serde(default)]
    pub peer_route_table_ids: Vec<String>,
    /// Role in the peer account that this agent is trusted to assume.
    pub peer_role_arn: String,
}

impl PeeringRequest {
    pub fn peer_region(&self) -> &str {
        self.peer_region.as_deref().unwrap_or(&self.local_region)
    }

    pub fn ranges_overlap(&self) -> bool {
        self.local_cidr.overlaps(self.peer_cidr)
    }

    /// Stable physical identity for this request.
    ///
    /// A digest over every field, so retried Creates resolve to the same
    /// identity while any property change yields a new one (replacement
    /// semantics on Update).
    pub fn physical_id(&self) -> String {
        let local_cidr = self.local_cidr.to_string();
        let peer_cidr = self.peer_cidr.to_string();
        let local_tables = self.local_route_table_ids.join(",");
        let peer_tables = self.peer_route_table_ids.join(",");

        let mut hasher = Sha256::new();
        for field in [
            self.local_vpc_id.as_str(),
            self.local_account_id.as_str(),
            self.local_region.as_str(),
            local_cidr.as_str(),
            local_tables.as_str(),
            self.peer_vpc_id.as_str(),
            self.peer_account_id.as_str(),
            self.peer_region(),
            peer_cidr.as_str(),
            peer_tables.as_str(),
            self.peer_role_arn.as_str(),
        ] {
            hasher.update(field.as_bytes());
            hasher.update(b"\n");
        }

        let digest = hasher.finalize();
        let short: String = digest.iter().take(4).map(|b| format!("{b:02x}")).collect();

        format!("peering-{}-{}-{}", self.local_vpc_id, self.peer_vpc_id, short)
    }
}

/// Status of a provider-side peering connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PeeringStatus {
    Initiated,
    PendingAcceptance,
    Active,
    Failed,
    Deleted,
}

impl PeeringStatus {
    /// Collapse the provider's state codes onto the lifecycle states this
    /// agent reasons about. `provisioning` follows acceptance and carries
    /// traffic, so it counts as active; terminal provider states that cannot
    /// be advanced map to failed.
    pub fn from_provider_code(code: &str) -> Self {
        match code {
            "initiating-request" => PeeringStatus::Initiated,
            "pending-acceptance" => PeeringStatus::PendingAcceptance,
            "provisioning" | "active" => PeeringStatus::Active,
            "deleting" | "deleted" => PeeringStatus::Deleted,
            _ => PeeringStatus::Failed,
        }
    }
}

impl std::fmt::Display for PeeringStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeeringStatus::Initiated => write!(f, "initiated"),
            PeeringStatus::PendingAcceptance => write!(f, "pending-acceptance"),
            PeeringStatus::Active => write!(f, "active"),
            PeeringStatus::Failed => write!(f, "failed"),
            PeeringStatus::Deleted => write!(f, "deleted"),
        }
    }
}

/// The provider-side peering object, reduced to the fields this agent needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeeringConnection {
    /// Provider-assigned identifier, stable for the resource's lifetime.
    pub connection_id: String,
    pub status: PeeringStatus,
    #[serde(default)]
    pub status_message: Option<String>,
}

/// A single routing-table row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub route_table_id: String,
    /// Destination address range, canonical CIDR notation.
    pub destination: String,
    /// Whatever the row points at: a peering connection, gateway, or `local`.
    pub target: String,
}

/// What reconciliation did to one route table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteAction {
    Created,
    Unchanged,
    Removed,
    AlreadyAbsent,
    /// Row under the owned destination belongs to someone else; left alone.
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteSyncResult {
    pub route_table_id: String,
    pub destination: String,
    pub action: RouteAction,
}

/// Outcome of driving a connection through acceptance.
#[derive(Debug, Clone)]
pub struct AcceptedStatus {
    pub connection_id: String,
    pub accepted_at: DateTime<Utc>,
    /// True when a prior attempt already accepted it and we only observed.
    pub already_active: bool,
    /// Describe attempts spent, including visibility-lag retries.
    pub attempts: u32,
}

/// Terminal response emitted exactly once per invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleResponse {
    pub status: ResponseStatus,
    pub physical_resource_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<PeeringOutputs>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    Success,
    Failed,
}

impl LifecycleResponse {
    pub fn success(physical_resource_id: String, data: Option<PeeringOutputs>) -> Self {
        Self {
            status: ResponseStatus::Success,
            physical_resource_id,
            reason: None,
            data,
        }
    }

    pub fn failed(physical_resource_id: String, reason: String) -> Self {
        Self {
            status: ResponseStatus::Failed,
            physical_resource_id,
            reason: Some(reason),
            data: None,
        }
    }
}

/// Output data published with a successful Create/Update response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeeringOutputs {
    pub connection_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accepted_at: Option<DateTime<Utc>>,
    pub routes_reconciled: usize,
}

/// Error taxonomy shared by every component.
///
/// Fatal configuration errors are never retried; transient provider errors
/// are retried with bounded backoff; already-achieved end states are not
/// errors at all and never reach this type.
#[derive(Debug, Error)]
pub enum PeeringError {
    #[error("peer account trust denied: {0}")]
    TrustDenied(String),

    #[error("credential broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("address ranges overlap: {local} and {peer} cannot be peered")]
    InvalidTopology { local: Ipv4Network, peer: Ipv4Network },

    #[error("provider throttled {operation}: {message}")]
    ProviderThrottled {
        operation: &'static str,
        message: String,
    },

    #[error("route table {route_table_id} already routes {destination} to {existing_target}")]
    RouteConflict {
        route_table_id: String,
        destination: String,
        existing_target: String,
    },

    #[error("peering connection {connection_id} was not accepted within {waited_ms} ms")]
    AcceptanceTimeout {
        connection_id: String,
        waited_ms: u128,
    },

    #[error("invocation deadline exceeded during {0}")]
    DeadlineExceeded(&'static str),

    #[error("provider api error in {operation}: {message}")]
    Api {
        operation: &'static str,
        message: String,
    },
}

impl PeeringError {
    /// Transient errors are retried by the acceptor and reconciler; anything
    /// else propagates immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PeeringError::BrokerUnavailable(_) | PeeringError::ProviderThrottled { .. }
        )
    }
}

/// Wall-clock budget for one invocation.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn in_seconds(seconds: u64) -> Self {
        Self::in_duration(Duration::from_secs(seconds))
    }

    pub fn in_duration(duration: Duration) -> Self {
        Self {
            at: Instant::now() + duration,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// A deadline `margin` earlier, clamped to now.
    pub fn shortened_by(&self, margin: Duration) -> Self {
        Self {
            at: self.at.checked_sub(margin).unwrap_or_else(Instant::now),
        }
    }
}

/// Exponential backoff with a ceiling.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl BackoffPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.cap)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            cap: Duration::from_secs(30),
        }
    }
}

/// Agent configuration.
///
/// Provider propagation latency varies by region pair, so the backoff
/// ceiling is configurable rather than hard-coded.
#[derive(Debug, Clone)]
pub struct PeeringConfig {
    pub backoff: BackoffPolicy,
    /// Reserved slice of the deadline for emitting the response.
    pub safety_margin: Duration,
    /// Timeout applied to each individual provider call.
    pub op_timeout: Duration,
    pub max_transient_retries: u32,
}

impl Default for PeeringConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            safety_margin: Duration::from_secs(5),
            op_timeout: Duration::from_secs(30),
            max_transient_retries: 4,
        }
    }
}

impl PeeringConfig {
    /// Read overrides from `LORNU_PEERING_*` (injected by the deployment,
    /// not hardcoded).
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            backoff: BackoffPolicy {
                base: env_duration_ms("LORNU_PEERING_BACKOFF_BASE_MS", defaults.backoff.base),
                cap: env_duration_ms("LORNU_PEERING_BACKOFF_CAP_MS", defaults.backoff.cap),
            },
            safety_margin: env_duration_ms(
                "LORNU_PEERING_SAFETY_MARGIN_MS",
                defaults.safety_margin,
            ),
            op_timeout: env_duration_ms("LORNU_PEERING_OP_TIMEOUT_MS", defaults.op_timeout),
            max_transient_retries: env::var("LORNU_PEERING_MAX_TRANSIENT_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_transient_retries),
        }
    }
}

fn env_duration_ms(name: &str, default: Duration) -> Duration {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}
