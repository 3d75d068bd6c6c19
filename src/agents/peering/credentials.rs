//! Delegated Credential Broker
//!
//! Exchanges a peer account's delegated-trust role for temporary, scoped
//! credentials via STS `AssumeRoleWithWebIdentity`, using the workload's
//! projected OIDC token. No static keys; credentials are short-lived values
//! threaded as parameters and never cached across invocations.

use std::env;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::info;

use super::types::PeeringError;

/// Standard K8s projected token path, used when the runtime does not inject
/// `AWS_WEB_IDENTITY_TOKEN_FILE`.
const DEFAULT_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

/// STS enforces a 900s session floor; requests below it are clamped up.
const MIN_SESSION_SECS: u64 = 900;
const MAX_SESSION_SECS: u64 = 3600;

/// Time-boxed credentials for acting inside the peer account.
///
/// Scoped to the single invocation they were requested for; the secret
/// material is excluded from `Debug` so it cannot reach logs.
#[derive(Clone)]
pub struct DelegatedCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub expires_at: Instant,
}

impl DelegatedCredentials {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    pub fn time_until_expiry(&self) -> Duration {
        self.expires_at
            .checked_duration_since(Instant::now())
            .unwrap_or(Duration::ZERO)
    }
}

impl std::fmt::Debug for DelegatedCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegatedCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Seam for obtaining delegated credentials.
#[async_trait]
pub trait CredentialBroker: Send + Sync {
    /// Exchange the delegated-trust role in `account_id` for temporary
    /// credentials. `TrustDenied` is fatal and never retried;
    /// `BrokerUnavailable` is transient.
    async fn delegated_credentials(
        &self,
        account_id: &str,
        role_arn: &str,
        session_name: &str,
        ttl: Duration,
    ) -> Result<DelegatedCredentials, PeeringError>;
}

/// STS AssumeRoleWithWebIdentity response
#[derive(Debug, Deserialize)]
struct AssumeRoleResponse {
    #[serde(rename = "AssumeRoleWithWebIdentityResult")]
    result: AssumeRoleResult,
}

#[derive(Debug, Deserialize)]
struct AssumeRoleResult {
    #[serde(rename = "Credentials")]
    credentials: StsCredentials,
}

#[derive(Debug, Deserialize)]
struct StsCredentials {
    #[serde(rename = "AccessKeyId")]
    access_key_id: String,
    #[serde(rename = "SecretAccessKey")]
    secret_access_key: String,
    #[serde(rename = "SessionToken")]
    session_token: String,
}

/// STS error envelope
#[derive(Debug, Deserialize)]
struct StsErrorResponse {
    #[serde(rename = "Error")]
    error: StsError,
}

#[derive(Debug, Deserialize)]
struct StsError {
    #[serde(rename = "Code")]
    code: String,
    #[serde(rename = "Message")]
    message: String,
}

/// Credential broker backed by STS web-identity federation.
///
/// The peer account's role trusts this workload's OIDC identity, so the
/// exchange needs no signing credentials of its own.
pub struct StsCredentialBroker {
    http_client: Client,
    sts_region: String,
    token_path: String,
}

impl StsCredentialBroker {
    pub fn new(sts_region: &str) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let token_path = env::var("AWS_WEB_IDENTITY_TOKEN_FILE")
            .unwrap_or_else(|_| DEFAULT_TOKEN_PATH.to_string());

        Ok(Self {
            http_client,
            sts_region: sts_region.to_string(),
            token_path,
        })
    }

    fn web_identity_token(&self) -> Result<String, PeeringError> {
        std::fs::read_to_string(&self.token_path)
            .map(|token| token.trim().to_string())
            .map_err(|e| {
                PeeringError::BrokerUnavailable(format!(
                    "cannot read web identity token from {}: {}",
                    self.token_path, e
                ))
            })
    }
}

#[async_trait]
impl CredentialBroker for StsCredentialBroker {
    async fn delegated_credentials(
        &self,
        account_id: &str,
        role_arn: &str,
        session_name: &str,
        ttl: Duration,
    ) -> Result<DelegatedCredentials, PeeringError> {
        // Guard against operating in the wrong account: the role must live
        // in the account the caller asked for.
        if !role_arn.contains(account_id) {
            return Err(PeeringError::TrustDenied(format!(
                "role {} does not belong to account {}",
                role_arn, account_id
            )));
        }

        let token = self.web_identity_token()?;
        let duration_secs = ttl.as_secs().clamp(MIN_SESSION_SECS, MAX_SESSION_SECS);
        let session = sanitize_session_name(session_name);

        let sts_url = format!(
            "https://sts.{}.amazonaws.com/?Action=AssumeRoleWithWebIdentity&Version=2011-06-15&RoleArn={}&RoleSessionName={}&DurationSeconds={}&WebIdentityToken={}",
            self.sts_region,
            urlencoding::encode(role_arn),
            urlencoding::encode(&session),
            duration_secs,
            urlencoding::encode(&token)
        );

        let response = self
            .http_client
            .get(&sts_url)
            .send()
            .await
            .map_err(|e| PeeringError::BrokerUnavailable(format!("STS call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = match quick_xml::de::from_str::<StsErrorResponse>(&body) {
                Ok(parsed) => format!("{}: {}", parsed.error.code, parsed.error.message),
                Err(_) => format!("STS returned {}", status),
            };

            // Throttling comes back as a 4xx; it will resolve, unlike a
            // trust-policy rejection.
            if status.is_server_error() || detail.contains("Throttl") {
                return Err(PeeringError::BrokerUnavailable(detail));
            }
            return Err(PeeringError::TrustDenied(detail));
        }

        let body = response
            .text()
            .await
            .map_err(|e| PeeringError::BrokerUnavailable(format!("STS response unreadable: {}", e)))?;

        let parsed: AssumeRoleResponse = quick_xml::de::from_str(&body).map_err(|e| {
            PeeringError::BrokerUnavailable(format!("unexpected STS response: {}", e))
        })?;

        let creds = parsed.result.credentials;

        info!(
            role = %role_arn,
            account = %account_id,
            session = %session,
            ttl_secs = duration_secs,
            "delegated credentials issued"
        );

        Ok(DelegatedCredentials {
            access_key_id: creds.access_key_id,
            secret_access_key: creds.secret_access_key,
            session_token: creds.session_token,
            expires_at: Instant::now() + Duration::from_secs(duration_secs),
        })
    }
}

/// STS restricts session names to `[\w+=,.@-]` and 64 characters.
fn sanitize_session_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || "+=,.@-_".contains(*c))
        .take(64)
        .collect()
}
