//! Parameter Store Publication
//!
//! One-way publication of provisioned connection identifiers so downstream
//! infrastructure can discover them. Nothing in this crate reads the values
//! back; the provider's state stays the single source of truth.

use anyhow::{Context, Result};
use aws_config::{BehaviorVersion, Region};
use tracing::info;

pub struct ParameterStoreTool {
    client: aws_sdk_ssm::Client,
    prefix: String,
}

impl ParameterStoreTool {
    /// Create a tool publishing under `prefix` (e.g. `/lornu/peering`).
    pub async fn new(region: &str, prefix: &str) -> Result<Self> {
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await;

        Ok(Self {
            client: aws_sdk_ssm::Client::new(&config),
            prefix: prefix.trim_end_matches('/').to_string(),
        })
    }

    pub async fn publish_connection_id(
        &self,
        physical_id: &str,
        connection_id: &str,
    ) -> Result<()> {
        let name = format!("{}/{}/connection-id", self.prefix, physical_id);

        self.client
            .put_parameter()
            .name(name.as_str())
            .value(connection_id)
            .r#type(aws_sdk_ssm::types::ParameterType::String)
            .overwrite(true)
            .send()
            .await
            .with_context(|| format!("Failed to publish parameter {}", name))?;

        info!(parameter = %name, connection_id, "published connection id");
        Ok(())
    }
}
