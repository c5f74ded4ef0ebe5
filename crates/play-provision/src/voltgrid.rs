//! Voltgrid adapter: REST GPU marketplace with bearer-token auth.
//!
//! The create call requires an explicit inventory node chosen by the
//! placement optimizer; Voltgrid does not pick locations itself.

use crate::{CreateOutcome, CreateSpec, DriverError, HostDescription, HostDriver};
use async_trait::async_trait;
use play_placement::InventoryNode;
use play_proto::{HostProvider, ProviderState, TierSpec};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::info;

#[derive(Debug)]
pub struct VoltgridDriver {
    base_url: String,
    api_token: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct InventoryResponse {
    nodes: Vec<InventoryNode>,
}

#[derive(Debug, Deserialize)]
struct InstanceEnvelope {
    instance: Instance,
}

#[derive(Debug, Deserialize)]
struct Instance {
    id: String,
    status: String,
    #[serde(default)]
    address: Option<String>,
}

impl VoltgridDriver {
    pub fn new(base_url: &str, api_token: &str) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(60))
            .build()
            .expect("failed to build HTTP client");
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token: api_token.to_string(),
            client,
        }
    }

    async fn instance_action(&self, handle: &str, action: &str) -> Result<(), DriverError> {
        let url = format!("{}/instances/{}/{}", self.base_url, handle, action);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(transport_error)?;
        check_status(resp)?;
        Ok(())
    }
}

#[async_trait]
impl HostDriver for VoltgridDriver {
    fn provider(&self) -> HostProvider {
        HostProvider::Voltgrid
    }

    /// Full marketplace inventory, consumed by the placement optimizer.
    async fn list_inventory(&self) -> Result<Vec<InventoryNode>, DriverError> {
        let url = format!("{}/inventory", self.base_url);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(transport_error)?;
        let resp = check_status(resp)?;

        let body: InventoryResponse = resp
            .json()
            .await
            .map_err(|e| DriverError::provider(true, format!("inventory parse failed: {e}")))?;
        info!(count = body.nodes.len(), "listed Voltgrid inventory");
        Ok(body.nodes)
    }

    async fn create(&self, spec: &CreateSpec) -> Result<CreateOutcome, DriverError> {
        let node_id = spec
            .node_id
            .as_deref()
            .ok_or_else(|| DriverError::provider(false, "Voltgrid create requires an inventory node"))?;

        let tier_spec = TierSpec::for_tier(spec.tier);
        info!(name = %spec.name, node_id, tier = %spec.tier, "creating Voltgrid instance");

        let body = serde_json::json!({
            "name": spec.name,
            "node_id": node_id,
            "vcpu": tier_spec.vcpu,
            "memory_gib": tier_spec.memory_gib,
            "gpu_count": tier_spec.gpu_count,
            "image": "ubuntu-22.04-cuda",
            "ssh_key": spec.ssh_key,
            "tags": spec.tags,
        });

        let url = format!("{}/instances", self.base_url);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let resp = check_status(resp)?;

        let envelope: InstanceEnvelope = resp
            .json()
            .await
            .map_err(|e| DriverError::provider(false, format!("create response parse failed: {e}")))?;

        let mut metadata = HashMap::new();
        metadata.insert("node_id".to_string(), node_id.to_string());
        metadata.insert("initial_status".to_string(), envelope.instance.status.clone());

        info!(handle = %envelope.instance.id, "Voltgrid instance accepted");
        Ok(CreateOutcome {
            provider_handle: envelope.instance.id,
            provider_metadata: metadata,
        })
    }

    async fn describe(&self, handle: &str) -> Result<HostDescription, DriverError> {
        let url = format!("{}/instances/{}", self.base_url, handle);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(transport_error)?;
        let resp = check_status(resp)?;

        let envelope: InstanceEnvelope = resp
            .json()
            .await
            .map_err(|e| DriverError::provider(true, format!("describe parse failed: {e}")))?;

        Ok(HostDescription {
            provider_state: self.translate(&envelope.instance.status),
            address: envelope.instance.address,
        })
    }

    async fn start(&self, handle: &str) -> Result<(), DriverError> {
        self.instance_action(handle, "start").await
    }

    async fn stop(&self, handle: &str) -> Result<(), DriverError> {
        self.instance_action(handle, "stop").await
    }

    async fn destroy(&self, handle: &str) -> Result<(), DriverError> {
        let url = format!("{}/instances/{}", self.base_url, handle);
        let resp = self
            .client
            .delete(&url)
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(transport_error)?;

        // Already gone counts as success.
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_status(resp)?;
        Ok(())
    }

    async fn configure_environment(&self, handle: &str, address: &str) -> Result<(), DriverError> {
        // Marketplace nodes boot a bare CUDA image; trigger the remote
        // streaming-stack install against the fresh host.
        info!(handle, address, "triggering Voltgrid environment setup");
        let url = format!("{}/instances/{}/setup", self.base_url, handle);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(&serde_json::json!({ "address": address }))
            .send()
            .await
            .map_err(transport_error)?;
        check_status(resp)?;
        Ok(())
    }

    fn translate(&self, provider_state: &str) -> ProviderState {
        match provider_state {
            "building" => ProviderState::Creating,
            "active" | "running" => ProviderState::Running,
            "stopped" => ProviderState::Stopped,
            "error" => ProviderState::Failed,
            "deleted" => ProviderState::Destroyed,
            _ => ProviderState::Unknown,
        }
    }
}

fn transport_error(e: reqwest::Error) -> DriverError {
    DriverError::provider(true, format!("Voltgrid request failed: {e}"))
}

/// Map HTTP status: 404 → NotFound, other 4xx → non-retryable, 5xx →
/// retryable.
fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, DriverError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(DriverError::NotFound);
    }
    Err(DriverError::provider(
        status.is_server_error(),
        format!("Voltgrid returned {status}"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translate_known_statuses() {
        let driver = VoltgridDriver::new("https://api.voltgrid.example", "token");
        assert_eq!(driver.translate("building"), ProviderState::Creating);
        assert_eq!(driver.translate("active"), ProviderState::Running);
        assert_eq!(driver.translate("running"), ProviderState::Running);
        assert_eq!(driver.translate("stopped"), ProviderState::Stopped);
        assert_eq!(driver.translate("error"), ProviderState::Failed);
        assert_eq!(driver.translate("deleted"), ProviderState::Destroyed);
    }

    #[test]
    fn test_translate_unknown_status() {
        let driver = VoltgridDriver::new("https://api.voltgrid.example", "token");
        assert_eq!(driver.translate("rebalancing"), ProviderState::Unknown);
        assert_eq!(driver.translate(""), ProviderState::Unknown);
    }

    #[tokio::test]
    async fn test_create_without_node_is_rejected() {
        let driver = VoltgridDriver::new("http://127.0.0.1:1", "token");
        let spec = CreateSpec {
            name: "h-1".to_string(),
            tier: play_proto::Tier::Plus,
            node_id: None,
            region: None,
            ssh_key: None,
            auto_stop_timeout_secs: 900,
            tags: HashMap::new(),
        };
        let result = driver.create(&spec).await;
        assert!(matches!(result, Err(DriverError::Provider { retryable: false, .. })));
    }

    #[tokio::test]
    async fn test_transport_failure_is_retryable() {
        let driver = VoltgridDriver::new("http://127.0.0.1:1", "token");
        let result = driver.describe("vg-1").await;
        match result {
            Err(DriverError::Provider { retryable, .. }) => assert!(retryable),
            other => panic!("expected retryable provider error, got {other:?}"),
        }
    }
}
