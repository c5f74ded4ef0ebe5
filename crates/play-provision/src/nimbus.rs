//! Nimbus adapter: wraps the `nimbus` command-line tool.
//!
//! Child-process output is streamed into a bounded ring buffer and
//! retained in `provider_metadata` for diagnostics. Exit code 0 is
//! success; anything else is a non-retryable provider error.

use crate::{CreateOutcome, CreateSpec, DriverError, HostDescription, HostDriver, RollingBuffer};
use async_trait::async_trait;
use play_proto::{HostProvider, ProviderState, TierSpec};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, info};

/// Lines of CLI output retained per invocation.
const OUTPUT_BUFFER_LINES: usize = 200;
/// Lines of the buffer copied into provider metadata.
const METADATA_TAIL_LINES: usize = 40;

#[derive(Debug)]
pub struct NimbusDriver {
    binary: PathBuf,
    config_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct DescribeOutput {
    status: String,
    #[serde(default)]
    address: Option<String>,
}

struct CliOutcome {
    stdout: String,
    output: RollingBuffer,
}

impl NimbusDriver {
    pub fn new(binary: impl Into<PathBuf>, config_path: Option<PathBuf>) -> Self {
        Self { binary: binary.into(), config_path }
    }

    async fn run(&self, args: &[&str]) -> Result<CliOutcome, DriverError> {
        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.args(args);
        if let Some(config) = &self.config_path {
            cmd.arg("--config").arg(config);
        }
        debug!(binary = %self.binary.display(), ?args, "invoking nimbus CLI");

        let out = cmd
            .output()
            .await
            .map_err(|e| DriverError::provider(false, format!("failed to spawn nimbus CLI: {e}")))?;

        let stdout = String::from_utf8_lossy(&out.stdout).to_string();
        let stderr = String::from_utf8_lossy(&out.stderr).to_string();

        let mut buffer = RollingBuffer::new(OUTPUT_BUFFER_LINES);
        buffer.extend_from_str(&stdout);
        buffer.extend_from_str(&stderr);

        if !out.status.success() {
            if stderr.to_lowercase().contains("not found") {
                return Err(DriverError::NotFound);
            }
            return Err(DriverError::provider(
                false,
                format!(
                    "nimbus {} exited with {}: {}",
                    args.first().unwrap_or(&"?"),
                    out.status,
                    buffer.tail(5),
                ),
            ));
        }

        Ok(CliOutcome { stdout, output: buffer })
    }
}

#[async_trait]
impl HostDriver for NimbusDriver {
    fn provider(&self) -> HostProvider {
        HostProvider::Nimbus
    }

    async fn create(&self, spec: &CreateSpec) -> Result<CreateOutcome, DriverError> {
        let region = spec
            .region
            .as_deref()
            .ok_or_else(|| DriverError::provider(false, "Nimbus create requires a region"))?;

        let tier_spec = TierSpec::for_tier(spec.tier);
        let cpu = tier_spec.vcpu.to_string();
        let memory = tier_spec.memory_gib.to_string();
        let timeout = spec.auto_stop_timeout_secs.to_string();
        info!(name = %spec.name, region, tier = %spec.tier, "creating Nimbus instance");

        let outcome = self
            .run(&[
                "create",
                "--name", &spec.name,
                "--cpu", &cpu,
                "--memory", &memory,
                "--region", region,
                "--auto-stop-timeout", &timeout,
            ])
            .await?;

        let mut metadata = HashMap::new();
        metadata.insert("region".to_string(), region.to_string());
        metadata.insert("cli_output".to_string(), outcome.output.tail(METADATA_TAIL_LINES));

        // The CLI addresses instances by name.
        Ok(CreateOutcome {
            provider_handle: spec.name.clone(),
            provider_metadata: metadata,
        })
    }

    async fn describe(&self, handle: &str) -> Result<HostDescription, DriverError> {
        let outcome = self.run(&["describe", "--name", handle, "--output", "json"]).await?;

        let parsed: DescribeOutput = serde_json::from_str(outcome.stdout.trim())
            .map_err(|e| DriverError::provider(false, format!("describe output parse failed: {e}")))?;

        Ok(HostDescription {
            provider_state: self.translate(&parsed.status),
            address: parsed.address,
        })
    }

    async fn start(&self, handle: &str) -> Result<(), DriverError> {
        self.run(&["start", "--name", handle]).await?;
        Ok(())
    }

    async fn stop(&self, handle: &str) -> Result<(), DriverError> {
        self.run(&["stop", "--name", handle]).await?;
        Ok(())
    }

    async fn destroy(&self, handle: &str) -> Result<(), DriverError> {
        match self.run(&["destroy", "--name", handle, "--yes"]).await {
            Ok(_) | Err(DriverError::NotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn translate(&self, provider_state: &str) -> ProviderState {
        match provider_state {
            "provisioning" | "starting" => ProviderState::Creating,
            "running" => ProviderState::Running,
            "stopped" => ProviderState::Stopped,
            "destroyed" | "absent" => ProviderState::Destroyed,
            "error" => ProviderState::Failed,
            _ => ProviderState::Unknown,
        }
    }
}
