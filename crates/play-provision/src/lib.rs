//! Multi-provider host drivers for PlayOps.
//!
//! Both providers implement the same [`HostDriver`] contract: Voltgrid
//! speaks a REST inventory + instances API, Nimbus wraps a command-line
//! tool. Adapters perform no retries; retry policy lives in the
//! orchestrator.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use play_proto::{HostProvider, ProviderState};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

mod nimbus;
mod voltgrid;

pub use nimbus::NimbusDriver;
pub use voltgrid::VoltgridDriver;

/// How often `wait_ready` re-polls `describe`.
const WAIT_READY_POLL: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("host not found at provider")]
    NotFound,

    #[error("timed out waiting for host readiness")]
    Timeout,

    #[error("provider error: {message}")]
    Provider { retryable: bool, message: String },
}

impl DriverError {
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Provider { retryable: true, .. })
    }

    pub fn provider(retryable: bool, message: impl Into<String>) -> Self {
        Self::Provider { retryable, message: message.into() }
    }
}

// ─── Driver contract ─────────────────────────────────────────────────────────

/// Create-call inputs. Exactly one of `node_id` (Voltgrid) or `region`
/// (Nimbus) is set by the optimizer.
#[derive(Debug, Clone)]
pub struct CreateSpec {
    pub name: String,
    pub tier: play_proto::Tier,
    pub node_id: Option<String>,
    pub region: Option<String>,
    pub ssh_key: Option<String>,
    pub auto_stop_timeout_secs: u64,
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct CreateOutcome {
    pub provider_handle: String,
    pub provider_metadata: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct HostDescription {
    pub provider_state: ProviderState,
    pub address: Option<String>,
}

#[async_trait]
pub trait HostDriver: Send + Sync + std::fmt::Debug {
    fn provider(&self) -> HostProvider;

    /// Marketplace inventory for placement ranking. Only inventory-based
    /// providers override this; region-based providers have none.
    async fn list_inventory(&self) -> Result<Vec<play_placement::InventoryNode>, DriverError> {
        Ok(Vec::new())
    }

    async fn create(&self, spec: &CreateSpec) -> Result<CreateOutcome, DriverError>;

    async fn describe(&self, handle: &str) -> Result<HostDescription, DriverError>;

    async fn start(&self, handle: &str) -> Result<(), DriverError>;

    async fn stop(&self, handle: &str) -> Result<(), DriverError>;

    /// Idempotent: destroying an already-absent host succeeds.
    async fn destroy(&self, handle: &str) -> Result<(), DriverError>;

    /// Post-create environment setup against the reachable host.
    /// Default is a no-op (Nimbus images ship preconfigured).
    async fn configure_environment(&self, _handle: &str, _address: &str) -> Result<(), DriverError> {
        Ok(())
    }

    /// Translate a vendor status string into the shared vocabulary.
    /// Total: unrecognized strings map to `Unknown`.
    fn translate(&self, provider_state: &str) -> ProviderState;

    /// Poll `describe` until the host is running with an address, every
    /// 10 s, bounded by `max_wait`. `max_wait` of zero times out without
    /// issuing a describe call.
    async fn wait_ready(&self, handle: &str, max_wait: Duration) -> Result<HostDescription, DriverError> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(DriverError::Timeout);
            }

            let desc = self.describe(handle).await?;
            if desc.provider_state == ProviderState::Running && desc.address.is_some() {
                return Ok(desc);
            }
            if matches!(desc.provider_state, ProviderState::Failed | ProviderState::Destroyed) {
                return Err(DriverError::provider(
                    false,
                    format!("host entered {:?} while waiting for readiness", desc.provider_state),
                ));
            }
            debug!(handle, state = ?desc.provider_state, "waiting for host readiness");

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            tokio::time::sleep(WAIT_READY_POLL.min(remaining)).await;
        }
    }
}

// ─── Driver registry ─────────────────────────────────────────────────────────

/// Long-lived driver handles, one per enabled provider. Owned by the
/// orchestrator and shared with the supervisor.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: HashMap<HostProvider, Arc<dyn HostDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self { drivers: HashMap::new() }
    }

    pub fn register(&mut self, driver: Arc<dyn HostDriver>) {
        tracing::info!(provider = %driver.provider(), "registering host driver");
        self.drivers.insert(driver.provider(), driver);
    }

    pub fn get(&self, provider: HostProvider) -> Option<Arc<dyn HostDriver>> {
        self.drivers.get(&provider).cloned()
    }

    pub fn is_enabled(&self, provider: HostProvider) -> bool {
        self.drivers.contains_key(&provider)
    }

    pub fn providers(&self) -> Vec<HostProvider> {
        self.drivers.keys().copied().collect()
    }
}

// ─── Rolling output buffer ───────────────────────────────────────────────────

/// Fixed-capacity line buffer for child-process output. Oldest lines are
/// evicted so a chatty CLI cannot grow memory without bound.
pub struct RollingBuffer {
    capacity: usize,
    lines: VecDeque<String>,
}

impl RollingBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be > 0");
        Self { capacity, lines: VecDeque::with_capacity(capacity) }
    }

    pub fn push_line(&mut self, line: impl Into<String>) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.into());
    }

    pub fn extend_from_str(&mut self, text: &str) {
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            self.push_line(line);
        }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Newest-last joined view, suitable for `provider_metadata`.
    pub fn joined(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    /// The last `n` lines, newest last.
    pub fn tail(&self, n: usize) -> String {
        let skip = self.lines.len().saturating_sub(n);
        self.lines.iter().skip(skip).cloned().collect::<Vec<_>>().join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug)]
    struct ScriptedDriver {
        describes: Mutex<Vec<HostDescription>>,
    }

    impl ScriptedDriver {
        fn new(describes: Vec<HostDescription>) -> Self {
            Self { describes: Mutex::new(describes) }
        }
    }

    #[async_trait]
    impl HostDriver for ScriptedDriver {
        fn provider(&self) -> HostProvider {
            HostProvider::Voltgrid
        }

        async fn create(&self, _spec: &CreateSpec) -> Result<CreateOutcome, DriverError> {
            Ok(CreateOutcome {
                provider_handle: "vg-1".to_string(),
                provider_metadata: HashMap::new(),
            })
        }

        async fn describe(&self, _handle: &str) -> Result<HostDescription, DriverError> {
            let mut seq = self.describes.lock();
            if seq.len() > 1 {
                Ok(seq.remove(0))
            } else {
                seq.first().cloned().ok_or(DriverError::NotFound)
            }
        }

        async fn start(&self, _handle: &str) -> Result<(), DriverError> {
            Ok(())
        }

        async fn stop(&self, _handle: &str) -> Result<(), DriverError> {
            Ok(())
        }

        async fn destroy(&self, _handle: &str) -> Result<(), DriverError> {
            Ok(())
        }

        fn translate(&self, s: &str) -> ProviderState {
            match s {
                "running" => ProviderState::Running,
                _ => ProviderState::Unknown,
            }
        }
    }

    fn desc(state: ProviderState, address: Option<&str>) -> HostDescription {
        HostDescription { provider_state: state, address: address.map(String::from) }
    }

    #[tokio::test]
    async fn test_wait_ready_zero_wait_times_out_immediately() {
        let driver = ScriptedDriver::new(vec![desc(ProviderState::Running, Some("10.0.0.5"))]);
        let result = driver.wait_ready("vg-1", Duration::ZERO).await;
        assert!(matches!(result, Err(DriverError::Timeout)));
        // No describe was consumed.
        assert_eq!(driver.describes.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_wait_ready_returns_once_running_with_address() {
        let driver = ScriptedDriver::new(vec![desc(ProviderState::Running, Some("10.0.0.5"))]);
        let d = driver.wait_ready("vg-1", Duration::from_secs(60)).await.expect("ready");
        assert_eq!(d.address.as_deref(), Some("10.0.0.5"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_ready_polls_until_address_appears() {
        let driver = ScriptedDriver::new(vec![
            desc(ProviderState::Creating, None),
            desc(ProviderState::Running, None),
            desc(ProviderState::Running, Some("10.0.0.9")),
        ]);
        let d = driver.wait_ready("vg-1", Duration::from_secs(120)).await.expect("ready");
        assert_eq!(d.address.as_deref(), Some("10.0.0.9"));
    }

    #[tokio::test]
    async fn test_wait_ready_fails_fast_on_terminal_provider_state() {
        let driver = ScriptedDriver::new(vec![desc(ProviderState::Failed, None)]);
        let result = driver.wait_ready("vg-1", Duration::from_secs(60)).await;
        assert!(matches!(result, Err(DriverError::Provider { retryable: false, .. })));
    }

    #[test]
    fn test_registry_register_and_get() {
        let mut registry = DriverRegistry::new();
        assert!(!registry.is_enabled(HostProvider::Voltgrid));

        registry.register(Arc::new(ScriptedDriver::new(vec![])));
        assert!(registry.is_enabled(HostProvider::Voltgrid));
        assert!(registry.get(HostProvider::Voltgrid).is_some());
        assert!(registry.get(HostProvider::Nimbus).is_none());
    }

    #[test]
    fn test_rolling_buffer_evicts_oldest() {
        let mut buf = RollingBuffer::new(3);
        for i in 1..=5 {
            buf.push_line(format!("line-{i}"));
        }
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.joined(), "line-3\nline-4\nline-5");
    }

    #[test]
    fn test_rolling_buffer_tail() {
        let mut buf = RollingBuffer::new(10);
        buf.extend_from_str("a\nb\n\nc\n");
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.tail(2), "b\nc");
        assert_eq!(buf.tail(99), "a\nb\nc");
    }

    #[test]
    fn test_driver_error_retryable() {
        assert!(DriverError::provider(true, "503").retryable());
        assert!(!DriverError::provider(false, "400").retryable());
        assert!(!DriverError::NotFound.retryable());
        assert!(!DriverError::Timeout.retryable());
    }
}
