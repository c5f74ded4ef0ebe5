//! Health supervisor for the PlayOps fleet.
//!
//! Two periodic passes share one scheduler task: a minute-scale liveness
//! sweep (agent probes, idle enforcement, session ceilings, spend caps)
//! and a day-scale sweep that reaps long-stopped hosts. The supervisor
//! never mutates host state directly; all transitions go through the
//! narrow [`StateTransitioner`] capability the orchestrator hands it at
//! construction, which keeps the reference cycle broken.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use chrono::Utc;
use play_billing::{evaluate_caps, rollup, CapStatus, RateTable, UsageFilter, UsageWindow};
use play_persist::HostStore;
use play_proto::{AgentHealth, Host, HostState};
use play_provision::{DriverError, DriverRegistry};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

// ─── Capability ──────────────────────────────────────────────────────────────

/// The slice of orchestrator behavior the supervisor is allowed to use.
#[async_trait]
pub trait StateTransitioner: Send + Sync {
    /// Attempt `host → to`. Returns whether this call applied the
    /// transition (a concurrent winner yields `Ok(false)`).
    async fn transition(&self, host_id: &str, to: HostState, reason: &str) -> Result<bool, String>;

    /// CAS the host to STOPPED and issue the provider stop call.
    async fn enqueue_stop(&self, host_id: &str, reason: &str);

    /// Issue an idempotent provider destroy for the host.
    async fn enqueue_destroy(&self, host_id: &str);

    /// Record a probe outcome. Healthy resets the strike counter and
    /// refreshes activity; unhealthy increments it. Returns the counter
    /// after the update.
    async fn record_probe(&self, host_id: &str, healthy: bool) -> u32;
}

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub liveness_interval: Duration,
    /// Fractional jitter applied to each liveness delay (0.10 = ±10%).
    pub liveness_jitter: f64,
    pub idle_threshold: Duration,
    pub sweep_interval: Duration,
    pub stopped_ttl: Duration,
    pub monthly_soft_cap_usd: f64,
    pub monthly_hard_cap_usd: f64,
    pub strike_limit: u32,
    pub agent_probe_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            liveness_interval: Duration::from_secs(15 * 60),
            liveness_jitter: 0.10,
            idle_threshold: Duration::from_secs(10 * 60),
            sweep_interval: Duration::from_secs(24 * 60 * 60),
            stopped_ttl: Duration::from_secs(48 * 60 * 60),
            monthly_soft_cap_usd: 400.0,
            monthly_hard_cap_usd: 500.0,
            strike_limit: 3,
            agent_probe_timeout: Duration::from_secs(5),
        }
    }
}

/// Liveness delay with ±jitter applied.
pub fn jittered(interval: Duration, jitter: f64) -> Duration {
    let factor = 1.0 - jitter + rand::random::<f64>() * 2.0 * jitter;
    Duration::from_secs_f64(interval.as_secs_f64() * factor)
}

// ─── Probe evaluation ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeDecision {
    Healthy,
    /// Agent reported unhealthy; counts as a strike.
    Unhealthy,
    /// No clients for longer than the idle threshold.
    MarkIdle,
    /// Session has run past the platform's hour ceiling.
    SessionCeiling,
}

/// Pure decision matrix over a successful `/health` response.
pub fn evaluate_probe(
    health: &AgentHealth,
    host: &Host,
    idle_threshold: Duration,
    now: chrono::DateTime<Utc>,
) -> ProbeDecision {
    if !health.ok {
        return ProbeDecision::Unhealthy;
    }

    if health.session_duration_secs > host.max_session_hours as u64 * 3600 {
        return ProbeDecision::SessionCeiling;
    }

    if health.connected_clients == 0 {
        if let Some(idle_since) = health.idle_since {
            let idle_for = (now - idle_since).to_std().unwrap_or_default();
            if idle_for >= idle_threshold {
                return ProbeDecision::MarkIdle;
            }
        }
    }

    ProbeDecision::Healthy
}

// ─── Supervisor ──────────────────────────────────────────────────────────────

pub struct Supervisor {
    hosts: Arc<HostStore>,
    rates: Arc<RateTable>,
    drivers: Arc<DriverRegistry>,
    transitioner: Arc<dyn StateTransitioner>,
    config: SupervisorConfig,
    client: reqwest::Client,
}

impl Supervisor {
    pub fn new(
        hosts: Arc<HostStore>,
        rates: Arc<RateTable>,
        drivers: Arc<DriverRegistry>,
        transitioner: Arc<dyn StateTransitioner>,
        config: SupervisorConfig,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.agent_probe_timeout)
            .build()
            .expect("failed to build HTTP client");
        Self { hosts, rates, drivers, transitioner, config, client }
    }

    /// Run both cadences on a single scheduler task until the process
    /// exits.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut last_sweep = tokio::time::Instant::now();
            loop {
                let delay = jittered(self.config.liveness_interval, self.config.liveness_jitter);
                tokio::time::sleep(delay).await;

                self.liveness_pass().await;

                if last_sweep.elapsed() >= self.config.sweep_interval {
                    self.long_stopped_pass().await;
                    last_sweep = tokio::time::Instant::now();
                }
            }
        })
    }

    /// One liveness sweep: spend-cap check, then probe every live host.
    pub async fn liveness_pass(&self) {
        let all_hosts = self.hosts.list();
        let report = rollup(
            &all_hosts,
            UsageWindow::current_month(),
            &UsageFilter::default(),
            &self.rates,
        );
        let (cap_status, alerts) = evaluate_caps(
            report.totals.estimated_cost,
            self.config.monthly_soft_cap_usd,
            self.config.monthly_hard_cap_usd,
        );
        for alert in &alerts {
            warn!(severity = ?alert.severity, estimate = alert.monthly_estimate, cap = alert.cap, "{}", alert.message);
        }
        if cap_status == CapStatus::HardExceeded {
            self.mass_drain().await;
            return;
        }

        let live = self.hosts.list_by_state(&[HostState::Ready, HostState::Running, HostState::Idle]);
        info!(hosts = live.len(), monthly_estimate = report.totals.estimated_cost, "liveness sweep");

        for host in live {
            match self.probe_agent(&host).await {
                Ok(health) => self.apply_probe(&host, &health).await,
                Err(reason) => self.handle_probe_failure(&host, &reason).await,
            }
        }
    }

    async fn apply_probe(&self, host: &Host, health: &AgentHealth) {
        match evaluate_probe(health, host, self.config.idle_threshold, Utc::now()) {
            ProbeDecision::Healthy => {
                self.transitioner.record_probe(&host.host_id, true).await;
            }
            ProbeDecision::Unhealthy => {
                self.strike(host, "agent reported unhealthy").await;
            }
            ProbeDecision::MarkIdle => {
                if host.state != HostState::Idle {
                    let _ = self
                        .transitioner
                        .transition(&host.host_id, HostState::Idle, "idle threshold exceeded")
                        .await;
                }
                self.transitioner.enqueue_stop(&host.host_id, "idle timeout").await;
            }
            ProbeDecision::SessionCeiling => {
                info!(host_id = %host.host_id, hours = host.max_session_hours, "session ceiling reached");
                self.transitioner.enqueue_stop(&host.host_id, "max session hours").await;
            }
        }
    }

    async fn handle_probe_failure(&self, host: &Host, reason: &str) {
        // A dead agent on a host the provider no longer knows about is an
        // orphan, not a strike candidate.
        if let (Some(driver), Some(handle)) =
            (self.drivers.get(host.provider), host.provider_handle.as_deref())
        {
            if let Err(DriverError::NotFound) = driver.describe(handle).await {
                warn!(host_id = %host.host_id, "provider lost host; marking orphan");
                let _ = self
                    .transitioner
                    .transition(&host.host_id, HostState::Failed, "provider reports host missing")
                    .await;
                return;
            }
        }
        self.strike(host, reason).await;
    }

    async fn strike(&self, host: &Host, reason: &str) {
        let strikes = self.transitioner.record_probe(&host.host_id, false).await;
        warn!(host_id = %host.host_id, strikes, reason, "liveness probe failed");
        if strikes >= self.config.strike_limit {
            let applied = self
                .transitioner
                .transition(&host.host_id, HostState::Failed, "consecutive liveness failures")
                .await
                .unwrap_or(false);
            if applied {
                self.transitioner.enqueue_destroy(&host.host_id).await;
            }
        }
    }

    async fn mass_drain(&self) {
        let live = self.hosts.list_by_state(&[HostState::Ready, HostState::Running, HostState::Idle]);
        warn!(hosts = live.len(), "hard spend cap exceeded; draining all live hosts");
        for host in live {
            self.transitioner.enqueue_stop(&host.host_id, "hard spend cap").await;
        }
    }

    /// Reap hosts that have sat in STOPPED past the TTL. Destroy is
    /// gated on winning the transition, so it fires at most once per
    /// host.
    pub async fn long_stopped_pass(&self) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.stopped_ttl).unwrap_or(chrono::Duration::hours(48));
        let stale: Vec<Host> = self
            .hosts
            .list_by_state(&[HostState::Stopped])
            .into_iter()
            .filter(|h| h.updated_at < cutoff)
            .collect();
        if stale.is_empty() {
            return;
        }
        info!(hosts = stale.len(), "reaping long-stopped hosts");

        for host in stale {
            let applied = self
                .transitioner
                .transition(&host.host_id, HostState::Destroyed, "stopped past TTL")
                .await
                .unwrap_or(false);
            if applied {
                self.transitioner.enqueue_destroy(&host.host_id).await;
            }
        }
    }

    async fn probe_agent(&self, host: &Host) -> Result<AgentHealth, String> {
        let address = host.address.as_deref().ok_or("host has no address")?;
        let url = format!("http://{}:{}/health", address, host.agent_port);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| format!("agent unreachable: {e}"))?;
        if !resp.status().is_success() {
            return Err(format!("agent returned {}", resp.status()));
        }
        resp.json::<AgentHealth>()
            .await
            .map_err(|e| format!("agent health parse failed: {e}"))
    }
}
