//! Session orchestrator for PlayOps.
//!
//! Owns the host lifecycle state machine: the public session API, the
//! background provisioning pipeline, and the agent callback surface.
//! Every state change funnels through the host store's compare-and-set,
//! so concurrent attempts to drive the same host collapse to one winner.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use chrono::Utc;
use play_billing::RateTable;
use play_persist::{HostStore, ProfileStore, StoreError, Transition};
use play_placement::{PlacementService, RankedNode, RegionChoice};
use play_proto::{
    Coord, ErrorKind, Host, HostProvider, HostState, PlatformProfile, SessionManifest, Tier,
};
use play_provision::DriverRegistry;
use play_supervisor::StateTransitioner;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

mod callbacks;
mod manifest;
mod pipeline;

pub use callbacks::SeqCheck;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("unknown platform '{0}'")]
    UnknownPlatform(String),

    #[error("session '{0}' not found")]
    NotFound(String),

    #[error("session '{0}' is gone")]
    Gone(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("no provider available: {0}")]
    InsufficientProviders(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BadRequest(_) => ErrorKind::BadRequest,
            Self::UnknownPlatform(_) => ErrorKind::UnknownPlatform,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Gone(_) => ErrorKind::Gone,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::InsufficientProviders(_) => ErrorKind::InsufficientProviders,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<StoreError> for OrchestratorError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => Self::NotFound(id),
            StoreError::InvalidTransition { from, to } => {
                Self::Conflict(format!("cannot transition {from} -> {to}"))
            }
            StoreError::VersionConflict { .. } => Self::Conflict(e.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Backpressure: in-flight provisioning tasks beyond this are
    /// rejected rather than queued.
    pub max_inflight_provisions: usize,
    pub create_retry_limit: u32,
    pub create_backoff_initial: Duration,
    pub create_backoff_cap: Duration,
    /// Idle auto-stop default stamped on new hosts.
    pub default_auto_stop_timeout_secs: u64,
    pub ssh_public_key: Option<String>,
    /// PEM served to agents in session manifests.
    pub client_cert_pem: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_inflight_provisions: 32,
            create_retry_limit: 3,
            create_backoff_initial: Duration::from_secs(2),
            create_backoff_cap: Duration::from_secs(30),
            default_auto_stop_timeout_secs: 900,
            ssh_public_key: None,
            client_cert_pem: String::new(),
        }
    }
}

// ─── Session request ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub user_id: String,
    pub platform: String,
    pub user_coord: Option<Coord>,
    pub rom_ref: Option<String>,
    pub save_ref: Option<String>,
}

/// Optimizer query result for the placements API.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "candidates")]
pub enum PlacementCandidates {
    Inventory(Vec<RankedNode>),
    Regions(Vec<RegionChoice>),
}

// ─── Orchestrator ────────────────────────────────────────────────────────────

pub struct Orchestrator {
    hosts: Arc<HostStore>,
    profiles: Arc<ProfileStore>,
    drivers: Arc<DriverRegistry>,
    placement: Arc<PlacementService>,
    rates: Arc<RateTable>,
    config: OrchestratorConfig,
    provision_permits: Arc<Semaphore>,
}

impl Orchestrator {
    pub fn new(
        hosts: Arc<HostStore>,
        profiles: Arc<ProfileStore>,
        drivers: Arc<DriverRegistry>,
        placement: Arc<PlacementService>,
        rates: Arc<RateTable>,
        config: OrchestratorConfig,
    ) -> Self {
        let provision_permits = Arc::new(Semaphore::new(config.max_inflight_provisions));
        Self { hosts, profiles, drivers, placement, rates, config, provision_permits }
    }

    pub fn host_store(&self) -> Arc<HostStore> {
        self.hosts.clone()
    }

    pub fn profile_store(&self) -> Arc<ProfileStore> {
        self.profiles.clone()
    }

    // ─── Public session API ──────────────────────────────────────────────

    /// Request a streaming session. Returns an existing non-terminal host
    /// for the same `(user, platform)` when one exists (restarting it if
    /// stopped); otherwise persists a new host in CREATING and kicks off
    /// the provisioning pipeline.
    pub async fn request_session(&self, req: SessionRequest) -> Result<Host, OrchestratorError> {
        if !play_proto::validate_user_id(&req.user_id) {
            return Err(OrchestratorError::BadRequest("invalid user_id".to_string()));
        }
        if let Some(coord) = req.user_coord {
            if !coord.is_valid() {
                return Err(OrchestratorError::BadRequest(format!(
                    "coordinate out of range: ({}, {})",
                    coord.lat, coord.lon
                )));
            }
        }

        let profile = self
            .profiles
            .get(&req.platform)
            .ok_or_else(|| OrchestratorError::UnknownPlatform(req.platform.clone()))?;

        // Deduplicate against the user's existing host for this platform.
        if let Some(existing) = self.hosts.find_active_for_user(&req.user_id, &req.platform) {
            info!(host_id = %existing.host_id, state = %existing.state, "reusing existing session host");
            if existing.state == HostState::Stopped {
                self.spawn_restart(existing.host_id.clone());
            }
            let refreshed = self
                .hosts
                .mutate(&existing.host_id, |h| h.last_activity = Some(Utc::now()))?;
            return Ok(refreshed);
        }

        let (provider, tier) = self.select_provider(&profile)?;

        // Backpressure: refuse rather than queue when the pipeline is full.
        let permit = self
            .provision_permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| {
                OrchestratorError::InsufficientProviders("provisioning capacity exhausted".to_string())
            })?;

        let host = Host::new(
            &req.user_id,
            &req.platform,
            &profile.platform_family,
            tier,
            provider,
            req.user_coord,
            self.config.default_auto_stop_timeout_secs,
            profile.max_session_hours,
            req.rom_ref,
            req.save_ref,
        );
        self.hosts.insert(host.clone())?;
        info!(host_id = %host.host_id, %provider, %tier, platform = %host.platform, "session host created");

        let ctx = self.pipeline_ctx();
        let host_id = host.host_id.clone();
        tokio::spawn(async move {
            pipeline::run(ctx, host_id, profile, permit).await;
        });

        Ok(host)
    }

    pub(crate) fn pipeline_ctx(&self) -> pipeline::PipelineCtx {
        pipeline::PipelineCtx {
            hosts: self.hosts.clone(),
            drivers: self.drivers.clone(),
            placement: self.placement.clone(),
            config: self.config.clone(),
        }
    }

    /// Walk the profile's preference list in priority order, skipping
    /// disabled providers and entries priced over their cost cap.
    fn select_provider(
        &self,
        profile: &PlatformProfile,
    ) -> Result<(HostProvider, Tier), OrchestratorError> {
        for pref in profile.enabled_preferences() {
            if !self.drivers.is_enabled(pref.provider) {
                debug!(provider = %pref.provider, "preference skipped: driver not enabled");
                continue;
            }
            let tier = pref.tier_override.unwrap_or(profile.default_tier);
            let rate = self.rates.hourly_rate(tier, &profile.platform_family, pref.provider);
            if let Some(cap) = pref.hourly_cost_cap {
                if rate > cap {
                    debug!(provider = %pref.provider, rate, cap, "preference skipped: over cost cap");
                    continue;
                }
            }
            return Ok((pref.provider, tier));
        }
        Err(OrchestratorError::InsufficientProviders(format!(
            "no enabled, affordable provider for platform '{}'",
            profile.platform
        )))
    }

    /// Stop a session: CAS to STOPPED and issue the provider stop call.
    /// Idempotent: an already-stopped host returns ok without touching
    /// the provider.
    pub async fn stop_session(&self, host_id: &str) -> Result<Host, OrchestratorError> {
        let host = self
            .hosts
            .get(host_id)
            .ok_or_else(|| OrchestratorError::NotFound(host_id.to_string()))?;
        if host.state.is_terminal() {
            return Err(OrchestratorError::Gone(host_id.to_string()));
        }

        match self.hosts.transition(host_id, HostState::Stopped, |_| {})? {
            Transition::Applied(updated) => {
                self.spawn_driver_stop(updated.clone());
                Ok(updated)
            }
            Transition::AlreadyInTarget(updated) => Ok(updated),
        }
    }

    /// Restart a stopped session host.
    pub async fn start_session(&self, host_id: &str) -> Result<Host, OrchestratorError> {
        let host = self
            .hosts
            .get(host_id)
            .ok_or_else(|| OrchestratorError::NotFound(host_id.to_string()))?;
        match host.state {
            HostState::Stopped => {
                self.spawn_restart(host.host_id.clone());
                Ok(host)
            }
            state if state.is_live() => Ok(host),
            state if state.is_terminal() => Err(OrchestratorError::Gone(host_id.to_string())),
            state => Err(OrchestratorError::Conflict(format!("cannot start host in {state}"))),
        }
    }

    /// Destroy a session: CAS any non-terminal state to DESTROYED and
    /// issue the provider destroy. Idempotent; a FAILED host gets a
    /// best-effort destroy to release provider-side remnants.
    pub async fn destroy_session(&self, host_id: &str) -> Result<Host, OrchestratorError> {
        let host = self
            .hosts
            .get(host_id)
            .ok_or_else(|| OrchestratorError::NotFound(host_id.to_string()))?;

        match host.state {
            HostState::Destroyed => Ok(host),
            HostState::Failed => {
                self.spawn_driver_destroy(host.clone());
                Ok(host)
            }
            _ => match self.hosts.transition(host_id, HostState::Destroyed, |_| {})? {
                Transition::Applied(updated) => {
                    self.spawn_driver_destroy(updated.clone());
                    Ok(updated)
                }
                Transition::AlreadyInTarget(updated) => Ok(updated),
            },
        }
    }

    /// The persisted host record; no provider call.
    pub fn describe_session(&self, host_id: &str) -> Result<Host, OrchestratorError> {
        self.hosts
            .get(host_id)
            .ok_or_else(|| OrchestratorError::NotFound(host_id.to_string()))
    }

    pub fn list_sessions(&self, state: Option<HostState>) -> Vec<Host> {
        match state {
            Some(s) => self.hosts.list_by_state(&[s]),
            None => self.hosts.list(),
        }
    }

    pub fn fleet_status(&self) -> play_proto::FleetStatus {
        play_proto::FleetStatus::tally(self.hosts.list().into_iter().map(|h| h.state))
    }

    /// Optimizer query for the placements API. Pure; no state change.
    pub async fn placement_candidates(
        &self,
        provider: HostProvider,
        user_coord: Option<Coord>,
        platform: Option<&str>,
    ) -> Result<PlacementCandidates, OrchestratorError> {
        match provider {
            HostProvider::Voltgrid => {
                let driver = self.drivers.get(provider).ok_or_else(|| {
                    OrchestratorError::InsufficientProviders("voltgrid driver not enabled".to_string())
                })?;
                let nodes = driver
                    .list_inventory()
                    .await
                    .map_err(|e| OrchestratorError::Internal(format!("inventory fetch failed: {e}")))?;

                let minima = match platform.and_then(|p| self.profiles.get(p)) {
                    Some(profile) => play_placement::CapabilityMinima {
                        min_vcpu: profile.min_vcpu,
                        min_memory_gib: profile.min_memory_gib,
                        min_gpu_count: profile.min_gpu_count,
                    },
                    None => play_placement::CapabilityMinima {
                        min_vcpu: 0,
                        min_memory_gib: 0,
                        min_gpu_count: 0,
                    },
                };

                match self.placement.rank_inventory(user_coord, nodes, minima).await {
                    Ok(ranked) => Ok(PlacementCandidates::Inventory(ranked)),
                    Err(play_placement::PlacementError::NoCandidate) => {
                        Ok(PlacementCandidates::Inventory(Vec::new()))
                    }
                }
            }
            HostProvider::Nimbus => {
                Ok(PlacementCandidates::Regions(self.placement.nimbus_candidates(user_coord)))
            }
        }
    }

    /// Session manifest for the on-host agent, addressed by VM token.
    pub fn manifest_for(&self, vm_token: &str) -> Result<SessionManifest, OrchestratorError> {
        let host = self
            .hosts
            .get(vm_token)
            .ok_or_else(|| OrchestratorError::NotFound(vm_token.to_string()))?;
        let profile = self
            .profiles
            .get(&host.platform)
            .ok_or_else(|| OrchestratorError::UnknownPlatform(host.platform.clone()))?;
        Ok(manifest::build(&host, &profile, &self.config.client_cert_pem))
    }

    // ─── Background work ─────────────────────────────────────────────────

    fn spawn_restart(&self, host_id: String) {
        let hosts = self.hosts.clone();
        let drivers = self.drivers.clone();
        tokio::spawn(async move {
            restart_host(hosts, drivers, &host_id).await;
        });
    }

    pub(crate) fn spawn_driver_stop(&self, host: Host) {
        let Some(driver) = self.drivers.get(host.provider) else { return };
        let Some(handle) = host.provider_handle.clone() else { return };
        let host_id = host.host_id;
        tokio::spawn(async move {
            match driver.stop(&handle).await {
                Ok(()) => info!(%host_id, "provider stop complete"),
                Err(e) => warn!(%host_id, error = %e, "provider stop failed"),
            }
        });
    }

    pub(crate) fn spawn_driver_destroy(&self, host: Host) {
        let Some(driver) = self.drivers.get(host.provider) else { return };
        let Some(handle) = host.provider_handle.clone() else { return };
        let host_id = host.host_id;
        tokio::spawn(async move {
            match driver.destroy(&handle).await {
                Ok(()) => info!(%host_id, "provider destroy complete"),
                Err(e) => warn!(%host_id, error = %e, "provider destroy failed"),
            }
        });
    }

}

/// Restart a stopped host: provider start, then CAS back to READY.
async fn restart_host(hosts: Arc<HostStore>, drivers: Arc<DriverRegistry>, host_id: &str) {
    let Some(host) = hosts.get(host_id) else { return };
    let (Some(driver), Some(handle)) = (drivers.get(host.provider), host.provider_handle.clone())
    else {
        warn!(host_id, "cannot restart: missing driver or provider handle");
        return;
    };

    info!(host_id, "restarting stopped host");
    if let Err(e) = driver.start(&handle).await {
        warn!(host_id, error = %e, "provider start failed");
        let _ = hosts.mutate(host_id, |h| {
            h.last_error = Some(format!("restart failed: {e}"));
        });
        return;
    }

    match hosts.transition(host_id, HostState::Ready, |h| {
        h.last_activity = Some(Utc::now());
        h.unhealthy_strikes = 0;
    }) {
        Ok(_) => info!(host_id, "host restarted"),
        Err(e) => warn!(host_id, error = %e, "restart transition lost"),
    }
}

// ─── Supervisor capability ───────────────────────────────────────────────────

#[async_trait]
impl StateTransitioner for Orchestrator {
    async fn transition(&self, host_id: &str, to: HostState, reason: &str) -> Result<bool, String> {
        match self.hosts.transition(host_id, to, |h| {
            if to == HostState::Failed {
                h.last_error = Some(reason.to_string());
            }
        }) {
            Ok(Transition::Applied(_)) => {
                info!(host_id, %to, reason, "supervisor transition applied");
                Ok(true)
            }
            Ok(Transition::AlreadyInTarget(_)) => Ok(false),
            Err(StoreError::InvalidTransition { from, .. }) => {
                debug!(host_id, %from, %to, "supervisor transition no longer valid");
                Ok(false)
            }
            Err(e) => Err(e.to_string()),
        }
    }

    async fn enqueue_stop(&self, host_id: &str, reason: &str) {
        match self.hosts.transition(host_id, HostState::Stopped, |_| {}) {
            Ok(Transition::Applied(host)) => {
                info!(host_id, reason, "supervisor stopping host");
                self.spawn_driver_stop(host);
            }
            Ok(Transition::AlreadyInTarget(_)) => {}
            Err(e) => debug!(host_id, error = %e, "supervisor stop skipped"),
        }
    }

    async fn enqueue_destroy(&self, host_id: &str) {
        if let Some(host) = self.hosts.get(host_id) {
            self.spawn_driver_destroy(host);
        }
    }

    async fn record_probe(&self, host_id: &str, healthy: bool) -> u32 {
        let result = self.hosts.mutate(host_id, |h| {
            if healthy {
                h.unhealthy_strikes = 0;
                h.last_activity = Some(Utc::now());
            } else {
                h.unhealthy_strikes += 1;
            }
        });
        match result {
            Ok(host) => host.unhealthy_strikes,
            Err(_) => 0,
        }
    }
}
