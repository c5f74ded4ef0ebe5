//! Background provisioning pipeline.
//!
//! Drives one host from CREATING to READY: placement, provider create
//! (bounded retries with exponential backoff), readiness wait, and
//! environment configuration. The task yields between steps; a host
//! observed in DESTROYED abandons the pipeline and destroys whatever
//! provider-side artifact exists. Terminal records are never mutated,
//! so the create handle is persisted through a version CAS and carried
//! locally for cleanup when the CAS loses to a destroy.

use crate::OrchestratorConfig;
use chrono::Utc;
use play_persist::{HostStore, StoreError};
use play_placement::{PlacementError, PlacementService};
use play_proto::{HostProvider, HostState, PlatformProfile, TierSpec};
use play_provision::{CreateSpec, DriverError, DriverRegistry, HostDriver};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{info, warn};

/// The slice of orchestrator state the background task owns.
pub(crate) struct PipelineCtx {
    pub hosts: Arc<HostStore>,
    pub drivers: Arc<DriverRegistry>,
    pub placement: Arc<PlacementService>,
    pub config: OrchestratorConfig,
}

impl PipelineCtx {
    /// The persisted DESTROYED state is the cancellation signal.
    fn is_cancelled(&self, host_id: &str) -> bool {
        match self.hosts.get(host_id) {
            Some(host) => host.state == HostState::Destroyed,
            None => true,
        }
    }
}

enum PipelineEnd {
    Completed,
    Cancelled { handle: Option<String> },
    Failed { reason: String, handle: Option<String> },
}

pub(crate) async fn run(
    ctx: PipelineCtx,
    host_id: String,
    profile: PlatformProfile,
    _permit: OwnedSemaphorePermit,
) {
    match drive(&ctx, &host_id, &profile).await {
        PipelineEnd::Completed => {
            info!(%host_id, "provisioning pipeline complete");
        }
        PipelineEnd::Cancelled { handle } => {
            info!(%host_id, "provisioning cancelled; cleaning up provider artifact");
            destroy_artifact(&ctx, &host_id, handle).await;
        }
        PipelineEnd::Failed { reason, handle } => {
            warn!(%host_id, %reason, "provisioning failed");
            let _ = ctx.hosts.transition(&host_id, HostState::Failed, |h| {
                h.last_error = Some(reason.clone());
            });
            destroy_artifact(&ctx, &host_id, handle).await;
        }
    }
}

async fn drive(ctx: &PipelineCtx, host_id: &str, profile: &PlatformProfile) -> PipelineEnd {
    let fail = |reason: String| PipelineEnd::Failed { reason, handle: None };

    let Some(host) = ctx.hosts.get(host_id) else {
        return fail("host record disappeared".to_string());
    };
    let Some(driver) = ctx.drivers.get(host.provider) else {
        return fail(format!("driver for {} not enabled", host.provider));
    };

    // Step 1: placement.
    if ctx.is_cancelled(host_id) {
        return PipelineEnd::Cancelled { handle: None };
    }
    let spec = match build_create_spec(ctx, &driver, &host, profile).await {
        Ok(spec) => spec,
        Err(reason) => return fail(reason),
    };

    // Step 2: create, with bounded retries on retryable errors.
    if ctx.is_cancelled(host_id) {
        return PipelineEnd::Cancelled { handle: None };
    }
    let outcome = {
        let mut attempt = 0u32;
        let mut backoff = ctx.config.create_backoff_initial;
        loop {
            attempt += 1;
            match driver.create(&spec).await {
                Ok(outcome) => break outcome,
                Err(e) if e.retryable() && attempt < ctx.config.create_retry_limit => {
                    warn!(host_id, attempt, error = %e, "create failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(ctx.config.create_backoff_cap);
                }
                Err(e) => {
                    return fail(format!("create failed after {attempt} attempts: {e}"));
                }
            }
        }
    };
    let handle = outcome.provider_handle.clone();
    info!(host_id, %handle, "provider accepted create");

    // Persist the handle through a version CAS so a concurrent destroy
    // (which bumps the version) cannot be overwritten. A lost CAS means
    // the host went terminal; the artifact is ours to clean up.
    match ctx.hosts.get(host_id) {
        Some(fresh) if fresh.state != HostState::Destroyed => {
            let persisted = ctx.hosts.cas_update(host_id, fresh.version, |h| {
                h.provider_handle = Some(outcome.provider_handle.clone());
                h.provider_metadata.extend(outcome.provider_metadata.clone());
            });
            match persisted {
                Ok(_) => {}
                Err(StoreError::VersionConflict { .. }) => {
                    return PipelineEnd::Cancelled { handle: Some(handle) };
                }
                Err(e) => {
                    return PipelineEnd::Failed {
                        reason: format!("failed to persist provider handle: {e}"),
                        handle: Some(handle),
                    };
                }
            }
        }
        _ => return PipelineEnd::Cancelled { handle: Some(handle) },
    }

    // Step 3: wait for a usable address.
    let max_wait = Duration::from_secs(TierSpec::for_tier(host.tier).wait_ready_secs);
    let description = match driver.wait_ready(&handle, max_wait).await {
        Ok(d) => d,
        Err(DriverError::Timeout) => {
            return PipelineEnd::Failed {
                reason: format!("host not ready within {}s", max_wait.as_secs()),
                handle: Some(handle),
            };
        }
        Err(e) => {
            return PipelineEnd::Failed {
                reason: format!("readiness wait failed: {e}"),
                handle: Some(handle),
            };
        }
    };
    let Some(address) = description.address else {
        return PipelineEnd::Failed {
            reason: "provider reported ready without an address".to_string(),
            handle: Some(handle),
        };
    };

    // Step 4: configure the streaming environment.
    if ctx.is_cancelled(host_id) {
        return PipelineEnd::Cancelled { handle: Some(handle) };
    }
    if ctx
        .hosts
        .transition(host_id, HostState::Configuring, |h| {
            h.address = Some(address.clone());
        })
        .is_err()
    {
        // Lost to a concurrent destroy.
        return PipelineEnd::Cancelled { handle: Some(handle) };
    }

    if let Err(e) = driver.configure_environment(&handle, &address).await {
        return PipelineEnd::Failed {
            reason: format!("environment setup failed: {e}"),
            handle: Some(handle),
        };
    }

    // Step 5: ready.
    if ctx.is_cancelled(host_id) {
        return PipelineEnd::Cancelled { handle: Some(handle) };
    }
    match ctx.hosts.transition(host_id, HostState::Ready, |h| {
        h.environment_ready = true;
        h.saves_mounted = true;
        h.last_activity = Some(Utc::now());
    }) {
        Ok(_) => PipelineEnd::Completed,
        Err(_) => PipelineEnd::Cancelled { handle: Some(handle) },
    }
}

async fn build_create_spec(
    ctx: &PipelineCtx,
    driver: &Arc<dyn HostDriver>,
    host: &play_proto::Host,
    profile: &PlatformProfile,
) -> Result<CreateSpec, String> {
    let mut tags = HashMap::new();
    tags.insert("managed_by".to_string(), "playops".to_string());
    tags.insert("user_id".to_string(), host.user_id.clone());
    tags.insert("platform".to_string(), host.platform.clone());

    let mut spec = CreateSpec {
        name: host.host_id.clone(),
        tier: host.tier,
        node_id: None,
        region: None,
        ssh_key: ctx.config.ssh_public_key.clone(),
        auto_stop_timeout_secs: host.auto_stop_timeout_secs,
        tags,
    };

    match host.provider {
        HostProvider::Voltgrid => {
            let nodes = driver
                .list_inventory()
                .await
                .map_err(|e| format!("inventory fetch failed: {e}"))?;
            let minima = play_placement::CapabilityMinima {
                min_vcpu: profile.min_vcpu,
                min_memory_gib: profile.min_memory_gib,
                min_gpu_count: profile.min_gpu_count,
            };
            let ranked = ctx
                .placement
                .rank_inventory(host.user_coord, nodes, minima)
                .await
                .map_err(|e| match e {
                    PlacementError::NoCandidate => "no placement candidate".to_string(),
                })?;
            let best = &ranked[0];
            info!(
                host_id = %host.host_id,
                node = %best.node.id,
                city = %best.node.city,
                distance_km = ?best.distance_km,
                "placement selected inventory node"
            );
            spec.node_id = Some(best.node.id.clone());
        }
        HostProvider::Nimbus => {
            let choice = ctx.placement.pick_nimbus_region(host.user_coord).await;
            info!(
                host_id = %host.host_id,
                region = %choice.code,
                source = ?choice.source,
                "placement selected region"
            );
            spec.region = Some(choice.code);
        }
    }

    Ok(spec)
}

/// Best-effort destroy of whatever the provider holds for this host.
/// Prefers the persisted handle, falling back to the in-flight one when
/// the record never learned it.
async fn destroy_artifact(ctx: &PipelineCtx, host_id: &str, known_handle: Option<String>) {
    let Some(host) = ctx.hosts.get(host_id) else { return };
    let handle = host.provider_handle.or(known_handle);
    let (Some(driver), Some(handle)) = (ctx.drivers.get(host.provider), handle) else {
        return;
    };
    if let Err(e) = driver.destroy(&handle).await {
        warn!(host_id, error = %e, "artifact destroy failed");
    }
}
