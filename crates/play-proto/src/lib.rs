//! Shared data model for the PlayOps control plane.
//!
//! Defines the host lifecycle vocabulary, the persisted `Host` record,
//! platform profiles, the session manifest served to on-host agents, and
//! the agent callback payloads. Everything here is plain data; behavior
//! lives in the service crates.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

// ─── Providers & tiers ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostProvider {
    /// GPU marketplace with a REST inventory + instances API.
    Voltgrid,
    /// Region-based provider driven through the `nimbus` CLI.
    Nimbus,
}

impl std::fmt::Display for HostProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Voltgrid => write!(f, "voltgrid"),
            Self::Nimbus => write!(f, "nimbus"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Basic,
    Plus,
    Ultra,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Basic => write!(f, "basic"),
            Self::Plus => write!(f, "plus"),
            Self::Ultra => write!(f, "ultra"),
        }
    }
}

/// Per-tier hardware shape and fixed defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierSpec {
    pub tier: Tier,
    pub vcpu: u32,
    pub memory_gib: u32,
    pub gpu_count: u32,
    /// Fixed agent port for hosts of this tier.
    pub agent_port: u16,
    /// Ceiling for waiting on the provider to surface a usable address.
    pub wait_ready_secs: u64,
}

impl TierSpec {
    pub fn for_tier(tier: Tier) -> TierSpec {
        match tier {
            Tier::Basic => TierSpec { tier, vcpu: 2, memory_gib: 4, gpu_count: 0, agent_port: 8701, wait_ready_secs: 600 },
            Tier::Plus => TierSpec { tier, vcpu: 4, memory_gib: 8, gpu_count: 1, agent_port: 8702, wait_ready_secs: 600 },
            Tier::Ultra => TierSpec { tier, vcpu: 8, memory_gib: 16, gpu_count: 1, agent_port: 8703, wait_ready_secs: 900 },
        }
    }
}

// ─── Coordinates ──────────────────────────────────────────────────────────────

/// A geodesic coordinate. Latitude in [-90, 90], longitude in [-180, 180].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coord {
    pub lat: f64,
    pub lon: f64,
}

impl Coord {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.lat) && (-180.0..=180.0).contains(&self.lon)
    }
}

// ─── Host lifecycle ──────────────────────────────────────────────────────────

/// Session-facing host lifecycle. Persisted on the `Host` record; every
/// mutation goes through a compare-and-set on `(state, version)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HostState {
    Creating,
    Configuring,
    Ready,
    Running,
    Idle,
    Stopped,
    Destroyed,
    Failed,
}

impl HostState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Destroyed | Self::Failed)
    }

    /// States in which the agent is expected to be reachable.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Ready | Self::Running | Self::Idle)
    }

    /// Whether `self → to` is an edge of the lifecycle graph.
    pub fn can_transition_to(&self, to: HostState) -> bool {
        use HostState::*;
        match (self, to) {
            (Creating, Configuring) => true,
            (Configuring, Ready) => true,
            (Ready, Running) => true,
            (Running, Idle) => true,
            (Idle, Running) => true,
            // Stop from any live state.
            (Ready | Running | Idle, Stopped) => true,
            // Restart of a stopped host; the agent's `started` callback
            // then drives READY → RUNNING.
            (Stopped, Ready) => true,
            // Destroy from any non-terminal state.
            (Creating | Configuring | Ready | Running | Idle | Stopped, Destroyed) => true,
            // Unrecoverable provisioning error or supervisor-detected orphan.
            (Creating | Configuring | Ready | Running | Idle, Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for HostState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Creating => "CREATING",
            Self::Configuring => "CONFIGURING",
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::Idle => "IDLE",
            Self::Stopped => "STOPPED",
            Self::Destroyed => "DESTROYED",
            Self::Failed => "FAILED",
        };
        write!(f, "{s}")
    }
}

/// Provider-side lifecycle vocabulary shared by both adapters. Vendor
/// status strings translate into this; unrecognized strings map to
/// `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProviderState {
    Creating,
    Running,
    Stopped,
    Failed,
    Destroyed,
    #[default]
    Unknown,
}

// ─── Host record ─────────────────────────────────────────────────────────────

/// Latest save-slot bookkeeping for a session. Updated by `save_event`
/// callbacks with the replace-not-increment rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveSlot {
    pub save_slot_id: String,
    pub accumulated_seconds: u64,
    /// Wall clock of the save event this value was computed from.
    pub wall_clock: DateTime<Utc>,
}

/// A provisioned compute instance hosting one streaming session.
///
/// Records are never deleted; terminal states are retained for billing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub host_id: String,
    pub user_id: String,
    pub platform: String,
    pub platform_family: String,
    pub tier: Tier,
    pub provider: HostProvider,

    /// Set once the provider accepts the create call.
    pub provider_handle: Option<String>,
    #[serde(default)]
    pub provider_metadata: HashMap<String, String>,

    pub address: Option<String>,
    pub agent_port: u16,

    pub state: HostState,
    /// Optimistic-concurrency counter; bumped on every persisted write.
    pub version: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_activity: Option<DateTime<Utc>>,
    pub auto_stop_timeout_secs: u64,
    /// Session-hours ceiling copied from the platform profile at
    /// creation; enforced by the supervisor and the billing clamp.
    pub max_session_hours: u32,

    pub user_coord: Option<Coord>,

    /// Monotonic true-once readiness flags.
    pub environment_ready: bool,
    pub saves_mounted: bool,

    pub unhealthy_strikes: u32,
    pub last_error: Option<String>,

    pub session_started_at: Option<DateTime<Utc>>,
    pub last_client_disconnect: Option<DateTime<Utc>>,
    /// Highest agent callback sequence applied so far.
    pub last_seq: Option<u64>,

    pub rom_ref: Option<String>,
    pub save_ref: Option<String>,
    pub save_slot: Option<SaveSlot>,
}

impl Host {
    /// A fresh record in CREATING, ready to hand to the provisioning task.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: &str,
        platform: &str,
        platform_family: &str,
        tier: Tier,
        provider: HostProvider,
        user_coord: Option<Coord>,
        auto_stop_timeout_secs: u64,
        max_session_hours: u32,
        rom_ref: Option<String>,
        save_ref: Option<String>,
    ) -> Self {
        let now = Utc::now();
        let spec = TierSpec::for_tier(tier);
        Self {
            host_id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            platform: platform.to_string(),
            platform_family: platform_family.to_string(),
            tier,
            provider,
            provider_handle: None,
            provider_metadata: HashMap::new(),
            address: None,
            agent_port: spec.agent_port,
            state: HostState::Creating,
            version: 0,
            created_at: now,
            updated_at: now,
            last_activity: None,
            auto_stop_timeout_secs,
            max_session_hours,
            user_coord,
            environment_ready: false,
            saves_mounted: false,
            unhealthy_strikes: 0,
            last_error: None,
            session_started_at: None,
            last_client_disconnect: None,
            last_seq: None,
            rom_ref,
            save_ref,
            save_slot: None,
        }
    }
}

// ─── Platform profiles ───────────────────────────────────────────────────────

/// One entry in a profile's ordered provider preference list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderPreference {
    pub provider: HostProvider,
    /// Lower value = tried first. Unique within a profile.
    pub priority: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub tier_override: Option<Tier>,
    /// Skip this provider if the rate table quotes above this.
    pub hourly_cost_cap: Option<f64>,
}

fn default_true() -> bool {
    true
}

fn default_resolution() -> String {
    "1920x1080".to_string()
}

fn default_fps() -> u32 {
    60
}

fn default_codec() -> Codec {
    Codec::H264
}

/// Configuration describing how a given platform should be hosted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformProfile {
    pub platform: String,
    pub display_name: String,
    /// Rate-table grouping (e.g. "retro", "handheld", "console").
    pub platform_family: String,

    pub preferred_providers: Vec<ProviderPreference>,
    pub default_tier: Tier,

    pub min_vcpu: u32,
    pub min_memory_gib: u32,
    pub min_gpu_count: u32,
    pub requires_gpu: bool,
    pub max_session_hours: u32,

    /// Emulator container image the agent should run; opaque to the core.
    pub app_image: String,
    #[serde(default)]
    pub default_app_config: serde_json::Value,
    pub firmware_ref: Option<String>,

    // Streaming defaults stamped into session manifests.
    #[serde(default = "default_resolution")]
    pub resolution: String,
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default = "default_codec")]
    pub codec: Codec,
    #[serde(default)]
    pub dual_screen: Option<DualScreen>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl PlatformProfile {
    pub fn validate(&self) -> Result<(), String> {
        if self.platform.is_empty() {
            return Err("platform must not be empty".to_string());
        }
        if !self.preferred_providers.iter().any(|p| p.enabled) {
            return Err(format!("profile '{}' has no enabled provider preference", self.platform));
        }
        let mut seen = std::collections::HashSet::new();
        for pref in &self.preferred_providers {
            if !seen.insert(pref.priority) {
                return Err(format!(
                    "profile '{}' has duplicate preference priority {}",
                    self.platform, pref.priority
                ));
            }
        }
        Ok(())
    }

    /// Preferences in priority order, disabled entries excluded.
    pub fn enabled_preferences(&self) -> Vec<&ProviderPreference> {
        let mut prefs: Vec<&ProviderPreference> =
            self.preferred_providers.iter().filter(|p| p.enabled).collect();
        prefs.sort_by_key(|p| p.priority);
        prefs
    }
}

// ─── Session manifest ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    H264,
    Hevc,
    Av1,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DualScreen {
    pub enabled: bool,
    pub top: Rect,
    pub bottom: Rect,
}

/// Storage paths the agent mounts before launching the emulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mounts {
    pub roms: String,
    pub saves: String,
    pub configs: String,
    pub firmware: String,
}

impl Default for Mounts {
    fn default() -> Self {
        Self {
            roms: "/srv/play/roms".to_string(),
            saves: "/srv/play/saves".to_string(),
            configs: "/srv/play/configs".to_string(),
            firmware: "/srv/play/firmware".to_string(),
        }
    }
}

/// Immutable per-session payload the on-host agent fetches to know what
/// to run. `app_image`, `app_config`, and the `*_ref` pointers are opaque
/// passthroughs from the platform profile and session inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionManifest {
    pub session_id: String,
    pub host_id: String,
    pub user_id: String,
    pub platform: String,
    pub app_image: String,
    pub rom_ref: Option<String>,
    pub save_ref: Option<String>,
    pub save_filename: Option<String>,
    pub firmware_ref: Option<String>,
    /// Optional in-game clock spoof.
    pub fake_time: Option<DateTime<Utc>>,
    pub app_config: serde_json::Value,
    /// "WxH", e.g. "1920x1080".
    pub resolution: String,
    pub fps: u32,
    pub codec: Codec,
    /// PEM-encoded client certificate for the streaming transport.
    pub client_cert: String,
    pub dual_screen: Option<DualScreen>,
    pub mounts: Mounts,
}

// ─── Agent callbacks ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartedEvent {
    pub started_at: DateTime<Utc>,
    pub seq: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveEvent {
    pub wall_clock: DateTime<Utc>,
    pub save_slot_id: String,
    pub base_accumulated_seconds: u64,
    pub seq: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdleEvent {
    pub last_client_disconnect: DateTime<Utc>,
    pub seq: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndedEvent {
    pub ended_at: DateTime<Utc>,
    pub seq: Option<u64>,
}

/// Response shape of the agent's `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHealth {
    pub ok: bool,
    pub connected_clients: u32,
    pub idle_since: Option<DateTime<Utc>>,
    pub session_duration_secs: u64,
}

// ─── Fleet status ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetStatus {
    pub total_hosts: u32,
    pub creating: u32,
    pub configuring: u32,
    pub ready: u32,
    pub running: u32,
    pub idle: u32,
    pub stopped: u32,
    pub failed: u32,
    pub destroyed: u32,
}

impl FleetStatus {
    pub fn tally(states: impl IntoIterator<Item = HostState>) -> Self {
        let mut fs = FleetStatus::default();
        for state in states {
            fs.total_hosts += 1;
            match state {
                HostState::Creating => fs.creating += 1,
                HostState::Configuring => fs.configuring += 1,
                HostState::Ready => fs.ready += 1,
                HostState::Running => fs.running += 1,
                HostState::Idle => fs.idle += 1,
                HostState::Stopped => fs.stopped += 1,
                HostState::Failed => fs.failed += 1,
                HostState::Destroyed => fs.destroyed += 1,
            }
        }
        fs
    }
}

// ─── Error taxonomy ──────────────────────────────────────────────────────────

/// User-visible error kinds with their HTTP surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    BadRequest,
    UnknownPlatform,
    NotFound,
    Gone,
    Conflict,
    InsufficientProviders,
    ProviderError,
    Internal,
}

impl ErrorKind {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::BadRequest => 400,
            Self::UnknownPlatform | Self::NotFound => 404,
            Self::Gone => 410,
            Self::Conflict => 409,
            Self::InsufficientProviders => 503,
            Self::ProviderError => 502,
            Self::Internal => 500,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::BadRequest => "bad_request",
            Self::UnknownPlatform => "unknown_platform",
            Self::NotFound => "not_found",
            Self::Gone => "gone",
            Self::Conflict => "conflict",
            Self::InsufficientProviders => "insufficient_providers",
            Self::ProviderError => "provider_error",
            Self::Internal => "internal",
        };
        write!(f, "{s}")
    }
}

// ─── Validation ──────────────────────────────────────────────────────────────

pub fn validate_host_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_')
}

pub fn validate_user_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= 64
}
