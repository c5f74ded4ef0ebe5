//! Billing rollup for the PlayOps fleet.
//!
//! A pure query layer: given persisted host records and the static rate
//! table, compute per-host elapsed hours and estimated cost over a time
//! window, and evaluate spend caps for the supervisor.
//!
//! Money is `f64` rounded to 4 decimal places at every aggregation point.

#![forbid(unsafe_code)]

use chrono::{DateTime, Datelike, Utc};
use play_proto::{Host, HostProvider, HostState, Tier};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("rate table error: {0}")]
    RateTable(String),

    #[error("invalid window: from {from} is not before to {to}")]
    InvalidWindow { from: DateTime<Utc>, to: DateTime<Utc> },
}

/// Round money to 4 decimal places.
pub fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}

// ─── Rate table ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RateRow {
    tier: Tier,
    platform_family: String,
    provider: HostProvider,
    hourly_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RateFile {
    rates: Vec<RateRow>,
    #[serde(default)]
    family_multipliers: HashMap<String, f64>,
    default_rates: HashMap<Tier, f64>,
}

/// Static `(tier, platform_family, provider) → hourly_rate` map.
/// Immutable after load.
#[derive(Debug, Clone)]
pub struct RateTable {
    rates: HashMap<(Tier, String, HostProvider), f64>,
    family_multipliers: HashMap<String, f64>,
    default_rates: HashMap<Tier, f64>,
}

impl RateTable {
    pub fn load(path: &Path) -> Result<Self, BillingError> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| BillingError::RateTable(format!("read {}: {e}", path.display())))?;
        let file: RateFile = serde_json::from_str(&data)
            .map_err(|e| BillingError::RateTable(format!("parse {}: {e}", path.display())))?;
        Ok(Self::from_file(file))
    }

    /// Shipped defaults, used when no rate file is configured.
    pub fn builtin() -> Self {
        let file: RateFile =
            serde_json::from_str(BUILTIN_RATES).expect("builtin rate table must parse");
        Self::from_file(file)
    }

    fn from_file(file: RateFile) -> Self {
        let rates = file
            .rates
            .into_iter()
            .map(|r| ((r.tier, r.platform_family, r.provider), r.hourly_rate))
            .collect();
        Self {
            rates,
            family_multipliers: file.family_multipliers,
            default_rates: file.default_rates,
        }
    }

    /// Base hourly rate for the triple, falling back to the per-tier
    /// default when the exact combination is not listed.
    pub fn hourly_rate(&self, tier: Tier, platform_family: &str, provider: HostProvider) -> f64 {
        if let Some(rate) = self.rates.get(&(tier, platform_family.to_string(), provider)) {
            return *rate;
        }
        match self.default_rates.get(&tier) {
            Some(rate) => *rate,
            None => {
                warn!(%tier, platform_family, %provider, "no rate entry or tier default; assuming 0");
                0.0
            }
        }
    }

    /// Cost multiplier for a platform family (default 1.0).
    pub fn multiplier(&self, platform_family: &str) -> f64 {
        self.family_multipliers.get(platform_family).copied().unwrap_or(1.0)
    }
}

const BUILTIN_RATES: &str = r#"{
  "rates": [
    { "tier": "basic", "platform_family": "retro",    "provider": "voltgrid", "hourly_rate": 0.15 },
    { "tier": "plus",  "platform_family": "handheld", "provider": "voltgrid", "hourly_rate": 0.35 },
    { "tier": "ultra", "platform_family": "console",  "provider": "voltgrid", "hourly_rate": 1.20 },
    { "tier": "basic", "platform_family": "retro",    "provider": "nimbus",   "hourly_rate": 0.15 },
    { "tier": "plus",  "platform_family": "handheld", "provider": "nimbus",   "hourly_rate": 0.35 },
    { "tier": "ultra", "platform_family": "console",  "provider": "nimbus",   "hourly_rate": 1.0625 }
  ],
  "family_multipliers": {
    "handheld": 1.1,
    "console": 1.3
  },
  "default_rates": {
    "basic": 0.20,
    "plus": 0.40,
    "ultra": 1.25
  }
}"#;

// ─── Rollup ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UsageWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl UsageWindow {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Self, BillingError> {
        if from >= to {
            return Err(BillingError::InvalidWindow { from, to });
        }
        Ok(Self { from, to })
    }

    /// The current calendar month up to now.
    pub fn current_month() -> Self {
        let now = Utc::now();
        let start = now
            .date_naive()
            .with_day0(0)
            .expect("first of month exists")
            .and_hms_opt(0, 0, 0)
            .expect("midnight exists")
            .and_utc();
        Self { from: start, to: now }
    }
}

#[derive(Debug, Clone, Default)]
pub struct UsageFilter {
    pub provider: Option<HostProvider>,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostUsage {
    pub host_id: String,
    pub user_id: String,
    pub platform: String,
    pub platform_family: String,
    pub tier: Tier,
    pub provider: HostProvider,
    pub state: HostState,
    pub hours: f64,
    pub hourly_rate: f64,
    pub multiplier: f64,
    pub estimated_cost: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageTotals {
    pub hosts: u32,
    pub hours: f64,
    pub estimated_cost: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageReport {
    pub window: UsageWindow,
    pub per_host: Vec<HostUsage>,
    pub totals: UsageTotals,
}

/// Billable hours a host accrued inside the window: overlap of
/// `[created_at, last_activity]` with `[from, to]`, clamped to the
/// host's session-hours ceiling. Hosts that never reported activity
/// accrue nothing.
fn elapsed_hours(host: &Host, window: &UsageWindow) -> f64 {
    let Some(last_activity) = host.last_activity else {
        return 0.0;
    };
    let start = host.created_at.max(window.from);
    let end = last_activity.min(window.to);
    if end <= start {
        return 0.0;
    }
    let hours = (end - start).num_seconds() as f64 / 3600.0;
    hours.clamp(0.0, host.max_session_hours as f64)
}

/// Aggregate usage cost across hosts for the window, optionally filtered
/// by provider and/or user.
pub fn rollup(hosts: &[Host], window: UsageWindow, filter: &UsageFilter, rates: &RateTable) -> UsageReport {
    let mut per_host = Vec::new();
    let mut totals = UsageTotals::default();

    for host in hosts {
        if host.created_at > window.to {
            continue;
        }
        if let Some(provider) = filter.provider {
            if host.provider != provider {
                continue;
            }
        }
        if let Some(user_id) = &filter.user_id {
            if &host.user_id != user_id {
                continue;
            }
        }

        let hours = elapsed_hours(host, &window);
        let hourly_rate = rates.hourly_rate(host.tier, &host.platform_family, host.provider);
        let multiplier = rates.multiplier(&host.platform_family);
        let cost = round4(hours * hourly_rate * multiplier);

        totals.hosts += 1;
        totals.hours += hours;
        totals.estimated_cost += cost;

        per_host.push(HostUsage {
            host_id: host.host_id.clone(),
            user_id: host.user_id.clone(),
            platform: host.platform.clone(),
            platform_family: host.platform_family.clone(),
            tier: host.tier,
            provider: host.provider,
            state: host.state,
            hours: round4(hours),
            hourly_rate,
            multiplier,
            estimated_cost: cost,
        });
    }

    totals.hours = round4(totals.hours);
    totals.estimated_cost = round4(totals.estimated_cost);
    UsageReport { window, per_host, totals }
}

// ─── Spend caps ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapStatus {
    UnderCaps,
    /// Within 80 % of the soft cap.
    Approaching,
    SoftExceeded,
    HardExceeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingAlert {
    pub severity: AlertSeverity,
    pub message: String,
    pub monthly_estimate: f64,
    pub cap: f64,
}

/// Classify the rolling monthly estimate against the configured caps and
/// produce the alerts to emit.
pub fn evaluate_caps(monthly_estimate: f64, soft_cap: f64, hard_cap: f64) -> (CapStatus, Vec<BillingAlert>) {
    let mut alerts = Vec::new();

    if monthly_estimate >= hard_cap {
        alerts.push(BillingAlert {
            severity: AlertSeverity::Critical,
            message: format!(
                "monthly spend estimate ${monthly_estimate:.2} exceeds hard cap ${hard_cap:.2}; draining fleet"
            ),
            monthly_estimate,
            cap: hard_cap,
        });
        return (CapStatus::HardExceeded, alerts);
    }

    if monthly_estimate >= soft_cap {
        alerts.push(BillingAlert {
            severity: AlertSeverity::Warning,
            message: format!(
                "monthly spend estimate ${monthly_estimate:.2} exceeds soft cap ${soft_cap:.2}"
            ),
            monthly_estimate,
            cap: soft_cap,
        });
        return (CapStatus::SoftExceeded, alerts);
    }

    if monthly_estimate >= soft_cap * 0.8 {
        alerts.push(BillingAlert {
            severity: AlertSeverity::Warning,
            message: format!(
                "monthly spend estimate ${monthly_estimate:.2} is at 80% of soft cap ${soft_cap:.2}"
            ),
            monthly_estimate,
            cap: soft_cap,
        });
        return (CapStatus::Approaching, alerts);
    }

    (CapStatus::UnderCaps, alerts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use play_proto::Tier;

    fn make_host(user: &str, provider: HostProvider, family: &str, tier: Tier, hours_ago_created: i64, hours_active: i64) -> Host {
        let mut host = Host::new(
            user, "plat-a", family, tier, provider, None, 900, 8, None, None,
        );
        host.created_at = Utc::now() - Duration::hours(hours_ago_created);
        host.last_activity = Some(host.created_at + Duration::hours(hours_active));
        host.state = HostState::Running;
        host
    }

    fn window_last_day() -> UsageWindow {
        UsageWindow::new(Utc::now() - Duration::hours(24), Utc::now()).expect("window")
    }

    #[test]
    fn test_round4() {
        assert_eq!(round4(0.123456), 0.1235);
        assert_eq!(round4(10.0), 10.0);
        assert_eq!(round4(0.00004), 0.0);
    }

    #[test]
    fn test_rollup_basic_cost() {
        let rates = RateTable::builtin();
        let hosts = vec![make_host("u-1", HostProvider::Voltgrid, "retro", Tier::Basic, 10, 4)];
        let report = rollup(&hosts, window_last_day(), &UsageFilter::default(), &rates);

        assert_eq!(report.totals.hosts, 1);
        assert!((report.totals.hours - 4.0).abs() < 0.01);
        // 4 h * 0.15/h * 1.0 multiplier
        assert!((report.totals.estimated_cost - 0.6).abs() < 0.001);
    }

    #[test]
    fn test_rollup_applies_family_multiplier() {
        let rates = RateTable::builtin();
        let hosts = vec![make_host("u-1", HostProvider::Voltgrid, "console", Tier::Ultra, 5, 2)];
        let report = rollup(&hosts, window_last_day(), &UsageFilter::default(), &rates);
        // 2 h * 1.20/h * 1.3
        assert!((report.totals.estimated_cost - 3.12).abs() < 0.001);
        assert_eq!(report.per_host[0].multiplier, 1.3);
    }

    #[test]
    fn test_rollup_window_clips_elapsed() {
        let rates = RateTable::builtin();
        // Created 48 h ago, active until 12 h ago; a 24 h window only
        // overlaps 12 h of that.
        let mut host = make_host("u-1", HostProvider::Voltgrid, "retro", Tier::Basic, 48, 36);
        host.max_session_hours = 24;
        let report = rollup(&[host], window_last_day(), &UsageFilter::default(), &rates);
        assert!((report.totals.hours - 12.0).abs() < 0.01);
    }

    #[test]
    fn test_rollup_clamps_to_session_ceiling() {
        let rates = RateTable::builtin();
        let mut host = make_host("u-1", HostProvider::Voltgrid, "retro", Tier::Basic, 30, 30);
        host.max_session_hours = 8;
        let window = UsageWindow::new(Utc::now() - Duration::hours(40), Utc::now()).expect("window");
        let report = rollup(&[host], window, &UsageFilter::default(), &rates);
        assert!((report.totals.hours - 8.0).abs() < 0.01);
    }

    #[test]
    fn test_rollup_no_activity_accrues_nothing() {
        let rates = RateTable::builtin();
        let mut host = make_host("u-1", HostProvider::Voltgrid, "retro", Tier::Basic, 5, 2);
        host.last_activity = None;
        let report = rollup(&[host], window_last_day(), &UsageFilter::default(), &rates);
        assert_eq!(report.totals.estimated_cost, 0.0);
    }

    #[test]
    fn test_rollup_filters() {
        let rates = RateTable::builtin();
        let hosts = vec![
            make_host("u-1", HostProvider::Voltgrid, "retro", Tier::Basic, 10, 4),
            make_host("u-2", HostProvider::Nimbus, "retro", Tier::Basic, 10, 4),
        ];

        let by_provider = UsageFilter { provider: Some(HostProvider::Nimbus), user_id: None };
        let report = rollup(&hosts, window_last_day(), &by_provider, &rates);
        assert_eq!(report.totals.hosts, 1);
        assert_eq!(report.per_host[0].user_id, "u-2");

        let by_user = UsageFilter { provider: None, user_id: Some("u-1".to_string()) };
        let report = rollup(&hosts, window_last_day(), &by_user, &rates);
        assert_eq!(report.totals.hosts, 1);
        assert_eq!(report.per_host[0].provider, HostProvider::Voltgrid);
    }

    #[test]
    fn test_rate_fallback_to_tier_default() {
        let rates = RateTable::builtin();
        // "arcade" family is not listed; per-tier default applies.
        assert_eq!(rates.hourly_rate(Tier::Plus, "arcade", HostProvider::Voltgrid), 0.40);
        assert_eq!(rates.multiplier("arcade"), 1.0);
    }

    #[test]
    fn test_rate_table_load_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("rates.json");
        std::fs::write(&path, BUILTIN_RATES).expect("write");

        let rates = RateTable::load(&path).expect("load");
        assert_eq!(rates.hourly_rate(Tier::Basic, "retro", HostProvider::Voltgrid), 0.15);
    }

    #[test]
    fn test_window_validation() {
        let now = Utc::now();
        assert!(UsageWindow::new(now, now).is_err());
        assert!(UsageWindow::new(now, now - Duration::hours(1)).is_err());
        assert!(UsageWindow::new(now - Duration::hours(1), now).is_ok());
    }

    #[test]
    fn test_evaluate_caps_thresholds() {
        let (status, alerts) = evaluate_caps(100.0, 400.0, 500.0);
        assert_eq!(status, CapStatus::UnderCaps);
        assert!(alerts.is_empty());

        let (status, alerts) = evaluate_caps(320.0, 400.0, 500.0);
        assert_eq!(status, CapStatus::Approaching);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, AlertSeverity::Warning);

        let (status, _) = evaluate_caps(401.0, 400.0, 500.0);
        assert_eq!(status, CapStatus::SoftExceeded);

        let (status, alerts) = evaluate_caps(501.0, 400.0, 500.0);
        assert_eq!(status, CapStatus::HardExceeded);
        assert_eq!(alerts[0].severity, AlertSeverity::Critical);
    }
}
