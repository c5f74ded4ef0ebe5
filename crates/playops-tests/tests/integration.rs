//! Scenario tests across the PlayOps crates:
//! - Happy-path provisioning with geographic placement
//! - Nimbus region fallback when the locator is down
//! - Supervisor idle-timeout and three-strikes enforcement
//! - Hard spend-cap mass drain
//! - Concurrent stop collapse

use axum::{routing::get, Json, Router};
use chrono::{Duration as ChronoDuration, Utc};
use play_proto::{AgentHealth, Coord, HostProvider, HostState, StartedEvent};
use play_supervisor::{Supervisor, SupervisorConfig};
use playops_tests::{build_stack, inventory_node, profile, wait_for_state, FakeDriver, Stack};
use std::sync::Arc;
use std::time::Duration;

fn new_york() -> Coord {
    Coord::new(40.7128, -74.0060)
}

fn request(user: &str, platform: &str, coord: Option<Coord>) -> play_orchestrator::SessionRequest {
    play_orchestrator::SessionRequest {
        user_id: user.to_string(),
        platform: platform.to_string(),
        user_coord: coord,
        rom_ref: Some("roms/game-1".to_string()),
        save_ref: Some("saves/game-1/slot-1/main.sav".to_string()),
    }
}

fn supervisor_for(stack: &Stack, config: SupervisorConfig) -> Supervisor {
    Supervisor::new(
        stack.hosts.clone(),
        stack.rates.clone(),
        stack.drivers.clone(),
        stack.orch.clone(),
        config,
    )
}

/// Serve a fixed agent `/health` payload on an ephemeral port.
async fn spawn_agent(health: AgentHealth) -> u16 {
    let health = Arc::new(health);
    let app = Router::new().route(
        "/health",
        get(move || {
            let health = health.clone();
            async move { Json((*health).clone()) }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    port
}

// ─── Scenario 1: happy path, Voltgrid, US-East user ──────────────────────────

#[tokio::test]
async fn test_happy_path_voltgrid_us_east() {
    let driver = FakeDriver::voltgrid(vec![
        inventory_node("n-boston", "Boston", 0.50),
        inventory_node("n-dallas", "Dallas", 0.30),
    ]);
    let stack = build_stack(vec![driver.clone()], vec![profile("plat-a", HostProvider::Voltgrid)]);

    let host = stack
        .orch
        .request_session(request("u1", "plat-a", Some(new_york())))
        .await
        .expect("request");
    assert_eq!(host.state, HostState::Creating);

    let ready = wait_for_state(&stack.hosts, &host.host_id, HostState::Ready).await;
    assert_eq!(ready.address.as_deref(), Some("127.0.0.1"));
    assert!(ready.environment_ready);

    // Boston is closer to New York than Dallas, price notwithstanding.
    let spec = driver.last_spec.lock().clone().expect("spec");
    assert_eq!(spec.node_id.as_deref(), Some("n-boston"));

    let running = stack
        .orch
        .agent_started(&host.host_id, StartedEvent { started_at: Utc::now(), seq: Some(1) })
        .await
        .expect("started");
    assert_eq!(running.state, HostState::Running);
}

// ─── Scenario 2: Nimbus with locator failure ─────────────────────────────────

#[tokio::test]
async fn test_nimbus_locator_failure_falls_back_to_static_table() {
    let driver = FakeDriver::nimbus();
    let stack = build_stack(vec![driver.clone()], vec![profile("plat-b", HostProvider::Nimbus)]);

    // The stack's locator endpoint is unroutable, so the static table
    // must supply the region.
    let host = stack
        .orch
        .request_session(request("u1", "plat-b", Some(new_york())))
        .await
        .expect("request");
    wait_for_state(&stack.hosts, &host.host_id, HostState::Ready).await;

    let spec = driver.last_spec.lock().clone().expect("spec");
    assert_eq!(spec.region.as_deref(), Some("na-east"));
}

// ─── Scenario 3: idle timeout ────────────────────────────────────────────────

#[tokio::test]
async fn test_idle_timeout_stops_host_within_one_cycle() {
    let driver = FakeDriver::voltgrid(vec![inventory_node("n-boston", "Boston", 0.50)]);
    let stack = build_stack(vec![driver.clone()], vec![profile("plat-a", HostProvider::Voltgrid)]);

    let host = stack
        .orch
        .request_session(request("u1", "plat-a", Some(new_york())))
        .await
        .expect("request");
    wait_for_state(&stack.hosts, &host.host_id, HostState::Ready).await;
    stack
        .orch
        .agent_started(&host.host_id, StartedEvent { started_at: Utc::now(), seq: None })
        .await
        .expect("started");

    // Agent reports: no clients, idle for 11 minutes.
    let port = spawn_agent(AgentHealth {
        ok: true,
        connected_clients: 0,
        idle_since: Some(Utc::now() - ChronoDuration::minutes(11)),
        session_duration_secs: 3600,
    })
    .await;
    stack
        .hosts
        .mutate(&host.host_id, |h| h.agent_port = port)
        .expect("mutate port");

    let supervisor = supervisor_for(&stack, SupervisorConfig::default());
    supervisor.liveness_pass().await;

    let stopped = wait_for_state(&stack.hosts, &host.host_id, HostState::Stopped).await;
    assert_eq!(stopped.state, HostState::Stopped);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*driver.stop_calls.lock(), 1);
}

// ─── Scenario 3b: healthy probe refreshes activity ───────────────────────────

#[tokio::test]
async fn test_healthy_probe_resets_strikes_and_touches_activity() {
    let driver = FakeDriver::voltgrid(vec![inventory_node("n-boston", "Boston", 0.50)]);
    let stack = build_stack(vec![driver], vec![profile("plat-a", HostProvider::Voltgrid)]);

    let host = stack
        .orch
        .request_session(request("u1", "plat-a", Some(new_york())))
        .await
        .expect("request");
    wait_for_state(&stack.hosts, &host.host_id, HostState::Ready).await;

    let port = spawn_agent(AgentHealth {
        ok: true,
        connected_clients: 2,
        idle_since: None,
        session_duration_secs: 60,
    })
    .await;
    stack
        .hosts
        .mutate(&host.host_id, |h| {
            h.agent_port = port;
            h.unhealthy_strikes = 2;
        })
        .expect("mutate");

    let supervisor = supervisor_for(&stack, SupervisorConfig::default());
    supervisor.liveness_pass().await;

    let refreshed = stack.hosts.get(&host.host_id).expect("host");
    assert_eq!(refreshed.state, HostState::Ready);
    assert_eq!(refreshed.unhealthy_strikes, 0);
    assert!(refreshed.last_activity.is_some());
}

// ─── Scenario 4: watchdog destroys after three strikes ───────────────────────

#[tokio::test]
async fn test_three_consecutive_strikes_fail_and_destroy_once() {
    let driver = FakeDriver::voltgrid(vec![inventory_node("n-boston", "Boston", 0.50)]);
    let stack = build_stack(vec![driver.clone()], vec![profile("plat-a", HostProvider::Voltgrid)]);

    let host = stack
        .orch
        .request_session(request("u1", "plat-a", Some(new_york())))
        .await
        .expect("request");
    wait_for_state(&stack.hosts, &host.host_id, HostState::Ready).await;

    // No agent listening on this port: every probe is refused. The
    // provider still knows the host, so this is the strike path.
    stack.hosts.mutate(&host.host_id, |h| h.agent_port = 1).expect("mutate");

    let supervisor = supervisor_for(&stack, SupervisorConfig::default());
    supervisor.liveness_pass().await;
    assert_eq!(stack.hosts.get(&host.host_id).expect("host").unhealthy_strikes, 1);
    supervisor.liveness_pass().await;
    assert_eq!(stack.hosts.get(&host.host_id).expect("host").unhealthy_strikes, 2);
    supervisor.liveness_pass().await;

    let failed = wait_for_state(&stack.hosts, &host.host_id, HostState::Failed).await;
    assert!(failed.last_error.is_some());

    // Once FAILED, later sweeps skip the host; destroy fired exactly once.
    supervisor.liveness_pass().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*driver.destroy_calls.lock(), 1);
}

#[tokio::test]
async fn test_provider_lost_host_is_orphaned_immediately() {
    let driver = FakeDriver::voltgrid(vec![inventory_node("n-boston", "Boston", 0.50)]);
    let stack = build_stack(vec![driver.clone()], vec![profile("plat-a", HostProvider::Voltgrid)]);

    let host = stack
        .orch
        .request_session(request("u1", "plat-a", Some(new_york())))
        .await
        .expect("request");
    wait_for_state(&stack.hosts, &host.host_id, HostState::Ready).await;

    stack.hosts.mutate(&host.host_id, |h| h.agent_port = 1).expect("mutate");
    driver.lose_host();

    let supervisor = supervisor_for(&stack, SupervisorConfig::default());
    supervisor.liveness_pass().await;

    let failed = stack.hosts.get(&host.host_id).expect("host");
    assert_eq!(failed.state, HostState::Failed);
}

// ─── Scenario 6: hard spend cap ──────────────────────────────────────────────

#[tokio::test]
async fn test_hard_spend_cap_drains_fleet_but_allows_new_requests() {
    let driver = FakeDriver::voltgrid(vec![inventory_node("n-boston", "Boston", 0.50)]);
    let stack = build_stack(vec![driver.clone()], vec![profile("plat-a", HostProvider::Voltgrid)]);

    // Three running hosts with enough accrued hours to blow a tiny cap.
    let mut ids = Vec::new();
    for i in 0..3 {
        let host = stack
            .orch
            .request_session(request(&format!("cap-user-{i}"), "plat-a", Some(new_york())))
            .await
            .expect("request");
        wait_for_state(&stack.hosts, &host.host_id, HostState::Ready).await;
        stack
            .orch
            .agent_started(&host.host_id, StartedEvent { started_at: Utc::now(), seq: None })
            .await
            .expect("started");
        stack
            .hosts
            .mutate(&host.host_id, |h| {
                h.created_at = Utc::now() - ChronoDuration::hours(6);
                h.last_activity = Some(Utc::now());
            })
            .expect("mutate");
        ids.push(host.host_id);
    }

    // A zero hard cap is always exceeded, whatever the month-to-date
    // overlap happens to be.
    let supervisor = supervisor_for(
        &stack,
        SupervisorConfig {
            monthly_soft_cap_usd: 0.0,
            monthly_hard_cap_usd: 0.0,
            ..SupervisorConfig::default()
        },
    );
    supervisor.liveness_pass().await;

    for id in &ids {
        let host = wait_for_state(&stack.hosts, id, HostState::Stopped).await;
        assert_eq!(host.state, HostState::Stopped);
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*driver.stop_calls.lock(), 3);

    // The cap drains running cost; it does not block new sessions.
    let new_host = stack
        .orch
        .request_session(request("cap-user-99", "plat-a", Some(new_york())))
        .await
        .expect("new request after drain");
    assert_eq!(new_host.state, HostState::Creating);
}

// ─── Concurrency: stop collapse ──────────────────────────────────────────────

#[tokio::test]
async fn test_concurrent_stops_collapse_to_one_provider_call() {
    let driver = FakeDriver::voltgrid(vec![inventory_node("n-boston", "Boston", 0.50)]);
    let stack = build_stack(vec![driver.clone()], vec![profile("plat-a", HostProvider::Voltgrid)]);

    let host = stack
        .orch
        .request_session(request("u1", "plat-a", Some(new_york())))
        .await
        .expect("request");
    wait_for_state(&stack.hosts, &host.host_id, HostState::Ready).await;

    let (a, b) = tokio::join!(
        stack.orch.stop_session(&host.host_id),
        stack.orch.stop_session(&host.host_id),
    );
    assert_eq!(a.expect("stop a").state, HostState::Stopped);
    assert_eq!(b.expect("stop b").state, HostState::Stopped);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*driver.stop_calls.lock(), 1);
}

// ─── Boundary: origin coordinate ─────────────────────────────────────────────

#[tokio::test]
async fn test_origin_coordinate_produces_ranked_placement() {
    let driver = FakeDriver::voltgrid(vec![inventory_node("n-boston", "Boston", 0.50)]);
    let stack = build_stack(vec![driver.clone()], vec![profile("plat-a", HostProvider::Voltgrid)]);

    let host = stack
        .orch
        .request_session(request("u1", "plat-a", Some(Coord::new(0.0, 0.0))))
        .await
        .expect("request");
    wait_for_state(&stack.hosts, &host.host_id, HostState::Ready).await;

    let spec = driver.last_spec.lock().clone().expect("spec");
    assert_eq!(spec.node_id.as_deref(), Some("n-boston"));
}
