//! Scheduling, attribution and eviction of the wavemeter arbiter on the
//! simulated bench. Runs on paused tokio time.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

use wavelock::arbiter::ResourceArbiter;
use wavelock::config::ArbiterConfig;
use wavelock::error::WlmError;
use wavelock::hardware::{MockSwitch, MockWavemeter, SimulatedBench};

/// Arbiter on a noise-free bench; returns a handle to its switch.
fn start_arbiter(config: ArbiterConfig) -> (Arc<ResourceArbiter>, Arc<SimulatedBench>, MockSwitch) {
    let bench = SimulatedBench::new(1550.0);
    let switch = MockSwitch::new(Arc::clone(&bench), 8);
    let arbiter = ResourceArbiter::new(config);
    arbiter.start(
        Box::new(switch.clone()),
        Box::new(MockWavemeter::new(Arc::clone(&bench), 0.0)),
    );
    (arbiter, bench, switch)
}

async fn wait_for_current(arbiter: &ResourceArbiter, name: &str, within: Duration) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if arbiter.current_user().as_deref() == Some(name) {
            return true;
        }
        sleep(Duration::from_millis(5)).await;
    }
    false
}

#[tokio::test(start_paused = true)]
async fn test_every_client_gets_a_turn() {
    let (arbiter, _bench, switch) = start_arbiter(ArbiterConfig::default());
    arbiter
        .register("CTL1", Some(Duration::from_millis(500)))
        .unwrap();
    arbiter
        .register("CTL2", Some(Duration::from_millis(500)))
        .unwrap();
    arbiter
        .register("TSL550", Some(Duration::from_secs(1)))
        .unwrap();

    let mut seen = BTreeSet::new();
    let started = Instant::now();
    while started.elapsed() < Duration::from_secs(4) {
        if let Some(user) = arbiter.current_user() {
            seen.insert(user);
        }
        sleep(Duration::from_millis(10)).await;
    }

    let expected: BTreeSet<String> = ["CTL1", "CTL2", "TSL550"]
        .into_iter()
        .map(String::from)
        .collect();
    assert_eq!(seen, expected);

    let selected: BTreeSet<u8> = switch.selections().into_iter().collect();
    assert_eq!(selected, BTreeSet::from([1, 2, 3]));
    arbiter.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_unknown_client_is_rejected() {
    let (arbiter, _bench, _switch) = start_arbiter(ArbiterConfig::default());

    let err = arbiter.register("UNKNOWN", None).unwrap_err();
    assert!(matches!(err, WlmError::UnknownClient(ref name) if name == "UNKNOWN"));
    assert!(arbiter.active_users().is_empty());
    assert!(!arbiter.available_clients().contains(&"UNKNOWN".to_string()));
    arbiter.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_readings_go_to_the_right_client() {
    let (arbiter, bench, _switch) = start_arbiter(ArbiterConfig::default());
    bench.set_source(1, 1550.1);
    bench.set_source(2, 1541.3);
    arbiter.register("CTL1", None).unwrap();
    arbiter.register("CTL2", None).unwrap();

    for _ in 0..5 {
        let ctl1 = arbiter
            .query_wavelength("CTL1", Duration::from_secs(10))
            .await
            .unwrap();
        let ctl2 = arbiter
            .query_wavelength("CTL2", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(ctl1, 1550.1);
        assert_eq!(ctl2, 1541.3);
    }
    arbiter.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_unregistered_query_fails_without_blocking() {
    let (arbiter, _bench, _switch) = start_arbiter(ArbiterConfig::default());
    arbiter.register("CTL2", None).unwrap();

    let started = Instant::now();
    let err = arbiter
        .query_wavelength("CTL1", Duration::from_secs(10))
        .await
        .unwrap_err();
    assert!(matches!(err, WlmError::NotRegistered(_)));
    assert_eq!(started.elapsed(), Duration::ZERO);
    arbiter.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_current_client_query_returns_within_a_tick() {
    let config = ArbiterConfig::default();
    let tick = config.scheduler_tick();
    let poll = config.query_poll();
    let (arbiter, _bench, _switch) = start_arbiter(config);
    arbiter
        .register("CTL1", Some(Duration::from_secs(2)))
        .unwrap();
    arbiter
        .register("CTL2", Some(Duration::from_secs(2)))
        .unwrap();
    assert!(wait_for_current(&arbiter, "CTL1", Duration::from_secs(5)).await);
    sleep(Duration::from_millis(300)).await;

    let started = Instant::now();
    arbiter
        .query_wavelength("CTL1", Duration::from_secs(10))
        .await
        .unwrap();
    assert!(started.elapsed() <= tick + poll, "{:?}", started.elapsed());
    arbiter.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_idle_sessions_are_evicted() {
    let (arbiter, _bench, _switch) = start_arbiter(ArbiterConfig::default());
    arbiter.register("CTL1", None).unwrap();
    arbiter.register("CTL2", None).unwrap();

    // CTL2 keeps querying, CTL1 goes silent.
    let started = Instant::now();
    while started.elapsed() < Duration::from_secs(65) {
        arbiter
            .query_wavelength("CTL2", Duration::from_secs(10))
            .await
            .unwrap();
        sleep(Duration::from_secs(1)).await;
    }

    let sessions = arbiter.active_sessions();
    assert!(!sessions.contains_key("CTL1"));
    assert!(sessions.contains_key("CTL2"));
    assert!(matches!(
        arbiter
            .query_wavelength("CTL1", Duration::from_secs(1))
            .await,
        Err(WlmError::NotRegistered(_))
    ));
    arbiter.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_removed_holder_leaves_switch_unowned() {
    let (arbiter, _bench, _switch) = start_arbiter(ArbiterConfig::default());
    arbiter
        .register("CTL1", Some(Duration::from_secs(2)))
        .unwrap();
    arbiter
        .register("CTL2", Some(Duration::from_secs(2)))
        .unwrap();
    assert!(wait_for_current(&arbiter, "CTL1", Duration::from_secs(5)).await);

    arbiter.deregister("CTL1").unwrap();
    assert_eq!(arbiter.current_user(), None);

    let started = Instant::now();
    while started.elapsed() < Duration::from_secs(3) {
        assert_ne!(arbiter.current_user().as_deref(), Some("CTL1"));
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(arbiter.current_user().as_deref(), Some("CTL2"));
    arbiter.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_switch_faults_skip_the_slot() {
    let (arbiter, _bench, switch) = start_arbiter(ArbiterConfig::default());
    switch.fail_next(3);
    arbiter.register("CTL1", None).unwrap();

    assert!(wait_for_current(&arbiter, "CTL1", Duration::from_secs(3)).await);
    // Three failed attempts with two reconnects, then a successful slot.
    assert_eq!(switch.reconnects(), 2);
    assert!(switch.calls() >= 4);
    assert_eq!(switch.selections(), vec![1]);
    arbiter.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_status_codes_are_shown_but_not_attributed() {
    let bench = SimulatedBench::new(1550.0);
    let wavemeter = MockWavemeter::new(Arc::clone(&bench), 0.0);
    let arbiter = ResourceArbiter::new(ArbiterConfig::default());
    arbiter.start(
        Box::new(MockSwitch::new(Arc::clone(&bench), 8)),
        Box::new(wavemeter.clone()),
    );
    wavemeter.force_reading(Some(-3.0));
    arbiter.register("CTL1", None).unwrap();

    let err = arbiter
        .query_wavelength("CTL1", Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, WlmError::Timeout { .. }));
    assert_eq!(arbiter.latest_reading(), Some(-3.0));
    assert_eq!(arbiter.last_readings()["CTL1"], None);
    arbiter.shutdown().await;
}
