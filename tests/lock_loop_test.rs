//! End-to-end lock loops on the simulated bench: simulated lasers shine on
//! the switch inputs, the arbiter shares the wavemeter between them.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use wavelock::arbiter::ResourceArbiter;
use wavelock::config::{ArbiterConfig, LaserDefinition, LaserKind, LockConfig};
use wavelock::error::WlmError;
use wavelock::hardware::{MockSwitch, MockWavemeter, SimulatedBench};
use wavelock::lock::{
    LaserLock, LaserParams, LockController, LockState, SimulatedLaser, WavelengthSource,
};
use wavelock::units::freq_diff_mhz;

struct Bench {
    bench: Arc<SimulatedBench>,
    arbiter: Arc<ResourceArbiter>,
    wavemeter: MockWavemeter,
}

fn bench() -> Bench {
    let bench = SimulatedBench::new(1550.0);
    let wavemeter = MockWavemeter::new(Arc::clone(&bench), 0.0);
    let arbiter = ResourceArbiter::new(ArbiterConfig::default());
    arbiter.start(
        Box::new(MockSwitch::new(Arc::clone(&bench), 8)),
        Box::new(wavemeter.clone()),
    );
    Bench {
        bench,
        arbiter,
        wavemeter,
    }
}

fn laser(bench: &Bench, name: &str, channel: u8) -> SimulatedLaser {
    let params = LaserParams::from(&LaserDefinition {
        name: name.to_string(),
        r#type: LaserKind::Simulated,
        ..LaserDefinition::default()
    });
    SimulatedLaser::new(params, Arc::clone(&bench.bench), channel).with_coarse_error_nm(0.02)
}

fn controller(bench: &Bench, config: LockConfig, laser: &SimulatedLaser) -> LockController {
    let source: Arc<dyn WavelengthSource> = bench.arbiter.clone();
    LockController::new(config, source, vec![Box::new(laser.clone())])
}

#[tokio::test(start_paused = true)]
async fn test_lock_follows_detuning() {
    let bench = bench();
    let ctl1 = laser(&bench, "CTL1", 1);
    let lock = LaserLock::new(
        controller(&bench, LockConfig::default(), &ctl1),
        "CTL1",
        1550.5,
        Duration::from_millis(200),
    )
    .unwrap();

    lock.remote_start().await.unwrap();
    assert!(lock.get_is_running());
    assert!(freq_diff_mhz(ctl1.output_nm(), 1550.5).abs() < 500.0);

    let setpoint = lock.change_detuning(0.2).await.unwrap();
    assert!(setpoint < 1550.5);
    assert_eq!(lock.effective_setpoint(), setpoint);

    sleep(Duration::from_secs(15)).await;
    let error_mhz = freq_diff_mhz(ctl1.output_nm(), setpoint);
    assert!(error_mhz.abs() < 1.0, "{error_mhz} MHz off");
    assert!(ctl1.feedback() != 0.0);

    let samples = lock.samples();
    assert!(!samples.is_empty());
    assert!(samples.iter().all(|s| s.accepted));
    assert!(lock.snapshot().current_wavelength.is_some());

    lock.remote_stop().await.unwrap();
    assert!(!lock.get_is_running());
    assert_eq!(ctl1.feedback(), 0.0);
    assert!(bench.arbiter.active_users().is_empty());
    bench.arbiter.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_two_locks_share_the_wavemeter() {
    let bench = bench();
    let ctl1 = laser(&bench, "CTL1", 1);
    let ctl2 = laser(&bench, "CTL2", 2);
    let lock1 = LaserLock::new(
        controller(&bench, LockConfig::default(), &ctl1),
        "CTL1",
        1550.0,
        Duration::from_millis(200),
    )
    .unwrap();
    let lock2 = LaserLock::new(
        controller(&bench, LockConfig::default(), &ctl2),
        "CTL2",
        1541.3,
        Duration::from_millis(200),
    )
    .unwrap();

    let (started1, started2) = tokio::join!(lock1.remote_start(), lock2.remote_start());
    started1.unwrap();
    started2.unwrap();
    sleep(Duration::from_secs(10)).await;

    for (lock, setpoint) in [(&lock1, 1550.0), (&lock2, 1541.3)] {
        let samples = lock.samples();
        assert!(samples.len() >= 2, "{} ticked {} times", lock.laser(), samples.len());
        for sample in samples {
            assert!(sample.accepted);
            assert!(freq_diff_mhz(sample.wavelength_nm, setpoint).abs() < 500.0);
        }
    }

    lock1.remote_stop().await.unwrap();
    lock2.remote_stop().await.unwrap();
    bench.arbiter.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_pause_holds_then_stop_resets() {
    let bench = bench();
    let ctl1 = laser(&bench, "CTL1", 1);
    let lock = LaserLock::new(
        controller(&bench, LockConfig::default(), &ctl1),
        "CTL1",
        1550.5,
        Duration::from_millis(200),
    )
    .unwrap();
    lock.remote_start().await.unwrap();
    lock.change_detuning(0.2).await.unwrap();
    sleep(Duration::from_secs(10)).await;

    lock.remote_pause().await.unwrap();
    let held = ctl1.feedback();
    assert!(held != 0.0);
    assert!(!lock.get_is_running());
    assert!(bench.arbiter.active_users().is_empty());

    sleep(Duration::from_secs(2)).await;
    assert_eq!(ctl1.feedback(), held);

    lock.remote_stop().await.unwrap();
    assert_eq!(ctl1.feedback(), 0.0);
    bench.arbiter.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_coarse_setting_gives_up() {
    let bench = bench();
    let ctl1 = laser(&bench, "CTL1", 1);
    let config = LockConfig {
        coarse_max_iterations: 3,
        ..LockConfig::default()
    };
    let mut lock = controller(&bench, config, &ctl1);
    // The wavemeter sees the laser stuck 1.5 nm away.
    bench.wavemeter.force_reading(Some(1549.0));

    lock.initialize("CTL1", 1550.5).await.unwrap();
    let err = lock.coarse_set().await.unwrap_err();
    assert!(matches!(
        err,
        WlmError::CoarseSetNotConverged { iterations: 3, .. }
    ));
    assert_eq!(ctl1.coarse_calls(), 1);
    assert_eq!(ctl1.corrections(), 3);
    assert_eq!(lock.state(), LockState::CoarseSetting);

    lock.terminate(true).await;
    assert_eq!(lock.state(), LockState::Idle);
    bench.arbiter.shutdown().await;
}

/// Lock whose coarse setting never converges, started in the background.
fn stuck_start(
    bench: &Bench,
    ctl1: &SimulatedLaser,
) -> (Arc<LaserLock>, JoinHandle<Result<(), WlmError>>) {
    let config = LockConfig {
        coarse_max_iterations: 1000,
        ..LockConfig::default()
    };
    bench.wavemeter.force_reading(Some(1549.0));
    let lock = Arc::new(
        LaserLock::new(
            controller(bench, config, ctl1),
            "CTL1",
            1550.5,
            Duration::from_millis(200),
        )
        .unwrap(),
    );
    let starting = Arc::clone(&lock);
    let start = tokio::spawn(async move { starting.remote_start().await });
    (lock, start)
}

#[tokio::test(start_paused = true)]
async fn test_pause_during_coarse_setting_leaves_lock_paused() {
    let bench = bench();
    let ctl1 = laser(&bench, "CTL1", 1);
    let (lock, start) = stuck_start(&bench, &ctl1);
    sleep(Duration::from_secs(2)).await;
    assert!(ctl1.corrections() > 0);

    lock.remote_pause().await.unwrap();
    let started = start.await.unwrap();
    assert!(matches!(started, Err(WlmError::InvalidState(_))));
    assert_eq!(lock.state().await, LockState::Paused);
    assert!(!lock.get_is_running());
    assert!(bench.arbiter.active_users().is_empty());

    lock.remote_stop().await.unwrap();
    assert_eq!(lock.state().await, LockState::Idle);
    bench.arbiter.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_coarse_setting_terminates() {
    let bench = bench();
    let ctl1 = laser(&bench, "CTL1", 1);
    let (lock, start) = stuck_start(&bench, &ctl1);
    sleep(Duration::from_secs(2)).await;

    lock.remote_stop().await.unwrap();
    assert!(start.await.unwrap().is_err());
    assert_eq!(lock.state().await, LockState::Idle);
    assert_eq!(ctl1.feedback(), 0.0);
    assert!(bench.arbiter.active_users().is_empty());

    // A later start runs from scratch once the wavemeter sees the laser again.
    bench.wavemeter.force_reading(None);
    lock.remote_start().await.unwrap();
    assert_eq!(lock.state().await, LockState::Tracking);
    lock.remote_stop().await.unwrap();
    bench.arbiter.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_setpoint_change_steers_next_tick() {
    let bench = bench();
    let ctl1 = laser(&bench, "CTL1", 1);
    let mut lock = controller(&bench, LockConfig::default(), &ctl1);
    lock.initialize("CTL1", 1550.5).await.unwrap();
    lock.coarse_set().await.unwrap();

    assert!(matches!(
        lock.change_setpoint(1600.0),
        Err(WlmError::SetpointOutOfRange { .. })
    ));
    assert_eq!(lock.setpoint(), 1550.5);

    let before = ctl1.output_nm();
    lock.change_setpoint(1550.5005).unwrap();
    sleep(Duration::from_millis(200)).await;
    let outcome = lock.tick(Duration::from_secs(1)).await.unwrap();
    assert!(outcome.accepted);
    // The laser sits below the new setpoint, so its output has to grow.
    assert!(outcome.feedback < 0.0);
    assert!(ctl1.output_nm() > before);

    lock.terminate(true).await;
    bench.arbiter.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_terminate_is_idempotent() {
    let bench = bench();
    let ctl1 = laser(&bench, "CTL1", 1);
    let mut lock = controller(&bench, LockConfig::default(), &ctl1);

    lock.terminate(true).await;
    assert_eq!(lock.state(), LockState::Idle);

    lock.initialize("CTL1", 1550.5).await.unwrap();
    lock.coarse_set().await.unwrap();
    lock.terminate(true).await;
    lock.terminate(true).await;
    assert_eq!(lock.state(), LockState::Idle);
    assert!(bench.arbiter.active_users().is_empty());
    bench.arbiter.shutdown().await;
}
