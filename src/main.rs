//! `wavelock` command-line entry point.
//!
//! ```text
//! wavelock server                          # share the wavemeter
//! wavelock lock --laser CTL2               # lock one laser through it
//! wavelock remote --target laser_lock_CTL2 start
//! wavelock users                           # who is using the wavemeter
//! wavelock demo --secs 60                  # everything simulated, one process
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use wavelock::arbiter::ResourceArbiter;
use wavelock::config::{LaserDefinition, LaserKind, Settings, SwitchBackend, WavemeterBackend};
use wavelock::hardware::{MockSwitch, MockWavemeter, SimulatedBench, SwitchPort, WavemeterPort};
use wavelock::lock::{
    build_actuator, Endpoint, LaserLock, LaserParams, LockController, RemoteArbiter,
    SimulatedLaser, WavelengthSource,
};
use wavelock::registry::{find_or_start, NameServerClient, RegistrationPolicy};
use wavelock::rpc::{ArbiterService, LaserLockService, RpcClient, RpcServer};

#[derive(Parser, Debug)]
#[command(author, version, about = "Time-shared wavemeter server and laser locks")]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = "config/wavelock.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the wavemeter server
    Server,
    /// Run a laser lock against the wavemeter server
    Lock {
        /// Configured laser to lock (defaults to the first one)
        #[arg(long)]
        laser: Option<String>,
        /// Initial base wavelength in nm (defaults to mid-range)
        #[arg(long)]
        wavelength: Option<f64>,
    },
    /// Control a running laser lock
    Remote {
        /// Registered name or `host:port` of the lock
        #[arg(long)]
        target: String,
        #[command(subcommand)]
        action: RemoteAction,
    },
    /// Show the wavemeter server's clients
    Users,
    /// Arbiter, simulated lasers and their locks in one process
    Demo {
        /// How long to run
        #[arg(long, default_value_t = 30)]
        secs: u64,
    },
}

#[derive(Subcommand, Debug)]
enum RemoteAction {
    /// Coarse-set and start locking
    Start,
    /// Stop locking and reset the feedback
    Stop,
    /// Stop locking and hold the feedback
    Pause,
    /// Stage the base wavelength (nm)
    SetSetpoint { wavelength: f64 },
    /// Stage the detuning (GHz)
    SetDetuning { detuning: f64 },
    /// Change the detuning of a running lock (GHz)
    ChangeDetuning { detuning: f64 },
    /// Print the display snapshot
    Snapshot,
    /// Print whether the lock is running
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    wavelock::logging::init_from_config(&settings)?;

    match cli.command {
        Command::Server => run_server(settings).await,
        Command::Lock { laser, wavelength } => run_lock(settings, laser, wavelength).await,
        Command::Remote { target, action } => run_remote(&settings, &target, action).await,
        Command::Users => run_users(&settings).await,
        Command::Demo { secs } => run_demo(settings, Duration::from_secs(secs)).await,
    }
}

async fn build_switch(settings: &Settings, bench: &Arc<SimulatedBench>) -> Result<Box<dyn SwitchPort>> {
    let switch = &settings.switch;
    match switch.backend {
        SwitchBackend::Mock => Ok(Box::new(MockSwitch::new(
            Arc::clone(bench),
            switch.number_of_channels,
        ))),
        #[cfg(feature = "instrument_serial")]
        SwitchBackend::Sercalo => {
            use wavelock::adapters::{Adapter, SerialAdapter};
            use wavelock::hardware::SercaloSwitch;

            let mut adapter = SerialAdapter::new(switch.port.clone(), switch.baud_rate)
                .with_timeout(Duration::from_millis(switch.timeout_ms));
            adapter.connect().await?;
            let mut sercalo = SercaloSwitch::new(adapter, switch.number_of_channels);
            let product = sercalo
                .product_info()
                .await
                .context("optical switch did not identify itself")?;
            info!(?product, port = %switch.port, "optical switch connected");
            Ok(Box::new(sercalo))
        }
        #[cfg(not(feature = "instrument_serial"))]
        SwitchBackend::Sercalo => {
            bail!("Sercalo switch requires the instrument_serial feature")
        }
    }
}

fn build_wavemeter(settings: &Settings, bench: &Arc<SimulatedBench>) -> Box<dyn WavemeterPort> {
    match settings.wavemeter.backend {
        WavemeterBackend::Simulated => Box::new(MockWavemeter::new(
            Arc::clone(bench),
            settings.wavemeter.noise_mhz,
        )),
    }
}

async fn publish_name(
    settings: &Settings,
    name: &str,
    endpoint: SocketAddr,
    policy: RegistrationPolicy,
    cancel: &CancellationToken,
) -> Option<(NameServerClient, String)> {
    if !settings.nameserver.enabled {
        return None;
    }
    let ns = &settings.nameserver;
    let result = async {
        let mut client = find_or_start(&ns.address, ns.start_if_missing, cancel).await?;
        let registered = client.register(name, &endpoint.to_string(), policy).await?;
        Ok::<_, wavelock::error::WlmError>((client, registered))
    }
    .await;
    match result {
        Ok((client, registered)) => {
            info!(name = %registered, %endpoint, "registered on name server");
            Some((client, registered))
        }
        Err(e) => {
            warn!(error = %e, "name server unavailable, serving by address only");
            None
        }
    }
}

async fn unpublish(registration: Option<(NameServerClient, String)>) {
    if let Some((mut client, name)) = registration {
        if let Err(e) = client.remove(&name).await {
            warn!(%name, error = %e, "could not remove name registration");
        }
    }
}

async fn run_server(settings: Settings) -> Result<()> {
    let cancel = CancellationToken::new();
    let bench = SimulatedBench::new(settings.wavemeter.idle_wavelength_nm);
    let switch = build_switch(&settings, &bench).await?;
    let wavemeter = build_wavemeter(&settings, &bench);

    let arbiter = ResourceArbiter::new(settings.arbiter.clone());
    arbiter.start(switch, wavemeter);

    let service = Arc::new(ArbiterService::new(
        Arc::clone(&arbiter),
        settings.lock.query_timeout(),
    ));
    let server = RpcServer::bind(&settings.arbiter.bind, service, cancel.child_token()).await?;
    let addr = server.local_addr()?;
    let server = server.spawn();
    let registration = publish_name(
        &settings,
        &settings.arbiter.share_name,
        addr,
        RegistrationPolicy::Replace,
        &cancel,
    )
    .await;

    info!(%addr, "wavemeter server running, Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    unpublish(registration).await;
    cancel.cancel();
    arbiter.shutdown().await;
    if let Err(e) = server.await? {
        error!(error = %e, "rpc server failed");
    }
    Ok(())
}

fn pick_laser<'a>(settings: &'a Settings, laser: Option<&str>) -> Result<&'a LaserDefinition> {
    match laser {
        Some(name) => settings
            .laser(name)
            .with_context(|| format!("laser '{name}' is not configured")),
        None => settings
            .lasers
            .first()
            .context("no lasers configured"),
    }
}

async fn run_lock(settings: Settings, laser: Option<String>, wavelength: Option<f64>) -> Result<()> {
    let cancel = CancellationToken::new();
    let def = pick_laser(&settings, laser.as_deref())?;
    if def.r#type == LaserKind::Simulated {
        bail!("simulated laser '{}' can only run in the demo", def.name);
    }

    let endpoint = match &settings.lock.arbiter_address {
        Some(address) => Endpoint::Address(address.clone()),
        None => Endpoint::Named {
            nameserver: settings.nameserver.address.clone(),
            name: settings.lock.arbiter_name.clone(),
        },
    };
    let source: Arc<dyn WavelengthSource> = Arc::new(RemoteArbiter::new(
        endpoint,
        settings.lock.reconnect_policy(),
    ));

    let actuator = build_actuator(def, None)?;
    let controller = LockController::new(settings.lock.clone(), source, vec![actuator]);
    let base = wavelength.unwrap_or((def.wl_min + def.wl_max) / 2.0);
    let lock = Arc::new(LaserLock::new(
        controller,
        &def.name,
        base,
        settings.lock.update_interval(),
    )?);

    let service = Arc::new(LaserLockService::new(Arc::clone(&lock)));
    let server = RpcServer::bind(&settings.lock.bind, service, cancel.child_token()).await?;
    let addr = server.local_addr()?;
    let server = server.spawn();

    let (name, policy) = match laser {
        Some(laser) => (format!("laser_lock_{laser}"), RegistrationPolicy::Replace),
        None => ("laser_lock".to_string(), RegistrationPolicy::AutoIncrement),
    };
    let registration = publish_name(&settings, &name, addr, policy, &cancel).await;

    info!(laser = %def.name, %addr, "laser lock ready, Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    if let Err(e) = lock.remote_stop().await {
        error!(error = %e, "lock did not stop cleanly");
    }
    unpublish(registration).await;
    cancel.cancel();
    if let Err(e) = server.await? {
        error!(error = %e, "rpc server failed");
    }
    Ok(())
}

async fn resolve(settings: &Settings, target: &str) -> Result<String> {
    if target.parse::<SocketAddr>().is_ok() {
        return Ok(target.to_string());
    }
    let mut nameserver = NameServerClient::connect(&settings.nameserver.address)
        .await
        .with_context(|| format!("no name server at {}", settings.nameserver.address))?;
    Ok(nameserver.resolve(target).await?)
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_remote(settings: &Settings, target: &str, action: RemoteAction) -> Result<()> {
    let addr = resolve(settings, target).await?;
    let mut client = RpcClient::connect(&addr).await?;

    let (method, params) = match action {
        RemoteAction::Start => ("remote_start", Value::Null),
        RemoteAction::Stop => ("remote_stop", Value::Null),
        RemoteAction::Pause => ("remote_pause", Value::Null),
        RemoteAction::SetSetpoint { wavelength } => {
            ("set_wavelength_setpoint", json!({ "wavelength": wavelength }))
        }
        RemoteAction::SetDetuning { detuning } => ("set_detuning", json!({ "detuning": detuning })),
        RemoteAction::ChangeDetuning { detuning } => {
            ("change_detuning", json!({ "detuning": detuning }))
        }
        RemoteAction::Snapshot => ("snapshot", Value::Null),
        RemoteAction::Status => ("get_is_running", Value::Null),
    };
    let result: Value = client.call(method, params).await?;
    print_json(&result)
}

async fn run_users(settings: &Settings) -> Result<()> {
    let target = settings
        .lock
        .arbiter_address
        .clone()
        .unwrap_or_else(|| settings.arbiter.share_name.clone());
    let addr = resolve(settings, &target).await?;
    let mut client = RpcClient::connect(&addr).await?;

    let available: Value = client.call("query_available_users", Value::Null).await?;
    let users: Value = client.call("query_users", Value::Null).await?;
    let current: Value = client.call("query_current_user", Value::Null).await?;
    let readings: Value = client.call("query_last_readings", Value::Null).await?;
    print_json(&json!({
        "available": available,
        "active": users,
        "current": current,
        "last_readings": readings,
    }))
}

fn demo_lasers(settings: &Settings) -> Vec<(LaserDefinition, f64)> {
    let simulated: Vec<_> = settings
        .lasers
        .iter()
        .filter(|l| l.r#type == LaserKind::Simulated)
        .map(|l| (l.clone(), (l.wl_min + l.wl_max) / 2.0))
        .collect();
    if !simulated.is_empty() {
        return simulated;
    }
    [("CTL1", 1550.0), ("CTL2", 1541.3)]
        .into_iter()
        .map(|(name, base)| {
            (
                LaserDefinition {
                    name: name.to_string(),
                    ..LaserDefinition::default()
                },
                base,
            )
        })
        .collect()
}

async fn run_demo(settings: Settings, duration: Duration) -> Result<()> {
    let bench = SimulatedBench::new(settings.wavemeter.idle_wavelength_nm);
    let arbiter = ResourceArbiter::new(settings.arbiter.clone());
    arbiter.start(
        Box::new(MockSwitch::new(
            Arc::clone(&bench),
            settings.switch.number_of_channels,
        )),
        build_wavemeter(&settings, &bench),
    );
    let source: Arc<dyn WavelengthSource> = arbiter.clone();

    let mut locks = Vec::new();
    for (def, base) in demo_lasers(&settings) {
        let Some(&channel) = settings.arbiter.channels.get(&def.name) else {
            warn!(laser = %def.name, "no switch channel for laser, skipped");
            continue;
        };
        let laser = SimulatedLaser::new(LaserParams::from(&def), Arc::clone(&bench), channel)
            .with_start_wavelength(base + 0.05)
            .with_coarse_error_nm(0.02);
        let controller = LockController::new(
            settings.lock.clone(),
            Arc::clone(&source),
            vec![Box::new(laser)],
        );
        let lock = Arc::new(LaserLock::new(
            controller,
            &def.name,
            base,
            settings.lock.update_interval(),
        )?);
        locks.push(lock);
    }

    let starts = locks.iter().map(|lock| {
        let lock = Arc::clone(lock);
        tokio::spawn(async move {
            if let Err(e) = lock.remote_start().await {
                error!(laser = %lock.laser(), error = %e, "lock failed to start");
            }
        })
    });
    for start in starts.collect::<Vec<_>>() {
        start.await?;
    }

    let now = tokio::time::Instant::now();
    // `--secs` has no upper bound; past the clock's range run until Ctrl-C.
    let deadline = now
        .checked_add(duration)
        .unwrap_or(now + Duration::from_secs(86400 * 365 * 30));
    let mut report = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tokio::time::sleep_until(deadline) => break,
            _ = report.tick() => {
                for lock in &locks {
                    let snapshot = lock.snapshot();
                    info!(
                        laser = %lock.laser(),
                        wavelength = ?snapshot.current_wavelength,
                        setpoint = lock.effective_setpoint(),
                        running = snapshot.running,
                        "demo"
                    );
                }
                info!(current = ?arbiter.current_user(), "wavemeter");
            }
        }
    }

    for lock in &locks {
        if let Err(e) = lock.remote_stop().await {
            error!(laser = %lock.laser(), error = %e, "lock did not stop cleanly");
        }
    }
    arbiter.shutdown().await;
    Ok(())
}
