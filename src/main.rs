//! Poisson daemon entry point: configuration, logging, component wiring,
//! signal handling, exit codes.

use std::sync::Arc;

use parking_lot::RwLock;
use rand::Rng;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use poisson::activity::ActivityLog;
use poisson::api::{self, ext::ExtensionManager, ApiContext};
use poisson::config::Config;
use poisson::data::DataHub;
use poisson::driver::{DriverFactory, HttpDriverFactory};
use poisson::engines::tor::TorHealth;
use poisson::engines::EngineSet;
use poisson::error::{ConfigError, DataError};
use poisson::governor::BandwidthGovernor;
use poisson::personas::PersonaRegistry;
use poisson::scheduler::{Scheduler, SchedulerStats};
use poisson::session::SessionManager;
use poisson::timing::RateProfile;
use poisson::topics::TopicModel;

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("poisson={level},warn")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(ConfigError::EXIT_CODE);
        }
    };
    init_tracing(&config.log_level);

    info!("poisson: decoy traffic generator");
    info!(
        intensity = %config.intensity,
        sessions = config.max_concurrent_sessions,
        bandwidth_mb_per_hour = config.max_bandwidth_mb_per_hour,
        "configuration loaded"
    );

    let (hub, data_disabled) = match DataHub::load(&config.data_dir) {
        Ok(x) => x,
        Err(e) => {
            error!("data load error: {e}");
            std::process::exit(DataError::EXIT_CODE);
        }
    };
    let data = Arc::new(hub);

    let seed: u64 = config.rng_seed.unwrap_or_else(|| rand::thread_rng().gen());
    let cancel = CancellationToken::new();

    let tor_health = Arc::new(if config.enable_tor {
        TorHealth::enabled()
    } else {
        TorHealth::disabled()
    });
    if config.enable_tor {
        tor_health.ensure_probe(cancel.child_token());
    }

    let engines = Arc::new(EngineSet::from_config(&config, tor_health.clone()));
    for name in data_disabled {
        warn!(engine = name, "disabled: data files unusable");
        engines.disable(name);
    }

    let governor = Arc::new(BandwidthGovernor::new(config.max_bandwidth_mb_per_hour));
    let activity = Arc::new(ActivityLog::new());
    let stats = Arc::new(SchedulerStats::new());
    let personas = Arc::new(PersonaRegistry::new(data.snapshot().personas.clone()));
    let topics = Arc::new(TopicModel::new(config.obsession_probability));
    let factory: Arc<dyn DriverFactory> = Arc::new(HttpDriverFactory);

    let sessions = Arc::new(SessionManager::new(
        config.max_concurrent_sessions,
        config.session_length_mean,
        governor.clone(),
        activity.clone(),
        engines.clone(),
        stats.clone(),
        factory,
        cancel.child_token(),
    ));

    let profile = Arc::new(RwLock::new(RateProfile::new(config.intensity, seed)));
    let scheduler = Scheduler::new(
        &config,
        profile,
        stats,
        topics,
        personas.clone(),
        engines,
        data.clone(),
        sessions.clone(),
        cancel.child_token(),
        seed,
    );

    let api_key = api::mint_api_key();
    // The host platform injects this into the dashboard HTML.
    info!(%api_key, "control-plane key minted");
    let ext_token = std::env::var("POISSON_EXT_TOKEN")
        .or_else(|_| std::env::var("SUPERVISOR_TOKEN"))
        .ok();
    let ext = Arc::new(ExtensionManager::new(
        ext_token,
        api::mint_api_key(),
        config.match_browser_fingerprint,
        personas,
        data.clone(),
        seed.rotate_left(29),
    ));

    let ctx = Arc::new(ApiContext {
        scheduler: scheduler.clone(),
        governor,
        activity,
        tor: tor_health,
        ext,
        api_key,
        match_fingerprint: config.match_browser_fingerprint,
        cancel: cancel.clone(),
    });

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(scheduler.clone().run()));
    tasks.push(tokio::spawn(scheduler.clone().run_dns_ticks()));
    tasks.push(tokio::spawn(scheduler.clone().run_sweep()));
    tasks.push(tokio::spawn(api::serve(ctx, config.api_port)));
    info!("all systems running");

    // SIGHUP hot-reloads the YAML tables; the swap is atomic and in-flight
    // sessions keep their old snapshot.
    {
        let data = data.clone();
        let scheduler = scheduler.clone();
        let hup_cancel = cancel.clone();
        tokio::spawn(async move {
            let Ok(mut hup) = signal(SignalKind::hangup()) else {
                return;
            };
            loop {
                tokio::select! {
                    _ = hup_cancel.cancelled() => break,
                    received = hup.recv() => {
                        if received.is_none() {
                            break;
                        }
                        match data.reload() {
                            Ok(disabled) => {
                                scheduler
                                    .personas
                                    .replace_pool(data.snapshot().personas.clone());
                                for name in disabled {
                                    warn!(engine = name, "disabled after reload");
                                    scheduler.engines.disable(name);
                                }
                            }
                            Err(e) => warn!("reload failed, keeping old tables: {e}"),
                        }
                    }
                }
            }
        });
    }

    let mut term = signal(SignalKind::terminate()).expect("signal handler");
    let mut int = signal(SignalKind::interrupt()).expect("signal handler");
    tokio::select! {
        _ = term.recv() => info!("SIGTERM received"),
        _ = int.recv() => info!("SIGINT received"),
    }

    info!("shutting down");
    cancel.cancel();
    sessions.stop().await;
    for task in tasks {
        let _ = task.await;
    }
    info!("goodbye");
}
