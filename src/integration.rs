//! End-to-end runs against a stub page driver under a paused tokio clock.
//! One simulated hour completes in milliseconds of wall time, which lets
//! these tests assert whole-system properties: bandwidth ceilings, slot
//! safety, schedule gating, fingerprint matching.

#![cfg(test)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::activity::{ActivityLog, Outcome};
use crate::config::{Config, ScheduleMode};
use crate::data::DataHub;
use crate::driver::stub::{StubBehavior, StubFactory};
use crate::engines::tor::TorHealth;
use crate::engines::EngineSet;
use crate::governor::BandwidthGovernor;
use crate::personas::{FingerprintBundle, PersonaRegistry, MATCHED_PERSONA_NAME};
use crate::scheduler::{Scheduler, SchedulerStats};
use crate::session::SessionManager;
use crate::timing::RateProfile;
use crate::topics::TopicModel;

struct Sim {
    scheduler: Arc<Scheduler>,
    engines: Arc<EngineSet>,
    activity: Arc<ActivityLog>,
    governor: Arc<BandwidthGovernor>,
    sessions: Arc<SessionManager>,
    personas: Arc<PersonaRegistry>,
    stats: Arc<SchedulerStats>,
    cancel: CancellationToken,
}

impl Sim {
    /// Flat-rate harness: diurnal/drift/jitter disabled so outcomes do not
    /// depend on the hour the test happens to run at.
    fn build(config: Config, events_per_hour: f64, behavior: Arc<StubBehavior>) -> Sim {
        let (hub, _) = DataHub::load(std::path::Path::new("/nonexistent")).unwrap();
        let data = Arc::new(hub);
        let tor = Arc::new(TorHealth::disabled());
        let engines = Arc::new(EngineSet::from_config(&config, tor));
        let governor = Arc::new(BandwidthGovernor::new(config.max_bandwidth_mb_per_hour));
        let activity = Arc::new(ActivityLog::with_stderr(false));
        let stats = Arc::new(SchedulerStats::new());
        let personas = Arc::new(PersonaRegistry::new(data.snapshot().personas.clone()));
        let topics = Arc::new(TopicModel::new(config.obsession_probability));
        let cancel = CancellationToken::new();
        let sessions = Arc::new(SessionManager::new(
            config.max_concurrent_sessions,
            config.session_length_mean,
            governor.clone(),
            activity.clone(),
            engines.clone(),
            stats.clone(),
            Arc::new(StubFactory { behavior }),
            cancel.child_token(),
        ));
        let profile = Arc::new(RwLock::new(RateProfile::flat(events_per_hour)));
        let scheduler = Scheduler::new(
            &config,
            profile,
            stats.clone(),
            topics,
            personas.clone(),
            engines.clone(),
            data,
            sessions.clone(),
            cancel.child_token(),
            0xfeed,
        );
        Sim {
            scheduler,
            engines,
            activity,
            governor,
            sessions,
            personas,
            stats,
            cancel,
        }
    }

    fn start(&self) {
        tokio::spawn(self.scheduler.clone().run());
        tokio::spawn(self.scheduler.clone().run_dns_ticks());
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
        self.sessions.stop().await;
    }
}

fn search_only_config() -> Config {
    Config {
        enable_browse_noise: false,
        enable_dns_noise: false,
        max_concurrent_sessions: 1,
        session_length_mean: 1.0,
        obsession_probability: 0.0,
        ..Config::default()
    }
}

#[tokio::test(start_paused = true)]
async fn hour_of_search_noise_stays_clean_and_bounded() {
    let behavior = StubBehavior::returning(300_000, Duration::from_secs(2));
    let sim = Sim::build(search_only_config(), 60.0, behavior);
    sim.start();
    sleep(Duration::from_secs(3600)).await;
    sim.shutdown().await;

    let snap = sim.engines.get("search").unwrap().stats.snapshot();
    assert!(snap.errors == 0, "expected clean run, got {} errors", snap.errors);
    let stats = sim.stats.snapshot();
    assert!(
        stats.sessions_today >= 5,
        "expected a steady stream of sessions, got {}",
        stats.sessions_today
    );
    assert!(stats.bandwidth_today_mb <= 50.0 + 0.5);
    // Shutdown cancellation may mark in-flight work skipped; nothing errors.
    assert_eq!(sim.activity.count_outcome(Outcome::Error), 0);
    assert!(sim.activity.len() > 0);
    assert_eq!(sim.sessions.invariant_violations(), 0);
}

#[tokio::test(start_paused = true)]
async fn tight_bandwidth_cap_skips_instead_of_bursting() {
    let mut config = search_only_config();
    config.max_bandwidth_mb_per_hour = 5;
    let behavior = StubBehavior::returning(300_000, Duration::from_secs(2));
    let sim = Sim::build(config, 60.0, behavior);
    sim.start();
    sleep(Duration::from_secs(3600)).await;
    sim.shutdown().await;

    let cap = sim.governor.cap_bytes();
    assert!(
        sim.governor.used() <= cap + 350_000,
        "window usage {} exceeds cap {} plus one page",
        sim.governor.used(),
        cap
    );
    let snap = sim.engines.get("search").unwrap().stats.snapshot();
    assert!(
        snap.skipped >= 5,
        "expected the governor to skip under a 5 MB cap, got {}",
        snap.skipped
    );
    assert_eq!(snap.errors, 0);
}

#[tokio::test(start_paused = true)]
async fn slots_saturate_but_never_overshoot() {
    let config = Config {
        intensity: crate::config::Intensity::Paranoid,
        enable_dns_noise: false,
        max_concurrent_sessions: 3,
        session_length_mean: 3.0,
        obsession_probability: 0.0,
        ..Config::default()
    };
    let behavior = StubBehavior::returning(100_000, Duration::from_secs(30));
    let sim = Sim::build(config, 300.0, behavior);
    sim.start();

    let mut max_active = 0usize;
    for _ in 0..600 {
        sleep(Duration::from_secs(1)).await;
        max_active = max_active.max(sim.sessions.active());
        assert!(sim.sessions.active() <= 3);
    }
    sim.shutdown().await;

    assert_eq!(max_active, 3, "steady state should saturate all slots");
    assert_eq!(sim.sessions.active(), 0, "stop must drain every slot");
    assert_eq!(sim.sessions.invariant_violations(), 0);
}

#[tokio::test(start_paused = true)]
async fn flaky_driver_raises_error_counters_without_leaking_slots() {
    let behavior = StubBehavior::failing_every(300_000, Duration::from_secs(2), 3);
    let mut config = search_only_config();
    config.max_concurrent_sessions = 2;
    let sim = Sim::build(config, 60.0, behavior);
    sim.start();
    sleep(Duration::from_secs(3600)).await;
    sim.shutdown().await;

    let snap = sim.engines.get("search").unwrap().stats.snapshot();
    assert!(snap.errors >= 3, "every third driver call fails, got {} errors", snap.errors);
    assert!(snap.requests > snap.errors, "successes should outnumber failures");
    assert_eq!(sim.sessions.invariant_violations(), 0);
    assert_eq!(sim.sessions.active(), 0);
}

#[tokio::test(start_paused = true)]
async fn away_only_mode_is_silent_while_home() {
    let mut config = search_only_config();
    config.schedule_mode = ScheduleMode::AwayOnly;
    let behavior = StubBehavior::returning(100_000, Duration::from_secs(1));
    let sim = Sim::build(config, 120.0, behavior);
    sim.start();

    // Presence defaults to home: the gate is closed, nothing may fire.
    sleep(Duration::from_secs(900)).await;
    assert_eq!(sim.stats.snapshot().sessions_today, 0);
    assert_eq!(sim.activity.len(), 0);

    sim.scheduler.set_presence(false);
    sleep(Duration::from_secs(900)).await;
    let away_sessions = sim.stats.snapshot().sessions_today;
    assert!(away_sessions > 0, "away window should produce sessions");

    // Back home: the stream stops again (in-flight sessions may finish).
    sim.scheduler.set_presence(true);
    sleep(Duration::from_secs(300)).await;
    let after = sim.stats.snapshot().sessions_today;
    sleep(Duration::from_secs(600)).await;
    assert_eq!(sim.stats.snapshot().sessions_today, after);
    sim.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn reported_fingerprint_shows_up_in_sessions() {
    let mut config = search_only_config();
    config.max_concurrent_sessions = 2;
    let behavior = StubBehavior::returning(100_000, Duration::from_secs(1));
    let sim = Sim::build(config, 120.0, behavior);
    sim.personas.apply_fingerprint(FingerprintBundle {
        width: 2560,
        height: 1440,
        ..Default::default()
    });
    assert!(sim.personas.fingerprint_matched());

    sim.start();
    sleep(Duration::from_secs(1800)).await;
    sim.shutdown().await;

    let matched_sessions = sim
        .activity
        .tail(crate::activity::RING_CAPACITY)
        .iter()
        .filter(|e| e.persona.as_deref() == Some(MATCHED_PERSONA_NAME))
        .count();
    assert!(
        matched_sessions > 0,
        "matched persona should appear within half an hour of sessions"
    );
}
