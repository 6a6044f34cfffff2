//! Tor-routed browse noise plus the SOCKS health probe.
//!
//! Same shape as browsing, but through the local Tor daemon's SOCKS port,
//! with slower, more deliberate pacing and occasional `.onion` targets.
//! When the proxy is unreachable the engine reports `offline` and declines
//! tasks; an unreachable daemon is a degraded state, not an error storm.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::time::{interval, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::data::DataTables;
use crate::engines::{weighted_site, Engine, EngineSpec, Task, TaskKind};
use crate::personas::Persona;
use crate::topics::TopicDraw;

pub const SOCKS_ADDR: &str = "127.0.0.1:9050";
pub const SOCKS_PROXY_URL: &str = "socks5://127.0.0.1:9050";
const PROBE_INTERVAL: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const ONION_PROBABILITY: f64 = 0.3;
const EXPECTED_BYTES: u64 = 1_500_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TorStatus {
    Disabled,
    Connecting,
    Connected,
    Offline,
}

impl TorStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => TorStatus::Connecting,
            2 => TorStatus::Connected,
            3 => TorStatus::Offline,
            _ => TorStatus::Disabled,
        }
    }
}

/// Shared view of the SOCKS proxy's reachability.
pub struct TorHealth {
    status: AtomicU8,
    socks_addr: String,
    probe_running: AtomicBool,
}

impl TorHealth {
    pub fn disabled() -> Self {
        Self {
            status: AtomicU8::new(TorStatus::Disabled as u8),
            socks_addr: SOCKS_ADDR.to_string(),
            probe_running: AtomicBool::new(false),
        }
    }

    pub fn enabled() -> Self {
        Self {
            status: AtomicU8::new(TorStatus::Connecting as u8),
            socks_addr: SOCKS_ADDR.to_string(),
            probe_running: AtomicBool::new(false),
        }
    }

    #[cfg(test)]
    pub fn with_status(status: TorStatus) -> Self {
        Self {
            status: AtomicU8::new(status as u8),
            socks_addr: SOCKS_ADDR.to_string(),
            probe_running: AtomicBool::new(false),
        }
    }

    pub fn status(&self) -> TorStatus {
        TorStatus::from_u8(self.status.load(Ordering::Relaxed))
    }

    fn set(&self, status: TorStatus) {
        self.status.store(status as u8, Ordering::Relaxed);
    }

    async fn probe_once(&self) {
        let reachable = matches!(
            timeout(PROBE_TIMEOUT, TcpStream::connect(&self.socks_addr)).await,
            Ok(Ok(_))
        );
        let previous = self.status();
        let next = if reachable {
            TorStatus::Connected
        } else {
            TorStatus::Offline
        };
        if previous != next {
            match next {
                TorStatus::Connected => info!(addr = %self.socks_addr, "tor SOCKS reachable"),
                _ => warn!(addr = %self.socks_addr, "tor SOCKS unreachable, engine bypassed"),
            }
        }
        self.set(next);
    }

    /// Start the background probe loop exactly once; later calls (e.g. a
    /// runtime toggle) are no-ops. A `Disabled` health flips to
    /// `Connecting` until the first probe lands.
    pub fn ensure_probe(self: &Arc<Self>, cancel: CancellationToken) {
        if self.probe_running.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.status() == TorStatus::Disabled {
            self.set(TorStatus::Connecting);
        }
        let health = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(PROBE_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => health.probe_once().await,
                }
            }
        });
    }
}

pub struct TorEngine {
    spec: EngineSpec,
    health: Arc<TorHealth>,
}

impl TorEngine {
    pub fn new(health: Arc<TorHealth>) -> Self {
        Self {
            spec: EngineSpec {
                name: "tor",
                weight: 0.4,
                max_concurrent: 1,
                requires_browser: true,
                allowed_by_safety_default: false,
            },
            health,
        }
    }
}

impl Engine for TorEngine {
    fn spec(&self) -> &EngineSpec {
        &self.spec
    }

    fn produce_task(
        &self,
        topic: &TopicDraw,
        persona: &Arc<Persona>,
        tables: &DataTables,
        rng: &mut SmallRng,
    ) -> Option<Task> {
        if self.health.status() != TorStatus::Connected {
            debug!(status = ?self.health.status(), "tor engine declining");
            return None;
        }

        let (url, category) = if rng.gen::<f64>() < ONION_PROBABILITY && !tables.onion_sites.is_empty()
        {
            let site = weighted_site(&tables.onion_sites, rng)?;
            (site.url.clone(), "onion".to_string())
        } else {
            let keys: Vec<&String> = tables.tor_sites.keys().collect();
            let category = keys.choose(rng).map(|k| k.to_string())?;
            let site = weighted_site(tables.tor_sites.get(&category)?, rng)?;
            (site.url.clone(), category)
        };

        Some(Task {
            engine: self.spec.name,
            url,
            kind: TaskKind::Page,
            expected_bytes: EXPECTED_BYTES,
            // Tor users expect slowness and browse deliberately.
            post_delay_ms: rng.gen_range(4000..15000),
            category,
            query: topic.query.clone(),
            followups: Vec::new(),
            dns_burst: Vec::new(),
            proxy: Some(SOCKS_PROXY_URL.to_string()),
            click_ads: false,
            persona: persona.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::tests::{test_persona, test_topic};
    use rand::SeedableRng;

    fn tables() -> DataTables {
        let (hub, _) = crate::data::DataHub::load(std::path::Path::new("/nonexistent")).unwrap();
        (*hub.snapshot()).clone()
    }

    #[test]
    fn declines_while_offline() {
        for status in [TorStatus::Disabled, TorStatus::Connecting, TorStatus::Offline] {
            let engine = TorEngine::new(Arc::new(TorHealth::with_status(status)));
            let mut rng = SmallRng::seed_from_u64(41);
            assert!(engine
                .produce_task(&test_topic("news"), &test_persona(), &tables(), &mut rng)
                .is_none());
        }
    }

    #[test]
    fn connected_tasks_carry_the_proxy() {
        let engine = TorEngine::new(Arc::new(TorHealth::with_status(TorStatus::Connected)));
        let mut rng = SmallRng::seed_from_u64(42);
        let task = engine
            .produce_task(&test_topic("news"), &test_persona(), &tables(), &mut rng)
            .unwrap();
        assert_eq!(task.proxy.as_deref(), Some(SOCKS_PROXY_URL));
    }

    #[test]
    fn onion_targets_appear() {
        let engine = TorEngine::new(Arc::new(TorHealth::with_status(TorStatus::Connected)));
        let tables = tables();
        let persona = test_persona();
        let mut rng = SmallRng::seed_from_u64(43);
        let onions = (0..500)
            .filter(|_| {
                engine
                    .produce_task(&test_topic("news"), &persona, &tables, &mut rng)
                    .unwrap()
                    .url
                    .contains(".onion")
            })
            .count();
        let share = onions as f64 / 500.0;
        assert!((0.2..0.42).contains(&share), "onion share {share}");
    }

    #[tokio::test]
    async fn probe_marks_unreachable_proxy_offline() {
        let health = TorHealth {
            status: AtomicU8::new(TorStatus::Connecting as u8),
            // Reserved port that nothing listens on.
            socks_addr: "127.0.0.1:1".to_string(),
            probe_running: AtomicBool::new(false),
        };
        health.probe_once().await;
        assert_eq!(health.status(), TorStatus::Offline);
    }
}
