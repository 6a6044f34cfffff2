//! Traffic engines and the weighted dispatcher.
//!
//! Every engine translates a (topic, persona) pair into a concrete [`Task`]
//! and keeps its own request/error/byte counters. The dispatcher draws an
//! engine per session start, weighted by configured weight times
//! `1 - recent_share` so no engine collapses into dominating the mix.

pub mod adclick;
pub mod browse;
pub mod dns;
pub mod research;
pub mod search;
pub mod tor;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::Rng;
use serde::Serialize;
use tracing::debug;

use crate::activity::Outcome;
use crate::config::Config;
use crate::data::DataTables;
use crate::personas::Persona;
use crate::topics::TopicDraw;

const RECENT_WINDOW: usize = 50;
const MIN_EFFECTIVE_WEIGHT: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Page,
    Dns,
    Api,
}

/// A concrete unit of network work. Method is always GET; drivers own any
/// richer interaction.
#[derive(Debug, Clone)]
pub struct Task {
    pub engine: &'static str,
    pub url: String,
    pub kind: TaskKind,
    pub expected_bytes: u64,
    pub post_delay_ms: u64,
    pub category: String,
    pub query: Option<String>,
    /// Follow-up URLs consumed by `search_refine` states (research runs).
    pub followups: Vec<String>,
    /// Extra hostnames resolved after the first one (DNS bursts).
    pub dns_burst: Vec<String>,
    pub proxy: Option<String>,
    pub click_ads: bool,
    pub persona: Arc<Persona>,
}

/// Static description of an engine.
pub struct EngineSpec {
    pub name: &'static str,
    pub weight: f64,
    pub max_concurrent: u32,
    pub requires_browser: bool,
    /// False for the engines that stay off unless the operator opts in.
    pub allowed_by_safety_default: bool,
}

#[derive(Default)]
pub struct EngineStats {
    pub requests: AtomicU64,
    pub errors: AtomicU64,
    pub bytes: AtomicU64,
    pub skipped: AtomicU64,
    pub last_run: Mutex<Option<DateTime<Utc>>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatsSnapshot {
    pub requests: u64,
    pub errors: u64,
    pub bytes: u64,
    pub skipped: u64,
    pub last_run: Option<DateTime<Utc>>,
}

impl EngineStats {
    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            last_run: *self.last_run.lock(),
        }
    }
}

/// The capability every engine implements.
pub trait Engine: Send + Sync {
    fn spec(&self) -> &EngineSpec;

    /// Build a task for this topic and persona, or decline (an engine with
    /// no usable data or an unreachable upstream declines silently).
    fn produce_task(
        &self,
        topic: &TopicDraw,
        persona: &Arc<Persona>,
        tables: &DataTables,
        rng: &mut SmallRng,
    ) -> Option<Task>;

    /// Engine-specific bookkeeping beyond the shared counters.
    fn on_complete(&self, _task: &Task, _outcome: Outcome, _bytes: u64) {}
}

pub struct EngineHandle {
    pub engine: Box<dyn Engine>,
    pub enabled: AtomicBool,
    pub stats: EngineStats,
    pub inflight: AtomicU32,
}

impl EngineHandle {
    pub fn name(&self) -> &'static str {
        self.engine.spec().name
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }
}

/// All engines plus the dispatch policy.
pub struct EngineSet {
    handles: Vec<Arc<EngineHandle>>,
    recent: Mutex<VecDeque<&'static str>>,
}

impl EngineSet {
    /// Construct the full engine roster with enablement from config.
    /// Disabled engines are still registered so the control plane can list
    /// and toggle them.
    pub fn from_config(config: &Config, tor_health: Arc<tor::TorHealth>) -> Self {
        let engines: Vec<Box<dyn Engine>> = vec![
            Box::new(search::SearchEngine::new()),
            Box::new(browse::BrowseEngine::new()),
            Box::new(dns::DnsEngine::new()),
            Box::new(research::ResearchEngine::new()),
            Box::new(tor::TorEngine::new(tor_health)),
            Box::new(adclick::AdClickEngine::new()),
        ];
        let handles = engines
            .into_iter()
            .map(|engine| {
                let enabled = config.engine_enabled(engine.spec().name);
                Arc::new(EngineHandle {
                    engine,
                    enabled: AtomicBool::new(enabled),
                    stats: EngineStats::default(),
                    inflight: AtomicU32::new(0),
                })
            })
            .collect();
        Self {
            handles,
            recent: Mutex::new(VecDeque::with_capacity(RECENT_WINDOW)),
        }
    }

    pub fn handles(&self) -> &[Arc<EngineHandle>] {
        &self.handles
    }

    pub fn get(&self, name: &str) -> Option<&Arc<EngineHandle>> {
        self.handles.iter().find(|h| h.name() == name)
    }

    /// Flip an engine's enablement; returns the new state.
    pub fn toggle(&self, name: &str) -> Option<bool> {
        let handle = self.get(name)?;
        let now = !handle.enabled.load(Ordering::Relaxed);
        handle.enabled.store(now, Ordering::Relaxed);
        Some(now)
    }

    pub fn disable(&self, name: &str) {
        if let Some(handle) = self.get(name) {
            handle.enabled.store(false, Ordering::Relaxed);
        }
    }

    /// Whether a topic category may be drawn given current enablement:
    /// research-only categories stay out of the pool while the research
    /// engine is off.
    pub fn category_allowed(&self, category: &str) -> bool {
        match category {
            "privacy_tools" | "legal" => self
                .get("research")
                .map(|h| h.is_enabled())
                .unwrap_or(false),
            _ => true,
        }
    }

    /// Share of recent dispatches that went to `name`.
    fn recent_share(&self, name: &str) -> f64 {
        let recent = self.recent.lock();
        if recent.is_empty() {
            return 0.0;
        }
        let hits = recent.iter().filter(|n| **n == name).count();
        hits as f64 / recent.len() as f64
    }

    fn note_dispatch(&self, name: &'static str) {
        let mut recent = self.recent.lock();
        if recent.len() == RECENT_WINDOW {
            recent.pop_front();
        }
        recent.push_back(name);
    }

    /// Draw an engine and let it produce a task. Engines that decline (tor
    /// offline, missing data) are dropped from the pool and the draw
    /// repeats, so a dead engine never stalls the scheduler.
    pub fn dispatch(
        &self,
        topic: &TopicDraw,
        persona: &Arc<Persona>,
        tables: &DataTables,
        browser_slot_free: bool,
        rng: &mut SmallRng,
    ) -> Option<Task> {
        let mut pool: Vec<&Arc<EngineHandle>> = self
            .handles
            .iter()
            .filter(|h| h.is_enabled())
            .filter(|h| !h.engine.spec().requires_browser || browser_slot_free)
            .filter(|h| h.inflight.load(Ordering::Relaxed) < h.engine.spec().max_concurrent)
            .collect();

        while !pool.is_empty() {
            let weights: Vec<f64> = pool
                .iter()
                .map(|h| {
                    let spec = h.engine.spec();
                    (spec.weight * (1.0 - self.recent_share(spec.name)))
                        .max(MIN_EFFECTIVE_WEIGHT)
                })
                .collect();
            let total: f64 = weights.iter().sum();
            let mut roll = rng.gen::<f64>() * total;
            let mut chosen = pool.len() - 1;
            for (i, w) in weights.iter().enumerate() {
                if roll < *w {
                    chosen = i;
                    break;
                }
                roll -= w;
            }
            let handle = pool.swap_remove(chosen);
            if let Some(task) = handle.engine.produce_task(topic, persona, tables, rng) {
                self.note_dispatch(handle.name());
                return Some(task);
            }
            debug!(engine = handle.name(), "engine declined, redrawing");
        }
        None
    }

    /// Fold a finished task back into the owning engine's counters.
    pub fn on_complete(&self, task: &Task, outcome: Outcome, bytes: u64) {
        let Some(handle) = self.get(task.engine) else {
            return;
        };
        match outcome {
            Outcome::Ok => {
                handle.stats.requests.fetch_add(1, Ordering::Relaxed);
                handle.stats.bytes.fetch_add(bytes, Ordering::Relaxed);
            }
            Outcome::Skipped => {
                handle.stats.skipped.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Error => {
                handle.stats.requests.fetch_add(1, Ordering::Relaxed);
                handle.stats.errors.fetch_add(1, Ordering::Relaxed);
                handle.stats.bytes.fetch_add(bytes, Ordering::Relaxed);
            }
        }
        *handle.stats.last_run.lock() = Some(Utc::now());
        handle.engine.on_complete(task, outcome, bytes);
    }

    pub fn begin_task(&self, name: &str) {
        if let Some(handle) = self.get(name) {
            handle.inflight.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn end_task(&self, name: &str) {
        if let Some(handle) = self.get(name) {
            handle.inflight.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

pub(crate) fn weighted_site<'a>(
    sites: &'a [crate::data::WeightedSite],
    rng: &mut SmallRng,
) -> Option<&'a crate::data::WeightedSite> {
    if sites.is_empty() {
        return None;
    }
    let total: f64 = sites.iter().map(|s| s.weight.max(0.0)).sum();
    if total <= 0.0 {
        return sites.first();
    }
    let mut roll = rng.gen::<f64>() * total;
    for site in sites {
        let w = site.weight.max(0.0);
        if roll < w {
            return Some(site);
        }
        roll -= w;
    }
    sites.last()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::personas::Viewport;
    use rand::SeedableRng;

    pub(crate) fn test_persona() -> Arc<Persona> {
        Arc::new(Persona {
            name: "chrome_windows".into(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) Chrome/131.0".into(),
            viewport: Viewport {
                width: 1920,
                height: 1080,
            },
            platform: "Win32".into(),
            languages: vec!["en-US".into()],
            timezone: None,
            accept_encoding: "gzip, deflate, br".into(),
            weight: 1.0,
            fingerprint: None,
        })
    }

    pub(crate) fn test_topic(category: &str) -> TopicDraw {
        TopicDraw {
            category: category.into(),
            query: Some("standing desk".into()),
            research_queries: Vec::new(),
            obsessed: false,
        }
    }

    fn tables() -> DataTables {
        let (hub, _) = crate::data::DataHub::load(std::path::Path::new("/nonexistent")).unwrap();
        // Snapshot's inner value; clone the tables out for plain borrows.
        (*hub.snapshot()).clone()
    }

    fn default_set() -> EngineSet {
        let health = Arc::new(tor::TorHealth::disabled());
        EngineSet::from_config(&Config::default(), health)
    }

    #[test]
    fn safety_defaults_keep_suspect_engines_off() {
        let set = default_set();
        for name in ["tor", "research", "adclick"] {
            let handle = set.get(name).unwrap();
            assert!(!handle.is_enabled(), "{name} should be disabled by default");
            assert!(!handle.engine.spec().allowed_by_safety_default);
        }
        for name in ["search", "browse", "dns"] {
            assert!(set.get(name).unwrap().is_enabled());
        }
    }

    #[test]
    fn disabled_engines_are_never_dispatched() {
        let set = default_set();
        let tables = tables();
        let persona = test_persona();
        let mut rng = SmallRng::seed_from_u64(1);
        for _ in 0..300 {
            let task = set
                .dispatch(&test_topic("shopping"), &persona, &tables, true, &mut rng)
                .expect("default engines produce tasks");
            assert!(["search", "browse", "dns"].contains(&task.engine));
        }
        for name in ["tor", "research", "adclick"] {
            let snap = set.get(name).unwrap().stats.snapshot();
            assert_eq!(snap.requests, 0);
            assert_eq!(snap.bytes, 0);
        }
    }

    #[test]
    fn toggle_round_trip() {
        let set = default_set();
        assert_eq!(set.toggle("tor"), Some(true));
        assert!(set.get("tor").unwrap().is_enabled());
        assert_eq!(set.toggle("tor"), Some(false));
        assert!(!set.get("tor").unwrap().is_enabled());
        assert_eq!(set.toggle("no_such_engine"), None);
    }

    #[test]
    fn browser_engines_need_a_free_slot() {
        let set = default_set();
        let tables = tables();
        let persona = test_persona();
        let mut rng = SmallRng::seed_from_u64(5);
        for _ in 0..100 {
            if let Some(task) =
                set.dispatch(&test_topic("tech"), &persona, &tables, false, &mut rng)
            {
                assert_eq!(task.engine, "dns", "only dns runs without a browser slot");
            }
        }
    }

    #[test]
    fn recent_share_dampens_repeat_dispatch() {
        let set = default_set();
        for _ in 0..RECENT_WINDOW {
            set.note_dispatch("search");
        }
        assert!(set.recent_share("search") > 0.99);
        assert_eq!(set.recent_share("browse"), 0.0);
        // Effective weight collapses to the floor but never to zero.
        let handle = set.get("search").unwrap();
        let eff = (handle.engine.spec().weight * (1.0 - set.recent_share("search")))
            .max(MIN_EFFECTIVE_WEIGHT);
        assert!((MIN_EFFECTIVE_WEIGHT..0.1).contains(&eff));
    }

    #[test]
    fn outcomes_update_stats() {
        let set = default_set();
        let tables = tables();
        let persona = test_persona();
        let mut rng = SmallRng::seed_from_u64(2);
        let task = set
            .dispatch(&test_topic("tech"), &persona, &tables, true, &mut rng)
            .unwrap();
        set.on_complete(&task, Outcome::Ok, 1000);
        set.on_complete(&task, Outcome::Error, 0);
        set.on_complete(&task, Outcome::Skipped, 0);
        let snap = set.get(task.engine).unwrap().stats.snapshot();
        assert_eq!(snap.requests, 2);
        assert_eq!(snap.errors, 1);
        assert_eq!(snap.skipped, 1);
        assert_eq!(snap.bytes, 1000);
        assert!(snap.last_run.is_some());
    }

    #[test]
    fn governor_rejects_do_not_count_as_errors() {
        let set = default_set();
        let tables = tables();
        let persona = test_persona();
        let mut rng = SmallRng::seed_from_u64(3);
        let task = set
            .dispatch(&test_topic("tech"), &persona, &tables, true, &mut rng)
            .unwrap();
        set.on_complete(&task, Outcome::Skipped, 0);
        let snap = set.get(task.engine).unwrap().stats.snapshot();
        assert_eq!(snap.errors, 0);
        assert_eq!(snap.skipped, 1);
    }
}
