//! Topic selection and the obsession model.
//!
//! Most sessions draw a fresh category by weight. Occasionally the generator
//! "falls down a rabbit hole": a single topic biases draws for hours to
//! days, the way a real person researching a mattress or a medical symptom
//! keeps coming back to it. At most one obsession is live at a time.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::Rng;
use rand_distr::{Beta, Distribution};
use tracing::{debug, info};

use crate::data::DataTables;

const OBSESSION_MIN: Duration = Duration::from_secs(6 * 3600);
const OBSESSION_MAX: Duration = Duration::from_secs(72 * 3600);
const RESEARCH_RUN_PROBABILITY: f64 = 0.08;
const RESEARCH_RUN_QUERIES: (usize, usize) = (3, 8);

/// Query variations that make an obsession look like genuine deep-diving.
const OBSESSION_MODIFIERS: &[&str] = &[
    "{}",
    "{} review",
    "{} comparison",
    "{} reddit",
    "best {}",
    "{} pros and cons",
    "{} alternatives",
    "{} guide",
    "{} tutorial",
    "{} cost",
    "is {} worth it",
    "{} vs",
];

#[derive(Debug, Clone)]
pub struct TopicDraw {
    pub category: String,
    pub query: Option<String>,
    /// Extra queries for a multi-query research run; empty otherwise.
    pub research_queries: Vec<String>,
    pub obsessed: bool,
}

#[derive(Debug, Clone)]
pub struct Obsession {
    pub category: String,
    pub seed: String,
    pub expires_at: Instant,
    pub strength: f64,
}

impl Obsession {
    pub fn is_live(&self) -> bool {
        Instant::now() < self.expires_at
    }

    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

pub struct TopicModel {
    probability: f64,
    duration_range: (Duration, Duration),
    obsession: Mutex<Option<Obsession>>,
}

impl TopicModel {
    pub fn new(obsession_probability: f64) -> Self {
        Self {
            probability: obsession_probability,
            duration_range: (OBSESSION_MIN, OBSESSION_MAX),
            obsession: Mutex::new(None),
        }
    }

    #[cfg(test)]
    fn with_duration_range(mut self, min: Duration, max: Duration) -> Self {
        self.duration_range = (min, max);
        self
    }

    pub fn obsession(&self) -> Option<Obsession> {
        let guard = self.obsession.lock();
        guard.clone().filter(|o| o.is_live())
    }

    /// Control-plane escape hatch.
    pub fn clear_obsession(&self) {
        let mut guard = self.obsession.lock();
        if guard.take().is_some() {
            info!("obsession cleared");
        }
    }

    /// Drop an expired obsession; called from the orchestrator's slow sweep
    /// so expiry shows up in the log even between sessions.
    pub fn expire_check(&self) {
        let mut guard = self.obsession.lock();
        if let Some(o) = guard.as_ref() {
            if !o.is_live() {
                info!(category = %o.category, seed = %o.seed, "obsession expired");
                *guard = None;
            }
        }
    }

    /// Draw the topic for a new session.
    ///
    /// `category_allowed` filters categories whose engine is disabled (e.g.
    /// `privacy_tools` only makes sense when the research engine runs).
    pub fn next_topic(
        &self,
        tables: &DataTables,
        category_allowed: &dyn Fn(&str) -> bool,
        rng: &mut SmallRng,
    ) -> TopicDraw {
        let categories: Vec<&String> = tables
            .terms
            .keys()
            .filter(|c| category_allowed(c))
            .collect();

        // Roll for a new obsession before consulting the current one, so a
        // fresh streak can replace a stale one at any session start.
        self.maybe_start(&categories, tables, rng);

        if let Some(o) = self.obsession() {
            if rng.gen::<f64>() < o.strength {
                let query = expand_obsession(&o.seed, 1, rng).pop();
                return TopicDraw {
                    category: o.category.clone(),
                    query,
                    research_queries: Vec::new(),
                    obsessed: true,
                };
            }
        }

        let category = categories
            .choose(rng)
            .map(|c| c.to_string())
            .unwrap_or_else(|| "news".to_string());
        let query = tables
            .terms
            .get(&category)
            .and_then(|terms| terms.choose(rng))
            .cloned();

        let research_queries = match &query {
            Some(q) if rng.gen::<f64>() < RESEARCH_RUN_PROBABILITY => {
                let n = rng.gen_range(RESEARCH_RUN_QUERIES.0..=RESEARCH_RUN_QUERIES.1);
                expand_obsession(q, n, rng)
            }
            _ => Vec::new(),
        };

        TopicDraw {
            category,
            query,
            research_queries,
            obsessed: false,
        }
    }

    fn maybe_start(&self, categories: &[&String], tables: &DataTables, rng: &mut SmallRng) {
        if categories.is_empty() || rng.gen::<f64>() >= self.probability {
            return;
        }
        let category = match categories.choose(rng) {
            Some(c) => c.to_string(),
            None => return,
        };
        let seed = match tables.terms.get(&category).and_then(|t| t.choose(rng)) {
            Some(s) => s.clone(),
            None => return,
        };
        let (min, max) = self.duration_range;
        let span = max.saturating_sub(min);
        let extra = span.mul_f64(rng.gen::<f64>());
        let strength = draw_strength(rng);
        let obsession = Obsession {
            category,
            seed,
            expires_at: Instant::now() + min + extra,
            strength,
        };
        debug!(
            category = %obsession.category,
            seed = %obsession.seed,
            strength,
            hours = (min + extra).as_secs() / 3600,
            "obsession started"
        );
        *self.obsession.lock() = Some(obsession);
    }
}

/// Strength skewed into the 0.4–0.8 band: strong enough to be visible in
/// the traffic, weak enough that other topics still appear.
fn draw_strength(rng: &mut SmallRng) -> f64 {
    let beta: Beta<f64> = Beta::new(5.0, 3.0).expect("valid beta parameters");
    (0.2 + 0.7 * beta.sample(rng)).clamp(0.05, 1.0)
}

/// Related-query expansion for deep-dive runs.
pub fn expand_obsession(seed: &str, count: usize, rng: &mut SmallRng) -> Vec<String> {
    let mut modifiers: Vec<&&str> = OBSESSION_MODIFIERS.iter().collect();
    modifiers.shuffle(rng);
    modifiers
        .into_iter()
        .take(count.min(OBSESSION_MODIFIERS.len()))
        .map(|m| m.replacen("{}", seed, 1))
        .collect()
}
