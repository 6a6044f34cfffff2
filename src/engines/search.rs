//! Search noise: plausible queries against the big four engines.

use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::data::DataTables;
use crate::engines::{Engine, EngineSpec, Task, TaskKind};
use crate::personas::Persona;
use crate::topics::TopicDraw;

/// Host rotation mirrors real-world search market share rather than a
/// uniform split; a household that searched four engines equally would
/// itself be an anomaly.
const SEARCH_HOSTS: &[(&str, &str, f64)] = &[
    ("Google", "https://www.google.com/search?q=", 0.55),
    ("Bing", "https://www.bing.com/search?q=", 0.15),
    ("DuckDuckGo", "https://duckduckgo.com/?q=", 0.20),
    ("Yahoo", "https://search.yahoo.com/search?p=", 0.10),
];

const EXPECTED_BYTES: u64 = 300_000;

pub struct SearchEngine {
    spec: EngineSpec,
}

impl SearchEngine {
    pub fn new() -> Self {
        Self {
            spec: EngineSpec {
                name: "search",
                weight: 1.0,
                max_concurrent: 2,
                requires_browser: true,
                allowed_by_safety_default: true,
            },
        }
    }

    fn pick_host(rng: &mut SmallRng) -> &'static (&'static str, &'static str, f64) {
        let total: f64 = SEARCH_HOSTS.iter().map(|(_, _, w)| w).sum();
        let mut roll = rng.gen::<f64>() * total;
        for host in SEARCH_HOSTS {
            if roll < host.2 {
                return host;
            }
            roll -= host.2;
        }
        &SEARCH_HOSTS[0]
    }

    fn query_url(base: &str, query: &str) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(query.as_bytes()).collect();
        format!("{base}{encoded}")
    }
}

impl Default for SearchEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for SearchEngine {
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
        let query = topic
            .query
            .clone()
            .or_else(|| {
                tables
                    .terms
                    .get(&topic.category)
                    .and_then(|t| t.choose(rng))
                    .cloned()
            })
            .or_else(|| {
                let cats: Vec<&Vec<String>> = tables.terms.values().collect();
                cats.choose(rng).and_then(|t| t.choose(rng)).cloned()
            })?;

        let (host_name, base, _) = Self::pick_host(rng);
        let url = Self::query_url(base, &query);

        // A research run refines the same topic across several queries,
        // consumed by the session's search_refine states.
        let followups: Vec<String> = topic
            .research_queries
            .iter()
            .map(|q| Self::query_url(base, q))
            .collect();

        Some(Task {
            engine: self.spec.name,
            url,
            kind: TaskKind::Page,
            expected_bytes: EXPECTED_BYTES,
            post_delay_ms: rng.gen_range(500..3000),
            category: topic.category.clone(),
            query: Some(format!("{host_name}: {query}")),
            followups,
            dns_burst: Vec::new(),
            proxy: None,
            click_ads: false,
            persona: persona.clone(),
        })
    }
}
