//! DNS noise: resolver-log pollution without a browser.
//!
//! ISPs monetize DNS query logs; resolving a spread of hostnames across
//! categories makes those logs worthless. Runs off the independent
//! `dns_tick` stream and never occupies a session slot.

use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::data::DataTables;
use crate::engines::{Engine, EngineSpec, Task, TaskKind};
use crate::personas::Persona;
use crate::topics::TopicDraw;

const EXPECTED_BYTES: u64 = 1_024;
const BURST_PROBABILITY: f64 = 0.15;
const BURST_RANGE: (usize, usize) = (2, 5);

pub struct DnsEngine {
    spec: EngineSpec,
}

impl DnsEngine {
    pub fn new() -> Self {
        Self {
            spec: EngineSpec {
                name: "dns",
                weight: 0.8,
                max_concurrent: 8,
                requires_browser: false,
                allowed_by_safety_default: true,
            },
        }
    }
}

impl Default for DnsEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for DnsEngine {
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
        let category = if tables.dns_domains.contains_key(&topic.category) {
            topic.category.clone()
        } else {
            let keys: Vec<&String> = tables.dns_domains.keys().collect();
            keys.choose(rng).map(|k| k.to_string())?
        };
        let pool = tables.dns_domains.get(&category)?;
        let host = pool.choose(rng)?.clone();

        // Sometimes a burst of related lookups from the same category, the
        // way one page load fans out to its whole CDN neighborhood.
        let dns_burst = if rng.gen::<f64>() < BURST_PROBABILITY {
            let count = rng.gen_range(BURST_RANGE.0..=BURST_RANGE.1).min(pool.len());
            pool.choose_multiple(rng, count).cloned().collect()
        } else {
            Vec::new()
        };

        Some(Task {
            engine: self.spec.name,
            url: host,
            kind: TaskKind::Dns,
            expected_bytes: EXPECTED_BYTES,
            post_delay_ms: rng.gen_range(100..1000),
            category,
            query: None,
            followups: Vec::new(),
            dns_burst,
            proxy: None,
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
    fn tasks_are_browserless_and_cheap() {
        let engine = DnsEngine::new();
        assert!(!engine.spec().requires_browser);
        let mut rng = SmallRng::seed_from_u64(21);
        let task = engine
            .produce_task(&test_topic("privacy"), &test_persona(), &tables(), &mut rng)
            .unwrap();
        assert_eq!(task.kind, TaskKind::Dns);
        assert_eq!(task.expected_bytes, 1_024);
        assert!(!task.url.starts_with("http"));
    }

    #[test]
    fn bursts_happen_at_the_configured_rate() {
        let engine = DnsEngine::new();
        let tables = tables();
        let persona = test_persona();
        let mut rng = SmallRng::seed_from_u64(22);
        let n = 2000;
        let bursts = (0..n)
            .filter(|_| {
                !engine
                    .produce_task(&test_topic("news"), &persona, &tables, &mut rng)
                    .unwrap()
                    .dns_burst
                    .is_empty()
            })
            .count();
        let rate = bursts as f64 / n as f64;
        assert!((0.10..0.22).contains(&rate), "burst rate {rate}");
    }

    #[test]
    fn burst_hosts_stay_in_category() {
        let engine = DnsEngine::new();
        let tables = tables();
        let persona = test_persona();
        let mut rng = SmallRng::seed_from_u64(23);
        for _ in 0..200 {
            let task = engine
                .produce_task(&test_topic("news"), &persona, &tables, &mut rng)
                .unwrap();
            let pool = &tables.dns_domains[&task.category];
            for host in &task.dns_burst {
                assert!(pool.contains(host));
            }
        }
    }
}
