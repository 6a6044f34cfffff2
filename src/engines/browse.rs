//! Browse noise: weighted site visits across topical categories, with
//! internal link-following handled by the session's Markov chain.

use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::data::DataTables;
use crate::engines::{weighted_site, Engine, EngineSpec, Task, TaskKind};
use crate::personas::Persona;
use crate::topics::TopicDraw;

const EXPECTED_BYTES: u64 = 1_500_000;

pub struct BrowseEngine {
    spec: EngineSpec,
}

impl BrowseEngine {
    pub fn new() -> Self {
        Self {
            spec: EngineSpec {
                name: "browse",
                weight: 1.2,
                max_concurrent: 3,
                requires_browser: true,
                allowed_by_safety_default: true,
            },
        }
    }
}

impl Default for BrowseEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for BrowseEngine {
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
        // The topic's category when the site list knows it, any category
        // otherwise: topic wordlists and site lists need not agree.
        let category = if tables.sites.contains_key(&topic.category) {
            topic.category.clone()
        } else {
            let keys: Vec<&String> = tables.sites.keys().collect();
            keys.choose(rng).map(|k| k.to_string())?
        };
        let sites = tables.sites.get(&category)?;
        let site = weighted_site(sites, rng)?;
        let url = if site.url.starts_with("http") {
            site.url.clone()
        } else {
            format!("https://{}", site.url)
        };

        Some(Task {
            engine: self.spec.name,
            url,
            kind: TaskKind::Page,
            expected_bytes: EXPECTED_BYTES,
            post_delay_ms: rng.gen_range(1000..5000),
            category,
            query: topic.query.clone(),
            followups: Vec::new(),
            dns_burst: Vec::new(),
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
    fn known_category_is_respected() {
        let engine = BrowseEngine::new();
        let mut rng = SmallRng::seed_from_u64(8);
        let task = engine
            .produce_task(&test_topic("shopping"), &test_persona(), &tables(), &mut rng)
            .unwrap();
        assert_eq!(task.category, "shopping");
        assert!(task.url.starts_with("https://"));
        assert_eq!(task.expected_bytes, 1_500_000);
    }

    #[test]
    fn unknown_category_falls_back_to_site_list() {
        let engine = BrowseEngine::new();
        let tables = tables();
        let mut rng = SmallRng::seed_from_u64(9);
        let task = engine
            .produce_task(
                &test_topic("no_such_category"),
                &test_persona(),
                &tables,
                &mut rng,
            )
            .unwrap();
        assert!(tables.sites.contains_key(&task.category));
    }

    #[test]
    fn weighted_pick_prefers_heavier_sites() {
        let sites = vec![
            crate::data::WeightedSite {
                url: "https://heavy.example".into(),
                weight: 10.0,
            },
            crate::data::WeightedSite {
                url: "https://light.example".into(),
                weight: 0.1,
            },
        ];
        let mut rng = SmallRng::seed_from_u64(10);
        let heavy = (0..500)
            .filter(|_| weighted_site(&sites, &mut rng).unwrap().url.contains("heavy"))
            .count();
        assert!(heavy > 450);
    }
}
