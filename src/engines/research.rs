//! Research noise: privacy tools, legal resources, government databases.
//!
//! Visits that might otherwise stand out in surveillance data become
//! unremarkable when every household emits them. Off by default; the
//! operator opts in.

use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::data::DataTables;
use crate::engines::{weighted_site, Engine, EngineSpec, Task, TaskKind};
use crate::personas::Persona;
use crate::topics::TopicDraw;

const EXPECTED_BYTES: u64 = 1_200_000;

pub struct ResearchEngine {
    spec: EngineSpec,
}

impl ResearchEngine {
    pub fn new() -> Self {
        Self {
            spec: EngineSpec {
                name: "research",
                weight: 0.5,
                max_concurrent: 2,
                requires_browser: true,
                allowed_by_safety_default: false,
            },
        }
    }
}

impl Default for ResearchEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for ResearchEngine {
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
        let category = if tables.research_sites.contains_key(&topic.category) {
            topic.category.clone()
        } else {
            let keys: Vec<&String> = tables.research_sites.keys().collect();
            keys.choose(rng).map(|k| k.to_string())?
        };
        let site = weighted_site(tables.research_sites.get(&category)?, rng)?;

        Some(Task {
            engine: self.spec.name,
            url: site.url.clone(),
            kind: TaskKind::Page,
            // Research reads run longer and deeper than casual browsing.
            expected_bytes: EXPECTED_BYTES,
            post_delay_ms: rng.gen_range(2000..8000),
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
    fn restricted_to_research_categories() {
        let engine = ResearchEngine::new();
        let tables = tables();
        let mut rng = SmallRng::seed_from_u64(31);
        for _ in 0..100 {
            let task = engine
                .produce_task(&test_topic("shopping"), &test_persona(), &tables, &mut rng)
                .unwrap();
            assert!(tables.research_sites.contains_key(&task.category));
        }
    }

    #[test]
    fn off_by_safety_default() {
        let engine = ResearchEngine::new();
        assert!(!engine.spec().allowed_by_safety_default);
    }
}
