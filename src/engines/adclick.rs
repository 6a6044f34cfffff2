//! Ad-click noise: visits ad-heavy pages and has the driver interact with a
//! qualifying ad element, polluting ad-network tracking profiles. Off by
//! default.

use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::Rng;

use crate::data::DataTables;
use crate::engines::{weighted_site, Engine, EngineSpec, Task, TaskKind};
use crate::personas::Persona;
use crate::topics::TopicDraw;

const EXPECTED_BYTES: u64 = 800_000;

pub struct AdClickEngine {
    spec: EngineSpec,
}

impl AdClickEngine {
    pub fn new() -> Self {
        Self {
            spec: EngineSpec {
                name: "adclick",
                weight: 0.3,
                max_concurrent: 1,
                requires_browser: true,
                allowed_by_safety_default: false,
            },
        }
    }
}

impl Default for AdClickEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for AdClickEngine {
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
        let site = weighted_site(&tables.ad_sites, rng)?;
        Some(Task {
            engine: self.spec.name,
            url: site.url.clone(),
            kind: TaskKind::Page,
            expected_bytes: EXPECTED_BYTES,
            post_delay_ms: rng.gen_range(1500..6000),
            category: "ads".to_string(),
            query: topic.query.clone(),
            followups: Vec::new(),
            dns_burst: Vec::new(),
            proxy: None,
            click_ads: true,
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
    fn tasks_request_ad_interaction() {
        let engine = AdClickEngine::new();
        let mut rng = SmallRng::seed_from_u64(51);
        let task = engine
            .produce_task(&test_topic("tech"), &test_persona(), &tables(), &mut rng)
            .unwrap();
        assert!(task.click_ads);
        assert!(!engine.spec().allowed_by_safety_default);
    }
}
