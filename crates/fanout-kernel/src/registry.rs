//! Named source clients available to requests.

use std::sync::Arc;

use fanout_protocol::{AggregatorError, AggregatorResult, SourceClient, SourceId};
use indexmap::IndexMap;
use serde::Serialize;

/// Public description of a registered source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceInfo {
    pub id: SourceId,
    pub description: String,
}

#[derive(Clone)]
struct RegisteredSource {
    description: String,
    client: Arc<dyn SourceClient>,
}

/// Source id to client map. Iteration follows registration order.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    sources: IndexMap<SourceId, RegisteredSource>,
}

impl SourceRegistry {
    /// Registers `client` under `source_id`, replacing any previous client
    /// with the same id.
    pub fn register(
        &mut self,
        source_id: impl Into<SourceId>,
        description: impl Into<String>,
        client: Arc<dyn SourceClient>,
    ) {
        self.sources.insert(
            source_id.into(),
            RegisteredSource {
                description: description.into(),
                client,
            },
        );
    }

    pub fn get(&self, source_id: &SourceId) -> Option<Arc<dyn SourceClient>> {
        self.sources
            .get(source_id)
            .map(|source| Arc::clone(&source.client))
    }

    pub fn resolve(&self, source_id: &SourceId) -> AggregatorResult<Arc<dyn SourceClient>> {
        self.get(source_id)
            .ok_or_else(|| AggregatorError::UnknownSource(source_id.clone()))
    }

    pub fn ids(&self) -> impl Iterator<Item = &SourceId> {
        self.sources.keys()
    }

    pub fn describe(&self) -> Vec<SourceInfo> {
        self.sources
            .iter()
            .map(|(id, source)| SourceInfo {
                id: id.clone(),
                description: source.description.clone(),
            })
            .collect()
    }
}

impl std::fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("sources", &self.sources.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use fanout_protocol::{AggregatorError, SourceId};

    use super::SourceRegistry;
    use crate::ScriptedSource;

    #[test]
    fn lists_sources_in_registration_order() {
        let mut registry = SourceRegistry::default();
        registry.register("zeta", "last letter", Arc::new(ScriptedSource::new(["z"])));
        registry.register("alpha", "first letter", Arc::new(ScriptedSource::new(["a"])));

        let ids: Vec<_> = registry.ids().map(SourceId::as_str).collect();
        assert_eq!(ids, vec!["zeta", "alpha"]);
        assert_eq!(registry.describe()[1].description, "first letter");
        assert_eq!(registry.describe().len(), 2);
    }

    #[test]
    fn resolving_an_unknown_source_fails() {
        let registry = SourceRegistry::default();
        let missing = SourceId::from("ghost");
        assert!(matches!(
            registry.resolve(&missing),
            Err(AggregatorError::UnknownSource(id)) if id == missing
        ));
    }
}
