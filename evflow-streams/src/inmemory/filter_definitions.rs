use crate::error::StreamsResult as Result;
use crate::filters::FilterDefinition;
use crate::ids::{StreamKey, TenantId};
use crate::persist::FilterDefinitions;
use async_trait::async_trait;
use dashmap::DashMap;

#[derive(Default)]
pub struct InMemoryFilterDefinitions {
    definitions: DashMap<(TenantId, StreamKey), FilterDefinition>,
}

impl InMemoryFilterDefinitions {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FilterDefinitions for InMemoryFilterDefinitions {
    async fn try_get(
        &self,
        tenant: &TenantId,
        stream: &StreamKey,
    ) -> Result<Option<FilterDefinition>> {
        Ok(self.definitions.get(&(*tenant, *stream)).map(|d| d.clone()))
    }

    async fn persist(
        &self,
        tenant: &TenantId,
        stream: &StreamKey,
        definition: &FilterDefinition,
    ) -> Result<()> {
        self.definitions
            .insert((*tenant, *stream), definition.clone());
        Ok(())
    }
}
