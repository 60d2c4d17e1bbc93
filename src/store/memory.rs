use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use super::Store;
use crate::error::{EngineError, Result};
use crate::models::{GroupAggregate, Registry};

/// In-process store with one mutex per group.
#[derive(Debug, Default)]
pub struct MemoryStore {
    groups: RwLock<HashMap<Uuid, Arc<Mutex<GroupAggregate>>>>,
    registry: Mutex<Registry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn slot(&self, group_id: Uuid) -> Result<Arc<Mutex<GroupAggregate>>> {
        self.groups
            .read()
            .await
            .get(&group_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("group {group_id}")))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_group(&self, aggregate: GroupAggregate) -> Result<()> {
        let mut groups = self.groups.write().await;
        let id = aggregate.id();
        if groups.contains_key(&id) {
            return Err(EngineError::ValidationFailed(format!("group {id} already exists")));
        }
        groups.insert(id, Arc::new(Mutex::new(aggregate)));
        Ok(())
    }

    async fn group_ids(&self) -> Result<Vec<Uuid>> {
        let mut ids: Vec<Uuid> = self.groups.read().await.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    async fn load_group(&self, group_id: Uuid) -> Result<GroupAggregate> {
        let slot = self.slot(group_id).await?;
        let aggregate = slot.lock().await.clone();
        Ok(aggregate)
    }

    async fn registry(&self) -> Result<Registry> {
        Ok(self.registry.lock().await.clone())
    }

    async fn update_group<T, F>(&self, group_id: Uuid, f: F) -> Result<T>
    where
        F: FnOnce(&mut GroupAggregate, &Registry) -> Result<T> + Send,
        T: Send,
    {
        let slot = self.slot(group_id).await?;
        let mut current = slot.lock().await;
        let registry = self.registry.lock().await.clone();

        let mut working = current.clone();
        let out = f(&mut working, &registry)?;
        *current = working;
        Ok(out)
    }

    async fn update_registry<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Registry) -> Result<T> + Send,
        T: Send,
    {
        let mut current = self.registry.lock().await;
        let mut working = current.clone();
        let out = f(&mut working)?;
        *current = working;
        Ok(out)
    }
}
