//! In-memory index of known containers

use crate::container::Container;
use crate::{CoreError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use wharf_runtime::ContainerId;

/// Containers by id, shared across the engine
#[derive(Debug, Default)]
pub struct Registry {
    containers: RwLock<HashMap<ContainerId, Arc<Container>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, container: Arc<Container>) {
        self.containers
            .write()
            .await
            .insert(container.id().clone(), container);
    }

    pub async fn get(&self, id: &ContainerId) -> Option<Arc<Container>> {
        self.containers.read().await.get(id).cloned()
    }

    /// Resolve a full id or a unique id prefix
    pub async fn resolve(&self, reference: &str) -> Result<Arc<Container>> {
        let containers = self.containers.read().await;
        if let Some(c) = containers.get(&ContainerId::new(reference)) {
            return Ok(c.clone());
        }

        let mut matches: Vec<&Arc<Container>> = containers
            .values()
            .filter(|c| !reference.is_empty() && c.id().0.starts_with(reference))
            .collect();
        match matches.len() {
            0 => Err(CoreError::ContainerNotFound(reference.to_string())),
            1 => Ok(matches.remove(0).clone()),
            _ => {
                let mut ids: Vec<&str> = matches.iter().map(|c| c.short_id()).collect();
                ids.sort_unstable();
                Err(CoreError::Ambiguous(reference.to_string(), ids.join(", ")))
            }
        }
    }

    /// Every container, oldest first
    pub async fn list(&self) -> Vec<Arc<Container>> {
        let mut all: Vec<Arc<Container>> = self.containers.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.created().cmp(&b.created()).then_with(|| a.id().cmp(b.id())));
        all
    }

    pub async fn remove(&self, id: &ContainerId) -> Option<Arc<Container>> {
        self.containers.write().await.remove(id)
    }

    pub async fn len(&self) -> usize {
        self.containers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.containers.read().await.is_empty()
    }
}
