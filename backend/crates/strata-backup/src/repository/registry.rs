use std::sync::Arc;

use dashmap::DashMap;
use strata_commons::RepoId;

use super::{Repository, RepositoryConnector, RepositoryDesc};
use crate::error::{BackupError, Result};

/// Named repositories known to the control plane.
///
/// Descriptors are what gets persisted; live handles are rebuilt through the
/// connector when the registry is restored from an image.
pub struct RepositoryRegistry {
    connector: Arc<dyn RepositoryConnector>,
    repos: DashMap<String, Arc<dyn Repository>>,
}

impl RepositoryRegistry {
    pub fn new(connector: Arc<dyn RepositoryConnector>) -> Self {
        Self {
            connector,
            repos: DashMap::new(),
        }
    }

    /// Connect and register `desc`. Fails if the name is taken.
    pub fn add(&self, desc: RepositoryDesc) -> Result<Arc<dyn Repository>> {
        if self.repos.contains_key(&desc.name) {
            return Err(BackupError::conflict(format!(
                "Repository {} already exists",
                desc.name
            )));
        }
        let repo = self.connector.connect(&desc)?;
        self.repos.insert(desc.name.clone(), Arc::clone(&repo));
        log::info!(
            "Registered repository {} (id={}, location={}, read_only={})",
            desc.name,
            desc.id,
            desc.location,
            desc.read_only
        );
        Ok(repo)
    }

    pub fn remove(&self, name: &str) -> Option<Arc<dyn Repository>> {
        self.repos.remove(name).map(|(_, repo)| repo)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.repos.contains_key(name)
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Repository>> {
        self.repos
            .get(name)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| BackupError::not_found(format!("Repository {} does not exist", name)))
    }

    pub fn get(&self, repo_id: RepoId) -> Option<Arc<dyn Repository>> {
        self.repos
            .iter()
            .find(|entry| entry.value().desc().id == repo_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Descriptors ordered by repository id.
    pub fn descriptors(&self) -> Vec<RepositoryDesc> {
        let mut descs: Vec<RepositoryDesc> =
            self.repos.iter().map(|entry| entry.value().desc().clone()).collect();
        descs.sort_by_key(|d| d.id);
        descs
    }

    /// Replace the registry content with `descs`. A descriptor whose
    /// repository cannot be reached is skipped and logged; jobs referencing it
    /// will fail when they touch the repository.
    pub fn restore(&self, descs: Vec<RepositoryDesc>) {
        self.repos.clear();
        for desc in descs {
            let name = desc.name.clone();
            if let Err(e) = self.add(desc) {
                log::error!("Failed to reconnect repository {}: {}", name, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MemoryRepositoryConnector;

    fn desc(id: i64, name: &str) -> RepositoryDesc {
        RepositoryDesc {
            id: RepoId::new(id),
            name: name.to_string(),
            location: format!("mem://{}", name),
            read_only: false,
        }
    }

    #[test]
    fn test_add_resolve_remove() {
        let registry = RepositoryRegistry::new(Arc::new(MemoryRepositoryConnector::default()));
        registry.add(desc(1, "repo1")).unwrap();

        assert_eq!(registry.resolve("repo1").unwrap().desc().id, RepoId::new(1));
        assert!(registry.get(RepoId::new(1)).is_some());
        assert!(matches!(registry.resolve("nope"), Err(BackupError::NotFound(_))));

        let err = registry.add(desc(2, "repo1")).err().unwrap();
        assert!(matches!(err, BackupError::Conflict(_)));

        assert!(registry.remove("repo1").is_some());
        assert!(!registry.contains("repo1"));
    }

    #[test]
    fn test_restore_replaces_content() {
        let registry = RepositoryRegistry::new(Arc::new(MemoryRepositoryConnector::default()));
        registry.add(desc(1, "old")).unwrap();
        registry.restore(vec![desc(3, "b"), desc(2, "a")]);

        let names: Vec<_> = registry.descriptors().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }
}
