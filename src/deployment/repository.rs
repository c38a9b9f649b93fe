//! Deployment persistence
//!
//! The repository is the only mutable state shared between the consumers and
//! the monitor. Every mutation goes through [`DeploymentRepository::modify`],
//! which applies a closure to one row under that row's lock.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;

use super::Deployment;

/// Errors from deployment persistence
#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Deployment not found for owner '{0}' sink '{1}'")]
    NotFound(String, String),

    #[error("Deployment already exists for owner '{0}' sink '{1}'")]
    AlreadyExists(String, String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for RepositoryError {
    fn from(e: sqlx::Error) -> Self {
        RepositoryError::Database(e.to_string())
    }
}

/// Row mutation applied under the row lock
///
/// Returns `false` when there is nothing to write.
pub type Mutation<'a> = Box<dyn FnOnce(&mut Deployment) -> bool + Send + 'a>;

/// Storage for deployment records, keyed by `(owner_id, sink_id)`
#[async_trait]
pub trait DeploymentRepository: Send + Sync {
    /// Insert a new record, failing with `AlreadyExists` on a duplicate key
    async fn insert(&self, deployment: &Deployment) -> Result<(), RepositoryError>;

    async fn get(&self, owner_id: &str, sink_id: &str) -> Result<Option<Deployment>, RepositoryError>;

    /// Atomic read-modify-write of one row, returning the row as stored
    async fn modify<'a>(
        &self,
        owner_id: &str,
        sink_id: &str,
        mutation: Mutation<'a>,
    ) -> Result<Deployment, RepositoryError>;

    /// Delete a record, returning it
    async fn delete(&self, owner_id: &str, sink_id: &str) -> Result<Deployment, RepositoryError>;
}

// ============================================================================
// In-memory repository
// ============================================================================

/// In-memory repository for tests and local runs
#[derive(Debug, Default)]
pub struct MemoryRepository {
    rows: DashMap<(String, String), Deployment>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

fn key(owner_id: &str, sink_id: &str) -> (String, String) {
    (owner_id.to_string(), sink_id.to_string())
}

#[async_trait]
impl DeploymentRepository for MemoryRepository {
    async fn insert(&self, deployment: &Deployment) -> Result<(), RepositoryError> {
        match self.rows.entry(key(&deployment.owner_id, &deployment.sink_id)) {
            Entry::Occupied(_) => Err(RepositoryError::AlreadyExists(
                deployment.owner_id.clone(),
                deployment.sink_id.clone(),
            )),
            Entry::Vacant(slot) => {
                slot.insert(deployment.clone());
                Ok(())
            }
        }
    }

    async fn get(&self, owner_id: &str, sink_id: &str) -> Result<Option<Deployment>, RepositoryError> {
        Ok(self.rows.get(&key(owner_id, sink_id)).map(|r| r.clone()))
    }

    async fn modify<'a>(
        &self,
        owner_id: &str,
        sink_id: &str,
        mutation: Mutation<'a>,
    ) -> Result<Deployment, RepositoryError> {
        let mut row = self
            .rows
            .get_mut(&key(owner_id, sink_id))
            .ok_or_else(|| RepositoryError::NotFound(owner_id.to_string(), sink_id.to_string()))?;

        let mut updated = row.clone();
        if mutation(&mut updated) {
            *row = updated;
        }
        Ok(row.clone())
    }

    async fn delete(&self, owner_id: &str, sink_id: &str) -> Result<Deployment, RepositoryError> {
        self.rows
            .remove(&key(owner_id, sink_id))
            .map(|(_, d)| d)
            .ok_or_else(|| RepositoryError::NotFound(owner_id.to_string(), sink_id.to_string()))
    }
}
