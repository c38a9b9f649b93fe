//! PostgreSQL deployment repository

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use super::repository::{DeploymentRepository, Mutation, RepositoryError};
use super::{Deployment, DeploymentStatus};
use crate::config::ConfigMap;

const COLUMNS: &str = "id, owner_id, sink_id, backend, config, last_status, last_status_update, \
     last_error_message, last_error_time, collector_name, last_collector_deploy_time, \
     last_collector_stop_time";

/// PostgreSQL-backed repository
#[derive(Clone)]
pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    /// Connect and make sure the deployments table exists
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, RepositoryError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        let repo = Self { pool };
        repo.ensure_schema().await?;
        info!("Connected to deployment database");
        Ok(repo)
    }

    pub async fn from_pool(pool: PgPool) -> Result<Self, RepositoryError> {
        let repo = Self { pool };
        repo.ensure_schema().await?;
        Ok(repo)
    }

    async fn ensure_schema(&self) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS deployments (
                id UUID PRIMARY KEY,
                owner_id TEXT NOT NULL,
                sink_id TEXT NOT NULL,
                backend TEXT NOT NULL,
                config JSONB NOT NULL,
                last_status TEXT NOT NULL,
                last_status_update TIMESTAMPTZ,
                last_error_message TEXT,
                last_error_time TIMESTAMPTZ,
                collector_name TEXT,
                last_collector_deploy_time TIMESTAMPTZ,
                last_collector_stop_time TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_deployments_owner_sink
            ON deployments (owner_id, sink_id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// One deployments row, typed as the columns are
#[derive(Debug, Clone, PartialEq)]
struct DeploymentRow {
    id: Uuid,
    owner_id: String,
    sink_id: String,
    backend: String,
    config: serde_json::Value,
    last_status: String,
    last_status_update: Option<DateTime<Utc>>,
    last_error_message: Option<String>,
    last_error_time: Option<DateTime<Utc>>,
    collector_name: Option<String>,
    last_collector_deploy_time: Option<DateTime<Utc>>,
    last_collector_stop_time: Option<DateTime<Utc>>,
}

impl DeploymentRow {
    fn from_pg(row: &PgRow) -> Result<Self, RepositoryError> {
        Ok(Self {
            id: row.try_get("id")?,
            owner_id: row.try_get("owner_id")?,
            sink_id: row.try_get("sink_id")?,
            backend: row.try_get("backend")?,
            config: row.try_get("config")?,
            last_status: row.try_get("last_status")?,
            last_status_update: row.try_get("last_status_update")?,
            last_error_message: row.try_get("last_error_message")?,
            last_error_time: row.try_get("last_error_time")?,
            collector_name: row.try_get("collector_name")?,
            last_collector_deploy_time: row.try_get("last_collector_deploy_time")?,
            last_collector_stop_time: row.try_get("last_collector_stop_time")?,
        })
    }
}

impl From<&Deployment> for DeploymentRow {
    fn from(deployment: &Deployment) -> Self {
        Self {
            id: deployment.id,
            owner_id: deployment.owner_id.clone(),
            sink_id: deployment.sink_id.clone(),
            backend: deployment.backend.clone(),
            config: serde_json::Value::Object(deployment.config.clone()),
            last_status: deployment.last_status.as_str().to_string(),
            last_status_update: deployment.last_status_update,
            last_error_message: deployment.last_error_message.clone(),
            last_error_time: deployment.last_error_time,
            collector_name: deployment.collector_name.clone(),
            last_collector_deploy_time: deployment.last_collector_deploy_time,
            last_collector_stop_time: deployment.last_collector_stop_time,
        }
    }
}

impl TryFrom<DeploymentRow> for Deployment {
    type Error = RepositoryError;

    fn try_from(row: DeploymentRow) -> Result<Self, Self::Error> {
        let config: ConfigMap = serde_json::from_value(row.config)
            .map_err(|e| RepositoryError::Serialization(format!("invalid config column: {}", e)))?;
        let last_status: DeploymentStatus = row
            .last_status
            .parse()
            .map_err(RepositoryError::Serialization)?;

        Ok(Deployment {
            id: row.id,
            owner_id: row.owner_id,
            sink_id: row.sink_id,
            backend: row.backend,
            config,
            last_status,
            last_status_update: row.last_status_update,
            last_error_message: row.last_error_message,
            last_error_time: row.last_error_time,
            collector_name: row.collector_name,
            last_collector_deploy_time: row.last_collector_deploy_time,
            last_collector_stop_time: row.last_collector_stop_time,
        })
    }
}

fn row_to_deployment(row: &PgRow) -> Result<Deployment, RepositoryError> {
    DeploymentRow::from_pg(row)?.try_into()
}

#[async_trait]
impl DeploymentRepository for PostgresRepository {
    async fn insert(&self, deployment: &Deployment) -> Result<(), RepositoryError> {
        let row = DeploymentRow::from(deployment);
        let result = sqlx::query(&format!(
            "INSERT INTO deployments ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
            COLUMNS
        ))
        .bind(row.id)
        .bind(row.owner_id)
        .bind(row.sink_id)
        .bind(row.backend)
        .bind(row.config)
        .bind(row.last_status)
        .bind(row.last_status_update)
        .bind(row.last_error_message)
        .bind(row.last_error_time)
        .bind(row.collector_name)
        .bind(row.last_collector_deploy_time)
        .bind(row.last_collector_stop_time)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(
                RepositoryError::AlreadyExists(deployment.owner_id.clone(), deployment.sink_id.clone()),
            ),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, owner_id: &str, sink_id: &str) -> Result<Option<Deployment>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM deployments WHERE owner_id = $1 AND sink_id = $2",
            COLUMNS
        ))
        .bind(owner_id)
        .bind(sink_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_deployment).transpose()
    }

    async fn modify<'a>(
        &self,
        owner_id: &str,
        sink_id: &str,
        mutation: Mutation<'a>,
    ) -> Result<Deployment, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM deployments WHERE owner_id = $1 AND sink_id = $2 FOR UPDATE",
            COLUMNS
        ))
        .bind(owner_id)
        .bind(sink_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| RepositoryError::NotFound(owner_id.to_string(), sink_id.to_string()))?;

        let current = row_to_deployment(&row)?;
        let mut updated = current.clone();
        if !mutation(&mut updated) {
            tx.rollback().await?;
            return Ok(current);
        }

        let written = DeploymentRow::from(&updated);
        sqlx::query(
            r#"
            UPDATE deployments SET
                backend = $2,
                config = $3,
                last_status = $4,
                last_status_update = $5,
                last_error_message = $6,
                last_error_time = $7,
                collector_name = $8,
                last_collector_deploy_time = $9,
                last_collector_stop_time = $10
            WHERE id = $1
            "#,
        )
        .bind(written.id)
        .bind(written.backend)
        .bind(written.config)
        .bind(written.last_status)
        .bind(written.last_status_update)
        .bind(written.last_error_message)
        .bind(written.last_error_time)
        .bind(written.collector_name)
        .bind(written.last_collector_deploy_time)
        .bind(written.last_collector_stop_time)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(updated)
    }

    async fn delete(&self, owner_id: &str, sink_id: &str) -> Result<Deployment, RepositoryError> {
        let row = sqlx::query(&format!(
            "DELETE FROM deployments WHERE owner_id = $1 AND sink_id = $2 RETURNING {}",
            COLUMNS
        ))
        .bind(owner_id)
        .bind(sink_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| RepositoryError::NotFound(owner_id.to_string(), sink_id.to_string()))?;

        row_to_deployment(&row)
    }
}
