//! Postgres-backed [`ClusterStore`].

use async_trait::async_trait;
use snafu::ResultExt;
use sqlx::PgPool;

use super::{
    ClusterRecord, ClusterStore, ClusterUpdate, DatabaseSnafu, Error, NewCluster, Result,
};

const SELECT_CLUSTER: &str = "SELECT id, name, deployer_url, enabled, priority, mtls_enabled, \
     ca_cert, client_cert, client_key_encrypted, created_at, updated_at FROM vice_clusters";

pub struct PgClusterStore {
    pool: PgPool,
}

impl PgClusterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs the embedded migrations.
    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }
}

/// Maps unique-constraint violations on the name column to [`Error::NameTaken`].
fn map_insert_error(error: sqlx::Error, name: &str) -> Error {
    let unique_violation = error
        .as_database_error()
        .is_some_and(sqlx::error::DatabaseError::is_unique_violation);

    if unique_violation {
        Error::NameTaken {
            name: name.to_string(),
        }
    } else {
        Error::Database { source: error }
    }
}

#[async_trait]
impl ClusterStore for PgClusterStore {
    async fn list_clusters(&self) -> Result<Vec<ClusterRecord>> {
        sqlx::query_as::<_, ClusterRecord>(&format!("{SELECT_CLUSTER} ORDER BY name"))
            .fetch_all(&self.pool)
            .await
            .context(DatabaseSnafu)
    }

    async fn get_cluster(&self, id: &str) -> Result<Option<ClusterRecord>> {
        sqlx::query_as::<_, ClusterRecord>(&format!("{SELECT_CLUSTER} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context(DatabaseSnafu)
    }

    async fn get_cluster_by_name(&self, name: &str) -> Result<Option<ClusterRecord>> {
        sqlx::query_as::<_, ClusterRecord>(&format!("{SELECT_CLUSTER} WHERE name = $1"))
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .context(DatabaseSnafu)
    }

    async fn insert_cluster(&self, cluster: NewCluster) -> Result<ClusterRecord> {
        sqlx::query_as::<_, ClusterRecord>(
            "INSERT INTO vice_clusters \
                 (id, name, deployer_url, enabled, priority, mtls_enabled, \
                  ca_cert, client_cert, client_key_encrypted) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             RETURNING id, name, deployer_url, enabled, priority, mtls_enabled, \
                 ca_cert, client_cert, client_key_encrypted, created_at, updated_at",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(&cluster.name)
        .bind(&cluster.deployer_url)
        .bind(cluster.enabled)
        .bind(cluster.priority)
        .bind(cluster.mtls_enabled)
        .bind(&cluster.ca_cert)
        .bind(&cluster.client_cert)
        .bind(&cluster.client_key_encrypted)
        .fetch_one(&self.pool)
        .await
        .map_err(|error| map_insert_error(error, &cluster.name))
    }

    async fn update_cluster(
        &self,
        id: &str,
        update: ClusterUpdate,
    ) -> Result<Option<ClusterRecord>> {
        let mut tx = self.pool.begin().await.context(DatabaseSnafu)?;

        let existing = sqlx::query_as::<_, ClusterRecord>(&format!(
            "{SELECT_CLUSTER} WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .context(DatabaseSnafu)?;

        let Some(mut record) = existing else {
            return Ok(None);
        };
        update.apply(&mut record);

        sqlx::query(
            "UPDATE vice_clusters SET name = $2, deployer_url = $3, enabled = $4, \
                 priority = $5, mtls_enabled = $6, ca_cert = $7, client_cert = $8, \
                 client_key_encrypted = $9, updated_at = now() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(&record.name)
        .bind(&record.deployer_url)
        .bind(record.enabled)
        .bind(record.priority)
        .bind(record.mtls_enabled)
        .bind(&record.ca_cert)
        .bind(&record.client_cert)
        .bind(&record.client_key_encrypted)
        .execute(&mut *tx)
        .await
        .map_err(|error| map_insert_error(error, &record.name))?;

        tx.commit().await.context(DatabaseSnafu)?;
        Ok(Some(record))
    }

    async fn delete_cluster(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM vice_clusters WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .context(DatabaseSnafu)?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_cluster_enabled(&self, id: &str, enabled: bool) -> Result<bool> {
        let result =
            sqlx::query("UPDATE vice_clusters SET enabled = $2, updated_at = now() WHERE id = $1")
                .bind(id)
                .bind(enabled)
                .execute(&self.pool)
                .await
                .context(DatabaseSnafu)?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_ownership(&self, external_id: &str) -> Result<Option<String>> {
        sqlx::query_scalar::<_, String>(
            "SELECT cluster_id FROM vice_deployment_clusters WHERE external_id = $1",
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .context(DatabaseSnafu)
    }

    async fn upsert_ownership(&self, external_id: &str, cluster_id: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO vice_deployment_clusters (external_id, cluster_id) VALUES ($1, $2) \
             ON CONFLICT (external_id) \
             DO UPDATE SET cluster_id = EXCLUDED.cluster_id, updated_at = now()",
        )
        .bind(external_id)
        .bind(cluster_id)
        .execute(&self.pool)
        .await
        .context(DatabaseSnafu)?;
        Ok(())
    }

    async fn delete_ownership(&self, external_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM vice_deployment_clusters WHERE external_id = $1")
            .bind(external_id)
            .execute(&self.pool)
            .await
            .context(DatabaseSnafu)?;
        Ok(())
    }
}
