//! Postgres-backed registry store.
//!
//! All nodes of a cluster share one table. Rows carry their own
//! `expires_at`; a row is live while `expires_at > now()` on the database
//! clock, so node clock skew does not matter.
//!
//! Registrations of one cluster are serialized by a transaction-scoped
//! advisory lock keyed on the cluster name. Under READ COMMITTED, a joiner
//! therefore always reads every joiner that committed before it.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use shoal_id::NodeId;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::info;

use super::{RegistryError, RegistryStore};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS shoal_nodes (
    cluster     TEXT        NOT NULL,
    node_id     BIGINT      NOT NULL,
    info        TEXT        NOT NULL,
    expires_at  TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (cluster, node_id)
)
"#;

/// Registry store over a Postgres table.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    cluster: String,
}

// Node ids are u64; the column is a signed BIGINT holding the same bits.
fn to_db(node_id: NodeId) -> i64 {
    node_id.value() as i64
}

fn from_db(raw: i64) -> NodeId {
    NodeId::new(raw as u64)
}

fn ttl_ms(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

impl PostgresStore {
    /// Connects and ensures the table exists.
    pub async fn connect(database_url: &str, cluster: &str) -> Result<Self, RegistryError> {
        info!(cluster = %cluster, "Connecting registry to Postgres");

        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(RegistryError::Connect)?;

        let store = Self::from_pool(pool, cluster);
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Wraps an existing pool without touching the schema.
    pub fn from_pool(pool: PgPool, cluster: &str) -> Self {
        Self {
            pool,
            cluster: cluster.to_string(),
        }
    }

    /// Creates the registry table if needed.
    pub async fn ensure_schema(&self) -> Result<(), RegistryError> {
        sqlx::query(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(RegistryError::Query)?;
        Ok(())
    }
}

#[async_trait]
impl RegistryStore for PostgresStore {
    async fn put(&self, node_id: NodeId, value: String, ttl: Duration) -> Result<(), RegistryError> {
        sqlx::query(
            r#"
            INSERT INTO shoal_nodes (cluster, node_id, info, expires_at)
            VALUES ($1, $2, $3, now() + $4::bigint * interval '1 millisecond')
            ON CONFLICT (cluster, node_id)
            DO UPDATE SET info = EXCLUDED.info, expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(&self.cluster)
        .bind(to_db(node_id))
        .bind(value)
        .bind(ttl_ms(ttl))
        .execute(&self.pool)
        .await
        .map_err(RegistryError::Query)?;

        Ok(())
    }

    async fn put_and_read_all(
        &self,
        node_id: NodeId,
        value: String,
        ttl: Duration,
    ) -> Result<Vec<(NodeId, String)>, RegistryError> {
        let mut tx = self.pool.begin().await.map_err(RegistryError::Query)?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&self.cluster)
            .execute(&mut *tx)
            .await
            .map_err(RegistryError::Query)?;

        sqlx::query("DELETE FROM shoal_nodes WHERE cluster = $1 AND expires_at <= now()")
            .bind(&self.cluster)
            .execute(&mut *tx)
            .await
            .map_err(RegistryError::Query)?;

        sqlx::query(
            r#"
            INSERT INTO shoal_nodes (cluster, node_id, info, expires_at)
            VALUES ($1, $2, $3, now() + $4::bigint * interval '1 millisecond')
            ON CONFLICT (cluster, node_id)
            DO UPDATE SET info = EXCLUDED.info, expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(&self.cluster)
        .bind(to_db(node_id))
        .bind(value)
        .bind(ttl_ms(ttl))
        .execute(&mut *tx)
        .await
        .map_err(RegistryError::Query)?;

        let rows = sqlx::query(
            r#"
            SELECT node_id, info
            FROM shoal_nodes
            WHERE cluster = $1 AND expires_at > now()
            ORDER BY node_id
            "#,
        )
        .bind(&self.cluster)
        .fetch_all(&mut *tx)
        .await
        .map_err(RegistryError::Query)?;

        tx.commit().await.map_err(RegistryError::Query)?;

        rows.iter()
            .map(|row| {
                let id: i64 = row.try_get("node_id").map_err(RegistryError::Query)?;
                let info: String = row.try_get("info").map_err(RegistryError::Query)?;
                Ok((from_db(id), info))
            })
            .collect()
    }

    async fn touch(&self, node_id: NodeId, ttl: Duration) -> Result<bool, RegistryError> {
        let result = sqlx::query(
            r#"
            UPDATE shoal_nodes
            SET expires_at = now() + $3::bigint * interval '1 millisecond'
            WHERE cluster = $1 AND node_id = $2 AND expires_at > now()
            "#,
        )
        .bind(&self.cluster)
        .bind(to_db(node_id))
        .bind(ttl_ms(ttl))
        .execute(&self.pool)
        .await
        .map_err(RegistryError::Query)?;

        Ok(result.rows_affected() > 0)
    }

    async fn live_ids(&self) -> Result<HashSet<NodeId>, RegistryError> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT node_id FROM shoal_nodes WHERE cluster = $1 AND expires_at > now()",
        )
        .bind(&self.cluster)
        .fetch_all(&self.pool)
        .await
        .map_err(RegistryError::Query)?;

        Ok(ids.into_iter().map(from_db).collect())
    }

    async fn get(&self, node_id: NodeId) -> Result<Option<String>, RegistryError> {
        sqlx::query_scalar(
            r#"
            SELECT info FROM shoal_nodes
            WHERE cluster = $1 AND node_id = $2 AND expires_at > now()
            "#,
        )
        .bind(&self.cluster)
        .bind(to_db(node_id))
        .fetch_optional(&self.pool)
        .await
        .map_err(RegistryError::Query)
    }

    async fn read_all(&self) -> Result<Vec<(NodeId, String)>, RegistryError> {
        let rows: Vec<(i64, String)> = sqlx::query_as(
            r#"
            SELECT node_id, info FROM shoal_nodes
            WHERE cluster = $1 AND expires_at > now()
            ORDER BY node_id
            "#,
        )
        .bind(&self.cluster)
        .fetch_all(&self.pool)
        .await
        .map_err(RegistryError::Query)?;

        Ok(rows.into_iter().map(|(id, info)| (from_db(id), info)).collect())
    }

    async fn remove(&self, node_id: NodeId) -> Result<(), RegistryError> {
        sqlx::query("DELETE FROM shoal_nodes WHERE cluster = $1 AND node_id = $2")
            .bind(&self.cluster)
            .bind(to_db(node_id))
            .execute(&self.pool)
            .await
            .map_err(RegistryError::Query)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_bits_survive_bigint() {
        for raw in [0u64, 1, i64::MAX as u64, u64::MAX] {
            assert_eq!(from_db(to_db(NodeId::new(raw))), NodeId::new(raw));
        }
    }

    #[test]
    fn test_ttl_ms_saturates() {
        assert_eq!(ttl_ms(Duration::from_secs(15)), 15_000);
        assert_eq!(ttl_ms(Duration::MAX), i64::MAX);
    }

    /// Needs a database: `SHOAL_TEST_DATABASE_URL=postgres://... cargo test`.
    #[tokio::test]
    async fn test_concurrent_joiners_see_each_other() {
        let Ok(url) = std::env::var("SHOAL_TEST_DATABASE_URL") else {
            return;
        };
        let ttl = Duration::from_secs(30);

        for _ in 0..20 {
            let cluster = format!("join-{}", shoal_id::Ulid::new());
            let first = PostgresStore::connect(&url, &cluster).await.unwrap();
            let second = PostgresStore::connect(&url, &cluster).await.unwrap();

            let (a, b) = tokio::join!(
                first.put_and_read_all(NodeId::new(1), "a".to_string(), ttl),
                second.put_and_read_all(NodeId::new(2), "b".to_string(), ttl),
            );
            let (a, b) = (a.unwrap(), b.unwrap());

            let a_saw_b = a.iter().any(|(id, _)| *id == NodeId::new(2));
            let b_saw_a = b.iter().any(|(id, _)| *id == NodeId::new(1));
            assert!(a_saw_b || b_saw_a, "neither joiner saw the other");

            first.remove(NodeId::new(1)).await.unwrap();
            first.remove(NodeId::new(2)).await.unwrap();
        }
    }
}
