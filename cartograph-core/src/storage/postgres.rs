use std::time::Instant;

use async_trait::async_trait;
use cartograph_model::{
    MetadataCount, RelationCriteria, RelationEdge, Resource, ResourceCount,
    ResourceFilter,
};
use chrono::Utc;
use sqlx::PgPool;
use tracing::{debug, info};
use uuid::Uuid;

use super::query::{FindRow, ResourceQuery, collapse_rows};
use super::{METADATA_COUNT_THRESHOLD, Storage, validate_criteria};
use crate::error::Result;

const LATEST_VERSION_JOIN: &str = r#"
    JOIN (
        SELECT source, kind, MAX(version) AS version
        FROM resources
        GROUP BY source, kind
    ) latest
        ON latest.source = r.source
        AND latest.kind = r.kind
        AND latest.version = r.version
"#;

#[derive(Debug, sqlx::FromRow)]
struct ResourceCountRow {
    source: String,
    kind: String,
    total_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct MetadataCountRow {
    source: String,
    kind: String,
    key: String,
    value: String,
    total_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct EdgeRow {
    resource_uuid: Uuid,
    resource_external_id: String,
    related_uuid: Uuid,
    related_external_id: String,
}

/// PostgreSQL backend.
#[derive(Clone, Debug)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects to `database_url` with a small pool.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn prepare(&self) -> Result<()> {
        crate::MIGRATOR.run(self.pool()).await?;
        info!("database schema is up to date");
        Ok(())
    }

    async fn persist(&self, resources: &[Resource]) -> Result<()> {
        if resources.is_empty() {
            return Ok(());
        }
        let started = Instant::now();
        let mut tx = self.pool().begin().await?;
        let mut ids = Vec::with_capacity(resources.len());

        for resource in resources {
            let id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO resources (
                    source, kind, uuid, name, external_id, version, discovered_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (external_id)
                DO UPDATE SET
                    source = EXCLUDED.source,
                    kind = EXCLUDED.kind,
                    uuid = EXCLUDED.uuid,
                    name = EXCLUDED.name,
                    version = EXCLUDED.version,
                    discovered_at = EXCLUDED.discovered_at
                RETURNING id
                "#,
            )
            .bind(&resource.scanner)
            .bind(&resource.kind)
            .bind(resource.uuid)
            .bind(&resource.name)
            .bind(&resource.external_id)
            .bind(resource.version)
            .bind(resource.fetched_at.unwrap_or_else(Utc::now))
            .fetch_one(&mut *tx)
            .await?;

            for meta in &resource.meta_data {
                sqlx::query(
                    r#"
                    INSERT INTO metadata (resource_id, key, value)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (resource_id, key)
                    DO UPDATE SET value = EXCLUDED.value
                    "#,
                )
                .bind(id)
                .bind(&meta.key)
                .bind(&meta.value)
                .execute(&mut *tx)
                .await?;
            }
            ids.push(id);
        }

        // Edges go last so targets later in the same batch are found.
        for (resource, id) in resources.iter().zip(ids) {
            for related in &resource.related_with {
                sqlx::query(
                    r#"
                    INSERT INTO relations (resource_id, related_resource_id)
                    SELECT $1, r.id
                    FROM resources r
                    WHERE r.external_id = $2 AND r.id <> $1
                    ON CONFLICT DO NOTHING
                    "#,
                )
                .bind(id)
                .bind(&related.external_id)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        debug!(
            batch.size = resources.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "batch persisted"
        );
        Ok(())
    }

    async fn find(&self, filter: &ResourceFilter) -> Result<Vec<Resource>> {
        filter.validate()?;
        let mut builder = ResourceQuery::new(filter).build();
        let rows: Vec<FindRow> =
            builder.build_query_as().fetch_all(self.pool()).await?;
        Ok(collapse_rows(rows))
    }

    async fn next_version_for_resource(
        &self,
        source: &str,
        kind: &str,
    ) -> Result<i32> {
        let version: i32 = sqlx::query_scalar(
            r#"
            INSERT INTO resource_versions (source, kind, version)
            SELECT $1, $2, COALESCE(MAX(version), 0) + 1
            FROM resources
            WHERE source = $1 AND kind = $2
            ON CONFLICT (source, kind)
            DO UPDATE SET version = resource_versions.version + 1
            RETURNING version
            "#,
        )
        .bind(source)
        .bind(kind)
        .fetch_one(self.pool())
        .await?;
        Ok(version)
    }

    async fn store_relation(&self, criteria: &RelationCriteria) -> Result<u64> {
        validate_criteria(criteria)?;
        let mut tx = self.pool().begin().await?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO relations (resource_id, related_resource_id)
            SELECT DISTINCT r1.id, r2.id
            FROM resources r1
            JOIN metadata m1
                ON m1.resource_id = r1.id AND m1.key = $2 AND m1.value = $3
            JOIN resources r2
                ON r2.kind = $4 AND r2.id <> r1.id
            JOIN metadata m2
                ON m2.resource_id = r2.id AND m2.key = $5 AND m2.value = $6
            WHERE r1.kind = $1
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&criteria.kind)
        .bind(&criteria.metadata_key)
        .bind(&criteria.metadata_value)
        .bind(&criteria.related_kind)
        .bind(&criteria.related_metadata_key)
        .bind(&criteria.related_metadata_value)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;
        Ok(inserted)
    }

    async fn get_relations(&self) -> Result<Vec<RelationEdge>> {
        let rows: Vec<EdgeRow> = sqlx::query_as(
            r#"
            SELECT
                r1.uuid AS resource_uuid,
                r1.external_id AS resource_external_id,
                r2.uuid AS related_uuid,
                r2.external_id AS related_external_id
            FROM relations rel
            JOIN resources r1 ON r1.id = rel.resource_id
            JOIN resources r2 ON r2.id = rel.related_resource_id
            ORDER BY r1.external_id, r2.external_id
            "#,
        )
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| RelationEdge {
                resource_uuid: row.resource_uuid,
                resource_external_id: row.resource_external_id,
                related_uuid: row.related_uuid,
                related_external_id: row.related_external_id,
            })
            .collect())
    }

    async fn resource_counts(&self) -> Result<Vec<ResourceCount>> {
        let sql = format!(
            r#"
            SELECT r.source, r.kind, COUNT(*) AS total_count
            FROM resources r
            {LATEST_VERSION_JOIN}
            GROUP BY r.source, r.kind
            ORDER BY r.source, r.kind
            "#
        );
        let rows: Vec<ResourceCountRow> =
            sqlx::query_as(&sql).fetch_all(self.pool()).await?;

        Ok(rows
            .into_iter()
            .map(|row| ResourceCount {
                source: row.source,
                kind: row.kind,
                total_count: row.total_count,
            })
            .collect())
    }

    async fn metadata_counts(&self) -> Result<Vec<MetadataCount>> {
        let sql = format!(
            r#"
            SELECT
                r.source, r.kind, m.key, m.value,
                COUNT(DISTINCT m.resource_id) AS total_count
            FROM resources r
            {LATEST_VERSION_JOIN}
            JOIN metadata m ON m.resource_id = r.id
            GROUP BY r.source, r.kind, m.key, m.value
            HAVING COUNT(DISTINCT m.resource_id) > $1
            ORDER BY r.source, r.kind, m.key, total_count DESC
            "#
        );
        let rows: Vec<MetadataCountRow> = sqlx::query_as(&sql)
            .bind(METADATA_COUNT_THRESHOLD)
            .fetch_all(self.pool())
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| MetadataCount {
                source: row.source,
                kind: row.kind,
                key: row.key,
                value: row.value,
                total_count: row.total_count,
            })
            .collect())
    }
}
