use std::collections::HashMap;
use std::fmt;

use cartograph_model::{MetaDataList, Resource, ResourceFilter};
use chrono::{DateTime, Utc};
use sqlx::{Postgres, QueryBuilder};
use uuid::Uuid;

/// Parameterized lookup over `resources` with metadata and first-level
/// relations joined in.
///
/// Predicates and pagination apply to resource rows in an inner query so
/// that `LIMIT` counts resources, not joined rows.
pub struct ResourceQuery<'a> {
    filter: &'a ResourceFilter,
}

impl fmt::Debug for ResourceQuery<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceQuery")
            .field("filter", &self.filter)
            .finish()
    }
}

impl<'a> ResourceQuery<'a> {
    pub fn new(filter: &'a ResourceFilter) -> Self {
        Self { filter }
    }

    pub fn build(&self) -> QueryBuilder<'a, Postgres> {
        let filter = self.filter;
        let mut builder = QueryBuilder::<Postgres>::new(
            r#"
            SELECT
                r.id, r.kind, r.uuid, r.name, r.external_id, r.source,
                r.version, r.discovered_at,
                m.key AS meta_key, m.value AS meta_value,
                rr.kind AS related_kind, rr.uuid AS related_uuid,
                rr.name AS related_name,
                rr.external_id AS related_external_id,
                rr.source AS related_source,
                rr.version AS related_version,
                rr.discovered_at AS related_discovered_at
            FROM (
                SELECT id, kind, uuid, name, external_id, source, version,
                    discovered_at
                FROM resources
                WHERE 1=1"#,
        );

        if let Some(kind) = &filter.kind {
            builder.push(" AND kind = ");
            builder.push_bind(kind.as_str());
        }
        if let Some(uuid) = filter.uuid {
            builder.push(" AND uuid = ");
            builder.push_bind(uuid);
        }
        if let Some(name) = &filter.name {
            builder.push(" AND name = ");
            builder.push_bind(name.as_str());
        }
        if let Some(external_id) = &filter.external_id {
            builder.push(" AND external_id = ");
            builder.push_bind(external_id.as_str());
        }
        for (key, value) in &filter.meta_data_equals {
            builder.push(
                " AND EXISTS (SELECT 1 FROM metadata md WHERE md.resource_id = resources.id AND md.key = ",
            );
            builder.push_bind(key.as_str());
            builder.push(" AND md.value = ");
            builder.push_bind(value.as_str());
            builder.push(")");
        }

        builder.push(" ORDER BY id");
        if let Some(limit) = filter.limit {
            builder.push(" LIMIT ");
            builder.push_bind(limit);
        }
        if filter.offset > 0 {
            builder.push(" OFFSET ");
            builder.push_bind(filter.offset);
        }

        builder.push(
            r#"
            ) r
            LEFT JOIN metadata m ON m.resource_id = r.id
            LEFT JOIN relations rel ON rel.resource_id = r.id
            LEFT JOIN resources rr ON rr.id = rel.related_resource_id
            ORDER BY r.id, m.key, rr.id"#,
        );
        builder
    }
}

/// One joined row of [`ResourceQuery`].
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FindRow {
    pub id: i64,
    pub kind: String,
    pub uuid: Uuid,
    pub name: String,
    pub external_id: String,
    pub source: String,
    pub version: i32,
    pub discovered_at: DateTime<Utc>,
    pub meta_key: Option<String>,
    pub meta_value: Option<String>,
    pub related_kind: Option<String>,
    pub related_uuid: Option<Uuid>,
    pub related_name: Option<String>,
    pub related_external_id: Option<String>,
    pub related_source: Option<String>,
    pub related_version: Option<i32>,
    pub related_discovered_at: Option<DateTime<Utc>>,
}

impl FindRow {
    fn resource(&self) -> Resource {
        Resource {
            kind: self.kind.clone(),
            uuid: self.uuid,
            name: self.name.clone(),
            external_id: self.external_id.clone(),
            scanner: self.source.clone(),
            version: self.version,
            fetched_at: Some(self.discovered_at),
            meta_data: MetaDataList::new(),
            related_with: Vec::new(),
        }
    }

    fn related(&self) -> Option<Resource> {
        Some(Resource {
            kind: self.related_kind.clone()?,
            uuid: self.related_uuid?,
            name: self.related_name.clone()?,
            external_id: self.related_external_id.clone()?,
            scanner: self.related_source.clone().unwrap_or_default(),
            version: self.related_version.unwrap_or_default(),
            fetched_at: self.related_discovered_at,
            meta_data: MetaDataList::new(),
            related_with: Vec::new(),
        })
    }
}

/// Folds joined rows into one resource per uuid, in first-seen order.
pub fn collapse_rows(rows: Vec<FindRow>) -> Vec<Resource> {
    let mut index: HashMap<Uuid, usize> = HashMap::new();
    let mut resources: Vec<Resource> = Vec::new();

    for row in rows {
        let position = *index.entry(row.uuid).or_insert_with(|| {
            resources.push(row.resource());
            resources.len() - 1
        });
        let resource = &mut resources[position];

        if let (Some(key), Some(value)) = (&row.meta_key, &row.meta_value) {
            resource.meta_data.add(key.clone(), value.clone());
        }
        if let Some(related) = row.related()
            && !resource
                .related_with
                .iter()
                .any(|r| r.external_id == related.external_id)
        {
            resource.related_with.push(related);
        }
    }
    resources
}
