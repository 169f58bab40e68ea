use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use cartograph_model::{
    MetaDataList, MetadataCount, RelationCriteria, RelationEdge, Resource,
    ResourceCount, ResourceFilter,
};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{METADATA_COUNT_THRESHOLD, Storage, validate_criteria};
use crate::error::Result;

#[derive(Debug, Clone)]
struct StoredResource {
    id: i64,
    source: String,
    kind: String,
    uuid: Uuid,
    name: String,
    external_id: String,
    version: i32,
    discovered_at: DateTime<Utc>,
    meta: BTreeMap<String, String>,
}

impl StoredResource {
    fn to_resource(&self) -> Resource {
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

    fn has_meta(&self, key: &str, value: &str) -> bool {
        self.meta.get(key).is_some_and(|v| v == value)
    }
}

#[derive(Debug, Default)]
struct State {
    next_id: i64,
    resources: BTreeMap<i64, StoredResource>,
    by_external_id: HashMap<String, i64>,
    edges: BTreeSet<(i64, i64)>,
    versions: HashMap<(String, String), i32>,
    batches: Vec<usize>,
}

impl State {
    fn upsert(&mut self, resource: &Resource) -> i64 {
        let discovered_at = resource.fetched_at.unwrap_or_else(Utc::now);
        if let Some(&id) = self.by_external_id.get(&resource.external_id)
            && let Some(stored) = self.resources.get_mut(&id)
        {
            stored.source = resource.scanner.clone();
            stored.kind = resource.kind.clone();
            stored.uuid = resource.uuid;
            stored.name = resource.name.clone();
            stored.version = resource.version;
            stored.discovered_at = discovered_at;
            for meta in &resource.meta_data {
                stored.meta.insert(meta.key.clone(), meta.value.clone());
            }
            return id;
        }

        self.next_id += 1;
        let id = self.next_id;
        self.resources.insert(
            id,
            StoredResource {
                id,
                source: resource.scanner.clone(),
                kind: resource.kind.clone(),
                uuid: resource.uuid,
                name: resource.name.clone(),
                external_id: resource.external_id.clone(),
                version: resource.version,
                discovered_at,
                meta: resource
                    .meta_data
                    .iter()
                    .map(|m| (m.key.clone(), m.value.clone()))
                    .collect(),
            },
        );
        self.by_external_id.insert(resource.external_id.clone(), id);
        id
    }

    fn matches(stored: &StoredResource, filter: &ResourceFilter) -> bool {
        filter.kind.as_ref().is_none_or(|k| *k == stored.kind)
            && filter.uuid.is_none_or(|u| u == stored.uuid)
            && filter.name.as_ref().is_none_or(|n| *n == stored.name)
            && filter
                .external_id
                .as_ref()
                .is_none_or(|e| *e == stored.external_id)
            && filter
                .meta_data_equals
                .iter()
                .all(|(key, value)| stored.has_meta(key, value))
    }

    fn latest(&self) -> impl Iterator<Item = &StoredResource> {
        let mut latest: HashMap<(&str, &str), i32> = HashMap::new();
        for stored in self.resources.values() {
            let entry = latest
                .entry((stored.source.as_str(), stored.kind.as_str()))
                .or_insert(stored.version);
            *entry = (*entry).max(stored.version);
        }
        self.resources.values().filter(move |stored| {
            latest.get(&(stored.source.as_str(), stored.kind.as_str()))
                == Some(&stored.version)
        })
    }
}

/// Process-local [`Storage`] with the same upsert, lookup and relation
/// semantics as the PostgreSQL backend. Also records persisted batch
/// sizes.
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    state: Arc<Mutex<State>>,
}

impl fmt::Debug for InMemoryStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryStorage").finish_non_exhaustive()
    }
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sizes of every successful `persist` call, in call order.
    pub async fn batches(&self) -> Vec<usize> {
        self.state.lock().await.batches.clone()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.resources.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    async fn persist(&self, resources: &[Resource]) -> Result<()> {
        let mut state = self.state.lock().await;
        let ids: Vec<i64> =
            resources.iter().map(|resource| state.upsert(resource)).collect();

        for (resource, id) in resources.iter().zip(ids) {
            for related in &resource.related_with {
                let target =
                    state.by_external_id.get(&related.external_id).copied();
                if let Some(target) = target
                    && target != id
                {
                    state.edges.insert((id, target));
                }
            }
        }
        state.batches.push(resources.len());
        Ok(())
    }

    async fn find(&self, filter: &ResourceFilter) -> Result<Vec<Resource>> {
        filter.validate()?;
        let state = self.state.lock().await;
        let offset = usize::try_from(filter.offset).unwrap_or_default();
        let limit = filter
            .limit
            .map_or(usize::MAX, |l| usize::try_from(l).unwrap_or_default());

        let mut index: HashMap<Uuid, usize> = HashMap::new();
        let mut found: Vec<Resource> = Vec::new();
        let page = state
            .resources
            .values()
            .filter(|stored| State::matches(stored, filter))
            .skip(offset)
            .take(limit);

        for stored in page {
            let position = *index.entry(stored.uuid).or_insert_with(|| {
                found.push(stored.to_resource());
                found.len() - 1
            });
            let resource = &mut found[position];
            for (key, value) in &stored.meta {
                resource.meta_data.add(key.clone(), value.clone());
            }
            let targets = state
                .edges
                .range((stored.id, i64::MIN)..=(stored.id, i64::MAX))
                .filter_map(|(_, target)| state.resources.get(target));
            for target in targets {
                if !resource
                    .related_with
                    .iter()
                    .any(|r| r.external_id == target.external_id)
                {
                    resource.related_with.push(target.to_resource());
                }
            }
        }
        Ok(found)
    }

    async fn next_version_for_resource(
        &self,
        source: &str,
        kind: &str,
    ) -> Result<i32> {
        let mut state = self.state.lock().await;
        let key = (source.to_string(), kind.to_string());
        let version = match state.versions.get(&key) {
            Some(current) => current + 1,
            None => {
                state
                    .resources
                    .values()
                    .filter(|r| r.source == source && r.kind == kind)
                    .map(|r| r.version)
                    .max()
                    .unwrap_or(0)
                    + 1
            }
        };
        state.versions.insert(key, version);
        Ok(version)
    }

    async fn store_relation(&self, criteria: &RelationCriteria) -> Result<u64> {
        validate_criteria(criteria)?;
        let mut state = self.state.lock().await;
        let side = |kind: &str, key: &str, value: &str| -> Vec<i64> {
            state
                .resources
                .values()
                .filter(|r| r.kind == kind && r.has_meta(key, value))
                .map(|r| r.id)
                .collect()
        };
        let sources = side(
            &criteria.kind,
            &criteria.metadata_key,
            &criteria.metadata_value,
        );
        let targets = side(
            &criteria.related_kind,
            &criteria.related_metadata_key,
            &criteria.related_metadata_value,
        );

        let mut inserted = 0;
        for &from in &sources {
            for &to in &targets {
                if from != to && state.edges.insert((from, to)) {
                    inserted += 1;
                }
            }
        }
        Ok(inserted)
    }

    async fn get_relations(&self) -> Result<Vec<RelationEdge>> {
        let state = self.state.lock().await;
        let mut edges: Vec<RelationEdge> = state
            .edges
            .iter()
            .filter_map(|(from, to)| {
                let from = state.resources.get(from)?;
                let to = state.resources.get(to)?;
                Some(RelationEdge {
                    resource_uuid: from.uuid,
                    resource_external_id: from.external_id.clone(),
                    related_uuid: to.uuid,
                    related_external_id: to.external_id.clone(),
                })
            })
            .collect();
        edges.sort_by(|a, b| {
            (&a.resource_external_id, &a.related_external_id)
                .cmp(&(&b.resource_external_id, &b.related_external_id))
        });
        Ok(edges)
    }

    async fn resource_counts(&self) -> Result<Vec<ResourceCount>> {
        let state = self.state.lock().await;
        let mut counts: BTreeMap<(String, String), i64> = BTreeMap::new();
        for stored in state.latest() {
            *counts
                .entry((stored.source.clone(), stored.kind.clone()))
                .or_default() += 1;
        }
        Ok(counts
            .into_iter()
            .map(|((source, kind), total_count)| ResourceCount {
                source,
                kind,
                total_count,
            })
            .collect())
    }

    async fn metadata_counts(&self) -> Result<Vec<MetadataCount>> {
        let state = self.state.lock().await;
        let mut counts: BTreeMap<(String, String, String, String), i64> =
            BTreeMap::new();
        for stored in state.latest() {
            for (key, value) in &stored.meta {
                *counts
                    .entry((
                        stored.source.clone(),
                        stored.kind.clone(),
                        key.clone(),
                        value.clone(),
                    ))
                    .or_default() += 1;
            }
        }

        let mut rows: Vec<MetadataCount> = counts
            .into_iter()
            .filter(|(_, total)| *total > METADATA_COUNT_THRESHOLD)
            .map(|((source, kind, key, value), total_count)| MetadataCount {
                source,
                kind,
                key,
                value,
                total_count,
            })
            .collect();
        rows.sort_by(|a, b| {
            (&a.source, &a.kind, &a.key)
                .cmp(&(&b.source, &b.kind, &b.key))
                .then(b.total_count.cmp(&a.total_count))
        });
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(name: &str, region: &str, version: i32) -> Resource {
        let mut resource = Resource::new(
            "AWS_S3",
            Resource::derive_uuid("AWS_S3", name),
            name,
            name,
            "s3",
            version,
        );
        resource.add_meta_data("region", region);
        resource
    }

    #[tokio::test]
    async fn upsert_keeps_one_row_with_latest_name() {
        let storage = InMemoryStorage::new();
        let mut first = bucket("logs", "eu-west-1", 1);
        storage.persist(std::slice::from_ref(&first)).await.unwrap();
        first.name = "renamed".into();
        storage.persist(&[first]).await.unwrap();

        let found = storage.find(&ResourceFilter::new()).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "renamed");
        assert_eq!(storage.batches().await, vec![1, 1]);
    }

    #[tokio::test]
    async fn related_edges_skip_missing_targets() {
        let storage = InMemoryStorage::new();
        let root = bucket("root", "eu-west-1", 1);
        let mut child = bucket("child", "eu-west-1", 1);
        child.add_relation(root.clone());
        child.add_relation(bucket("ghost", "eu-west-1", 1));

        storage.persist(&[child, root]).await.unwrap();
        let edges = storage.get_relations().await.unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].resource_external_id, "child");
        assert_eq!(edges[0].related_external_id, "root");
    }

    #[tokio::test]
    async fn criteria_is_idempotent_and_excludes_self_pairs() {
        let storage = InMemoryStorage::new();
        storage
            .persist(&[bucket("a", "eu-west-1", 1), bucket("b", "eu-west-1", 1)])
            .await
            .unwrap();
        let criteria = RelationCriteria {
            name: "same-region".into(),
            kind: "AWS_S3".into(),
            metadata_key: "region".into(),
            metadata_value: "eu-west-1".into(),
            related_kind: "AWS_S3".into(),
            related_metadata_key: "region".into(),
            related_metadata_value: "eu-west-1".into(),
        };

        assert_eq!(storage.store_relation(&criteria).await.unwrap(), 2);
        assert_eq!(storage.store_relation(&criteria).await.unwrap(), 0);
        assert_eq!(storage.get_relations().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn versions_increase_per_source_and_kind() {
        let storage = InMemoryStorage::new();
        let first = storage.next_version_for_resource("src1", "FilePath").await.unwrap();
        let second = storage.next_version_for_resource("src1", "FilePath").await.unwrap();
        let other = storage.next_version_for_resource("src2", "FilePath").await.unwrap();
        assert!(second > first);
        assert_eq!(other, 1);
    }

    #[tokio::test]
    async fn counts_only_cover_latest_version() {
        let storage = InMemoryStorage::new();
        storage
            .persist(&[
                bucket("a", "eu-west-1", 1),
                bucket("b", "eu-west-1", 2),
                bucket("c", "eu-west-1", 2),
                bucket("d", "eu-west-1", 2),
            ])
            .await
            .unwrap();

        let counts = storage.resource_counts().await.unwrap();
        assert_eq!(counts.len(), 1);
        assert_eq!(counts[0].total_count, 3);

        let meta = storage.metadata_counts().await.unwrap();
        let region: Vec<_> = meta.iter().filter(|m| m.key == "region").collect();
        assert_eq!(region.len(), 1);
        assert_eq!(region[0].total_count, 3);
    }

    #[tokio::test]
    async fn find_applies_metadata_predicates_and_paging() {
        let storage = InMemoryStorage::new();
        storage
            .persist(&[
                bucket("a", "eu-west-1", 1),
                bucket("b", "us-east-1", 1),
                bucket("c", "eu-west-1", 1),
            ])
            .await
            .unwrap();

        let filter = ResourceFilter::new().with_meta_data("region", "eu-west-1");
        let names: Vec<_> = storage
            .find(&filter)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["a", "c"]);

        let mut paged = ResourceFilter::new();
        paged.offset = 1;
        paged.limit = Some(1);
        let found = storage.find(&paged).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "b");
    }
}
