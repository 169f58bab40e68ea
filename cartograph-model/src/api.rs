//! JSON payloads served by the query API.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::relation::RelationEdge;
use crate::resource::Resource;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceView {
    pub kind: String,
    pub uuid: Uuid,
    pub name: String,
    #[serde(rename = "externalID")]
    pub external_id: String,
    pub scanner: String,
    pub fetched_at: Option<DateTime<Utc>>,
    pub version: i32,
    /// Metadata as a key to value object.
    pub meta_data: BTreeMap<String, String>,
}

impl From<Resource> for ResourceView {
    fn from(resource: Resource) -> Self {
        Self {
            kind: resource.kind,
            uuid: resource.uuid,
            name: resource.name,
            external_id: resource.external_id,
            scanner: resource.scanner,
            fetched_at: resource.fetched_at,
            version: resource.version,
            meta_data: resource
                .meta_data
                .into_iter()
                .map(|meta| (meta.key, meta.value))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResourceResponse {
    pub page: i64,
    pub per_page: i64,
    pub has_more: bool,
    pub resources: Vec<ResourceView>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationView {
    pub relations: Vec<RelationEdge>,
}
