use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Declarative rule linking resources through matching metadata.
///
/// Every resource of `kind` carrying `metadata_key = metadata_value` is
/// related to every resource of `related_kind` carrying
/// `related_metadata_key = related_metadata_value`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct RelationCriteria {
    pub name: String,
    pub kind: String,
    pub metadata_key: String,
    pub metadata_value: String,
    pub related_kind: String,
    pub related_metadata_key: String,
    pub related_metadata_value: String,
}

impl RelationCriteria {
    /// Field names paired with their values, in declaration order.
    pub fn fields(&self) -> [(&'static str, &str); 7] {
        [
            ("name", self.name.as_str()),
            ("kind", self.kind.as_str()),
            ("metadata_key", self.metadata_key.as_str()),
            ("metadata_value", self.metadata_value.as_str()),
            ("related_kind", self.related_kind.as_str()),
            ("related_metadata_key", self.related_metadata_key.as_str()),
            ("related_metadata_value", self.related_metadata_value.as_str()),
        ]
    }
}

/// Directed edge between two persisted resources.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationEdge {
    pub resource_uuid: Uuid,
    #[serde(rename = "resourceExternalID")]
    pub resource_external_id: String,
    pub related_uuid: Uuid,
    #[serde(rename = "relatedExternalID")]
    pub related_external_id: String,
}

/// Number of resources in the latest version of a (source, kind).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCount {
    pub source: String,
    pub kind: String,
    pub total_count: i64,
}

/// Number of latest-version resources sharing a metadata pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataCount {
    pub source: String,
    pub kind: String,
    pub key: String,
    pub value: String,
    pub total_count: i64,
}
