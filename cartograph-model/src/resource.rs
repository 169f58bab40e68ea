use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::kinds::META_KEY_SCANNER_LABEL;

/// A single metadata entry attached to a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetaData {
    pub key: String,
    pub value: String,
}

impl MetaData {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Insertion-ordered metadata with unique keys.
///
/// [`MetaDataList::add`] keeps the first value written for a key;
/// [`MetaDataList::set`] replaces it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetaDataList {
    entries: Vec<MetaData>,
}

impl MetaDataList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `key` unless it is already present. Returns whether it was added.
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) -> bool {
        let key = key.into();
        if self.contains(&key) {
            return false;
        }
        self.entries.push(MetaData {
            key,
            value: value.into(),
        });
        true
    }

    /// Inserts or overwrites `key`.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|entry| entry.key == key) {
            Some(entry) => entry.value = value,
            None => self.entries.push(MetaData { key, value }),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.iter().any(|entry| entry.key == key)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|entry| entry.key == key)
            .map(|entry| entry.value.as_str())
    }

    /// Keys from `keys` that have no entry.
    pub fn missing_keys<'a>(&self, keys: &[&'a str]) -> Vec<&'a str> {
        keys.iter()
            .copied()
            .filter(|key| !self.contains(key))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MetaData> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> Extend<(K, V)> for MetaDataList {
    fn extend<T: IntoIterator<Item = (K, V)>>(&mut self, iter: T) {
        for (key, value) in iter {
            self.add(key, value);
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MetaDataList {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut list = MetaDataList::new();
        list.extend(iter);
        list
    }
}

impl IntoIterator for MetaDataList {
    type Item = MetaData;
    type IntoIter = std::vec::IntoIter<MetaData>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a> IntoIterator for &'a MetaDataList {
    type Item = &'a MetaData;
    type IntoIter = std::slice::Iter<'a, MetaData>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Normalized discovered entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub kind: String,
    pub uuid: Uuid,
    pub name: String,
    #[serde(rename = "externalID")]
    pub external_id: String,
    pub scanner: String,
    pub version: i32,
    /// Set by storage when the resource is read back.
    pub fetched_at: Option<DateTime<Utc>>,
    pub meta_data: MetaDataList,
    pub related_with: Vec<Resource>,
}

impl Resource {
    /// Builds a resource and stamps it with the scanner label metadata.
    pub fn new(
        kind: impl Into<String>,
        uuid: Uuid,
        name: impl Into<String>,
        external_id: impl Into<String>,
        scanner: impl Into<String>,
        version: i32,
    ) -> Self {
        let scanner = scanner.into();
        let mut meta_data = MetaDataList::new();
        meta_data.add(META_KEY_SCANNER_LABEL, scanner.clone());
        Self {
            kind: kind.into(),
            uuid,
            name: name.into(),
            external_id: external_id.into(),
            scanner,
            version,
            fetched_at: None,
            meta_data,
            related_with: Vec::new(),
        }
    }

    /// Stable identifier derived from the kind and the provider id.
    pub fn derive_uuid(kind: &str, external_id: &str) -> Uuid {
        let key = format!("{kind}:{external_id}");
        Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes())
    }

    pub fn add_meta_data(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> bool {
        self.meta_data.add(key, value)
    }

    pub fn extend_meta_data(&mut self, meta: &MetaDataList) {
        for entry in meta {
            self.meta_data.add(entry.key.clone(), entry.value.clone());
        }
    }

    pub fn add_relation(&mut self, related: Resource) {
        self.related_with.push(related);
    }

    pub fn find_meta_value(&self, key: &str) -> Option<&str> {
        self.meta_data.get(key)
    }
}
