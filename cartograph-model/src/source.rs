use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::kinds::SourceType;

/// Metadata field name that expands provider tags into `tag_<key>` entries.
pub const FIELD_TAGS: &str = "tags";

/// Configuration key pointing at another source whose credentials are reused.
pub const CONFIG_FROM: &str = "config_from";

/// A configured discovery source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Key of the source in the `source` map; filled in after parsing.
    #[serde(skip)]
    pub name: String,
    #[serde(rename = "type")]
    pub source_type: SourceType,
    #[serde(default)]
    pub configuration: BTreeMap<String, String>,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl SourceConfig {
    pub fn new(name: impl Into<String>, source_type: SourceType) -> Self {
        Self {
            name: name.into(),
            source_type,
            configuration: BTreeMap::new(),
            fields: Vec::new(),
            schedule: None,
            depends_on: Vec::new(),
        }
    }

    pub fn with_config(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.configuration.insert(key.into(), value.into());
        self
    }

    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_schedule(mut self, schedule: impl Into<String>) -> Self {
        self.schedule = Some(schedule.into());
        self
    }

    pub fn with_depends_on<I, S>(mut self, depends_on: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = depends_on.into_iter().map(Into::into).collect();
        self
    }

    /// Non-empty configuration value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.configuration
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    pub fn config_from(&self) -> Option<&str> {
        self.get(CONFIG_FROM)
    }

    pub fn wants_field(&self, field: &str) -> bool {
        self.fields.iter().any(|f| f == field)
    }
}
