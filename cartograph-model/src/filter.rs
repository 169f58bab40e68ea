use std::collections::BTreeMap;

use uuid::Uuid;

use crate::error::{ModelError, Result};

pub const DEFAULT_PAGE: i64 = 1;
pub const DEFAULT_PER_PAGE: i64 = 200;
pub const MAX_PER_PAGE: i64 = 200;

/// Equality predicates for resource lookups. Unset fields do not filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceFilter {
    pub kind: Option<String>,
    pub uuid: Option<Uuid>,
    pub name: Option<String>,
    pub external_id: Option<String>,
    /// Each pair must exist in the resource's metadata.
    pub meta_data_equals: BTreeMap<String, String>,
    pub offset: i64,
    pub limit: Option<i64>,
}

impl ResourceFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn with_uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = Some(uuid);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }

    pub fn with_meta_data(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.meta_data_equals.insert(key.into(), value.into());
        self
    }

    pub fn paginate(mut self, pagination: Pagination) -> Self {
        self.offset = pagination.offset();
        self.limit = Some(pagination.per_page);
        self
    }

    /// Parses `k1=v1,k2=v2`. Pairs without exactly one `=` are ignored.
    pub fn parse_meta_data_equals(raw: &str) -> BTreeMap<String, String> {
        raw.split(',')
            .filter_map(|pair| {
                let mut parts = pair.split('=');
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(key), Some(value), None) if !key.is_empty() => {
                        Some((key.to_string(), value.to_string()))
                    }
                    _ => None,
                }
            })
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.offset < 0 {
            return Err(ModelError::InvalidFilter(format!(
                "offset must not be negative, got {}",
                self.offset
            )));
        }
        if let Some(limit) = self.limit
            && limit < 0
        {
            return Err(ModelError::InvalidFilter(format!(
                "limit must not be negative, got {limit}"
            )));
        }
        Ok(())
    }
}

/// Page window used by the query API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub page: i64,
    pub per_page: i64,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: DEFAULT_PAGE,
            per_page: DEFAULT_PER_PAGE,
        }
    }
}

impl Pagination {
    /// Applies defaults to missing or non-positive values and caps
    /// `per_page` at [`MAX_PER_PAGE`].
    pub fn from_query(page: Option<i64>, per_page: Option<i64>) -> Self {
        let page = page.filter(|p| *p >= 1).unwrap_or(DEFAULT_PAGE);
        let per_page = per_page
            .filter(|p| *p >= 1)
            .unwrap_or(DEFAULT_PER_PAGE)
            .min(MAX_PER_PAGE);
        Self { page, per_page }
    }

    pub fn offset(&self) -> i64 {
        (self.page - 1).saturating_mul(self.per_page)
    }
}
