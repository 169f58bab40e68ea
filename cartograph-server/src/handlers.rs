use axum::{
    Json,
    extract::{Query, State},
    http::header,
    response::IntoResponse,
};
use cartograph_model::{
    ListResourceResponse, Pagination, RelationView, ResourceFilter, ResourceView,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    AppState,
    errors::{AppError, AppResult},
};

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Query string of `GET /resources`.
///
/// Paging values stay raw so a malformed number falls back to the default
/// instead of rejecting the request.
#[derive(Debug, Default, Deserialize)]
pub struct ResourceParams {
    pub page: Option<String>,
    pub per_page: Option<String>,
    pub kind: Option<String>,
    pub name: Option<String>,
    pub uuid: Option<String>,
    pub external_id: Option<String>,
    /// `k1=v1,k2=v2`
    pub meta_data_eq: Option<String>,
}

impl ResourceParams {
    fn pagination(&self) -> Pagination {
        let number = |value: &Option<String>| {
            value.as_deref().and_then(|v| v.trim().parse::<i64>().ok())
        };
        Pagination::from_query(number(&self.page), number(&self.per_page))
    }

    fn filter(&self) -> AppResult<ResourceFilter> {
        let non_empty = |value: &Option<String>| {
            value.as_deref().map(str::trim).filter(|v| !v.is_empty()).map(String::from)
        };

        let mut filter = ResourceFilter::new();
        filter.kind = non_empty(&self.kind);
        filter.name = non_empty(&self.name);
        filter.external_id = non_empty(&self.external_id);
        if let Some(raw) = non_empty(&self.uuid) {
            let uuid = Uuid::parse_str(&raw)
                .map_err(|_| AppError::bad_request(format!("invalid uuid '{raw}'")))?;
            filter.uuid = Some(uuid);
        }
        if let Some(raw) = non_empty(&self.meta_data_eq) {
            filter.meta_data_equals = ResourceFilter::parse_meta_data_equals(&raw);
        }
        Ok(filter)
    }
}

/// One page of resources. An extra row is fetched to tell whether another
/// page follows.
pub async fn list_resources(
    State(state): State<AppState>,
    Query(params): Query<ResourceParams>,
) -> AppResult<Json<ListResourceResponse>> {
    let pagination = params.pagination();
    let mut filter = params.filter()?;
    filter.offset = pagination.offset();
    filter.limit = Some(pagination.per_page + 1);

    let mut resources = state.storage.find(&filter).await?;
    let per_page = usize::try_from(pagination.per_page).unwrap_or_default();
    let has_more = resources.len() > per_page;
    resources.truncate(per_page);

    Ok(Json(ListResourceResponse {
        page: pagination.page,
        per_page: pagination.per_page,
        has_more,
        resources: resources.into_iter().map(ResourceView::from).collect(),
    }))
}

pub async fn list_relations(
    State(state): State<AppState>,
) -> AppResult<Json<RelationView>> {
    let relations = state.storage.get_relations().await?;
    Ok(Json(RelationView { relations }))
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        state.metrics.render_prometheus(),
    )
}
