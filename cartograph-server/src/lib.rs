//! Cartograph command implementations and the HTTP query API.
//!
//! The `cartograph` binary parses its arguments and hands off to
//! [`commands`]; [`router`] builds the read-only API served by `serve`.

#![allow(missing_docs)]

use std::{fmt, sync::Arc};

use axum::{Router, routing::get};
use cartograph_core::{metrics::MetricsCollector, storage::Storage};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub mod commands;
pub mod errors;
pub mod handlers;

#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn Storage>,
    pub metrics: Arc<MetricsCollector>,
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

impl AppState {
    pub fn new(storage: Arc<dyn Storage>, metrics: Arc<MetricsCollector>) -> Self {
        Self { storage, metrics }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/resources", get(handlers::list_resources))
        .route("/relations", get(handlers::list_relations))
        .route("/metrics", get(handlers::metrics))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
