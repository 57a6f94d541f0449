pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod infrastructure;
pub mod models;
pub mod services;
pub mod utils;

use crate::config::UploadConfig;
use crate::events::EventBus;
use crate::services::pipeline::ProcessingPipeline;
use crate::services::storage::FileStore;
use axum::{Router, extract::DefaultBodyLimit, routing::get};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<UploadConfig>,
    pub pipeline: Arc<ProcessingPipeline>,
    pub store: FileStore,
    pub events: EventBus,
}

impl AppState {
    pub fn new(pipeline: Arc<ProcessingPipeline>, events: EventBus) -> Self {
        let config = pipeline.config().clone();
        Self {
            store: FileStore::new(config.clone(), events.clone()),
            config,
            pipeline,
            events,
        }
    }
}

pub fn create_app(state: AppState) -> Router {
    let prefix = state.config.upload_url().trim_end_matches('/').to_string();
    let collection = if prefix.is_empty() { "/".to_string() } else { prefix.clone() };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(api::handlers::health::health_check))
        .route(
            &collection,
            get(api::handlers::files::list_files).post(api::handlers::files::upload_files)
                // MAX_POST_SIZE is enforced by the upload session instead.
                .layer(DefaultBodyLimit::disable()),
        )
        .route(
            &format!("{}/:name", prefix),
            axum::routing::delete(api::handlers::files::delete_file),
        )
        .layer(cors)
        .with_state(state)
}
