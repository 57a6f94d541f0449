use crate::AppState;
use axum::{Json, extract::State, response::IntoResponse};
use serde::Serialize;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub upload_dir: String,
    pub version: String,
}

pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let upload_dir_status = match tokio::fs::metadata(state.config.upload_dir()).await {
        Ok(meta) if meta.is_dir() => "available",
        _ => "missing",
    };

    Json(HealthResponse {
        status: "ok".to_string(),
        upload_dir: upload_dir_status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
