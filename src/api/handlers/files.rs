use crate::AppState;
use crate::api::error::AppError;
use crate::models::FileResponse;
use crate::services::session::{FlowControl, FormEvent, UploadSession};
use crate::utils::urls::{PublicUrls, encode_component};
use axum::{
    Json,
    extract::{Multipart, Path, State, multipart::Field},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::channel::{mpsc, oneshot};
use serde::Serialize;
use serde_json::json;
use std::path::Path as FsPath;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Serialize)]
pub struct FilesResponse {
    pub files: Vec<FileResponse>,
}

fn public_urls(state: &AppState, headers: &HeaderMap) -> PublicUrls {
    let host = headers.get(header::HOST).and_then(|v| v.to_str().ok());
    PublicUrls::new(&state.config, host)
}

/// `application/json` only for clients that ask for it; older iframe
/// transports need `text/plain`.
fn json_response(headers: &HeaderMap, body: &FilesResponse) -> Result<Response, AppError> {
    let accepts_json = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("application/json"));
    let content_type = if accepts_json {
        "application/json"
    } else {
        "text/plain"
    };
    let body = serde_json::to_string(body).map_err(|e| AppError::Internal(e.to_string()))?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, HeaderValue::from_static(content_type))],
        body,
    )
        .into_response())
}

pub async fn list_files(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let urls = public_urls(&state, &headers);
    let files = state.store.list(&urls).await?;
    let body = FilesResponse {
        files: files.iter().map(|f| f.to_response()).collect(),
    };
    json_response(&headers, &body)
}

pub async fn delete_file(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.store.delete(&name).await?;
    Ok(Json(json!({ "success": true })))
}

pub async fn upload_files(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Response, AppError> {
    let flow = FlowControl::default();
    let session = UploadSession::new(
        state.pipeline.clone(),
        state.store.clone(),
        state.events.clone(),
        public_urls(&state, &headers),
    )
    .with_flow_control(flow.clone());

    let (form_tx, form_rx) = mpsc::unbounded();
    let (report_tx, report_rx) = oneshot::channel();

    // Detached so files already processing finish even if the client goes away.
    let session_task = tokio::spawn(session.run(form_rx, move |report| {
        let _ = report_tx.send(report);
    }));

    let expected = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok());
    receive_parts(multipart, &state.config.tmp_dir, expected, form_tx, &flow).await;

    session_task
        .await
        .map_err(|e| AppError::Internal(format!("upload session panicked: {}", e)))??;
    let report = report_rx
        .await
        .map_err(|_| AppError::Internal("upload session dropped its report".to_string()))?;

    if report.aborted && flow.is_paused() {
        return Err(AppError::PayloadTooLarge(
            "Request exceeds the maximum upload size".to_string(),
        ));
    }

    let body = FilesResponse {
        files: report.responses(),
    };
    match report.redirect {
        Some(target) => {
            let data = serde_json::to_string(&body).map_err(|e| AppError::Internal(e.to_string()))?;
            let location = target.replacen("%s", &encode_component(&data), 1);
            let location = HeaderValue::from_str(&location)
                .map_err(|_| AppError::BadRequest("Invalid redirect target".to_string()))?;
            Ok((StatusCode::FOUND, [(header::LOCATION, location)]).into_response())
        }
        None => json_response(&headers, &body),
    }
}

/// Feeds the multipart body to the session as [`FormEvent`]s, writing each
/// file part to its own temp file.
async fn receive_parts(
    mut multipart: Multipart,
    tmp_dir: &FsPath,
    expected: Option<u64>,
    tx: mpsc::UnboundedSender<FormEvent>,
    flow: &FlowControl,
) {
    let mut received = 0u64;

    let last = loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break FormEvent::End,
            Err(e) => break FormEvent::Error(e.to_string()),
        };

        let Some(file_name) = field.file_name().map(str::to_string) else {
            let name = field.name().unwrap_or_default().to_string();
            match field.text().await {
                Ok(value) => {
                    received += value.len() as u64;
                    let _ = tx.unbounded_send(FormEvent::Field { name, value });
                    continue;
                }
                Err(e) => break FormEvent::Error(e.to_string()),
            }
        };

        let path = tmp_dir.join(Uuid::new_v4().to_string());
        let _ = tx.unbounded_send(FormEvent::FileBegin {
            name: file_name,
            content_type: field.content_type().map(str::to_string),
            path: path.clone(),
        });

        match write_part(field, &path, &mut received, expected, &tx, flow).await {
            Ok(Some(size)) => {
                let _ = tx.unbounded_send(FormEvent::File { path, size });
            }
            Ok(None) => break FormEvent::Aborted,
            Err(e) => break FormEvent::Error(format!("{:#}", e)),
        }
    };

    let _ = tx.unbounded_send(last);
}

/// Returns `None` when the session paused the transport mid-part.
async fn write_part(
    mut field: Field<'_>,
    path: &FsPath,
    received: &mut u64,
    expected: Option<u64>,
    tx: &mpsc::UnboundedSender<FormEvent>,
    flow: &FlowControl,
) -> anyhow::Result<Option<u64>> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut size = 0u64;

    while let Some(chunk) = field.chunk().await? {
        file.write_all(&chunk).await?;
        size += chunk.len() as u64;
        *received += chunk.len() as u64;
        let _ = tx.unbounded_send(FormEvent::Progress {
            received: *received,
            expected,
        });
        // The session handles events on its own task; give it a turn.
        tokio::task::yield_now().await;
        if flow.is_paused() {
            return Ok(None);
        }
    }

    file.flush().await?;
    Ok(Some(size))
}
