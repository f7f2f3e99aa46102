use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{AppError, AppResult};
use crate::AppState;

const MAX_SAVE_BYTES: usize = 1024 * 1024;

#[derive(Serialize)]
pub struct ConfigTextResponse {
    content: String,
}

pub async fn get_data(State(state): State<AppState>) -> Json<ConfigTextResponse> {
    Json(ConfigTextResponse {
        content: state.config.raw_text().await,
    })
}

#[derive(Deserialize)]
pub struct SaveRequest {
    content: String,
}

pub async fn save(
    State(state): State<AppState>,
    Json(body): Json<SaveRequest>,
) -> AppResult<StatusCode> {
    if body.content.len() > MAX_SAVE_BYTES {
        return Err(AppError::payload_too_large("config body too large"));
    }
    state
        .config
        .save(&body.content)
        .await
        .map_err(|e| AppError::internal(e.to_string()))?;
    Ok(StatusCode::OK)
}

pub async fn sysinfo(State(state): State<AppState>) -> Json<serde_json::Value> {
    let cpu_count = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let recommended_concurrency = cpu_count.clamp(1, 32);

    let mut system = sysinfo::System::new();
    system.refresh_memory();
    let total_memory_gb = system.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0);
    // One transcoder permit costs roughly `sharp_memory_limit_mb` worth of
    // headroom; recommend enough RAM for the configured concurrency plus a
    // 1 GB floor for everything else running on the host.
    let config = state.config.current();
    let recommended_memory_gb =
        1.0 + (recommended_concurrency as f64 * config.sharp_memory_limit_mb as f64 / 1024.0);

    Json(json!({
        "cpuCount": cpu_count,
        "totalMemoryGB": (total_memory_gb * 10.0).round() / 10.0,
        "recommendedConcurrency": recommended_concurrency,
        "recommendedMemory": (recommended_memory_gb * 10.0).round() / 10.0,
        "maxConcurrency": config.max_concurrency,
    }))
}

pub async fn stats(State(state): State<AppState>) -> Json<crate::stats::StatsSnapshot> {
    Json(state.stats.snapshot())
}

/// Serves `public/<relative>` with a content type derived from extension,
/// matching the static-asset table in §6.
pub async fn static_asset(Path(relative): Path<String>) -> Response {
    let path = crate::safe_path::safe_resolve(std::path::Path::new("public"), &relative);
    let Ok(path) = path else {
        return StatusCode::FORBIDDEN.into_response();
    };
    let Ok(bytes) = tokio::fs::read(&path).await else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let content_type = content_type_for(&path);
    ([(header::CONTENT_TYPE, HeaderValue::from_static(content_type))], bytes).into_response()
}

pub async fn settings_index() -> Response {
    match tokio::fs::read(std::path::Path::new("public").join("index.html")).await {
        Ok(bytes) => (
            [(header::CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"))],
            bytes,
        )
            .into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

fn content_type_for(path: &std::path::Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
        .as_str()
    {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" => "application/javascript; charset=utf-8",
        "json" => "application/json; charset=utf-8",
        "xml" => "application/xml; charset=utf-8",
        "txt" => "text/plain; charset=utf-8",
        "md" => "text/markdown; charset=utf-8",
        _ => "application/octet-stream",
    }
}
