pub mod image_handler;
pub mod settings_handler;

use axum::body::Body;
use axum::extract::{OriginalUri, Query, Request, State};
use axum::http::Method;
use axum::response::IntoResponse;
use axum::routing::{any, get, post};
use axum::Router;

use crate::transcoder::is_image_extension;
use crate::AppState;

/// Builds the single router this gateway serves: `/setting/*` first, then an
/// image-extension GET fast path, then everything else delegated to the
/// WebDAV mount. Mirrors the reference server's one-router-per-port
/// composition, collapsed to a single dispatch function instead of nested
/// `Router::nest` calls, since the three branches share almost no middleware.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/setting", get(settings_handler::settings_index))
        .route("/setting/", get(settings_handler::settings_index))
        .route("/setting/data", get(settings_handler::get_data))
        .route("/setting/save", post(settings_handler::save))
        .route("/setting/sysinfo", get(settings_handler::sysinfo))
        .route("/setting/stats", get(settings_handler::stats))
        .route("/setting/{*relative}", get(settings_handler::static_asset))
        .fallback(any(dispatch))
        .with_state(state)
}

async fn dispatch(
    State(state): State<AppState>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    Query(query): Query<image_handler::ImageQuery>,
    req: Request<Body>,
) -> axum::response::Response {
    let is_image_get = method == Method::GET && is_image_extension(std::path::Path::new(uri.path()));
    if is_image_get {
        return image_handler::serve(State(state), OriginalUri(uri), Query(query))
            .await
            .into_response();
    }
    crate::webdav::serve(State(state), req).await
}
