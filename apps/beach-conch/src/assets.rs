//! Static page and client script for the browser side, served from disk on every request.

use std::{io::ErrorKind, path::PathBuf, sync::Arc};

use axum::{
    extract::State,
    http::{header, HeaderValue, StatusCode},
    middleware::map_response,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tower_http::trace::TraceLayer;
use tracing::warn;

pub const INDEX_FILE: &str = "index.html";
pub const CLIENT_FILE: &str = "client.js";

#[derive(Clone)]
struct AssetState {
    dir: Arc<PathBuf>,
}

pub fn router(dir: impl Into<PathBuf>) -> Router {
    let state = AssetState {
        dir: Arc::new(dir.into()),
    };
    Router::new()
        .route("/", get(index_handler))
        .route("/client.js", get(client_handler))
        .fallback(not_found)
        .with_state(state)
        .layer(map_response(with_cors_headers))
        .layer(TraceLayer::new_for_http())
}

async fn index_handler(State(state): State<AssetState>) -> Response {
    serve_file(&state, INDEX_FILE, "text/html").await
}

async fn client_handler(State(state): State<AssetState>) -> Response {
    serve_file(&state, CLIENT_FILE, "application/javascript").await
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "404 Not Found").into_response()
}

async fn serve_file(state: &AssetState, name: &str, content_type: &'static str) -> Response {
    let path = state.dir.join(name);
    match tokio::fs::read_to_string(&path).await {
        Ok(body) => ([(header::CONTENT_TYPE, content_type)], body).into_response(),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            warn!(path = %path.display(), "asset missing");
            not_found().await
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to read asset");
            (StatusCode::INTERNAL_SERVER_ERROR, "500 Internal Server Error").into_response()
        }
    }
}

async fn with_cors_headers(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
    response
}
