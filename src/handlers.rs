use axum::extract::{Path, Request, State, WebSocketUpgrade};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, trace, warn};

use crate::config::ServerConfig;
use crate::errors::StreamError;
use crate::gateway::CameraGateway;
use crate::relay::StreamRelay;
use crate::websocket::handle_socket;

#[derive(Clone)]
pub struct AppState {
    pub relay: StreamRelay,
    pub gateway: Arc<dyn CameraGateway>,
    pub server: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(state.server.cors_allow_origin.as_deref());

    Router::new()
        .route("/alive", get(alive_handler))
        .route("/stream/:name", get(stream_url_handler))
        .route("/stream/ws/:name", get(stream_ws_handler))
        .layer(middleware::from_fn_with_state(state.clone(), api_key_guard))
        .layer(cors)
        .with_state(state)
}

fn cors_layer(origin: Option<&str>) -> CorsLayer {
    match origin {
        Some("*") | None => CorsLayer::permissive(),
        Some(origin) => match origin.parse::<HeaderValue>() {
            Ok(origin_header) => CorsLayer::new()
                .allow_origin(origin_header)
                .allow_methods(Any)
                .allow_headers(Any),
            Err(_) => {
                warn!("Invalid CORS origin '{}', falling back to permissive", origin);
                CorsLayer::permissive()
            }
        },
    }
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// Plain HTTP requests must carry the configured `api-key` header.
/// Browsers cannot set headers on WebSocket handshakes, so upgrades pass.
async fn api_key_guard(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(expected) = &state.server.api_key {
        if !is_websocket_upgrade(request.headers()) {
            let provided = request.headers().get("api-key").and_then(|v| v.to_str().ok());
            if provided != Some(expected.as_str()) {
                info!("Wrong API key for {}", request.uri().path());
                return (StatusCode::UNAUTHORIZED, Json(json!({ "message": "Unauthorized" }))).into_response();
            }
        }
    }
    next.run(request).await
}

async fn alive_handler() -> Json<serde_json::Value> {
    trace!("Alive ping");
    Json(json!({ "message": "alive" }))
}

fn error_response(camera: &str, err: StreamError) -> Response {
    match err {
        StreamError::CameraNotFound { .. } => (
            StatusCode::NOT_FOUND,
            Json(json!({ "message": format!("Camera '{}' not found", camera) })),
        )
            .into_response(),
        err => {
            error!("Failed to resolve stream for camera '{}': {}", camera, err);
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "message": err.to_string() }))).into_response()
        }
    }
}

/// Hands the client the WebSocket address to watch `name` on.
async fn stream_url_handler(Path(name): Path<String>, State(state): State<AppState>) -> Response {
    if let Err(e) = state.gateway.stream_locator(&name) {
        return error_response(&name, e);
    }

    let stream_url = format!("{}/stream/ws/{}", state.server.websocket_base(), name);
    info!("Stream URL requested for camera '{}'", name);
    Json(json!({ "streamUrl": stream_url })).into_response()
}

async fn stream_ws_handler(
    ws: Option<WebSocketUpgrade>,
    Path(name): Path<String>,
    State(state): State<AppState>,
) -> Response {
    let locator = match state.gateway.stream_locator(&name) {
        Ok(locator) => locator,
        Err(e) => return error_response(&name, e),
    };

    match ws {
        Some(ws) => {
            let relay = state.relay.clone();
            ws.on_upgrade(move |socket| handle_socket(socket, relay, name, locator))
        }
        None => (
            StatusCode::BAD_REQUEST,
            "Stream endpoint only accepts WebSocket connections",
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::TestPatternSource;
    use crate::config::{CameraConfig, Config, RelayConfig};
    use crate::gateway::ConfigGateway;
    use axum::body::Body;
    use axum::http::Request;
    use std::collections::HashMap;
    use tower::ServiceExt;

    fn app(api_key: Option<&str>) -> Router {
        let mut cameras = HashMap::new();
        cameras.insert(
            "demo".to_string(),
            CameraConfig {
                url: Some("test://pattern?fps=5".to_string()),
                ..CameraConfig::default()
            },
        );
        let mut server = Config::default().server;
        server.public_url = Some("ws://cams.local:8000".to_string());
        server.api_key = api_key.map(str::to_string);

        build_router(AppState {
            relay: StreamRelay::new(Arc::new(TestPatternSource), RelayConfig::default()),
            gateway: Arc::new(ConfigGateway::new(cameras)),
            server: Arc::new(server),
        })
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_stream_url_for_known_camera() {
        let response = app(None)
            .oneshot(Request::get("/stream/demo").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["streamUrl"], "ws://cams.local:8000/stream/ws/demo");
    }

    #[tokio::test]
    async fn test_unknown_camera_is_not_found() {
        let response = app(None)
            .oneshot(Request::get("/stream/attic").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app(None)
            .oneshot(Request::get("/stream/ws/attic").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_ws_endpoint_requires_upgrade() {
        let response = app(None)
            .oneshot(Request::get("/stream/ws/demo").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_api_key_checked_on_http_requests() {
        let response = app(Some("TEST"))
            .oneshot(Request::get("/alive").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["message"], "Unauthorized");

        let response = app(Some("TEST"))
            .oneshot(
                Request::get("/alive")
                    .header("api-key", "TEST")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["message"], "alive");
    }

    #[test]
    fn test_upgrade_detection() {
        let mut headers = HeaderMap::new();
        assert!(!is_websocket_upgrade(&headers));
        headers.insert(header::UPGRADE, HeaderValue::from_static("WebSocket"));
        assert!(is_websocket_upgrade(&headers));
    }
}
