//! HTTP surface: WebSocket upgrade, health, stats, shops, announcements.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderValue, Method};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::GatewayError;
use crate::fanout::FanoutReport;
use crate::state::AppState;
use crate::types::{ConnectionStats, Shop};
use crate::ws;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // WebSocket endpoint.
        .route("/ws", get(ws::ws_handler))
        .route("/healthz", get(healthz))
        .route("/api/stats", get(stats))
        .route("/api/shops", get(shops))
        .route("/api/announce", post(announce))
        .layer(cors(&state.config.cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// An empty origin list mirrors the caller's origin, i.e. allows any.
fn cors(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_credentials(true);
    if origins.is_empty() {
        return layer.allow_origin(AllowOrigin::mirror_request());
    }

    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match o.parse::<HeaderValue>() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(origins)
}

/// Liveness probe.
async fn healthz() -> &'static str {
    "ok"
}

async fn stats(State(state): State<Arc<AppState>>) -> Json<ConnectionStats> {
    Json(state.gateway.stats(&state.config.server_instance))
}

async fn shops(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Shop>>, GatewayError> {
    Ok(Json(state.gateway.shops().await?))
}

#[derive(Debug, Deserialize)]
pub struct AnnounceRequest {
    pub message: String,
    #[serde(default)]
    pub kind: Option<String>,
}

/// Broadcast a `server-message` to every connected client.
async fn announce(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AnnounceRequest>,
) -> Result<Json<FanoutReport>, GatewayError> {
    if req.message.trim().is_empty() {
        return Err(GatewayError::Protocol("message must not be empty".into()));
    }
    let kind = req.kind.as_deref().unwrap_or("info");
    let report = state.gateway.announce(kind, &req.message).await;
    info!(kind, delivered = report.delivered, "announcement sent");
    Ok(Json(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, MemoryCatalog};
    use crate::clock::{Clock, ManualClock};
    use crate::config::Config;
    use crate::types::ServerMessage;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn state() -> Arc<AppState> {
        state_with(MemoryCatalog::new(), Vec::new())
    }

    fn state_with(catalog: MemoryCatalog, cors_origins: Vec<String>) -> Arc<AppState> {
        let mut config = Config::from_env();
        config.server_instance = "test-node".into();
        config.cors_origins = cors_origins;
        AppState::new(
            Arc::new(catalog) as Arc<dyn Catalog>,
            Arc::new(ManualClock::new(123)) as Arc<dyn Clock>,
            config,
        )
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_healthz() {
        let resp = router(state())
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_stats_lists_connections() {
        let state = state();
        let c1 = state.gateway.connect().await.unwrap();

        let resp = router(Arc::clone(&state))
            .oneshot(Request::get("/api/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["instance"], "test-node");
        assert_eq!(body["totalConnections"], 1);
        assert_eq!(body["connections"][0], c1.id.to_string());
        assert_eq!(body["serverTime"], 123);
    }

    #[tokio::test]
    async fn test_announce_broadcasts_notice() {
        let state = state();
        let mut c1 = state.gateway.connect().await.unwrap();
        while c1.rx.try_recv().is_ok() {}

        let req = Request::post("/api/announce")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"message":"closing early today"}"#))
            .unwrap();
        let resp = router(Arc::clone(&state)).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["delivered"], 1);

        match &*c1.rx.try_recv().unwrap() {
            ServerMessage::Notice(n) => {
                assert_eq!(n.kind, "info");
                assert_eq!(n.message, "closing early today");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_announce_rejects_empty_message() {
        let req = Request::post("/api/announce")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"message":"  "}"#))
            .unwrap();
        let resp = router(state()).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    fn stats_from(origin: &str) -> Request<Body> {
        Request::get("/api/stats")
            .header("origin", origin)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_cors_empty_list_allows_any_origin() {
        let resp = router(state())
            .oneshot(stats_from("http://shop.example"))
            .await
            .unwrap();
        assert_eq!(
            resp.headers().get("access-control-allow-origin").unwrap(),
            "http://shop.example"
        );
    }

    #[tokio::test]
    async fn test_cors_list_restricts_origins() {
        let app = router(state_with(
            MemoryCatalog::new(),
            vec!["http://localhost:5173".into()],
        ));

        let resp = app
            .clone()
            .oneshot(stats_from("http://localhost:5173"))
            .await
            .unwrap();
        assert_eq!(
            resp.headers().get("access-control-allow-origin").unwrap(),
            "http://localhost:5173"
        );

        let resp = app.oneshot(stats_from("http://evil.example")).await.unwrap();
        assert!(resp.headers().get("access-control-allow-origin").is_none());
    }

    #[tokio::test]
    async fn test_shops_lists_catalog_shops() {
        let resp = router(state_with(MemoryCatalog::seeded(), Vec::new()))
            .oneshot(Request::get("/api/shops").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        let ids: Vec<&str> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["petals-paradise", "bloomwell", "flowery-fragrant"]);
    }
}
