/**
 * API REST - Inspection du manager et commandes IPMI
 *
 * ROUTES :
 * - GET  /health                    → "ok" (sans clé)
 * - GET  /stats                     → instantané du manager + état MQTT
 * - GET  /items                     → dernières valeurs lues
 * - POST /hosts/{host_id}/command   → commande IPMI, réponse du poller
 *
 * SÉCURITÉ : si une clé est configurée (SYMBION_API_KEY), header x-api-key
 * obligatoire sauf /health. Sans clé, l'API est ouverte.
 * Les commandes passent par la boucle du manager; on attend la réponse
 * avec timeout (504), sans jamais bloquer la boucle.
 */

use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::warn;

use crate::error::ManagerError;
use crate::health::{query_stats, HealthTracker, ManagerHealth};
use crate::history::{ItemValue, LatestValues};
use crate::models::HostId;
use crate::transport::ManagerEvent;

/// Vrai si la requête peut passer : /health, pas de clé configurée, ou
/// header x-api-key égal à la clé
fn is_authorized(path: &str, headers: &HeaderMap, expected: Option<&str>) -> bool {
    if path.starts_with("/health") {
        return true;
    }
    match expected {
        None => true,
        Some(key) => headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .map(|v| v == key)
            .unwrap_or(false),
    }
}

async fn require_api_key(State(app): State<AppState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    if !is_authorized(req.uri().path(), req.headers(), app.api_key.as_deref()) {
        warn!(path = %req.uri().path(), "API request refused: bad or missing x-api-key");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

/// Clé d'API depuis SYMBION_API_KEY (vide = pas de clé)
pub fn api_key_from_env() -> Option<String> {
    std::env::var("SYMBION_API_KEY").ok().filter(|k| !k.is_empty())
}

#[derive(Clone)]
pub struct AppState {
    pub events: mpsc::Sender<ManagerEvent>,
    pub values: LatestValues,
    pub health: HealthTracker,
    pub command_timeout: Duration,
    pub api_key: Option<String>,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/stats", get(get_stats))
        .route("/items", get(get_items))
        .route("/hosts/{host_id}/command", post(post_command))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        .with_state(app_state)
}

fn status_for(err: &ManagerError) -> StatusCode {
    match err {
        ManagerError::UnknownHost(_) => StatusCode::NOT_FOUND,
        ManagerError::HostUnreachable(_) | ManagerError::WorkerLost(_) | ManagerError::Stopped => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn get_stats(State(app): State<AppState>) -> Result<Json<ManagerHealth>, StatusCode> {
    let stats = query_stats(&app.events)
        .await
        .map_err(|e| status_for(&e))?;
    Ok(Json(app.health.report(stats)))
}

async fn get_items(State(app): State<AppState>) -> Json<Vec<ItemValue>> {
    Json(app.values.snapshot())
}

async fn post_command(
    State(app): State<AppState>,
    Path(host_id): Path<HostId>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let (tx, rx) = oneshot::channel();
    app.events
        .send(ManagerEvent::Command { host_id, payload, reply: tx })
        .await
        .map_err(|_| (StatusCode::SERVICE_UNAVAILABLE, ManagerError::Stopped.to_string()))?;

    // le receiver abandonné au timeout invalide le jeton côté manager
    match timeout(app.command_timeout, rx).await {
        Ok(Ok(Ok(result))) => Ok(Json(result)),
        Ok(Ok(Err(e))) => Err((status_for(&e), e.to_string())),
        Ok(Err(_)) => Err((StatusCode::SERVICE_UNAVAILABLE, ManagerError::Stopped.to_string())),
        Err(_) => Err((StatusCode::GATEWAY_TIMEOUT, format!("no reply from host {} in time", host_id))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(api_key: Option<&str>) -> AppState {
        let (events, _) = mpsc::channel(1);
        AppState {
            events,
            values: LatestValues::new(),
            health: HealthTracker::new(),
            command_timeout: Duration::from_secs(1),
            api_key: api_key.map(str::to_string),
        }
    }

    /// Sert le routeur sur un port local et renvoie la ligne de statut HTTP
    async fn status_line(app: AppState, path: &str, api_key: Option<&str>) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, build_router(app)).await.ok();
        });

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let key_header = api_key.map(|k| format!("x-api-key: {}\r\n", k)).unwrap_or_default();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: localhost\r\n{}Connection: close\r\n\r\n",
            path, key_header
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response.lines().next().unwrap_or_default().to_string()
    }

    #[test]
    fn test_api_key_check() {
        let mut headers = HeaderMap::new();
        assert!(is_authorized("/items", &headers, None));
        assert!(!is_authorized("/items", &headers, Some("s3cret")));
        assert!(is_authorized("/health", &headers, Some("s3cret")));

        headers.insert("x-api-key", "wrong".parse().unwrap());
        assert!(!is_authorized("/stats", &headers, Some("s3cret")));
        headers.insert("x-api-key", "s3cret".parse().unwrap());
        assert!(is_authorized("/stats", &headers, Some("s3cret")));
    }

    #[tokio::test]
    async fn test_routes_open_without_configured_key() {
        assert_eq!(status_line(state(None), "/items", None).await, "HTTP/1.1 200 OK");
    }

    #[tokio::test]
    async fn test_routes_guarded_by_configured_key() {
        assert_eq!(
            status_line(state(Some("s3cret")), "/items", None).await,
            "HTTP/1.1 401 Unauthorized"
        );
        assert_eq!(
            status_line(state(Some("s3cret")), "/items", Some("s3cret")).await,
            "HTTP/1.1 200 OK"
        );
        assert_eq!(status_line(state(Some("s3cret")), "/health", None).await, "HTTP/1.1 200 OK");
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(status_for(&ManagerError::UnknownHost(3)), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&ManagerError::HostUnreachable(3)), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_for(&ManagerError::WorkerLost(0)), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_for(&ManagerError::PoolFull(2)), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_command_answered_by_manager_loop() {
        let (events, mut rx) = mpsc::channel(4);
        let app = AppState {
            events,
            values: LatestValues::new(),
            health: HealthTracker::new(),
            command_timeout: Duration::from_secs(1),
            api_key: None,
        };
        tokio::spawn(async move {
            if let Some(ManagerEvent::Command { host_id, reply, .. }) = rx.recv().await {
                let _ = reply.send(Err(ManagerError::UnknownHost(host_id)));
            }
        });

        let err = post_command(State(app), Path(42), Json(serde_json::json!({"command": "power_status"})))
            .await
            .unwrap_err();
        assert_eq!(err.0, StatusCode::NOT_FOUND);
        assert_eq!(err.1, "host 42 is not configured");
    }
}
