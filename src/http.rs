//! HTTP API for the rewards engine
//!
//! ## Endpoints
//!
//! - `POST /trigger` - Process a trigger, always answers with a trigger result
//! - `GET /users/{id}/summary` - Aggregate, level progress and badges
//! - `GET /users/{id}/transactions?limit&offset` - Ledger rows, newest first
//! - `GET /users/{id}/badges` - Badge awards
//! - `GET /users/{id}/verify` - Aggregate total against ledger sum
//! - `POST /users/{id}/reconcile` - Rebuild the aggregate from the ledger
//! - `GET /badges` - Badge catalog
//! - `GET /leaderboard?limit` - Users by total points
//! - `GET /reconciliation` - Users queued for reconciliation
//! - `GET /health` - Health check
//!
//! Engine calls block on SQLite, so each one runs on the blocking pool.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::catalog::TriggerRequest;
use crate::engine::RewardsEngine;
use crate::error::RewardsError;
use crate::services::response;

/// Largest accepted request body
const MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Debug, Default, Deserialize)]
struct PageQuery {
    limit: Option<u32>,
    offset: Option<u32>,
}

/// HTTP server state
pub struct HttpServer {
    engine: Arc<RewardsEngine>,
    bind_addr: SocketAddr,
}

impl HttpServer {
    pub fn new(engine: Arc<RewardsEngine>, bind_addr: SocketAddr) -> Self {
        Self { engine, bind_addr }
    }

    /// Run the HTTP server
    pub async fn run(self: Arc<Self>) -> Result<(), RewardsError> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "HTTP server listening");

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let server = self.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let server = server.clone();
                    async move { server.handle_request(req).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    warn!(addr = %remote_addr, error = %err, "Connection error");
                }
            });
        }
    }

    /// Run an engine call on the blocking pool
    async fn blocking<T, F>(&self, f: F) -> Result<T, RewardsError>
    where
        F: FnOnce(&RewardsEngine) -> T + Send + 'static,
        T: Send + 'static,
    {
        let engine = Arc::clone(&self.engine);
        tokio::task::spawn_blocking(move || f(&engine))
            .await
            .map_err(|e| RewardsError::Internal(format!("Worker task failed: {}", e)))
    }

    /// Route requests to handlers
    pub async fn handle_request<B>(&self, req: Request<B>) -> Result<Response<Full<Bytes>>, Infallible>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let path = req.uri().path().to_string();
        let method = req.method().clone();
        let query = req.uri().query().unwrap_or("").to_string();

        debug!(method = %method, path = %path, "Incoming request");

        let response = match (&method, path.as_str()) {
            (&Method::GET, "/health") => response::ok(&serde_json::json!({
                "status": "ok",
                "pending_reconciliations": self.engine.pending_reconciliations().len(),
                "event_subscribers": self.engine.events().subscriber_count(),
            })),

            (&Method::POST, "/trigger") => self.handle_trigger(req).await,
            (_, "/trigger") => response::method_not_allowed(),

            (&Method::GET, "/badges") => response::ok(&self.engine.badge_catalog()),

            (&Method::GET, "/leaderboard") => {
                let page = parse_query(&query);
                let limit = page.limit.unwrap_or(10);
                response::from_result(self.blocking(move |engine| engine.leaderboard(limit)).await.and_then(|r| r))
            }

            (&Method::GET, "/reconciliation") => response::ok(&self.engine.pending_reconciliations()),

            (_, p) if p.starts_with("/users/") => self.handle_user(&method, p, &query).await,

            _ => response::not_found("Not Found"),
        };

        Ok(response)
    }

    /// POST /trigger
    async fn handle_trigger<B>(&self, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        // Stops reading once the limit is crossed
        let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                return response::payload_too_large(MAX_BODY_BYTES);
            }
            Err(e) => return response::bad_request(&format!("Failed to read body: {}", e)),
        };

        let request: TriggerRequest = match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(e) => return response::bad_request(&format!("Invalid trigger JSON: {}", e)),
        };

        match self.blocking(move |engine| engine.process_trigger(&request)).await {
            Ok(result) => response::ok(&result),
            Err(e) => {
                error!(error = %e, "Trigger worker failed");
                response::internal_error(&e.to_string())
            }
        }
    }

    /// /users/{id}/{action}
    async fn handle_user(&self, method: &Method, path: &str, query: &str) -> Response<Full<Bytes>> {
        let rest = path.strip_prefix("/users/").unwrap_or("");
        let Some((user_id, action)) = rest.rsplit_once('/') else {
            return response::not_found("Not Found");
        };
        if user_id.is_empty() || user_id.contains('/') {
            return response::bad_request("Invalid user id");
        }
        let user_id = user_id.to_string();

        match (method, action) {
            (&Method::GET, "summary") => {
                let result = self.blocking(move |engine| engine.summary(&user_id)).await;
                response::from_result(result.and_then(|r| r))
            }
            (&Method::GET, "transactions") => {
                let page = parse_query(query);
                let (limit, offset) = (page.limit.unwrap_or(50), page.offset.unwrap_or(0));
                let result = self.blocking(move |engine| engine.history(&user_id, limit, offset)).await;
                response::from_result(result.and_then(|r| r))
            }
            (&Method::GET, "badges") => {
                let result = self.blocking(move |engine| engine.user_badges(&user_id)).await;
                response::from_result(result.and_then(|r| r))
            }
            (&Method::GET, "verify") => {
                let result = self.blocking(move |engine| engine.verify_user(&user_id)).await;
                response::from_result(result.and_then(|r| r))
            }
            (&Method::POST, "reconcile") => {
                let result = self.blocking(move |engine| engine.reconcile_user(&user_id)).await;
                response::from_result(result.and_then(|r| r))
            }
            (_, "summary" | "transactions" | "badges" | "verify" | "reconcile") => response::method_not_allowed(),
            _ => response::not_found("Not Found"),
        }
    }
}

fn parse_query(query: &str) -> PageQuery {
    serde_urlencoded::from_str(query).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::db::SqliteRepository;
    use crate::engine::EngineSettings;
    use crate::services::EventBus;
    use crate::tier::TierTable;
    use hyper::StatusCode;

    fn server() -> HttpServer {
        let engine = RewardsEngine::new(
            Arc::new(SqliteRepository::open_in_memory().unwrap()),
            Catalog::defaults().unwrap(),
            TierTable::default(),
            EngineSettings::default(),
            Arc::new(EventBus::new()),
        )
        .unwrap();
        HttpServer::new(Arc::new(engine), "127.0.0.1:0".parse().unwrap())
    }

    fn request(method: Method, uri: &str, body: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap()
    }

    async fn json(resp: Response<Full<Bytes>>) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_trigger_then_summary() {
        let server = server();
        let body = r#"{"trigger_type":"team_join","user_id":"u-1","metadata":{"reference_id":"m-1","team_id":"t-1"}}"#;
        let resp = server.handle_request(request(Method::POST, "/trigger", body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let result = json(resp).await;
        assert_eq!(result["status"], "applied");
        assert_eq!(result["total_points"], 25);

        let resp = server.handle_request(request(Method::GET, "/users/u-1/summary", "")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let summary = json(resp).await;
        assert_eq!(summary["aggregate"]["teams_joined"], 1);
    }

    #[tokio::test]
    async fn test_unknown_trigger_is_still_ok() {
        let server = server();
        let body = r#"{"trigger_type":"logged_in","user_id":"u-1","metadata":{"reference_id":"x"}}"#;
        let resp = server.handle_request(request(Method::POST, "/trigger", body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json(resp).await["error"], "unknown_trigger");
    }

    #[tokio::test]
    async fn test_bad_json_and_routes() {
        let server = server();
        let resp = server.handle_request(request(Method::POST, "/trigger", "{nope")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = server.handle_request(request(Method::GET, "/trigger", "")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);

        let resp = server.handle_request(request(Method::GET, "/nowhere", "")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = server.handle_request(request(Method::GET, "/users/u-1/reconcile", "")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_oversized_trigger_body_rejected() {
        let server = server();
        let padding = "x".repeat(MAX_BODY_BYTES);
        let body = format!(
            r#"{{"trigger_type":"team_join","user_id":"u-1","metadata":{{"reference_id":"m-1","team_id":"t-1","note":"{}"}}}}"#,
            padding
        );
        let resp = server.handle_request(request(Method::POST, "/trigger", &body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);

        // Nothing was processed
        let resp = server.handle_request(request(Method::GET, "/users/u-1/transactions", "")).await.unwrap();
        assert!(json(resp).await.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transactions_pagination_and_verify() {
        let server = server();
        for i in 0..3 {
            let body = format!(
                r#"{{"trigger_type":"survey_completed","user_id":"u-1","metadata":{{"reference_id":"s-{}","survey_id":"s"}}}}"#,
                i
            );
            server.handle_request(request(Method::POST, "/trigger", &body)).await.unwrap();
        }

        let resp = server
            .handle_request(request(Method::GET, "/users/u-1/transactions?limit=2", ""))
            .await
            .unwrap();
        assert_eq!(json(resp).await.as_array().unwrap().len(), 2);

        let resp = server.handle_request(request(Method::GET, "/users/u-1/verify", "")).await.unwrap();
        assert_eq!(json(resp).await["consistent"], true);

        let resp = server.handle_request(request(Method::GET, "/leaderboard?limit=5", "")).await.unwrap();
        assert_eq!(json(resp).await[0]["user_id"], "u-1");
    }
}
