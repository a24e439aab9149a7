use actix_web::dev::ServerHandle;
use actix_web::web::{self, Data};
use actix_web::{middleware, App, HttpRequest, HttpResponse, HttpServer, ResponseError};
use log::{error, info, warn};
use serde_json::json;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::handler::{InferenceRequest, RequestHandler};
use super::usage::UsageTracker;
use crate::error::NodeError;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
const WORKERS: usize = 2;

#[derive(Clone)]
pub struct ProxyState {
    pub handler: Arc<RequestHandler>,
    pub tracker: Arc<UsageTracker>,
    pub request_timeout: Duration,
}

fn request_id(req: &HttpRequest) -> String {
    req.headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn error_reply(err: &NodeError, request_id: &str) -> HttpResponse {
    HttpResponse::build(err.status_code())
        .insert_header((REQUEST_ID_HEADER, request_id.to_string()))
        .json(json!({ "error": err.to_string() }))
}

async fn inference(req: HttpRequest, body: web::Bytes, state: Data<ProxyState>) -> HttpResponse {
    let request_id = request_id(&req);
    let span = match state.tracker.begin(&request_id) {
        Ok(span) => span,
        Err(e) => return error_reply(&e, &request_id),
    };

    let request: InferenceRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            let err = NodeError::Validation(format!("invalid request body: {e}"));
            span.fail("", "", &err);
            return error_reply(&err, &request_id);
        }
    };

    match state
        .handler
        .handle_metered(span, &request, state.request_timeout)
        .await
    {
        Ok(response) => HttpResponse::Ok()
            .insert_header((REQUEST_ID_HEADER, request_id))
            .json(response),
        Err(e) => error_reply(&e, &request_id),
    }
}

async fn health(state: Data<ProxyState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "activeRequests": state.tracker.active_count(),
    }))
}

async fn usage(state: Data<ProxyState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "activeRequests": state.tracker.active_count(),
        "total": state.tracker.get_total_usage(),
        "lifetime": state.tracker.lifetime_usage(),
        "backends": state.handler.adapter_usage(),
    }))
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(web::scope("/v1").route("/inference", web::post().to(inference)))
        .route("/health", web::get().to(health))
        .route("/usage", web::get().to(usage));
}

struct RunningServer {
    port: u16,
    handle: ServerHandle,
    task: JoinHandle<std::io::Result<()>>,
}

/// Local HTTP gateway in front of the [`RequestHandler`].
pub struct ProxyServer {
    state: ProxyState,
    host: String,
    running: Option<RunningServer>,
}

impl ProxyServer {
    pub fn new(
        handler: Arc<RequestHandler>,
        tracker: Arc<UsageTracker>,
        host: &str,
        request_timeout: Duration,
    ) -> Self {
        Self {
            state: ProxyState {
                handler,
                tracker,
                request_timeout,
            },
            host: host.to_string(),
            running: None,
        }
    }

    /// Binds the listener and serves in a background task. Returns the bound
    /// port, which differs from `port` only when `port` is 0.
    pub fn start(&mut self, port: u16) -> Result<u16, NodeError> {
        if let Some(running) = &self.running {
            return Err(NodeError::InvalidState(format!(
                "proxy server already listening on port {}",
                running.port
            )));
        }

        let state = Data::new(self.state.clone());
        let server = HttpServer::new(move || {
            App::new()
                .app_data(state.clone())
                .wrap(middleware::Logger::default())
                .configure(configure_routes)
                .default_service(web::route().to(|| async {
                    HttpResponse::NotFound().json(json!({
                        "error": "Resource not found"
                    }))
                }))
        })
        .workers(WORKERS)
        .disable_signals()
        .bind((self.host.as_str(), port))
        .map_err(|e| match e.kind() {
            ErrorKind::AddrInUse => NodeError::AddressInUse(port),
            _ => NodeError::Io(format!("failed to bind {}:{port}: {e}", self.host)),
        })?;

        let bound_port = server
            .addrs()
            .first()
            .map(|addr| addr.port())
            .unwrap_or(port);
        let server = server.run();
        let handle = server.handle();
        let task = tokio::spawn(server);

        info!("Proxy server listening on {}:{bound_port}", self.host);
        self.running = Some(RunningServer {
            port: bound_port,
            handle,
            task,
        });
        Ok(bound_port)
    }

    /// Stops accepting connections and waits for the listener to close.
    /// A server that never started stops successfully.
    pub async fn stop(&mut self) -> Result<(), NodeError> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };

        running.handle.stop(true).await;
        match running.task.await {
            Ok(Ok(())) => {
                info!("Proxy server on port {} stopped", running.port);
                Ok(())
            }
            Ok(Err(e)) => {
                error!("Proxy server exited with error: {e}");
                Err(e.into())
            }
            Err(e) => {
                warn!("Proxy server task did not shut down cleanly: {e}");
                Err(NodeError::Io(e.to_string()))
            }
        }
    }

    pub fn port(&self) -> Option<u16> {
        self.running.as_ref().map(|running| running.port)
    }

    /// Kills the server task without a graceful shutdown.
    #[cfg(test)]
    pub(crate) fn abort_task(&self) {
        if let Some(running) = &self.running {
            running.task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::handler::tests::MockAdapter;
    use actix_web::http::StatusCode;
    use actix_web::test;
    use serde_json::Value;
    use shared::models::usage::RequestStatus;
    use std::net::TcpListener;

    fn state() -> ProxyState {
        let handler = Arc::new(RequestHandler::new());
        handler.register_adapter("mock", Arc::new(MockAdapter::ok(12)));
        handler.register_adapter("broken", Arc::new(MockAdapter::failing()));
        ProxyState {
            handler,
            tracker: Arc::new(UsageTracker::new()),
            request_timeout: Duration::from_secs(5),
        }
    }

    fn body(backend: &str) -> Value {
        json!({
            "backend": backend,
            "model": "mock-small",
            "messages": [{"role": "user", "content": "hello gateway"}],
            "maxTokens": 64
        })
    }

    #[actix_web::test]
    async fn inference_returns_normalized_response() {
        let state = state();
        let app = test::init_service(
            App::new()
                .app_data(Data::new(state.clone()))
                .configure(configure_routes),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/v1/inference")
            .insert_header((REQUEST_ID_HEADER, "req-42"))
            .set_json(body("mock"))
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get(REQUEST_ID_HEADER).unwrap(), "req-42");
        let json: Value = test::read_body_json(resp).await;
        assert_eq!(json["content"], "hello gateway");
        assert_eq!(json["usage"]["totalTokens"], 12);
        assert_eq!(json["finishReason"], "stop");

        let history = state.tracker.get_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].request_id, "req-42");
        assert_eq!(history[0].status, RequestStatus::Completed);
        assert_eq!(history[0].backend, "mock");
    }

    #[actix_web::test]
    async fn failures_are_request_scoped_errors() {
        let state = state();
        let app = test::init_service(
            App::new()
                .app_data(Data::new(state.clone()))
                .configure(configure_routes),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/v1/inference")
            .set_json(body("broken"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let generated = resp
            .headers()
            .get(REQUEST_ID_HEADER)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        let json: Value = test::read_body_json(resp).await;
        assert!(json["error"].as_str().unwrap().contains("forced failure"));

        let req = test::TestRequest::post()
            .uri("/v1/inference")
            .set_json(json!({"backend": "mock", "messages": []}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let history = state.tracker.get_history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].request_id, generated);
        assert!(history
            .iter()
            .all(|usage| usage.status == RequestStatus::Error));
        assert_eq!(state.tracker.active_count(), 0);
    }

    #[actix_web::test]
    async fn malformed_body_is_tracked_as_error() {
        let state = state();
        let app = test::init_service(
            App::new()
                .app_data(Data::new(state.clone()))
                .configure(configure_routes),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/v1/inference")
            .insert_header(("content-type", "application/json"))
            .set_payload("{not json")
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.tracker.get_history()[0].status, RequestStatus::Error);
    }

    #[actix_web::test]
    async fn usage_reports_totals_and_backends() {
        let state = state();
        let app = test::init_service(
            App::new()
                .app_data(Data::new(state.clone()))
                .configure(configure_routes),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/v1/inference")
            .set_json(body("mock"))
            .to_request();
        test::call_service(&app, req).await;

        let req = test::TestRequest::get().uri("/usage").to_request();
        let json: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(json["activeRequests"], 0);
        assert_eq!(json["total"]["totalRequests"], 1);
        assert_eq!(json["total"]["totalTokens"], 12);
        assert_eq!(json["lifetime"]["totalRequests"], 1);
        assert_eq!(json["backends"]["mock"]["totalRequests"], 1);
        assert_eq!(json["backends"]["broken"]["totalRequests"], 0);

        let req = test::TestRequest::get().uri("/health").to_request();
        let json: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn start_serves_and_stop_releases_port() {
        let state = state();
        let mut server = ProxyServer::new(
            state.handler.clone(),
            state.tracker.clone(),
            "127.0.0.1",
            Duration::from_secs(5),
        );
        server.stop().await.unwrap();

        let port = server.start(0).unwrap();
        assert!(server.is_running());
        assert_eq!(server.port(), Some(port));
        assert!(matches!(server.start(0), Err(NodeError::InvalidState(_))));

        let health: Value = reqwest::get(format!("http://127.0.0.1:{port}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "ok");

        server.stop().await.unwrap();
        assert!(!server.is_running());
        assert_eq!(server.port(), None);
    }

    #[tokio::test]
    async fn occupied_port_is_reported_not_fatal() {
        let occupied = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = occupied.local_addr().unwrap().port();
        let state = state();
        let mut server = ProxyServer::new(
            state.handler,
            state.tracker,
            "127.0.0.1",
            Duration::from_secs(5),
        );

        assert_eq!(server.start(port), Err(NodeError::AddressInUse(port)));
        assert!(!server.is_running());
    }
}
