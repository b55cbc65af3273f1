//! The HTTP surface: route table, CORS policy, and the chat orchestrator
//! that ties admission, auth, parsing, dispatch, and translation together.
//! Health, status, and model listing bypass the admission gate.

use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use zgate_proxy::{
    format::{ClientRequest, MODEL_OWNER},
    ids, Proxy,
};

use crate::error::ApiError;

/// Request bodies larger than this are rejected as malformed.
const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

pub struct ServerState {
    pub proxy: Proxy,
    pub started_at: DateTime<Utc>,
}

impl ServerState {
    pub fn new(proxy: Proxy) -> Self {
        Self {
            proxy,
            started_at: Utc::now(),
        }
    }
}

pub fn build_app(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/v1/models", get(list_models))
        .route("/v1/chat/completions", post(chat_completions))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::PUT,
                    Method::DELETE,
                    Method::OPTIONS,
                ])
                .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]),
        )
}

async fn root(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(json!({
        "service": "zgate",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": ["/health", "/status", "/v1/models", "/v1/chat/completions"],
        "models": state.proxy.config().models.all(),
    }))
}

async fn health(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let config = state.proxy.config();
    let stats = state.proxy.stats();

    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
        "performance_mode": config.performance_mode.as_str(),
        "uptime_seconds": stats.uptime_seconds(),
        "config": {
            "max_retries": config.retry_max,
            "retry_delay_ms": config.retry_base_delay.as_millis() as u64,
            "request_timeout_ms": config.request_timeout.as_millis() as u64,
            "stream_timeout_ms": config.stream_timeout.as_millis() as u64,
            "jitter_ms": [
                config.jitter_min.as_millis() as u64,
                config.jitter_max.as_millis() as u64,
            ],
            "max_concurrent": config.max_concurrent,
            "stream_buffer_bytes": config.stream_buffer_bytes,
            "connection_check_interval": config.connection_check_interval,
            "connection_check_disabled": config.connection_check_disabled,
            "anon_token_enabled": config.anon_token_enabled,
            "think_tags_mode": config.think_tags_mode.as_str(),
            "models": config.models.all(),
        },
        "stats": stats.snapshot(),
        "improvements": [
            "non-blocking admission control",
            "per-request anonymous token",
            "exponential backoff with jitter",
            "streaming phase translation",
            "client liveness probing",
        ],
    }))
}

async fn status(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let config = state.proxy.config();
    let snapshot = state.proxy.stats().snapshot();

    Json(json!({
        "current_connections": snapshot.current_connections,
        "max_connections": config.max_concurrent,
        "memory_usage_mb": memory_usage_mb(),
        "memory_limit_mb": config.memory_limit_mb,
        "total_requests": snapshot.total_requests,
        "error_count": snapshot.error_count,
        "uptime_seconds": snapshot.uptime_seconds,
    }))
}

async fn list_models(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let created = state.started_at.timestamp();
    let data: Vec<_> = state
        .proxy
        .config()
        .models
        .all()
        .iter()
        .map(|name| {
            json!({
                "id": name,
                "object": "model",
                "created": created,
                "owned_by": MODEL_OWNER,
            })
        })
        .collect();

    Json(json!({"object": "list", "data": data}))
}

/// The resident set size, for `/status` and the memory ticker.
pub fn memory_usage_mb() -> u64 {
    let Ok(pid) = sysinfo::get_current_pid() else {
        return 0;
    };
    let mut system = sysinfo::System::new();
    if !system.refresh_process(pid) {
        return 0;
    }
    system
        .process(pid)
        .map(|process| process.memory() / (1024 * 1024))
        .unwrap_or(0)
}

async fn chat_completions(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    // Admission is the first decision; a saturated gate rejects before any
    // counters move or the upstream is touched.
    let Some(permit) = state.proxy.try_admit() else {
        tracing::warn!("admission gate saturated, rejecting request");
        return ApiError::TooBusy.into_response();
    };

    let started = std::time::Instant::now();
    let request_id = ids::new_request_id();
    let client_ip = ids::client_ip(request.headers(), Some(peer));
    let stats = state.proxy.stats().clone();
    stats.record_request();

    match handle_chat(&state, permit, &request_id, &client_ip, request, started).await {
        Ok(response) => response,
        Err(error) => {
            stats.record_error();
            stats.record_response_time(started.elapsed());
            tracing::info!(
                request_id = %request_id,
                client_ip = %client_ip,
                status = error.status().as_u16(),
                latency_ms = started.elapsed().as_millis() as u64,
                "request failed"
            );
            error.into_response()
        }
    }
}

async fn handle_chat(
    state: &Arc<ServerState>,
    permit: zgate_proxy::admission::AdmissionPermit,
    request_id: &str,
    client_ip: &str,
    request: Request,
    started: std::time::Instant,
) -> Result<Response, ApiError> {
    let config = state.proxy.config();
    let headers = request.headers().clone();

    let body = axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES)
        .await
        .map_err(|error| ApiError::BadRequest(format!("Failed to read request body: {error}")))?;

    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    let Some(bearer) = bearer.filter(|key| *key == config.default_api_key) else {
        tracing::warn!(request_id, client_ip, "rejected client bearer");
        return Err(ApiError::Unauthorized);
    };
    let masked_key = ids::mask_key(bearer);

    let chat_request: ClientRequest = serde_json::from_slice(&body)
        .map_err(|error| ApiError::BadRequest(format!("Invalid request body: {error}")))?;

    tracing::info!(
        request_id,
        client_ip,
        api_key = %masked_key,
        model = %chat_request.model,
        stream = chat_request.stream,
        messages = chat_request.messages.len(),
        "chat request"
    );
    if config.enable_detailed_logging {
        tracing::debug!(
            request_id,
            temperature = chat_request.temperature,
            max_tokens = chat_request.max_tokens,
            "request parameters"
        );
    }
    if config.log_user_messages {
        if let Some(last) = chat_request.messages.iter().rev().find(|m| m.role == "user") {
            tracing::debug!(request_id, content = %last.content, "user message");
        }
    }

    let prepared = state.proxy.prepare(&chat_request);
    let timeout = if chat_request.stream {
        config.stream_timeout
    } else {
        config.request_timeout
    };
    let deadline = tokio::time::Instant::now() + timeout;

    let upstream = state
        .proxy
        .dispatch(&prepared, deadline)
        .await
        .map_err(|report| {
            tracing::error!(request_id, err = ?report, "upstream dispatch failed");
            ApiError::Upstream {
                details: report.to_string(),
                performance_mode: config.performance_mode.as_str(),
            }
        })?;

    if chat_request.stream {
        let frames = state.proxy.stream_response(
            upstream,
            request_id,
            &chat_request.model,
            deadline,
            started,
            permit,
        );
        let body = Body::from_stream(frames.into_stream().map(Ok::<_, Infallible>));

        tracing::info!(request_id, "streaming response started");
        Ok((
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "text/event-stream"),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            body,
        )
            .into_response())
    } else {
        let response = state
            .proxy
            .aggregate_response(upstream, request_id, &chat_request.model, deadline)
            .await;
        state.proxy.stats().record_response_time(started.elapsed());
        drop(permit);

        tracing::info!(
            request_id,
            latency_ms = started.elapsed().as_millis() as u64,
            "request complete"
        );
        if config.log_response_content {
            tracing::debug!(
                request_id,
                content = %response.choices[0].message.content,
                "response content"
            );
        }

        Ok(Json(response).into_response())
    }
}

#[cfg(test)]
mod test {
    use axum::{body::Body, http::Request as HttpRequest};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };
    use zgate_proxy::config::ProxyConfig;

    use super::*;

    const TEST_KEY: &str = "sk-test-key-123456";

    fn test_state(upstream: Option<&MockServer>, max_concurrent: usize) -> Arc<ServerState> {
        let mut config = ProxyConfig::default();
        config.default_api_key = TEST_KEY.to_string();
        config.max_concurrent = max_concurrent;
        config.anon_token_enabled = false;
        config.retry_max = 1;
        config.connection_check_disabled = true;
        if let Some(server) = upstream {
            config.upstream_url = format!("{}/api/chat/completions", server.uri());
        }
        Arc::new(ServerState::new(Proxy::new(config)))
    }

    fn chat_request(body: &str, key: Option<&str>) -> Request {
        let mut builder = HttpRequest::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("content-type", "application/json");
        if let Some(key) = key {
            builder = builder.header("authorization", format!("Bearer {key}"));
        }
        let mut request = builder.body(Body::from(body.to_string())).unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))));
        request
    }

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn missing_bearer_is_unauthorized() {
        let state = test_state(None, 4);
        let app = build_app(state.clone());

        let body = r#"{"model":"GLM-4.5","messages":[{"role":"user","content":"hi"}]}"#;
        let response = app.oneshot(chat_request(body, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["error"], "Unauthorized");

        let snapshot = state.proxy.stats().snapshot();
        assert_eq!(snapshot.total_requests, 1);
        assert_eq!(snapshot.error_count, 1);
    }

    #[tokio::test]
    async fn wrong_bearer_is_unauthorized() {
        let app = build_app(test_state(None, 4));
        let body = r#"{"model":"GLM-4.5","messages":[]}"#;
        let response = app
            .oneshot(chat_request(body, Some("sk-wrong")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn malformed_json_is_bad_request() {
        let app = build_app(test_state(None, 4));
        let response = app
            .oneshot(chat_request("{not json", Some(TEST_KEY)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(response).await["error"]
            .as_str()
            .unwrap()
            .starts_with("Invalid request body"));
    }

    #[tokio::test]
    async fn missing_model_is_bad_request() {
        let app = build_app(test_state(None, 4));
        let response = app
            .oneshot(chat_request(r#"{"messages":[]}"#, Some(TEST_KEY)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn saturated_gate_returns_503_without_counting() {
        let state = test_state(None, 0);
        let app = build_app(state.clone());

        let body = r#"{"model":"GLM-4.5","messages":[]}"#;
        let response = app.oneshot(chat_request(body, Some(TEST_KEY))).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            body_json(response).await["error"],
            "Server too busy, please try again later"
        );

        let snapshot = state.proxy.stats().snapshot();
        assert_eq!(snapshot.total_requests, 0, "rejected requests are not counted");
        assert_eq!(snapshot.current_connections, 0);
    }

    #[tokio::test]
    async fn model_list_has_three_entries() {
        let app = build_app(test_state(None, 4));
        let response = app
            .oneshot(HttpRequest::get("/v1/models").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["object"], "list");
        let data = json["data"].as_array().unwrap();
        assert_eq!(data.len(), 3);
        assert_eq!(data[0]["id"], "GLM-4.5");
        assert_eq!(data[0]["owned_by"], "z.ai");
        assert_eq!(data[1]["id"], "GLM-4.5-Thinking");
        assert_eq!(data[2]["id"], "GLM-4.5-Search");
    }

    #[tokio::test]
    async fn health_and_status_shapes() {
        let app = build_app(test_state(None, 4));

        let health = app
            .clone()
            .oneshot(HttpRequest::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::OK);
        let health = body_json(health).await;
        assert_eq!(health["status"], "ok");
        assert_eq!(health["performance_mode"], "balanced");
        assert!(health["config"]["max_retries"].is_u64());
        assert!(health["stats"]["total_requests"].is_u64());
        assert!(health["improvements"].is_array());

        let status = app
            .oneshot(HttpRequest::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = body_json(status).await;
        assert_eq!(status["current_connections"], 0);
        assert_eq!(status["max_connections"], 4);
        assert!(status["memory_limit_mb"].is_u64());
    }

    #[tokio::test]
    async fn cors_preflight_is_permissive() {
        let app = build_app(test_state(None, 4));
        let request = HttpRequest::builder()
            .method("OPTIONS")
            .uri("/v1/chat/completions")
            .header("origin", "https://example.com")
            .header("access-control-request-method", "POST")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get("access-control-allow-origin")
                .unwrap(),
            "*"
        );
    }

    #[tokio::test]
    async fn streaming_chat_end_to_end() {
        let upstream = MockServer::start().await;
        let sse = concat!(
            "data: {\"data\":{\"phase\":\"thinking\",\"delta_content\":\"<details open>why</details>\"}}\n",
            "data: {\"data\":{\"phase\":\"answer\",\"delta_content\":\"42\"}}\n",
            "data: {\"data\":{\"done\":true}}\n",
        );
        Mock::given(method("POST"))
            .and(path("/api/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
            .mount(&upstream)
            .await;

        let state = test_state(Some(&upstream), 4);
        let app = build_app(state.clone());

        let body = r#"{"model":"GLM-4.5-Thinking","messages":[{"role":"user","content":"hi"}],"stream":true}"#;
        let response = app.oneshot(chat_request(body, Some(TEST_KEY))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/event-stream"
        );

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();

        assert!(text.contains("\"role\":\"assistant\""));
        assert!(text.contains("\"reasoning_content\":\"<think>why</think>\""));
        assert!(text.contains("\"content\":\"42\""));
        assert!(text.contains("\"finish_reason\":\"stop\""));
        assert!(text.trim_end().ends_with("data: [DONE]"));
        assert_eq!(text.matches("[DONE]").count(), 1);
    }

    #[tokio::test]
    async fn nonstreaming_chat_end_to_end() {
        let upstream = MockServer::start().await;
        let sse = concat!(
            "data: {\"data\":{\"phase\":\"answer\",\"delta_content\":\"Hel\"}}\n",
            "data: {\"data\":{\"phase\":\"answer\",\"delta_content\":\"lo\"}}\n",
            "data: {\"data\":{\"done\":true}}\n",
        );
        Mock::given(method("POST"))
            .and(path("/api/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
            .mount(&upstream)
            .await;

        let state = test_state(Some(&upstream), 4);
        let app = build_app(state.clone());

        let body = r#"{"model":"GLM-4.5","messages":[{"role":"user","content":"hi"}],"stream":false}"#;
        let response = app.oneshot(chat_request(body, Some(TEST_KEY))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["object"], "chat.completion");
        assert_eq!(json["choices"][0]["message"]["content"], "Hello");
        assert_eq!(json["choices"][0]["finish_reason"], "stop");
        assert_eq!(json["usage"]["total_tokens"], 0);
        assert_eq!(json["model"], "GLM-4.5");

        let snapshot = state.proxy.stats().snapshot();
        assert_eq!(snapshot.total_requests, 1);
        assert_eq!(snapshot.error_count, 0);
        assert_eq!(snapshot.current_connections, 0);
    }

    #[tokio::test]
    async fn upstream_failure_maps_to_502() {
        let upstream = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&upstream)
            .await;

        let state = test_state(Some(&upstream), 4);
        let app = build_app(state.clone());

        let body = r#"{"model":"GLM-4.5","messages":[],"stream":false}"#;
        let response = app.oneshot(chat_request(body, Some(TEST_KEY))).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let json = body_json(response).await;
        assert_eq!(json["retry_after"], 60);
        assert_eq!(json["performance_mode"], "balanced");
        assert!(json["details"].is_string());

        let snapshot = state.proxy.stats().snapshot();
        assert_eq!(snapshot.error_count, 1);
    }
}
