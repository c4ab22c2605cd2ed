#![allow(clippy::unwrap_used, clippy::expect_used)]

//! REST API driven through the axum router

mod common;

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use common::{client_for, healthy_server};
use httpmock::prelude::*;
use serde_json::{Value, json};
use service_registry::ServiceRegistryModule;
use service_registry::config::RegistryConfig;
use service_registry::infra::MemoryCoordination;
use tower::ServiceExt; // for oneshot

async fn module() -> ServiceRegistryModule {
    let backend = Arc::new(MemoryCoordination::new());
    let registry = RegistryConfig {
        health_check_interval_secs: 3600,
        ..RegistryConfig::default()
    };
    let module = ServiceRegistryModule::with_coordination(
        client_for(&backend),
        vec!["memory".to_owned()],
        &registry,
    )
    .unwrap();
    module.start().await.unwrap();
    module
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let (status, _, json) = call_with_headers(app, method, uri, body).await;
    (status, json)
}

async fn call_with_headers(
    app: &Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, header::HeaderMap, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            request = request.header(header::CONTENT_TYPE, "application/json");
            Body::from(serde_json::to_vec(&json).unwrap())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(request.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, headers, json)
}

fn registration_body(server: &MockServer, name: &str) -> Value {
    json!({
        "name": name,
        "service_type": "tool",
        "host": server.host(),
        "port": server.port(),
        "metadata": {"tags": ["math"], "capabilities": ["add"]},
        "health_check": {"timeout_seconds": 1}
    })
}

async fn register(app: &Router, server: &MockServer, name: &str) -> String {
    let body = registration_body(server, name);
    let (status, body) = call(app, "POST", "/api/v1/register", Some(body)).await;
    assert_eq!(status, StatusCode::OK);
    body["service_id"].as_str().unwrap().to_owned()
}

// =============================================================================
// Registration lifecycle
// =============================================================================

#[tokio::test]
async fn test_register_get_and_unregister() {
    let module = module().await;
    let app = module.router();
    let server = healthy_server();

    let (status, body) = call(
        &app,
        "POST",
        "/api/v1/register",
        Some(registration_body(&server, "calc")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Service 'calc' registered successfully");
    let id = body["service_id"].as_str().unwrap().to_owned();

    let (status, body) = call(&app, "GET", &format!("/api/v1/services/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "calc");
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["metadata"]["tags"], json!(["math"]));

    let (status, body) = call(&app, "GET", "/api/v1/services/name/calc", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["service_id"], id.as_str());

    let (status, body) = call(&app, "DELETE", &format!("/api/v1/unregister/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], format!("Service '{id}' unregistered successfully"));

    let (status, _) = call(&app, "GET", &format!("/api/v1/services/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    module.stop().await;
}

#[tokio::test]
async fn test_unknown_ids_are_problem_404s() {
    let module = module().await;
    let app = module.router();

    for (method, uri, body) in [
        ("GET", "/api/v1/services/missing", None),
        ("GET", "/api/v1/services/name/missing", None),
        ("DELETE", "/api/v1/unregister/missing", None),
        ("PUT", "/api/v1/update/missing", Some(json!({"status": "healthy"}))),
        ("POST", "/api/v1/heartbeat/missing", None),
        ("GET", "/api/v1/tools/missing", None),
        ("GET", "/api/v1/tools/by-name/missing", None),
    ] {
        let (status, headers, problem) = call_with_headers(&app, method, uri, body).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{method} {uri}");
        assert_eq!(
            headers.get(header::CONTENT_TYPE).unwrap(),
            "application/problem+json"
        );
        assert_eq!(problem["status"], 404);
        assert_eq!(problem["detail"], "Service not found");
        assert_eq!(problem["code"], "SERVICE_REGISTRY_NOT_FOUND");
    }

    module.stop().await;
}

#[tokio::test]
async fn test_invalid_registration_is_rejected() {
    let module = module().await;
    let app = module.router();
    let server = healthy_server();

    let mut body = registration_body(&server, "calc");
    body["name"] = json!("");
    let (status, problem) = call(&app, "POST", "/api/v1/register", Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(problem["code"], "SERVICE_REGISTRY_VALIDATION");

    assert_eq!(module.service().service_count(), 0);
    module.stop().await;
}

#[tokio::test]
async fn test_malformed_requests_are_problems() {
    let module = module().await;
    let app = module.router();

    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/register")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{\"name\": "))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/problem+json"
    );
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let problem: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(problem["code"], "SERVICE_REGISTRY_INVALID_REQUEST");
    assert!(!problem["detail"].as_str().unwrap().is_empty());

    // Well-formed JSON of the wrong shape.
    let (status, headers, problem) = call_with_headers(
        &app,
        "PUT",
        "/api/v1/update/some-id",
        Some(json!({"status": "sleeping"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(headers[header::CONTENT_TYPE], "application/problem+json");
    assert_eq!(problem["code"], "SERVICE_REGISTRY_INVALID_REQUEST");

    let (status, headers, problem) =
        call_with_headers(&app, "GET", "/api/v1/discover?service_type=robot", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(headers[header::CONTENT_TYPE], "application/problem+json");
    assert_eq!(problem["code"], "SERVICE_REGISTRY_INVALID_REQUEST");

    module.stop().await;
}

#[tokio::test]
async fn test_update_and_heartbeat() {
    let module = module().await;
    let app = module.router();
    let server = healthy_server();
    let id = register(&app, &server, "calc").await;

    let (status, body) = call(
        &app,
        "PUT",
        &format!("/api/v1/update/{id}"),
        Some(json!({"status": "stopping", "metadata": {"version": "2.0"}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], format!("Service '{id}' updated successfully"));

    let (_, body) = call(&app, "GET", &format!("/api/v1/services/{id}"), None).await;
    assert_eq!(body["status"], "stopping");
    assert_eq!(body["metadata"]["version"], "2.0");

    let (status, body) = call(&app, "POST", &format!("/api/v1/heartbeat/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Heartbeat recorded");

    let (status, _) = call(
        &app,
        "PUT",
        &format!("/api/v1/update/{id}"),
        Some(json!({"status": "starting"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    module.stop().await;
}

// =============================================================================
// Discovery, stats and cleanup
// =============================================================================

#[tokio::test]
async fn test_discover_get_and_post_forms() {
    let module = module().await;
    let app = module.router();
    let healthy = healthy_server();
    let broken = MockServer::start();
    broken.mock(|when, then| {
        when.method(GET).path("/health");
        then.status(500);
    });
    let healthy_id = register(&app, &healthy, "calc").await;
    register(&app, &broken, "broken").await;

    let (status, body) = call(&app, "GET", "/api/v1/discover?service_type=tool", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_count"], 1);
    assert_eq!(body["services"][0]["service_id"], healthy_id.as_str());
    assert_eq!(body["query"]["status"], "healthy");

    let (_, body) = call(&app, "GET", "/api/v1/discover?status=any", None).await;
    assert_eq!(body["total_count"], 2);

    let (_, body) = call(&app, "GET", "/api/v1/discover?status=unhealthy", None).await;
    assert_eq!(body["total_count"], 1);
    assert_eq!(body["services"][0]["name"], "broken");

    let (_, body) = call(&app, "GET", "/api/v1/discover?tags=math,missing&status=any", None).await;
    assert_eq!(body["total_count"], 0);

    let (_, body) = call(&app, "GET", "/api/v1/discover?capabilities=add", None).await;
    assert_eq!(body["total_count"], 1);

    let (status, _) = call(&app, "GET", "/api/v1/discover?status=sleepy", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, body) = call(&app, "POST", "/api/v1/discover", Some(json!({"name": "calc"}))).await;
    assert_eq!(body["total_count"], 1);

    let (_, body) = call(&app, "POST", "/api/v1/discover", Some(json!({"status": null}))).await;
    assert_eq!(body["total_count"], 2);

    let (_, body) = call(&app, "POST", "/api/v1/discover", Some(json!({"name": "nobody"}))).await;
    assert_eq!(body["total_count"], 0);
    assert_eq!(body["services"], json!([]));

    module.stop().await;
}

#[tokio::test]
async fn test_stats_and_cleanup() {
    let module = module().await;
    let app = module.router();
    let server = healthy_server();
    register(&app, &server, "calc").await;

    let (status, stats) = call(&app, "GET", "/api/v1/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["total_services"], 1);
    assert_eq!(stats["healthy_services"], 1);
    assert_eq!(stats["unhealthy_services"], 0);
    assert_eq!(stats["services_by_type"]["tool"], 1);

    let (status, body) = call(&app, "POST", "/api/v1/cleanup", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cleaned_count"], 0);
    assert_eq!(body["message"], "Cleaned up 0 stale services");

    module.stop().await;
}

// =============================================================================
// Health and info
// =============================================================================

#[tokio::test]
async fn test_health_endpoints() {
    let module = module().await;
    let app = module.router();
    let server = healthy_server();
    register(&app, &server, "calc").await;

    let (status, body) = call(&app, "GET", "/api/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "healthy", "service": "service-registry"}));

    let (status, body) = call(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["zookeeper_connected"], true);
    assert_eq!(body["registered_services"], 1);
    assert!(body["timestamp"].is_string());

    let (status, body) = call(&app, "GET", "/", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "running");
    assert_eq!(body["services_root_path"], "/services");
    assert_eq!(body["coordination_endpoints"], json!(["memory"]));
    assert!(body["uptime_seconds"].as_f64().unwrap() >= 0.0);

    module.stop().await;

    let (_, body) = call(&app, "GET", "/health", None).await;
    assert_eq!(body["status"], "unhealthy");
    assert_eq!(body["zookeeper_connected"], false);
}

// =============================================================================
// Tools proxy
// =============================================================================

fn tool_server(tools: &Value) -> MockServer {
    let server = healthy_server();
    server.mock(|when, then| {
        when.method(GET).path("/tools");
        then.status(200).json_body(tools.clone());
    });
    server
}

#[tokio::test]
async fn test_tools_are_proxied() {
    let module = module().await;
    let app = module.router();
    let server = tool_server(&json!({"tools": [{"name": "add"}]}));
    let id = register(&app, &server, "calc").await;

    let (status, body) = call(&app, "GET", &format!("/api/v1/tools/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"tools": [{"name": "add"}]}));

    let (status, body) = call(&app, "GET", "/api/v1/tools/by-name/calc", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tools"][0]["name"], "add");

    module.stop().await;
}

#[tokio::test]
async fn test_tools_proxy_errors() {
    let module = module().await;
    let app = module.router();

    let broken = MockServer::start();
    broken.mock(|when, then| {
        when.method(GET).path("/health");
        then.status(500);
    });
    let broken_id = register(&app, &broken, "broken").await;
    let (status, problem) = call(&app, "GET", &format!("/api/v1/tools/{broken_id}"), None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(problem["detail"], "Service is not healthy");

    let failing = healthy_server();
    failing.mock(|when, then| {
        when.method(GET).path("/tools");
        then.status(500);
    });
    let failing_id = register(&app, &failing, "failing").await;
    let (status, problem) = call(&app, "GET", &format!("/api/v1/tools/{failing_id}"), None).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(problem["detail"], "Service returned error: 500");

    module.stop().await;
}

#[tokio::test]
async fn test_tools_are_aggregated_per_type() {
    let module = module().await;
    let app = module.router();

    let calc = tool_server(&json!({"tools": [{"name": "add"}, {"name": "mul"}]}));
    let search = tool_server(&json!({"tools": [{"name": "web_search"}]}));
    let failing = healthy_server();
    failing.mock(|when, then| {
        when.method(GET).path("/tools");
        then.status(503);
    });
    let calc_id = register(&app, &calc, "calc").await;
    register(&app, &search, "search").await;
    register(&app, &failing, "failing").await;

    let (status, body) = call(&app, "GET", "/api/v1/tools", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["services_count"], 3);
    assert_eq!(body["tools_count"], 3);
    assert_eq!(body["service_tools"]["calc"].as_array().unwrap().len(), 2);
    assert_eq!(body["service_tools"]["search"][0]["name"], "web_search");
    assert!(body["service_tools"].get("failing").is_none());

    let add = body["tools"]
        .as_array()
        .unwrap()
        .iter()
        .find(|t| t["name"] == "add")
        .unwrap();
    assert_eq!(add["service_id"], calc_id.as_str());
    assert_eq!(add["service_name"], "calc");
    assert_eq!(add["service_url"], calc.base_url());

    let (_, body) = call(&app, "GET", "/api/v1/tools?service_type=agent", None).await;
    assert_eq!(body["services_count"], 0);
    assert_eq!(body["tools"], json!([]));

    module.stop().await;
}
