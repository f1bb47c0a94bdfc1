use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use axum::body::{Body, Bytes};
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::Router;
use fault_relay_api::create_router;
use fault_relay_core::{LimitsConfig, ProxyCollection};
use http_body_util::BodyExt;
use serde_json::{json, Value as JsonValue};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tower::ServiceExt;

fn setup_app() -> (ProxyCollection, Router) {
    let proxies = ProxyCollection::new(LimitsConfig::default());
    let app = create_router(proxies.clone());
    (proxies, app)
}

async fn read_body(response: Response) -> Result<Bytes> {
    let collected = response.into_body().collect().await?;
    Ok(collected.to_bytes())
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<JsonValue>) -> Result<Response> {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body)?))?,
        None => builder.body(Body::empty())?,
    };
    Ok(app.clone().oneshot(request).await?)
}

async fn send_json(
    app: &Router,
    method: &str,
    uri: &str,
    body: Option<JsonValue>,
) -> Result<(StatusCode, JsonValue)> {
    let response = send(app, method, uri, body).await?;
    let status = response.status();
    let body = read_body(response).await?;
    let value = if body.is_empty() {
        JsonValue::Null
    } else {
        serde_json::from_slice(&body)?
    };
    Ok((status, value))
}

fn proxy_body(name: &str, upstream: &str) -> JsonValue {
    json!({
        "name": name,
        "listen": "127.0.0.1:0",
        "upstream": upstream,
        "enabled": true
    })
}

async fn spawn_echo_server() -> Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut read, mut write) = stream.into_split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    Ok(addr)
}

#[tokio::test]
async fn version_reports_crate_version() -> Result<()> {
    let (_, app) = setup_app();
    let (status, body) = send_json(&app, "GET", "/version", None).await?;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["version"], env!("CARGO_PKG_VERSION"));
    Ok(())
}

#[tokio::test]
async fn proxy_crud_flow() -> Result<()> {
    let (proxies, app) = setup_app();

    let (status, created) = send_json(
        &app,
        "POST",
        "/proxies",
        Some(proxy_body("http_host", "127.0.0.1:9")),
    )
    .await?;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["data"]["name"], "http_host");
    assert_eq!(created["data"]["enabled"], true);
    assert_ne!(created["data"]["listen"], "127.0.0.1:0");

    let (status, conflict) = send_json(
        &app,
        "POST",
        "/proxies",
        Some(proxy_body("http_host", "127.0.0.1:9")),
    )
    .await?;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(conflict["success"], false);
    assert_eq!(conflict["error"], "conflict");

    let (status, listed) = send_json(&app, "GET", "/proxies", None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed["data"].as_array().map(Vec::len), Some(1));

    let (status, updated) = send_json(
        &app,
        "PATCH",
        "/proxies/http_host",
        Some(json!({ "enabled": false })),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["data"]["enabled"], false);
    assert!(!proxies.get("http_host").await?.is_running().await);

    let response = send(&app, "DELETE", "/proxies/http_host", None).await?;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let (status, missing) = send_json(&app, "GET", "/proxies/http_host", None).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(missing["error"], "not_found");
    Ok(())
}

#[tokio::test]
async fn invalid_definitions_are_rejected() -> Result<()> {
    let (proxies, app) = setup_app();

    let (status, body) = send_json(
        &app,
        "POST",
        "/proxies",
        Some(json!({ "name": "bad", "listen": "nowhere", "upstream": "127.0.0.1:9" })),
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "bad_request");

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/proxies")
                .header("content-type", "application/json")
                .body(Body::from("{not json"))?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: JsonValue = serde_json::from_slice(&read_body(response).await?)?;
    assert_eq!(body["success"], false);

    assert!(proxies.is_empty().await);
    Ok(())
}

#[tokio::test]
async fn toxic_crud_flow() -> Result<()> {
    let (_, app) = setup_app();
    send_json(
        &app,
        "POST",
        "/proxies",
        Some(proxy_body("http_host", "127.0.0.1:9")),
    )
    .await?;

    let (status, created) = send_json(
        &app,
        "POST",
        "/proxies/http_host/toxics",
        Some(json!({ "type": "timeout", "stream": "downstream", "attributes": { "timeout": 0 } })),
    )
    .await?;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["data"]["name"], "timeout_downstream");
    assert_eq!(created["data"]["attributes"]["timeout"], 0);

    send_json(
        &app,
        "POST",
        "/proxies/http_host/toxics",
        Some(json!({
            "name": "lag",
            "type": "latency",
            "stream": "upstream",
            "attributes": { "latency_ms": 100, "jitter_ms": 5 }
        })),
    )
    .await?;

    let (status, downstream) = send_json(
        &app,
        "GET",
        "/proxies/http_host/toxics?stream=downstream",
        None,
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(downstream["data"].as_array().map(Vec::len), Some(1));

    let (_, proxy) = send_json(&app, "GET", "/proxies/http_host", None).await?;
    assert_eq!(proxy["data"]["toxics"].as_array().map(Vec::len), Some(2));

    let (status, updated) = send_json(
        &app,
        "PATCH",
        "/proxies/http_host/toxics/lag",
        Some(json!({ "attributes": { "latency": 250 }, "toxicity": 0.5 })),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["data"]["attributes"]["latency"], 250);
    assert_eq!(updated["data"]["attributes"]["jitter"], 5);
    assert_eq!(updated["data"]["toxicity"], 0.5);

    let (status, duplicate) = send_json(
        &app,
        "POST",
        "/proxies/http_host/toxics",
        Some(json!({ "name": "lag", "type": "latency", "stream": "downstream" })),
    )
    .await?;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(duplicate["error"], "conflict");

    let response = send(&app, "DELETE", "/proxies/http_host/toxics/lag", None).await?;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let (status, _) = send_json(&app, "GET", "/proxies/http_host/toxics/lag", None).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn unknown_toxic_kind_is_bad_request() -> Result<()> {
    let (_, app) = setup_app();
    send_json(
        &app,
        "POST",
        "/proxies",
        Some(proxy_body("http_host", "127.0.0.1:9")),
    )
    .await?;

    let (status, body) = send_json(
        &app,
        "POST",
        "/proxies/http_host/toxics",
        Some(json!({ "type": "meltdown", "attributes": {} })),
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "bad_request");

    let (status, body) = send_json(
        &app,
        "POST",
        "/proxies/nope/toxics",
        Some(json!({ "type": "timeout", "attributes": { "timeout": 0 } })),
    )
    .await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
    Ok(())
}

#[tokio::test]
async fn populate_then_destroy_all() -> Result<()> {
    let (proxies, app) = setup_app();
    let batch = json!([
        proxy_body("one", "127.0.0.1:9"),
        proxy_body("two", "127.0.0.1:9"),
    ]);

    let (status, first) = send_json(&app, "POST", "/populate", Some(batch.clone())).await?;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(first["data"].as_array().map(Vec::len), Some(2));

    let (status, second) = send_json(&app, "POST", "/populate", Some(batch)).await?;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(first["data"], second["data"]);
    assert_eq!(proxies.len().await, 2);

    let response = send(&app, "POST", "/reset", None).await?;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = send(&app, "DELETE", "/proxies", None).await?;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(proxies.is_empty().await);

    let (_, listed) = send_json(&app, "GET", "/proxies", None).await?;
    assert_eq!(listed["data"], json!([]));
    Ok(())
}

#[tokio::test]
async fn toxic_added_through_api_blocks_data_plane() -> Result<()> {
    let upstream = spawn_echo_server().await?;
    let (proxies, app) = setup_app();

    let (_, created) = send_json(
        &app,
        "POST",
        "/proxies",
        Some(proxy_body("echo", &upstream.to_string())),
    )
    .await?;
    let listen: SocketAddr = created["data"]["listen"]
        .as_str()
        .expect("listen address")
        .parse()?;

    send_json(
        &app,
        "POST",
        "/proxies/echo/toxics",
        Some(json!({ "type": "timeout", "attributes": { "timeout_ms": 0 } })),
    )
    .await?;

    let mut client = TcpStream::connect(listen).await?;
    client.write_all(b"hello").await?;
    let mut buf = [0u8; 5];
    let blocked = tokio::time::timeout(Duration::from_millis(150), client.read(&mut buf)).await;
    assert!(blocked.is_err());

    let (status, links) = send_json(&app, "GET", "/proxies/echo/links", None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(links["data"].as_array().map(Vec::len), Some(1));
    assert_eq!(links["data"][0]["state"], "active");

    send(&app, "DELETE", "/proxies/echo/toxics/timeout_downstream", None).await?;
    tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut buf)).await??;
    assert_eq!(&buf, b"hello");

    proxies.destroy_all().await;
    Ok(())
}
