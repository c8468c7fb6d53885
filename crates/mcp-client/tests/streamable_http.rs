use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ai_agent::{ConnectErrorKind, ToolProvider};
use anyhow::Result;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use mcp_client::{
    HttpServerConfig, McpResolvedServerConfig, McpToolProvider, StreamableHttpTransport,
    Transport, TransportConfig, TransportError, TransportEvent,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;

const SESSION: &str = "session-7f3a";

#[derive(Default)]
struct FakeServer {
    token: Option<String>,
    expired: AtomicBool,
    deletes: AtomicUsize,
    deleted_session: Mutex<Option<String>>,
    push: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl FakeServer {
    fn authorized(&self, headers: &HeaderMap) -> bool {
        match &self.token {
            None => true,
            Some(token) => {
                headers
                    .get(header::AUTHORIZATION)
                    .and_then(|v| v.to_str().ok())
                    == Some(format!("Bearer {token}").as_str())
            }
        }
    }

    fn session_ok(&self, headers: &HeaderMap) -> bool {
        headers.get("mcp-session-id").and_then(|v| v.to_str().ok()) == Some(SESSION)
    }
}

fn reply(id: &Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

async fn handle_post(
    State(server): State<Arc<FakeServer>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !server.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let Some(id) = body.get("id").cloned() else {
        return StatusCode::ACCEPTED.into_response();
    };
    let method = body["method"].as_str().unwrap_or_default();
    if method == "initialize" {
        let result = reply(&id, json!({"serverInfo": {"name": "fake-http"}}));
        return ([("mcp-session-id", SESSION)], Json(result)).into_response();
    }
    if !server.session_ok(&headers) {
        return StatusCode::BAD_REQUEST.into_response();
    }
    if server.expired.load(Ordering::SeqCst) {
        return StatusCode::NOT_FOUND.into_response();
    }

    match method {
        "tools/list" => Json(reply(
            &id,
            json!({"tools": [
                {"name": "search", "description": "Web search", "inputSchema": {"type": "object"}},
                {"name": "slow_search"}
            ]}),
        ))
        .into_response(),
        "tools/call" if body["params"]["name"] == json!("slow_search") => {
            let server = server.clone();
            tokio::spawn(async move {
                for _ in 0..200 {
                    let sender = server.push.lock().unwrap().clone();
                    if let Some(sender) = sender {
                        let answer = reply(&id, json!({"content": [{"type": "text", "text": "late answer"}]}));
                        let _ = sender.send(answer.to_string());
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            });
            StatusCode::ACCEPTED.into_response()
        }
        "tools/call" => {
            let query = body["params"]["arguments"]["q"].as_str().unwrap_or_default();
            let progress = json!({"jsonrpc": "2.0", "method": "notifications/progress", "params": {"progress": 1}});
            let answer = reply(&id, json!({"content": [{"type": "text", "text": format!("results for {query}")}]}));
            let stream = format!("event: message\ndata: {progress}\n\nevent: message\ndata: {answer}\n\n");
            ([(header::CONTENT_TYPE, "text/event-stream")], stream).into_response()
        }
        _ => Json(json!({"jsonrpc": "2.0", "id": id, "error": {"code": -32601, "message": "nope"}}))
            .into_response(),
    }
}

async fn handle_get(State(server): State<Arc<FakeServer>>, headers: HeaderMap) -> Response {
    if !server.session_ok(&headers) {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    *server.push.lock().unwrap() = Some(tx);
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|msg| (Ok::<_, std::convert::Infallible>(format!("data: {msg}\n\n")), rx))
    });
    (
        [(header::CONTENT_TYPE, "text/event-stream")],
        Body::from_stream(stream),
    )
        .into_response()
}

async fn handle_delete(State(server): State<Arc<FakeServer>>, headers: HeaderMap) -> StatusCode {
    server.deletes.fetch_add(1, Ordering::SeqCst);
    *server.deleted_session.lock().unwrap() = headers
        .get("mcp-session-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    StatusCode::OK
}

async fn start(server: FakeServer) -> Result<(Arc<FakeServer>, String)> {
    let server = Arc::new(server);
    let app = Router::new()
        .route("/mcp", post(handle_post).get(handle_get).delete(handle_delete))
        .with_state(server.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((server, format!("http://{addr}/mcp")))
}

fn http_config(url: &str, token: Option<&str>) -> HttpServerConfig {
    HttpServerConfig {
        url: url.to_string(),
        headers: Default::default(),
        auth_token: token.map(str::to_string),
    }
}

async fn initialized(
    url: &str,
) -> Result<(StreamableHttpTransport, mpsc::UnboundedReceiver<TransportEvent>)> {
    let (events, rx) = mpsc::unbounded_channel();
    let transport =
        StreamableHttpTransport::connect(&http_config(url, None), Duration::from_secs(5), events)?;
    transport
        .request("initialize", mcp_client::protocol::initialize_params())
        .await?;
    transport.notify("notifications/initialized", None).await?;
    Ok((transport, rx))
}

#[tokio::test]
async fn session_id_is_captured_and_echoed() -> Result<()> {
    let (_server, url) = start(FakeServer::default()).await?;
    let (transport, _events) = initialized(&url).await?;
    assert_eq!(transport.session_id().as_deref(), Some(SESSION));

    let tools = transport.request("tools/list", json!({})).await?;
    assert_eq!(tools["tools"][0]["name"], json!("search"));
    Ok(())
}

#[tokio::test]
async fn event_stream_response_delivers_notifications_and_answer() -> Result<()> {
    let (_server, url) = start(FakeServer::default()).await?;
    let (transport, mut events) = initialized(&url).await?;

    let result = transport
        .request("tools/call", json!({"name": "search", "arguments": {"q": "rust"}}))
        .await?;
    assert_eq!(result["content"][0]["text"], json!("results for rust"));

    let event = events.try_recv()?;
    assert!(
        matches!(&event, TransportEvent::Notification { method, .. } if method == "notifications/progress"),
        "{event:?}"
    );
    Ok(())
}

#[tokio::test]
async fn accepted_request_is_answered_on_the_get_stream() -> Result<()> {
    let (_server, url) = start(FakeServer::default()).await?;
    let (transport, _events) = initialized(&url).await?;

    let result = transport
        .request("tools/call", json!({"name": "slow_search", "arguments": {}}))
        .await?;
    assert_eq!(result["content"][0]["text"], json!("late answer"));
    Ok(())
}

#[tokio::test]
async fn expired_session_closes_the_transport() -> Result<()> {
    let (server, url) = start(FakeServer::default()).await?;
    let (transport, _events) = initialized(&url).await?;
    server.expired.store(true, Ordering::SeqCst);

    let err = transport.request("tools/list", json!({})).await.unwrap_err();
    assert!(matches!(err, TransportError::Closed(_)), "{err:?}");
    assert!(!transport.is_alive());
    Ok(())
}

#[tokio::test]
async fn close_deletes_the_session() -> Result<()> {
    let (server, url) = start(FakeServer::default()).await?;
    let (transport, _events) = initialized(&url).await?;
    transport.close().await;

    assert_eq!(server.deletes.load(Ordering::SeqCst), 1);
    assert_eq!(server.deleted_session.lock().unwrap().as_deref(), Some(SESSION));
    assert!(!transport.is_alive());
    Ok(())
}

fn provider_config(url: &str, token: Option<&str>) -> McpResolvedServerConfig {
    McpResolvedServerConfig {
        id: "search".into(),
        name: "Web search".into(),
        enabled: true,
        timeout: Duration::from_secs(5),
        transport: TransportConfig::Http(http_config(url, token)),
    }
}

#[tokio::test]
async fn rejected_token_fails_connect_with_auth_kind() -> Result<()> {
    let (_server, url) = start(FakeServer {
        token: Some("right".into()),
        ..FakeServer::default()
    })
    .await?;

    let provider = McpToolProvider::new(provider_config(&url, Some("wrong")));
    let err = provider.connect().await.unwrap_err();
    assert_eq!(err.kind, ConnectErrorKind::AuthRejected);

    let provider = McpToolProvider::new(provider_config(&url, Some("right")));
    provider.connect().await?;
    let names: Vec<_> = provider.tools().await.into_iter().map(|t| t.name).collect();
    assert_eq!(names, vec!["search", "slow_search"]);
    Ok(())
}

#[tokio::test]
async fn provider_invokes_over_http_and_disconnects() -> Result<()> {
    let (server, url) = start(FakeServer::default()).await?;
    let provider = McpToolProvider::new(provider_config(&url, None));
    provider.connect().await?;

    let mut args = serde_json::Map::new();
    args.insert("q".into(), json!("tokio"));
    let result = provider.invoke("search", args).await;
    assert!(!result.is_error, "{}", result.content);
    assert_eq!(result.content, "results for tokio");

    provider.disconnect().await;
    assert_eq!(server.deletes.load(Ordering::SeqCst), 1);
    Ok(())
}
