//! Synchronous control plane — JSON-RPC 2.0 over WebSocket.
//!
//! Every method is a direct, blocking mapping onto a pool operation; every
//! failure resolves to a typed error code with a human-readable message.
//! Committed pool mutations are also forwarded to connected clients as
//! JSON-RPC notifications, so this surface observes the same event stream
//! as the event plane.
//!
//! The listener additionally answers plain HTTP `GET /health` and
//! `GET /ready` so probes work without a WebSocket library.

pub mod handlers;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::error::PoolError;
use crate::AppContext;

// ─── JSON-RPC 2.0 types ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RpcRequest {
    jsonrpc: String,
    id: Option<Value>,
    method: String,
    params: Option<Value>,
}

#[derive(Serialize)]
struct RpcResponse {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

#[derive(Serialize)]
struct RpcError {
    code: i32,
    message: String,
}

// ─── Error codes ─────────────────────────────────────────────────────────────

const PARSE_ERROR: i32 = -32700;
const INVALID_REQUEST: i32 = -32600;
const METHOD_NOT_FOUND: i32 = -32601;
const INVALID_PARAMS: i32 = -32602;
const INTERNAL_ERROR: i32 = -32603;

/// Session or page unknown — already reaped or a caller bug; never retried.
const NOT_FOUND: i32 = -32001;
/// Pool at capacity — caller should back off and retry.
const RESOURCE_EXHAUSTED: i32 = -32002;
/// Navigation failed or timed out; the session survives.
const NAVIGATION_FAILED: i32 = -32003;
/// Caller-supplied script failed in the page context.
const SCRIPT_FAILED: i32 = -32004;
/// The daemon is shutting down.
const DRAINING: i32 = -32005;
/// Engine could not be launched or went away.
const ENGINE_FAILURE: i32 = -32006;

/// How a handler fails: bad request shape, unknown method, or a typed
/// pool error.
pub enum RpcFailure {
    InvalidParams(String),
    MethodNotFound(String),
    Pool(PoolError),
}

impl From<PoolError> for RpcFailure {
    fn from(err: PoolError) -> Self {
        Self::Pool(err)
    }
}

impl RpcFailure {
    fn code_and_message(&self) -> (i32, String) {
        match self {
            Self::InvalidParams(msg) => (INVALID_PARAMS, format!("Invalid params: {msg}")),
            Self::MethodNotFound(method) => {
                (METHOD_NOT_FOUND, format!("Method not found: {method}"))
            }
            Self::Pool(err) => {
                let code = match err {
                    PoolError::NotFound { .. } => NOT_FOUND,
                    PoolError::CapacityExceeded { .. } => RESOURCE_EXHAUSTED,
                    PoolError::NavigationTimeout { .. } | PoolError::NavigationFailure(_) => {
                        NAVIGATION_FAILED
                    }
                    PoolError::ScriptFailure(_) => SCRIPT_FAILED,
                    PoolError::Draining => DRAINING,
                    PoolError::EngineLaunchFailure(_) => ENGINE_FAILURE,
                    PoolError::Internal(_) => INTERNAL_ERROR,
                };
                (code, err.to_string())
            }
        }
    }
}

/// Parse handler params, mapping deserialization failures to INVALID_PARAMS.
pub(crate) fn parse_params<T: serde::de::DeserializeOwned>(
    params: Value,
) -> Result<T, RpcFailure> {
    serde_json::from_value(params).map_err(|e| RpcFailure::InvalidParams(e.to_string()))
}

// ─── Server ──────────────────────────────────────────────────────────────────

pub async fn run(ctx: Arc<AppContext>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let addr = format!("{}:{}", ctx.config.bind_address, ctx.config.rpc_port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "rpc server listening (WebSocket + HTTP health on same port)");

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("rpc server stopping");
                    return Ok(());
                }
            }

            conn = listener.accept() => {
                let (stream, peer) = match conn {
                    Ok(c) => c,
                    Err(e) => {
                        error!(err = %e, "accept error");
                        continue;
                    }
                };
                debug!(peer = %peer, "rpc connection");
                let ctx = ctx.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, ctx, shutdown).await {
                        warn!(peer = %peer, err = %e, "rpc connection error");
                    }
                });
            }
        }
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    ctx: Arc<AppContext>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    // Peek to distinguish plain-HTTP probes from WebSocket upgrades — both
    // arrive as GET on the same port.
    let mut peek_buf = [0u8; 16];
    let n = stream.peek(&mut peek_buf).await.unwrap_or(0);
    if n >= 11 && &peek_buf[..11] == b"GET /health" {
        return respond_health(stream, &ctx).await;
    }
    if n >= 10 && &peek_buf[..10] == b"GET /ready" {
        return respond_ready(stream, &ctx).await;
    }

    let ws = accept_async(stream).await?;
    let (mut sink, mut stream) = ws.split();
    let mut bus_rx = ctx.bus.subscribe();

    loop {
        tokio::select! {
            // Incoming request from the caller.
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let response = dispatch_text(&text, &ctx).await;
                        if let Err(e) = sink.send(Message::Text(response)).await {
                            warn!(err = %e, "send error");
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(err = %e, "ws error");
                        break;
                    }
                    _ => {}
                }
            }
            // Committed pool mutation — forward as a notification.
            event = bus_rx.recv() => {
                match event {
                    Ok(ev) => {
                        let notification = serde_json::json!({
                            "jsonrpc": "2.0",
                            "method": ev.topic,
                            "params": ev.payload,
                        });
                        if sink.send(Message::Text(notification.to_string())).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event forwarding lagged");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    }
    Ok(())
}

/// Parse one request text frame, dispatch it, and serialize the response.
/// Exposed within the crate so tests can drive the plane without a socket.
pub async fn dispatch_text(text: &str, ctx: &AppContext) -> String {
    let req: RpcRequest = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(_) => return error_response(Value::Null, PARSE_ERROR, "Parse error"),
    };

    if req.jsonrpc != "2.0" {
        return error_response(
            req.id.unwrap_or(Value::Null),
            INVALID_REQUEST,
            "Invalid Request",
        );
    }

    let id = req.id.unwrap_or(Value::Null);
    let params = req.params.unwrap_or(Value::Null);

    debug!(method = %req.method, "rpc dispatch");

    match dispatch(&req.method, params, ctx).await {
        Ok(value) => {
            let resp = RpcResponse {
                jsonrpc: "2.0",
                id,
                result: Some(value),
                error: None,
            };
            serde_json::to_string(&resp).unwrap_or_default()
        }
        Err(failure) => {
            let (code, message) = failure.code_and_message();
            error_response(id, code, &message)
        }
    }
}

async fn dispatch(method: &str, params: Value, ctx: &AppContext) -> Result<Value, RpcFailure> {
    match method {
        "session.acquire" => handlers::session::acquire(params, ctx).await,
        "session.release" => handlers::session::release(params, ctx).await,
        "session.info" => handlers::session::info(params, ctx).await,
        "session.list" => handlers::session::list(params, ctx).await,
        "page.create" => handlers::page::create(params, ctx).await,
        "page.close" => handlers::page::close(params, ctx).await,
        "page.info" => handlers::page::info(params, ctx).await,
        "page.navigate" => handlers::page::navigate(params, ctx).await,
        "page.evaluate" => handlers::page::evaluate(params, ctx).await,
        "page.click" => handlers::page::click(params, ctx).await,
        "page.type" => handlers::page::type_text(params, ctx).await,
        "page.screenshot" => handlers::page::screenshot(params, ctx).await,
        "page.content" => handlers::page::content(params, ctx).await,
        "page.waitFor" => handlers::page::wait_for(params, ctx).await,
        "pool.stats" => handlers::pool::stats(params, ctx).await,
        "pool.health" => handlers::pool::health(params, ctx).await,
        _ => Err(RpcFailure::MethodNotFound(method.to_string())),
    }
}

fn error_response(id: Value, code: i32, message: &str) -> String {
    let resp = RpcResponse {
        jsonrpc: "2.0",
        id,
        result: None,
        error: Some(RpcError {
            code,
            message: message.to_string(),
        }),
    };
    serde_json::to_string(&resp).unwrap_or_default()
}

// ─── HTTP probes ─────────────────────────────────────────────────────────────

async fn respond_health(stream: tokio::net::TcpStream, ctx: &AppContext) -> Result<()> {
    let stats = ctx.pool.stats().await;
    let health = crate::health::evaluate(&stats);
    let body = serde_json::json!({
        "status": health.status.to_string(),
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": ctx.started_at.elapsed().as_secs(),
        "activeSessions": stats.active_sessions,
    });
    write_http_json(stream, &body).await
}

async fn respond_ready(stream: tokio::net::TcpStream, ctx: &AppContext) -> Result<()> {
    let stats = ctx.pool.stats().await;
    let health = crate::health::evaluate(&stats);
    let body = serde_json::json!({
        "ready": health.ready,
        "availableSlots": stats.available_slots,
        "activeSessions": stats.active_sessions,
    });
    write_http_json(stream, &body).await
}

async fn write_http_json(mut stream: tokio::net::TcpStream, body: &Value) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    // Consume the request — any GET on a probe path is fine.
    let mut req_buf = vec![0u8; 2048];
    let _ = stream.read(&mut req_buf).await;

    let body_str = body.to_string();
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body_str.len(),
        body_str
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}
