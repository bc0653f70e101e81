//! Event control plane — long-lived subscription WebSocket server.
//!
//! Clients subscribe to named topics (with `*` wildcard) and receive a
//! `broadcast` envelope for every committed pool mutation on a matching
//! topic. The same action verbs as the synchronous plane are accepted over
//! the open connection and flow into the same pool entry points, so both
//! surfaces observe one state machine.
//!
//! Liveness: a client must ping (or otherwise send a frame) within the
//! configured grace period; silent connections are force-closed. The server
//! pushes `heartbeat` envelopes on its own cadence, and a draining notice
//! before shutdown closes the connection.

pub mod protocol;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::error::PoolError;
use crate::events::{topic, topic_matches};
use crate::AppContext;

use protocol::{BrowserAction, ClientFrame, Envelope, TopicsPayload};

pub async fn run(ctx: Arc<AppContext>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let addr = format!("{}:{}", ctx.config.bind_address, ctx.config.events_port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "event server listening");

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("event server stopping");
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
                debug!(peer = %peer, "event connection");
                let ctx = ctx.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, ctx, shutdown).await {
                        warn!(peer = %peer, err = %e, "event connection error");
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
    let ws = accept_async(stream).await?;
    let (mut sink, mut stream) = ws.split();

    let heartbeat_interval = Duration::from_secs(ctx.config.heartbeat_interval_secs.max(1));
    let grace = Duration::from_secs(ctx.config.client_grace_secs.max(1));

    // Handshake: announce capabilities before anything else.
    sink.send(Message::Text(
        Envelope::connection(ctx.config.heartbeat_interval_secs).to_text(),
    ))
    .await?;

    let mut subscriptions: HashSet<String> = HashSet::new();
    let mut last_seen = Instant::now();
    let mut bus_rx = ctx.bus.subscribe();
    let mut heartbeat = tokio::time::interval(heartbeat_interval);
    heartbeat.tick().await; // skip the immediate tick
    let mut liveness = tokio::time::interval(grace.min(Duration::from_secs(5)));
    liveness.tick().await;

    loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_seen = Instant::now();
                        let replies = handle_frame(&text, &mut subscriptions, &ctx).await;
                        for envelope in replies {
                            if sink.send(Message::Text(envelope.to_text())).await.is_err() {
                                return Ok(());
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        last_seen = Instant::now();
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_seen = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(err = %e, "ws error");
                        break;
                    }
                    _ => {}
                }
            }
            event = bus_rx.recv() => {
                match event {
                    Ok(ev) => {
                        let wanted = subscriptions
                            .iter()
                            .any(|pattern| topic_matches(&ev.topic, pattern));
                        if wanted
                            && sink
                                .send(Message::Text(Envelope::broadcast(&ev).to_text()))
                                .await
                                .is_err()
                        {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event stream lagged");
                        let _ = sink
                            .send(Message::Text(
                                Envelope::error(format!("lagged: {skipped} events dropped"))
                                    .to_text(),
                            ))
                            .await;
                    }
                }
            }
            _ = heartbeat.tick() => {
                if sink
                    .send(Message::Text(Envelope::heartbeat().to_text()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            _ = liveness.tick() => {
                if last_seen.elapsed() > grace {
                    warn!(
                        silent_secs = last_seen.elapsed().as_secs(),
                        "client silent past grace period — closing"
                    );
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    // Draining notice, then forced closure.
                    let notice = Envelope::broadcast(&crate::events::PoolEvent {
                        topic: topic::POOL_DRAINING.to_string(),
                        payload: serde_json::json!({ "reason": "shutdown" }),
                        timestamp: chrono::Utc::now().to_rfc3339(),
                    });
                    let _ = sink.send(Message::Text(notice.to_text())).await;
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    }
    Ok(())
}

/// Handle one client frame and produce the replies to send.
/// Crate-visible so tests can drive the plane without a socket.
pub async fn handle_frame(
    text: &str,
    subscriptions: &mut HashSet<String>,
    ctx: &AppContext,
) -> Vec<Envelope> {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => return vec![Envelope::error(format!("invalid frame: {e}"))],
    };

    match frame.kind.as_str() {
        "ping" => vec![Envelope::pong()],
        "pong" => Vec::new(),
        "subscribe" => {
            let topics: TopicsPayload = match serde_json::from_value(frame.payload) {
                Ok(t) => t,
                Err(e) => return vec![Envelope::error(format!("invalid subscribe: {e}"))],
            };
            for t in &topics.topics {
                subscriptions.insert(t.clone());
            }
            vec![Envelope::subscribed(&topics.topics)]
        }
        "unsubscribe" => {
            let topics: TopicsPayload = match serde_json::from_value(frame.payload) {
                Ok(t) => t,
                Err(e) => return vec![Envelope::error(format!("invalid unsubscribe: {e}"))],
            };
            for t in &topics.topics {
                subscriptions.remove(t);
            }
            vec![Envelope::unsubscribed(&topics.topics)]
        }
        "get-stats" => {
            let stats = ctx.pool.stats().await;
            vec![Envelope::stats(
                serde_json::to_value(stats).unwrap_or_default(),
            )]
        }
        "browser-action" => {
            let request_id = protocol::request_id_of(&frame.payload);
            let action: BrowserAction = match serde_json::from_value(frame.payload) {
                Ok(a) => a,
                Err(e) => {
                    return vec![Envelope::action_result(
                        request_id,
                        Err(("invalid_action".to_string(), e.to_string())),
                    )]
                }
            };
            let result = execute_action(action, ctx)
                .await
                .map_err(|e| (e.code().to_string(), e.to_string()));
            vec![Envelope::action_result(request_id, result)]
        }
        other => vec![Envelope::error(format!("unknown message type '{other}'"))],
    }
}

/// Route an action verb into the pool — the same entry points the
/// synchronous plane calls, so state transitions and broadcasts match.
pub async fn execute_action(action: BrowserAction, ctx: &AppContext) -> Result<Value, PoolError> {
    match action {
        BrowserAction::CreateSession { owner_id, metadata } => {
            let view = ctx.pool.create_session(owner_id, metadata).await?;
            Ok(serde_json::to_value(view).unwrap_or_default())
        }
        BrowserAction::CreatePage { session_id, url } => {
            let page_id = ctx.pool.create_page(&session_id, url.as_deref()).await?;
            Ok(serde_json::json!({ "pageId": page_id, "sessionId": session_id }))
        }
        BrowserAction::Navigate {
            session_id,
            page_id,
            url,
            timeout_ms,
        } => {
            let nav = ctx
                .pool
                .navigate(&session_id, &page_id, &url, timeout_ms)
                .await?;
            Ok(serde_json::json!({ "url": nav.url, "title": nav.title }))
        }
        BrowserAction::Click {
            session_id,
            page_id,
            selector,
        } => {
            ctx.pool.click(&session_id, &page_id, &selector).await?;
            Ok(serde_json::json!({}))
        }
        BrowserAction::Type {
            session_id,
            page_id,
            selector,
            text,
        } => {
            ctx.pool
                .type_text(&session_id, &page_id, &selector, &text)
                .await?;
            Ok(serde_json::json!({}))
        }
    }
}
