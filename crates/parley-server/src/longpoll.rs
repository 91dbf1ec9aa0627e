//! Long-poll transport on `/v0/channels/lp`.
//!
//! A request without `sid` opens a session. `POST ?sid=` carries one client
//! message; `GET ?sid=` waits for outbound traffic and returns every queued
//! frame as a JSON array. The session has no connection of its own, so it
//! stays alive only while requests keep touching it.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use parley_core::protocol::ServerMessage;
use serde::Deserialize;
use serde_json::json;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::context::ServerContext;
use crate::session::dispatch::dispatch_raw;
use crate::session::{Session, Transport};

#[derive(Debug, Default, Deserialize)]
pub struct LongPollParams {
    pub sid: Option<String>,
}

/// `POST /v0/channels/lp`
pub async fn lp_post(
    State(ctx): State<ServerContext>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<LongPollParams>,
    body: Bytes,
) -> Response {
    let Some(sid) = params.sid else {
        return open(&ctx, addr);
    };
    let Some(sess) = ctx.sessions.get(&sid) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if body.len() > ctx.config.max_message_size {
        debug!(session_id = %sid, size = body.len(), "long-poll body too large");
        return StatusCode::PAYLOAD_TOO_LARGE.into_response();
    }
    dispatch_raw(&ctx, &sess, &body).await;
    StatusCode::ACCEPTED.into_response()
}

/// `GET /v0/channels/lp`
pub async fn lp_get(
    State(ctx): State<ServerContext>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<LongPollParams>,
) -> Response {
    let Some(sid) = params.sid else {
        return open(&ctx, addr);
    };
    let Some(sess) = ctx.sessions.get(&sid) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    poll(&ctx, &sess).await
}

fn open(ctx: &ServerContext, addr: SocketAddr) -> Response {
    let sess = ctx.sessions.create(
        Transport::LongPoll {
            remote_addr: Some(addr),
        },
        None,
    );
    let reply = ServerMessage::created(None, None).with_params(json!({ "sid": sess.id() }));
    match reply.encode() {
        Ok(frame) => json_response(StatusCode::OK, frame.to_string()),
        Err(e) => {
            warn!(error = %e, "failed to encode long-poll handshake");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Wait for the first outbound frame, then take whatever else is queued.
/// Concurrent polls on one session take turns on the mailboxes.
async fn poll(ctx: &ServerContext, sess: &Arc<Session>) -> Response {
    let mut guard = sess.queues().lock().await;
    let Some(queues) = guard.as_mut() else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let mut frames: Vec<Arc<str>> = Vec::new();
    let mut stopped = false;
    let deadline = sleep(ctx.config.long_poll_wait);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            biased;
            Some(last) = queues.stop.recv() => {
                frames.extend(last);
                stopped = true;
                break;
            }
            Some(detach) = queues.detach.recv() => sess.apply_detach(&detach),
            Some(frame) = queues.send.recv() => {
                frames.push(frame);
                break;
            }
            () = sess.closed() => break,
            () = &mut deadline => break,
        }
    }
    while let Ok(frame) = queues.send.try_recv() {
        frames.push(frame);
    }
    while let Ok(detach) = queues.detach.try_recv() {
        sess.apply_detach(&detach);
    }
    drop(guard);

    if stopped {
        sess.terminate();
        let _ = ctx.sessions.delete(sess);
        sess.leave_all().await;
    }

    if frames.is_empty() {
        return if sess.is_closed() {
            StatusCode::NOT_FOUND.into_response()
        } else {
            StatusCode::NO_CONTENT.into_response()
        };
    }
    // Frames are already encoded JSON objects.
    let mut body = String::with_capacity(frames.iter().map(|f| f.len() + 1).sum::<usize>() + 1);
    body.push('[');
    for (i, frame) in frames.iter().enumerate() {
        if i > 0 {
            body.push(',');
        }
        body.push_str(frame);
    }
    body.push(']');
    json_response(StatusCode::OK, body)
}

fn json_response(status: StatusCode, body: String) -> Response {
    (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
}
