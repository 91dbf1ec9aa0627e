use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use futures::StreamExt;
use tracing::{info, warn};

use super::{reader, writer};
use crate::context::ServerContext;
use crate::session::Transport;

/// `GET /v0/channels`: upgrade and run the session until either side quits.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(ctx): State<ServerContext>,
) -> Response {
    let limit = ctx.config.max_message_size;
    ws.max_message_size(limit)
        .on_upgrade(move |socket| handle_socket(ctx, socket, addr))
}

async fn handle_socket(ctx: ServerContext, socket: WebSocket, addr: SocketAddr) {
    let sess = ctx.sessions.create(
        Transport::WebSocket {
            remote_addr: Some(addr),
        },
        None,
    );
    info!(session_id = %sess.id(), remote = %addr, "websocket session opened");

    let Some(queues) = sess.take_queues().await else {
        warn!(session_id = %sess.id(), "session has no mailboxes");
        let _ = ctx.sessions.delete(&sess);
        return;
    };
    let (sink, stream) = socket.split();

    let writer = tokio::spawn(writer::run(ctx.clone(), Arc::clone(&sess), queues, sink));
    reader::run(ctx, Arc::clone(&sess), stream).await;
    let _ = writer.await;
    info!(session_id = %sess.id(), "websocket session closed");
}
