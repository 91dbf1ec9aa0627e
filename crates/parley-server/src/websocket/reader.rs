//! Read loop of a WebSocket session.

use std::sync::Arc;

use axum::extract::ws::Message;
use futures::{Stream, StreamExt};
use tokio::time::timeout;
use tracing::{debug, instrument};

use crate::context::ServerContext;
use crate::errors::TransportError;
use crate::session::dispatch::dispatch_raw;
use crate::session::Session;

/// Read frames until the peer goes away, the read deadline passes or the
/// session is closed elsewhere, then tear the session down.
#[instrument(skip_all, fields(session_id = %sess.id()))]
pub async fn run<R>(ctx: ServerContext, sess: Arc<Session>, mut stream: R)
where
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    match read_loop(&ctx, &sess, &mut stream).await {
        Ok(()) => debug!("reader stopped"),
        Err(e) => debug!(error = %e, "reader failed"),
    }

    sess.terminate();
    let _ = ctx.sessions.delete(&sess);
    sess.leave_all().await;
}

async fn read_loop<R>(ctx: &ServerContext, sess: &Arc<Session>, stream: &mut R) -> Result<(), TransportError>
where
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let deadline = ctx.config.pong_wait;
    let limit = ctx.config.max_message_size;

    loop {
        let next = tokio::select! {
            () = sess.closed() => return Ok(()),
            next = timeout(deadline, stream.next()) => next,
        };
        let msg = match next {
            Err(_) => return Err(TransportError::ReadTimeout(deadline)),
            Ok(None) => return Err(TransportError::Closed),
            Ok(Some(msg)) => msg?,
        };

        let raw: &[u8] = match &msg {
            Message::Text(text) => text.as_bytes(),
            Message::Binary(data) => &data[..],
            // Only refresh the deadline.
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => return Ok(()),
        };
        if raw.len() > limit {
            return Err(TransportError::FrameTooLarge { size: raw.len(), limit });
        }
        dispatch_raw(ctx, sess, raw).await;
    }
}
