//! Write loop of a WebSocket session.

use std::sync::Arc;
use std::time::Duration;

use metrics::histogram;
use parley_telemetry::metrics::WRITE_DURATION_SECONDS;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, instrument};

use super::{Frame, FrameSink};
use crate::context::ServerContext;
use crate::errors::TransportError;
use crate::session::{PairOutcome, Session, SessionQueues};

/// Drain the session's mailboxes onto `sink` until the session stops, a
/// write fails or the outbound mailbox closes. Always closes the sink and
/// terminates the session on the way out, which also ends the reader.
#[instrument(skip_all, fields(session_id = %sess.id()))]
pub async fn run<S: FrameSink>(ctx: ServerContext, sess: Arc<Session>, mut queues: SessionQueues, mut sink: S) {
    let wait = ctx.config.write_wait;

    let outcome = if ctx.config.pairing {
        pair(&ctx, &sess, &mut sink, wait).await
    } else {
        Ok(())
    };
    let outcome = match outcome {
        Ok(()) => pump(&sess, &mut queues, &mut sink, wait, ctx.config.ping_period).await,
        Err(e) => Err(e),
    };

    match outcome {
        Ok(()) => debug!("writer stopped"),
        Err(e) => debug!(error = %e, "writer failed"),
    }
    if let Err(e) = sink.close().await {
        debug!(error = %e, "close failed");
    }
    sess.terminate();
}

/// Exchange session ids with whoever is waiting in the pairing slot.
async fn pair<S: FrameSink>(
    ctx: &ServerContext,
    sess: &Arc<Session>,
    sink: &mut S,
    wait: Duration,
) -> Result<(), TransportError> {
    match ctx.sessions.pair(sess) {
        PairOutcome::Waiting => debug!("waiting for a pairing partner"),
        PairOutcome::Matched(partner) => {
            debug!(partner = %partner.id(), "paired");
            write(sink, Frame::Text(Arc::from(partner.id().as_str())), wait).await?;
            if partner.try_queue_out(Arc::from(sess.id().as_str())).is_err() {
                debug!(partner = %partner.id(), "partner could not take our id");
            }
        }
    }
    Ok(())
}

async fn pump<S: FrameSink>(
    sess: &Session,
    queues: &mut SessionQueues,
    sink: &mut S,
    wait: Duration,
    ping_period: Duration,
) -> Result<(), TransportError> {
    let mut ping = interval_at(Instant::now() + ping_period, ping_period);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            Some(last) = queues.stop.recv() => {
                if let Some(frame) = last {
                    // Best effort: the connection is going away either way.
                    let _ = write(sink, Frame::Text(frame), wait).await;
                }
                return Ok(());
            }
            Some(detach) = queues.detach.recv() => sess.apply_detach(&detach),
            frame = queues.send.recv() => match frame {
                Some(frame) => write(sink, Frame::Text(frame), wait).await?,
                None => return Ok(()),
            },
            _ = ping.tick() => write(sink, Frame::Ping, wait).await?,
            () = sess.closed() => return Ok(()),
        }
    }
}

async fn write<S: FrameSink>(sink: &mut S, frame: Frame, wait: Duration) -> Result<(), TransportError> {
    let started = Instant::now();
    let result = match timeout(wait, sink.send_frame(frame)).await {
        Ok(sent) => sent,
        Err(_) => Err(TransportError::WriteTimeout(wait)),
    };
    histogram!(WRITE_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
    result
}
