//! Per-connection read and write pumps.
//!
//! The reader owns the socket's stream half and the writer its sink half.
//! Whichever stops first cancels the shared token, the reader then sends
//! exactly one `Unregister`, and `run` returns only after both have exited.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitStream;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use roomcast_core::{ConversationId, Envelope, UserId};

use crate::broker::{publish_envelope, Broker};
use crate::hub::{ConnState, HubLink, Outbox, Source};
use crate::obs::GatewayMetrics;

/// Everything a session needs besides its socket and outbox.
#[derive(Clone)]
pub struct SessionCtx {
    pub hub: HubLink,
    /// Set when socket traffic is also republished for other instances.
    pub republish: Option<Republish>,
    pub metrics: Arc<GatewayMetrics>,
    pub ping_every: Duration,
    pub read_deadline: Duration,
    pub write_timeout: Duration,
}

#[derive(Clone)]
pub struct Republish {
    pub broker: Arc<dyn Broker>,
    pub topic_prefix: String,
    pub instance_id: Arc<str>,
}

pub async fn run(socket: WebSocket, outbox: Outbox, ctx: SessionCtx) {
    let span = tracing::info_span!(
        "session",
        conversation = %outbox.conversation_id,
        user = %outbox.user_id,
        conn = %outbox.id,
    );

    async move {
        let id = outbox.id;
        let user = outbox.user_id.clone();
        let conversation = outbox.conversation_id.clone();
        let closer = outbox.closer().clone();
        let mut state = ConnState::Registered;

        let (sink, mut stream) = socket.split();
        let writer = tokio::spawn(
            write_pump(sink, outbox, ctx.ping_every, ctx.write_timeout).in_current_span(),
        );

        read_pump(&mut stream, &ctx, &user, &conversation, &closer, &mut state).await;

        state = state.advance(ConnState::Closing);
        closer.cancel();
        if ctx.hub.unregister(conversation, id).await.is_err() {
            tracing::debug!("hub already stopped");
        }
        if let Err(e) = writer.await {
            tracing::error!(error = %e, "write pump failed");
        }
        state.advance(ConnState::Closed);
        tracing::info!("connection closed");
    }
    .instrument(span)
    .await
}

async fn read_pump(
    stream: &mut SplitStream<WebSocket>,
    ctx: &SessionCtx,
    user: &UserId,
    conversation: &ConversationId,
    closer: &CancellationToken,
    state: &mut ConnState,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = closer.cancelled() => return,
            r = tokio::time::timeout(ctx.read_deadline, stream.next()) => r,
        };

        let msg = match next {
            Err(_) => {
                tracing::warn!(deadline_ms = ctx.read_deadline.as_millis() as u64, "read deadline expired");
                return;
            }
            Ok(None) => return,
            Ok(Some(Err(e))) => {
                tracing::debug!(error = %e, "socket read failed");
                return;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        match super::codec::decode(msg) {
            Ok(super::codec::Inbound::Envelope(mut env)) => {
                *state = state.advance(ConnState::Active);
                env.stamp(user, conversation);
                env.normalize();
                if submit(env, ctx).await.is_err() {
                    tracing::warn!("hub stopped, closing connection");
                    return;
                }
            }
            Ok(super::codec::Inbound::Ping | super::codec::Inbound::Pong) => {}
            Ok(super::codec::Inbound::Close) => return,
            Err(e) => {
                ctx.metrics.decode_errors.inc(&[("source", "socket")]);
                tracing::debug!(error = %e, code = e.client_code().as_str(), "dropping malformed frame");
            }
        }
    }
}

/// Local fan-out first, then the broker copy for other instances.
async fn submit(env: Envelope, ctx: &SessionCtx) -> roomcast_core::Result<()> {
    let copy = ctx.republish.as_ref().map(|r| {
        let mut out = env.clone();
        out.origin = Some(r.instance_id.to_string());
        out
    });

    ctx.hub.dispatch(env, Source::Socket).await?;

    if let (Some(r), Some(out)) = (&ctx.republish, copy) {
        match publish_envelope(r.broker.as_ref(), &r.topic_prefix, &out).await {
            Ok(()) => ctx.metrics.broker_publish.inc(&[("result", "ok")]),
            Err(e) => {
                ctx.metrics.broker_publish.inc(&[("result", "error")]);
                tracing::warn!(error = %e, "republish failed");
            }
        }
    }
    Ok(())
}

/// Drains the outbox into `sink`. Once the closer fires nothing queued is
/// written: an evicted or departing connection only gets the close frame.
async fn write_pump<S>(mut sink: S, mut outbox: Outbox, ping_every: Duration, write_timeout: Duration)
where
    S: Sink<Message> + Unpin,
{
    let closer = outbox.closer().clone();
    let mut ping = tokio::time::interval_at(Instant::now() + ping_every, ping_every);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = closer.cancelled() => break,
            frame = outbox.recv() => {
                let Some(frame) = frame else {
                    break;
                };
                if closer.is_cancelled() {
                    break;
                }
                if let Err(why) = send(&mut sink, Message::Text(frame.to_string()), write_timeout).await {
                    tracing::debug!(reason = why, "write failed");
                    closer.cancel();
                    return;
                }
                ping.reset();
            }
            _ = ping.tick() => {
                if let Err(why) = send(&mut sink, Message::Ping(Vec::new()), write_timeout).await {
                    tracing::debug!(reason = why, "keep-alive failed");
                    closer.cancel();
                    return;
                }
            }
        }
    }

    let _ = send(&mut sink, Message::Close(None), write_timeout).await;
    let _ = sink.close().await;
}

async fn send<S>(sink: &mut S, msg: Message, write_timeout: Duration) -> std::result::Result<(), &'static str>
where
    S: Sink<Message> + Unpin,
{
    match tokio::time::timeout(write_timeout, sink.send(msg)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err("write_error"),
        Err(_) => Err("write_timeout"),
    }
}
