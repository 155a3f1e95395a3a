//! Per-room bridge: broker topic -> registry dispatch.
//!
//! One task per open room. It reports the initial subscription outcome to the
//! registry (which holds the room's first joins until then), then forwards
//! every decodable payload as a `Dispatch`. A lost broker connection is
//! retried with a fixed backoff until the room's token is cancelled.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use roomcast_core::{ConversationId, Envelope};

use crate::hub::{HubLink, Source};
use crate::obs::GatewayMetrics;

use super::{Broker, Subscription};

pub(crate) struct BridgeSpec {
    pub conversation: ConversationId,
    pub topic: String,
    pub generation: u64,
    pub instance_id: Arc<str>,
    pub backoff: Duration,
}

enum Exit {
    Cancelled,
    StreamEnded,
    HubGone,
}

#[tracing::instrument(
    name = "bridge",
    skip_all,
    fields(conversation = %spec.conversation, generation = spec.generation)
)]
pub(crate) async fn run_bridge(
    broker: Arc<dyn Broker>,
    hub: HubLink,
    spec: BridgeSpec,
    cancel: CancellationToken,
    metrics: Arc<GatewayMetrics>,
) {
    let first = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        res = broker.subscribe(&spec.topic) => res,
    };

    let mut sub = match first {
        Ok(sub) => sub,
        Err(e) => {
            tracing::warn!(topic = %spec.topic, error = %e, "broker subscribe failed");
            let _ = hub
                .subscription_ready(spec.conversation.clone(), spec.generation, Err(e))
                .await;
            return;
        }
    };

    if hub
        .subscription_ready(spec.conversation.clone(), spec.generation, Ok(()))
        .await
        .is_err()
    {
        return;
    }

    metrics.broker_subscriptions_active.inc(&[]);
    tracing::debug!(topic = %sub.topic(), "bridge subscribed");

    loop {
        match pump(&mut sub, &hub, &spec, &cancel, &metrics).await {
            Exit::Cancelled | Exit::HubGone => break,
            Exit::StreamEnded => {
                tracing::warn!(topic = %spec.topic, "broker subscription lost, resubscribing");
                match resubscribe(broker.as_ref(), &spec, &cancel).await {
                    Some(next) => sub = next,
                    None => break,
                }
            }
        }
    }

    metrics.broker_subscriptions_active.dec(&[]);
    tracing::debug!(topic = %spec.topic, "bridge stopped");
}

async fn pump(
    sub: &mut Subscription,
    hub: &HubLink,
    spec: &BridgeSpec,
    cancel: &CancellationToken,
    metrics: &GatewayMetrics,
) -> Exit {
    loop {
        let payload = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Exit::Cancelled,
            p = sub.next() => p,
        };
        let Some(payload) = payload else {
            return Exit::StreamEnded;
        };

        let env = match Envelope::decode_bytes(&payload) {
            Ok(env) => env,
            Err(e) => {
                metrics.decode_errors.inc(&[("source", "broker")]);
                tracing::warn!(topic = %spec.topic, error = %e, "dropping undecodable broker payload");
                continue;
            }
        };

        if env.conversation_id != spec.conversation {
            tracing::warn!(
                topic = %spec.topic,
                claimed = %env.conversation_id,
                "dropping envelope addressed to another conversation"
            );
            continue;
        }

        // Already fanned out locally before it was republished.
        if env.origin.as_deref() == Some(&*spec.instance_id) {
            continue;
        }

        if hub.dispatch(env, Source::Broker).await.is_err() {
            return Exit::HubGone;
        }
    }
}

async fn resubscribe(broker: &dyn Broker, spec: &BridgeSpec, cancel: &CancellationToken) -> Option<Subscription> {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(spec.backoff) => {}
        }

        let res = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            res = broker.subscribe(&spec.topic) => res,
        };
        match res {
            Ok(sub) => {
                tracing::info!(topic = %spec.topic, "broker subscription restored");
                return Some(sub);
            }
            Err(e) => tracing::warn!(topic = %spec.topic, error = %e, "resubscribe failed"),
        }
    }
}
