//! WebSocket upgrade handler.
//!
//! Every admission check runs before the upgrade response, including the
//! hub registration itself: a conversation whose broker subscription cannot
//! be established fails the HTTP request instead of yielding a socket that
//! would never receive anything.

use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::{header::ORIGIN, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::Deserialize;
use serde_json::json;

use roomcast_core::error::{ClientCode, Result, RoomcastError};
use roomcast_core::ConversationId;

use crate::app_state::AppState;
use crate::context::AuthenticatedUser;
use crate::hub::{open_connection, Outbox};
use crate::transport::session;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub conversation_id: Option<String>,
}

pub async fn ws_upgrade(
    State(app): State<AppState>,
    identity: Option<Extension<AuthenticatedUser>>,
    headers: HeaderMap,
    Query(q): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let outbox = match admit(&app, identity, &headers, q).await {
        Ok(outbox) => outbox,
        Err(e) => {
            let code = e.client_code();
            app.metrics().ws_upgrades.inc(&[("result", code.as_str())]);
            tracing::info!(code = code.as_str(), error = %e, "upgrade rejected");
            return reject(code, &e);
        }
    };
    app.metrics().ws_upgrades.inc(&[("result", "accepted")]);

    let hub = app.hub().link();
    let conversation = outbox.conversation_id.clone();
    let id = outbox.id;
    let ctx = app.session_ctx();
    let max = app.cfg().gateway.max_frame_bytes;

    ws.max_message_size(max)
        .max_frame_size(max)
        .on_failed_upgrade(move |e| {
            tracing::warn!(error = %e, conn = %id, "websocket upgrade failed");
            tokio::spawn(async move {
                let _ = hub.unregister(conversation, id).await;
            });
        })
        .on_upgrade(move |socket| session::run(socket, outbox, ctx))
}

async fn admit(
    app: &AppState,
    identity: Option<Extension<AuthenticatedUser>>,
    headers: &HeaderMap,
    q: WsQuery,
) -> Result<Outbox> {
    if app.is_draining() {
        return Err(RoomcastError::Unavailable("draining".into()));
    }

    let origin = headers.get(ORIGIN).and_then(|v| v.to_str().ok());
    if !app.origins().is_allowed(origin) {
        tracing::warn!(origin = origin.unwrap_or("<none>"), "origin not allowed");
        return Err(RoomcastError::OriginRejected);
    }

    let Some(Extension(AuthenticatedUser(user))) = identity else {
        return Err(RoomcastError::Unauthorized);
    };

    let raw = q
        .conversation_id
        .ok_or_else(|| RoomcastError::BadRequest("missing conversation_id".into()))?;
    let conversation = ConversationId::parse(raw)?;

    let (handle, outbox) = open_connection(user, conversation, app.cfg().hub.outbox_capacity);
    app.hub().register(handle).await?;
    Ok(outbox)
}

fn status_for(code: ClientCode) -> StatusCode {
    match code {
        ClientCode::BadRequest => StatusCode::BAD_REQUEST,
        ClientCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ClientCode::OriginRejected => StatusCode::FORBIDDEN,
        ClientCode::Broker | ClientCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ClientCode::UnsupportedVersion | ClientCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(code: ClientCode, err: &RoomcastError) -> Response {
    let body = json!({
        "code": code.as_str(),
        "msg": err.to_string(),
    });
    (status_for(code), Json(body)).into_response()
}
