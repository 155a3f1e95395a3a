//! Decode-once codec for the socket side.
//!
//! - Text frames => validated `Envelope` of a client-originated kind
//! - Binary frames are a protocol error (the wire format is JSON text)
//! - Ping/Pong/Close are surfaced for lifecycle management

use axum::extract::ws::Message;
use roomcast_core::{
    error::{Result, RoomcastError},
    Envelope,
};

#[derive(Debug)]
pub enum Inbound {
    Envelope(Envelope),
    Ping,
    Pong,
    Close,
}

pub fn decode(msg: Message) -> Result<Inbound> {
    match msg {
        Message::Text(s) => {
            let env = Envelope::decode(&s)?;
            if !env.kind.is_client_originated() {
                return Err(RoomcastError::BadRequest(format!(
                    "kind {} is reserved for the server",
                    env.kind.as_str()
                )));
            }
            Ok(Inbound::Envelope(env))
        }
        Message::Binary(b) => Err(RoomcastError::BadRequest(format!(
            "binary frames are not supported ({} bytes)",
            b.len()
        ))),
        Message::Ping(_) => Ok(Inbound::Ping),
        Message::Pong(_) => Ok(Inbound::Pong),
        Message::Close(_) => Ok(Inbound::Close),
    }
}
