//! tinySIP: a single-threaded SIP user-agent core for embedded WiFi phone
//! firmware.
//!
//! The crate exposes one cooperative object, [`Engine`], built with
//! [`EngineBuilder`]. Outbound actions (`register`, `start_call`,
//! `accept_call`, ...) queue or send a request immediately; inbound
//! processing and timer work all happen inside [`Engine::poll`], which the
//! caller drives from its own loop and which returns a bitmask of what
//! happened (`EVENT_*` constants in [`message`]).
//!
//! No async runtime and no background thread: everything is driven by
//! repeated `poll(now_ms)` calls over non-blocking sockets, the way the
//! embedded target this was built for runs its own loop.

pub mod auth_state;
pub mod connection;
pub mod dialog;
pub mod digest;
pub mod engine;
pub mod error;
pub mod hash;
pub mod message;
pub mod parser;
pub mod route;
pub mod sdp;
pub mod uri;

pub use connection::TransportKind;
pub use engine::{Engine, EngineBuilder};
pub use error::{Error, Result};
pub use message::{
    MessageTimestamp, TextMessage, EVENT_CALL_CONFIRMED, EVENT_CALL_TERMINATED,
    EVENT_CONNECTION_ERROR, EVENT_INCOMING_CALL, EVENT_INCOMING_MESSAGE, EVENT_INVITE_TIMEOUT,
    EVENT_MORE_BUFFER, EVENT_NONE, EVENT_PONGED, EVENT_REGISTERED, EVENT_REQUEST_PARSED,
    EVENT_RESPONSE_PARSED, EVENT_RINGING, EVENT_SIP_ERROR,
};
pub use uri::AddrSpec;
