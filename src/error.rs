//! Error types for the tinySIP core.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by [`crate::uri::AddrSpec`], the inbound parser, and the
/// engine's public entry points.
///
/// Parse failures encountered mid-`poll` are *not* propagated through this
/// type — per spec §4.6/§7 they are folded into the `SIP_ERROR` event and the
/// receive buffer is reset. This type is for failures the caller must react
/// to directly: building a request from a bad URI, or a transport that
/// refuses to connect.
#[derive(Debug, Error)]
pub enum Error {
    /// A SIP/SDP grammar rule was violated while parsing `message`.
    #[error("parse error: {0}")]
    Parse(String),

    /// A URI had no recognizable scheme (`sip`/`sips`/absoluteURI).
    #[error("address has no scheme: {0:?}")]
    MissingScheme(String),

    /// The underlying socket failed to connect or read/write.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// A 401/407/491 challenge could not be answered (missing realm/nonce,
    /// or the same CSeq was already retried once).
    #[error("authentication failed: {0}")]
    Auth(String),

    /// An inbound INVITE offered no SDP payload type this engine supports.
    #[error("no supported codec in SDP offer")]
    UnsupportedCodec,

    /// An inbound INVITE arrived while the current call was early/confirmed.
    #[error("busy")]
    Busy,

    /// An in-dialog request referenced an unknown (Call-ID, tag, tag) triple.
    #[error("dialog does not exist")]
    DialogMismatch,

    /// No proxy connection has been established yet.
    #[error("proxy is not attached")]
    NoProxy,
}
