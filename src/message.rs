//! Event bitmask, SIP status constants, and the inbound text-message type
//! handed back from [`crate::engine::Engine::poll`].
//!
//! Grounded on `original_source/WiPhone/tinySIP.h` lines 132-145 (status
//! constants) and the `EVENT_*` bitmask the original ORs into its poll
//! return value; spec §4.6/§6.

/// No event occurred this poll.
pub const EVENT_NONE: u32 = 0;
/// 180 Ringing received for an outgoing call.
pub const EVENT_RINGING: u32 = 1 << 0;
/// The call was confirmed (2xx + ACK exchanged).
pub const EVENT_CALL_CONFIRMED: u32 = 1 << 1;
/// The call ended (BYE, CANCEL, or a terminating failure response).
pub const EVENT_CALL_TERMINATED: u32 = 1 << 2;
/// A SIP-level error occurred (malformed message, unexpected response).
pub const EVENT_SIP_ERROR: u32 = 1 << 3;
/// A new INVITE created an incoming-call dialog.
pub const EVENT_INCOMING_CALL: u32 = 1 << 4;
/// The transport connection failed or was torn down unexpectedly.
pub const EVENT_CONNECTION_ERROR: u32 = 1 << 5;
/// More buffer space is needed to parse a pending message (spec §4.6).
pub const EVENT_MORE_BUFFER: u32 = 1 << 6;
/// The REGISTER transaction completed with a 2xx.
pub const EVENT_REGISTERED: u32 = 1 << 7;
/// A response was parsed this poll.
pub const EVENT_RESPONSE_PARSED: u32 = 1 << 8;
/// A request was parsed this poll.
pub const EVENT_REQUEST_PARSED: u32 = 1 << 9;
/// An outgoing INVITE timed out waiting for a final response.
pub const EVENT_INVITE_TIMEOUT: u32 = 1 << 10;
/// A keepalive pong (CRLF or OPTIONS) was received.
pub const EVENT_PONGED: u32 = 1 << 11;
/// A MESSAGE request arrived; text is retrievable via `check_message`.
pub const EVENT_INCOMING_MESSAGE: u32 = 1 << 12;

// SIP status codes referenced by the engine (`tinySIP.h:132-145`). Not
// exhaustive of RFC 3261 Table 7-8; only the ones the engine itself
// constructs or specifically branches on.
pub const SIP_STATUS_TRYING: u16 = 100;
pub const SIP_STATUS_RINGING: u16 = 180;
pub const SIP_STATUS_CALL_IS_BEING_FORWARDED: u16 = 181;
pub const SIP_STATUS_QUEUED: u16 = 182;
pub const SIP_STATUS_SESSION_PROGRESS: u16 = 183;
pub const SIP_STATUS_OK: u16 = 200;
pub const SIP_STATUS_ACCEPTED: u16 = 202;
pub const SIP_STATUS_MOVED_PERMANENTLY: u16 = 301;
pub const SIP_STATUS_MOVED_TEMPORARILY: u16 = 302;
pub const SIP_STATUS_USE_PROXY: u16 = 305;
pub const SIP_STATUS_BAD_REQUEST: u16 = 400;
pub const SIP_STATUS_UNAUTHORIZED: u16 = 401;
pub const SIP_STATUS_FORBIDDEN: u16 = 403;
pub const SIP_STATUS_NOT_FOUND: u16 = 404;
pub const SIP_STATUS_METHOD_NOT_ALLOWED: u16 = 405;
pub const SIP_STATUS_PROXY_AUTHENTICATION_REQUIRED: u16 = 407;
pub const SIP_STATUS_REQUEST_TIMEOUT: u16 = 408;
pub const SIP_STATUS_GONE: u16 = 410;
pub const SIP_STATUS_REQUEST_ENTITY_TOO_LARGE: u16 = 413;
pub const SIP_STATUS_REQUEST_URI_TOO_LONG: u16 = 414;
pub const SIP_STATUS_UNSUPPORTED_MEDIA_TYPE: u16 = 415;
pub const SIP_STATUS_UNSUPPORTED_URI_SCHEME: u16 = 416;
pub const SIP_STATUS_BAD_EXTENSION: u16 = 420;
pub const SIP_STATUS_TEMPORARILY_UNAVAILABLE: u16 = 480;
pub const SIP_STATUS_CALL_TRANSACTION_DOES_NOT_EXIST: u16 = 481;
pub const SIP_STATUS_LOOP_DETECTED: u16 = 482;
pub const SIP_STATUS_TOO_MANY_HOPS: u16 = 483;
pub const SIP_STATUS_ADDRESS_INCOMPLETE: u16 = 484;
pub const SIP_STATUS_AMBIGUOUS: u16 = 485;
pub const SIP_STATUS_BUSY_HERE: u16 = 486;
pub const SIP_STATUS_REQUEST_TERMINATED: u16 = 487;
pub const SIP_STATUS_NOT_ACCEPTABLE_HERE: u16 = 488;
pub const SIP_STATUS_REQUEST_PENDING: u16 = 491;
pub const SIP_STATUS_SERVER_INTERNAL_ERROR: u16 = 500;
pub const SIP_STATUS_NOT_IMPLEMENTED: u16 = 501;
pub const SIP_STATUS_BAD_GATEWAY: u16 = 502;
pub const SIP_STATUS_SERVICE_UNAVAILABLE: u16 = 503;
pub const SIP_STATUS_SERVER_TIMEOUT: u16 = 504;
pub const SIP_STATUS_BUSY_EVERYWHERE: u16 = 600;
pub const SIP_STATUS_DECLINE: u16 = 603;

/// A reason phrase for the status codes the engine itself sends; mirrors
/// `tinySIP.cpp`'s small local reason-phrase table (not a full RFC 3261
/// table, since only engine-originated responses need one).
pub fn default_reason_phrase(status: u16) -> &'static str {
    match status {
        SIP_STATUS_TRYING => "Trying",
        SIP_STATUS_RINGING => "Ringing",
        SIP_STATUS_OK => "OK",
        SIP_STATUS_BAD_REQUEST => "Bad Request",
        SIP_STATUS_UNAUTHORIZED => "Unauthorized",
        SIP_STATUS_FORBIDDEN => "Forbidden",
        SIP_STATUS_NOT_FOUND => "Not Found",
        SIP_STATUS_PROXY_AUTHENTICATION_REQUIRED => "Proxy Authentication Required",
        SIP_STATUS_REQUEST_TIMEOUT => "Request Timeout",
        SIP_STATUS_TEMPORARILY_UNAVAILABLE => "Temporarily Unavailable",
        SIP_STATUS_CALL_TRANSACTION_DOES_NOT_EXIST => "Call/Transaction Does Not Exist",
        SIP_STATUS_BUSY_HERE => "Busy Here",
        SIP_STATUS_REQUEST_TERMINATED => "Request Terminated",
        SIP_STATUS_NOT_ACCEPTABLE_HERE => "Not Acceptable Here",
        SIP_STATUS_SERVER_INTERNAL_ERROR => "Server Internal Error",
        SIP_STATUS_DECLINE => "Decline",
        _ => "Unknown",
    }
}

/// The capture timestamp a [`TextMessage`] was stamped with, chosen by the
/// `use_time` flag passed to `check_message` (spec §3/§6): either a
/// monotonic-millis reading (the same clock `poll`'s `now_ms` comes from)
/// or an absolute UTC timestamp, in milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageTimestamp {
    MonotonicMs(u64),
    UtcMs(u64),
}

/// A SIP MESSAGE request's content, handed back to the caller via
/// `check_message` (spec §3/§6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextMessage {
    pub from: String,
    pub to: String,
    pub body: String,
    pub timestamp: MessageTimestamp,
}
