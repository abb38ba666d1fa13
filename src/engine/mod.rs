//! The SIP engine: outbound request builders, inbound dispatch, and the
//! `poll(now_ms)` state machine.
//!
//! Grounded on `original_source/WiPhone/tinySIP.h`/`.cpp` (the `TinySIP`
//! class) and spec §4.5/§4.6/§4.9. Structured the way the teacher splits
//! its endpoint: a `builder` module for construction, and this module for
//! the live object and its behavior — the teacher keeps transaction/dialog
//! concerns in sibling modules (`transaction/`, `ua/dialogs/`) rather than
//! flattening them into `endpoint.rs`, which this crate mirrors with the
//! top-level `dialog`/`connection`/`auth_state` modules it calls into.

mod builder;
mod rand_ids;
mod requests;

pub use builder::EngineBuilder;

use std::collections::VecDeque;
use std::net::IpAddr;

use crate::auth_state::AuthState;
use crate::connection::{ConnectionManager, Slot, TransportKind};
use crate::dialog::{Dialog, DialogTable};
use crate::digest::Credential;
use crate::error::{Error, Result};
use crate::message::*;
use crate::parser::{self, ParsedMessage, StartLine};
use crate::sdp::{self, SdpBody, SUPPORTED_PAYLOADS};
use crate::uri::AddrSpec;
use requests::{render_request, render_response, ContactParams, RequestParams, ResponseParams};

/// Maximum size of the receive buffer (spec §6).
pub const MAX_MESSAGE_SIZE: usize = 2000;
/// RFC 3261 §17.1.1.2 default initial retransmit timer.
pub const T1_MS: u64 = 500;
/// RFC 5626 §4.4.1-derived keepalive cadence.
pub const PING_PERIOD_MS: u64 = 58_761;
/// Minimum gap between REGISTER attempts.
pub const REGISTER_PERIOD_MS: u64 = 60_000;
/// `Expires:` value sent in REGISTER, in seconds.
pub const REGISTER_EXPIRATION_S: u64 = 60;
/// Bound on outstanding-INVITE time before `INVITE_TIMEOUT` fires (spec §8
/// invariant 1).
pub const INVITE_TIMEOUT_MS: u64 = 32 * T1_MS;
/// Default connect timeout for the initial proxy attach.
pub const INITIAL_CONNECT_TIMEOUT_MS: u64 = 500;
/// Default connect timeout for later resolutions (reconnects).
pub const RECONNECT_TIMEOUT_MS: u64 = 5000;

/// A queued inbound MESSAGE, captured at receive time. Timestamped lazily:
/// `check_message` stamps the caller's chosen clock reading onto a
/// [`TextMessage`] only once the upper layer actually retrieves it.
struct PendingMessage {
    from: String,
    to: String,
    body: String,
}

/// Identifies the dialog currently treated as "the call" — a non-owning
/// handle re-looked-up in the table each time (spec §9: model as an index
/// or weak reference, not a bidirectional pointer pair).
#[derive(Debug, Clone, PartialEq, Eq)]
struct CallRef {
    call_id: String,
    local_tag: String,
    remote_tag: String,
}

/// The tinySIP engine: identity, transport, dialog table, and the
/// single-threaded `poll` state machine (spec §2, §5).
pub struct Engine {
    user: String,
    display_name: String,
    proxy_password: String,
    mac: [u8; 6],
    instance_uuid: String,
    transport_pref: TransportKind,

    local_tag: String,
    reg_call_id: String,
    reg_cseq: u32,

    proxy_host: String,
    proxy_port: u16,
    conn: ConnectionManager,

    dialogs: DialogTable,
    current_call: Option<CallRef>,

    registered: bool,
    registration_requested: bool,
    ms_last_registered: u64,
    ms_last_register_request: u64,

    invite_auth: AuthState,
    register_auth: AuthState,
    message_auth: AuthState,

    msg_call_id: Option<String>,

    timer_a_start: Option<u64>,

    ms_last_ping: u64,
    poll_count: u64,

    recv_buf: String,
    pending_messages: VecDeque<PendingMessage>,

    sdp_session_id: u64,
    remote_audio: Option<(IpAddr, u16, u8)>,

    reason: String,
    remote_name: String,
    remote_uri: String,
}

impl Engine {
    fn local_ip(&self) -> IpAddr {
        local_ip_address::local_ip().unwrap_or(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED))
    }

    fn local_uri(&self) -> String {
        format!("sip:{}@{}", self.user, self.proxy_host)
    }

    fn contact(&self, local_port: u16) -> ContactParams<'_> {
        ContactParams {
            phone_number: &self.user,
            local_ip: self.local_ip(),
            local_port,
            transport: self.transport_pref,
            instance_uuid: &self.instance_uuid,
        }
    }

    /// Resolves and opens the registrar/outbound-proxy connection (spec §6
    /// `init`'s transport-opening half).
    pub fn attach_proxy(&mut self, host: &str, port: u16, now_ms: u64) -> Result<()> {
        self.proxy_host = host.to_string();
        self.proxy_port = port;
        let ip = crate::connection::resolve_host(host, port)?;
        self.conn.ensure_ip_connection(
            Slot::Proxy,
            ip,
            port,
            false,
            std::time::Duration::from_millis(INITIAL_CONNECT_TIMEOUT_MS),
            now_ms,
        )?;
        tracing::debug!(host, port, "attached proxy connection");
        Ok(())
    }

    fn proxy_local_port(&self) -> u16 {
        self.conn.get(Slot::Proxy).map(|c| c.borrow().local_port()).unwrap_or(0)
    }

    fn send_proxy(&mut self, text: &str) -> Result<()> {
        let conn = self.conn.get(Slot::Proxy).ok_or(Error::NoProxy)?;
        conn.borrow_mut().write(text.as_bytes())?;
        Ok(())
    }

    // ---- outbound user actions (spec §6) ----

    /// Sends `REGISTER` to the attached proxy.
    pub fn register(&mut self, now_ms: u64) -> Result<()> {
        self.reg_cseq = (self.reg_cseq + 1) % 60_000;
        let branch = rand_ids::new_branch();
        let local_uri = self.local_uri();
        let request_uri = format!("sip:{}", self.proxy_host);

        let mut auth_header = None;
        if let Some(challenge) = self.register_auth.challenge().cloned() {
            auth_header = Some(self.build_authorization("REGISTER", &request_uri, &challenge, true));
        }

        let params = RequestParams {
            method: "REGISTER",
            request_uri: &request_uri,
            via_ip: self.local_ip(),
            via_port: self.proxy_local_port(),
            transport: self.transport_pref,
            branch: &branch,
            route: &[],
            from_display: &self.display_name,
            from_uri: &local_uri,
            from_tag: &self.local_tag,
            to_display: &self.display_name,
            to_uri: &local_uri,
            to_tag: None,
            call_id: &self.reg_call_id,
            cseq: self.reg_cseq,
            cseq_method: "REGISTER",
            contact: Some(self.contact(self.proxy_local_port())),
            authorization: auth_header,
            content_type: None,
            body: "",
        };
        let text = render_request(&params);
        self.send_proxy(&text)?;
        self.registration_requested = true;
        self.registered = false;
        self.ms_last_register_request = now_ms;
        tracing::debug!(cseq = self.reg_cseq, "sent REGISTER");
        Ok(())
    }

    fn build_authorization(&self, method: &str, uri: &str, challenge: &parser::Challenge, is_register: bool) -> (&'static str, String) {
        let auth_state = if is_register { &self.register_auth } else { &self.invite_auth };
        let qop = auth_state.qop();
        let cnonce = crate::auth_state::generate_cnonce();
        let cred = Credential::compute(
            &self.user,
            &self.proxy_password,
            method,
            uri,
            b"",
            &challenge.realm,
            &challenge.nonce,
            challenge.opaque.as_deref(),
            auth_state.algorithm(),
            qop,
            auth_state.nc(),
            &cnonce,
        );
        ("Authorization", cred.to_header_value())
    }

    /// Sends an `INVITE` to `to_uri` (spec §6 `start_call`).
    pub fn start_call(&mut self, to_uri: &str, now_ms: u64) -> Result<()> {
        let to = AddrSpec::new(to_uri);
        if to.scheme().is_none() {
            return Err(Error::MissingScheme(to_uri.to_string()));
        }

        let call_id = rand_ids::new_call_id();
        let branch = rand_ids::new_branch();
        let local_uri = self.local_uri();
        self.invite_auth.reset();

        let local_port = self.proxy_local_port();
        let sdp = SdpBody {
            session_id: self.sdp_session_id,
            local_ip: self.local_ip(),
            local_port: sdp::local_audio_port(self.sdp_session_id),
            payload_types: SUPPORTED_PAYLOADS.to_vec(),
        }
        .render();
        self.sdp_session_id += 1;

        let params = RequestParams {
            method: "INVITE",
            request_uri: to_uri,
            via_ip: self.local_ip(),
            via_port: local_port,
            transport: self.transport_pref,
            branch: &branch,
            route: &[],
            from_display: &self.display_name,
            from_uri: &local_uri,
            from_tag: &self.local_tag,
            to_display: "",
            to_uri,
            to_tag: None,
            call_id: &call_id,
            cseq: 1,
            cseq_method: "INVITE",
            contact: Some(self.contact(local_port)),
            authorization: None,
            content_type: Some("application/sdp"),
            body: &sdp,
        };
        let text = render_request(&params);
        self.send_proxy(&text)?;

        let mut dialog = Dialog::new(&call_id, &self.local_tag, "", &local_uri, to_uri, now_ms);
        dialog.local_cseq = 1;
        dialog.invite_branch = branch;
        self.dialogs.insert(dialog);
        self.current_call = Some(CallRef {
            call_id: call_id.clone(),
            local_tag: self.local_tag.clone(),
            remote_tag: String::new(),
        });
        self.timer_a_start = Some(now_ms);
        self.remote_uri = to_uri.to_string();
        tracing::debug!(%to_uri, "sent INVITE");
        Ok(())
    }

    /// Accepts the current incoming call with `200 OK` + SDP answer.
    pub fn accept_call(&mut self, now_ms: u64) -> Result<()> {
        let cur = self.current_call.clone().ok_or(Error::DialogMismatch)?;
        let remote_audio = self.remote_audio;
        let local_port = self.proxy_local_port();
        let local_ip = self.local_ip();
        let user = self.user.clone();
        let instance_uuid = self.instance_uuid.clone();
        let transport = self.transport_pref;
        let sdp_body = SdpBody {
            session_id: self.sdp_session_id,
            local_ip,
            local_port: sdp::local_audio_port(self.sdp_session_id),
            payload_types: remote_audio.map(|(_, _, pt)| vec![pt]).unwrap_or_else(|| SUPPORTED_PAYLOADS.to_vec()),
        }
        .render();
        self.sdp_session_id += 1;

        let dialog = self
            .dialogs
            .find_mut(&cur.call_id, &cur.local_tag, &cur.remote_tag)
            .ok_or(Error::DialogMismatch)?;
        let response = ResponseParams {
            status: SIP_STATUS_OK,
            reason: None,
            via: &[],
            from_display: "",
            from_uri: &dialog.remote_uri,
            from_tag: &dialog.remote_tag,
            to_display: "",
            to_uri: &dialog.local_uri,
            to_tag: &dialog.local_tag,
            call_id: &dialog.call_id,
            cseq: dialog.remote_cseq,
            cseq_method: "INVITE",
            contact: Some(ContactParams {
                phone_number: &user,
                local_ip,
                local_port,
                transport,
                instance_uuid: &instance_uuid,
            }),
            content_type: Some("application/sdp"),
            body: &sdp_body,
        };
        let text = render_response(&response);
        dialog.confirm(now_ms);
        self.send_proxy(&text)?;
        Ok(())
    }

    /// Declines the current incoming call with `603 Decline`.
    pub fn decline_call(&mut self, now_ms: u64) -> Result<()> {
        self.respond_current(SIP_STATUS_DECLINE, now_ms)
    }

    fn respond_current(&mut self, status: u16, now_ms: u64) -> Result<()> {
        let cur = self.current_call.clone().ok_or(Error::DialogMismatch)?;
        let dialog = self
            .dialogs
            .find_mut(&cur.call_id, &cur.local_tag, &cur.remote_tag)
            .ok_or(Error::DialogMismatch)?;
        let response = ResponseParams {
            status,
            reason: None,
            via: &[],
            from_display: "",
            from_uri: &dialog.remote_uri,
            from_tag: &dialog.remote_tag,
            to_display: "",
            to_uri: &dialog.local_uri,
            to_tag: &dialog.local_tag,
            call_id: &dialog.call_id,
            cseq: dialog.remote_cseq,
            cseq_method: "INVITE",
            contact: None,
            content_type: None,
            body: "",
        };
        let text = render_response(&response);
        dialog.terminate(now_ms);
        self.send_proxy(&text)?;
        Ok(())
    }

    /// Terminates the current call: `CANCEL` if the INVITE is still in
    /// flight (pre-200), else `BYE` (spec §5 cancellation rule).
    pub fn terminate_call(&mut self, now_ms: u64) -> Result<()> {
        let cur = self.current_call.clone().ok_or(Error::DialogMismatch)?;
        let confirmed = self.dialogs.find(&cur.call_id, &cur.local_tag, &cur.remote_tag).map(|d| d.confirmed).unwrap_or(false);

        if confirmed {
            self.send_bye(now_ms)?;
        } else {
            self.send_cancel(now_ms)?;
        }

        if let Some(dialog) = self.dialogs.find_mut(&cur.call_id, &cur.local_tag, &cur.remote_tag) {
            dialog.terminate(now_ms);
        }
        Ok(())
    }

    fn send_bye(&mut self, now_ms: u64) -> Result<()> {
        let cur = self.current_call.clone().ok_or(Error::DialogMismatch)?;
        let branch = rand_ids::new_branch();
        let local_port = self.proxy_local_port();
        let local_ip = self.local_ip();
        let user = self.user.clone();
        let instance_uuid = self.instance_uuid.clone();
        let transport = self.transport_pref;

        let dialog = self
            .dialogs
            .find_mut(&cur.call_id, &cur.local_tag, &cur.remote_tag)
            .ok_or(Error::DialogMismatch)?;
        let request_uri = dialog.remote_target.clone();
        let cseq = dialog.next_local_cseq();
        let route: Vec<String> = dialog.route_set.iter().map(str::to_string).collect();

        let params = RequestParams {
            method: "BYE",
            request_uri: &request_uri,
            via_ip: local_ip,
            via_port: local_port,
            transport,
            branch: &branch,
            route: &route,
            from_display: "",
            from_uri: &dialog.local_uri,
            from_tag: &dialog.local_tag,
            to_display: "",
            to_uri: &dialog.remote_uri,
            to_tag: Some(&dialog.remote_tag),
            call_id: &dialog.call_id,
            cseq,
            cseq_method: "BYE",
            contact: Some(ContactParams {
                phone_number: &user,
                local_ip,
                local_port,
                transport,
                instance_uuid: &instance_uuid,
            }),
            authorization: None,
            content_type: None,
            body: "",
        };
        let text = render_request(&params);
        self.send_proxy(&text)?;
        tracing::debug!(call_id = %cur.call_id, "sent BYE");
        Ok(())
    }

    fn send_cancel(&mut self, now_ms: u64) -> Result<()> {
        let _ = now_ms;
        let cur = self.current_call.clone().ok_or(Error::DialogMismatch)?;
        let local_port = self.proxy_local_port();
        let dialog = self
            .dialogs
            .find(&cur.call_id, &cur.local_tag, &cur.remote_tag)
            .ok_or(Error::DialogMismatch)?;
        let params = RequestParams {
            method: "CANCEL",
            request_uri: &self.remote_uri,
            via_ip: self.local_ip(),
            via_port: local_port,
            transport: self.transport_pref,
            // Must match the top Via of the INVITE being cancelled (RFC 3261 §9).
            branch: &dialog.invite_branch,
            route: &[],
            from_display: "",
            from_uri: &dialog.local_uri,
            from_tag: &dialog.local_tag,
            to_display: "",
            to_uri: &dialog.remote_uri,
            to_tag: None,
            call_id: &dialog.call_id,
            cseq: dialog.local_cseq,
            cseq_method: "CANCEL",
            contact: None,
            authorization: None,
            content_type: None,
            body: "",
        };
        let text = render_request(&params);
        self.send_proxy(&text)?;
        tracing::debug!(call_id = %cur.call_id, "sent CANCEL");
        Ok(())
    }

    /// Sends a `MESSAGE` request outside any dialog (spec §6
    /// `send_message`).
    pub fn send_message(&mut self, to_uri: &str, text_body: &str, _now_ms: u64) -> Result<()> {
        let call_id = rand_ids::new_call_id();
        let branch = rand_ids::new_branch();
        let local_uri = self.local_uri();
        self.message_auth.reset();
        self.msg_call_id = Some(call_id.clone());

        let params = RequestParams {
            method: "MESSAGE",
            request_uri: to_uri,
            via_ip: self.local_ip(),
            via_port: self.proxy_local_port(),
            transport: self.transport_pref,
            branch: &branch,
            route: &[],
            from_display: &self.display_name,
            from_uri: &local_uri,
            from_tag: &self.local_tag,
            to_display: "",
            to_uri,
            to_tag: None,
            call_id: &call_id,
            cseq: 1,
            cseq_method: "MESSAGE",
            contact: None,
            authorization: None,
            content_type: Some("text/plain"),
            body: text_body,
        };
        let rendered = render_request(&params);
        self.send_proxy(&rendered)?;
        Ok(())
    }

    /// Pops the next queued inbound `MESSAGE`, if any, stamping it with
    /// `now_ms` (monotonic) or `utc_now` (absolute UTC) depending on
    /// `use_time` (spec §6 `check_message(now_ms, utc_now, use_time)`). Falls
    /// back to the monotonic reading if `use_time` is set but `utc_now` is
    /// `None` (no wall clock available yet).
    pub fn check_message(&mut self, now_ms: u64, utc_now: Option<u64>, use_time: bool) -> Option<TextMessage> {
        let pending = self.pending_messages.pop_front()?;
        let timestamp = match (use_time, utc_now) {
            (true, Some(utc)) => MessageTimestamp::UtcMs(utc),
            _ => MessageTimestamp::MonotonicMs(now_ms),
        };
        Some(TextMessage {
            from: pending.from,
            to: pending.to,
            body: pending.body,
            timestamp,
        })
    }

    pub fn remote_audio_addr(&self) -> Option<IpAddr> {
        self.remote_audio.map(|(addr, _, _)| addr)
    }

    pub fn remote_audio_port(&self) -> Option<u16> {
        self.remote_audio.map(|(_, port, _)| port)
    }

    pub fn audio_format(&self) -> Option<u8> {
        self.remote_audio.map(|(_, _, pt)| pt)
    }

    pub fn get_reason(&self) -> &str {
        &self.reason
    }

    pub fn get_remote_name(&self) -> &str {
        &self.remote_name
    }

    pub fn get_remote_uri(&self) -> &str {
        &self.remote_uri
    }

    /// Drops the dialog table and marks the engine unregistered — used when
    /// the WiFi link itself is lost (SPEC_FULL §F, `tinySIP.cpp:1641-1679`).
    pub fn wifi_terminate_call(&mut self, now_ms: u64) {
        for dialog in self.dialogs.iter_mut() {
            dialog.terminate(now_ms);
        }
        self.dialogs.reap_terminated();
        self.current_call = None;
        self.registered = false;
        self.remote_audio = None;
        tracing::warn!("wifi link down: cleared dialog table and deregistered");
    }

    /// Like [`Engine::wifi_terminate_call`] but leaves `registered`
    /// unchanged — used when only audio needs to stop (SPEC_FULL §F).
    pub fn rtp_silent(&mut self, now_ms: u64) {
        for dialog in self.dialogs.iter_mut() {
            dialog.terminate(now_ms);
        }
        self.dialogs.reap_terminated();
        self.current_call = None;
        self.remote_audio = None;
    }

    // ---- poll state machine (spec §4.9, §5) ----

    /// Drains one message per call, reacts, and returns the event bitmask.
    pub fn poll(&mut self, now_ms: u64) -> u32 {
        self.poll_count += 1;
        let mut events = EVENT_NONE;

        if let Err(err) = self.ensure_proxy_and_register(now_ms) {
            tracing::warn!(error = %err, "proxy connection unavailable");
            events |= EVENT_CONNECTION_ERROR;
        }

        self.drain_transports(now_ms);

        if let Some(message) = self.take_one_message() {
            events |= self.dispatch(&message, now_ms);
        } else if self.poll_count % 16 == 0 {
            events |= self.run_timers(now_ms);
        }

        events
    }

    fn ensure_proxy_and_register(&mut self, now_ms: u64) -> Result<()> {
        if self.proxy_host.is_empty() {
            return Ok(());
        }
        let ip = crate::connection::resolve_host(&self.proxy_host, self.proxy_port)?;
        self.conn.ensure_ip_connection(
            Slot::Proxy,
            ip,
            self.proxy_port,
            false,
            std::time::Duration::from_millis(RECONNECT_TIMEOUT_MS),
            now_ms,
        )?;

        let needs_register = !self.registered
            || now_ms.saturating_sub(self.ms_last_registered) > REGISTER_EXPIRATION_S * 1000;
        if needs_register && now_ms.saturating_sub(self.ms_last_register_request) > REGISTER_PERIOD_MS {
            self.register(now_ms)?;
        }
        Ok(())
    }

    fn drain_transports(&mut self, now_ms: u64) {
        for slot in [Slot::Proxy, Slot::Route, Slot::Callee] {
            let Some(conn) = self.conn.get(slot) else { continue };
            loop {
                let available = conn.borrow().available();
                if available == 0 {
                    break;
                }
                if self.recv_buf.len() >= MAX_MESSAGE_SIZE {
                    break;
                }
                let mut buf = [0u8; 512];
                let want = available.min(buf.len()).min(MAX_MESSAGE_SIZE - self.recv_buf.len());
                let read = conn.borrow_mut().read(&mut buf[..want], now_ms);
                match read {
                    Ok(0) => break,
                    Ok(n) => self.recv_buf.push_str(&String::from_utf8_lossy(&buf[..n])),
                    Err(_) => break,
                }
            }
        }
    }

    /// Removes and returns the next complete message from the receive
    /// buffer, recognizing a bare `\r\n` pong first (spec §4.6).
    fn take_one_message(&mut self) -> Option<String> {
        if self.recv_buf.starts_with("\r\n") {
            self.recv_buf.drain(..2);
            return Some("\r\n".to_string());
        }
        let end = self.recv_buf.find("\r\n\r\n")?;
        let body_start = end + 4;
        let content_length = extract_content_length(&self.recv_buf[..end]);
        let total_end = body_start + content_length;
        if self.recv_buf.len() < total_end {
            return None; // MORE_BUFFER would be signalled by caller on next poll
        }
        let message: String = self.recv_buf.drain(..total_end).collect();
        Some(message)
    }

    fn dispatch(&mut self, raw: &str, now_ms: u64) -> u32 {
        if raw == "\r\n" {
            if let Some(conn) = self.conn.get(Slot::Proxy) {
                let mut c = conn.borrow_mut();
                c.ever_ponged = true;
                c.ms_last_pong = now_ms;
            }
            return EVENT_PONGED;
        }

        let parsed = match parser::parse_message(raw) {
            Ok(p) => p,
            Err(err) => {
                tracing::warn!(error = %err, "SIP parse error");
                self.recv_buf.clear();
                return EVENT_SIP_ERROR;
            }
        };

        match &parsed.start_line {
            StartLine::Response { status, .. } => self.handle_response(*status, &parsed, now_ms),
            StartLine::Request { method, .. } => self.handle_request(method, &parsed, now_ms),
        }
    }

    fn handle_response(&mut self, status: u16, parsed: &ParsedMessage, now_ms: u64) -> u32 {
        let mut events = EVENT_RESPONSE_PARSED;
        let Some(cseq) = &parsed.cseq else { return events | EVENT_SIP_ERROR };

        match cseq.method.as_str() {
            "REGISTER" => events |= self.handle_register_response(status, parsed, now_ms),
            "INVITE" => events |= self.handle_invite_response(status, parsed, now_ms),
            "MESSAGE" => events |= self.handle_message_response(status, parsed, now_ms),
            "BYE" => {
                if status == SIP_STATUS_OK {
                    events |= EVENT_CALL_TERMINATED;
                }
            }
            _ => {}
        }
        events
    }

    fn handle_message_response(&mut self, status: u16, parsed: &ParsedMessage, now_ms: u64) -> u32 {
        match status {
            SIP_STATUS_OK | SIP_STATUS_ACCEPTED => EVENT_NONE,
            SIP_STATUS_UNAUTHORIZED | SIP_STATUS_PROXY_AUTHENTICATION_REQUIRED | SIP_STATUS_REQUEST_PENDING => {
                let Some(msg_call_id) = self.msg_call_id.clone() else { return EVENT_SIP_ERROR };
                if parsed.call_id.as_deref() != Some(msg_call_id.as_str()) {
                    return EVENT_NONE; // response to a stale/unrelated MESSAGE transaction
                }
                let challenge = parsed.www_authenticate.clone().or_else(|| parsed.proxy_authenticate.clone());
                let Some(challenge) = challenge else { return EVENT_SIP_ERROR };
                let cseq = parsed.cseq.as_ref().map(|c| c.seq).unwrap_or(1);
                if !self.message_auth.should_retry(cseq) {
                    return EVENT_SIP_ERROR;
                }
                self.message_auth.accept_challenge(cseq, challenge);
                let to_uri = self.remote_uri.clone();
                if self.retry_message_with_auth(&to_uri, now_ms).is_err() {
                    return EVENT_CONNECTION_ERROR;
                }
                EVENT_NONE
            }
            _ => EVENT_SIP_ERROR,
        }
    }

    fn retry_message_with_auth(&mut self, to_uri: &str, now_ms: u64) -> Result<()> {
        let Some(call_id) = self.msg_call_id.clone() else { return Ok(()) };
        let branch = rand_ids::new_branch();
        let local_uri = self.local_uri();
        let request_uri = to_uri.to_string();

        let challenge = self.message_auth.challenge().cloned();
        let auth_header = challenge.map(|c| self.build_authorization("MESSAGE", &request_uri, &c, false));

        let params = RequestParams {
            method: "MESSAGE",
            request_uri: &request_uri,
            via_ip: self.local_ip(),
            via_port: self.proxy_local_port(),
            transport: self.transport_pref,
            branch: &branch,
            route: &[],
            from_display: &self.display_name,
            from_uri: &local_uri,
            from_tag: &self.local_tag,
            to_display: "",
            to_uri: &request_uri,
            to_tag: None,
            call_id: &call_id,
            cseq: 1,
            cseq_method: "MESSAGE",
            contact: None,
            authorization: auth_header,
            content_type: None,
            body: "",
        };
        let _ = now_ms;
        let text = render_request(&params);
        self.send_proxy(&text)
    }

    fn handle_register_response(&mut self, status: u16, parsed: &ParsedMessage, now_ms: u64) -> u32 {
        match status {
            SIP_STATUS_OK => {
                self.registered = true;
                self.ms_last_registered = now_ms;
                EVENT_REGISTERED
            }
            SIP_STATUS_UNAUTHORIZED | SIP_STATUS_PROXY_AUTHENTICATION_REQUIRED | SIP_STATUS_REQUEST_PENDING => {
                let challenge = parsed.www_authenticate.clone().or_else(|| parsed.proxy_authenticate.clone());
                let Some(challenge) = challenge else { return EVENT_SIP_ERROR };
                if !self.register_auth.should_retry(self.reg_cseq) {
                    return EVENT_SIP_ERROR;
                }
                self.register_auth.accept_challenge(self.reg_cseq, challenge);
                if self.register(now_ms).is_err() {
                    return EVENT_CONNECTION_ERROR;
                }
                EVENT_NONE
            }
            _ => EVENT_SIP_ERROR,
        }
    }

    fn handle_invite_response(&mut self, status: u16, parsed: &ParsedMessage, now_ms: u64) -> u32 {
        let Some(cur) = self.current_call.clone() else { return EVENT_SIP_ERROR };
        let remote_tag = parsed.to.as_ref().and_then(|t| t.tag.clone()).unwrap_or_default();

        match status {
            SIP_STATUS_TRYING => EVENT_NONE,
            100..=199 => {
                if let Some(dialog) = self.dialogs.find_by_call_and_local_tag_mut(&cur.call_id, &cur.local_tag) {
                    if !remote_tag.is_empty() {
                        dialog.set_remote_tag(&remote_tag);
                    }
                }
                self.current_call = Some(CallRef { remote_tag: remote_tag.clone(), ..cur });
                if status == SIP_STATUS_RINGING {
                    EVENT_RINGING
                } else {
                    EVENT_NONE
                }
            }
            200..=299 => {
                self.timer_a_start = None;
                if let Some(contact) = &parsed.contact {
                    if let Some(dialog) = self.dialogs.find_by_call_and_local_tag_mut(&cur.call_id, &cur.local_tag) {
                        dialog.set_remote_tag(&remote_tag);
                        dialog.remote_target = contact.as_str().to_string();
                        // UAC route set is read in reverse of insertion order (spec §8.7).
                        dialog.route_set.clear(true);
                        for rr in &parsed.record_route {
                            dialog.route_set.add(rr, None);
                        }
                        dialog.confirm(now_ms);
                    }
                }
                self.current_call = Some(CallRef { remote_tag: remote_tag.clone(), ..cur.clone() });

                let mut events = EVENT_CALL_CONFIRMED;
                if parsed.content_type.as_deref() == Some("application/sdp") {
                    match sdp::negotiate(&parsed.body, &SUPPORTED_PAYLOADS) {
                        Ok(n) => self.remote_audio = Some((n.remote_addr, n.remote_port, n.payload_type)),
                        Err(_) => events |= EVENT_SIP_ERROR,
                    }
                }
                if let Err(err) = self.send_ack(&cur, parsed) {
                    tracing::warn!(error = %err, "failed sending ACK");
                }
                events
            }
            SIP_STATUS_UNAUTHORIZED | SIP_STATUS_PROXY_AUTHENTICATION_REQUIRED | SIP_STATUS_REQUEST_PENDING => {
                let challenge = parsed.www_authenticate.clone().or_else(|| parsed.proxy_authenticate.clone());
                let Some(challenge) = challenge else {
                    self.terminate_dialog_with_reason(&cur, "auth failed", now_ms);
                    return EVENT_CALL_TERMINATED | EVENT_SIP_ERROR;
                };
                let local_cseq = self.dialogs.find_by_call_and_local_tag(&cur.call_id, &cur.local_tag).map(|d| d.local_cseq).unwrap_or(0);
                if !self.invite_auth.should_retry(local_cseq) {
                    self.terminate_dialog_with_reason(&cur, "auth retry exhausted", now_ms);
                    return EVENT_CALL_TERMINATED | EVENT_SIP_ERROR;
                }
                self.invite_auth.accept_challenge(local_cseq, challenge);
                if let Err(err) = self.send_ack(&cur, parsed) {
                    tracing::warn!(error = %err, "failed sending ACK for challenge");
                }
                self.retry_invite_with_auth(now_ms);
                EVENT_NONE
            }
            300..=699 => {
                if let Err(err) = self.send_ack(&cur, parsed) {
                    tracing::warn!(error = %err, "failed sending ACK");
                }
                self.terminate_dialog_with_reason(&cur, parsed.start_line_reason(), now_ms);
                EVENT_CALL_TERMINATED
            }
            _ => EVENT_SIP_ERROR,
        }
    }

    fn terminate_dialog_with_reason(&mut self, cur: &CallRef, reason: &str, now_ms: u64) {
        if let Some(dialog) = self.dialogs.find_mut(&cur.call_id, &cur.local_tag, &cur.remote_tag) {
            dialog.terminate(now_ms);
        }
        self.reason = reason.to_string();
        self.current_call = None;
    }

    fn retry_invite_with_auth(&mut self, now_ms: u64) {
        let Some(cur) = self.current_call.clone() else { return };
        let Some(dialog) = self.dialogs.find_by_call_and_local_tag(&cur.call_id, &cur.local_tag) else { return };
        let to_uri = dialog.remote_uri.clone();
        // Known deviation (spec §9 item 2): this reimplementation re-sends
        // the INVITE through `start_call`, which assigns a fresh Call-ID
        // and CSeq=1 rather than retrying the same transaction; see
        // DESIGN.md for the resolution rationale.
        let _ = self.start_call(&to_uri, now_ms);
    }

    fn send_ack(&mut self, cur: &CallRef, response: &ParsedMessage) -> Result<()> {
        let branch = rand_ids::new_branch();
        let local_port = self.proxy_local_port();
        let (request_uri, route): (String, Vec<String>) = {
            let dialog = self.dialogs.find_by_call_and_local_tag(&cur.call_id, &cur.local_tag);
            match dialog {
                Some(d) if !d.remote_target.is_empty() => (d.remote_target.clone(), d.route_set.iter().map(str::to_string).collect()),
                _ => (self.remote_uri.clone(), Vec::new()),
            }
        };
        let local_uri = self.local_uri();
        let to_tag = response.to.as_ref().and_then(|t| t.tag.clone()).unwrap_or_default();
        let cseq = response.cseq.as_ref().map(|c| c.seq).unwrap_or(1);

        let params = RequestParams {
            method: "ACK",
            request_uri: &request_uri,
            via_ip: self.local_ip(),
            via_port: local_port,
            transport: self.transport_pref,
            branch: &branch,
            route: &route,
            from_display: &self.display_name,
            from_uri: &local_uri,
            from_tag: &self.local_tag,
            to_display: "",
            to_uri: &self.remote_uri,
            to_tag: Some(&to_tag),
            call_id: &cur.call_id,
            cseq,
            cseq_method: "ACK",
            contact: None,
            authorization: None,
            content_type: None,
            body: "",
        };
        let text = render_request(&params);
        self.send_proxy(&text)
    }

    fn handle_request(&mut self, method: &str, parsed: &ParsedMessage, now_ms: u64) -> u32 {
        match method {
            "INVITE" => self.handle_incoming_invite(parsed, now_ms),
            "BYE" => self.handle_incoming_bye(parsed, now_ms),
            "MESSAGE" => self.handle_incoming_message(parsed, now_ms),
            _ => EVENT_REQUEST_PARSED,
        }
    }

    fn handle_incoming_invite(&mut self, parsed: &ParsedMessage, now_ms: u64) -> u32 {
        let busy = self.current_call.as_ref().map(|cur| {
            self.dialogs
                .find(&cur.call_id, &cur.local_tag, &cur.remote_tag)
                .map(|d| (d.early || d.confirmed) && !d.terminated)
                .unwrap_or(false)
        }).unwrap_or(false);

        let Some(call_id) = &parsed.call_id else { return EVENT_SIP_ERROR };
        let Some(from) = &parsed.from else { return EVENT_SIP_ERROR };
        let Some(to) = &parsed.to else { return EVENT_SIP_ERROR };
        let local_tag = rand_ids::new_tag();

        if busy {
            let response = ResponseParams {
                status: SIP_STATUS_BUSY_HERE,
                reason: None,
                via: &parsed.via,
                from_display: "",
                from_uri: from.addr.as_str(),
                from_tag: from.tag.as_deref().unwrap_or(""),
                to_display: "",
                to_uri: to.addr.as_str(),
                to_tag: &local_tag,
                call_id,
                cseq: parsed.cseq.as_ref().map(|c| c.seq).unwrap_or(0),
                cseq_method: "INVITE",
                contact: None,
                content_type: None,
                body: "",
            };
            let text = render_response(&response);
            let _ = self.send_proxy(&text);
            return EVENT_REQUEST_PARSED;
        }

        let negotiated = if parsed.content_type.as_deref() == Some("application/sdp") {
            sdp::negotiate(&parsed.body, &SUPPORTED_PAYLOADS)
        } else {
            Err(Error::UnsupportedCodec)
        };
        let Ok(negotiated) = negotiated else {
            let response = ResponseParams {
                status: SIP_STATUS_NOT_ACCEPTABLE_HERE,
                reason: None,
                via: &parsed.via,
                from_display: "",
                from_uri: from.addr.as_str(),
                from_tag: from.tag.as_deref().unwrap_or(""),
                to_display: "",
                to_uri: to.addr.as_str(),
                to_tag: &local_tag,
                call_id,
                cseq: parsed.cseq.as_ref().map(|c| c.seq).unwrap_or(0),
                cseq_method: "INVITE",
                contact: None,
                content_type: None,
                body: "",
            };
            let text = render_response(&response);
            let _ = self.send_proxy(&text);
            return EVENT_CALL_TERMINATED | EVENT_SIP_ERROR;
        };

        let mut dialog = Dialog::new(call_id, &local_tag, from.tag.as_deref().unwrap_or(""), to.addr.as_str(), from.addr.as_str(), now_ms);
        dialog.remote_cseq = parsed.cseq.as_ref().map(|c| c.seq).unwrap_or(0);
        if let Some(contact) = &parsed.contact {
            dialog.remote_target = contact.as_str().to_string();
        }
        // Route set for a UAS dialog is established once, straight order,
        // from the initial INVITE's Record-Route headers (spec §4.2).
        dialog.route_set.clear(false);
        for rr in &parsed.record_route {
            dialog.route_set.add(rr, None);
        }
        tracing::debug!(call_id = %call_id, routes = %dialog.route_set, "established UAS route set");

        self.dialogs.insert(dialog);
        self.current_call = Some(CallRef {
            call_id: call_id.clone(),
            local_tag: local_tag.clone(),
            remote_tag: from.tag.clone().unwrap_or_default(),
        });
        self.remote_name = from.addr.userinfo().unwrap_or("").to_string();
        self.remote_uri = from.addr.as_str().to_string();
        self.remote_audio = Some((negotiated.remote_addr, negotiated.remote_port, negotiated.payload_type));

        let response = ResponseParams {
            status: SIP_STATUS_RINGING,
            reason: None,
            via: &parsed.via,
            from_display: "",
            from_uri: from.addr.as_str(),
            from_tag: from.tag.as_deref().unwrap_or(""),
            to_display: "",
            to_uri: to.addr.as_str(),
            to_tag: &local_tag,
            call_id,
            cseq: parsed.cseq.as_ref().map(|c| c.seq).unwrap_or(0),
            cseq_method: "INVITE",
            contact: None,
            content_type: None,
            body: "",
        };
        let text = render_response(&response);
        let _ = self.send_proxy(&text);
        EVENT_INCOMING_CALL
    }

    fn handle_incoming_bye(&mut self, parsed: &ParsedMessage, now_ms: u64) -> u32 {
        let (Some(call_id), Some(from), Some(to)) = (&parsed.call_id, &parsed.from, &parsed.to) else {
            return EVENT_SIP_ERROR;
        };
        let from_tag = from.tag.as_deref().unwrap_or("");
        let to_tag = to.tag.as_deref().unwrap_or("");

        let found = self
            .dialogs
            .find(call_id, to_tag, from_tag)
            .or_else(|| self.dialogs.find(call_id, from_tag, to_tag))
            .cloned();

        let Some(dialog) = found else {
            let response = ResponseParams {
                status: SIP_STATUS_CALL_TRANSACTION_DOES_NOT_EXIST,
                reason: None,
                via: &parsed.via,
                from_display: "",
                from_uri: from.addr.as_str(),
                from_tag,
                to_display: "",
                to_uri: to.addr.as_str(),
                to_tag,
                call_id,
                cseq: parsed.cseq.as_ref().map(|c| c.seq).unwrap_or(0),
                cseq_method: "BYE",
                contact: None,
                content_type: None,
                body: "",
            };
            let text = render_response(&response);
            let _ = self.send_proxy(&text);
            return EVENT_SIP_ERROR;
        };

        if dialog.terminated {
            let response = ResponseParams {
                status: SIP_STATUS_CALL_TRANSACTION_DOES_NOT_EXIST,
                reason: None,
                via: &parsed.via,
                from_display: "",
                from_uri: from.addr.as_str(),
                from_tag,
                to_display: "",
                to_uri: to.addr.as_str(),
                to_tag,
                call_id,
                cseq: parsed.cseq.as_ref().map(|c| c.seq).unwrap_or(0),
                cseq_method: "BYE",
                contact: None,
                content_type: None,
                body: "",
            };
            let text = render_response(&response);
            let _ = self.send_proxy(&text);
            return EVENT_SIP_ERROR;
        }

        let response = ResponseParams {
            status: SIP_STATUS_OK,
            reason: None,
            via: &parsed.via,
            from_display: "",
            from_uri: from.addr.as_str(),
            from_tag,
            to_display: "",
            to_uri: to.addr.as_str(),
            to_tag,
            call_id,
            cseq: parsed.cseq.as_ref().map(|c| c.seq).unwrap_or(0),
            cseq_method: "BYE",
            contact: None,
            content_type: None,
            body: "",
        };
        let text = render_response(&response);
        let _ = self.send_proxy(&text);

        if let Some(stored) = self.dialogs.find_mut(&dialog.call_id, &dialog.local_tag, &dialog.remote_tag) {
            stored.terminate(now_ms);
        }
        if self.current_call.as_ref().map(|c| c.call_id == dialog.call_id).unwrap_or(false) {
            self.current_call = None;
        }
        EVENT_CALL_TERMINATED
    }

    fn handle_incoming_message(&mut self, parsed: &ParsedMessage, _now_ms: u64) -> u32 {
        let (Some(call_id), Some(from), Some(to)) = (&parsed.call_id, &parsed.from, &parsed.to) else {
            return EVENT_SIP_ERROR;
        };
        let response = ResponseParams {
            status: SIP_STATUS_OK,
            reason: None,
            via: &parsed.via,
            from_display: "",
            from_uri: from.addr.as_str(),
            from_tag: from.tag.as_deref().unwrap_or(""),
            to_display: "",
            to_uri: to.addr.as_str(),
            to_tag: to.tag.as_deref().unwrap_or(""),
            call_id,
            cseq: parsed.cseq.as_ref().map(|c| c.seq).unwrap_or(0),
            cseq_method: "MESSAGE",
            contact: None,
            content_type: None,
            body: "",
        };
        let text = render_response(&response);
        let _ = self.send_proxy(&text);

        self.pending_messages.push_back(PendingMessage {
            from: from.addr.as_str().to_string(),
            to: to.addr.as_str().to_string(),
            body: parsed.body.clone(),
        });
        EVENT_INCOMING_MESSAGE
    }

    fn run_timers(&mut self, now_ms: u64) -> u32 {
        let mut events = EVENT_NONE;

        if let Some(start) = self.timer_a_start {
            if now_ms.saturating_sub(start) > INVITE_TIMEOUT_MS {
                self.timer_a_start = None;
                if let Some(cur) = self.current_call.clone() {
                    self.terminate_dialog_with_reason(&cur, "invite timeout", now_ms);
                }
                events |= EVENT_INVITE_TIMEOUT | EVENT_CALL_TERMINATED;
            }
        }

        if self.registered {
            if let Some(conn) = self.conn.get(Slot::Proxy) {
                let due = {
                    let c = conn.borrow();
                    now_ms.saturating_sub(c.ms_last_ping) > PING_PERIOD_MS
                };
                if due {
                    let mut c = conn.borrow_mut();
                    if c.write(b"\r\n\r\n").is_ok() {
                        if c.pinged {
                            c.re_pinged = true;
                        }
                        c.pinged = true;
                        c.ms_last_ping = now_ms;
                    }
                }
            }
        }

        self.dialogs.reap_terminated();
        events
    }
}

fn extract_content_length(header_block: &str) -> usize {
    for line in header_block.split("\r\n") {
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim().to_ascii_lowercase();
            if name == "content-length" || name == "l" {
                return value.trim().parse().unwrap_or(0);
            }
        }
    }
    0
}

trait ParsedMessageExt {
    fn start_line_reason(&self) -> &str;
}

impl ParsedMessageExt for ParsedMessage {
    fn start_line_reason(&self) -> &str {
        match &self.start_line {
            StartLine::Response { reason, .. } => reason,
            StartLine::Request { .. } => "",
        }
    }
}
