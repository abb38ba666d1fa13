//! End-to-end engine scenarios, driven over real loopback UDP sockets
//! standing in for the registrar/proxy, matching `connection.rs`'s own
//! `loopback_udp_peer()` unit-test idiom rather than a mock transport.
//!
//! Time is virtual throughout: `now_ms` is passed explicitly to every
//! `Engine` call, so scenarios spanning tens of seconds of protocol timing
//! (S5's keepalive cadence) run instantly without a real sleep.

use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use tinysip::digest::{self, Algorithm, Qop};
use tinysip::parser::{self, StartLine};
use tinysip::sdp::SdpBody;
use tinysip::{
    Engine, EngineBuilder, EVENT_CALL_CONFIRMED, EVENT_CALL_TERMINATED, EVENT_INCOMING_CALL,
    EVENT_PONGED, EVENT_REGISTERED, EVENT_RINGING, EVENT_SIP_ERROR,
};

fn peer() -> (UdpSocket, SocketAddr) {
    let sock = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
    sock.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
    let addr = sock.local_addr().unwrap();
    (sock, addr)
}

fn new_engine(user: &str, password: &str) -> Engine {
    EngineBuilder::new(user)
        .with_proxy_password(password)
        .with_mac([0x02, 0x00, 0x00, 0x00, 0x00, 0x01])
        .build()
}

fn recv(peer: &UdpSocket) -> (String, SocketAddr) {
    let mut buf = [0u8; 2048];
    let (n, from) = peer.recv_from(&mut buf).expect("expected a datagram from the engine");
    (String::from_utf8_lossy(&buf[..n]).into_owned(), from)
}

fn send(peer: &UdpSocket, to: SocketAddr, text: &str) {
    peer.send_to(text.as_bytes(), to).unwrap();
}

fn header_value<'a>(raw: &'a str, name: &str) -> Option<&'a str> {
    raw.lines().find_map(|line| {
        let (k, v) = line.split_once(':')?;
        k.trim().eq_ignore_ascii_case(name).then(|| v.trim())
    })
}

fn digest_param<'a>(params: &'a str, name: &str) -> &'a str {
    params
        .split(',')
        .map(str::trim)
        .find_map(|part| part.strip_prefix(&format!("{name}=")))
        .map(|v| v.trim_matches('"'))
        .unwrap_or_else(|| panic!("missing {name} param in {params:?}"))
}

#[allow(clippy::too_many_arguments)]
fn sip_response(
    status: u16,
    reason: &str,
    from_uri: &str,
    from_tag: &str,
    to_uri: &str,
    to_tag: Option<&str>,
    call_id: &str,
    cseq: u32,
    cseq_method: &str,
    extra_headers: &str,
    content_type: Option<&str>,
    body: &str,
) -> String {
    let mut out = format!("SIP/2.0 {status} {reason}\r\n");
    out.push_str("Via: SIP/2.0/UDP 203.0.113.5:5060;branch=z9hG4bKtestproxy\r\n");
    out.push_str(&format!("From: <{from_uri}>;tag={from_tag}\r\n"));
    match to_tag {
        Some(tag) => out.push_str(&format!("To: <{to_uri}>;tag={tag}\r\n")),
        None => out.push_str(&format!("To: <{to_uri}>\r\n")),
    }
    out.push_str(&format!("Call-ID: {call_id}\r\n"));
    out.push_str(&format!("CSeq: {cseq} {cseq_method}\r\n"));
    out.push_str(extra_headers);
    out.push_str(&format!("Content-Length: {}\r\n", body.len()));
    if !body.is_empty() {
        if let Some(ct) = content_type {
            out.push_str(&format!("Content-Type: {ct}\r\n"));
        }
    }
    out.push_str("\r\n");
    out.push_str(body);
    out
}

#[allow(clippy::too_many_arguments)]
fn sip_request(
    method: &str,
    request_uri: &str,
    from_uri: &str,
    from_tag: &str,
    to_uri: &str,
    call_id: &str,
    cseq: u32,
    contact: Option<&str>,
    content_type: Option<&str>,
    body: &str,
) -> String {
    let mut out = format!("{method} {request_uri} SIP/2.0\r\n");
    out.push_str("Via: SIP/2.0/UDP 203.0.113.9:5062;branch=z9hG4bKcarol\r\n");
    out.push_str("Max-Forwards: 70\r\n");
    out.push_str(&format!("From: <{from_uri}>;tag={from_tag}\r\n"));
    out.push_str(&format!("To: <{to_uri}>\r\n"));
    out.push_str(&format!("Call-ID: {call_id}\r\n"));
    out.push_str(&format!("CSeq: {cseq} {method}\r\n"));
    if let Some(c) = contact {
        out.push_str(&format!("Contact: <{c}>\r\n"));
    }
    out.push_str(&format!("Content-Length: {}\r\n", body.len()));
    if !body.is_empty() {
        if let Some(ct) = content_type {
            out.push_str(&format!("Content-Type: {ct}\r\n"));
        }
    }
    out.push_str("\r\n");
    out.push_str(body);
    out
}

/// REGISTER is challenged with `401` and correctly retried with Digest,
/// then accepted.
#[test_log::test]
fn s1_registration_retries_with_digest_after_401() {
    let (peer_sock, peer_addr) = peer();
    let mut eng = new_engine("alice", "s3cret");
    eng.attach_proxy(&peer_addr.ip().to_string(), peer_addr.port(), 0).unwrap();

    eng.register(0).unwrap();
    let (raw, engine_addr) = recv(&peer_sock);
    let first = parser::parse_message(&raw).unwrap();
    let StartLine::Request { method, request_uri } = first.start_line else {
        panic!("expected a request, got {raw:?}");
    };
    assert_eq!(method, "REGISTER");
    assert!(header_value(&raw, "Authorization").is_none());
    let call_id = first.call_id.clone().unwrap();
    let local_uri = first.from.as_ref().unwrap().addr.as_str().to_string();
    let from_tag = first.from.as_ref().unwrap().tag.clone().unwrap();
    let cseq = first.cseq.as_ref().unwrap().seq;

    let challenge = sip_response(
        401,
        "Unauthorized",
        &local_uri,
        &from_tag,
        &local_uri,
        None,
        &call_id,
        cseq,
        "REGISTER",
        "WWW-Authenticate: Digest realm=\"example.org\", nonce=\"abc\", qop=\"auth\", algorithm=MD5\r\n",
        None,
        "",
    );
    send(&peer_sock, engine_addr, &challenge);

    let events = eng.poll(10);
    assert_eq!(events & EVENT_REGISTERED, 0, "should not yet be registered after a 401");

    let (retry_raw, _) = recv(&peer_sock);
    let retry = parser::parse_message(&retry_raw).unwrap();
    assert_eq!(retry.cseq.as_ref().unwrap().method, "REGISTER");

    let auth_value = header_value(&retry_raw, "Authorization").expect("retry carries an Authorization header");
    let params = auth_value.trim_start_matches("Digest").trim();
    assert_eq!(digest_param(params, "username"), "alice");
    assert_eq!(digest_param(params, "realm"), "example.org");
    assert_eq!(digest_param(params, "nonce"), "abc");
    assert_eq!(digest_param(params, "nc"), "00000001");
    let uri = digest_param(params, "uri");
    let cnonce = digest_param(params, "cnonce");
    let response_hex = digest_param(params, "response");

    let ha1 = digest::ha1(Algorithm::Md5, "alice", "example.org", "s3cret", "abc", cnonce);
    let ha2 = digest::ha2(Some(Qop::Auth), "REGISTER", uri, b"");
    let expected = digest::response(&ha1, "abc", Some("00000001"), Some(cnonce), Some(Qop::Auth), &ha2);
    assert_eq!(response_hex, expected, "retried REGISTER must carry the RFC 2617 digest response");

    let ok = sip_response(
        200,
        "OK",
        &local_uri,
        &from_tag,
        &local_uri,
        Some("proxy-assigned-tag"),
        &call_id,
        retry.cseq.as_ref().unwrap().seq,
        "REGISTER",
        "",
        None,
        "",
    );
    send(&peer_sock, engine_addr, &ok);

    let events = eng.poll(20);
    assert_ne!(events & EVENT_REGISTERED, 0, "200 OK must complete registration");
}

/// An outgoing call rings, is answered with an SDP answer listing G722
/// ahead of PCMU, and the engine negotiates G722 per the first-in-order
/// selection rule.
#[test_log::test]
fn s2_outgoing_call_is_answered_and_negotiates_codec() {
    let (peer_sock, peer_addr) = peer();
    let mut eng = new_engine("alice", "s3cret");
    eng.attach_proxy(&peer_addr.ip().to_string(), peer_addr.port(), 0).unwrap();

    eng.start_call("sip:bob@example.org", 0).unwrap();
    let (raw, engine_addr) = recv(&peer_sock);
    let invite = parser::parse_message(&raw).unwrap();
    let StartLine::Request { method, .. } = invite.start_line else { panic!("expected INVITE") };
    assert_eq!(method, "INVITE");
    let call_id = invite.call_id.clone().unwrap();
    let from_tag = invite.from.as_ref().unwrap().tag.clone().unwrap();
    let local_uri = invite.from.as_ref().unwrap().addr.as_str().to_string();
    let cseq = invite.cseq.as_ref().unwrap().seq;

    let trying = sip_response(100, "Trying", &local_uri, &from_tag, "sip:bob@example.org", None, &call_id, cseq, "INVITE", "", None, "");
    send(&peer_sock, engine_addr, &trying);
    let events = eng.poll(10);
    assert_eq!(events & (EVENT_RINGING | EVENT_CALL_CONFIRMED), 0, "100 Trying carries no observable event");

    let ringing = sip_response(180, "Ringing", &local_uri, &from_tag, "sip:bob@example.org", Some("bt"), &call_id, cseq, "INVITE", "", None, "");
    send(&peer_sock, engine_addr, &ringing);
    let events = eng.poll(20);
    assert_ne!(events & EVENT_RINGING, 0, "180 Ringing with a To tag must emit RINGING");

    let answer_sdp = SdpBody {
        session_id: 99,
        local_ip: "198.51.100.7".parse().unwrap(),
        local_port: 40000,
        payload_types: vec![9, 0], // G722 first: first-in-offer-order selects G722.
    }
    .render();
    let ok = sip_response(
        200,
        "OK",
        &local_uri,
        &from_tag,
        "sip:bob@example.org",
        Some("bt"),
        &call_id,
        cseq,
        "INVITE",
        "Contact: <sip:bob@198.51.100.7:5080>\r\nRecord-Route: <sip:proxy.example.org;lr>\r\n",
        Some("application/sdp"),
        &answer_sdp,
    );
    send(&peer_sock, engine_addr, &ok);
    let events = eng.poll(30);
    assert_ne!(events & EVENT_CALL_CONFIRMED, 0, "200 OK must confirm the call");
    assert_eq!(eng.remote_audio_port(), Some(40000));
    assert_eq!(eng.audio_format(), Some(9), "first supported payload type in answer order (G722) must be chosen");

    let (ack_raw, _) = recv(&peer_sock);
    let ack = parser::parse_message(&ack_raw).unwrap();
    let StartLine::Request { method, request_uri } = ack.start_line else { panic!("expected ACK") };
    assert_eq!(method, "ACK");
    assert_eq!(request_uri, "sip:bob@198.51.100.7:5080", "ACK targets the answer's Contact URI");
}

/// An incoming INVITE rings, and the upper layer declines it; a later
/// INVITE on a fresh Call-ID is accepted normally, confirming the declined
/// dialog no longer counts as busy.
#[test_log::test]
fn s3_incoming_call_is_declined() {
    let (peer_sock, peer_addr) = peer();
    let mut eng = new_engine("alice", "s3cret");
    eng.attach_proxy(&peer_addr.ip().to_string(), peer_addr.port(), 0).unwrap();

    eng.register(0).unwrap();
    let (_, engine_addr) = recv(&peer_sock);
    let ok = sip_response(200, "OK", "sip:alice@127.0.0.1", "alice-tag", "sip:alice@127.0.0.1", Some("srv-tag"), "reg-1", 1, "REGISTER", "", None, "");
    send(&peer_sock, engine_addr, &ok);
    eng.poll(0);

    let offer = SdpBody {
        session_id: 1,
        local_ip: "203.0.113.9".parse().unwrap(),
        local_port: 41000,
        payload_types: vec![9, 8, 0],
    }
    .render();
    let invite = sip_request(
        "INVITE",
        "sip:alice@127.0.0.1",
        "sip:carol@example.org",
        "ct",
        "sip:alice@127.0.0.1",
        "X",
        1,
        Some("sip:carol@203.0.113.9:5062"),
        Some("application/sdp"),
        &offer,
    );
    send(&peer_sock, engine_addr, &invite);
    let events = eng.poll(100);
    assert_ne!(events & EVENT_INCOMING_CALL, 0);

    let (ringing_raw, _) = recv(&peer_sock);
    let ringing = parser::parse_message(&ringing_raw).unwrap();
    let StartLine::Response { status, .. } = ringing.start_line else { panic!("expected a response") };
    assert_eq!(status, 180);

    eng.decline_call(200).unwrap();
    let (decline_raw, _) = recv(&peer_sock);
    let decline = parser::parse_message(&decline_raw).unwrap();
    let StartLine::Response { status, reason } = decline.start_line else { panic!("expected a response") };
    assert_eq!(status, 603);
    assert_eq!(reason, "Decline");

    // A fresh call must ring normally: the declined dialog must not still
    // read as busy.
    let invite2 = sip_request(
        "INVITE",
        "sip:alice@127.0.0.1",
        "sip:carol@example.org",
        "ct2",
        "sip:alice@127.0.0.1",
        "X2",
        1,
        Some("sip:carol@203.0.113.9:5062"),
        Some("application/sdp"),
        &offer,
    );
    send(&peer_sock, engine_addr, &invite2);
    let events = eng.poll(300);
    assert_ne!(events & EVENT_INCOMING_CALL, 0, "a terminated dialog must not block a later call as busy");
}

/// After an answered call, the local party hangs up; the BYE carries the
/// dialog's learned route set, and the 200 OK response terminates the call.
#[test_log::test]
fn s4_local_hangup_sends_bye_and_confirms_termination() {
    let (peer_sock, peer_addr) = peer();
    let mut eng = new_engine("alice", "s3cret");
    eng.attach_proxy(&peer_addr.ip().to_string(), peer_addr.port(), 0).unwrap();

    eng.start_call("sip:bob@example.org", 0).unwrap();
    let (raw, engine_addr) = recv(&peer_sock);
    let invite = parser::parse_message(&raw).unwrap();
    let call_id = invite.call_id.clone().unwrap();
    let from_tag = invite.from.as_ref().unwrap().tag.clone().unwrap();
    let local_uri = invite.from.as_ref().unwrap().addr.as_str().to_string();
    let cseq = invite.cseq.as_ref().unwrap().seq;

    let answer_sdp = SdpBody {
        session_id: 2,
        local_ip: "198.51.100.7".parse().unwrap(),
        local_port: 40000,
        payload_types: vec![9, 0],
    }
    .render();
    let ok = sip_response(
        200,
        "OK",
        &local_uri,
        &from_tag,
        "sip:bob@example.org",
        Some("bt"),
        &call_id,
        cseq,
        "INVITE",
        "Contact: <sip:bob@198.51.100.7:5080>\r\nRecord-Route: <sip:proxy.example.org;lr>\r\n",
        Some("application/sdp"),
        &answer_sdp,
    );
    send(&peer_sock, engine_addr, &ok);
    let events = eng.poll(10);
    assert_ne!(events & EVENT_CALL_CONFIRMED, 0);
    recv(&peer_sock); // the ACK triggered by confirmation

    eng.terminate_call(20).unwrap();
    let (bye_raw, _) = recv(&peer_sock);
    let bye = parser::parse_message(&bye_raw).unwrap();
    let StartLine::Request { method, request_uri } = bye.start_line else { panic!("expected BYE") };
    assert_eq!(method, "BYE");
    assert_eq!(request_uri, "sip:bob@198.51.100.7:5080", "BYE targets the dialog's remote target");
    assert_eq!(bye.cseq.as_ref().unwrap().seq, 2, "local CSeq must advance past the INVITE's");
    assert!(header_value(&bye_raw, "Route").unwrap().contains("proxy.example.org"));

    let bye_ok = sip_response(
        200,
        "OK",
        &local_uri,
        &from_tag,
        "sip:bob@example.org",
        Some("bt"),
        &call_id,
        bye.cseq.as_ref().unwrap().seq,
        "BYE",
        "",
        None,
        "",
    );
    send(&peer_sock, engine_addr, &bye_ok);
    let events = eng.poll(30);
    assert_ne!(events & EVENT_CALL_TERMINATED, 0);
}

/// Once registered, the engine sends an RFC 5626 `CRLF CRLF` keepalive once
/// the ping period elapses, and a returned `CRLF` pong is recognized.
#[test_log::test]
fn s5_keepalive_ping_and_pong() {
    let (peer_sock, peer_addr) = peer();
    let mut eng = new_engine("alice", "s3cret");
    eng.attach_proxy(&peer_addr.ip().to_string(), peer_addr.port(), 0).unwrap();

    eng.register(0).unwrap();
    let (_, engine_addr) = recv(&peer_sock);
    let ok = sip_response(200, "OK", "sip:alice@127.0.0.1", "alice-tag", "sip:alice@127.0.0.1", Some("srv-tag"), "reg-1", 1, "REGISTER", "", None, "");
    send(&peer_sock, engine_addr, &ok);
    let events = eng.poll(0);
    assert_ne!(events & EVENT_REGISTERED, 0);

    // 14 idle polls keep poll_count below the next multiple of 16; timers
    // don't run on any of these (a message was taken on poll #1 above).
    for i in 1..15u64 {
        eng.poll(i * 100);
    }
    // poll_count is now 15; this poll is #16 and ticks the timers with
    // no pending message, past the 58.761s ping period but still under
    // the 60s registration-refresh window.
    let events = eng.poll(60_000);
    assert_eq!(events & EVENT_REGISTERED, 0);

    let (ping_raw, ping_from) = recv(&peer_sock);
    assert_eq!(ping_raw, "\r\n\r\n", "keepalive ping is a bare CRLFCRLF");
    assert_eq!(ping_from, engine_addr, "ping is sent over the existing proxy connection");

    send(&peer_sock, engine_addr, "\r\n");
    let events = eng.poll(60_001);
    assert_ne!(events & EVENT_PONGED, 0, "a CRLF reply must be recognized as a pong");
}

/// An incoming INVITE offering only an unsupported codec is rejected with
/// 488 and the new dialog is never confirmed.
#[test_log::test]
fn s6_unsupported_codec_is_rejected() {
    let (peer_sock, peer_addr) = peer();
    let mut eng = new_engine("alice", "s3cret");
    eng.attach_proxy(&peer_addr.ip().to_string(), peer_addr.port(), 0).unwrap();

    eng.register(0).unwrap();
    let (_, engine_addr) = recv(&peer_sock);
    let ok = sip_response(200, "OK", "sip:alice@127.0.0.1", "alice-tag", "sip:alice@127.0.0.1", Some("srv-tag"), "reg-1", 1, "REGISTER", "", None, "");
    send(&peer_sock, engine_addr, &ok);
    eng.poll(0);

    let offer = SdpBody {
        session_id: 1,
        local_ip: "203.0.113.9".parse().unwrap(),
        local_port: 41000,
        payload_types: vec![18], // G729: not in SUPPORTED_PAYLOADS.
    }
    .render();
    let invite = sip_request(
        "INVITE",
        "sip:alice@127.0.0.1",
        "sip:carol@example.org",
        "ct",
        "sip:alice@127.0.0.1",
        "bad-codec-call",
        1,
        Some("sip:carol@203.0.113.9:5062"),
        Some("application/sdp"),
        &offer,
    );
    send(&peer_sock, engine_addr, &invite);
    let events = eng.poll(100);
    assert_eq!(events & EVENT_INCOMING_CALL, 0, "an unsupported-codec offer must not ring");
    assert_ne!(events & EVENT_CALL_TERMINATED, 0);
    assert_ne!(events & EVENT_SIP_ERROR, 0);

    let (resp_raw, _) = recv(&peer_sock);
    let resp = parser::parse_message(&resp_raw).unwrap();
    let StartLine::Response { status, .. } = resp.start_line else { panic!("expected a response") };
    assert_eq!(status, 488);
}
