//! Outbound request/response rendering.
//!
//! Grounded on spec §4.5 and `original_source/WiPhone/tinySIP.cpp`'s
//! `sendInvite`/`sendAck`/`sendBye`/`sendCancel`/`sendRegister`/
//! `sendMessage` family (the `TCP(tcp, "...")`/`TCP_PRINTF` header-writing
//! calls around lines 3650-3820), collapsed here into one line-builder
//! shared by every method, the way those functions already share a single
//! header-writing helper.

use std::net::IpAddr;

use crate::connection::TransportKind;
use crate::message::default_reason_phrase;

/// Everything needed to render the common header block of an outbound
/// request. Per-method builders fill this in and call [`render_request`].
pub struct RequestParams<'a> {
    pub method: &'a str,
    pub request_uri: &'a str,
    pub via_ip: IpAddr,
    pub via_port: u16,
    pub transport: TransportKind,
    pub branch: &'a str,
    pub route: &'a [String],
    pub from_display: &'a str,
    pub from_uri: &'a str,
    pub from_tag: &'a str,
    pub to_display: &'a str,
    pub to_uri: &'a str,
    pub to_tag: Option<&'a str>,
    pub call_id: &'a str,
    pub cseq: u32,
    pub cseq_method: &'a str,
    pub contact: Option<ContactParams<'a>>,
    pub authorization: Option<(&'a str, String)>,
    pub content_type: Option<&'a str>,
    pub body: &'a str,
}

/// The `Contact:` header's variable parts (spec §4.5).
pub struct ContactParams<'a> {
    pub phone_number: &'a str,
    pub local_ip: IpAddr,
    pub local_port: u16,
    pub transport: TransportKind,
    pub instance_uuid: &'a str,
}

fn transport_name(kind: TransportKind) -> &'static str {
    match kind {
        TransportKind::Udp => "UDP",
        TransportKind::Tcp => "TCP",
    }
}

fn transport_lower(kind: TransportKind) -> &'static str {
    match kind {
        TransportKind::Udp => "udp",
        TransportKind::Tcp => "tcp",
    }
}

/// Renders a full request, CRLF-terminated, ready to hand to
/// [`crate::connection::Connection::write`].
pub fn render_request(p: &RequestParams<'_>) -> String {
    let mut out = String::new();
    out.push_str(&format!("{} {} SIP/2.0\r\n", p.method, p.request_uri));
    out.push_str(&format!(
        "Via: SIP/2.0/{} {}:{};rport;branch={};alias\r\n",
        transport_name(p.transport),
        p.via_ip,
        p.via_port,
        p.branch
    ));
    out.push_str("Max-Forwards: 70\r\n");
    for route in p.route {
        out.push_str(&format!("Route: {route}\r\n"));
    }
    out.push_str(&format!(
        "From: \"{}\" <{}>;tag={}\r\n",
        p.from_display, p.from_uri, p.from_tag
    ));
    match p.to_tag {
        Some(tag) => out.push_str(&format!("To: \"{}\" <{}>;tag={}\r\n", p.to_display, p.to_uri, tag)),
        None => out.push_str(&format!("To: \"{}\" <{}>\r\n", p.to_display, p.to_uri)),
    }
    out.push_str(&format!("Call-ID: {}\r\n", p.call_id));
    out.push_str(&format!("CSeq: {} {}\r\n", p.cseq, p.cseq_method));
    if let Some(contact) = &p.contact {
        out.push_str(&format!(
            "Contact: <sip:{}@{}:{};transport={};ob>;+sip.instance=\"<urn:uuid:{}>\"\r\n",
            contact.phone_number,
            contact.local_ip,
            contact.local_port,
            transport_lower(contact.transport),
            contact.instance_uuid
        ));
    }
    out.push_str("User-Agent: tinySIP/0.6.0alpha\r\n");
    if let Some((name, value)) = &p.authorization {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str(&format!("Content-Length: {}\r\n", p.body.len()));
    if !p.body.is_empty() {
        if let Some(ct) = p.content_type {
            out.push_str(&format!("Content-Type: {ct}\r\n"));
        }
    }
    out.push_str("\r\n");
    out.push_str(p.body);
    out
}

/// Renders an engine-originated response (spec §4.9: 180/200/486/488/481/
/// 603/200-for-BYE/200-for-CANCEL etc).
pub struct ResponseParams<'a> {
    pub status: u16,
    pub reason: Option<&'a str>,
    pub via: &'a [String],
    pub from_display: &'a str,
    pub from_uri: &'a str,
    pub from_tag: &'a str,
    pub to_display: &'a str,
    pub to_uri: &'a str,
    pub to_tag: &'a str,
    pub call_id: &'a str,
    pub cseq: u32,
    pub cseq_method: &'a str,
    pub contact: Option<ContactParams<'a>>,
    pub content_type: Option<&'a str>,
    pub body: &'a str,
}

pub fn render_response(p: &ResponseParams<'_>) -> String {
    let reason = p.reason.map(str::to_string).unwrap_or_else(|| default_reason_phrase(p.status).to_string());
    let mut out = String::new();
    out.push_str(&format!("SIP/2.0 {} {}\r\n", p.status, reason));
    for via in p.via {
        out.push_str(&format!("Via: {via}\r\n"));
    }
    out.push_str(&format!("From: \"{}\" <{}>;tag={}\r\n", p.from_display, p.from_uri, p.from_tag));
    out.push_str(&format!("To: \"{}\" <{}>;tag={}\r\n", p.to_display, p.to_uri, p.to_tag));
    out.push_str(&format!("Call-ID: {}\r\n", p.call_id));
    out.push_str(&format!("CSeq: {} {}\r\n", p.cseq, p.cseq_method));
    if let Some(contact) = &p.contact {
        out.push_str(&format!(
            "Contact: <sip:{}@{}:{};transport={};ob>;+sip.instance=\"<urn:uuid:{}>\"\r\n",
            contact.phone_number,
            contact.local_ip,
            contact.local_port,
            transport_lower(contact.transport),
            contact.instance_uuid
        ));
    }
    out.push_str("User-Agent: tinySIP/0.6.0alpha\r\n");
    out.push_str(&format!("Content-Length: {}\r\n", p.body.len()));
    if !p.body.is_empty() {
        if let Some(ct) = p.content_type {
            out.push_str(&format!("Content-Type: {ct}\r\n"));
        }
    }
    out.push_str("\r\n");
    out.push_str(p.body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, 50))
    }

    #[test]
    fn renders_register_shaped_request() {
        let params = RequestParams {
            method: "REGISTER",
            request_uri: "sip:example.org",
            via_ip: ip(),
            via_port: 5060,
            transport: TransportKind::Udp,
            branch: "z9hG4bKMZJ-abc123def",
            route: &[],
            from_display: "alice",
            from_uri: "sip:alice@example.org",
            from_tag: "tag1",
            to_display: "alice",
            to_uri: "sip:alice@example.org",
            to_tag: None,
            call_id: "regcall1",
            cseq: 1,
            cseq_method: "REGISTER",
            contact: Some(ContactParams {
                phone_number: "alice",
                local_ip: ip(),
                local_port: 5060,
                transport: TransportKind::Udp,
                instance_uuid: "b5fc7dec-40e2-11e9-b210-aabbccddeeff",
            }),
            authorization: None,
            content_type: None,
            body: "",
        };
        let rendered = render_request(&params);
        assert!(rendered.starts_with("REGISTER sip:example.org SIP/2.0\r\n"));
        assert!(rendered.contains("Via: SIP/2.0/UDP 192.168.1.50:5060;rport;branch=z9hG4bKMZJ-abc123def;alias\r\n"));
        assert!(rendered.contains("To: \"alice\" <sip:alice@example.org>\r\n"));
        assert!(rendered.ends_with("Content-Length: 0\r\n\r\n"));
    }

    #[test]
    fn includes_authorization_header_when_present() {
        let params = RequestParams {
            method: "REGISTER",
            request_uri: "sip:example.org",
            via_ip: ip(),
            via_port: 5060,
            transport: TransportKind::Udp,
            branch: "z9hG4bKMZJ-abc123def",
            route: &[],
            from_display: "alice",
            from_uri: "sip:alice@example.org",
            from_tag: "tag1",
            to_display: "alice",
            to_uri: "sip:alice@example.org",
            to_tag: None,
            call_id: "regcall1",
            cseq: 2,
            cseq_method: "REGISTER",
            contact: None,
            authorization: Some(("Authorization", "Digest username=\"alice\"".to_string())),
            content_type: None,
            body: "",
        };
        let rendered = render_request(&params);
        assert!(rendered.contains("Authorization: Digest username=\"alice\"\r\n"));
    }

    #[test]
    fn response_mirrors_request_vias_in_order() {
        let params = ResponseParams {
            status: 180,
            reason: None,
            via: &["SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bK776asdhds".to_string()],
            from_display: "Bob",
            from_uri: "sip:bob@biloxi.com",
            from_tag: "bob-tag",
            to_display: "Alice",
            to_uri: "sip:alice@atlanta.com",
            to_tag: "alice-tag",
            call_id: "a84b4c76e66710",
            cseq: 1,
            cseq_method: "INVITE",
            contact: None,
            content_type: None,
            body: "",
        };
        let rendered = render_response(&params);
        assert!(rendered.starts_with("SIP/2.0 180 Ringing\r\n"));
        assert!(rendered.contains("Via: SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bK776asdhds\r\n"));
    }
}
