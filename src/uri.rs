//! SIP address-spec parsing (`AddrSpec`).
//!
//! Grounded on `original_source/WiPhone/tinySIP.h`'s `AddrSpec` class and
//! spec §4.1. Unlike the teacher's fully-typed [`Uri`]-with-builder model,
//! this stays a thin decomposed view over the original string: the spec
//! requires byte-equivalent round-tripping for retransmission, which a
//! structured/normalized URI type would not give for free.
//!
//! [`Uri`]: https://docs.rs/pksip (reference only, not a crate dependency)

use std::cell::OnceCell;
use std::fmt;

/// A decomposed SIP/SIPS/absolute URI.
///
/// Construction is destructive-in-spirit but side-effect-free: the input is
/// copied once, then split into borrowed regions of that copy. `host()` and
/// `port()` lazily materialize further (host as an owned string without the
/// port suffix, port defaulting to `0` when absent), matching the "more
/// memory after being accessed" comment on the original C++ class.
///
/// No percent-decoding happens anywhere in this type: the stored substrings
/// are byte-identical to the corresponding region of the input, so they can
/// be written back onto the wire unchanged.
#[derive(Debug, Clone)]
pub struct AddrSpec {
    original: String,
    scheme: Option<(usize, usize)>,
    userinfo: Option<(usize, usize)>,
    hostport: Option<(usize, usize)>,
    uri_params: Option<(usize, usize)>,
    headers: Option<(usize, usize)>,
    host: OnceCell<String>,
    port: OnceCell<u16>,
}

impl AddrSpec {
    /// Parses `s` into an `AddrSpec`.
    ///
    /// If no scheme can be found (no top-level `:`), every field is left
    /// empty — callers must check [`AddrSpec::scheme`] before trusting any
    /// other accessor, mirroring the original's "all fields remain null"
    /// contract.
    pub fn new(s: &str) -> Self {
        let original = s.to_string();
        let bytes = original.as_bytes();

        let Some(colon) = bytes.iter().position(|&b| b == b':') else {
            return Self {
                original,
                scheme: None,
                userinfo: None,
                hostport: None,
                uri_params: None,
                headers: None,
                host: OnceCell::new(),
                port: OnceCell::new(),
            };
        };

        let scheme = Some((0, colon));
        let rest_start = colon + 1;
        let rest = &bytes[rest_start..];

        let is_sip = original[..colon].eq_ignore_ascii_case("sip") || original[..colon].eq_ignore_ascii_case("sips");

        if !is_sip {
            // absoluteURI: collapse everything after the scheme into hostport.
            return Self {
                hostport: Some((rest_start, bytes.len())),
                original,
                scheme,
                userinfo: None,
                uri_params: None,
                headers: None,
                host: OnceCell::new(),
                port: OnceCell::new(),
            };
        }

        // [userinfo@]hostport[;uri-params][?headers]
        let at = find_byte(rest, b'@');
        let semi = find_byte(rest, b';');
        let qmark = find_byte(rest, b'?');

        let userinfo_end = at;
        let hostport_start = match at {
            Some(pos) => rest_start + pos + 1,
            None => rest_start,
        };
        let hostport_end = match (semi, qmark) {
            (Some(s), Some(q)) => rest_start + s.min(q),
            (Some(s), None) => rest_start + s,
            (None, Some(q)) => rest_start + q,
            (None, None) => bytes.len(),
        };
        let uri_params = match semi {
            Some(s) => {
                let end = qmark.filter(|&q| q > s).map(|q| rest_start + q).unwrap_or(bytes.len());
                Some((rest_start + s + 1, end))
            }
            None => None,
        };
        let headers = qmark.map(|q| (rest_start + q + 1, bytes.len()));

        Self {
            original,
            scheme,
            userinfo: userinfo_end.map(|end| (rest_start, rest_start + end)),
            hostport: Some((hostport_start, hostport_end)),
            uri_params,
            headers,
            host: OnceCell::new(),
            port: OnceCell::new(),
        }
    }

    fn slice(&self, region: Option<(usize, usize)>) -> Option<&str> {
        region.map(|(start, end)| &self.original[start..end])
    }

    /// The URI scheme (e.g. `"sip"`), or `None` if no scheme was found.
    pub fn scheme(&self) -> Option<&str> {
        self.slice(self.scheme)
    }

    /// The `userinfo` component (before `@`), if present.
    pub fn userinfo(&self) -> Option<&str> {
        self.slice(self.userinfo)
    }

    /// The raw `hostport` authority, unsplit.
    pub fn host_port(&self) -> Option<&str> {
        self.slice(self.hostport)
    }

    /// The semicolon-separated `uri-params` region, unsplit.
    pub fn uri_params(&self) -> Option<&str> {
        self.slice(self.uri_params)
    }

    /// The `?`-introduced headers region, unsplit.
    pub fn headers(&self) -> Option<&str> {
        self.slice(self.headers)
    }

    /// The host part of [`AddrSpec::host_port`], split off from the port at
    /// the last unbracketed `:`. Materialized and cached on first access.
    pub fn host(&self) -> &str {
        self.host.get_or_init(|| match self.host_port() {
            Some(hp) => split_host_port(hp).0.to_string(),
            None => String::new(),
        })
    }

    /// The port, or `0` if absent. Materialized and cached on first access.
    pub fn port(&self) -> u16 {
        *self.port.get_or_init(|| match self.host_port() {
            Some(hp) => split_host_port(hp).1.unwrap_or(0),
            None => 0,
        })
    }

    /// Returns `true` if `param` appears (with or without a value) in
    /// [`AddrSpec::uri_params`].
    pub fn has_parameter(&self, param: &str) -> bool {
        match self.uri_params() {
            Some(params) => params.split(';').any(|p| {
                let name = p.split('=').next().unwrap_or(p);
                name.eq_ignore_ascii_case(param)
            }),
            None => false,
        }
    }

    /// The original string this `AddrSpec` was parsed from.
    pub fn as_str(&self) -> &str {
        &self.original
    }
}

impl fmt::Display for AddrSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}

impl PartialEq for AddrSpec {
    fn eq(&self, other: &Self) -> bool {
        self.original == other.original
    }
}

impl Eq for AddrSpec {}

fn find_byte(haystack: &[u8], needle: u8) -> Option<usize> {
    haystack.iter().position(|&b| b == needle)
}

/// Splits `hostport` at the last `:` that is not inside `[...]` (an IPv6
/// literal). Returns `(host, port)`.
fn split_host_port(hostport: &str) -> (&str, Option<u16>) {
    let bytes = hostport.as_bytes();
    if bytes.first() == Some(&b'[') {
        // IPv6 reference: host is up to and including the closing bracket.
        if let Some(close) = bytes.iter().position(|&b| b == b']') {
            let host = &hostport[..=close];
            let rest = &hostport[close + 1..];
            let port = rest.strip_prefix(':').and_then(|p| p.parse().ok());
            return (host, port);
        }
        return (hostport, None);
    }
    match bytes.iter().rposition(|&b| b == b':') {
        Some(idx) => {
            let host = &hostport[..idx];
            let port = hostport[idx + 1..].parse().ok();
            (host, port)
        }
        None => (hostport, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_sip_uri() {
        let a = AddrSpec::new("sip:alice@atlanta.com:5060");
        assert_eq!(a.scheme(), Some("sip"));
        assert_eq!(a.userinfo(), Some("alice"));
        assert_eq!(a.host_port(), Some("atlanta.com:5060"));
        assert_eq!(a.host(), "atlanta.com");
        assert_eq!(a.port(), 5060);
    }

    #[test]
    fn no_userinfo_no_port() {
        let a = AddrSpec::new("sip:example.org");
        assert_eq!(a.userinfo(), None);
        assert_eq!(a.host(), "example.org");
        assert_eq!(a.port(), 0);
    }

    #[test]
    fn uri_params_and_headers() {
        let a = AddrSpec::new("sip:bob@biloxi.com;transport=udp?Subject=project");
        assert_eq!(a.host_port(), Some("biloxi.com"));
        assert_eq!(a.uri_params(), Some("transport=udp"));
        assert_eq!(a.headers(), Some("Subject=project"));
        assert!(a.has_parameter("transport"));
        assert!(!a.has_parameter("lr"));
    }

    #[test]
    fn ipv6_bracketed_host_is_not_split_on_inner_colons() {
        let a = AddrSpec::new("sip:alice@[2001:db8::1]:5061");
        assert_eq!(a.host(), "[2001:db8::1]");
        assert_eq!(a.port(), 5061);
    }

    #[test]
    fn missing_scheme_leaves_everything_none() {
        let a = AddrSpec::new("not-a-uri");
        assert_eq!(a.scheme(), None);
        assert_eq!(a.host_port(), None);
    }

    #[test]
    fn absolute_uri_collapses_rest_into_hostport() {
        let a = AddrSpec::new("tel:+14155550100");
        assert_eq!(a.scheme(), Some("tel"));
        assert_eq!(a.host_port(), Some("+14155550100"));
    }

    #[test]
    fn round_trips_byte_identically() {
        let s = "sip:alice:s3cr3t@atlanta.com:5060;transport=tcp?Subject=hi";
        let a = AddrSpec::new(s);
        let reassembled = format!(
            "{}:{}{}{}{}",
            a.scheme().unwrap(),
            a.userinfo().map(|u| format!("{u}@")).unwrap_or_default(),
            a.host_port().unwrap(),
            a.uri_params().map(|p| format!(";{p}")).unwrap_or_default(),
            a.headers().map(|h| format!("?{h}")).unwrap_or_default(),
        );
        assert_eq!(reassembled, s);
        assert_eq!(a.to_string(), s);
    }
}
