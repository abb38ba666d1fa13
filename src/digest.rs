//! RFC 2617 Digest access authentication.
//!
//! Grounded on `original_source/WiPhone/src/digcalc.c` ("Reference Digest
//! implementation from RFC 2617") and spec §4.8.

use std::fmt::Write as _;

/// Selected quality-of-protection mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qop {
    Auth,
    AuthInt,
}

impl Qop {
    /// Picks `auth-int` over `auth` when both are offered, per spec §4.6
    /// ("the engine selects the first of `auth-int` or `auth` present").
    pub fn select(offered: &str) -> Option<Qop> {
        let opts: Vec<&str> = offered.split(',').map(str::trim).collect();
        if opts.iter().any(|o| o.eq_ignore_ascii_case("auth-int")) {
            Some(Qop::AuthInt)
        } else if opts.iter().any(|o| o.eq_ignore_ascii_case("auth")) {
            Some(Qop::Auth)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Qop::Auth => "auth",
            Qop::AuthInt => "auth-int",
        }
    }
}

/// Digest algorithm selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Algorithm {
    #[default]
    Md5,
    Md5Sess,
}

impl Algorithm {
    pub fn parse(s: Option<&str>) -> Algorithm {
        match s.map(str::trim) {
            Some(s) if s.eq_ignore_ascii_case("md5-sess") => Algorithm::Md5Sess,
            _ => Algorithm::Md5,
        }
    }
}

fn md5_hex(data: &str) -> String {
    let digest = md5::compute(data.as_bytes());
    let mut out = String::with_capacity(32);
    for byte in digest.0 {
        write!(out, "{byte:02x}").unwrap();
    }
    out
}

/// `HA1 = MD5(user:realm:password)`, or, for MD5-sess,
/// `HA1 = MD5(MD5(user:realm:password):nonce:cnonce)`.
pub fn ha1(algorithm: Algorithm, user: &str, realm: &str, password: &str, nonce: &str, cnonce: &str) -> String {
    let base = md5_hex(&format!("{user}:{realm}:{password}"));
    match algorithm {
        Algorithm::Md5 => base,
        Algorithm::Md5Sess => md5_hex(&format!("{base}:{nonce}:{cnonce}")),
    }
}

/// `HA2 = MD5(method:digest-uri)`, or, for qop=auth-int,
/// `HA2 = MD5(method:digest-uri:MD5(entity-body))`.
pub fn ha2(qop: Option<Qop>, method: &str, digest_uri: &str, entity_body: &[u8]) -> String {
    match qop {
        Some(Qop::AuthInt) => {
            let h_entity = md5_hex(std::str::from_utf8(entity_body).unwrap_or(""));
            md5_hex(&format!("{method}:{digest_uri}:{h_entity}"))
        }
        _ => md5_hex(&format!("{method}:{digest_uri}")),
    }
}

/// `response = MD5(HA1:nonce:nc:cnonce:qop:HA2)` when qop is present, else
/// `MD5(HA1:nonce:HA2)`.
pub fn response(ha1: &str, nonce: &str, nc: Option<&str>, cnonce: Option<&str>, qop: Option<Qop>, ha2: &str) -> String {
    match qop {
        Some(qop) => {
            let nc = nc.unwrap_or("00000000");
            let cnonce = cnonce.unwrap_or("");
            md5_hex(&format!("{ha1}:{nonce}:{nc}:{cnonce}:{}:{ha2}", qop.as_str()))
        }
        None => md5_hex(&format!("{ha1}:{nonce}:{ha2}")),
    }
}

/// A fully-computed Digest credential, ready to render into an
/// `Authorization`/`Proxy-Authorization` header value.
#[derive(Debug, Clone)]
pub struct Credential {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub qop: Option<Qop>,
    pub nc: Option<String>,
    pub cnonce: Option<String>,
    pub uri: String,
    pub response: String,
}

impl Credential {
    /// Computes a credential for `method`/`digest_uri` against `challenge`,
    /// using the 8-hex-digit nonce-count `nc` and `cnonce` supplied by the
    /// caller (the engine owns nonce-count/cnonce lifetime across retries;
    /// see spec §4.8).
    #[allow(clippy::too_many_arguments)]
    pub fn compute(
        username: &str,
        password: &str,
        method: &str,
        digest_uri: &str,
        entity_body: &[u8],
        realm: &str,
        nonce: &str,
        opaque: Option<&str>,
        algorithm: Algorithm,
        qop: Option<Qop>,
        nc: u32,
        cnonce: &str,
    ) -> Self {
        let ha1 = ha1(algorithm, username, realm, password, nonce, cnonce);
        let ha2 = ha2(qop, method, digest_uri, entity_body);
        let nc_hex = format!("{nc:08x}");
        let resp = response(&ha1, nonce, Some(&nc_hex), Some(cnonce), qop, &ha2);

        Self {
            username: username.to_string(),
            realm: realm.to_string(),
            nonce: nonce.to_string(),
            opaque: opaque.filter(|o| !o.is_empty()).map(str::to_string),
            qop,
            nc: qop.map(|_| nc_hex),
            cnonce: qop.map(|_| cnonce.to_string()),
            uri: digest_uri.to_string(),
            response: resp,
        }
    }

    /// Renders the `Digest ...` parameter list (without the header name).
    pub fn to_header_value(&self) -> String {
        let mut s = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\"",
            self.username, self.realm, self.nonce, self.uri
        );
        if let Some(opaque) = &self.opaque {
            write!(s, ", opaque=\"{opaque}\"").unwrap();
        }
        if let Some(qop) = self.qop {
            write!(s, ", qop={}", qop.as_str()).unwrap();
            if let Some(nc) = &self.nc {
                write!(s, ", nc={nc}").unwrap();
            }
            if let Some(cnonce) = &self.cnonce {
                write!(s, ", cnonce=\"{cnonce}\"").unwrap();
            }
        }
        write!(s, ", response=\"{}\"", self.response).unwrap();
        s
    }
}
