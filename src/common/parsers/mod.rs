pub mod protocols;

use base64::{prelude::BASE64_STANDARD, Engine};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use protocols::{ss, trojan, vless, vmess};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unsupported scheme in \"{0}\"")]
    UnsupportedScheme(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("missing field: {0}")]
    FieldMissing(&'static str),

    #[error("port out of range")]
    InvalidPort,

    #[error("failed to decode base64: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    #[error("failed to decode UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    Vless,
    Vmess,
    Trojan,
    Shadowsocks,
}

impl ServerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerKind::Vless => "vless",
            ServerKind::Vmess => "vmess",
            ServerKind::Trojan => "trojan",
            ServerKind::Shadowsocks => "shadowsocks",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    #[default]
    Tcp,
    Ws,
    Grpc,
    H2,
}

impl TransportKind {
    pub fn from_uri_value(value: &str) -> Result<Self, ParseError> {
        match value {
            "tcp" | "raw" => Ok(TransportKind::Tcp),
            "ws" | "websocket" => Ok(TransportKind::Ws),
            "grpc" | "gun" => Ok(TransportKind::Grpc),
            "h2" | "http" => Ok(TransportKind::H2),
            _ => Err(ParseError::InvalidPayload(format!(
                "unknown transport \"{value}\""
            ))),
        }
    }

    /// Engine wire name for `streamSettings.network`; HTTP/2 is "http" there.
    pub fn network(&self) -> &'static str {
        match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Ws => "ws",
            TransportKind::Grpc => "grpc",
            TransportKind::H2 => "http",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transport {
    pub kind: TransportKind,
    pub path: Option<String>,
    pub host: Option<String>,
    pub service_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsParams {
    pub sni: Option<String>,
    pub alpn: Option<Vec<String>>,
    pub fingerprint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealityParams {
    pub sni: String,
    pub public_key: String,
    pub short_id: String,
    pub fingerprint: String,
    pub spider_x: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Security {
    #[default]
    None,
    Tls(TlsParams),
    Reality(RealityParams),
}

/// One normalized proxy endpoint. Only the protocol parsers construct these;
/// two servers are equal iff their raw URIs are byte-equal.
#[derive(Debug, Clone)]
pub struct Server {
    pub(crate) raw_uri: String,
    pub(crate) kind: ServerKind,
    pub(crate) address: String,
    pub(crate) port: u16,
    pub(crate) id_or_password: String,
    pub(crate) transport: Transport,
    pub(crate) security: Security,
    pub(crate) cipher: String,
    pub(crate) flow: Option<String>,
    pub(crate) alter_id: u32,
    pub(crate) tag: String,
}

impl Server {
    pub fn raw_uri(&self) -> &str {
        &self.raw_uri
    }

    pub fn kind(&self) -> ServerKind {
        self.kind
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn id_or_password(&self) -> &str {
        &self.id_or_password
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn security(&self) -> &Security {
        &self.security
    }

    pub fn cipher(&self) -> &str {
        &self.cipher
    }

    pub fn flow(&self) -> Option<&str> {
        self.flow.as_deref()
    }

    pub fn alter_id(&self) -> u32 {
        self.alter_id
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// SNI to present to the engine: explicit sni, then host header, then address.
    pub fn server_name(&self) -> &str {
        match &self.security {
            Security::Reality(reality) => &reality.sni,
            Security::Tls(tls) => tls
                .sni
                .as_deref()
                .or(self.transport.host.as_deref())
                .unwrap_or(&self.address),
            Security::None => &self.address,
        }
    }
}

impl PartialEq for Server {
    fn eq(&self, other: &Self) -> bool {
        self.raw_uri == other.raw_uri
    }
}

impl Eq for Server {}

impl std::hash::Hash for Server {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.raw_uri.hash(state);
    }
}

pub fn is_supported_scheme(line: &str) -> bool {
    line.starts_with("vless://")
        || line.starts_with("vmess://")
        || line.starts_with("trojan://")
        || line.starts_with("ss://")
}

pub fn parse_uri(line: &str) -> Result<Server, ParseError> {
    let line = line.trim();
    match line.split("://").next().unwrap_or_default() {
        "vless" => vless::parse(line),
        "vmess" => vmess::parse(line),
        "trojan" => trojan::parse(line),
        "ss" => ss::parse(line),
        other => Err(ParseError::UnsupportedScheme(other.to_string())),
    }
}

/// Subscription bodies come either as plain URI lists or base64-wrapped ones.
pub fn decode_subscription_body(payload: &str) -> String {
    let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();

    match BASE64_STANDARD.decode(compact.as_bytes()) {
        Ok(decoded) => String::from_utf8_lossy(&decoded).into_owned(),
        Err(_) => payload.to_string(),
    }
}

/// Splits a decoded subscription body into servers, dropping anything that
/// does not parse. Dedup happens later, across all sources.
pub fn parse_payload(payload: &str) -> Vec<Server> {
    let mut servers = Vec::new();

    for line in payload.lines() {
        let line = line.trim();
        if line.is_empty() || !is_supported_scheme(line) {
            continue;
        }

        match parse_uri(line) {
            Ok(server) => servers.push(server),
            Err(err) => debug!(%err, uri = line, "dropping unparsable uri"),
        }
    }

    servers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_rejects_unknown_schemes() {
        assert!(matches!(
            parse_uri("hy2://auth@host:443#x"),
            Err(ParseError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            parse_uri("ssr://abcdef"),
            Err(ParseError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn equality_is_raw_uri_only() {
        let a = parse_uri("vless://uuid@a.example:443?type=tcp#one").unwrap();
        let b = parse_uri("vless://uuid@a.example:443?type=tcp#one").unwrap();
        let c = parse_uri("vless://uuid@a.example:443?type=tcp#two").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn subscription_body_unwraps_base64() {
        let plain = "vless://uuid@a.example:443?type=tcp#x\ntrojan://pw@b.example:443#y";
        let wrapped = BASE64_STANDARD.encode(plain);
        assert_eq!(decode_subscription_body(&wrapped), plain);
        assert_eq!(decode_subscription_body(plain), plain);
    }

    #[test]
    fn subscription_body_tolerates_wrapped_lines() {
        let plain = "vless://uuid@a.example:443?type=tcp#x";
        let mut wrapped = BASE64_STANDARD.encode(plain);
        wrapped.insert(8, '\n');
        assert_eq!(decode_subscription_body(&wrapped), plain);
    }

    #[test]
    fn payload_parsing_drops_junk_lines() {
        let payload = "\n# comment\nvless://uuid@a.example:443?type=ws&path=/ws#a\nnot-a-uri\nss://bm90LWIzNjQ\n";
        let servers = parse_payload(payload);
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].kind(), ServerKind::Vless);
    }

    #[test]
    fn crlf_payloads_split_cleanly() {
        let payload =
            "vless://uuid@a.example:443?type=tcp#a\r\nvless://uuid@b.example:443?type=tcp#b\r\n";
        let servers = parse_payload(payload);
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[1].address(), "b.example");
    }
}
