use std::collections::HashMap;

use percent_encoding::percent_decode_str;
use url::Url;

use super::{decode_fragment, security_from_query};
use crate::common::parsers::{ParseError, Server, ServerKind, Transport, TransportKind};

// trojan://<password>@<host>:<port>?security=tls&sni=...#<tag>
pub fn parse(raw: &str) -> Result<Server, ParseError> {
    let url = Url::parse(raw).map_err(|err| ParseError::InvalidUrl(err.to_string()))?;
    let mut query: HashMap<_, _> = url.query_pairs().into_owned().collect();

    // Older share links carry the SNI in `peer`.
    if !query.contains_key("sni") {
        if let Some(peer) = query.get("peer").cloned() {
            query.insert("sni".to_string(), peer);
        }
    }

    let password = percent_decode_str(url.username())
        .decode_utf8_lossy()
        .into_owned();
    if password.is_empty() {
        return Err(ParseError::FieldMissing("password"));
    }

    let address = url
        .host_str()
        .ok_or(ParseError::FieldMissing("address"))?
        .to_string();

    let port = url.port().ok_or(ParseError::FieldMissing("port"))?;
    if port == 0 {
        return Err(ParseError::InvalidPort);
    }

    let kind = match query.get("type") {
        Some(value) => TransportKind::from_uri_value(value)?,
        None => TransportKind::Tcp,
    };

    let transport = Transport {
        kind,
        path: query.get("path").filter(|v| !v.is_empty()).cloned(),
        host: query.get("host").filter(|v| !v.is_empty()).cloned(),
        service_name: query.get("serviceName").filter(|v| !v.is_empty()).cloned(),
    };

    Ok(Server {
        raw_uri: raw.to_string(),
        kind: ServerKind::Trojan,
        address,
        port,
        id_or_password: password,
        transport,
        // Trojan is TLS unless the link explicitly opts out.
        security: security_from_query(&query, "tls")?,
        cipher: String::new(),
        flow: None,
        alter_id: 0,
        tag: decode_fragment(url.fragment()),
    })
}

#[cfg(test)]
mod tests {
    use crate::common::parsers::{parse_uri, Security, ServerKind, TransportKind};

    #[test]
    fn parses_plain_tls_link() {
        let uri = "trojan://s3cret@proxy.example.com:443?security=tls&sni=proxy.example.com&type=tcp#Trojan";
        let server = parse_uri(uri).unwrap();

        assert_eq!(server.kind(), ServerKind::Trojan);
        assert_eq!(server.id_or_password(), "s3cret");
        assert_eq!(server.port(), 443);
        assert_eq!(server.tag(), "Trojan");
        match server.security() {
            Security::Tls(tls) => assert_eq!(tls.sni.as_deref(), Some("proxy.example.com")),
            other => panic!("expected tls, got {other:?}"),
        }
    }

    #[test]
    fn security_defaults_to_tls_and_peer_maps_to_sni() {
        let server = parse_uri("trojan://pw@1.2.3.4:8443?peer=cdn.example.net#x").unwrap();
        match server.security() {
            Security::Tls(tls) => assert_eq!(tls.sni.as_deref(), Some("cdn.example.net")),
            other => panic!("expected tls, got {other:?}"),
        }
        assert_eq!(server.server_name(), "cdn.example.net");
    }

    #[test]
    fn parses_ws_variant() {
        let server =
            parse_uri("trojan://pw@1.2.3.4:443?type=ws&path=%2Ftunnel&host=h.example#ws").unwrap();
        assert_eq!(server.transport().kind, TransportKind::Ws);
        assert_eq!(server.transport().path.as_deref(), Some("/tunnel"));
        assert_eq!(server.transport().host.as_deref(), Some("h.example"));
    }

    #[test]
    fn rejects_missing_password() {
        assert!(parse_uri("trojan://@1.2.3.4:443#x").is_err());
    }
}
