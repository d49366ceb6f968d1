use super::{decode_base64_forgiving, decode_fragment};
use crate::common::parsers::{
    ParseError, Security, Server, ServerKind, Transport, TransportKind,
};

// ss://<base64(method:password)>@<host>:<port>#<tag>, with tolerance for the
// legacy ss://<base64(method:password@host:port)>#<tag> form. Parsed by hand:
// the userinfo is base64 and must not go through url's host normalization.
pub fn parse(raw: &str) -> Result<Server, ParseError> {
    let rest = raw
        .strip_prefix("ss://")
        .ok_or_else(|| ParseError::InvalidUrl("not an ss uri".to_string()))?;

    let (body, fragment) = match rest.split_once('#') {
        Some((body, fragment)) => (body, Some(fragment)),
        None => (rest, None),
    };

    let (userinfo, endpoint) = match body.rsplit_once('@') {
        Some((encoded, endpoint)) => {
            let decoded = decode_base64_forgiving(encoded)?;
            (String::from_utf8(decoded)?, endpoint.to_string())
        }
        None => {
            // Legacy form: the whole body is base64.
            let decoded = String::from_utf8(decode_base64_forgiving(body)?)?;
            let (userinfo, endpoint) = decoded
                .rsplit_once('@')
                .ok_or(ParseError::FieldMissing("address"))?;
            (userinfo.to_string(), endpoint.to_string())
        }
    };

    let (method, password) = userinfo
        .split_once(':')
        .ok_or(ParseError::FieldMissing("method"))?;
    if method.is_empty() {
        return Err(ParseError::FieldMissing("method"));
    }

    let (address, port_str) = endpoint
        .rsplit_once(':')
        .ok_or(ParseError::FieldMissing("port"))?;
    if address.is_empty() {
        return Err(ParseError::FieldMissing("address"));
    }

    let port: u16 = port_str
        .trim_end_matches('/')
        .parse()
        .map_err(|_| ParseError::InvalidPort)?;
    if port == 0 {
        return Err(ParseError::InvalidPort);
    }

    Ok(Server {
        raw_uri: raw.to_string(),
        kind: ServerKind::Shadowsocks,
        address: address.to_string(),
        port,
        id_or_password: password.to_string(),
        transport: Transport {
            kind: TransportKind::Tcp,
            ..Transport::default()
        },
        security: Security::None,
        cipher: method.to_string(),
        flow: None,
        alter_id: 0,
        tag: decode_fragment(fragment),
    })
}

#[cfg(test)]
mod tests {
    use base64::{prelude::BASE64_URL_SAFE_NO_PAD, Engine};

    use crate::common::parsers::{parse_uri, ServerKind};

    #[test]
    fn parses_modern_form() {
        // base64("chacha20-ietf-poly1305:password")
        let uri = "ss://Y2hhY2hhMjAtaWV0Zi1wb2x5MTMwNTpwYXNzd29yZA==@example.com:8388#Shadowsocks";
        let server = parse_uri(uri).unwrap();

        assert_eq!(server.kind(), ServerKind::Shadowsocks);
        assert_eq!(server.address(), "example.com");
        assert_eq!(server.port(), 8388);
        assert_eq!(server.cipher(), "chacha20-ietf-poly1305");
        assert_eq!(server.id_or_password(), "password");
        assert_eq!(server.tag(), "Shadowsocks");
    }

    #[test]
    fn parses_legacy_form() {
        let encoded = BASE64_URL_SAFE_NO_PAD.encode("aes-256-gcm:pw@1.2.3.4:8388");
        let server = parse_uri(&format!("ss://{encoded}#legacy")).unwrap();

        assert_eq!(server.address(), "1.2.3.4");
        assert_eq!(server.cipher(), "aes-256-gcm");
        assert_eq!(server.id_or_password(), "pw");
        assert_eq!(server.tag(), "legacy");
    }

    #[test]
    fn password_may_contain_colons() {
        let encoded = BASE64_URL_SAFE_NO_PAD.encode("aes-128-gcm:pa:ss:wd");
        let server = parse_uri(&format!("ss://{encoded}@h.example:443")).unwrap();
        assert_eq!(server.id_or_password(), "pa:ss:wd");
    }

    #[test]
    fn parses_ipv6_endpoint() {
        let encoded = BASE64_URL_SAFE_NO_PAD.encode("aes-256-gcm:pw");
        let server = parse_uri(&format!("ss://{encoded}@[2001:db8::1]:8388#v6")).unwrap();
        assert_eq!(server.address(), "[2001:db8::1]");
        assert_eq!(server.port(), 8388);
    }

    #[test]
    fn rejects_undecodable_userinfo() {
        assert!(parse_uri("ss://%%%@1.2.3.4:8388").is_err());
        assert!(parse_uri("ss://bm90LWIzNjQ@1.2.3.4:8388").is_err());
        assert!(parse_uri("ss://Y2hhY2hhOnB3@1.2.3.4:0").is_err());
    }
}
