use serde_json::Value;

use super::decode_base64_forgiving;
use crate::common::parsers::{
    ParseError, Security, Server, ServerKind, TlsParams, Transport, TransportKind,
};

// vmess://<base64(json)>; the payload keys follow the v2rayN share format.
pub fn parse(raw: &str) -> Result<Server, ParseError> {
    let encoded = raw
        .strip_prefix("vmess://")
        .ok_or_else(|| ParseError::InvalidUrl("not a vmess uri".to_string()))?;

    // Some aggregators append ?remarks=... after the payload.
    let encoded = encoded.split('?').next().unwrap_or_default().trim();

    let decoded = decode_base64_forgiving(encoded)?;
    let text = String::from_utf8_lossy(&decoded);

    // Tolerate trailing garbage after the JSON object.
    let text = match text.rfind('}') {
        Some(idx) => &text[..=idx],
        None => {
            return Err(ParseError::InvalidPayload(
                "payload is not a json object".to_string(),
            ))
        }
    };

    let payload: Value =
        serde_json::from_str(text).map_err(|err| ParseError::InvalidPayload(err.to_string()))?;

    let address = string_field(&payload, "add").ok_or(ParseError::FieldMissing("add"))?;
    let user_id = string_field(&payload, "id").ok_or(ParseError::FieldMissing("id"))?;
    let port = port_field(&payload)?;

    let network = string_field(&payload, "net").unwrap_or_else(|| "tcp".to_string());
    let host = string_field(&payload, "host").filter(|v| !v.is_empty());
    let path = string_field(&payload, "path").filter(|v| !v.is_empty());

    let transport = Transport {
        kind: TransportKind::from_uri_value(&network)?,
        path,
        host: host.clone(),
        service_name: None,
    };

    // `tls` selects stream security; `scy` is the auth cipher and is kept
    // separately as the server's cipher.
    let security = match string_field(&payload, "tls").as_deref() {
        Some("tls") => Security::Tls(TlsParams {
            sni: string_field(&payload, "sni").filter(|v| !v.is_empty()).or(host),
            alpn: None,
            fingerprint: None,
        }),
        _ => Security::None,
    };

    Ok(Server {
        raw_uri: raw.to_string(),
        kind: ServerKind::Vmess,
        address,
        port,
        id_or_password: user_id,
        transport,
        security,
        cipher: string_field(&payload, "scy").unwrap_or_else(|| "auto".to_string()),
        flow: None,
        alter_id: int_field(&payload, "aid").unwrap_or(0),
        tag: string_field(&payload, "ps").unwrap_or_default(),
    })
}

fn string_field(payload: &Value, key: &str) -> Option<String> {
    match payload.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn int_field(payload: &Value, key: &str) -> Option<u32> {
    match payload.get(key)? {
        Value::Number(n) => n.as_u64().map(|v| v as u32),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn port_field(payload: &Value) -> Result<u16, ParseError> {
    let port: u32 = int_field(payload, "port").ok_or(ParseError::FieldMissing("port"))?;
    if port == 0 || port > u16::MAX as u32 {
        return Err(ParseError::InvalidPort);
    }
    Ok(port as u16)
}

#[cfg(test)]
mod tests {
    use base64::{prelude::BASE64_STANDARD, Engine};
    use serde_json::json;

    use crate::common::parsers::{parse_uri, Security, ServerKind, TransportKind};

    fn encode(payload: serde_json::Value) -> String {
        format!("vmess://{}", BASE64_STANDARD.encode(payload.to_string()))
    }

    #[test]
    fn parses_ws_tls_payload() {
        let uri = encode(json!({
            "v": "2",
            "ps": "VMess node",
            "add": "example.com",
            "port": "443",
            "id": "0e7c4a6f-9a4f-45b6-8b2e-3e1b6fdc6c2b",
            "aid": "0",
            "scy": "auto",
            "net": "ws",
            "host": "example.com",
            "path": "/path",
            "tls": "tls",
            "sni": "example.com"
        }));

        let server = parse_uri(&uri).unwrap();
        assert_eq!(server.kind(), ServerKind::Vmess);
        assert_eq!(server.address(), "example.com");
        assert_eq!(server.port(), 443);
        assert_eq!(server.transport().kind, TransportKind::Ws);
        assert_eq!(server.transport().path.as_deref(), Some("/path"));
        assert_eq!(server.cipher(), "auto");
        assert_eq!(server.tag(), "VMess node");
        assert!(matches!(server.security(), Security::Tls(_)));
    }

    #[test]
    fn tolerates_stripped_padding_and_trailing_garbage() {
        let body = json!({
            "add": "1.2.3.4",
            "port": 8443,
            "id": "uuid",
            "net": "tcp"
        })
        .to_string();
        let mut encoded = BASE64_STANDARD.encode(format!("{body}garbage-after-json"));
        while encoded.ends_with('=') {
            encoded.pop();
        }

        let server = parse_uri(&format!("vmess://{encoded}")).unwrap();
        assert_eq!(server.address(), "1.2.3.4");
        assert_eq!(server.port(), 8443);
        assert_eq!(server.alter_id(), 0);
        assert_eq!(*server.security(), Security::None);
    }

    #[test]
    fn strips_query_suffix() {
        let payload = json!({"add": "h.example", "port": 80, "id": "uuid", "net": "tcp"});
        let uri = format!("{}?remarks=x", encode(payload));
        assert_eq!(parse_uri(&uri).unwrap().address(), "h.example");
    }

    #[test]
    fn rejects_broken_payloads() {
        assert!(parse_uri("vmess://!!!!").is_err());
        let no_port = encode(json!({"add": "h.example", "id": "uuid"}));
        assert!(parse_uri(&no_port).is_err());
        let zero_port = encode(json!({"add": "h.example", "id": "uuid", "port": 0}));
        assert!(parse_uri(&zero_port).is_err());
    }
}
