use std::collections::HashMap;

use percent_encoding::percent_decode_str;
use url::Url;

use super::{decode_fragment, security_from_query};
use crate::common::parsers::{ParseError, Server, ServerKind, Transport, TransportKind};

// vless://<uuid>@<host>:<port>?type=grpc&security=reality&sni=...&pbk=...&sid=...#<tag>
pub fn parse(raw: &str) -> Result<Server, ParseError> {
    let url = Url::parse(raw).map_err(|err| ParseError::InvalidUrl(err.to_string()))?;
    let query: HashMap<_, _> = url.query_pairs().into_owned().collect();

    let user_id = percent_decode_str(url.username())
        .decode_utf8_lossy()
        .into_owned();
    if user_id.is_empty() {
        return Err(ParseError::FieldMissing("uuid"));
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
        kind: ServerKind::Vless,
        address,
        port,
        id_or_password: user_id,
        transport,
        security: security_from_query(&query, "none")?,
        cipher: String::new(),
        flow: query.get("flow").filter(|v| !v.is_empty()).cloned(),
        alter_id: 0,
        tag: decode_fragment(url.fragment()),
    })
}
