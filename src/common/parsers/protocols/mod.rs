pub mod ss;
pub mod trojan;
pub mod vless;
pub mod vmess;

use std::collections::HashMap;

use base64::{
    prelude::{BASE64_STANDARD, BASE64_URL_SAFE},
    Engine,
};
use percent_encoding::percent_decode_str;

use super::{ParseError, RealityParams, Security, TlsParams};

pub(crate) fn decode_fragment(fragment: Option<&str>) -> String {
    fragment
        .map(|f| percent_decode_str(f).decode_utf8_lossy().into_owned())
        .unwrap_or_default()
}

/// Subscription feeds pad (or forget to pad) base64 inconsistently; normalize
/// the padding and accept both alphabets.
pub(crate) fn decode_base64_forgiving(input: &str) -> Result<Vec<u8>, ParseError> {
    let mut padded = input.trim().trim_end_matches('=').to_string();
    while padded.len() % 4 != 0 {
        padded.push('=');
    }

    BASE64_STANDARD
        .decode(padded.as_bytes())
        .or_else(|_| BASE64_URL_SAFE.decode(padded.as_bytes()))
        .map_err(ParseError::from)
}

fn non_empty(query: &HashMap<String, String>, key: &str) -> Option<String> {
    query.get(key).filter(|v| !v.is_empty()).cloned()
}

pub(crate) fn security_from_query(
    query: &HashMap<String, String>,
    default_security: &str,
) -> Result<Security, ParseError> {
    match query
        .get("security")
        .map(String::as_str)
        .unwrap_or(default_security)
    {
        "" | "none" | "auto" => Ok(Security::None),
        "tls" => Ok(Security::Tls(TlsParams {
            sni: non_empty(query, "sni"),
            alpn: non_empty(query, "alpn").map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            }),
            fingerprint: non_empty(query, "fp"),
        })),
        "reality" => {
            let public_key = non_empty(query, "pbk").ok_or(ParseError::FieldMissing("pbk"))?;
            let sni = non_empty(query, "sni").ok_or(ParseError::FieldMissing("sni"))?;
            let short_id = query
                .get("sid")
                .cloned()
                .ok_or(ParseError::FieldMissing("sid"))?;

            Ok(Security::Reality(RealityParams {
                sni,
                public_key,
                short_id,
                fingerprint: non_empty(query, "fp").unwrap_or_else(|| "chrome".to_string()),
                spider_x: non_empty(query, "spx"),
            }))
        }
        other => Err(ParseError::InvalidPayload(format!(
            "unknown security \"{other}\""
        ))),
    }
}
