use serde::{Deserialize, Serialize};

use crate::common::parsers::{Security, Server, ServerKind, TransportKind};

/// Self-contained engine configuration for one probe job: a single loopback
/// SOCKS inbound wired straight to a single outbound. Log output is disabled
/// so readiness detection and high fan-out are not fighting the pipes.
#[derive(Debug, Serialize, Deserialize)]
pub struct XrayTestConfig {
    pub log: LogSettings,
    pub inbounds: Vec<XrayInboundConfig>,
    pub outbounds: Vec<XrayOutboundConfig>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LogSettings {
    pub loglevel: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct XrayInboundConfig {
    pub tag: String,
    pub listen: String,
    pub port: u16,
    pub protocol: String,
    pub settings: XrayInboundSettings,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct XrayInboundSettings {
    pub auth: String,
    pub udp: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct XrayOutboundConfig {
    pub tag: String,
    pub protocol: String,
    pub settings: OutboundSettings,

    #[serde(
        skip_serializing_if = "Option::is_none",
        rename(serialize = "streamSettings", deserialize = "streamSettings")
    )]
    pub stream_settings: Option<StreamSettings>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OutboundSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vnext: Option<Vec<VNext>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub servers: Option<Vec<OutboundServer>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VNext {
    pub address: String,
    pub port: u16,
    pub users: Vec<User>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub alter_id: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub security: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OutboundServer {
    pub address: String,
    pub port: u16,
    pub password: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSettings {
    pub network: String,
    pub security: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_settings: Option<WsSettings>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub grpc_settings: Option<GrpcSettings>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_settings: Option<HttpSettings>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_settings: Option<TlsSettings>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reality_settings: Option<RealitySettings>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WsSettings {
    pub path: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrpcSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HttpSettings {
    pub path: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsSettings {
    pub server_name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub alpn: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealitySettings {
    pub server_name: String,
    pub fingerprint: String,
    pub public_key: String,
    pub short_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub spider_x: Option<String>,
}

impl XrayTestConfig {
    pub fn for_server(server: &Server, inbound_port: u16) -> Self {
        XrayTestConfig {
            log: LogSettings {
                loglevel: "none".to_string(),
            },
            inbounds: vec![XrayInboundConfig {
                tag: "probe-in".to_string(),
                listen: "127.0.0.1".to_string(),
                port: inbound_port,
                protocol: "socks".to_string(),
                settings: XrayInboundSettings {
                    auth: "noauth".to_string(),
                    udp: false,
                },
            }],
            outbounds: vec![XrayOutboundConfig::for_server(server)],
        }
    }
}

impl XrayOutboundConfig {
    pub fn for_server(server: &Server) -> Self {
        let settings = match server.kind() {
            ServerKind::Vless => OutboundSettings {
                vnext: Some(vec![VNext {
                    address: server.address().to_string(),
                    port: server.port(),
                    users: vec![User {
                        id: server.id_or_password().to_string(),
                        encryption: Some("none".to_string()),
                        flow: server.flow().map(str::to_string),
                        alter_id: None,
                        security: None,
                    }],
                }]),
                servers: None,
            },
            ServerKind::Vmess => OutboundSettings {
                vnext: Some(vec![VNext {
                    address: server.address().to_string(),
                    port: server.port(),
                    users: vec![User {
                        id: server.id_or_password().to_string(),
                        encryption: None,
                        flow: None,
                        alter_id: Some(server.alter_id()),
                        security: Some(vmess_cipher(server.cipher())),
                    }],
                }]),
                servers: None,
            },
            ServerKind::Trojan | ServerKind::Shadowsocks => OutboundSettings {
                vnext: None,
                servers: Some(vec![OutboundServer {
                    address: server.address().to_string(),
                    port: server.port(),
                    password: server.id_or_password().to_string(),
                    method: match server.kind() {
                        ServerKind::Shadowsocks => Some(server.cipher().to_string()),
                        _ => None,
                    },
                }]),
            },
        };

        XrayOutboundConfig {
            tag: "probe-out".to_string(),
            protocol: server.kind().as_str().to_string(),
            settings,
            stream_settings: match server.kind() {
                // Shadowsocks carries no stream layer of its own.
                ServerKind::Shadowsocks => None,
                _ => Some(StreamSettings::for_server(server)),
            },
        }
    }
}

impl StreamSettings {
    fn for_server(server: &Server) -> Self {
        let transport = server.transport();

        let ws_settings = match transport.kind {
            TransportKind::Ws => Some(WsSettings {
                path: transport.path.clone().unwrap_or_else(|| "/".to_string()),
                host: transport
                    .host
                    .clone()
                    .or_else(|| Some(server.address().to_string())),
            }),
            _ => None,
        };

        let grpc_settings = match transport.kind {
            TransportKind::Grpc => Some(GrpcSettings {
                service_name: transport.service_name.clone(),
            }),
            _ => None,
        };

        let http_settings = match transport.kind {
            TransportKind::H2 => Some(HttpSettings {
                path: transport.path.clone().unwrap_or_else(|| "/".to_string()),
                host: transport.host.clone().map(|h| vec![h]),
            }),
            _ => None,
        };

        let (security, tls_settings, reality_settings) = match server.security() {
            Security::None => ("none", None, None),
            Security::Tls(tls) => (
                "tls",
                Some(TlsSettings {
                    server_name: server.server_name().to_string(),
                    alpn: tls.alpn.clone(),
                    fingerprint: tls.fingerprint.clone(),
                }),
                None,
            ),
            Security::Reality(reality) => (
                "reality",
                None,
                Some(RealitySettings {
                    server_name: reality.sni.clone(),
                    fingerprint: reality.fingerprint.clone(),
                    public_key: reality.public_key.clone(),
                    short_id: reality.short_id.clone(),
                    spider_x: reality.spider_x.clone(),
                }),
            ),
        };

        StreamSettings {
            network: transport.kind.network().to_string(),
            security: security.to_string(),
            ws_settings,
            grpc_settings,
            http_settings,
            tls_settings,
            reality_settings,
        }
    }
}

// The vmess `scy` field already matches the engine's user security names;
// anything unrecognized degrades to auto.
fn vmess_cipher(cipher: &str) -> String {
    match cipher {
        "aes-128-gcm" | "chacha20-poly1305" | "auto" | "none" | "zero" => cipher.to_string(),
        _ => "auto".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::common::parsers::parse_uri;

    #[test]
    fn vless_reality_document_shape() {
        let server = parse_uri(
            "vless://uuid@1.2.3.4:443?security=reality&type=grpc&sni=unpkg.com&sid=abcd&pbk=pk&serviceName=svc#x",
        )
        .unwrap();
        let doc = serde_json::to_value(XrayTestConfig::for_server(&server, 24001)).unwrap();

        assert_eq!(doc["log"]["loglevel"], "none");
        assert_eq!(doc["inbounds"][0]["listen"], "127.0.0.1");
        assert_eq!(doc["inbounds"][0]["port"], 24001);
        assert_eq!(doc["inbounds"][0]["settings"]["udp"], false);

        let outbound = &doc["outbounds"][0];
        assert_eq!(outbound["protocol"], "vless");
        assert_eq!(outbound["settings"]["vnext"][0]["users"][0]["encryption"], "none");
        assert_eq!(outbound["streamSettings"]["network"], "grpc");
        assert_eq!(outbound["streamSettings"]["security"], "reality");
        assert_eq!(
            outbound["streamSettings"]["realitySettings"],
            json!({
                "serverName": "unpkg.com",
                "fingerprint": "chrome",
                "publicKey": "pk",
                "shortId": "abcd"
            })
        );
        assert_eq!(outbound["streamSettings"]["grpcSettings"]["serviceName"], "svc");
    }

    #[test]
    fn vmess_ws_document_shape() {
        let payload = json!({
            "add": "h.example", "port": 443, "id": "uuid", "aid": 2,
            "net": "ws", "path": "/ws", "tls": "tls", "scy": "aes-128-gcm"
        });
        let uri = format!(
            "vmess://{}",
            base64::Engine::encode(&base64::prelude::BASE64_STANDARD, payload.to_string())
        );
        let server = parse_uri(&uri).unwrap();
        let doc = serde_json::to_value(XrayOutboundConfig::for_server(&server)).unwrap();

        assert_eq!(doc["protocol"], "vmess");
        let user = &doc["settings"]["vnext"][0]["users"][0];
        assert_eq!(user["alterId"], 2);
        assert_eq!(user["security"], "aes-128-gcm");
        assert!(user.get("encryption").is_none());

        // No ws host was given, so the address stands in.
        assert_eq!(doc["streamSettings"]["wsSettings"]["path"], "/ws");
        assert_eq!(doc["streamSettings"]["wsSettings"]["host"], "h.example");
        assert_eq!(doc["streamSettings"]["tlsSettings"]["serverName"], "h.example");
    }

    #[test]
    fn vless_h2_document_shape() {
        let server = parse_uri(
            "vless://uuid@2.3.4.5:443?type=h2&security=tls&sni=h2.example&path=%2Ffeed&host=h2.example#x",
        )
        .unwrap();
        let doc = serde_json::to_value(XrayOutboundConfig::for_server(&server)).unwrap();

        // HTTP/2 transport is "http" on the wire, not "h2".
        assert_eq!(doc["streamSettings"]["network"], "http");
        assert_eq!(doc["streamSettings"]["httpSettings"]["path"], "/feed");
        assert_eq!(
            doc["streamSettings"]["httpSettings"]["host"],
            json!(["h2.example"])
        );
        assert!(doc["streamSettings"].get("wsSettings").is_none());
        assert_eq!(doc["streamSettings"]["tlsSettings"]["serverName"], "h2.example");
    }

    #[test]
    fn trojan_document_shape() {
        let server = parse_uri("trojan://pw@5.6.7.8:443?sni=t.example#x").unwrap();
        let doc = serde_json::to_value(XrayOutboundConfig::for_server(&server)).unwrap();

        assert_eq!(doc["protocol"], "trojan");
        assert_eq!(doc["settings"]["servers"][0]["password"], "pw");
        assert!(doc["settings"]["servers"][0].get("method").is_none());
        assert_eq!(doc["streamSettings"]["security"], "tls");
        assert_eq!(doc["streamSettings"]["tlsSettings"]["serverName"], "t.example");
    }

    #[test]
    fn shadowsocks_document_has_no_stream_settings() {
        let encoded = base64::Engine::encode(
            &base64::prelude::BASE64_URL_SAFE_NO_PAD,
            "aes-256-gcm:pw",
        );
        let server = parse_uri(&format!("ss://{encoded}@9.9.9.9:8388#x")).unwrap();
        let doc = serde_json::to_value(XrayOutboundConfig::for_server(&server)).unwrap();

        assert_eq!(doc["protocol"], "shadowsocks");
        assert_eq!(doc["settings"]["servers"][0]["method"], "aes-256-gcm");
        assert!(doc.get("streamSettings").is_none());
    }
}
