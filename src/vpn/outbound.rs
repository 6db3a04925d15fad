//! Typed sing-box outbound descriptors and the per-protocol builders.
//!
//! Each supported protocol tag maps to exactly one builder. A builder reads
//! the profile's attribute bag into a protocol-specific struct and produces an
//! [`Outbound`] variant; it never touches the network or the filesystem, so
//! the same profile always yields the same descriptor.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::error::{VpnError, VpnResult};
use super::subscription::Profile;

/// uTLS fingerprint used when REALITY is enabled (sing-box requires uTLS there).
const REALITY_FINGERPRINT: &str = "chrome";

/// Obfuscation scheme sing-box supports for Hysteria2.
const HYSTERIA2_OBFS: &str = "salamander";

/// One entry of the generated `outbounds` array.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Outbound {
    Direct { tag: String },
    Block { tag: String },
    Selector(SelectorOutbound),
    Shadowsocks(ShadowsocksOutbound),
    Vmess(VmessOutbound),
    Vless(VlessOutbound),
    Trojan(TrojanOutbound),
    Hysteria2(Hysteria2Outbound),
}

impl Outbound {
    pub fn tag(&self) -> &str {
        match self {
            Self::Direct { tag } | Self::Block { tag } => tag,
            Self::Selector(o) => &o.tag,
            Self::Shadowsocks(o) => &o.tag,
            Self::Vmess(o) => &o.tag,
            Self::Vless(o) => &o.tag,
            Self::Trojan(o) => &o.tag,
            Self::Hysteria2(o) => &o.tag,
        }
    }

    /// Whether this outbound was built from a subscription profile.
    pub fn is_proxy(&self) -> bool {
        !matches!(self, Self::Direct { .. } | Self::Block { .. } | Self::Selector(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SelectorOutbound {
    pub tag: String,
    pub outbounds: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShadowsocksOutbound {
    pub tag: String,
    pub server: String,
    pub server_port: u16,
    pub method: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VmessOutbound {
    pub tag: String,
    pub server: String,
    pub server_port: u16,
    pub uuid: String,
    pub security: String,
    pub alter_id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport: Option<Transport>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VlessOutbound {
    pub tag: String,
    pub server: String,
    pub server_port: u16,
    pub uuid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport: Option<Transport>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrojanOutbound {
    pub tag: String,
    pub server: String,
    pub server_port: u16,
    pub password: String,
    pub tls: TlsOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport: Option<Transport>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Hysteria2Outbound {
    pub tag: String,
    pub server: String,
    pub server_port: u16,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub up_mbps: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub down_mbps: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub obfs: Option<ObfsOptions>,
    pub tls: TlsOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObfsOptions {
    #[serde(rename = "type")]
    pub kind: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TlsOptions {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(skip_serializing_if = "is_false")]
    pub insecure: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub utls: Option<UtlsOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reality: Option<RealityOptions>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UtlsOptions {
    pub enabled: bool,
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RealityOptions {
    pub enabled: bool,
    pub public_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_id: Option<String>,
}

/// V2Ray-style transport layered under vmess, vless and trojan.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Transport {
    Ws {
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        #[serde(skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
    },
    Grpc {
        #[serde(skip_serializing_if = "Option::is_none")]
        service_name: Option<String>,
    },
    Http {
        #[serde(skip_serializing_if = "Vec::is_empty")]
        host: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    HttpUpgrade {
        #[serde(skip_serializing_if = "Option::is_none")]
        host: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
}

fn is_false(b: &bool) -> bool {
    !*b
}

// ── Protocol dispatch ───────────────────────────────────────────────

/// Protocol tags the generator knows how to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Shadowsocks,
    Vmess,
    Vless,
    Trojan,
    Hysteria2,
}

impl Protocol {
    /// Resolve a subscription type tag (case-insensitive, common aliases).
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "ss" | "shadowsocks" => Some(Self::Shadowsocks),
            "vmess" => Some(Self::Vmess),
            "vless" => Some(Self::Vless),
            "trojan" => Some(Self::Trojan),
            "hysteria2" | "hy2" => Some(Self::Hysteria2),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shadowsocks => write!(f, "shadowsocks"),
            Self::Vmess => write!(f, "vmess"),
            Self::Vless => write!(f, "vless"),
            Self::Trojan => write!(f, "trojan"),
            Self::Hysteria2 => write!(f, "hysteria2"),
        }
    }
}

/// Build the outbound for the profile at `index`, tagged `tag`.
pub fn build_outbound(tag: String, index: usize, profile: &Profile) -> VpnResult<Outbound> {
    let protocol = Protocol::from_tag(&profile.protocol).ok_or_else(|| {
        VpnError::UnsupportedProtocol {
            protocol: profile.protocol.clone(),
            index,
        }
    })?;

    let ctx = BuildContext { tag, index, profile };
    match protocol {
        Protocol::Shadowsocks => build_shadowsocks(ctx),
        Protocol::Vmess => build_vmess(ctx),
        Protocol::Vless => build_vless(ctx),
        Protocol::Trojan => build_trojan(ctx),
        Protocol::Hysteria2 => build_hysteria2(ctx),
    }
}

struct BuildContext<'a> {
    tag: String,
    index: usize,
    profile: &'a Profile,
}

impl BuildContext<'_> {
    /// Read the attribute bag into a protocol-specific struct.
    fn attrs<T: DeserializeOwned>(&self) -> VpnResult<T> {
        let bag: serde_json::Map<String, Value> = self
            .profile
            .attributes
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        serde_json::from_value(Value::Object(bag)).map_err(|e| self.invalid(e.to_string()))
    }

    fn invalid(&self, reason: impl Into<String>) -> VpnError {
        VpnError::InvalidProfile {
            index: self.index,
            reason: reason.into(),
        }
    }

    fn server(&self) -> String {
        self.profile.address.clone()
    }
}

// ── Attribute bags ──────────────────────────────────────────────────

/// TLS and transport keys shared by several protocols.
#[derive(Debug, Default, Deserialize)]
struct CommonAttrs {
    #[serde(default, deserialize_with = "de_flag")]
    tls: bool,
    #[serde(default)]
    sni: Option<String>,
    #[serde(default)]
    server_name: Option<String>,
    #[serde(default, deserialize_with = "de_flag")]
    skip_cert: bool,
    #[serde(default, deserialize_with = "de_flag")]
    insecure: bool,
    #[serde(default)]
    network: Option<String>,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    host_header: Option<String>,
    #[serde(default)]
    service_name: Option<String>,
}

impl CommonAttrs {
    fn sni(&self) -> Option<String> {
        non_empty(self.sni.as_deref()).or_else(|| non_empty(self.server_name.as_deref()))
    }

    fn insecure(&self) -> bool {
        self.skip_cert || self.insecure
    }

    fn tls_options(&self, force: bool) -> Option<TlsOptions> {
        (force || self.tls).then(|| TlsOptions {
            enabled: true,
            server_name: self.sni(),
            insecure: self.insecure(),
            utls: None,
            reality: None,
        })
    }

    fn transport(&self, ctx: &BuildContext<'_>) -> VpnResult<Option<Transport>> {
        let network = self
            .network
            .as_deref()
            .map(|n| n.trim().to_ascii_lowercase())
            .unwrap_or_default();
        let path = non_empty(self.path.as_deref());
        let host = non_empty(self.host_header.as_deref()).or_else(|| self.sni());

        let transport = match network.as_str() {
            "" | "tcp" => return Ok(None),
            "ws" | "websocket" => Transport::Ws {
                path,
                headers: host.into_iter().map(|h| ("Host".to_string(), h)).collect(),
            },
            "grpc" => Transport::Grpc {
                service_name: non_empty(self.service_name.as_deref()).or(path),
            },
            "http" | "h2" => Transport::Http {
                host: host.into_iter().collect(),
                path,
            },
            "httpupgrade" => Transport::HttpUpgrade { host, path },
            other => return Err(ctx.invalid(format!("unsupported network '{other}'"))),
        };
        Ok(Some(transport))
    }
}

#[derive(Debug, Deserialize)]
struct ShadowsocksAttrs {
    #[serde(alias = "cipher")]
    method: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct VmessAttrs {
    uuid: String,
    #[serde(default)]
    security: Option<String>,
    #[serde(default)]
    cipher: Option<String>,
    #[serde(default, deserialize_with = "de_u32")]
    alter_id: u32,
    #[serde(default, rename = "alterId", deserialize_with = "de_u32")]
    alter_id_camel: u32,
    #[serde(flatten)]
    common: CommonAttrs,
}

#[derive(Debug, Deserialize)]
struct VlessAttrs {
    uuid: String,
    #[serde(default)]
    flow: Option<String>,
    #[serde(default)]
    reality: Option<RealityAttrs>,
    #[serde(flatten)]
    common: CommonAttrs,
}

#[derive(Debug, Deserialize)]
struct RealityAttrs {
    public_key: String,
    #[serde(default)]
    short_id: Option<String>,
    #[serde(default)]
    server_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TrojanAttrs {
    password: String,
    #[serde(flatten)]
    common: CommonAttrs,
}

#[derive(Debug, Deserialize)]
struct Hysteria2Attrs {
    password: String,
    #[serde(default, deserialize_with = "de_speed")]
    up: Option<u32>,
    #[serde(default, deserialize_with = "de_speed")]
    down: Option<u32>,
    #[serde(default)]
    obfs: Option<String>,
    #[serde(default)]
    hysteria2: Option<Hysteria2Nested>,
    #[serde(flatten)]
    common: CommonAttrs,
}

/// Panel variant that nests bandwidth and obfs under a `hysteria2` key.
#[derive(Debug, Default, Deserialize)]
struct Hysteria2Nested {
    #[serde(default, deserialize_with = "de_speed")]
    up: Option<u32>,
    #[serde(default, deserialize_with = "de_speed")]
    down: Option<u32>,
    #[serde(default)]
    obfs: Option<String>,
}

// ── Builders ────────────────────────────────────────────────────────

fn build_shadowsocks(ctx: BuildContext<'_>) -> VpnResult<Outbound> {
    let attrs: ShadowsocksAttrs = ctx.attrs()?;
    Ok(Outbound::Shadowsocks(ShadowsocksOutbound {
        server: ctx.server(),
        server_port: ctx.profile.port,
        method: attrs.method,
        password: attrs.password,
        tag: ctx.tag,
    }))
}

fn build_vmess(ctx: BuildContext<'_>) -> VpnResult<Outbound> {
    let attrs: VmessAttrs = ctx.attrs()?;
    let transport = attrs.common.transport(&ctx)?;
    Ok(Outbound::Vmess(VmessOutbound {
        server: ctx.server(),
        server_port: ctx.profile.port,
        uuid: attrs.uuid,
        security: non_empty(attrs.security.as_deref())
            .or_else(|| non_empty(attrs.cipher.as_deref()))
            .unwrap_or_else(|| "auto".into()),
        alter_id: attrs.alter_id.max(attrs.alter_id_camel),
        tls: attrs.common.tls_options(false),
        transport,
        tag: ctx.tag,
    }))
}

fn build_vless(ctx: BuildContext<'_>) -> VpnResult<Outbound> {
    let attrs: VlessAttrs = ctx.attrs()?;
    let transport = attrs.common.transport(&ctx)?;
    let tls = match attrs.reality {
        Some(reality) => Some(TlsOptions {
            enabled: true,
            server_name: non_empty(reality.server_name.as_deref()).or_else(|| attrs.common.sni()),
            insecure: false,
            utls: Some(UtlsOptions {
                enabled: true,
                fingerprint: REALITY_FINGERPRINT.into(),
            }),
            reality: Some(RealityOptions {
                enabled: true,
                public_key: reality.public_key,
                short_id: non_empty(reality.short_id.as_deref()),
            }),
        }),
        None => attrs.common.tls_options(false),
    };
    Ok(Outbound::Vless(VlessOutbound {
        server: ctx.server(),
        server_port: ctx.profile.port,
        uuid: attrs.uuid,
        flow: non_empty(attrs.flow.as_deref()),
        tls,
        transport,
        tag: ctx.tag,
    }))
}

fn build_trojan(ctx: BuildContext<'_>) -> VpnResult<Outbound> {
    let attrs: TrojanAttrs = ctx.attrs()?;
    let transport = attrs.common.transport(&ctx)?;
    let tls = attrs
        .common
        .tls_options(true)
        .ok_or_else(|| ctx.invalid("trojan requires TLS"))?;
    Ok(Outbound::Trojan(TrojanOutbound {
        server: ctx.server(),
        server_port: ctx.profile.port,
        password: attrs.password,
        tls,
        transport,
        tag: ctx.tag,
    }))
}

fn build_hysteria2(ctx: BuildContext<'_>) -> VpnResult<Outbound> {
    let attrs: Hysteria2Attrs = ctx.attrs()?;
    let nested = attrs.hysteria2.unwrap_or_default();
    let tls = attrs
        .common
        .tls_options(true)
        .ok_or_else(|| ctx.invalid("hysteria2 requires TLS"))?;
    let obfs = non_empty(attrs.obfs.as_deref())
        .or_else(|| non_empty(nested.obfs.as_deref()))
        .map(|password| ObfsOptions {
            kind: HYSTERIA2_OBFS.into(),
            password,
        });
    Ok(Outbound::Hysteria2(Hysteria2Outbound {
        server: ctx.server(),
        server_port: ctx.profile.port,
        password: attrs.password,
        up_mbps: attrs.up.or(nested.up),
        down_mbps: attrs.down.or(nested.down),
        obfs,
        tls,
        tag: ctx.tag,
    }))
}

// ── Lenient scalar readers ──────────────────────────────────────────

fn non_empty(s: Option<&str>) -> Option<String> {
    s.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

/// Panels encode flags as booleans, 0/1, strings, or a `{"enabled": ..}` table.
fn de_flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Bool(b) => b,
        Value::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
        Value::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "tls"),
        Value::Object(map) => map.get("enabled").and_then(Value::as_bool).unwrap_or(true),
        Value::Null | Value::Array(_) => false,
    })
}

fn de_u32<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(0),
        Value::Number(n) => n
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| serde::de::Error::custom(format!("invalid integer {n}"))),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid integer '{s}'"))),
        other => Err(serde::de::Error::custom(format!("invalid integer {other}"))),
    }
}

/// Bandwidth given as a number of Mbps or a string like `"100 Mbps"`.
fn de_speed<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u32>, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::Number(n) => Ok(n.as_u64().and_then(|v| u32::try_from(v).ok())),
        Value::String(s) => {
            let digits: String = s.trim().chars().take_while(char::is_ascii_digit).collect();
            Ok(digits.parse().ok())
        }
        other => Err(serde::de::Error::custom(format!("invalid bandwidth {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn profile(value: Value) -> Profile {
        Profile::from_value(value).unwrap()
    }

    fn build(value: Value) -> VpnResult<Outbound> {
        build_outbound("node-0".into(), 0, &profile(value))
    }

    #[test]
    fn protocol_tags_and_aliases() {
        assert_eq!(Protocol::from_tag("ss"), Some(Protocol::Shadowsocks));
        assert_eq!(Protocol::from_tag("Shadowsocks"), Some(Protocol::Shadowsocks));
        assert_eq!(Protocol::from_tag("hy2"), Some(Protocol::Hysteria2));
        assert_eq!(Protocol::from_tag("VLESS"), Some(Protocol::Vless));
        assert_eq!(Protocol::from_tag("wireguard"), None);
        assert_eq!(Protocol::Hysteria2.to_string(), "hysteria2");
    }

    #[test]
    fn vless_minimal() {
        let out = build(json!({
            "id": "n1", "type": "vless", "address": "a.example.com", "port": 443, "uuid": "uuid-1"
        }))
        .unwrap();
        let json = serde_json::to_value(&out).unwrap();
        assert_eq!(
            json,
            json!({
                "type": "vless",
                "tag": "node-0",
                "server": "a.example.com",
                "server_port": 443,
                "uuid": "uuid-1"
            })
        );
        assert!(out.is_proxy());
    }

    #[test]
    fn vless_reality_forces_tls_and_utls() {
        let out = build(json!({
            "type": "vless", "address": "r.example.com", "port": 443, "uuid": "u",
            "flow": "xtls-rprx-vision",
            "reality": {"public_key": "pk", "short_id": "ab", "server_name": "www.microsoft.com"}
        }))
        .unwrap();
        let json = serde_json::to_value(&out).unwrap();
        assert_eq!(json["flow"], "xtls-rprx-vision");
        assert_eq!(json["tls"]["enabled"], true);
        assert_eq!(json["tls"]["server_name"], "www.microsoft.com");
        assert_eq!(json["tls"]["utls"]["fingerprint"], "chrome");
        assert_eq!(json["tls"]["reality"]["public_key"], "pk");
        assert_eq!(json["tls"]["reality"]["short_id"], "ab");
    }

    #[test]
    fn vmess_ws_transport_with_tls() {
        let out = build(json!({
            "type": "vmess", "host": "v.example.com", "port": 443, "uuid": "u",
            "alterId": "0", "cipher": "aes-128-gcm", "tls": 1, "sni": "cdn.example.com",
            "network": "ws", "path": "/ws"
        }))
        .unwrap();
        let json = serde_json::to_value(&out).unwrap();
        assert_eq!(json["security"], "aes-128-gcm");
        assert_eq!(json["alter_id"], 0);
        assert_eq!(json["tls"]["server_name"], "cdn.example.com");
        assert!(json["tls"].get("insecure").is_none());
        assert_eq!(json["transport"]["type"], "ws");
        assert_eq!(json["transport"]["path"], "/ws");
        assert_eq!(json["transport"]["headers"]["Host"], "cdn.example.com");
    }

    #[test]
    fn vmess_defaults_security_auto_and_no_tls() {
        let out = build(json!({"type": "vmess", "address": "v", "port": 1, "uuid": "u", "network": "tcp"}))
            .unwrap();
        let json = serde_json::to_value(&out).unwrap();
        assert_eq!(json["security"], "auto");
        assert!(json.get("tls").is_none());
        assert!(json.get("transport").is_none());
    }

    #[test]
    fn trojan_always_has_tls_and_grpc_service_from_path() {
        let out = build(json!({
            "type": "trojan", "address": "t", "port": 443, "password": "pw",
            "skip_cert": true, "network": "grpc", "path": "svc"
        }))
        .unwrap();
        let json = serde_json::to_value(&out).unwrap();
        assert_eq!(json["tls"]["enabled"], true);
        assert_eq!(json["tls"]["insecure"], true);
        assert_eq!(json["transport"], json!({"type": "grpc", "service_name": "svc"}));
    }

    #[test]
    fn shadowsocks_accepts_cipher_alias() {
        let out = build(json!({"type": "ss", "address": "s", "port": 8388, "cipher": "aes-256-gcm", "password": "p"}))
            .unwrap();
        assert_eq!(
            serde_json::to_value(&out).unwrap(),
            json!({
                "type": "shadowsocks", "tag": "node-0", "server": "s", "server_port": 8388,
                "method": "aes-256-gcm", "password": "p"
            })
        );
    }

    #[test]
    fn hysteria2_bandwidth_and_obfs() {
        let out = build(json!({
            "type": "hysteria2", "address": "h", "port": 8443, "password": "p",
            "hysteria2": {"up": "100 Mbps", "down": 500, "obfs": "secret"}
        }))
        .unwrap();
        let json = serde_json::to_value(&out).unwrap();
        assert_eq!(json["up_mbps"], 100);
        assert_eq!(json["down_mbps"], 500);
        assert_eq!(json["obfs"], json!({"type": "salamander", "password": "secret"}));
        assert_eq!(json["tls"]["enabled"], true);
    }

    #[test]
    fn unsupported_protocol_reports_tag_and_index() {
        let err = build_outbound("x".into(), 4, &profile(json!({"type": "wireguard", "address": "w", "port": 1})))
            .unwrap_err();
        match err {
            VpnError::UnsupportedProtocol { protocol, index } => {
                assert_eq!(protocol, "wireguard");
                assert_eq!(index, 4);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_credentials_is_invalid_profile() {
        let err = build(json!({"type": "vless", "address": "a", "port": 1})).unwrap_err();
        assert!(matches!(err, VpnError::InvalidProfile { index: 0, .. }));
        assert!(err.to_string().contains("uuid"));
    }

    #[test]
    fn unknown_network_is_invalid_profile() {
        let err = build(json!({"type": "vmess", "address": "a", "port": 1, "uuid": "u", "network": "kcp"}))
            .unwrap_err();
        assert!(err.to_string().contains("kcp"));
    }

    #[test]
    fn builders_are_deterministic() {
        let value = json!({
            "type": "vmess", "address": "v", "port": 1, "uuid": "u",
            "network": "ws", "host_header": "h.example.com", "tls": true
        });
        let a = serde_json::to_string(&build(value.clone()).unwrap()).unwrap();
        let b = serde_json::to_string(&build(value).unwrap()).unwrap();
        assert_eq!(a, b);
    }
}
