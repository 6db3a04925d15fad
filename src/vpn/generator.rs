//! Assembles a complete sing-box configuration from subscription profiles.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use serde::Serialize;
use serde_json::Value;

use super::error::VpnResult;
use super::outbound::{build_outbound, Outbound, SelectorOutbound};
use super::subscription::Profile;

pub const DIRECT_TAG: &str = "direct";
pub const BLOCK_TAG: &str = "block";
pub const SELECTOR_TAG: &str = "selector";

const RESERVED_TAGS: [&str; 3] = [DIRECT_TAG, BLOCK_TAG, SELECTOR_TAG];
const REMOTE_DNS_TAG: &str = "remote";
const LOCAL_DNS_TAG: &str = "local";
const TUN_ADDRESS: &str = "172.19.0.1/30";

/// Template knobs for the non-profile parts of the generated config.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratorOptions {
    pub listen: String,
    pub listen_port: u16,
    pub tun: bool,
    pub log_level: String,
    pub remote_dns: String,
    pub local_dns: String,
    pub direct_suffixes: Vec<String>,
    /// `host:port` of the engine management API; `None` leaves it disabled.
    pub clash_api: Option<String>,
    pub clash_api_secret: Option<String>,
    /// Route rules passed through verbatim ahead of the template rules.
    pub extra_rules: Vec<Value>,
}

impl Default for GeneratorOptions {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1".into(),
            listen_port: 7890,
            tun: false,
            log_level: "info".into(),
            remote_dns: "https://1.1.1.1/dns-query".into(),
            local_dns: "https://223.5.5.5/dns-query".into(),
            direct_suffixes: vec!["lan".into(), "local".into(), "localhost".into()],
            clash_api: Some("127.0.0.1:9090".into()),
            clash_api_secret: None,
            extra_rules: Vec::new(),
        }
    }
}

// ── Config document ─────────────────────────────────────────────────

/// The full engine configuration. Built fresh on every refresh and never
/// mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeneratedConfig {
    pub log: LogSection,
    pub dns: DnsSection,
    pub inbounds: Vec<Inbound>,
    pub outbounds: Vec<Outbound>,
    pub route: RouteSection,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<Experimental>,
}

impl GeneratedConfig {
    /// Tags of the profile-derived outbounds, in encounter order.
    pub fn proxy_tags(&self) -> Vec<&str> {
        self.outbounds
            .iter()
            .filter(|o| o.is_proxy())
            .map(Outbound::tag)
            .collect()
    }

    pub fn selector(&self) -> Option<&SelectorOutbound> {
        self.outbounds.iter().find_map(|o| match o {
            Outbound::Selector(s) => Some(s),
            _ => None,
        })
    }

    pub fn outbound(&self, tag: &str) -> Option<&Outbound> {
        self.outbounds.iter().find(|o| o.tag() == tag)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogSection {
    pub level: String,
    pub timestamp: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DnsSection {
    pub servers: Vec<DnsServer>,
    pub rules: Vec<DnsRule>,
    #[serde(rename = "final")]
    pub final_server: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DnsServer {
    pub tag: String,
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detour: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DnsRule {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub domain: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub domain_suffix: Vec<String>,
    pub server: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Inbound {
    Mixed {
        tag: String,
        listen: String,
        listen_port: u16,
    },
    Tun {
        tag: String,
        address: Vec<String>,
        auto_route: bool,
        strict_route: bool,
        stack: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteSection {
    pub rules: Vec<RouteRule>,
    #[serde(rename = "final")]
    pub final_outbound: String,
    pub auto_detect_interface: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RouteRule {
    /// Operator-supplied rule, emitted as-is.
    Raw(Value),
    Template(TemplateRule),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TemplateRule {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_is_private: Option<bool>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub domain_suffix: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outbound: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Experimental {
    pub clash_api: ClashApi,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClashApi {
    pub external_controller: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

// ── Generator ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct ConfigGenerator {
    options: GeneratorOptions,
}

impl ConfigGenerator {
    pub fn new(options: GeneratorOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &GeneratorOptions {
        &self.options
    }

    /// Build the whole config or nothing: the first profile that cannot be
    /// mapped fails the call.
    pub fn generate(&self, profiles: &[Profile]) -> VpnResult<GeneratedConfig> {
        let tags = assign_tags(profiles);
        let mut outbounds = Vec::with_capacity(profiles.len() + 3);
        outbounds.push(Outbound::Direct {
            tag: DIRECT_TAG.into(),
        });
        outbounds.push(Outbound::Block {
            tag: BLOCK_TAG.into(),
        });

        let mut members = Vec::with_capacity(profiles.len());
        for (index, (profile, tag)) in profiles.iter().zip(tags).enumerate() {
            let outbound = build_outbound(tag, index, profile)?;
            members.push(outbound.tag().to_string());
            outbounds.push(outbound);
        }

        // An empty selector cannot carry traffic, so route and DNS fall back
        // to direct until the subscription yields nodes.
        let upstream = if members.is_empty() {
            DIRECT_TAG
        } else {
            SELECTOR_TAG
        };
        outbounds.push(Outbound::Selector(SelectorOutbound {
            tag: SELECTOR_TAG.into(),
            default: members.first().cloned(),
            outbounds: members,
        }));

        Ok(GeneratedConfig {
            log: LogSection {
                level: self.options.log_level.clone(),
                timestamp: true,
            },
            dns: self.dns_section(profiles, upstream),
            inbounds: self.inbounds(),
            outbounds,
            route: self.route_section(upstream),
            experimental: self.experimental(),
        })
    }

    /// Config used when the engine is started before any subscription was
    /// fetched.
    pub fn default_config(&self) -> VpnResult<GeneratedConfig> {
        self.generate(&[])
    }

    fn dns_section(&self, profiles: &[Profile], upstream: &str) -> DnsSection {
        let mut seen = HashSet::new();
        let node_hosts: Vec<String> = profiles
            .iter()
            .map(|p| p.address.trim().to_ascii_lowercase())
            .filter(|host| !host.is_empty() && host.parse::<IpAddr>().is_err())
            .filter(|host| seen.insert(host.clone()))
            .collect();

        let mut rules = Vec::new();
        if !self.options.direct_suffixes.is_empty() {
            rules.push(DnsRule {
                domain: Vec::new(),
                domain_suffix: self.options.direct_suffixes.clone(),
                server: LOCAL_DNS_TAG.into(),
            });
        }
        if !node_hosts.is_empty() {
            rules.push(DnsRule {
                domain: node_hosts,
                domain_suffix: Vec::new(),
                server: LOCAL_DNS_TAG.into(),
            });
        }

        DnsSection {
            servers: vec![
                DnsServer {
                    tag: REMOTE_DNS_TAG.into(),
                    address: self.options.remote_dns.clone(),
                    detour: Some(upstream.to_string()),
                },
                DnsServer {
                    tag: LOCAL_DNS_TAG.into(),
                    address: self.options.local_dns.clone(),
                    detour: Some(DIRECT_TAG.into()),
                },
            ],
            rules,
            final_server: REMOTE_DNS_TAG.into(),
        }
    }

    fn inbounds(&self) -> Vec<Inbound> {
        let mut inbounds = vec![Inbound::Mixed {
            tag: "mixed-in".into(),
            listen: self.options.listen.clone(),
            listen_port: self.options.listen_port,
        }];
        if self.options.tun {
            inbounds.push(Inbound::Tun {
                tag: "tun-in".into(),
                address: vec![TUN_ADDRESS.into()],
                auto_route: true,
                strict_route: true,
                stack: "system".into(),
            });
        }
        inbounds
    }

    fn route_section(&self, upstream: &str) -> RouteSection {
        let mut rules: Vec<RouteRule> = self
            .options
            .extra_rules
            .iter()
            .cloned()
            .map(RouteRule::Raw)
            .collect();
        rules.push(RouteRule::Template(TemplateRule {
            protocol: Some("dns".into()),
            action: Some("hijack-dns".into()),
            ..TemplateRule::default()
        }));
        rules.push(RouteRule::Template(TemplateRule {
            ip_is_private: Some(true),
            outbound: Some(DIRECT_TAG.into()),
            ..TemplateRule::default()
        }));
        if !self.options.direct_suffixes.is_empty() {
            rules.push(RouteRule::Template(TemplateRule {
                domain_suffix: self.options.direct_suffixes.clone(),
                outbound: Some(DIRECT_TAG.into()),
                ..TemplateRule::default()
            }));
        }

        RouteSection {
            rules,
            final_outbound: upstream.to_string(),
            auto_detect_interface: true,
        }
    }

    fn experimental(&self) -> Option<Experimental> {
        self.options.clash_api.as_ref().map(|controller| Experimental {
            clash_api: ClashApi {
                external_controller: controller.clone(),
                secret: self.options.clash_api_secret.clone(),
            },
        })
    }
}

/// Derive a unique, deterministic tag for every profile.
///
/// A name is used when no other profile shares it; clashes fall back to
/// `node-<id>` and then `node-<index>`.
fn assign_tags(profiles: &[Profile]) -> Vec<String> {
    let mut name_counts: HashMap<&str, usize> = HashMap::new();
    for profile in profiles {
        if let Some(name) = clean(profile.name.as_deref()) {
            *name_counts.entry(name).or_default() += 1;
        }
    }

    let mut taken: HashSet<String> = RESERVED_TAGS.iter().map(|t| (*t).to_string()).collect();
    let mut tags = Vec::with_capacity(profiles.len());
    for (index, profile) in profiles.iter().enumerate() {
        let name = clean(profile.name.as_deref());
        let id = clean(profile.id.as_deref());

        let mut candidates = Vec::with_capacity(3);
        match name {
            Some(name) if name_counts.get(name) == Some(&1) => candidates.push(name.to_string()),
            Some(_) => {
                if let Some(id) = id {
                    candidates.push(format!("node-{id}"));
                }
            }
            None => {}
        }
        candidates.push(format!("node-{index}"));

        let tag = candidates
            .into_iter()
            .find(|c| !taken.contains(c))
            .unwrap_or_else(|| {
                (1..)
                    .map(|n| format!("node-{index}-{n}"))
                    .find(|c| !taken.contains(c))
                    .unwrap_or_default()
            });
        taken.insert(tag.clone());
        tags.push(tag);
    }
    tags
}

fn clean(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vpn::error::VpnError;
    use serde_json::json;

    fn profiles(value: Value) -> Vec<Profile> {
        value
            .as_array()
            .unwrap()
            .iter()
            .cloned()
            .map(|v| Profile::from_value(v).unwrap())
            .collect()
    }

    fn vless(name: Option<&str>, id: &str, address: &str) -> Value {
        let mut v = json!({"id": id, "type": "vless", "address": address, "port": 443, "uuid": "u"});
        if let Some(name) = name {
            v["name"] = json!(name);
        }
        v
    }

    #[test]
    fn empty_subscription_keeps_synthetic_outbounds() {
        let config = ConfigGenerator::default().generate(&[]).unwrap();
        assert!(config.proxy_tags().is_empty());
        assert!(config.outbound(DIRECT_TAG).is_some());
        assert!(config.outbound(BLOCK_TAG).is_some());
        let selector = config.selector().unwrap();
        assert!(selector.outbounds.is_empty());
        assert_eq!(selector.default, None);
        assert_eq!(config.route.final_outbound, DIRECT_TAG);
    }

    #[test]
    fn single_vless_is_tagged_by_position() {
        let list = profiles(json!([
            {"id": "n1", "type": "vless", "address": "a.example.com", "port": 443, "uuid": "uuid-1"}
        ]));
        let config = ConfigGenerator::default().generate(&list).unwrap();
        assert_eq!(config.proxy_tags(), vec!["node-0"]);
        match config.outbound("node-0").unwrap() {
            Outbound::Vless(v) => {
                assert_eq!(v.server, "a.example.com");
                assert_eq!(v.server_port, 443);
                assert_eq!(v.uuid, "uuid-1");
            }
            other => panic!("expected vless, got {other:?}"),
        }
        let selector = config.selector().unwrap();
        assert_eq!(selector.outbounds, vec!["node-0"]);
        assert_eq!(selector.default.as_deref(), Some("node-0"));
        assert_eq!(config.route.final_outbound, SELECTOR_TAG);
    }

    #[test]
    fn outbound_order_is_direct_block_proxies_selector() {
        let list = profiles(json!([vless(Some("hk"), "1", "a"), vless(Some("jp"), "2", "b")]));
        let config = ConfigGenerator::default().generate(&list).unwrap();
        let tags: Vec<&str> = config.outbounds.iter().map(Outbound::tag).collect();
        assert_eq!(tags, vec!["direct", "block", "hk", "jp", "selector"]);
    }

    #[test]
    fn duplicate_names_fall_back_to_id_then_index() {
        let list = profiles(json!([
            vless(Some("dup"), "7", "a"),
            vless(Some("dup"), "7", "b"),
            vless(Some("solo"), "9", "c"),
            vless(Some("selector"), "10", "d"),
        ]));
        let config = ConfigGenerator::default().generate(&list).unwrap();
        assert_eq!(config.proxy_tags(), vec!["node-7", "node-1", "solo", "node-3"]);
    }

    #[test]
    fn generation_is_all_or_nothing() {
        let list = profiles(json!([
            vless(None, "1", "a"),
            {"type": "wireguard", "address": "w", "port": 51820}
        ]));
        let err = ConfigGenerator::default().generate(&list).unwrap_err();
        assert!(matches!(err, VpnError::UnsupportedProtocol { index: 1, .. }));
    }

    #[test]
    fn generation_is_deterministic() {
        let list = profiles(json!([
            vless(Some("a"), "1", "a.example.com"),
            {"type": "trojan", "address": "t.example.com", "port": 443, "password": "p"},
            {"type": "ss", "address": "10.0.0.1", "port": 8388, "method": "aes-128-gcm", "password": "p"}
        ]));
        let generator = ConfigGenerator::default();
        let a = serde_json::to_vec(&generator.generate(&list).unwrap()).unwrap();
        let b = serde_json::to_vec(&generator.generate(&list).unwrap()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn node_hostnames_resolve_locally() {
        let list = profiles(json!([
            vless(None, "1", "A.example.com"),
            vless(None, "2", "a.example.com"),
            vless(None, "3", "192.0.2.1")
        ]));
        let config = ConfigGenerator::default().generate(&list).unwrap();
        let rule = config
            .dns
            .rules
            .iter()
            .find(|r| !r.domain.is_empty())
            .unwrap();
        assert_eq!(rule.domain, vec!["a.example.com"]);
        assert_eq!(rule.server, "local");
        assert_eq!(config.dns.final_server, "remote");
        assert_eq!(config.dns.servers[0].detour.as_deref(), Some(SELECTOR_TAG));
    }

    #[test]
    fn top_level_keys_and_template_sections() {
        let options = GeneratorOptions {
            tun: true,
            extra_rules: vec![json!({"domain_suffix": ["corp"], "outbound": "direct"})],
            clash_api_secret: Some("s3cret".into()),
            ..GeneratorOptions::default()
        };
        let config = ConfigGenerator::new(options).generate(&[]).unwrap();
        let json = serde_json::to_value(&config).unwrap();
        for key in ["log", "dns", "inbounds", "outbounds", "route"] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
        assert_eq!(json["inbounds"][0]["type"], "mixed");
        assert_eq!(json["inbounds"][0]["listen_port"], 7890);
        assert_eq!(json["inbounds"][1]["type"], "tun");
        assert_eq!(json["route"]["rules"][0], json!({"domain_suffix": ["corp"], "outbound": "direct"}));
        assert_eq!(json["route"]["rules"][1], json!({"protocol": "dns", "action": "hijack-dns"}));
        assert_eq!(json["route"]["rules"][2], json!({"ip_is_private": true, "outbound": "direct"}));
        assert_eq!(json["route"]["auto_detect_interface"], true);
        assert_eq!(json["experimental"]["clash_api"]["external_controller"], "127.0.0.1:9090");
        assert_eq!(json["experimental"]["clash_api"]["secret"], "s3cret");
    }

    #[test]
    fn clash_api_can_be_disabled() {
        let options = GeneratorOptions {
            clash_api: None,
            ..GeneratorOptions::default()
        };
        let json = serde_json::to_value(ConfigGenerator::new(options).default_config().unwrap()).unwrap();
        assert!(json.get("experimental").is_none());
    }
}
