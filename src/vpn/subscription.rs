//! Subscription fetching and payload decoding.
//!
//! Panels serve the node list either as a JSON array of profile objects or as
//! that same JSON wrapped in base64 (to survive CDNs that mangle bytes). Some
//! panels nest the array under `servers` or `data`. Every shape decodes into
//! the same ordered `Vec<Profile>`.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::error::{VpnError, VpnResult};

/// Connect timeout for subscription fetch.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Keys lifted out of a profile object; everything else lands in `attributes`.
const ID_KEY: &str = "id";
const NAME_KEY: &str = "name";
const TYPE_KEY: &str = "type";
const ADDRESS_KEYS: [&str; 3] = ["address", "host", "server"];
const PORT_KEY: &str = "port";

/// One remote node descriptor as received from the panel.
///
/// `attributes` holds the protocol-dependent bag (credentials, TLS and
/// transport options). It is an ordered map so that generation over the
/// same profile is byte-stable.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Profile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub protocol: String,
    pub address: String,
    pub port: u16,
    #[serde(flatten)]
    pub attributes: BTreeMap<String, Value>,
}

impl Profile {
    /// Build a profile from one JSON object of the subscription payload.
    pub fn from_value(value: Value) -> Result<Self, String> {
        let Value::Object(map) = value else {
            return Err("profile entry is not a JSON object".into());
        };
        let mut attributes: BTreeMap<String, Value> = map.into_iter().collect();

        let id = match attributes.remove(ID_KEY) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.trim().is_empty() => None,
            Some(Value::String(s)) => Some(s),
            Some(Value::Number(n)) => Some(n.to_string()),
            Some(other) => return Err(format!("'id' must be a string or number, got {other}")),
        };

        let name = match attributes.remove(NAME_KEY) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s),
            Some(other) => return Err(format!("'name' must be a string, got {other}")),
        };

        let protocol = match attributes.remove(TYPE_KEY) {
            Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_ascii_lowercase(),
            _ => return Err("missing 'type'".into()),
        };

        let mut address = None;
        for key in ADDRESS_KEYS {
            if let Some(value) = attributes.remove(key) {
                if address.is_none() {
                    address = value.as_str().map(str::trim).map(str::to_string);
                }
            }
        }
        let address = address
            .filter(|a| !a.is_empty())
            .ok_or_else(|| "missing 'address'".to_string())?;

        let port = match attributes.remove(PORT_KEY) {
            Some(value) => parse_port(&value)?,
            None => return Err("missing 'port'".into()),
        };

        Ok(Self {
            id,
            name,
            protocol,
            address,
            port,
            attributes,
        })
    }
}

impl<'de> Deserialize<'de> for Profile {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(value).map_err(serde::de::Error::custom)
    }
}

fn parse_port(value: &Value) -> Result<u16, String> {
    let port = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    match port {
        Some(p) if (1..=u64::from(u16::MAX)).contains(&p) => Ok(p as u16),
        _ => Err(format!("invalid 'port': {value}")),
    }
}

// ── Payload decoding ────────────────────────────────────────────────

/// Decode a raw subscription body into profiles.
///
/// The body is first tried as JSON; only when that fails is it treated as
/// base64 and re-parsed. An empty list is valid.
pub fn decode_payload(body: &str) -> VpnResult<Vec<Profile>> {
    let trimmed = body.trim();
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => profiles_from_value(value),
        Err(json_err) => {
            let bytes = decode_base64(trimmed).map_err(|b64_err| {
                VpnError::Decode(format!("body is neither JSON ({json_err}) nor base64 ({b64_err})"))
            })?;
            let text = String::from_utf8(bytes)
                .map_err(|_| VpnError::Decode("base64 payload is not valid UTF-8".into()))?;
            let value = serde_json::from_str::<Value>(text.trim()).map_err(|e| {
                VpnError::Decode(format!("base64 payload does not contain JSON: {e}"))
            })?;
            profiles_from_value(value)
        }
    }
}

fn profiles_from_value(value: Value) -> VpnResult<Vec<Profile>> {
    let entries = match value {
        Value::Array(entries) => entries,
        Value::Object(mut map) => match ["servers", "data"]
            .iter()
            .find_map(|key| map.remove(*key).filter(Value::is_array))
        {
            Some(Value::Array(entries)) => entries,
            _ => {
                return Err(VpnError::Decode(
                    "JSON object has no 'servers' or 'data' array".into(),
                ))
            }
        },
        other => {
            return Err(VpnError::Decode(format!(
                "expected a JSON array of profiles, got {}",
                json_kind(&other)
            )))
        }
    };

    entries
        .into_iter()
        .enumerate()
        .map(|(index, entry)| {
            Profile::from_value(entry)
                .map_err(|reason| VpnError::Decode(format!("profile #{index}: {reason}")))
        })
        .collect()
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Decode base64 content, trying the standard, URL-safe and unpadded
/// alphabets. Embedded whitespace (line-wrapped payloads) is ignored.
pub fn decode_base64(content: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let cleaned: String = content.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD
        .decode(&cleaned)
        .or_else(|_| URL_SAFE.decode(&cleaned))
        .or_else(|_| STANDARD_NO_PAD.decode(&cleaned))
        .or_else(|_| URL_SAFE_NO_PAD.decode(&cleaned))
}

// ── Token resolution ────────────────────────────────────────────────

/// Pick the bearer token for a subscription URL.
///
/// An explicit token always wins. Otherwise the token is lifted from the
/// panel URL forms `.../api/v1/client/subscribe?token=<t>` and `.../sub/<t>`.
pub fn resolve_token(url: &str, explicit: Option<&str>) -> Option<String> {
    if let Some(token) = explicit.map(str::trim).filter(|t| !t.is_empty()) {
        return Some(token.to_string());
    }

    if let Some((_, query)) = url.split_once('?') {
        let token = query
            .split('&')
            .find_map(|pair| pair.strip_prefix("token="))
            .filter(|t| !t.is_empty());
        if let Some(token) = token {
            return Some(token.to_string());
        }
    }

    url.split_once("/sub/")
        .map(|(_, rest)| rest.split(['?', '#', '/']).next().unwrap_or_default())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

// ── Fetcher ─────────────────────────────────────────────────────────

/// Source of profiles for a refresh cycle.
#[async_trait]
pub trait SubscriptionSource: Send + Sync {
    async fn fetch(&self) -> VpnResult<Vec<Profile>>;
}

/// HTTP subscription fetcher bound to one panel URL.
pub struct SubscriptionFetcher {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl SubscriptionFetcher {
    /// Build a fetcher with a bounded request timeout.
    ///
    /// Uses a direct (no-proxy) client: the subscription must be reachable
    /// before the engine is up, and must not loop through it afterwards.
    pub fn new(
        url: impl Into<String>,
        token: Option<&str>,
        timeout: Duration,
        user_agent: &str,
    ) -> VpnResult<Self> {
        let url = url.into();
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(timeout)
            .connect_timeout(CONNECT_TIMEOUT.min(timeout))
            .user_agent(user_agent)
            .build()
            .map_err(|e| VpnError::Fetch {
                status: None,
                reason: format!("failed to build subscription HTTP client: {e}"),
            })?;
        let token = resolve_token(&url, token);
        Ok(Self { client, url, token })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// GET `url` (with an optional bearer token) and decode the body.
    pub async fn fetch_profiles(&self, url: &str, token: Option<&str>) -> VpnResult<Vec<Profile>> {
        let mut request = self.client.get(url);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let resp = request.send().await.map_err(|e| VpnError::Fetch {
            status: None,
            reason: if e.is_timeout() {
                format!("timed out fetching {url}")
            } else if e.is_connect() {
                format!("failed to connect to {url}: {e}")
            } else {
                format!("request to {url} failed: {e}")
            },
        })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(VpnError::Fetch {
                status: Some(status.as_u16()),
                reason: format!("subscription returned {status}"),
            });
        }

        let body = resp.text().await.map_err(|e| VpnError::Fetch {
            status: Some(status.as_u16()),
            reason: format!("failed to read subscription body: {e}"),
        })?;

        let profiles = decode_payload(&body)?;
        tracing::debug!(count = profiles.len(), "subscription decoded");
        Ok(profiles)
    }
}

#[async_trait]
impl SubscriptionSource for SubscriptionFetcher {
    async fn fetch(&self) -> VpnResult<Vec<Profile>> {
        self.fetch_profiles(&self.url, self.token.as_deref()).await
    }
}
