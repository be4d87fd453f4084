//! Typed views of the proxy documents we read and write
//!
//! The proxy's configuration is loosely typed JSON. Routes and TLS policies
//! are decoded into small records here; fields we do not manage are carried
//! through untouched so a replaced document never loses operator settings.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// Handler name of the proxy's reverse-proxy action
pub const REVERSE_PROXY: &str = "reverse_proxy";

/// Issuer module name for the proxy's local certificate authority
pub const INTERNAL_ISSUER: &str = "internal";

/// Path of the HTTP servers container
pub const SERVERS_PATH: &str = "apps/http/servers";

/// Path of the TLS automation policy list
pub const POLICIES_PATH: &str = "apps/tls/automation/policies";

pub fn server_path(server_id: &str) -> String {
    format!("{}/{}", SERVERS_PATH, server_id)
}

pub fn routes_path(server_id: &str) -> String {
    format!("{}/routes", server_path(server_id))
}

pub fn route_path(server_id: &str, index: usize) -> String {
    format!("{}/{}", routes_path(server_id), index)
}

/// A host-match-to-upstream binding
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Route {
    #[serde(rename = "match", default, skip_serializing_if = "Vec::is_empty")]
    pub matchers: Vec<HostMatch>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub handle: Vec<Handler>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal: Option<bool>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostMatch {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub host: Vec<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Handler {
    pub handler: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upstreams: Vec<Upstream>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Upstream {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dial: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Route {
    /// Terminal route sending `domain` to `upstream_host:port`
    pub fn reverse_proxy(domain: &str, upstream_host: &str, port: u16) -> Self {
        Self {
            matchers: vec![HostMatch {
                host: vec![domain.to_string()],
                extra: Map::new(),
            }],
            handle: vec![Handler {
                handler: REVERSE_PROXY.to_string(),
                upstreams: vec![Upstream {
                    dial: Some(format_dial(upstream_host, port)),
                    extra: Map::new(),
                }],
                extra: Map::new(),
            }],
            terminal: Some(true),
            extra: Map::new(),
        }
    }

    /// Every host string across every match predicate
    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.matchers
            .iter()
            .flat_map(|m| m.host.iter().map(String::as_str))
    }

    pub fn matches_host(&self, domain: &str) -> bool {
        self.hosts().any(|h| h.eq_ignore_ascii_case(domain))
    }

    /// True when `domain` is the only host this route matches
    pub fn matches_only(&self, domain: &str) -> bool {
        let mut hosts = self.hosts().peekable();
        hosts.peek().is_some() && hosts.all(|h| h.eq_ignore_ascii_case(domain))
    }

    /// Dial string of the first reverse-proxy upstream
    pub fn dial(&self) -> Option<&str> {
        self.handle
            .iter()
            .filter(|h| h.handler == REVERSE_PROXY)
            .flat_map(|h| h.upstreams.iter())
            .find_map(|u| u.dial.as_deref())
    }

    pub fn upstream_port(&self) -> Option<u16> {
        self.dial().and_then(parse_dial).map(|(_, port)| port)
    }

    pub fn upstream_host(&self) -> Option<&str> {
        self.dial().and_then(parse_dial).and_then(|(host, _)| host)
    }

    /// Copy of this route with `domain` removed from every host list.
    /// Matchers left with no host at all are dropped.
    pub fn without_host(&self, domain: &str) -> Self {
        let mut route = self.clone();
        for matcher in &mut route.matchers {
            matcher.host.retain(|h| !h.eq_ignore_ascii_case(domain));
        }
        route
            .matchers
            .retain(|m| !m.host.is_empty() || !m.extra.is_empty());
        route
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Decode a route list, keeping positions aligned with the remote list.
/// Entries that are not route-shaped become `None`.
pub fn decode_routes(value: Option<Value>) -> Vec<Option<Route>> {
    let Some(Value::Array(items)) = value else {
        return Vec::new();
    };

    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| match serde_json::from_value(item) {
            Ok(route) => Some(route),
            Err(e) => {
                debug!(index, error = %e, "Skipping route with unexpected shape");
                None
            }
        })
        .collect()
}

/// Split a `host:port` dial string. The host part is optional (`:4000`)
/// and may be a bracketed IPv6 literal.
pub fn parse_dial(dial: &str) -> Option<(Option<&str>, u16)> {
    let dial = dial
        .strip_prefix("tcp/")
        .unwrap_or(dial);
    let (host, port) = dial.rsplit_once(':')?;
    let port = port.parse::<u16>().ok()?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Some(((!host.is_empty()).then_some(host), port))
}

pub fn format_dial(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// TLS automation policy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TlsPolicy {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subjects: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issuers: Vec<Issuer>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Issuer {
    pub module: String,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TlsPolicy {
    /// Policy issuing certificates for `domain` from the internal CA
    pub fn internal(domain: &str) -> Self {
        Self {
            subjects: vec![domain.to_string()],
            issuers: vec![Issuer {
                module: INTERNAL_ISSUER.to_string(),
                extra: Map::new(),
            }],
            extra: Map::new(),
        }
    }

    /// Whether this policy already has `domain` issued by the internal CA
    pub fn covers(&self, domain: &str) -> bool {
        self.subjects.iter().any(|s| s.eq_ignore_ascii_case(domain))
            && self.issuers.iter().any(|i| i.module == INTERNAL_ISSUER)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Fields of a server entry the bootstrapper reconciles
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerView {
    #[serde(default)]
    pub listen: Option<Vec<String>>,

    #[serde(default)]
    pub automatic_https: Option<AutomaticHttps>,

    #[serde(default)]
    pub routes: Option<Vec<Value>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AutomaticHttps {
    #[serde(default)]
    pub disable: bool,
}

/// Route positions to delete, always yielded highest index first.
///
/// Deleting by position shifts every later entry down by one, so only a
/// descending walk keeps each remaining index pointing at the route it was
/// collected for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeletionOrder(Vec<usize>);

impl DeletionOrder {
    pub fn new(indices: impl IntoIterator<Item = usize>) -> Self {
        let mut indices: Vec<usize> = indices.into_iter().collect();
        indices.sort_unstable_by(|a, b| b.cmp(a));
        indices.dedup();
        Self(indices)
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
