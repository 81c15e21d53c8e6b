//! NodeInfo: advertising and reading server software metadata

use crate::error::Error;
use crate::fetch::loader::verify_public_address;
use crate::fetch::read_body_limited;
use reqwest_middleware::ClientWithMiddleware;
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use url::Url;

/// NodeInfo schema versions this client understands, preferred first.
const SUPPORTED_SCHEMAS: [&str; 4] = [
    "http://nodeinfo.diaspora.software/ns/schema/2.1",
    "http://nodeinfo.diaspora.software/ns/schema/2.0",
    "http://nodeinfo.diaspora.software/ns/schema/1.1",
    "http://nodeinfo.diaspora.software/ns/schema/1.0",
];

/// The software block of a NodeInfo document.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Software {
    /// Canonical software name
    pub name: String,
    /// Software version
    #[serde(
        serialize_with = "serialize_semver",
        deserialize_with = "deserialize_semver"
    )]
    pub version: Version,
    /// Source repository
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<Url>,
    /// Project homepage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub homepage: Option<Url>,
}

/// Third-party services the server connects to.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Services {
    /// Services the server can import from
    #[serde(default)]
    pub inbound: Vec<String>,
    /// Services the server can publish to
    #[serde(default)]
    pub outbound: Vec<String>,
}

/// User counts of a server.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Users {
    /// Total registered users
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    /// Users active within the last month
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_month: Option<u64>,
    /// Users active within the last half year
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_halfyear: Option<u64>,
}

/// Usage statistics of a server.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    /// User counts
    #[serde(default)]
    pub users: Users,
    /// Number of local posts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_posts: Option<u64>,
    /// Number of local comments
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_comments: Option<u64>,
}

/// A NodeInfo 2.x document.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    /// Schema version, `2.0` or `2.1`
    pub version: String,
    /// Software running the server
    pub software: Software,
    /// Supported federation protocols
    #[serde(default)]
    pub protocols: Vec<String>,
    /// Connected third-party services
    #[serde(default)]
    pub services: Services,
    /// Whether the server accepts new registrations
    #[serde(default)]
    pub open_registrations: bool,
    /// Usage statistics
    #[serde(default)]
    pub usage: Usage,
    /// Free-form metadata
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

/// How strictly a fetched document is parsed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NodeInfoParseMode {
    /// Reject malformed documents
    #[default]
    Strict,
    /// Fill missing or malformed fields with reasonable defaults
    BestEffort,
}

/// NodeInfo client.
pub struct NodeInfoClient {
    client: ClientWithMiddleware,
    allow_private_address: bool,
}

impl NodeInfoClient {
    /// Creates a client.
    pub fn new(client: ClientWithMiddleware, allow_private_address: bool) -> NodeInfoClient {
        NodeInfoClient {
            client,
            allow_private_address,
        }
    }

    /// Fetches a host's NodeInfo document without interpreting it.
    pub async fn fetch_raw(&self, host: &str) -> Result<Value, Error> {
        let scheme = if self.allow_private_address { "http" } else { "https" };
        let discovery = Url::parse(&format!("{scheme}://{host}/.well-known/nodeinfo"))?;
        let links = self.get_json(&discovery).await?;

        let href = select_nodeinfo_link(&links)
            .ok_or_else(|| Error::Parse(format!("{host}: no supported nodeinfo version")))?;
        let href = discovery.join(href)?;
        debug!("Fetching nodeinfo {href}");
        self.get_json(&href).await
    }

    /// Fetches and parses a host's NodeInfo document.
    pub async fn fetch(&self, host: &str, mode: NodeInfoParseMode) -> Result<NodeInfo, Error> {
        let raw = self.fetch_raw(host).await?;
        parse_node_info(&raw, mode)
    }

    async fn get_json(&self, url: &Url) -> Result<Value, Error> {
        if !self.allow_private_address {
            verify_public_address(url).await?;
        }
        let response = self
            .client
            .get(url.as_str())
            .header("Accept", "application/json")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::fetch(url, response.status()));
        }
        let body = read_body_limited(response).await?;
        serde_json::from_slice(&body).map_err(|e| Error::Parse(format!("{url}: {e}")))
    }
}

/// Picks the highest supported schema link out of a discovery document.
fn select_nodeinfo_link(discovery: &Value) -> Option<&str> {
    let links = discovery.get("links")?.as_array()?;
    for schema in SUPPORTED_SCHEMAS {
        if let Some(link) = links
            .iter()
            .find(|l| l.get("rel").and_then(Value::as_str) == Some(schema))
        {
            return link.get("href").and_then(Value::as_str);
        }
    }
    None
}

/// Parses a NodeInfo document under the chosen mode.
pub fn parse_node_info(raw: &Value, mode: NodeInfoParseMode) -> Result<NodeInfo, Error> {
    match mode {
        NodeInfoParseMode::Strict => serde_json::from_value(raw.clone())
            .map_err(|e| Error::Parse(format!("nodeinfo: {e}"))),
        NodeInfoParseMode::BestEffort => {
            let version = raw
                .get("version")
                .and_then(Value::as_str)
                .unwrap_or("2.0")
                .to_string();
            let software = raw.get("software").cloned().unwrap_or_default();
            let name = software
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            let software_version = software
                .get("version")
                .and_then(Value::as_str)
                .and_then(|v| parse_semver(v).ok())
                .unwrap_or_else(|| Version::new(0, 0, 0));
            Ok(NodeInfo {
                version,
                software: Software {
                    name,
                    version: software_version,
                    repository: software
                        .get("repository")
                        .and_then(Value::as_str)
                        .and_then(|u| Url::parse(u).ok()),
                    homepage: software
                        .get("homepage")
                        .and_then(Value::as_str)
                        .and_then(|u| Url::parse(u).ok()),
                },
                protocols: serde_json::from_value(
                    raw.get("protocols").cloned().unwrap_or(Value::Null),
                )
                .unwrap_or_default(),
                services: serde_json::from_value(
                    raw.get("services").cloned().unwrap_or(Value::Null),
                )
                .unwrap_or_default(),
                open_registrations: raw
                    .get("openRegistrations")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                usage: serde_json::from_value(raw.get("usage").cloned().unwrap_or(Value::Null))
                    .unwrap_or_default(),
                metadata: raw
                    .get("metadata")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default(),
            })
        }
    }
}

/// Parses a version leniently: a leading `v` and missing minor/patch
/// components are tolerated, as in the wild.
pub fn parse_semver(version: &str) -> Result<Version, Error> {
    let version = version.trim().trim_start_matches('v');
    if let Ok(parsed) = Version::parse(version) {
        return Ok(parsed);
    }
    // Pad "1" and "1.2" out to full triples, keeping any extensions.
    let (core, extra) = version
        .find(['-', '+'])
        .map(|i| version.split_at(i))
        .unwrap_or((version, ""));
    let dots = core.matches('.').count();
    let padded = match dots {
        0 => format!("{core}.0.0{extra}"),
        1 => format!("{core}.0{extra}"),
        _ => return Err(Error::Parse(format!("unparseable version {version:?}"))),
    };
    Version::parse(&padded).map_err(|e| Error::Parse(format!("unparseable version {version:?}: {e}")))
}

/// Renders a version in the canonical form [parse_semver] accepts.
pub fn format_semver(version: &Version) -> String {
    version.to_string()
}

fn serialize_semver<S: serde::Serializer>(version: &Version, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format_semver(version))
}

fn deserialize_semver<'de, D: serde::Deserializer<'de>>(d: D) -> Result<Version, D::Error> {
    let raw = String::deserialize(d)?;
    parse_semver(&raw).map_err(serde::de::Error::custom)
}

/// The discovery document a server publishes at `/.well-known/nodeinfo`,
/// pointing at its versioned NodeInfo endpoint.
pub fn build_discovery_document(nodeinfo_url: &Url) -> Value {
    serde_json::json!({
        "links": [{
            "rel": "http://nodeinfo.diaspora.software/ns/schema/2.1",
            "href": nodeinfo_url,
        }]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fixture() -> Value {
        json!({
            "version": "2.1",
            "software": {"name": "fedify", "version": "1.4.2"},
            "protocols": ["activitypub"],
            "services": {"inbound": [], "outbound": ["rss2.0"]},
            "openRegistrations": true,
            "usage": {"users": {"total": 42, "activeMonth": 7}, "localPosts": 100},
            "metadata": {"nodeName": "test"}
        })
    }

    #[test]
    fn test_parse_strict() {
        let info = parse_node_info(&fixture(), NodeInfoParseMode::Strict).unwrap();
        assert_eq!(info.version, "2.1");
        assert_eq!(info.software.name, "fedify");
        assert_eq!(info.software.version, Version::new(1, 4, 2));
        assert!(info.open_registrations);
        assert_eq!(info.usage.users.total, Some(42));
        assert_eq!(info.usage.local_posts, Some(100));
    }

    #[test]
    fn test_parse_strict_rejects_malformed() {
        let raw = json!({"version": "2.0"});
        assert!(parse_node_info(&raw, NodeInfoParseMode::Strict).is_err());

        let raw = json!({
            "version": "2.0",
            "software": {"name": "x", "version": "not a version at all, truly"}
        });
        assert!(parse_node_info(&raw, NodeInfoParseMode::Strict).is_err());
    }

    #[test]
    fn test_parse_best_effort_fills_defaults() {
        let raw = json!({"version": "2.0", "software": {"name": "mastodon"}});
        let info = parse_node_info(&raw, NodeInfoParseMode::BestEffort).unwrap();
        assert_eq!(info.software.name, "mastodon");
        assert_eq!(info.software.version, Version::new(0, 0, 0));
        assert!(!info.open_registrations);

        let empty = json!({});
        let info = parse_node_info(&empty, NodeInfoParseMode::BestEffort).unwrap();
        assert_eq!(info.software.name, "unknown");
    }

    #[test]
    fn test_parse_semver_lenient() {
        assert_eq!(parse_semver("1.2.3").unwrap(), Version::new(1, 2, 3));
        assert_eq!(parse_semver("v1.2.3").unwrap(), Version::new(1, 2, 3));
        assert_eq!(parse_semver("4.3").unwrap(), Version::new(4, 3, 0));
        assert_eq!(parse_semver("2").unwrap(), Version::new(2, 0, 0));
        let rc = parse_semver("1.2-rc.1").unwrap();
        assert_eq!((rc.major, rc.minor, rc.patch), (1, 2, 0));
        assert_eq!(rc.pre.as_str(), "rc.1");
        assert!(parse_semver("total garbage here").is_err());
    }

    #[test]
    fn test_select_nodeinfo_link_prefers_newest() {
        let discovery = json!({"links": [
            {"rel": "http://nodeinfo.diaspora.software/ns/schema/2.0", "href": "/nodeinfo/2.0"},
            {"rel": "http://nodeinfo.diaspora.software/ns/schema/2.1", "href": "/nodeinfo/2.1"}
        ]});
        assert_eq!(select_nodeinfo_link(&discovery), Some("/nodeinfo/2.1"));

        let unsupported = json!({"links": [{"rel": "https://example.com/custom", "href": "/x"}]});
        assert_eq!(select_nodeinfo_link(&unsupported), None);
    }

    #[test]
    fn test_build_discovery_document() {
        let endpoint = Url::parse("https://example.com/nodeinfo/2.1").unwrap();
        let doc = build_discovery_document(&endpoint);
        assert_eq!(doc["links"][0]["href"], "https://example.com/nodeinfo/2.1");
    }
}
