//! WebFinger: resolving `acct:` resources and handles to actor URLs

use crate::error::Error;
use crate::fetch::loader::verify_public_address;
use crate::fetch::read_body_limited;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest_middleware::ClientWithMiddleware;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;
use url::Url;

/// The content-type of WebFinger responses.
pub static JRD_CONTENT_TYPE: &str = "application/jrd+json";

/// A JSON Resource Descriptor.
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct Jrd {
    /// The resource this descriptor describes, e.g. `acct:alice@example.com`
    pub subject: String,
    /// Links where further data about the subject lives
    #[serde(default)]
    pub links: Vec<JrdLink>,
    /// Other URIs identifying the same resource
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<Url>,
    /// Additional data about the subject
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub properties: HashMap<Url, String>,
}

/// A single link of a [Jrd].
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct JrdLink {
    /// Relationship, e.g. `self`
    pub rel: Option<String>,
    /// Media type of the target
    #[serde(rename = "type")]
    pub kind: Option<String>,
    /// Target URL
    pub href: Option<Url>,
    /// URI template for interactive flows, e.g. remote follow
    pub template: Option<String>,
    /// Additional data about the link
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub properties: HashMap<Url, String>,
}

impl Jrd {
    /// The `rel="self"` links carrying an ActivityPub media type, in
    /// document order. Each points at a candidate actor document;
    /// callers try them in turn until one dereferences.
    pub fn self_links(&self) -> Vec<&Url> {
        self.links
            .iter()
            .filter(|link| link.rel.as_deref() == Some("self"))
            .filter(|link| {
                link.kind
                    .as_deref()
                    .map(is_activity_media_type)
                    .unwrap_or(false)
            })
            .filter_map(|link| link.href.as_ref())
            .collect()
    }
}

fn is_activity_media_type(kind: &str) -> bool {
    let essence = kind.split(';').next().unwrap_or("").trim();
    essence == "application/activity+json" || essence == "application/ld+json"
}

/// A parsed WebFinger resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resource {
    /// The resource string sent to the server, e.g. `acct:alice@example.com`
    pub resource: String,
    /// Host queried for the descriptor
    pub host: String,
}

/// Normalises the accepted resource spellings:
/// `acct:user@host`, `@user@host`, `user@host` and `https://host/...`.
pub fn parse_resource(raw: &str) -> Result<Resource, Error> {
    if raw.starts_with("https://") || raw.starts_with("http://") {
        let url = Url::parse(raw)?;
        let host = url
            .host_str()
            .ok_or(Error::Url("url has no host"))?
            .to_string();
        return Ok(Resource {
            resource: raw.to_string(),
            host,
        });
    }

    let handle = raw.strip_prefix("acct:").unwrap_or(raw);
    let handle = handle.strip_prefix('@').unwrap_or(handle);
    let (_, host) = handle
        .rsplit_once('@')
        .ok_or(Error::Url("handle must look like user@host"))?;
    if host.is_empty() {
        return Err(Error::Url("handle must look like user@host"));
    }
    Ok(Resource {
        resource: format!("acct:{handle}"),
        host: host.to_string(),
    })
}

/// WebFinger client.
pub struct WebFingerLookup {
    client: ClientWithMiddleware,
    allow_private_address: bool,
}

impl WebFingerLookup {
    /// Creates a client.
    pub fn new(client: ClientWithMiddleware, allow_private_address: bool) -> WebFingerLookup {
        WebFingerLookup {
            client,
            allow_private_address,
        }
    }

    /// Resolves a resource to its descriptor.
    ///
    /// The subject of the returned descriptor is checked against the
    /// queried resource modulo scheme; a mismatched document fails with a
    /// parse error.
    pub async fn lookup(&self, raw: &str) -> Result<Jrd, Error> {
        let resource = parse_resource(raw)?;
        // In debug setups the host may carry a port; the scheme follows
        // the private-address allowance the same way the loader does.
        let scheme = if self.allow_private_address { "http" } else { "https" };
        let mut fetch_url = Url::parse(&format!("{scheme}://{}/.well-known/webfinger", resource.host))?;
        fetch_url
            .query_pairs_mut()
            .append_pair("resource", &resource.resource);

        if !self.allow_private_address {
            verify_public_address(&fetch_url).await?;
        }
        debug!("Fetching webfinger {fetch_url}");

        let response = self
            .client
            .get(fetch_url.as_str())
            .header("Accept", JRD_CONTENT_TYPE)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::fetch(&fetch_url, response.status()));
        }
        let body = read_body_limited(response).await?;
        let jrd: Jrd =
            serde_json::from_slice(&body).map_err(|e| Error::Parse(format!("webfinger: {e}")))?;

        if !subject_matches(&jrd.subject, &resource.resource) {
            return Err(Error::Parse(format!(
                "webfinger subject {} does not describe {}",
                jrd.subject, resource.resource
            )));
        }
        Ok(jrd)
    }
}

/// Subjects match modulo scheme: `acct:user@host` equals `user@host`.
fn subject_matches(subject: &str, resource: &str) -> bool {
    let strip = |s: &str| {
        s.split_once(':')
            .map(|(_, rest)| rest.trim_start_matches("//"))
            .unwrap_or(s)
            .to_string()
    };
    strip(subject) == strip(resource)
}

/// Extracts the user name from a webfinger `resource` query parameter,
/// checking that the domain is ours. For `acct:alice@example.com` on the
/// domain `example.com` this returns `alice`.
pub fn extract_handle<'q>(query: &'q str, domain: &str) -> Result<&'q str, Error> {
    static HANDLE_REGEX: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^acct:([\p{L}0-9_\.\-]+)@(.*)$").expect("handle regex"));

    let captures = HANDLE_REGEX
        .captures(query)
        .ok_or_else(|| Error::Parse("malformed webfinger resource".to_string()))?;
    let name = captures
        .get(1)
        .ok_or_else(|| Error::Parse("malformed webfinger resource".to_string()))?;
    if captures.get(2).map(|m| m.as_str()) != Some(domain) {
        return Err(Error::NotFound);
    }
    Ok(name.as_str())
}

/// Builds the descriptor a server responds with for one of its actors.
///
/// `actor_url` is assumed to serve both HTML and ActivityPub
/// representations, which is the common single-URL setup.
pub fn build_jrd(subject: String, actor_url: Url) -> Jrd {
    build_jrd_with_types(subject, vec![(actor_url, None)])
}

/// Builds a descriptor listing several actors sharing one subject, each
/// with an optional actor type such as `Person` or `Group`.
pub fn build_jrd_with_types(subject: String, actors: Vec<(Url, Option<&str>)>) -> Jrd {
    let mut links = Vec::with_capacity(actors.len() * 2);
    for (url, kind) in actors {
        let properties: HashMap<Url, String> = kind
            .and_then(|kind| {
                Url::parse("https://www.w3.org/ns/activitystreams#type")
                    .ok()
                    .map(|k| HashMap::from([(k, kind.to_string())]))
            })
            .unwrap_or_default();
        links.push(JrdLink {
            rel: Some("http://webfinger.net/rel/profile-page".to_string()),
            kind: Some("text/html".to_string()),
            href: Some(url.clone()),
            ..Default::default()
        });
        links.push(JrdLink {
            rel: Some("self".to_string()),
            kind: Some(crate::FEDERATION_CONTENT_TYPE.to_string()),
            href: Some(url),
            properties,
            ..Default::default()
        });
    }
    Jrd {
        subject,
        links,
        aliases: Vec::new(),
        properties: Default::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_resource() {
        let expected = Resource {
            resource: "acct:alice@example.com".to_string(),
            host: "example.com".to_string(),
        };
        assert_eq!(parse_resource("acct:alice@example.com").unwrap(), expected);
        assert_eq!(parse_resource("@alice@example.com").unwrap(), expected);
        assert_eq!(parse_resource("alice@example.com").unwrap(), expected);

        let url = parse_resource("https://example.com/users/alice").unwrap();
        assert_eq!(url.resource, "https://example.com/users/alice");
        assert_eq!(url.host, "example.com");

        assert!(parse_resource("alice").is_err());
        assert!(parse_resource("@alice@").is_err());
    }

    #[test]
    fn test_subject_matches_modulo_scheme() {
        assert!(subject_matches("acct:alice@example.com", "acct:alice@example.com"));
        assert!(subject_matches("alice@example.com", "acct:alice@example.com"));
        assert!(!subject_matches("acct:bob@example.com", "acct:alice@example.com"));
    }

    #[test]
    fn test_self_links() {
        let jrd: Jrd = serde_json::from_value(json!({
            "subject": "acct:johndoe@example.com",
            "links": [
                {"rel": "http://webfinger.net/rel/profile-page", "type": "text/html",
                 "href": "https://example.com/@johndoe"},
                {"rel": "self", "type": "application/activity+json",
                 "href": "https://example.com/person"}
            ]
        }))
        .unwrap();
        let links = jrd.self_links();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].as_str(), "https://example.com/person");
    }

    #[test]
    fn test_self_links_keep_document_order() {
        let jrd: Jrd = serde_json::from_value(json!({
            "subject": "acct:johndoe@example.com",
            "links": [
                {"rel": "self", "type": "application/activity+json",
                 "href": "https://example.com/person"},
                {"rel": "self", "type": "application/ld+json",
                 "href": "https://example.com/person.jsonld"}
            ]
        }))
        .unwrap();
        let links: Vec<&str> = jrd.self_links().iter().map(|u| u.as_str()).collect();
        assert_eq!(
            links,
            vec!["https://example.com/person", "https://example.com/person.jsonld"]
        );
    }

    #[test]
    fn test_self_links_require_activity_type() {
        let jrd: Jrd = serde_json::from_value(json!({
            "subject": "acct:a@b.com",
            "links": [{"rel": "self", "type": "text/html", "href": "https://b.com/a"}]
        }))
        .unwrap();
        assert!(jrd.self_links().is_empty());
    }

    #[test]
    fn test_extract_handle() {
        assert_eq!(extract_handle("acct:alice@example.com", "example.com").unwrap(), "alice");
        assert_eq!(extract_handle("acct:Владимир@example.com", "example.com").unwrap(), "Владимир");
        assert_eq!(extract_handle("acct:da-sh@example.com", "example.com").unwrap(), "da-sh");
        assert!(extract_handle("acct:alice@other.com", "example.com").is_err());
        assert!(extract_handle("alice@example.com", "example.com").is_err());
    }

    #[test]
    fn test_build_jrd() {
        let jrd = build_jrd_with_types(
            "acct:alice@example.com".to_string(),
            vec![(Url::parse("https://example.com/users/alice").unwrap(), Some("Person"))],
        );
        assert_eq!(jrd.links.len(), 2);
        assert_eq!(
            jrd.self_links()[0].as_str(),
            "https://example.com/users/alice"
        );
        let self_link = jrd.links.iter().find(|l| l.rel.as_deref() == Some("self")).unwrap();
        assert_eq!(self_link.properties.values().next().unwrap(), "Person");
    }
}
