//! Loading JSON-LD documents over HTTP
//!
//! All remote reads in the federation go through a [DocumentLoader]. The
//! HTTP implementation guards every hop (the original URL, each redirect
//! target and each discovered alternate) against private addresses, and
//! discovers `application/activity+json` alternates through `Link`
//! response headers and HTML `<link>`/`<a>` tags.

use crate::error::Error;
use crate::fetch::{is_json_media_type, read_body_limited};
use async_trait::async_trait;
use http::StatusCode;
use reqwest::redirect::Policy;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Write;
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// A JSON-LD context hint in a `Link` response header.
const CONTEXT_REL: &str = "http://www.w3.org/ns/json-ld#context";

/// A remote document as returned by a [DocumentLoader].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteDocument {
    /// URL of the document after following redirects and alternates
    pub document_url: Url,
    /// JSON-LD context hinted by the response, if any
    pub context_url: Option<Url>,
    /// The parsed document body
    pub document: Value,
}

/// Loads documents by URL.
#[async_trait]
pub trait DocumentLoader: Send + Sync {
    /// Fetches the document at `url`.
    async fn load(&self, url: &Url) -> Result<RemoteDocument, Error>;
}

/// Derives the outgoing `User-Agent` header.
///
/// Renders as `<software> Fedify/<version> (+<url>)` with the optional
/// pieces dropped.
#[derive(Clone, Debug, Default)]
pub struct UserAgentPolicy {
    /// Name/version of the embedding application, e.g. `MyApp/1.0`
    pub software: Option<String>,
    /// Homepage appended as a `(+https://...)` comment
    pub url: Option<Url>,
}

impl UserAgentPolicy {
    /// The rendered header value.
    pub fn user_agent(&self) -> String {
        let mut agent = String::new();
        if let Some(software) = &self.software {
            agent.push_str(software);
            agent.push(' ');
        }
        let _ = write!(agent, "Fedify/{}", env!("CARGO_PKG_VERSION"));
        if let Some(url) = &self.url {
            let _ = write!(agent, " (+{url})");
        }
        agent
    }
}

/// HTTP(S) implementation of [DocumentLoader].
pub struct HttpDocumentLoader {
    client: reqwest::Client,
    allow_private_address: bool,
}

/// Original URL, redirect targets and alternates all count as hops.
const MAX_HOPS: usize = 10;

impl HttpDocumentLoader {
    /// Creates a loader.
    ///
    /// `allow_private_address` disables the private/loopback guard; only
    /// enable it for tests.
    pub fn new(
        user_agent: &UserAgentPolicy,
        allow_private_address: bool,
        request_timeout: Duration,
    ) -> Result<HttpDocumentLoader, Error> {
        // Redirects are followed manually so that every hop passes the
        // address guard.
        let client = reqwest::Client::builder()
            .redirect(Policy::none())
            .user_agent(user_agent.user_agent())
            .timeout(request_timeout)
            .build()
            .map_err(Error::other)?;
        Ok(HttpDocumentLoader {
            client,
            allow_private_address,
        })
    }

    async fn guard_url(&self, url: &Url) -> Result<(), Error> {
        match url.scheme() {
            "http" | "https" => {}
            _ => return Err(Error::Url("scheme must be http or https")),
        }
        if self.allow_private_address {
            return Ok(());
        }
        verify_public_address(url).await
    }
}

#[async_trait]
impl DocumentLoader for HttpDocumentLoader {
    async fn load(&self, url: &Url) -> Result<RemoteDocument, Error> {
        let mut url = url.clone();

        for _ in 0..MAX_HOPS {
            self.guard_url(&url).await?;
            debug!("Fetching remote document {url}");

            let response = self
                .client
                .get(url.as_str())
                .header(
                    "Accept",
                    "application/activity+json, application/ld+json",
                )
                .send()
                .await?;
            let status = response.status();

            if status.is_redirection() {
                let location = response
                    .headers()
                    .get("location")
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| Error::fetch(&url, status))?;
                url = url.join(location)?;
                continue;
            }
            if status == StatusCode::GONE {
                return Err(Error::ObjectDeleted);
            }
            if !status.is_success() {
                return Err(Error::fetch(&url, status));
            }

            let content_type = response
                .headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            let links = parse_link_header(response.headers());
            let context_url = links
                .iter()
                .find(|l| l.rel() == Some(CONTEXT_REL))
                .and_then(|l| url.join(&l.target).ok());

            if is_json_media_type(&content_type) {
                let body = read_body_limited(response).await?;
                let document = serde_json::from_slice(&body)
                    .map_err(|e| Error::Parse(format!("{url}: {e}")))?;
                return Ok(RemoteDocument {
                    document_url: url,
                    context_url,
                    document,
                });
            }

            // Not JSON: try alternate discovery. Header links first, then
            // the HTML body.
            if let Some(alternate) = header_alternate(&links, &url) {
                url = alternate;
                continue;
            }
            let essence = content_type.split(';').next().unwrap_or("").trim().to_string();
            if essence == "text/html" || essence == "application/xhtml+xml" {
                let body = read_body_limited(response).await?;
                let body = String::from_utf8_lossy(&body);
                if let Some(alternate) = html_alternate(&body, &url) {
                    url = alternate;
                    continue;
                }
            }
            return Err(Error::Parse(format!(
                "{url}: unsupported content type {content_type}"
            )));
        }

        Err(Error::Other(format!("Too many redirects fetching {url}")))
    }
}

/// A loader whose GET requests carry an HTTP signature.
///
/// Some servers only serve actor documents to authenticated peers
/// (authorized fetch); the shared-inbox path uses this loader with the
/// instance actor's key. Alternate discovery is not repeated here, the
/// signed fetch goes straight for the ActivityPub representation.
pub struct SignedDocumentLoader {
    client: reqwest_middleware::ClientWithMiddleware,
    key: crate::signatures::SigningKey,
    key_id: Url,
}

impl SignedDocumentLoader {
    /// Creates a loader signing as `key_id`.
    pub fn new(
        client: reqwest_middleware::ClientWithMiddleware,
        key: crate::signatures::SigningKey,
        key_id: Url,
    ) -> SignedDocumentLoader {
        SignedDocumentLoader {
            client,
            key,
            key_id,
        }
    }
}

#[async_trait]
impl DocumentLoader for SignedDocumentLoader {
    async fn load(&self, url: &Url) -> Result<RemoteDocument, Error> {
        let mut headers = http::HeaderMap::new();
        headers.insert(
            "accept",
            http::HeaderValue::from_static("application/activity+json, application/ld+json"),
        );
        crate::signatures::cavage::sign_request(
            &http::Method::GET,
            url,
            &mut headers,
            None,
            &self.key,
            &self.key_id,
        )?;

        let response = self
            .client
            .get(url.as_str())
            .headers(headers)
            .send()
            .await?;
        if response.status() == StatusCode::GONE {
            return Err(Error::ObjectDeleted);
        }
        if !response.status().is_success() {
            return Err(Error::fetch(url, response.status()));
        }
        let final_url = Url::parse(response.url().as_str())?;
        let body = crate::fetch::read_body_limited(response).await?;
        let document =
            serde_json::from_slice(&body).map_err(|e| Error::Parse(format!("{url}: {e}")))?;
        Ok(RemoteDocument {
            document_url: final_url,
            context_url: None,
            document,
        })
    }
}

/// Rejects loopback, private-range, link-local and otherwise non-public
/// addresses. Host names are resolved and every address checked.
pub(crate) async fn verify_public_address(url: &Url) -> Result<(), Error> {
    let host = url.host_str().ok_or(Error::Url("url has no host"))?;
    if host.eq_ignore_ascii_case("localhost") {
        return Err(Error::Url("private address is not allowed"));
    }
    if let Ok(ip) = host.trim_matches(['[', ']']).parse::<IpAddr>() {
        if is_private_ip(ip) {
            return Err(Error::Url("private address is not allowed"));
        }
        return Ok(());
    }
    let port = url.port_or_known_default().unwrap_or(443);
    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| Error::Other(format!("Failed to resolve {host}: {e}")))?;
    for addr in addrs {
        if is_private_ip(addr.ip()) {
            return Err(Error::Url("private address is not allowed"));
        }
    }
    Ok(())
}

fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                // Carrier-grade NAT, 100.64.0.0/10
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xc0) == 64)
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_private_ip(IpAddr::V4(mapped));
            }
            v6.is_loopback()
                || v6.is_unspecified()
                // Unique local, fc00::/7
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                // Link local, fe80::/10
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

#[derive(Debug, PartialEq)]
pub(crate) struct LinkValue {
    target: String,
    params: Vec<(String, String)>,
}

impl LinkValue {
    fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn rel(&self) -> Option<&str> {
        self.param("rel")
    }
}

/// Parses all `Link` response headers into their values.
pub(crate) fn parse_link_header(headers: &http::HeaderMap) -> Vec<LinkValue> {
    let mut links = Vec::new();
    for header in headers.get_all("link") {
        let Ok(header) = header.to_str() else {
            continue;
        };
        links.extend(parse_link_value(header));
    }
    links
}

fn parse_link_value(header: &str) -> Vec<LinkValue> {
    let mut links = Vec::new();
    let bytes = header.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        // Skip to the next `<target>`.
        let Some(start) = header[i..].find('<').map(|p| i + p) else {
            break;
        };
        let Some(end) = header[start..].find('>').map(|p| start + p) else {
            break;
        };
        let target = header[start + 1..end].to_string();
        i = end + 1;

        // Parameters up to the next top-level comma.
        let mut params = Vec::new();
        loop {
            while i < bytes.len() && (bytes[i] == b' ' || bytes[i] == b';') {
                i += 1;
            }
            if i >= bytes.len() || bytes[i] == b',' {
                i += 1;
                break;
            }
            let name_start = i;
            while i < bytes.len() && bytes[i] != b'=' && bytes[i] != b';' && bytes[i] != b',' {
                i += 1;
            }
            let name = header[name_start..i].trim().to_string();
            let mut value = String::new();
            if i < bytes.len() && bytes[i] == b'=' {
                i += 1;
                if i < bytes.len() && bytes[i] == b'"' {
                    i += 1;
                    let value_start = i;
                    while i < bytes.len() && bytes[i] != b'"' {
                        i += 1;
                    }
                    value = header[value_start..i].to_string();
                    i += 1;
                } else {
                    let value_start = i;
                    while i < bytes.len() && bytes[i] != b';' && bytes[i] != b',' {
                        i += 1;
                    }
                    value = header[value_start..i].trim().to_string();
                }
            }
            params.push((name, value));
        }
        links.push(LinkValue { target, params });
    }
    links
}

fn is_activity_type(media_type: &str) -> bool {
    let essence = media_type.split(';').next().unwrap_or("").trim();
    essence == "application/activity+json" || essence == "application/ld+json"
}

fn header_alternate(links: &[LinkValue], base: &Url) -> Option<Url> {
    links
        .iter()
        .find(|l| {
            l.rel().map(|r| r.split(' ').any(|r| r == "alternate")) == Some(true)
                && l.param("type").map(is_activity_type) == Some(true)
        })
        .and_then(|l| base.join(&l.target).ok())
}

/// Finds an activity-JSON alternate in an HTML document: `<link
/// rel="alternate">` first, then `<a>` tags carrying a matching `type`.
pub(crate) fn html_alternate(body: &str, base: &Url) -> Option<Url> {
    let document = Html::parse_document(body);
    let link_selector = Selector::parse("link[rel~=\"alternate\"][type][href]").ok()?;
    let anchor_selector = Selector::parse("a[type][href]").ok()?;

    let links = document.select(&link_selector);
    let anchors = document.select(&anchor_selector);
    for element in links.chain(anchors) {
        let media_type = element.value().attr("type").unwrap_or("");
        if !is_activity_type(media_type) {
            continue;
        }
        if let Some(href) = element.value().attr("href") {
            if let Ok(url) = base.join(href) {
                return Some(url);
            }
        }
    }
    None
}
