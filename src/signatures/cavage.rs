//! draft-cavage-http-signatures-12 signing and verification

use crate::error::Error;
use crate::signatures::{
    sha256_base64,
    FetchedKey,
    KeyResolver,
    SignatureAlgorithm,
    SigningKey,
    VerifyOptions,
};
use base64::engine::general_purpose::STANDARD as Base64;
use base64::Engine;
use chrono::{DateTime, Utc};
use http::header::{HeaderMap, HeaderValue};
use http::Method;
use httpdate::{fmt_http_date, parse_http_date};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::time::SystemTime;
use tracing::debug;
use url::Url;

/// Signs a request in place: ensures `Host` and `Date`, adds `Digest` for
/// bodies, and writes the `Signature` header.
pub fn sign_request(
    method: &Method,
    url: &Url,
    headers: &mut HeaderMap,
    body: Option<&[u8]>,
    key: &SigningKey,
    key_id: &Url,
) -> Result<(), Error> {
    if !headers.contains_key("host") {
        headers.insert(
            "host",
            HeaderValue::from_str(&host_of(url)).map_err(Error::other)?,
        );
    }
    if !headers.contains_key("date") {
        headers.insert(
            "date",
            HeaderValue::from_str(&fmt_http_date(SystemTime::now())).map_err(Error::other)?,
        );
    }
    if let Some(body) = body {
        let digest = format!("SHA-256={}", sha256_base64(body));
        headers.insert("digest", HeaderValue::from_str(&digest).map_err(Error::other)?);
    }

    let mut signed_headers = vec!["(request-target)", "host", "date"];
    if body.is_some() {
        signed_headers.push("digest");
    }
    if headers.contains_key("content-type") {
        signed_headers.push("content-type");
    }

    let signing_string = build_signing_string(method, url, headers, &signed_headers)?;
    let signature = key.sign(signing_string.as_bytes())?;

    let header = format!(
        "keyId=\"{key_id}\",algorithm=\"{alg}\",headers=\"{headers}\",signature=\"{sig}\"",
        alg = key.algorithm().cavage_name(),
        headers = signed_headers.join(" "),
        sig = Base64.encode(signature),
    );
    headers.insert("signature", HeaderValue::from_str(&header).map_err(Error::other)?);
    Ok(())
}

/// Verifies a request's `Signature` header.
///
/// Returns the matched key, or `None` for any failure: missing or
/// malformed headers, a timestamp outside the window, a body digest
/// mismatch, a disallowed algorithm or a bad signature. The reason is
/// logged at debug level.
pub async fn verify_request(
    method: &Method,
    url: &Url,
    headers: &HeaderMap,
    body: Option<&[u8]>,
    resolver: &dyn KeyResolver,
    options: &VerifyOptions,
) -> Option<FetchedKey> {
    match verify_inner(method, url, headers, body, resolver, options).await {
        Ok(key) => Some(key),
        Err(error) => {
            debug!("draft-cavage signature rejected: {error}");
            None
        }
    }
}

async fn verify_inner(
    method: &Method,
    url: &Url,
    headers: &HeaderMap,
    body: Option<&[u8]>,
    resolver: &dyn KeyResolver,
    options: &VerifyOptions,
) -> Result<FetchedKey, Error> {
    let header = headers
        .get("signature")
        .and_then(|v| v.to_str().ok())
        .ok_or(Error::Signature("missing Signature header"))?;
    let params = parse_signature_header(header);

    let key_id = params
        .get("keyId")
        .ok_or(Error::Signature("missing keyId parameter"))?;
    let key_id = Url::parse(key_id).map_err(|_| Error::Signature("keyId is not a URL"))?;
    let signed_headers: Vec<&str> = params
        .get("headers")
        .ok_or(Error::Signature("missing headers parameter"))?
        .split(' ')
        .collect();
    let signature = params
        .get("signature")
        .ok_or(Error::Signature("missing signature parameter"))?;
    let signature = Base64
        .decode(signature)
        .map_err(|_| Error::Signature("signature is not base64"))?;

    if let Some(algorithm) = params.get("algorithm") {
        if SignatureAlgorithm::from_any_name(algorithm).is_none() {
            return Err(Error::Signature("algorithm not allowed"));
        }
    }

    let date = headers
        .get("date")
        .and_then(|v| v.to_str().ok())
        .ok_or(Error::Signature("missing Date header"))?;
    if !signed_headers.contains(&"date") {
        return Err(Error::Signature("Date header is not covered by the signature"));
    }
    let date: DateTime<Utc> = parse_http_date(date)
        .map_err(|_| Error::Signature("malformed Date header"))?
        .into();
    if !options.time_window.tolerates(date, options.now()) {
        return Err(Error::Signature("signature timestamp outside the window"));
    }

    if let Some(body) = body {
        if !signed_headers.contains(&"digest") {
            return Err(Error::Signature("Digest header is not covered by the signature"));
        }
        verify_body_digest(headers.get("digest"), body)?;
    }

    let fetched = resolver
        .resolve(&key_id)
        .await?
        .ok_or(Error::Signature("key could not be resolved"))?;

    let signing_string = build_signing_string(method, url, headers, &signed_headers)?;
    if !fetched.key.verify(signing_string.as_bytes(), &signature) {
        return Err(Error::Signature("signature verification failed"));
    }
    Ok(fetched)
}

fn host_of(url: &Url) -> String {
    let mut host = url.host_str().unwrap_or_default().to_string();
    if let Some(port) = url.port() {
        let _ = write!(host, ":{port}");
    }
    host
}

fn request_target(method: &Method, url: &Url) -> String {
    let mut target = format!("{} {}", method.as_str().to_lowercase(), url.path());
    if let Some(query) = url.query() {
        let _ = write!(target, "?{query}");
    }
    target
}

/// The canonical base: one `name: value` line per covered header, with
/// the pseudo-header `(request-target)` rendered from method and path.
fn build_signing_string(
    method: &Method,
    url: &Url,
    headers: &HeaderMap,
    signed_headers: &[&str],
) -> Result<String, Error> {
    let mut lines = Vec::with_capacity(signed_headers.len());
    for name in signed_headers {
        if *name == "(request-target)" {
            lines.push(format!("(request-target): {}", request_target(method, url)));
            continue;
        }
        let value = headers
            .get(*name)
            .and_then(|v| v.to_str().ok())
            .ok_or(Error::Signature("covered header is missing"))?;
        lines.push(format!("{}: {}", name.to_lowercase(), value.trim()));
    }
    Ok(lines.join("\n"))
}

/// Parses `k="v"` pairs out of a `Signature` header.
fn parse_signature_header(header: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let bytes = header.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        while i < bytes.len() && (bytes[i] == b',' || bytes[i] == b' ') {
            i += 1;
        }
        let name_start = i;
        while i < bytes.len() && bytes[i] != b'=' {
            i += 1;
        }
        if i >= bytes.len() {
            break;
        }
        let name = header[name_start..i].trim().to_string();
        i += 1;
        let value = if i < bytes.len() && bytes[i] == b'"' {
            i += 1;
            let value_start = i;
            while i < bytes.len() && bytes[i] != b'"' {
                i += 1;
            }
            let value = header[value_start..i].to_string();
            i += 1;
            value
        } else {
            let value_start = i;
            while i < bytes.len() && bytes[i] != b',' {
                i += 1;
            }
            header[value_start..i].trim().to_string()
        };
        params.insert(name, value);
    }
    params
}

/// Checks the `Digest` header against the actual body. Only SHA-256
/// digests are understood; a header carrying none fails.
pub(crate) fn verify_body_digest(
    digest_header: Option<&HeaderValue>,
    body: &[u8],
) -> Result<(), Error> {
    let header = digest_header
        .and_then(|v| v.to_str().ok())
        .ok_or(Error::DigestMismatch)?;

    let mut found = false;
    for part in header.split(',') {
        let Some((algorithm, digest)) = part.trim().split_once('=') else {
            continue;
        };
        if !algorithm.eq_ignore_ascii_case("sha-256") {
            continue;
        }
        found = true;
        if digest != sha256_base64(body) {
            return Err(Error::DigestMismatch);
        }
    }
    if !found {
        return Err(Error::DigestMismatch);
    }
    Ok(())
}
