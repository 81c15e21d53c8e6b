//! RFC 9421 HTTP Message Signatures

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
use std::collections::HashMap;
use std::fmt::Write as _;
use tracing::debug;
use url::Url;

/// The label used for outgoing signatures.
const LABEL: &str = "sig1";

/// Signs a request in place: adds `Content-Digest` for bodies and writes
/// the `Signature-Input` and `Signature` headers.
pub fn sign_request(
    method: &Method,
    url: &Url,
    headers: &mut HeaderMap,
    body: Option<&[u8]>,
    key: &SigningKey,
    key_id: &Url,
) -> Result<(), Error> {
    sign_request_at(method, url, headers, body, key, key_id, Utc::now())
}

/// Signs with an explicit creation instant; [sign_request] uses the wall
/// clock.
pub fn sign_request_at(
    method: &Method,
    url: &Url,
    headers: &mut HeaderMap,
    body: Option<&[u8]>,
    key: &SigningKey,
    key_id: &Url,
    created: DateTime<Utc>,
) -> Result<(), Error> {
    if let Some(body) = body {
        let digest = format!("sha-256=:{}:", sha256_base64(body));
        headers.insert(
            "content-digest",
            HeaderValue::from_str(&digest).map_err(Error::other)?,
        );
    }

    let mut components = vec!["@method", "@target-uri", "@authority"];
    if body.is_some() {
        components.push("content-digest");
    }
    if headers.contains_key("content-type") {
        components.push("content-type");
    }

    let quoted: Vec<String> = components.iter().map(|c| format!("\"{c}\"")).collect();
    let params = format!(
        "({components});alg=\"{alg}\";keyid=\"{key_id}\";created={created}",
        components = quoted.join(" "),
        alg = key.algorithm().rfc9421_name(),
        created = created.timestamp(),
    );

    let base = build_base(method, url, headers, &components, &params)?;
    let signature = key.sign(base.as_bytes())?;

    headers.insert(
        "signature-input",
        HeaderValue::from_str(&format!("{LABEL}={params}")).map_err(Error::other)?,
    );
    headers.insert(
        "signature",
        HeaderValue::from_str(&format!("{LABEL}=:{}:", Base64.encode(signature)))
            .map_err(Error::other)?,
    );
    Ok(())
}

/// Verifies a request's RFC 9421 signature.
///
/// Returns the matched key, or `None` for any failure, with the reason
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
            debug!("RFC 9421 signature rejected: {error}");
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
    let input = headers
        .get("signature-input")
        .and_then(|v| v.to_str().ok())
        .ok_or(Error::Signature("missing Signature-Input header"))?;
    let (label, raw_params, components, params) =
        parse_signature_input(input).ok_or(Error::Signature("malformed Signature-Input"))?;

    let signature_header = headers
        .get("signature")
        .and_then(|v| v.to_str().ok())
        .ok_or(Error::Signature("missing Signature header"))?;
    let signature = extract_signature(signature_header, &label)
        .ok_or(Error::Signature("missing signature for label"))?;
    let signature = Base64
        .decode(signature)
        .map_err(|_| Error::Signature("signature is not base64"))?;

    let key_id = params
        .get("keyid")
        .ok_or(Error::Signature("missing keyid parameter"))?;
    let key_id = Url::parse(key_id).map_err(|_| Error::Signature("keyid is not a URL"))?;

    let created = params
        .get("created")
        .ok_or(Error::Signature("missing created parameter"))?
        .parse::<i64>()
        .map_err(|_| Error::Signature("malformed created parameter"))?;
    let created = DateTime::from_timestamp(created, 0)
        .ok_or(Error::Signature("created timestamp out of range"))?;
    if !options.time_window.tolerates(created, options.now()) {
        return Err(Error::Signature("signature timestamp outside the window"));
    }

    let algorithm = match params.get("alg") {
        Some(alg) => Some(
            SignatureAlgorithm::from_any_name(alg)
                .filter(|a| *a != SignatureAlgorithm::RsaSha256 || alg == "rsa-v1_5-sha256")
                .ok_or(Error::Signature("algorithm not allowed"))?,
        ),
        None => None,
    };

    if let Some(body) = body {
        if !components.iter().any(|c| c == "content-digest") {
            return Err(Error::Signature("content-digest is not covered by the signature"));
        }
        verify_content_digest(headers.get("content-digest"), body)?;
    }

    let fetched = resolver
        .resolve(&key_id)
        .await?
        .ok_or(Error::Signature("key could not be resolved"))?;
    if let Some(algorithm) = algorithm {
        if fetched.key.algorithm() != algorithm {
            return Err(Error::Signature("algorithm does not match the key"));
        }
    }

    let base = build_base(method, url, headers, &components, &raw_params)?;
    if !fetched.key.verify(base.as_bytes(), &signature) {
        return Err(Error::Signature("signature verification failed"));
    }
    Ok(fetched)
}

fn authority_of(url: &Url) -> String {
    let mut authority = url.host_str().unwrap_or_default().to_string();
    if let Some(port) = url.port() {
        let _ = write!(authority, ":{port}");
    }
    authority
}

/// The canonical base: each component rendered as `"<name>": <value>`,
/// closed by the `"@signature-params"` line.
fn build_base<S: AsRef<str>>(
    method: &Method,
    url: &Url,
    headers: &HeaderMap,
    components: &[S],
    params: &str,
) -> Result<String, Error> {
    let mut lines = Vec::with_capacity(components.len() + 1);
    for component in components {
        let name = component.as_ref();
        let value = match name {
            "@method" => method.as_str().to_uppercase(),
            "@target-uri" => url.as_str().to_string(),
            "@authority" => authority_of(url),
            "@path" => url.path().to_string(),
            "@query" => format!("?{}", url.query().unwrap_or("")),
            name if name.starts_with('@') => {
                return Err(Error::Signature("unsupported derived component"));
            }
            name => headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().to_string())
                .ok_or(Error::Signature("covered header is missing"))?,
        };
        lines.push(format!("\"{name}\": {value}"));
    }
    lines.push(format!("\"@signature-params\": {params}"));
    Ok(lines.join("\n"))
}

/// Splits `label=("c1" "c2");p1=v1;p2="v2"` into label, the raw parameter
/// text (signed verbatim), component names and parameters.
#[allow(clippy::type_complexity)]
fn parse_signature_input(
    header: &str,
) -> Option<(String, String, Vec<String>, HashMap<String, String>)> {
    let (label, rest) = header.split_once('=')?;
    let label = label.trim().to_string();
    let raw_params = rest.trim().to_string();

    let inner = rest.trim().strip_prefix('(')?;
    let (component_list, param_text) = inner.split_once(')')?;

    let mut components = Vec::new();
    for quoted in component_list.split_whitespace() {
        components.push(quoted.trim_matches('"').to_string());
    }

    let mut params = HashMap::new();
    for param in param_text.split(';') {
        let param = param.trim();
        if param.is_empty() {
            continue;
        }
        let (name, value) = param.split_once('=')?;
        params.insert(
            name.trim().to_string(),
            value.trim().trim_matches('"').to_string(),
        );
    }
    Some((label, raw_params, components, params))
}

/// Pulls the byte-sequence value for `label` out of a `Signature` header.
fn extract_signature(header: &str, label: &str) -> Option<String> {
    for entry in header.split(',') {
        let (name, value) = entry.trim().split_once('=')?;
        if name.trim() == label {
            return Some(value.trim().trim_matches(':').to_string());
        }
    }
    None
}

/// Checks `Content-Digest: sha-256=:<b64>:` against the actual body.
pub(crate) fn verify_content_digest(
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
        if !algorithm.trim().eq_ignore_ascii_case("sha-256") {
            continue;
        }
        found = true;
        if digest.trim().trim_matches(':') != sha256_base64(body) {
            return Err(Error::DigestMismatch);
        }
    }
    if !found {
        return Err(Error::DigestMismatch);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signatures::tests::{SingleKeyResolver, ED25519_KEYPAIR, RSA_KEYPAIR};
    use crate::signatures::{Keypair, TimeWindow};
    use chrono::Duration;

    fn inbox_url() -> Url {
        Url::parse("https://remote.domain/users/bob/inbox").unwrap()
    }

    fn key_id() -> Url {
        Url::parse("https://remote.domain/users/bob#main-key").unwrap()
    }

    fn resolver(keypair: &Keypair) -> SingleKeyResolver {
        SingleKeyResolver {
            key_id: key_id(),
            owner: Url::parse("https://remote.domain/users/bob").unwrap(),
            pem: keypair.public_key.clone(),
        }
    }

    fn signed_request(keypair: &Keypair, body: &[u8], created: DateTime<Utc>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/activity+json"));
        let key = SigningKey::from_pem(&keypair.private_key).unwrap();
        sign_request_at(
            &Method::POST,
            &inbox_url(),
            &mut headers,
            Some(body),
            &key,
            &key_id(),
            created,
        )
        .unwrap();
        headers
    }

    #[tokio::test]
    async fn test_sign_and_verify() {
        let body = br#"{"type":"Create"}"#;
        let created = DateTime::from_timestamp(1_703_066_400, 0).unwrap();
        let headers = signed_request(&RSA_KEYPAIR, body, created);

        let input = headers.get("signature-input").unwrap().to_str().unwrap();
        assert!(input.starts_with("sig1=(\"@method\" \"@target-uri\" \"@authority\""));
        assert!(input.contains("alg=\"rsa-v1_5-sha256\""));
        assert!(input.contains("created=1703066400"));
        let digest = headers.get("content-digest").unwrap().to_str().unwrap();
        assert!(digest.starts_with("sha-256=:") && digest.ends_with(':'));

        // Verified at the creation instant, per the signature's clock.
        let options = VerifyOptions {
            current_time: Some(created),
            time_window: TimeWindow::Default,
        };
        let key = verify_request(
            &Method::POST,
            &inbox_url(),
            &headers,
            Some(body),
            &resolver(&RSA_KEYPAIR),
            &options,
        )
        .await
        .unwrap();
        assert_eq!(key.key_id, key_id());
    }

    #[tokio::test]
    async fn test_sign_and_verify_ed25519() {
        let body = br#"{"type":"Undo"}"#;
        let headers = signed_request(&ED25519_KEYPAIR, body, Utc::now());

        let key = verify_request(
            &Method::POST,
            &inbox_url(),
            &headers,
            Some(body),
            &resolver(&ED25519_KEYPAIR),
            &VerifyOptions::default(),
        )
        .await;
        assert!(key.is_some());
    }

    #[tokio::test]
    async fn test_content_digest_mismatch_returns_none() {
        let headers = signed_request(&RSA_KEYPAIR, b"original", Utc::now());

        let key = verify_request(
            &Method::POST,
            &inbox_url(),
            &headers,
            Some(b"tampered"),
            &resolver(&RSA_KEYPAIR),
            &VerifyOptions::default(),
        )
        .await;
        assert!(key.is_none());
    }

    #[tokio::test]
    async fn test_window_violation_returns_none() {
        let created = DateTime::from_timestamp(1_703_066_400, 0).unwrap();
        let body = b"{}";
        let headers = signed_request(&RSA_KEYPAIR, body, created);

        let options = VerifyOptions {
            current_time: Some(created + Duration::hours(2)),
            time_window: TimeWindow::Default,
        };
        let key = verify_request(
            &Method::POST,
            &inbox_url(),
            &headers,
            Some(body),
            &resolver(&RSA_KEYPAIR),
            &options,
        )
        .await;
        assert!(key.is_none());
    }

    #[tokio::test]
    async fn test_algorithm_key_mismatch_returns_none() {
        let body = b"{}";
        let headers = signed_request(&RSA_KEYPAIR, body, Utc::now());

        // The resolver hands back an Ed25519 key for a signature whose
        // alg parameter says RSA.
        let key = verify_request(
            &Method::POST,
            &inbox_url(),
            &headers,
            Some(body),
            &resolver(&ED25519_KEYPAIR),
            &VerifyOptions::default(),
        )
        .await;
        assert!(key.is_none());
    }

    #[test]
    fn test_parse_signature_input() {
        let (label, raw, components, params) = parse_signature_input(
            "sig1=(\"@method\" \"@target-uri\");created=1703066400;\
             keyid=\"https://remote.domain/users/bob#main-key\"",
        )
        .unwrap();
        assert_eq!(label, "sig1");
        assert!(raw.starts_with("(\"@method\""));
        assert_eq!(components, vec!["@method", "@target-uri"]);
        assert_eq!(params.get("created").unwrap(), "1703066400");
        assert_eq!(
            params.get("keyid").unwrap(),
            "https://remote.domain/users/bob#main-key"
        );
        assert!(params.get("alg").is_none());
    }

    #[test]
    fn test_extract_signature() {
        assert_eq!(
            extract_signature("sig1=:YWJj:", "sig1").unwrap(),
            "YWJj"
        );
        assert!(extract_signature("other=:YWJj:", "sig1").is_none());
    }

    #[test]
    fn test_base_includes_signature_params_line() {
        let url = Url::parse("https://example.com/inbox").unwrap();
        let base = build_base(
            &Method::POST,
            &url,
            &HeaderMap::new(),
            &["@method", "@target-uri"],
            "(\"@method\" \"@target-uri\");created=1",
        )
        .unwrap();
        assert_eq!(
            base,
            "\"@method\": POST\n\
             \"@target-uri\": https://example.com/inbox\n\
             \"@signature-params\": (\"@method\" \"@target-uri\");created=1"
        );
    }
}
