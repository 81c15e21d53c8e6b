//! Double-knocking: negotiating the signature suite per remote origin
//!
//! A first contact is signed under the configured first-knock suite.
//! When the remote rejects it outright (400, 401 or 403), the request is
//! retried once under the other suite, and the suite that succeeds is
//! remembered for the origin through a [SpecDeterminer].

use crate::error::Error;
use crate::signatures::{cavage, rfc9421, SignatureSpec, SigningKey, SpecDeterminer};
use bytes::Bytes;
use http::header::HeaderMap;
use http::{Method, StatusCode};
use reqwest_middleware::ClientWithMiddleware;
use tracing::debug;
use url::Url;

/// An outgoing request about to be signed.
#[derive(Clone, Debug)]
pub struct SignedRequest {
    /// HTTP method
    pub method: Method,
    /// Absolute target URL
    pub url: Url,
    /// Headers to send; signing adds its own on top
    pub headers: HeaderMap,
    /// Body, when the request carries one
    pub body: Option<Bytes>,
}

/// Signs `request` under the given suite, without sending it.
pub fn sign(
    request: &mut SignedRequest,
    spec: SignatureSpec,
    key: &SigningKey,
    key_id: &Url,
) -> Result<(), Error> {
    let body = request.body.as_deref();
    match spec {
        SignatureSpec::Cavage => cavage::sign_request(
            &request.method,
            &request.url,
            &mut request.headers,
            body,
            key,
            key_id,
        ),
        SignatureSpec::Rfc9421 => rfc9421::sign_request(
            &request.method,
            &request.url,
            &mut request.headers,
            body,
            key,
            key_id,
        ),
    }
}

/// Whether a response status triggers the second knock.
fn rejects_signature(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
    )
}

/// Signs and sends `request`, double-knocking against unknown origins.
///
/// A suite already remembered for the origin is used without fallback; a
/// failure under it follows the caller's retry policy instead of
/// renegotiating.
pub async fn send_signed(
    client: &ClientWithMiddleware,
    request: &SignedRequest,
    key: &SigningKey,
    key_id: &Url,
    first_knock: SignatureSpec,
    determiner: &dyn SpecDeterminer,
) -> Result<reqwest::Response, Error> {
    let origin = request.url.origin().ascii_serialization();
    let remembered = determiner.determine(&origin).await;
    let spec = remembered.unwrap_or(first_knock);

    let response = send_once(client, request, spec, key, key_id).await?;
    if remembered.is_some() {
        return Ok(response);
    }

    if rejects_signature(response.status()) {
        let second = spec.other();
        debug!(
            "{origin} rejected {spec:?} with {status}, knocking again with {second:?}",
            status = response.status(),
        );
        let response = send_once(client, request, second, key, key_id).await?;
        if response.status().is_success() {
            determiner.remember(&origin, second).await;
        }
        return Ok(response);
    }

    if response.status().is_success() {
        determiner.remember(&origin, spec).await;
    }
    Ok(response)
}

async fn send_once(
    client: &ClientWithMiddleware,
    request: &SignedRequest,
    spec: SignatureSpec,
    key: &SigningKey,
    key_id: &Url,
) -> Result<reqwest::Response, Error> {
    let mut signed = request.clone();
    sign(&mut signed, spec, key, key_id)?;

    let mut builder = client
        .request(signed.method, signed.url.as_str())
        .headers(signed.headers);
    if let Some(body) = signed.body {
        builder = builder.body(body);
    }
    Ok(builder.send().await?)
}
