//! Fetching remote documents, actors and collections

use crate::error::Error;
use bytes::Bytes;
use futures::StreamExt;

pub mod collection;
pub mod loader;
pub mod lookup;
pub mod nodeinfo;
pub mod webfinger;

/// Maximum size of remote response bodies.
pub(crate) const RESPONSE_BODY_LIMIT: usize = 1024 * 1024;

/// Reads a response body, failing once it exceeds [RESPONSE_BODY_LIMIT].
pub(crate) async fn read_body_limited(response: reqwest::Response) -> Result<Bytes, Error> {
    let mut stream = response.bytes_stream();
    let mut body = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if body.len() + chunk.len() > RESPONSE_BODY_LIMIT {
            return Err(Error::ResponseBodyLimit);
        }
        body.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(body))
}

/// True for `application/activity+json`, `application/ld+json` and any
/// other `+json` vendored variant.
pub(crate) fn is_json_media_type(content_type: &str) -> bool {
    let essence = content_type.split(';').next().unwrap_or("").trim();
    essence == "application/json" || essence.ends_with("+json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_json_media_type() {
        assert!(is_json_media_type("application/activity+json"));
        assert!(is_json_media_type("application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\""));
        assert!(is_json_media_type("application/jrd+json"));
        assert!(is_json_media_type("application/json"));
        assert!(!is_json_media_type("text/html; charset=utf-8"));
        assert!(!is_json_media_type("application/xml"));
    }
}
