//! Resolving a URL or handle to a vocabulary object

use crate::error::Error;
use crate::fetch::loader::DocumentLoader;
use crate::fetch::webfinger::WebFingerLookup;
use crate::vocab::value::CrossOriginPolicy;
use crate::vocab::Entity;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

/// Options for [lookup_object].
pub struct LookupOptions<'a> {
    /// Loader used for the actor or object document
    pub loader: &'a dyn DocumentLoader,
    /// WebFinger client used when the target is a handle
    pub webfinger: &'a WebFingerLookup,
    /// Same-origin handling for the returned entity
    pub policy: CrossOriginPolicy,
    /// Cancels the lookup; a cancelled lookup returns `None`
    pub signal: Option<CancellationToken>,
}

/// Resolves `target` to a vocabulary object.
///
/// The target is either a URL (fetched directly) or a handle like
/// `@user@host` (resolved through WebFinger to the actor's `self` link
/// first). Follows the null-on-failure contract: any failure, including
/// cancellation, yields `None` with the reason logged.
pub async fn lookup_object(target: &str, options: &LookupOptions<'_>) -> Option<Entity> {
    let work = lookup_inner(target, options);
    let result = match &options.signal {
        Some(signal) => {
            tokio::select! {
                _ = signal.cancelled() => {
                    debug!("Lookup of {target} was cancelled");
                    return None;
                }
                result = work => result,
            }
        }
        None => work.await,
    };
    match result {
        Ok(entity) => entity,
        Err(error) => {
            debug!("Lookup of {target} failed: {error}");
            None
        }
    }
}

async fn lookup_inner(
    target: &str,
    options: &LookupOptions<'_>,
) -> Result<Option<Entity>, Error> {
    let candidates = match Url::parse(target) {
        Ok(url) if url.scheme() == "http" || url.scheme() == "https" => vec![url],
        _ => {
            let jrd = options.webfinger.lookup(target).await?;
            let links: Vec<Url> = jrd.self_links().into_iter().cloned().collect();
            if links.is_empty() {
                debug!("Webfinger descriptor for {target} has no self link");
            }
            links
        }
    };

    // Candidates are tried in document order; the first that
    // dereferences to an acceptable object wins.
    for url in candidates {
        match load_entity(&url, options).await {
            Ok(Some(entity)) => return Ok(Some(entity)),
            Ok(None) => {
                debug!(
                    "Dropping candidate {url} for {target}: document claims a \
                     different origin"
                );
            }
            Err(error) => {
                debug!("Failed to dereference {url} for {target}: {error}");
            }
        }
    }
    Ok(None)
}

async fn load_entity(
    url: &Url,
    options: &LookupOptions<'_>,
) -> Result<Option<Entity>, Error> {
    let document = options.loader.load(url).await?;
    let mut entity = Entity::from_json_ld(&document.document)?;
    entity.set_document_url(&document.document_url);

    // Same-origin check between the claimed id and the document that
    // made the claim.
    if let Some(id) = entity.id() {
        if id.origin() != document.document_url.origin() {
            match options.policy {
                CrossOriginPolicy::Trust => {}
                CrossOriginPolicy::Ignore | CrossOriginPolicy::Throw => {
                    return Ok(None);
                }
            }
        }
    }
    Ok(Some(entity))
}
