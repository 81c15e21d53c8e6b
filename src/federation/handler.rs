//! The inbound request pipeline: routing, negotiation, dispatch, render

use crate::context::{Context, RequestContext};
use crate::error::Error;
use crate::federation::router::RouteName;
use crate::federation::Federation;
use crate::fetch::nodeinfo::build_discovery_document;
use crate::fetch::webfinger::{build_jrd_with_types, extract_handle};
use crate::inbox::{receive_activity, InboxKind};
use crate::template::VarMap;
use crate::vocab::actor::PublicKey;
use crate::vocab::collection::{Collection, CollectionKind};
use crate::vocab::value::Refs;
use crate::vocab::{Actor, JsonLdMode};
use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use serde_json::Value;
use tracing::debug;
use url::Url;

pub(crate) async fn handle<T: Clone + Send + Sync + 'static>(
    federation: &Federation<T>,
    request: Request<Bytes>,
) -> Option<Response<Bytes>> {
    let (parts, body) = request.into_parts();

    let base_url = match base_url(federation, &parts) {
        Ok(base) => base,
        Err(_) => return Some(status_response(StatusCode::BAD_REQUEST)),
    };
    let path = parts.uri.path().to_string();
    let (name, vars) = {
        let router = &federation.inner.registrations.router;
        let (name, vars) = router.route(&path)?;
        (name.clone(), vars)
    };

    let request_url = match base_url.join(
        parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or(&path),
    ) {
        Ok(url) => url,
        Err(_) => return Some(status_response(StatusCode::BAD_REQUEST)),
    };
    let context = federation.create_context(&base_url);
    let ctx = RequestContext::new(
        context,
        parts.method.clone(),
        request_url,
        parts.headers,
        body,
    );

    let head = parts.method == Method::HEAD;
    let result = dispatch(federation, &ctx, &name, &vars).await;
    let mut response = match result {
        Ok(Some(response)) => response,
        Ok(None) => return None,
        // NotFound and missing routes delegate to the caller's framework.
        Err(Error::NotFound) | Err(Error::Routing(_)) => return None,
        Err(error) => {
            debug!("Request pipeline error: {error}");
            status_response(error.status().unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
        }
    };
    if head {
        *response.body_mut() = Bytes::new();
    }
    Some(response)
}

fn base_url<T: Clone>(
    federation: &Federation<T>,
    parts: &http::request::Parts,
) -> Result<Url, Error> {
    if let Some(origin) = &federation.inner.config.canonical_origin {
        return Ok(origin.clone());
    }
    let host = parts
        .headers
        .get("host")
        .and_then(|v| v.to_str().ok())
        .or_else(|| parts.uri.authority().map(|a| a.as_str()))
        .ok_or(Error::Url("request has no Host"))?;
    Ok(Url::parse(&format!(
        "{}://{host}",
        federation.inner.config.scheme()
    ))?)
}

async fn dispatch<T: Clone + Send + Sync + 'static>(
    federation: &Federation<T>,
    ctx: &RequestContext<T>,
    name: &RouteName,
    vars: &VarMap,
) -> Result<Option<Response<Bytes>>, Error> {
    let registrations = &federation.inner.registrations;

    // Inbox routes take POST; everything else takes GET/HEAD.
    match name {
        RouteName::Inbox | RouteName::SharedInbox => {
            if ctx.method != Method::POST {
                return Ok(Some(status_response(StatusCode::METHOD_NOT_ALLOWED)));
            }
            let kind = match name {
                RouteName::Inbox => InboxKind::Personal(var_string(vars, "identifier")?),
                _ => InboxKind::Shared,
            };
            let status = receive_activity(ctx, &kind).await?;
            return Ok(Some(status_response(status)));
        }
        _ => {
            if ctx.method != Method::GET && ctx.method != Method::HEAD {
                return Ok(Some(status_response(StatusCode::METHOD_NOT_ALLOWED)));
            }
        }
    }

    match name {
        RouteName::WebFinger => {
            let jrd = webfinger_document(ctx).await?;
            Ok(Some(json_response(
                StatusCode::OK,
                "application/jrd+json",
                &jrd,
            )?))
        }
        RouteName::NodeInfoWellKnown => {
            let endpoint = ctx.context().nodeinfo_uri()?;
            let discovery = build_discovery_document(&endpoint);
            Ok(Some(json_response(
                StatusCode::OK,
                "application/json",
                &discovery,
            )?))
        }
        RouteName::NodeInfo => {
            let dispatcher = registrations.nodeinfo.as_ref().ok_or(Error::NotFound)?;
            let info = dispatcher.dispatch(ctx.context()).await?;
            let value = serde_json::to_value(&info)?;
            Ok(Some(json_response(
                StatusCode::OK,
                "application/json",
                &value,
            )?))
        }
        RouteName::Actor => {
            negotiate(ctx)?;
            let identifier = var_string(vars, "identifier")?;
            authorize(ctx, Some(&identifier)).await?;
            let dispatcher = registrations
                .actor_dispatcher
                .as_ref()
                .ok_or(Error::NotFound)?;
            let Some(mut actor) = dispatcher.dispatch(ctx.context(), &identifier).await? else {
                return Err(Error::NotFound);
            };
            enrich_actor(ctx.context(), &identifier, &mut actor).await?;
            Ok(Some(activity_json_response(&actor.to_json_ld(JsonLdMode::Compact)?)?))
        }
        RouteName::Object(type_id) => {
            negotiate(ctx)?;
            authorize(ctx, None).await?;
            let dispatcher = registrations
                .object_dispatchers
                .get(type_id)
                .ok_or(Error::NotFound)?;
            let Some(object) = dispatcher.dispatch(ctx.context(), vars).await? else {
                return Err(Error::NotFound);
            };
            Ok(Some(activity_json_response(&object.to_json_ld(JsonLdMode::Compact)?)?))
        }
        name => {
            negotiate(ctx)?;
            let identifier = var_string(vars, "identifier").unwrap_or_default();
            authorize(ctx, Some(&identifier)).await?;
            let dispatcher = registrations
                .collection_dispatchers
                .get(name)
                .ok_or(Error::NotFound)?;
            let document =
                collection_document(ctx, name, &identifier, dispatcher.as_ref()).await?;
            Ok(Some(activity_json_response(&document)?))
        }
    }
}

fn var_string(vars: &VarMap, name: &str) -> Result<String, Error> {
    vars.get(name)
        .and_then(|v| v.as_str())
        .map(ToString::to_string)
        .ok_or(Error::Routing("route variable is missing"))
}

/// Content negotiation: the Accept list must intersect the ActivityPub
/// media types.
fn negotiate<T: Clone>(ctx: &RequestContext<T>) -> Result<(), Error> {
    let accept = ctx
        .headers
        .get("accept")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("*/*");
    let acceptable = accept.split(',').any(|part| {
        let essence = part.split(';').next().unwrap_or("").trim();
        matches!(
            essence,
            "application/activity+json" | "application/ld+json" | "application/*" | "*/*"
        )
    });
    if acceptable {
        Ok(())
    } else {
        Err(Error::NotAcceptable)
    }
}

async fn authorize<T: Clone + Send + Sync + 'static>(
    ctx: &RequestContext<T>,
    identifier: Option<&str>,
) -> Result<(), Error> {
    if let Some(predicate) = &ctx.context().inner.registrations.authorize {
        if !predicate.authorize(ctx.context(), identifier).await? {
            return Err(Error::Unauthorized);
        }
    }
    Ok(())
}

/// Fills in registered URIs and signing keys the dispatcher left unset.
async fn enrich_actor<T: Clone + Send + Sync + 'static>(
    ctx: &Context<T>,
    identifier: &str,
    actor: &mut Actor,
) -> Result<(), Error> {
    use crate::vocab::Endpoints;

    if actor.id.is_none() {
        actor.id = Some(ctx.actor_uri(identifier)?);
    }
    if actor.preferred_username.is_none() {
        actor.preferred_username = Some(identifier.to_string());
    }
    if actor.inbox.is_none() {
        actor.inbox = ctx.inbox_uri(identifier).ok();
    }
    if actor.endpoints.is_none() {
        if let Ok(shared) = ctx.shared_inbox_uri() {
            actor.endpoints = Some(Endpoints {
                shared_inbox: Some(shared),
            });
        }
    }
    if actor.outbox.is_none() {
        actor.outbox = ctx.outbox_uri(identifier).ok();
    }
    if actor.following.is_none() {
        actor.following = ctx.following_uri(identifier).ok();
    }
    if actor.followers.is_none() {
        actor.followers = ctx.followers_uri(identifier).ok();
    }
    if actor.liked.is_none() {
        actor.liked = ctx.liked_uri(identifier).ok();
    }
    if actor.featured.is_none() {
        actor.featured = ctx.featured_uri(identifier).ok();
    }
    if actor.featured_tags.is_none() {
        actor.featured_tags = ctx.featured_tags_uri(identifier).ok();
    }
    if actor.public_keys.is_empty() {
        let owner = actor.id.clone().ok_or(Error::Routing("actor has no id"))?;
        for (key, key_id) in ctx.actor_key_pairs(identifier).await? {
            actor.public_keys.push(crate::vocab::Ref::Obj(Box::new(PublicKey {
                id: key_id,
                owner: owner.clone(),
                public_key_pem: key.verify_key().to_pem()?,
            })));
        }
    }
    // The enrichment invalidates any memoised source document.
    actor.raw = None;
    Ok(())
}

async fn webfinger_document<T: Clone + Send + Sync + 'static>(
    ctx: &RequestContext<T>,
) -> Result<Value, Error> {
    let registrations = &ctx.context().inner.registrations;
    let resource = ctx
        .url
        .query_pairs()
        .find(|(name, _)| name == "resource")
        .map(|(_, value)| value.into_owned())
        .ok_or_else(|| Error::Parse("missing resource parameter".to_string()))?;

    let identifier = if resource.starts_with("http://") || resource.starts_with("https://") {
        let url = Url::parse(&resource)?;
        ctx.context().match_actor_uri(&url).ok_or(Error::NotFound)?
    } else {
        let authority = authority_of(ctx.base_url());
        let username = extract_handle(&resource, &authority)?.to_string();
        match &registrations.handle_mapper {
            Some(mapper) => mapper
                .map(ctx.context(), &username)
                .await?
                .ok_or(Error::NotFound)?,
            None => username,
        }
    };

    let dispatcher = registrations
        .actor_dispatcher
        .as_ref()
        .ok_or(Error::NotFound)?;
    let Some(actor) = dispatcher.dispatch(ctx.context(), &identifier).await? else {
        return Err(Error::NotFound);
    };

    let actor_url = ctx.context().actor_uri(&identifier)?;
    let jrd = build_jrd_with_types(resource.clone(), vec![(actor_url, Some(actor.kind.name()))]);
    Ok(serde_json::to_value(&jrd)?)
}

fn authority_of(url: &Url) -> String {
    let mut authority = url.host_str().unwrap_or_default().to_string();
    if let Some(port) = url.port() {
        authority.push(':');
        authority.push_str(&port.to_string());
    }
    authority
}

/// Builds the collection index or page document, driven by the `cursor`
/// and `page` query parameters.
async fn collection_document<T: Clone + Send + Sync + 'static>(
    ctx: &RequestContext<T>,
    _name: &RouteName,
    identifier: &str,
    dispatcher: &dyn crate::federation::builder::CollectionDispatcher<T>,
) -> Result<Value, Error> {
    let collection_url = ctx.url_without_query();
    let cursor = ctx
        .url
        .query_pairs()
        .find(|(n, _)| n == "cursor")
        .map(|(_, v)| v.into_owned());
    let wants_page = cursor.is_some()
        || ctx.url.query_pairs().any(|(n, v)| n == "page" && v != "false");

    let page_url = |cursor: &str| {
        let mut url = collection_url.clone();
        url.query_pairs_mut().append_pair("cursor", cursor);
        url
    };

    if !wants_page {
        let count = dispatcher.count(ctx.context(), identifier).await?;
        let first = dispatcher.first_cursor(ctx.context(), identifier).await?;

        if let Some(first) = first {
            // Paged: an index document with first/last links.
            let mut collection = Collection::new(CollectionKind::OrderedCollection);
            collection.id = Some(collection_url.clone());
            collection.total_items = count;
            collection.first = Refs::url(page_url(&first));
            if let Some(last) = dispatcher.last_cursor(ctx.context(), identifier).await? {
                collection.last = Refs::url(page_url(&last));
            }
            return collection.to_json_ld(JsonLdMode::Compact);
        }

        // Unpaged: the single page's items inline.
        let Some(page) = dispatcher.page(ctx.context(), identifier, None).await? else {
            return Err(Error::NotFound);
        };
        let mut collection = Collection::new(CollectionKind::OrderedCollection);
        collection.id = Some(collection_url.clone());
        collection.total_items = count.or(Some(page.items.len() as u64));
        collection.ordered_items = Refs::from_entries(page.items);
        return collection.to_json_ld(JsonLdMode::Compact);
    }

    // A page document.
    let cursor = match cursor {
        Some(cursor) => Some(cursor),
        None => dispatcher.first_cursor(ctx.context(), identifier).await?,
    };
    let Some(page) = dispatcher
        .page(ctx.context(), identifier, cursor.as_deref())
        .await?
    else {
        return Err(Error::NotFound);
    };

    let mut document = Collection::new(CollectionKind::OrderedCollectionPage);
    document.id = Some(match &cursor {
        Some(cursor) => page_url(cursor),
        None => collection_url.clone(),
    });
    document.part_of = Refs::url(collection_url.clone());
    document.ordered_items = Refs::from_entries(page.items);
    if let Some(next) = &page.next_cursor {
        document.next = Refs::url(page_url(next));
    }
    if let Some(prev) = &page.prev_cursor {
        document.prev = Refs::url(page_url(prev));
    }
    document.to_json_ld(JsonLdMode::Compact)
}

impl<T: Clone> RequestContext<T> {
    fn url_without_query(&self) -> Url {
        let mut url = self.url.clone();
        url.set_query(None);
        url.set_fragment(None);
        url
    }
}

pub(crate) fn status_response(status: StatusCode) -> Response<Bytes> {
    Response::builder()
        .status(status)
        .body(Bytes::new())
        .unwrap_or_default()
}

fn json_response(
    status: StatusCode,
    content_type: &str,
    value: &Value,
) -> Result<Response<Bytes>, Error> {
    Response::builder()
        .status(status)
        .header("content-type", content_type)
        .body(Bytes::from(serde_json::to_vec(value)?))
        .map_err(Error::other)
}

fn activity_json_response(value: &Value) -> Result<Response<Bytes>, Error> {
    json_response(StatusCode::OK, crate::FEDERATION_CONTENT_TYPE, value)
}

/// Spawns the queue listener; used by [Federation::start_queue].
pub(crate) struct QueueWorker<T: Clone> {
    pub(crate) ctx: Context<T>,
}

#[async_trait::async_trait]
impl<T: Clone + Send + Sync + 'static> crate::queue::MessageHandler for QueueWorker<T> {
    async fn handle(&self, message: Value) -> Result<(), Error> {
        crate::sending::process_queue_message(&self.ctx, message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authority_of() {
        assert_eq!(
            authority_of(&Url::parse("https://example.com/x").unwrap()),
            "example.com"
        );
        assert_eq!(
            authority_of(&Url::parse("http://example.com:8080/").unwrap()),
            "example.com:8080"
        );
    }

    #[test]
    fn test_status_response() {
        let response = status_response(StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert!(response.body().is_empty());
    }
}
