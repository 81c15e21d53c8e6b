//! Typed ActivityStreams vocabulary with lazy dereferencing
//!
//! Vocabulary objects are constructed locally, or from JSON-LD documents
//! with `from_json_ld`. URL-valued properties resolve lazily through a
//! [DocumentLoader](crate::fetch::loader::DocumentLoader), subject to the
//! same-origin check described in FEP-fe34.

pub mod activity;
pub mod actor;
pub mod collection;
pub mod object;
pub mod value;

pub use activity::{Activity, ActivityKind};
pub use actor::{Actor, ActorKind, Endpoints, PublicKey};
pub use collection::{Collection, CollectionKind};
pub use object::Object;
pub use value::{CrossOriginPolicy, JsonLdNode, LanguageString, Ref, Refs, Resolver};

use crate::error::Error;
use crate::vocab::value::Resolved;
use serde_json::{json, Map, Value};
use url::Url;

/// Output mode of `to_json_ld`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum JsonLdMode {
    /// The memoised source document verbatim, when one exists
    Raw,
    /// Compact form framed with the class's default context
    #[default]
    Compact,
    /// `@context`-free expanded form
    Expand,
}

pub(crate) fn activitystreams_context() -> Value {
    json!("https://www.w3.org/ns/activitystreams")
}

pub(crate) fn actor_context() -> Value {
    json!([
        "https://www.w3.org/ns/activitystreams",
        "https://w3id.org/security/v1"
    ])
}

/// Resolves one slot of a property, dropping the holder's memoised raw
/// document when a fetch replaced the slot in place. Returns whether an
/// object is now available at the index.
pub(crate) async fn resolve_slot<T: JsonLdNode>(
    refs: &mut Refs<T>,
    index: usize,
    origin: Option<url::Origin>,
    resolver: &Resolver<'_>,
    raw: &mut Option<Value>,
) -> Result<bool, Error> {
    match refs.resolve(index, origin.as_ref(), resolver).await? {
        Resolved::Fetched => {
            *raw = None;
            Ok(true)
        }
        Resolved::Present => Ok(true),
        Resolved::Skipped => Ok(false),
    }
}

/// Any vocabulary object, as returned by lookup.
#[derive(Clone, Debug)]
pub enum Entity {
    /// An actor
    Actor(Box<Actor>),
    /// An activity
    Activity(Box<Activity>),
    /// A collection or collection page
    Collection(Box<Collection>),
    /// Any other object
    Object(Box<Object>),
}

impl Entity {
    /// Builds the most specific class the document's `type` names.
    pub fn from_json_ld(document: &Value) -> Result<Entity, Error> {
        let kind = document
            .get("type")
            .map(|t| match t {
                Value::String(s) => s.clone(),
                Value::Array(a) => a
                    .first()
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                _ => String::new(),
            })
            .unwrap_or_default();

        if ActorKind::from_name(&kind).is_some() {
            return Ok(Entity::Actor(Box::new(Actor::from_json_ld(document)?)));
        }
        if ActivityKind::from_name(&kind).is_some() {
            return Ok(Entity::Activity(Box::new(Activity::from_json_ld(document)?)));
        }
        if CollectionKind::from_name(&kind).is_some() {
            return Ok(Entity::Collection(Box::new(Collection::from_json_ld(
                document,
            )?)));
        }
        Ok(Entity::Object(Box::new(Object::from_json_ld(document)?)))
    }

    /// The entity's `id`.
    pub fn id(&self) -> Option<&Url> {
        match self {
            Entity::Actor(a) => a.id.as_ref(),
            Entity::Activity(a) => a.id.as_ref(),
            Entity::Collection(c) => c.id.as_ref(),
            Entity::Object(o) => o.id.as_ref(),
        }
    }

    /// Records the URL the entity's document was loaded from.
    pub fn set_document_url(&mut self, url: &Url) {
        match self {
            Entity::Actor(a) => a.document_url = Some(url.clone()),
            Entity::Activity(a) => a.document_url = Some(url.clone()),
            Entity::Collection(c) => c.document_url = Some(url.clone()),
            Entity::Object(o) => o.document_url = Some(url.clone()),
        }
    }

    /// Serialises the entity back to JSON-LD.
    pub fn to_json_ld(&self, mode: JsonLdMode) -> Result<Value, Error> {
        match self {
            Entity::Actor(a) => a.to_json_ld(mode),
            Entity::Activity(a) => a.to_json_ld(mode),
            Entity::Collection(c) => c.to_json_ld(mode),
            Entity::Object(o) => o.to_json_ld(mode),
        }
    }

    /// The contained actor, if this entity is one.
    pub fn into_actor(self) -> Option<Actor> {
        match self {
            Entity::Actor(actor) => Some(*actor),
            _ => None,
        }
    }

    /// The contained collection, if this entity is one.
    pub fn into_collection(self) -> Option<Collection> {
        match self {
            Entity::Collection(collection) => Some(*collection),
            _ => None,
        }
    }
}

const AS_NS: &str = "https://www.w3.org/ns/activitystreams#";
const SEC_NS: &str = "https://w3id.org/security#";
const LDP_INBOX: &str = "http://www.w3.org/ns/ldp#inbox";

/// Compact term to IRI, with whether the term is `@id`-coerced.
fn term_iri(term: &str) -> Option<(String, bool)> {
    let id_terms = [
        "actor", "attachment", "attributedTo", "audience", "bcc", "bto", "cc", "endpoints",
        "first", "followers", "following", "icon", "image", "inReplyTo", "items", "last",
        "liked", "next", "object", "orderedItems", "outbox", "partOf", "prev", "replies",
        "sharedInbox", "tag", "target", "to", "url", "featured", "featuredTags",
    ];
    let value_terms = [
        "content", "mediaType", "name", "preferredUsername", "published", "summary",
        "totalItems", "updated", "manuallyApprovesFollowers",
    ];
    if term == "inbox" {
        return Some((LDP_INBOX.to_string(), true));
    }
    if id_terms.contains(&term) {
        return Some((format!("{AS_NS}{term}"), true));
    }
    if value_terms.contains(&term) {
        return Some((format!("{AS_NS}{term}"), false));
    }
    match term {
        "publicKey" => Some((format!("{SEC_NS}publicKey"), true)),
        "owner" => Some((format!("{SEC_NS}owner"), true)),
        "publicKeyPem" => Some((format!("{SEC_NS}publicKeyPem"), false)),
        _ => None,
    }
}

/// Expands a compact document: terms become IRIs, values become
/// `@value`/`@id` nodes, the `@context` disappears.
pub(crate) fn expand_document(document: &Value) -> Value {
    let Value::Object(map) = document else {
        return document.clone();
    };
    let mut out = Map::new();
    for (key, value) in map {
        match key.as_str() {
            "@context" => {}
            "id" | "@id" => {
                out.insert("@id".to_string(), value.clone());
            }
            "type" | "@type" => {
                let kinds = match value {
                    Value::Array(a) => a.clone(),
                    v => vec![v.clone()],
                };
                let expanded: Vec<Value> = kinds
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|k| Value::String(format!("{AS_NS}{k}")))
                    .collect();
                out.insert("@type".to_string(), Value::Array(expanded));
            }
            term => {
                // Language maps expand to tagged value nodes.
                if let Some(base) = term.strip_suffix("Map") {
                    if let (Some((iri, _)), Value::Object(langs)) = (term_iri(base), value) {
                        let nodes: Vec<Value> = langs
                            .iter()
                            .map(|(tag, v)| json!({"@value": v, "@language": tag}))
                            .collect();
                        merge_expanded(&mut out, iri, nodes);
                        continue;
                    }
                }
                let Some((iri, id_coerced)) = term_iri(term) else {
                    continue;
                };
                let values = match value {
                    Value::Array(a) => a.clone(),
                    v => vec![v.clone()],
                };
                let nodes: Vec<Value> = values
                    .iter()
                    .map(|v| expand_node(v, id_coerced))
                    .collect();
                merge_expanded(&mut out, iri, nodes);
            }
        }
    }
    Value::Object(out)
}

fn merge_expanded(out: &mut Map<String, Value>, iri: String, mut nodes: Vec<Value>) {
    match out.get_mut(&iri) {
        Some(Value::Array(existing)) => existing.append(&mut nodes),
        _ => {
            out.insert(iri, Value::Array(nodes));
        }
    }
}

fn expand_node(value: &Value, id_coerced: bool) -> Value {
    match value {
        Value::Object(_) => expand_document(value),
        Value::String(s) if id_coerced => json!({"@id": s}),
        v => json!({"@value": v}),
    }
}
