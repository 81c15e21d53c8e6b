//! Bundled JSON-LD contexts
//!
//! The well-known contexts referenced by virtually every ActivityPub
//! document never change, so they ship with the crate. The document cache
//! serves them directly; they are never fetched and never written to the
//! key-value store.

use once_cell::sync::Lazy;
use serde_json::Value;
use std::collections::HashMap;

/// `https://www.w3.org/ns/activitystreams`, reduced to the terms this
/// runtime reads and writes.
static ACTIVITYSTREAMS: &str = r##"{
  "@context": {
    "@vocab": "_:",
    "xsd": "http://www.w3.org/2001/XMLSchema#",
    "as": "https://www.w3.org/ns/activitystreams#",
    "ldp": "http://www.w3.org/ns/ldp#",
    "id": "@id",
    "type": "@type",
    "Accept": "as:Accept",
    "Activity": "as:Activity",
    "Announce": "as:Announce",
    "Application": "as:Application",
    "Article": "as:Article",
    "Collection": "as:Collection",
    "CollectionPage": "as:CollectionPage",
    "Create": "as:Create",
    "Delete": "as:Delete",
    "Document": "as:Document",
    "Follow": "as:Follow",
    "Group": "as:Group",
    "Image": "as:Image",
    "Like": "as:Like",
    "Note": "as:Note",
    "Object": "as:Object",
    "OrderedCollection": "as:OrderedCollection",
    "OrderedCollectionPage": "as:OrderedCollectionPage",
    "Organization": "as:Organization",
    "Person": "as:Person",
    "Reject": "as:Reject",
    "Service": "as:Service",
    "Tombstone": "as:Tombstone",
    "Undo": "as:Undo",
    "Update": "as:Update",
    "actor": {"@id": "as:actor", "@type": "@id"},
    "attachment": {"@id": "as:attachment", "@type": "@id"},
    "attributedTo": {"@id": "as:attributedTo", "@type": "@id"},
    "audience": {"@id": "as:audience", "@type": "@id"},
    "bcc": {"@id": "as:bcc", "@type": "@id"},
    "bto": {"@id": "as:bto", "@type": "@id"},
    "cc": {"@id": "as:cc", "@type": "@id"},
    "content": "as:content",
    "contentMap": {"@id": "as:content", "@container": "@language"},
    "endpoints": {"@id": "as:endpoints", "@type": "@id"},
    "first": {"@id": "as:first", "@type": "@id"},
    "followers": {"@id": "as:followers", "@type": "@id"},
    "following": {"@id": "as:following", "@type": "@id"},
    "icon": {"@id": "as:icon", "@type": "@id"},
    "image": {"@id": "as:image", "@type": "@id"},
    "inReplyTo": {"@id": "as:inReplyTo", "@type": "@id"},
    "inbox": {"@id": "ldp:inbox", "@type": "@id"},
    "items": {"@id": "as:items", "@type": "@id"},
    "last": {"@id": "as:last", "@type": "@id"},
    "liked": {"@id": "as:liked", "@type": "@id"},
    "mediaType": "as:mediaType",
    "name": "as:name",
    "nameMap": {"@id": "as:name", "@container": "@language"},
    "next": {"@id": "as:next", "@type": "@id"},
    "object": {"@id": "as:object", "@type": "@id"},
    "orderedItems": {"@id": "as:items", "@container": "@list"},
    "outbox": {"@id": "as:outbox", "@type": "@id"},
    "partOf": {"@id": "as:partOf", "@type": "@id"},
    "preferredUsername": "as:preferredUsername",
    "prev": {"@id": "as:prev", "@type": "@id"},
    "published": {"@id": "as:published", "@type": "xsd:dateTime"},
    "sharedInbox": {"@id": "as:sharedInbox", "@type": "@id"},
    "summary": "as:summary",
    "summaryMap": {"@id": "as:summary", "@container": "@language"},
    "target": {"@id": "as:target", "@type": "@id"},
    "to": {"@id": "as:to", "@type": "@id"},
    "totalItems": {"@id": "as:totalItems", "@type": "xsd:nonNegativeInteger"},
    "updated": {"@id": "as:updated", "@type": "xsd:dateTime"},
    "url": {"@id": "as:url", "@type": "@id"}
  }
}"##;

/// `https://w3id.org/security/v1`.
static SECURITY_V1: &str = r##"{
  "@context": {
    "id": "@id",
    "type": "@type",
    "dc": "http://purl.org/dc/terms/",
    "sec": "https://w3id.org/security#",
    "xsd": "http://www.w3.org/2001/XMLSchema#",
    "CryptographicKey": "sec:Key",
    "created": {"@id": "dc:created", "@type": "xsd:dateTime"},
    "creator": {"@id": "dc:creator", "@type": "@id"},
    "owner": {"@id": "sec:owner", "@type": "@id"},
    "privateKeyPem": "sec:privateKeyPem",
    "publicKey": {"@id": "sec:publicKey", "@type": "@id"},
    "publicKeyPem": "sec:publicKeyPem",
    "signature": "sec:signature",
    "signatureAlgorithm": "sec:signingAlgorithm",
    "signatureValue": "sec:signatureValue"
  }
}"##;

/// `https://www.w3.org/ns/did/v1`.
static DID_V1: &str = r##"{
  "@context": {
    "@protected": true,
    "id": "@id",
    "type": "@type",
    "alsoKnownAs": {"@id": "https://www.w3.org/ns/activitystreams#alsoKnownAs", "@type": "@id"},
    "assertionMethod": {"@id": "https://w3id.org/security#assertionMethod", "@type": "@id", "@container": "@set"},
    "authentication": {"@id": "https://w3id.org/security#authenticationMethod", "@type": "@id", "@container": "@set"},
    "controller": {"@id": "https://w3id.org/security#controller", "@type": "@id"},
    "service": {"@id": "https://www.w3.org/ns/did#service", "@type": "@id", "@container": "@set"},
    "verificationMethod": {"@id": "https://w3id.org/security#verificationMethod", "@type": "@id"}
  }
}"##;

static PRELOADED: Lazy<HashMap<&'static str, Value>> = Lazy::new(|| {
    let parse = |s: &str| serde_json::from_str(s).expect("bundled context is valid JSON");
    HashMap::from([
        ("https://www.w3.org/ns/activitystreams", parse(ACTIVITYSTREAMS)),
        ("https://w3id.org/security/v1", parse(SECURITY_V1)),
        ("https://www.w3.org/ns/did/v1", parse(DID_V1)),
    ])
});

/// Returns the bundled context document for `url`, if there is one.
pub fn preloaded_context(url: &str) -> Option<&'static Value> {
    // Some servers reference the AS context over plain http.
    let url = url.strip_prefix("http://").map_or(url, |rest| {
        PRELOADED
            .keys()
            .find(|k| k.strip_prefix("https://") == Some(rest))
            .copied()
            .unwrap_or(url)
    });
    PRELOADED.get(url)
}

/// The context URLs served from the bundle.
pub fn preloaded_context_urls() -> impl Iterator<Item = &'static str> {
    PRELOADED.keys().copied()
}
