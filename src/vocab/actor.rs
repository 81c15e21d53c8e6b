//! Actor classes: Person, Group, Service and friends

use crate::error::Error;
use crate::vocab::object::{to_json_ld_with_context, Object};
use crate::vocab::value::{JsonLdNode, Refs, Resolver};
use crate::vocab::{actor_context, resolve_slot, JsonLdMode};
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use url::Url;

/// The actor types of the ActivityStreams vocabulary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorKind {
    /// An automated application
    Application,
    /// A group of users
    Group,
    /// An organization
    Organization,
    /// An individual person
    Person,
    /// A service, e.g. a relay or a bot platform
    Service,
}

impl ActorKind {
    /// Parses a type name.
    pub fn from_name(name: &str) -> Option<ActorKind> {
        match name {
            "Application" => Some(ActorKind::Application),
            "Group" => Some(ActorKind::Group),
            "Organization" => Some(ActorKind::Organization),
            "Person" => Some(ActorKind::Person),
            "Service" => Some(ActorKind::Service),
            _ => None,
        }
    }

    /// The type name.
    pub fn name(self) -> &'static str {
        match self {
            ActorKind::Application => "Application",
            ActorKind::Group => "Group",
            ActorKind::Organization => "Organization",
            ActorKind::Person => "Person",
            ActorKind::Service => "Service",
        }
    }
}

impl Default for ActorKind {
    fn default() -> Self {
        ActorKind::Person
    }
}

/// Additional delivery endpoints of an actor.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoints {
    /// Inbox accepting activities for every local actor at once
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shared_inbox: Option<Url>,
}

/// Public key of an actor, used for HTTP signatures.
///
/// Federated in the `publicKey` field of all actors.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKey {
    /// Id of this key, conventionally `{actor_id}#main-key`
    pub id: Url,
    /// The actor controlling this key
    pub owner: Url,
    /// PEM-encoded public key
    pub public_key_pem: String,
}

impl PublicKey {
    /// Creates the actor's main key with the conventional key id.
    pub fn new(owner: Url, public_key_pem: String) -> Result<PublicKey, Error> {
        let id = main_key_id(&owner)?;
        Ok(PublicKey {
            id,
            owner,
            public_key_pem,
        })
    }
}

/// The conventional id of an actor's main key.
pub fn main_key_id(owner: &Url) -> Result<Url, Error> {
    Url::parse(&format!("{owner}#main-key")).map_err(Error::UrlParse)
}

impl JsonLdNode for PublicKey {
    fn from_json_ld(document: &Value) -> Result<Self, Error> {
        serde_json::from_value(document.clone()).map_err(|e| Error::Parse(e.to_string()))
    }

    fn node_id(&self) -> Option<&Url> {
        Some(&self.id)
    }

    fn set_document_url(&mut self, _: &Url) {}
}

/// An addressable entity with inbox and outbox URLs.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    /// The actor's identifier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Url>,
    /// Actor type
    #[serde(rename = "type")]
    pub kind: ActorKind,
    /// Username for webfinger handles, unique per server
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
    /// Display name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Language-tagged display names
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub name_map: BTreeMap<String, String>,
    /// Bio or description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Inbox where activities for this actor are delivered
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inbox: Option<Url>,
    /// Collection of activities published by this actor
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outbox: Option<Url>,
    /// Collection of actors this one follows
    #[serde(skip_serializing_if = "Option::is_none")]
    pub following: Option<Url>,
    /// Collection of actors following this one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub followers: Option<Url>,
    /// Collection of objects this actor liked
    #[serde(skip_serializing_if = "Option::is_none")]
    pub liked: Option<Url>,
    /// Collection of pinned objects
    #[serde(skip_serializing_if = "Option::is_none")]
    pub featured: Option<Url>,
    /// Collection of featured hashtags
    #[serde(skip_serializing_if = "Option::is_none")]
    pub featured_tags: Option<Url>,
    /// Additional endpoints, notably the shared inbox
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoints: Option<Endpoints>,
    /// Signing keys
    #[serde(rename = "publicKey", default, skip_serializing_if = "Refs::is_empty")]
    pub public_keys: Refs<PublicKey>,
    /// Whether follow requests need manual approval
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manually_approves_followers: Option<bool>,
    /// Profile link
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<Url>,
    /// Avatar
    #[serde(default, skip_serializing_if = "Refs::is_empty")]
    pub icon: Refs<Object>,
    /// Banner image
    #[serde(default, skip_serializing_if = "Refs::is_empty")]
    pub image: Refs<Object>,
    /// Account creation instant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<DateTime<FixedOffset>>,

    /// The raw JSON-LD document this actor was parsed from, if any.
    #[serde(skip)]
    pub raw: Option<Value>,
    /// The URL this actor document was fetched from, if any.
    #[serde(skip)]
    pub document_url: Option<Url>,
}

impl Actor {
    /// Builds an actor from a JSON-LD document.
    pub fn from_json_ld(document: &Value) -> Result<Actor, Error> {
        let mut actor: Actor =
            serde_json::from_value(document.clone()).map_err(|e| Error::Parse(e.to_string()))?;
        actor.raw = Some(document.clone());
        Ok(actor)
    }

    /// Shared inbox if the actor advertises one, the personal inbox
    /// otherwise.
    pub fn shared_inbox_or_inbox(&self) -> Option<&Url> {
        self.endpoints
            .as_ref()
            .and_then(|e| e.shared_inbox.as_ref())
            .or(self.inbox.as_ref())
    }

    /// Ids of the actor's signing keys.
    pub fn key_ids(&self) -> Vec<&Url> {
        self.public_keys.ids()
    }

    /// The embedded key with the given id.
    pub fn key_by_id(&self, key_id: &Url) -> Option<&PublicKey> {
        (0..self.public_keys.len())
            .filter_map(|i| self.public_keys.get_object(i))
            .find(|k| k.id == *key_id)
    }

    pub(crate) fn trust_origin(&self) -> Option<url::Origin> {
        self.id
            .as_ref()
            .or(self.document_url.as_ref())
            .map(Url::origin)
    }

    /// Resolves and returns the signing key at `index`. Keys published as
    /// bare URL references are fetched through the loader.
    pub async fn get_public_key(
        &mut self,
        index: usize,
        resolver: &Resolver<'_>,
    ) -> Result<Option<&PublicKey>, Error> {
        let origin = self.trust_origin();
        if resolve_slot(&mut self.public_keys, index, origin, resolver, &mut self.raw).await? {
            Ok(self.public_keys.get_object(index))
        } else {
            Ok(None)
        }
    }

    /// Resolves and returns the `icon` value at `index`.
    pub async fn get_icon(
        &mut self,
        index: usize,
        resolver: &Resolver<'_>,
    ) -> Result<Option<&Object>, Error> {
        let origin = self.trust_origin();
        if resolve_slot(&mut self.icon, index, origin, resolver, &mut self.raw).await? {
            Ok(self.icon.get_object(index))
        } else {
            Ok(None)
        }
    }

    /// Resolves and returns the `image` value at `index`.
    pub async fn get_image(
        &mut self,
        index: usize,
        resolver: &Resolver<'_>,
    ) -> Result<Option<&Object>, Error> {
        let origin = self.trust_origin();
        if resolve_slot(&mut self.image, index, origin, resolver, &mut self.raw).await? {
            Ok(self.image.get_object(index))
        } else {
            Ok(None)
        }
    }

    /// Serialises the actor back to JSON-LD. Compact output is framed with
    /// the ActivityStreams and security contexts.
    pub fn to_json_ld(&self, mode: JsonLdMode) -> Result<Value, Error> {
        to_json_ld_with_context(self, &self.raw, mode, actor_context())
    }
}

impl JsonLdNode for Actor {
    fn from_json_ld(document: &Value) -> Result<Self, Error> {
        Actor::from_json_ld(document)
    }

    fn node_id(&self) -> Option<&Url> {
        self.id.as_ref()
    }

    fn set_document_url(&mut self, url: &Url) {
        self.document_url = Some(url.clone());
    }
}
