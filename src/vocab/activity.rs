//! Activity classes and the subtype table used for inbox dispatch

use crate::error::Error;
use crate::vocab::actor::Actor;
use crate::vocab::object::{to_json_ld_with_context, Object};
use crate::vocab::value::{
    deserialize_one_or_many,
    serialize_one_or_many,
    JsonLdNode,
    Refs,
    Resolver,
};
use crate::vocab::{activitystreams_context, resolve_slot, JsonLdMode};
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

/// The activity types of the ActivityStreams vocabulary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum ActivityKind {
    Accept,
    Add,
    Announce,
    Arrive,
    Block,
    Create,
    Delete,
    Dislike,
    Flag,
    Follow,
    Ignore,
    Invite,
    Join,
    Leave,
    Like,
    Listen,
    Move,
    Offer,
    Question,
    Read,
    Reject,
    Remove,
    TentativeAccept,
    TentativeReject,
    Travel,
    Undo,
    Update,
    View,
}

impl ActivityKind {
    /// Parses a type name.
    pub fn from_name(name: &str) -> Option<ActivityKind> {
        serde_json::from_value(Value::String(name.to_string())).ok()
    }

    /// The type name.
    pub fn name(self) -> &'static str {
        match self {
            ActivityKind::Accept => "Accept",
            ActivityKind::Add => "Add",
            ActivityKind::Announce => "Announce",
            ActivityKind::Arrive => "Arrive",
            ActivityKind::Block => "Block",
            ActivityKind::Create => "Create",
            ActivityKind::Delete => "Delete",
            ActivityKind::Dislike => "Dislike",
            ActivityKind::Flag => "Flag",
            ActivityKind::Follow => "Follow",
            ActivityKind::Ignore => "Ignore",
            ActivityKind::Invite => "Invite",
            ActivityKind::Join => "Join",
            ActivityKind::Leave => "Leave",
            ActivityKind::Like => "Like",
            ActivityKind::Listen => "Listen",
            ActivityKind::Move => "Move",
            ActivityKind::Offer => "Offer",
            ActivityKind::Question => "Question",
            ActivityKind::Read => "Read",
            ActivityKind::Reject => "Reject",
            ActivityKind::Remove => "Remove",
            ActivityKind::TentativeAccept => "TentativeAccept",
            ActivityKind::TentativeReject => "TentativeReject",
            ActivityKind::Travel => "Travel",
            ActivityKind::Undo => "Undo",
            ActivityKind::Update => "Update",
            ActivityKind::View => "View",
        }
    }

    /// The direct supertype within the vocabulary, if any.
    ///
    /// Listener dispatch walks this chain from the concrete type upward,
    /// so a handler registered for `Offer` also receives `Invite`.
    pub fn parent(self) -> Option<ActivityKind> {
        match self {
            ActivityKind::TentativeAccept => Some(ActivityKind::Accept),
            ActivityKind::TentativeReject => Some(ActivityKind::Reject),
            ActivityKind::Invite => Some(ActivityKind::Offer),
            ActivityKind::Block => Some(ActivityKind::Ignore),
            _ => None,
        }
    }

    /// The type itself followed by its supertypes, most specific first.
    pub fn lineage(self) -> Vec<ActivityKind> {
        let mut chain = vec![self];
        let mut current = self;
        while let Some(parent) = current.parent() {
            chain.push(parent);
            current = parent;
        }
        chain
    }
}

/// A typed action performed by an actor.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    /// The activity's identifier; doubles as its idempotence key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Url>,
    /// Activity type
    #[serde(rename = "type")]
    pub kind: ActivityKind,
    /// The acting actor
    #[serde(default, skip_serializing_if = "Refs::is_empty")]
    pub actor: Refs<Actor>,
    /// The object acted upon
    #[serde(default, skip_serializing_if = "Refs::is_empty")]
    pub object: Refs<Object>,
    /// The indirect target, e.g. the collection added to
    #[serde(default, skip_serializing_if = "Refs::is_empty")]
    pub target: Refs<Object>,
    /// Primary addressing
    #[serde(default, deserialize_with = "deserialize_one_or_many", serialize_with = "serialize_one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<Url>,
    /// Secondary addressing
    #[serde(default, deserialize_with = "deserialize_one_or_many", serialize_with = "serialize_one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<Url>,
    /// Hidden primary addressing, stripped before delivery
    #[serde(default, deserialize_with = "deserialize_one_or_many", serialize_with = "serialize_one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub bto: Vec<Url>,
    /// Hidden secondary addressing, stripped before delivery
    #[serde(default, deserialize_with = "deserialize_one_or_many", serialize_with = "serialize_one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub bcc: Vec<Url>,
    /// Logical audience
    #[serde(default, deserialize_with = "deserialize_one_or_many", serialize_with = "serialize_one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub audience: Vec<Url>,
    /// Publication instant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<DateTime<FixedOffset>>,

    #[serde(skip)]
    pub(crate) raw: Option<Value>,
    #[serde(skip)]
    pub(crate) document_url: Option<Url>,
}

impl Activity {
    /// A minimal activity of the given type.
    pub fn new(kind: ActivityKind) -> Activity {
        Activity {
            id: None,
            kind,
            actor: Refs::default(),
            object: Refs::default(),
            target: Refs::default(),
            to: Vec::new(),
            cc: Vec::new(),
            bto: Vec::new(),
            bcc: Vec::new(),
            audience: Vec::new(),
            published: None,
            raw: None,
            document_url: None,
        }
    }

    /// Builds an activity from a JSON-LD document.
    pub fn from_json_ld(document: &Value) -> Result<Activity, Error> {
        let mut activity: Activity =
            serde_json::from_value(document.clone()).map_err(|e| Error::Parse(e.to_string()))?;
        activity.raw = Some(document.clone());
        Ok(activity)
    }

    /// The `actor` URL, with resolved actors coerced to their id.
    pub fn actor_id(&self) -> Option<&Url> {
        self.actor.first_id()
    }

    /// The `object` URL.
    pub fn object_id(&self) -> Option<&Url> {
        self.object.first_id()
    }

    pub(crate) fn trust_origin(&self) -> Option<url::Origin> {
        self.id
            .as_ref()
            .or(self.document_url.as_ref())
            .map(Url::origin)
    }

    /// Resolves and returns the acting actor.
    pub async fn get_actor(&mut self, resolver: &Resolver<'_>) -> Result<Option<&Actor>, Error> {
        let origin = self.trust_origin();
        if resolve_slot(&mut self.actor, 0, origin, resolver, &mut self.raw).await? {
            Ok(self.actor.get_object(0))
        } else {
            Ok(None)
        }
    }

    /// Resolves and returns the object acted upon.
    pub async fn get_object(&mut self, resolver: &Resolver<'_>) -> Result<Option<&Object>, Error> {
        let origin = self.trust_origin();
        if resolve_slot(&mut self.object, 0, origin, resolver, &mut self.raw).await? {
            Ok(self.object.get_object(0))
        } else {
            Ok(None)
        }
    }

    /// Resolves and returns the indirect target.
    pub async fn get_target(&mut self, resolver: &Resolver<'_>) -> Result<Option<&Object>, Error> {
        let origin = self.trust_origin();
        if resolve_slot(&mut self.target, 0, origin, resolver, &mut self.raw).await? {
            Ok(self.target.get_object(0))
        } else {
            Ok(None)
        }
    }

    /// All addressing URLs: `to`, `cc`, `bto`, `bcc` and `audience`.
    pub fn recipients(&self) -> Vec<&Url> {
        self.to
            .iter()
            .chain(&self.cc)
            .chain(&self.bto)
            .chain(&self.bcc)
            .chain(&self.audience)
            .collect()
    }

    /// Removes `bto` and `bcc` before the activity goes over the wire.
    pub fn strip_hidden_recipients(&mut self) {
        if !self.bto.is_empty() || !self.bcc.is_empty() {
            self.bto.clear();
            self.bcc.clear();
            self.raw = None;
        }
    }

    /// Serialises the activity back to JSON-LD.
    pub fn to_json_ld(&self, mode: JsonLdMode) -> Result<Value, Error> {
        to_json_ld_with_context(self, &self.raw, mode, activitystreams_context())
    }
}

impl JsonLdNode for Activity {
    fn from_json_ld(document: &Value) -> Result<Self, Error> {
        Activity::from_json_ld(document)
    }

    fn node_id(&self) -> Option<&Url> {
        self.id.as_ref()
    }

    fn set_document_url(&mut self, url: &Url) {
        self.document_url = Some(url.clone());
    }
}
