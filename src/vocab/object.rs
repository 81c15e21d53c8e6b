//! The base `Object` class of the ActivityStreams vocabulary

use crate::error::Error;
use crate::vocab::collection::Collection;
use crate::vocab::value::{
    deserialize_one_or_many,
    deserialize_skip_error,
    serialize_one_or_many,
    JsonLdNode,
    LanguageString,
    Refs,
    Resolver,
};
use crate::vocab::{activitystreams_context, expand_document, resolve_slot, JsonLdMode};
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use url::Url;

/// A generic object in an ActivityStreams graph.
///
/// Construct locally with struct-update syntax, or from a remote document
/// with [Object::from_json_ld].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Object {
    /// The object's identifier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Url>,
    /// Type names, most significant first
    #[serde(
        rename = "type",
        default,
        deserialize_with = "deserialize_one_or_many",
        serialize_with = "serialize_one_or_many",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub kinds: Vec<String>,
    /// Plain display name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Language-tagged display names
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub name_map: BTreeMap<String, String>,
    /// Plain summary
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Language-tagged summaries
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub summary_map: BTreeMap<String, String>,
    /// Content, usually HTML
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Language-tagged content
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub content_map: BTreeMap<String, String>,
    /// Media type of `content`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Link to an HTML representation
    #[serde(default, deserialize_with = "deserialize_skip_error", skip_serializing_if = "Option::is_none")]
    pub url: Option<Url>,
    /// Publication instant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<DateTime<FixedOffset>>,
    /// Last-update instant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<FixedOffset>>,
    /// Authors of the object
    #[serde(default, skip_serializing_if = "Refs::is_empty")]
    pub attributed_to: Refs<Object>,
    /// The object this one replies to
    #[serde(default, skip_serializing_if = "Refs::is_empty")]
    pub in_reply_to: Refs<Object>,
    /// Attached media or links
    #[serde(default, skip_serializing_if = "Refs::is_empty")]
    pub attachment: Refs<Object>,
    /// Icon images
    #[serde(default, skip_serializing_if = "Refs::is_empty")]
    pub icon: Refs<Object>,
    /// Full-size images
    #[serde(default, skip_serializing_if = "Refs::is_empty")]
    pub image: Refs<Object>,
    /// Tags and mentions
    #[serde(default, skip_serializing_if = "Refs::is_empty")]
    pub tag: Refs<Object>,
    /// Collection of replies
    #[serde(default, skip_serializing_if = "Refs::is_empty")]
    pub replies: Refs<Collection>,
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

    #[serde(skip)]
    pub(crate) raw: Option<Value>,
    #[serde(skip)]
    pub(crate) document_url: Option<Url>,
}

impl Object {
    /// Builds an object from a JSON-LD document, memoising the document
    /// for [JsonLdMode::Raw] output.
    pub fn from_json_ld(document: &Value) -> Result<Object, Error> {
        let mut object: Object =
            serde_json::from_value(document.clone()).map_err(|e| Error::Parse(e.to_string()))?;
        object.raw = Some(document.clone());
        Ok(object)
    }

    /// The most significant type name.
    pub fn kind(&self) -> Option<&str> {
        self.kinds.first().map(String::as_str)
    }

    /// The display name in the given language, falling back to the plain
    /// `name`.
    pub fn name_in(&self, language: &str) -> Option<LanguageString> {
        let wanted = LanguageString::new(String::new(), language);
        self.name_map
            .iter()
            .find(|(tag, _)| {
                LanguageString::new(String::new(), tag.as_str()).base_language()
                    == wanted.base_language()
            })
            .map(|(tag, value)| LanguageString::new(value.clone(), tag.clone()))
            .or_else(|| self.name.as_ref().map(|n| LanguageString::new(n.clone(), "und")))
    }

    /// The origin lazy children are judged against: the object's `id`,
    /// falling back to the URL of the document it was loaded from.
    pub(crate) fn trust_origin(&self) -> Option<url::Origin> {
        self.id
            .as_ref()
            .or(self.document_url.as_ref())
            .map(Url::origin)
    }

    /// URLs of the `attributedTo` values.
    pub fn attributed_to_ids(&self) -> Vec<&Url> {
        self.attributed_to.ids()
    }

    /// Resolves and returns the first `attributedTo` value.
    pub async fn get_attributed_to(
        &mut self,
        resolver: &Resolver<'_>,
    ) -> Result<Option<&Object>, Error> {
        let origin = self.trust_origin();
        if resolve_slot(&mut self.attributed_to, 0, origin, resolver, &mut self.raw).await? {
            Ok(self.attributed_to.get_object(0))
        } else {
            Ok(None)
        }
    }

    /// Resolves and returns the first `inReplyTo` value.
    pub async fn get_in_reply_to(
        &mut self,
        resolver: &Resolver<'_>,
    ) -> Result<Option<&Object>, Error> {
        let origin = self.trust_origin();
        if resolve_slot(&mut self.in_reply_to, 0, origin, resolver, &mut self.raw).await? {
            Ok(self.in_reply_to.get_object(0))
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

    /// Resolves and returns the `attachment` value at `index`.
    pub async fn get_attachment(
        &mut self,
        index: usize,
        resolver: &Resolver<'_>,
    ) -> Result<Option<&Object>, Error> {
        let origin = self.trust_origin();
        if resolve_slot(&mut self.attachment, index, origin, resolver, &mut self.raw).await? {
            Ok(self.attachment.get_object(index))
        } else {
            Ok(None)
        }
    }

    /// Resolves and returns the `tag` value at `index`.
    pub async fn get_tag(
        &mut self,
        index: usize,
        resolver: &Resolver<'_>,
    ) -> Result<Option<&Object>, Error> {
        let origin = self.trust_origin();
        if resolve_slot(&mut self.tag, index, origin, resolver, &mut self.raw).await? {
            Ok(self.tag.get_object(index))
        } else {
            Ok(None)
        }
    }

    /// Resolves and returns the replies collection.
    pub async fn get_replies(
        &mut self,
        resolver: &Resolver<'_>,
    ) -> Result<Option<&Collection>, Error> {
        let origin = self.trust_origin();
        if resolve_slot(&mut self.replies, 0, origin, resolver, &mut self.raw).await? {
            Ok(self.replies.get_object(0))
        } else {
            Ok(None)
        }
    }

    /// Serialises the object back to JSON-LD.
    pub fn to_json_ld(&self, mode: JsonLdMode) -> Result<Value, Error> {
        to_json_ld_with_context(self, &self.raw, mode, activitystreams_context())
    }
}

/// Shared rendering for every vocabulary class.
pub(crate) fn to_json_ld_with_context<T: Serialize>(
    object: &T,
    raw: &Option<Value>,
    mode: JsonLdMode,
    context: Value,
) -> Result<Value, Error> {
    match mode {
        JsonLdMode::Raw => {
            if let Some(raw) = raw {
                return Ok(raw.clone());
            }
            to_json_ld_with_context(object, raw, JsonLdMode::Compact, context)
        }
        JsonLdMode::Compact => {
            let value = serde_json::to_value(object)?;
            let mut framed = serde_json::Map::new();
            framed.insert("@context".to_string(), context);
            if let Value::Object(map) = value {
                framed.extend(map);
            }
            Ok(Value::Object(framed))
        }
        JsonLdMode::Expand => {
            let compact = to_json_ld_with_context(object, raw, JsonLdMode::Compact, context)?;
            Ok(expand_document(&compact))
        }
    }
}

impl JsonLdNode for Object {
    fn from_json_ld(document: &Value) -> Result<Self, Error> {
        Object::from_json_ld(document)
    }

    fn node_id(&self) -> Option<&Url> {
        self.id.as_ref()
    }

    fn set_document_url(&mut self, url: &Url) {
        self.document_url = Some(url.clone());
    }
}
