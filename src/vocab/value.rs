//! Property values of vocabulary objects
//!
//! A property slot holds either a fully resolved object or a bare URL
//! reference. [Refs] keeps the slots together with a per-index trust bit
//! recording whether the object at that index was loaded from the same
//! origin as its holder.

use crate::error::Error;
use crate::fetch::loader::DocumentLoader;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

/// A string paired with a BCP-47 language tag.
///
/// Equality compares the value and the base (primary) subtag, so
/// `en` and `en-US` renditions of the same string are equal.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LanguageString {
    /// The string value
    pub value: String,
    /// BCP-47 locale tag
    pub language: String,
}

impl LanguageString {
    /// Creates a tagged string.
    pub fn new<V: Into<String>, L: Into<String>>(value: V, language: L) -> LanguageString {
        LanguageString {
            value: value.into(),
            language: language.into(),
        }
    }

    /// The primary subtag, e.g. `en` for `en-US`.
    pub fn base_language(&self) -> &str {
        self.language.split('-').next().unwrap_or(&self.language)
    }
}

impl PartialEq for LanguageString {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value && self.base_language() == other.base_language()
    }
}

impl Eq for LanguageString {}

/// Objects which can be built from a JSON-LD document and resolved lazily.
pub trait JsonLdNode: DeserializeOwned + Send + Sync {
    /// Builds the object from a JSON-LD document, memoising the raw
    /// document for [raw](crate::vocab::JsonLdMode::Raw) serialisation.
    fn from_json_ld(document: &Value) -> Result<Self, Error>;

    /// The object's `id`, when present.
    fn node_id(&self) -> Option<&Url>;

    /// Records the URL the document was loaded from.
    fn set_document_url(&mut self, url: &Url);
}

/// How a lazy accessor treats a child whose `id` has a different origin
/// than the document it came from and the holder's own `id`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CrossOriginPolicy {
    /// Skip the element (functional accessors return `None`)
    #[default]
    Ignore,
    /// Fail the accessor
    Throw,
    /// Accept the element as-is
    Trust,
}

/// Resolves URL references into objects.
pub struct Resolver<'a> {
    /// Loader used to fetch referenced documents
    pub loader: &'a dyn DocumentLoader,
    /// Cross-origin handling for resolved children
    pub policy: CrossOriginPolicy,
}

impl<'a> Resolver<'a> {
    /// A resolver with the default [CrossOriginPolicy::Ignore] policy.
    pub fn new(loader: &'a dyn DocumentLoader) -> Resolver<'a> {
        Resolver {
            loader,
            policy: CrossOriginPolicy::default(),
        }
    }
}

/// One property slot: a reference or a resolved object.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Ref<T> {
    /// Bare URL reference
    Url(Url),
    /// Resolved or embedded object
    Obj(Box<T>),
}

/// The slots of one property, with per-index trust bits.
#[derive(Clone, Debug)]
pub struct Refs<T> {
    entries: Vec<Ref<T>>,
    trusted: Vec<bool>,
}

impl<T> Default for Refs<T> {
    fn default() -> Self {
        Refs {
            entries: Vec::new(),
            trusted: Vec::new(),
        }
    }
}

impl<T> Refs<T> {
    /// A property holding a single URL reference.
    pub fn url(url: Url) -> Refs<T> {
        Refs {
            entries: vec![Ref::Url(url)],
            trusted: vec![false],
        }
    }

    /// A property built from already-collected slots.
    pub fn from_entries(entries: Vec<Ref<T>>) -> Refs<T> {
        let trusted = vec![false; entries.len()];
        Refs { entries, trusted }
    }

    /// A property holding a single resolved object.
    pub fn object(object: T) -> Refs<T> {
        Refs {
            entries: vec![Ref::Obj(Box::new(object))],
            trusted: vec![true],
        }
    }

    /// True when the property has no values.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of values.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// The raw slots.
    pub fn entries(&self) -> &[Ref<T>] {
        &self.entries
    }

    /// Appends a slot.
    pub fn push(&mut self, entry: Ref<T>) {
        self.entries.push(entry);
        self.trusted.push(false);
    }

    /// The object at `index`, if that slot is resolved.
    pub fn get_object(&self, index: usize) -> Option<&T> {
        match self.entries.get(index) {
            Some(Ref::Obj(object)) => Some(object),
            _ => None,
        }
    }

    /// Whether the object at `index` was loaded from the holder's origin.
    pub fn is_trusted(&self, index: usize) -> bool {
        self.trusted.get(index).copied().unwrap_or(false)
    }
}

impl<T: JsonLdNode> Refs<T> {
    /// URLs of all values; resolved objects are coerced to their `id`.
    pub fn ids(&self) -> Vec<&Url> {
        self.entries
            .iter()
            .filter_map(|entry| match entry {
                Ref::Url(url) => Some(url),
                Ref::Obj(object) => object.node_id(),
            })
            .collect()
    }

    /// The first value's URL.
    pub fn first_id(&self) -> Option<&Url> {
        self.ids().into_iter().next()
    }

    /// Resolves the slot at `index` in place.
    ///
    /// A trusted slot is never rechecked. Cross-origin children are
    /// handled per the resolver's policy: `Ignore` skips the slot,
    /// `Throw` fails, `Trust` resolves without setting the trust bit.
    /// On [Resolved::Fetched] callers must drop their memoised raw form.
    pub async fn resolve(
        &mut self,
        index: usize,
        holder_origin: Option<&url::Origin>,
        resolver: &Resolver<'_>,
    ) -> Result<Resolved, Error> {
        let Some(entry) = self.entries.get_mut(index) else {
            return Ok(Resolved::Skipped);
        };
        match entry {
            Ref::Obj(object) => {
                if self.trusted[index] {
                    return Ok(Resolved::Present);
                }
                // Embedded object: judge it against the holder's origin.
                let same_origin = match (object.node_id(), holder_origin) {
                    (Some(id), Some(origin)) => id.origin() == *origin,
                    (None, _) => true,
                    _ => false,
                };
                if same_origin {
                    self.trusted[index] = true;
                    return Ok(Resolved::Present);
                }
                match resolver.policy {
                    CrossOriginPolicy::Trust => Ok(Resolved::Present),
                    CrossOriginPolicy::Ignore => Ok(Resolved::Skipped),
                    CrossOriginPolicy::Throw => {
                        Err(Error::Url("embedded object has a different origin"))
                    }
                }
            }
            Ref::Url(url) => {
                let url = url.clone();
                let document = resolver.loader.load(&url).await?;
                let mut object = T::from_json_ld(&document.document)?;
                object.set_document_url(&document.document_url);

                let document_origin = document.document_url.origin();
                let id_origin = object.node_id().map(Url::origin);
                let same_origin = match &id_origin {
                    Some(id_origin) => {
                        *id_origin == document_origin
                            || holder_origin.map(|o| id_origin == o).unwrap_or(false)
                    }
                    // An id-less child cannot be cross-checked; treat it as
                    // belonging to the document that carried it.
                    None => true,
                };

                if !same_origin {
                    match resolver.policy {
                        CrossOriginPolicy::Ignore => return Ok(Resolved::Skipped),
                        CrossOriginPolicy::Throw => {
                            return Err(Error::Url("object id has a different origin"));
                        }
                        CrossOriginPolicy::Trust => {}
                    }
                }

                self.entries[index] = Ref::Obj(Box::new(object));
                self.trusted[index] = same_origin;
                Ok(Resolved::Fetched)
            }
        }
    }
}

/// Outcome of [Refs::resolve].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolved {
    /// The slot now holds a freshly fetched object
    Fetched,
    /// The slot already held an acceptable object
    Present,
    /// The slot is absent or was skipped by the cross-origin policy
    Skipped,
}

impl<T: Serialize> Serialize for Refs<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.entries.len() == 1 {
            self.entries[0].serialize(serializer)
        } else {
            self.entries.serialize(serializer)
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Refs<T> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum OneOrMany<T> {
            One(Ref<T>),
            Many(Vec<Ref<T>>),
        }

        let entries = match OneOrMany::deserialize(deserializer)? {
            OneOrMany::One(entry) => vec![entry],
            OneOrMany::Many(entries) => entries,
        };
        let trusted = vec![false; entries.len()];
        Ok(Refs { entries, trusted })
    }
}

/// Deserializes a single value or an array into a `Vec`.
pub(crate) fn deserialize_one_or_many<'de, T, D>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    T: Deserialize<'de>,
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany<T> {
        One(T),
        Many(Vec<T>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(value) => vec![value],
        OneOrMany::Many(values) => values,
    })
}

/// Serialises a single-element `Vec` without its array wrapper, matching
/// the compact form most fediverse software emits.
pub(crate) fn serialize_one_or_many<T, S>(values: &[T], serializer: S) -> Result<S::Ok, S::Error>
where
    T: Serialize,
    S: serde::Serializer,
{
    if values.len() == 1 {
        values[0].serialize(serializer)
    } else {
        values.serialize(serializer)
    }
}

/// Deserializes a value, falling back to the default on shape mismatch.
/// Use together with `#[serde(default)]` for fields other platforms send
/// with incompatible types.
pub(crate) fn deserialize_skip_error<'de, T, D>(deserializer: D) -> Result<T, D::Error>
where
    T: Deserialize<'de> + Default,
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(T::deserialize(value).unwrap_or_default())
}
