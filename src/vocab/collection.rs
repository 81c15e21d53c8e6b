//! Collection classes, paged and unpaged

use crate::error::Error;
use crate::vocab::object::{to_json_ld_with_context, Object};
use crate::vocab::value::{JsonLdNode, Refs, Resolver};
use crate::vocab::{activitystreams_context, resolve_slot, JsonLdMode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

/// The collection types of the ActivityStreams vocabulary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollectionKind {
    /// Unordered collection
    Collection,
    /// Ordered collection
    OrderedCollection,
    /// One page of an unordered collection
    CollectionPage,
    /// One page of an ordered collection
    OrderedCollectionPage,
}

impl CollectionKind {
    /// Parses a type name.
    pub fn from_name(name: &str) -> Option<CollectionKind> {
        match name {
            "Collection" => Some(CollectionKind::Collection),
            "OrderedCollection" => Some(CollectionKind::OrderedCollection),
            "CollectionPage" => Some(CollectionKind::CollectionPage),
            "OrderedCollectionPage" => Some(CollectionKind::OrderedCollectionPage),
            _ => None,
        }
    }

    /// True for the page types.
    pub fn is_page(self) -> bool {
        matches!(
            self,
            CollectionKind::CollectionPage | CollectionKind::OrderedCollectionPage
        )
    }
}

/// A possibly-paged sequence of objects.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collection {
    /// The collection's identifier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Url>,
    /// Collection type
    #[serde(rename = "type")]
    pub kind: CollectionKind,
    /// Total number of items across all pages
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_items: Option<u64>,
    /// Items of an unordered collection or page
    #[serde(default, skip_serializing_if = "Refs::is_empty")]
    pub items: Refs<Object>,
    /// Items of an ordered collection or page
    #[serde(default, skip_serializing_if = "Refs::is_empty")]
    pub ordered_items: Refs<Object>,
    /// First page
    #[serde(default, skip_serializing_if = "Refs::is_empty")]
    pub first: Refs<Collection>,
    /// Last page
    #[serde(default, skip_serializing_if = "Refs::is_empty")]
    pub last: Refs<Collection>,
    /// Next page
    #[serde(default, skip_serializing_if = "Refs::is_empty")]
    pub next: Refs<Collection>,
    /// Previous page
    #[serde(default, skip_serializing_if = "Refs::is_empty")]
    pub prev: Refs<Collection>,
    /// The collection a page belongs to
    #[serde(default, skip_serializing_if = "Refs::is_empty")]
    pub part_of: Refs<Collection>,

    #[serde(skip)]
    pub(crate) raw: Option<Value>,
    #[serde(skip)]
    pub(crate) document_url: Option<Url>,
}

impl Collection {
    /// An empty collection of the given type.
    pub fn new(kind: CollectionKind) -> Collection {
        Collection {
            id: None,
            kind,
            total_items: None,
            items: Refs::default(),
            ordered_items: Refs::default(),
            first: Refs::default(),
            last: Refs::default(),
            next: Refs::default(),
            prev: Refs::default(),
            part_of: Refs::default(),
            raw: None,
            document_url: None,
        }
    }

    /// Builds a collection from a JSON-LD document.
    pub fn from_json_ld(document: &Value) -> Result<Collection, Error> {
        let mut collection: Collection =
            serde_json::from_value(document.clone()).map_err(|e| Error::Parse(e.to_string()))?;
        collection.raw = Some(document.clone());
        Ok(collection)
    }

    /// The item slots, ordered or not.
    pub fn all_items(&self) -> &Refs<Object> {
        if self.ordered_items.is_empty() {
            &self.items
        } else {
            &self.ordered_items
        }
    }

    pub(crate) fn trust_origin(&self) -> Option<url::Origin> {
        self.id
            .as_ref()
            .or(self.document_url.as_ref())
            .map(Url::origin)
    }

    /// Resolves and returns the first page.
    pub async fn get_first(
        &mut self,
        resolver: &Resolver<'_>,
    ) -> Result<Option<&Collection>, Error> {
        let origin = self.trust_origin();
        if resolve_slot(&mut self.first, 0, origin, resolver, &mut self.raw).await? {
            Ok(self.first.get_object(0))
        } else {
            Ok(None)
        }
    }

    /// Resolves and returns the next page.
    pub async fn get_next(
        &mut self,
        resolver: &Resolver<'_>,
    ) -> Result<Option<&Collection>, Error> {
        let origin = self.trust_origin();
        if resolve_slot(&mut self.next, 0, origin, resolver, &mut self.raw).await? {
            Ok(self.next.get_object(0))
        } else {
            Ok(None)
        }
    }

    /// Resolves and returns the last page.
    pub async fn get_last(
        &mut self,
        resolver: &Resolver<'_>,
    ) -> Result<Option<&Collection>, Error> {
        let origin = self.trust_origin();
        if resolve_slot(&mut self.last, 0, origin, resolver, &mut self.raw).await? {
            Ok(self.last.get_object(0))
        } else {
            Ok(None)
        }
    }

    /// Resolves and returns the previous page.
    pub async fn get_prev(
        &mut self,
        resolver: &Resolver<'_>,
    ) -> Result<Option<&Collection>, Error> {
        let origin = self.trust_origin();
        if resolve_slot(&mut self.prev, 0, origin, resolver, &mut self.raw).await? {
            Ok(self.prev.get_object(0))
        } else {
            Ok(None)
        }
    }

    /// Resolves and returns the collection this page belongs to.
    pub async fn get_part_of(
        &mut self,
        resolver: &Resolver<'_>,
    ) -> Result<Option<&Collection>, Error> {
        let origin = self.trust_origin();
        if resolve_slot(&mut self.part_of, 0, origin, resolver, &mut self.raw).await? {
            Ok(self.part_of.get_object(0))
        } else {
            Ok(None)
        }
    }

    /// Resolves and returns the item at `index`.
    pub async fn get_item(
        &mut self,
        index: usize,
        resolver: &Resolver<'_>,
    ) -> Result<Option<&Object>, Error> {
        let origin = self.trust_origin();
        let refs = if self.ordered_items.is_empty() {
            &mut self.items
        } else {
            &mut self.ordered_items
        };
        if resolve_slot(refs, index, origin, resolver, &mut self.raw).await? {
            Ok(self.all_items().get_object(index))
        } else {
            Ok(None)
        }
    }

    /// Serialises the collection back to JSON-LD.
    pub fn to_json_ld(&self, mode: JsonLdMode) -> Result<Value, Error> {
        to_json_ld_with_context(self, &self.raw, mode, activitystreams_context())
    }
}

impl JsonLdNode for Collection {
    fn from_json_ld(document: &Value) -> Result<Self, Error> {
        Collection::from_json_ld(document)
    }

    fn node_id(&self) -> Option<&Url> {
        self.id.as_ref()
    }

    fn set_document_url(&mut self, url: &Url) {
        self.document_url = Some(url.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_ld() {
        let collection = Collection::from_json_ld(&json!({
            "id": "https://example.com/users/alice/followers",
            "type": "OrderedCollection",
            "totalItems": 3,
            "first": "https://example.com/users/alice/followers?page=1"
        }))
        .unwrap();
        assert_eq!(collection.kind, CollectionKind::OrderedCollection);
        assert_eq!(collection.total_items, Some(3));
        assert!(!collection.kind.is_page());
        assert_eq!(
            collection.first.first_id().unwrap().as_str(),
            "https://example.com/users/alice/followers?page=1"
        );
    }

    #[tokio::test]
    async fn test_get_last_and_part_of_resolve_lazily() {
        use crate::test_support::StaticLoader;
        use crate::vocab::value::Resolver;

        let loader = StaticLoader::new()
            .with(
                "https://example.com/c/page/9",
                json!({
                    "id": "https://example.com/c/page/9",
                    "type": "OrderedCollectionPage",
                    "partOf": "https://example.com/c",
                    "orderedItems": ["https://example.com/notes/99"]
                }),
            )
            .with(
                "https://example.com/c",
                json!({
                    "id": "https://example.com/c",
                    "type": "OrderedCollection",
                    "totalItems": 100
                }),
            );
        let resolver = Resolver::new(&loader);

        let mut collection = Collection::from_json_ld(&json!({
            "id": "https://example.com/c",
            "type": "OrderedCollection",
            "last": "https://example.com/c/page/9"
        }))
        .unwrap();
        let last = collection.get_last(&resolver).await.unwrap().unwrap();
        assert_eq!(last.all_items().len(), 1);

        let mut page = Collection::from_json_ld(&json!({
            "id": "https://example.com/c/page/9",
            "type": "OrderedCollectionPage",
            "partOf": "https://example.com/c"
        }))
        .unwrap();
        let parent = page.get_part_of(&resolver).await.unwrap().unwrap();
        assert_eq!(parent.total_items, Some(100));
    }

    #[test]
    fn test_all_items_prefers_ordered() {
        let page = Collection::from_json_ld(&json!({
            "type": "OrderedCollectionPage",
            "orderedItems": [
                "https://example.com/notes/1",
                {"id": "https://example.com/notes/2", "type": "Note"}
            ]
        }))
        .unwrap();
        assert_eq!(page.all_items().len(), 2);
        assert!(page.kind.is_page());
    }
}
