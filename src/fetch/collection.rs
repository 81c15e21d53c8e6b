//! Traversing paged collections

use crate::error::Error;
use crate::fetch::loader::DocumentLoader;
use crate::vocab::collection::Collection;
use crate::vocab::object::Object;
use crate::vocab::value::Ref;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Options for [traverse_collection].
pub struct TraverseOptions<'a> {
    /// Loader used for page fetches
    pub loader: &'a dyn DocumentLoader,
    /// Politeness pause between page fetches
    pub interval: Option<Duration>,
    /// Skip unloadable pages and malformed items instead of failing
    pub suppress_error: bool,
}

/// A pull-based iterator over every item of a possibly-paged collection.
///
/// Items surface in source order, as the reference or embedded object the
/// page carried; no per-item fetches happen. The iterator is finite and
/// not restartable: each `next` page cursor is consumed as traversal
/// moves past it.
pub struct CollectionTraversal<'a> {
    options: TraverseOptions<'a>,
    buffer: Vec<Ref<Object>>,
    position: usize,
    next_page: Option<Url>,
    first_fetch_done: bool,
    done: bool,
}

/// Starts traversing `collection`.
pub fn traverse_collection<'a>(
    collection: &Collection,
    options: TraverseOptions<'a>,
) -> CollectionTraversal<'a> {
    let inline: Vec<Ref<Object>> = collection.all_items().entries().to_vec();
    let next_page = if inline.is_empty() {
        collection.first.first_id().cloned()
    } else {
        None
    };
    CollectionTraversal {
        options,
        buffer: inline,
        position: 0,
        next_page,
        first_fetch_done: false,
        done: false,
    }
}

impl CollectionTraversal<'_> {
    /// The next item, or `None` at the end of the collection.
    ///
    /// May fetch the next page. With `suppress_error` set, an unloadable
    /// page ends the traversal instead of failing it.
    pub async fn next(&mut self) -> Result<Option<Ref<Object>>, Error> {
        loop {
            if self.position < self.buffer.len() {
                let item = self.buffer[self.position].clone();
                self.position += 1;
                return Ok(Some(item));
            }
            if self.done {
                return Ok(None);
            }
            let Some(url) = self.next_page.take() else {
                self.done = true;
                return Ok(None);
            };

            if self.first_fetch_done {
                if let Some(interval) = self.options.interval {
                    tokio::time::sleep(interval).await;
                }
            }
            self.first_fetch_done = true;

            match self.load_page(&url).await {
                Ok(page) => {
                    self.buffer = page.all_items().entries().to_vec();
                    self.position = 0;
                    self.next_page = page.next.first_id().cloned();
                }
                Err(error) if self.options.suppress_error => {
                    debug!("Skipping unloadable collection page {url}: {error}");
                    self.done = true;
                    return Ok(None);
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn load_page(&self, url: &Url) -> Result<Collection, Error> {
        let document = self.options.loader.load(url).await?;
        let mut page = Collection::from_json_ld(&document.document)?;
        page.document_url = Some(document.document_url.clone());
        Ok(page)
    }

    /// Drains the traversal into a vector.
    pub async fn collect_all(mut self) -> Result<Vec<Ref<Object>>, Error> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await? {
            items.push(item);
        }
        Ok(items)
    }
}
