//! In-process fakes shared by the unit tests

use crate::error::Error;
use crate::fetch::loader::{DocumentLoader, RemoteDocument};
use async_trait::async_trait;
use http::StatusCode;
use serde_json::Value;
use std::collections::HashMap;
use url::Url;

/// A loader serving documents from a fixed map; everything else is a 404.
pub(crate) struct StaticLoader {
    documents: HashMap<String, Value>,
}

impl StaticLoader {
    pub(crate) fn new() -> StaticLoader {
        StaticLoader {
            documents: HashMap::new(),
        }
    }

    pub(crate) fn with(mut self, url: &str, document: Value) -> StaticLoader {
        self.documents.insert(url.to_string(), document);
        self
    }
}

#[async_trait]
impl DocumentLoader for StaticLoader {
    async fn load(&self, url: &Url) -> Result<RemoteDocument, Error> {
        match self.documents.get(url.as_str()) {
            Some(document) => Ok(RemoteDocument {
                document_url: url.clone(),
                context_url: None,
                document: document.clone(),
            }),
            None => Err(Error::fetch(url, StatusCode::NOT_FOUND)),
        }
    }
}
