//! Error messages returned by this library

use http::StatusCode;
use url::Url;

/// Error messages returned by this library
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Url has a forbidden scheme or points at a private address
    #[error("URL failed verification: {0}")]
    Url(&'static str),
    /// Remote server returned a non-success status
    #[error("Failed to fetch {url}: status {status}")]
    Fetch {
        /// Url which was fetched
        url: Box<Url>,
        /// Status code returned by the remote server
        status: StatusCode,
    },
    /// Remote document could not be parsed as the requested class
    #[error("Failed to parse remote document: {0}")]
    Parse(String),
    /// Incoming request has a missing, malformed or invalid HTTP signature
    #[error("Request signature could not be verified: {0}")]
    Signature(&'static str),
    /// Incoming request body does not match its digest header
    #[error("Request body digest does not match")]
    DigestMismatch,
    /// No route registered under the requested name
    #[error("No route registered for {0}")]
    Routing(&'static str),
    /// The authorize predicate rejected the request
    #[error("Request is not authorized")]
    Unauthorized,
    /// Content negotiation failed
    #[error("No acceptable content type")]
    NotAcceptable,
    /// A cancellation token fired before the operation completed
    #[error("Operation was cancelled")]
    Cancelled,
    /// Object was not found
    #[error("Object was not found")]
    NotFound,
    /// Request limit was reached during fetch
    #[error("Request limit was reached during fetch")]
    RequestLimit,
    /// Response body limit was reached during fetch
    #[error("Response body limit was reached during fetch")]
    ResponseBodyLimit,
    /// Object to be fetched was deleted
    #[error("Object to be fetched was deleted")]
    ObjectDeleted,
    /// The key-value store failed
    #[error("Key-value store error: {0}")]
    Kv(String),
    /// The message queue failed
    #[error("Message queue error: {0}")]
    Queue(String),
    /// A URI template could not be parsed or expanded
    #[error("Invalid URI template: {0}")]
    Template(String),
    /// Failed to resolve an identifier via webfinger
    #[error("Failed to resolve actor via webfinger")]
    WebfingerResolveFailed,
    /// Activity failed to serialize or deserialize
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// A url failed to parse
    #[error(transparent)]
    UrlParse(#[from] url::ParseError),
    /// Other errors which are not explicitly handled
    #[error("{0}")]
    Other(String),
}

impl Error {
    pub(crate) fn other<T>(error: T) -> Self
    where
        T: std::fmt::Display,
    {
        Error::Other(error.to_string())
    }

    pub(crate) fn fetch(url: &Url, status: StatusCode) -> Self {
        Error::Fetch {
            url: Box::new(url.clone()),
            status,
        }
    }

    /// Maps the error to the HTTP status the request pipeline responds with.
    ///
    /// `NotFound` and `Routing` have no status here; the router returns its
    /// not-found sentinel for those so the caller can delegate to its own
    /// framework.
    pub(crate) fn status(&self) -> Option<StatusCode> {
        match self {
            Error::Signature(_) | Error::DigestMismatch | Error::Unauthorized => {
                Some(StatusCode::UNAUTHORIZED)
            }
            Error::NotAcceptable => Some(StatusCode::NOT_ACCEPTABLE),
            Error::Parse(_) | Error::Json(_) => Some(StatusCode::BAD_REQUEST),
            Error::Fetch { .. } | Error::Url(_) => Some(StatusCode::BAD_GATEWAY),
            Error::Cancelled => Some(StatusCode::REQUEST_TIMEOUT),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        Error::other(error)
    }
}

impl From<reqwest_middleware::Error> for Error {
    fn from(error: reqwest_middleware::Error) -> Self {
        Error::other(error)
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}
