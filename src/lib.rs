//! A server-side framework for participating in the ActivityPub
//! federation: expose actors, objects and collections at stable URLs,
//! receive activities at inboxes, and reliably deliver outgoing
//! activities to remote inboxes.
//!
//! The pieces fit together like this: [federation::FederationBuilder]
//! accumulates dispatcher and listener registrations and freezes them
//! into a [federation::Federation]. Inbound HTTP requests go through
//! [federation::Federation::handle], which routes them by URI template
//! to actor/object/collection dispatchers or the inbox pipeline; the
//! inbox verifies HTTP signatures (draft-cavage and RFC 9421 both),
//! deduplicates by activity id and dispatches by activity type. Outbound
//! activities go through `Context::send_activity`, which fans out to
//! per-inbox deliveries over the [queue::MessageQueue], signing each
//! request and double-knocking against servers whose signature dialect
//! is not yet known. All remote reads flow through a cached, private-
//! address-guarded JSON-LD document loader.
#![deny(missing_docs)]

/// Caching wrapper for the document loader
pub mod cache;
/// Configuration for this library
pub mod config;
/// Bundled JSON-LD contexts
pub mod contexts;
/// Contexts handed to application callbacks
pub mod context;
/// Error messages returned by this library
pub mod error;
/// Builder, router and request pipeline
pub mod federation;
/// Fetching remote documents, actors and collections
pub mod fetch;
/// Receiving incoming activities
pub mod inbox;
/// Key-value storage abstraction
pub mod kv;
/// Message queue abstraction
pub mod queue;
/// Fan-out and delivery of outgoing activities
pub mod sending;
/// HTTP signatures, both suites
pub mod signatures;
/// URI templates (RFC 6570)
pub mod template;
/// Typed ActivityStreams vocabulary
pub mod vocab;

/// Axum integration
#[cfg(feature = "axum")]
pub mod axum;

#[cfg(test)]
pub(crate) mod test_support;

pub use activitystreams_kinds as kinds;

/// Mime type for Activitypub, used for `Accept` and `Content-Type` HTTP
/// headers
pub static FEDERATION_CONTENT_TYPE: &str = "application/activity+json";
