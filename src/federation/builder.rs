//! Registering dispatchers and listeners, and building the federation

use crate::config::FederationConfig;
use crate::error::Error;
use crate::federation::router::{RouteName, Router};
use crate::federation::{Federation, FederationInner};
use crate::fetch::nodeinfo::NodeInfo;
use crate::signatures::SigningKey;
use crate::template::{Template, VarMap};
use crate::vocab::object::Object;
use crate::vocab::value::Ref;
use crate::vocab::{Activity, ActivityKind, Actor};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::context::Context;

/// One page of a dispatched collection.
#[derive(Debug, Default)]
pub struct CollectionPage {
    /// Items of this page, in source order
    pub items: Vec<Ref<Object>>,
    /// Cursor of the following page
    pub next_cursor: Option<String>,
    /// Cursor of the preceding page
    pub prev_cursor: Option<String>,
}

/// Produces actor documents for the actor route.
#[async_trait]
pub trait ActorDispatcher<T: Clone>: Send + Sync {
    /// Returns the actor for `identifier`, or `None` when it does not
    /// exist. The pipeline fills in registered URIs (inbox, outbox,
    /// collections) and signing keys the dispatcher leaves unset.
    async fn dispatch(&self, ctx: &Context<T>, identifier: &str) -> Result<Option<Actor>, Error>;
}

/// Produces object documents for an object route.
#[async_trait]
pub trait ObjectDispatcher<T: Clone>: Send + Sync {
    /// Returns the object for the route's matched variables.
    async fn dispatch(&self, ctx: &Context<T>, values: &VarMap) -> Result<Option<Object>, Error>;
}

/// Produces collection indexes and pages for a collection route.
#[async_trait]
pub trait CollectionDispatcher<T: Clone>: Send + Sync {
    /// Total number of items, for the collection index.
    async fn count(&self, _ctx: &Context<T>, _identifier: &str) -> Result<Option<u64>, Error> {
        Ok(None)
    }

    /// Cursor of the first page.
    async fn first_cursor(
        &self,
        _ctx: &Context<T>,
        _identifier: &str,
    ) -> Result<Option<String>, Error> {
        Ok(None)
    }

    /// Cursor of the last page.
    async fn last_cursor(
        &self,
        _ctx: &Context<T>,
        _identifier: &str,
    ) -> Result<Option<String>, Error> {
        Ok(None)
    }

    /// One page of the collection. A `None` cursor asks for the unpaged
    /// item list of collections small enough not to page.
    async fn page(
        &self,
        ctx: &Context<T>,
        identifier: &str,
        cursor: Option<&str>,
    ) -> Result<Option<CollectionPage>, Error>;
}

/// Supplies the signing keys of a local actor.
#[async_trait]
pub trait KeyPairsDispatcher<T: Clone>: Send + Sync {
    /// Private keys for `identifier`, main key first.
    async fn dispatch(&self, ctx: &Context<T>, identifier: &str) -> Result<Vec<SigningKey>, Error>;
}

/// Guards dispatched documents behind an application predicate.
#[async_trait]
pub trait AuthorizePredicate<T: Clone>: Send + Sync {
    /// Whether the current request may see the dispatched document.
    async fn authorize(&self, ctx: &Context<T>, identifier: Option<&str>) -> Result<bool, Error>;
}

/// Handles one kind of incoming activity.
#[async_trait]
pub trait InboxListener<T: Clone>: Send + Sync {
    /// Called for each accepted activity of the registered kind.
    async fn handle(&self, ctx: &Context<T>, activity: Activity) -> Result<(), Error>;
}

/// Receives errors thrown by inbox listeners.
#[async_trait]
pub trait InboxErrorHandler<T: Clone>: Send + Sync {
    /// Called with every listener error; must not panic.
    async fn handle(&self, ctx: &Context<T>, error: &Error);
}

/// Produces the NodeInfo document of this server.
#[async_trait]
pub trait NodeInfoDispatcher<T: Clone>: Send + Sync {
    /// The document served under the versioned NodeInfo route.
    async fn dispatch(&self, ctx: &Context<T>) -> Result<NodeInfo, Error>;
}

/// Maps WebFinger user names to actor identifiers.
#[async_trait]
pub trait HandleMapper<T: Clone>: Send + Sync {
    /// The identifier behind `username`, or `None` when unknown.
    async fn map(&self, ctx: &Context<T>, username: &str) -> Result<Option<String>, Error>;
}

/// Names the local actor whose keys sign shared-inbox lookups.
#[async_trait]
pub trait SharedKeyDispatcher<T: Clone>: Send + Sync {
    /// Identifier of the instance actor, or `None` to fetch unsigned.
    async fn dispatch(&self, ctx: &Context<T>) -> Result<Option<String>, Error>;
}

/// Everything the application registered, frozen at build time.
pub(crate) struct Registrations<T: Clone> {
    pub(crate) router: Router,
    pub(crate) actor_dispatcher: Option<Arc<dyn ActorDispatcher<T>>>,
    pub(crate) key_pairs_dispatcher: Option<Arc<dyn KeyPairsDispatcher<T>>>,
    pub(crate) authorize: Option<Arc<dyn AuthorizePredicate<T>>>,
    pub(crate) handle_mapper: Option<Arc<dyn HandleMapper<T>>>,
    pub(crate) object_dispatchers: HashMap<String, Arc<dyn ObjectDispatcher<T>>>,
    pub(crate) collection_dispatchers: HashMap<RouteName, Arc<dyn CollectionDispatcher<T>>>,
    pub(crate) listeners: Vec<(ActivityKind, Arc<dyn InboxListener<T>>)>,
    pub(crate) inbox_error: Option<Arc<dyn InboxErrorHandler<T>>>,
    pub(crate) shared_key: Option<Arc<dyn SharedKeyDispatcher<T>>>,
    pub(crate) nodeinfo: Option<Arc<dyn NodeInfoDispatcher<T>>>,
}

impl<T: Clone> Default for Registrations<T> {
    fn default() -> Self {
        Registrations {
            router: Router::new(),
            actor_dispatcher: None,
            key_pairs_dispatcher: None,
            authorize: None,
            handle_mapper: None,
            object_dispatchers: HashMap::new(),
            collection_dispatchers: HashMap::new(),
            listeners: Vec::new(),
            inbox_error: None,
            shared_key: None,
            nodeinfo: None,
        }
    }
}

/// Accumulates registrations; [FederationBuilder::build] produces the
/// immutable [Federation].
pub struct FederationBuilder<T: Clone> {
    registrations: Registrations<T>,
}

impl<T: Clone + Send + Sync + 'static> Default for FederationBuilder<T> {
    fn default() -> Self {
        FederationBuilder::new()
    }
}

impl<T: Clone + Send + Sync + 'static> FederationBuilder<T> {
    /// Creates an empty builder.
    pub fn new() -> FederationBuilder<T> {
        FederationBuilder {
            registrations: Registrations::default(),
        }
    }

    fn add_route(mut self, name: RouteName, template: &str) -> Result<Self, Error> {
        self.registrations.router.add(name, Template::parse(template)?)?;
        Ok(self)
    }

    /// Registers the actor route and its dispatcher. The template must
    /// capture an `identifier` variable.
    pub fn actor_dispatcher(
        mut self,
        template: &str,
        dispatcher: Arc<dyn ActorDispatcher<T>>,
    ) -> Result<Self, Error> {
        let template = Template::parse(template)?;
        if !template.var_names().contains(&"identifier") {
            return Err(Error::Template(
                "actor template must capture {identifier}".to_string(),
            ));
        }
        self.registrations.router.add(RouteName::Actor, template)?;
        self.registrations.actor_dispatcher = Some(dispatcher);
        Ok(self)
    }

    /// Registers the key-pairs dispatcher used for signing.
    pub fn key_pairs_dispatcher(mut self, dispatcher: Arc<dyn KeyPairsDispatcher<T>>) -> Self {
        self.registrations.key_pairs_dispatcher = Some(dispatcher);
        self
    }

    /// Registers an authorize predicate guarding dispatched documents.
    pub fn authorize(mut self, predicate: Arc<dyn AuthorizePredicate<T>>) -> Self {
        self.registrations.authorize = Some(predicate);
        self
    }

    /// Registers a mapper from WebFinger user names to identifiers.
    pub fn handle_mapper(mut self, mapper: Arc<dyn HandleMapper<T>>) -> Self {
        self.registrations.handle_mapper = Some(mapper);
        self
    }

    /// Registers an object route for one type id.
    pub fn object_dispatcher(
        mut self,
        type_id: &str,
        template: &str,
        dispatcher: Arc<dyn ObjectDispatcher<T>>,
    ) -> Result<Self, Error> {
        self = self.add_route(RouteName::Object(type_id.to_string()), template)?;
        self.registrations
            .object_dispatchers
            .insert(type_id.to_string(), dispatcher);
        Ok(self)
    }

    /// Registers the per-actor inbox route, and optionally the shared
    /// inbox route.
    pub fn inbox(mut self, template: &str, shared_template: Option<&str>) -> Result<Self, Error> {
        self = self.add_route(RouteName::Inbox, template)?;
        if let Some(shared) = shared_template {
            self = self.add_route(RouteName::SharedInbox, shared)?;
        }
        Ok(self)
    }

    /// Registers a listener for one activity kind. Listeners registered
    /// for a supertype also receive its subtypes when no more specific
    /// listener exists.
    pub fn on(mut self, kind: ActivityKind, listener: Arc<dyn InboxListener<T>>) -> Self {
        self.registrations.listeners.push((kind, listener));
        self
    }

    /// Registers one of the standard collection routes (outbox,
    /// followers, ...) or a custom collection.
    pub fn collection_dispatcher(
        mut self,
        name: RouteName,
        template: &str,
        dispatcher: Arc<dyn CollectionDispatcher<T>>,
    ) -> Result<Self, Error> {
        match name {
            RouteName::Outbox
            | RouteName::Following
            | RouteName::Followers
            | RouteName::Liked
            | RouteName::Featured
            | RouteName::FeaturedTags
            | RouteName::Custom(_) => {}
            _ => {
                return Err(Error::Template(format!(
                    "{name:?} is not a collection route"
                )));
            }
        }
        self = self.add_route(name.clone(), template)?;
        self.registrations.collection_dispatchers.insert(name, dispatcher);
        Ok(self)
    }

    /// Registers the NodeInfo routes and dispatcher.
    pub fn nodeinfo_dispatcher(
        mut self,
        template: &str,
        dispatcher: Arc<dyn NodeInfoDispatcher<T>>,
    ) -> Result<Self, Error> {
        self = self.add_route(RouteName::NodeInfo, template)?;
        self.registrations.nodeinfo = Some(dispatcher);
        Ok(self)
    }

    /// Registers the inbox error callback.
    pub fn on_inbox_error(mut self, handler: Arc<dyn InboxErrorHandler<T>>) -> Self {
        self.registrations.inbox_error = Some(handler);
        self
    }

    /// Registers the shared-key dispatcher for signed lookups from the
    /// shared inbox.
    pub fn shared_key_dispatcher(mut self, dispatcher: Arc<dyn SharedKeyDispatcher<T>>) -> Self {
        self.registrations.shared_key = Some(dispatcher);
        self
    }

    /// Freezes the registrations into an immutable federation.
    pub fn build(mut self, config: FederationConfig<T>) -> Result<Federation<T>, Error> {
        // Well-known routes come with the features that serve them.
        if self.registrations.actor_dispatcher.is_some() {
            self = self.add_route(RouteName::WebFinger, "/.well-known/webfinger")?;
        }
        if self.registrations.nodeinfo.is_some() {
            self = self.add_route(RouteName::NodeInfoWellKnown, "/.well-known/nodeinfo")?;
        }
        Ok(Federation {
            inner: Arc::new(FederationInner {
                config,
                registrations: self.registrations,
            }),
        })
    }
}
