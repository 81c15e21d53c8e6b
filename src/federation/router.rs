//! The named route table over URI templates

use crate::error::Error;
use crate::template::{EncodingPolicy, MatchOptions, Template, VarMap, VarValue};
use url::Url;

/// Names of the routes a federation can register.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RouteName {
    /// `/.well-known/webfinger`
    WebFinger,
    /// `/.well-known/nodeinfo`
    NodeInfoWellKnown,
    /// The versioned NodeInfo document
    NodeInfo,
    /// Actor documents
    Actor,
    /// Object documents, per type id
    Object(String),
    /// Per-actor inbox (POST)
    Inbox,
    /// Shared inbox (POST)
    SharedInbox,
    /// Outbox collection
    Outbox,
    /// Following collection
    Following,
    /// Followers collection
    Followers,
    /// Liked collection
    Liked,
    /// Featured (pinned) collection
    Featured,
    /// Featured tags collection
    FeaturedTags,
    /// An application-defined collection
    Custom(String),
}

/// The routes registered with a federation.
///
/// Templates must capture unambiguously: no two routes may match the same
/// URL, which is probed at registration time.
#[derive(Clone, Debug, Default)]
pub struct Router {
    routes: Vec<(RouteName, Template)>,
}

impl Router {
    /// Creates an empty router.
    pub fn new() -> Router {
        Router::default()
    }

    /// Registers a route. Fails when the name is taken or when the
    /// template's capture overlaps an existing route.
    pub fn add(&mut self, name: RouteName, template: Template) -> Result<(), Error> {
        if self.routes.iter().any(|(n, _)| *n == name) {
            return Err(Error::Template(format!("route {name:?} is already registered")));
        }

        // Probe both ways with distinctive values: the new template must
        // not capture any existing route's expansion and vice versa.
        let probe = |t: &Template| {
            let vars: VarMap = t
                .var_names()
                .iter()
                .enumerate()
                .map(|(i, n)| ((*n).to_string(), VarValue::String(format!("probe{i}probe"))))
                .collect();
            t.expand(&vars)
        };
        let options = MatchOptions {
            policy: EncodingPolicy::Opaque,
            strict: false,
        };
        let new_probe = probe(&template)?;
        for (other_name, other) in &self.routes {
            if other.matches(&new_probe, &options).is_some()
                || template.matches(&probe(other)?, &options).is_some()
            {
                return Err(Error::Template(format!(
                    "route {name:?} ({}) is ambiguous with {other_name:?} ({})",
                    template.source(),
                    other.source(),
                )));
            }
        }

        self.routes.push((name, template));
        Ok(())
    }

    /// Matches a request path, returning the route and its variables
    /// (percent-decoded).
    pub fn route(&self, path: &str) -> Option<(&RouteName, VarMap)> {
        let options = MatchOptions {
            policy: EncodingPolicy::Cooked,
            strict: false,
        };
        self.routes
            .iter()
            .find_map(|(name, template)| template.matches(path, &options).map(|vars| (name, vars)))
    }

    /// The template registered under `name`.
    pub fn template(&self, name: &RouteName) -> Option<&Template> {
        self.routes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, t)| t)
    }

    /// Builds the URL for a route by reverse-applying its template
    /// against `base`. A missing registration is a routing error.
    pub fn url_for(&self, name: &RouteName, vars: &VarMap, base: &Url) -> Result<Url, Error> {
        let template = self
            .template(name)
            .ok_or(Error::Routing("route is not registered"))?;
        let path = template.expand(vars)?;
        base.join(&path).map_err(Error::UrlParse)
    }

    /// Whether any route is registered under `name`.
    pub fn has(&self, name: &RouteName) -> bool {
        self.template(name).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(s: &str) -> Template {
        Template::parse(s).unwrap()
    }

    #[test]
    fn test_route_and_url_for() {
        let mut router = Router::new();
        router.add(RouteName::Actor, template("/users/{identifier}")).unwrap();
        router.add(RouteName::Inbox, template("/users/{identifier}/inbox")).unwrap();

        let (name, vars) = router.route("/users/alice").unwrap();
        assert_eq!(*name, RouteName::Actor);
        assert_eq!(vars.get("identifier").unwrap().as_str(), Some("alice"));

        let (name, _) = router.route("/users/alice/inbox").unwrap();
        assert_eq!(*name, RouteName::Inbox);

        assert!(router.route("/other").is_none());

        let base = Url::parse("https://example.com/").unwrap();
        let vars: VarMap = [("identifier".to_string(), VarValue::from("alice"))].into();
        assert_eq!(
            router.url_for(&RouteName::Actor, &vars, &base).unwrap().as_str(),
            "https://example.com/users/alice"
        );
        assert!(matches!(
            router.url_for(&RouteName::Outbox, &vars, &base),
            Err(Error::Routing(_))
        ));
    }

    #[test]
    fn test_percent_decoded_identifiers() {
        let mut router = Router::new();
        router.add(RouteName::Actor, template("/users/{identifier}")).unwrap();

        let (_, vars) = router.route("/users/caf%C3%A9").unwrap();
        assert_eq!(vars.get("identifier").unwrap().as_str(), Some("café"));
    }

    #[test]
    fn test_ambiguous_routes_rejected() {
        let mut router = Router::new();
        router.add(RouteName::Actor, template("/users/{identifier}")).unwrap();

        // Same capture shape under a different name.
        let result = router.add(RouteName::Outbox, template("/users/{id}"));
        assert!(result.is_err());

        // Same name twice.
        let mut router = Router::new();
        router.add(RouteName::Actor, template("/users/{identifier}")).unwrap();
        assert!(router.add(RouteName::Actor, template("/people/{identifier}")).is_err());

        // Distinct literals are fine.
        let mut router = Router::new();
        router.add(RouteName::Actor, template("/users/{identifier}")).unwrap();
        router.add(RouteName::Outbox, template("/users/{identifier}/outbox")).unwrap();
    }

    #[test]
    fn test_object_routes_per_type() {
        let mut router = Router::new();
        router
            .add(RouteName::Object("Note".to_string()), template("/notes/{id}"))
            .unwrap();
        router
            .add(RouteName::Object("Article".to_string()), template("/articles/{id}"))
            .unwrap();

        let (name, vars) = router.route("/notes/42").unwrap();
        assert_eq!(*name, RouteName::Object("Note".to_string()));
        assert_eq!(vars.get("id").unwrap().as_str(), Some("42"));
    }
}
