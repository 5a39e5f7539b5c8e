// Log Timings - Map access log request timings to web application routes
//
// Copyright 2018 TSH Labs
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

//! Memoizing URL to route resolution.

use crate::types::{HandlerInfo, LogTimingsError, LogTimingsResult, ResolvedRoute, RouteArguments};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use tracing::warn;

const DECORATOR_SEGMENTS: &[&str] = &["decorator", "decorators"];

/// Result of successfully matching a URL against a routing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch<H> {
    /// Name of the route, `None` if the route was declared without one
    pub url_name: Option<String>,
    /// Application namespace the route belongs to, if any
    pub app_name: Option<String>,
    pub arguments: RouteArguments,
    /// Resolver specific reference to the function handling the route
    pub handler: H,
}

impl<H> RouteMatch<H> {
    /// Route name qualified by the application namespace, e.g. `admin.index`.
    pub fn qualified_name(&self) -> Option<String> {
        let name = self.url_name.as_ref().filter(|n| !n.is_empty())?;
        Some(match self.app_name {
            Some(ref app) if !app.is_empty() => format!("{}.{}", app, name),
            _ => name.clone(),
        })
    }
}

/// Something that knows how a web application maps URLs to routes.
pub trait UrlResolver {
    type Handler;

    /// Find the route that would handle `url`, or `None` if no route would.
    fn resolve(&self, url: &str) -> Option<RouteMatch<Self::Handler>>;

    /// Describe the function that handles a matched route as introspection
    /// would see it, which may be a wrapper installed by a decorator rather
    /// than the function that was registered.
    fn describe_handler(&self, handler: &Self::Handler) -> HandlerInfo;
}

/// Counters describing how the cache has been used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub known_bad: u64,
    pub resolver_calls: u64,
    pub decorator_warnings: u64,
}

/// Cache of URL resolution results in front of a `UrlResolver`.
///
/// Every URL passed to `.resolve()` ends up in exactly one of two sets:
/// URLs that resolved (and the route they resolved to) or URLs that did
/// not. Neither set is ever retried. An optional capacity limits the size
/// of each set, once full new URLs are resolved without being remembered.
#[derive(Debug)]
pub struct RouteCache<R> {
    resolver: R,
    cached_urls: HashMap<String, Rc<ResolvedRoute>>,
    bad_urls: HashSet<String>,
    warned_decorators: HashSet<String>,
    capacity: Option<usize>,
    stats: CacheStats,
}

impl<R> RouteCache<R>
where
    R: UrlResolver,
{
    pub fn new(resolver: R) -> Self {
        Self::with_capacity(resolver, None)
    }

    pub fn with_capacity(resolver: R, capacity: Option<usize>) -> Self {
        RouteCache {
            resolver,
            cached_urls: HashMap::new(),
            bad_urls: HashSet::new(),
            warned_decorators: HashSet::new(),
            capacity,
            stats: CacheStats::default(),
        }
    }

    pub fn resolver(&self) -> &R {
        &self.resolver
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Number of distinct URLs known not to resolve.
    pub fn unresolved_count(&self) -> usize {
        self.bad_urls.len()
    }

    /// Number of distinct URLs resolved and remembered.
    pub fn resolved_count(&self) -> usize {
        self.cached_urls.len()
    }

    pub fn is_warned(&self, name: &str) -> bool {
        self.warned_decorators.contains(name)
    }

    /// Resolve `url` to a route, trying a few tricks for URLs that have been
    /// mangled on their way into the log.
    ///
    /// An extra leading slash is removed first. If the URL still doesn't
    /// resolve, the query string is dropped and resolution is attempted
    /// once more. This is a heuristic and may hide URLs that really are
    /// missing from the application.
    pub fn resolve_with_fallbacks(&mut self, url: &str) -> LogTimingsResult<Option<Rc<ResolvedRoute>>> {
        let url = if url.starts_with("//") { &url[1..] } else { url };

        if let Some(route) = self.resolve(url)? {
            return Ok(Some(route));
        }

        let without_query = url.split('?').next().unwrap_or(url);
        self.resolve(without_query)
    }

    /// Resolve `url` to a route using cached results when possible.
    ///
    /// Return `Ok(None)` if no route handles the URL. Return an error if
    /// the resolver matched a route that has no name, which indicates a
    /// broken routing table and should abort processing.
    pub fn resolve(&mut self, url: &str) -> LogTimingsResult<Option<Rc<ResolvedRoute>>> {
        if self.bad_urls.contains(url) {
            self.stats.known_bad += 1;
            return Ok(None);
        }

        if let Some(route) = self.cached_urls.get(url) {
            self.stats.hits += 1;
            return Ok(Some(Rc::clone(route)));
        }

        self.stats.resolver_calls += 1;
        let matched = match self.resolver.resolve(url) {
            Some(m) => m,
            None => {
                if self.has_room(self.bad_urls.len()) {
                    self.bad_urls.insert(url.to_string());
                }
                return Ok(None);
            }
        };

        let route_name = matched
            .qualified_name()
            .ok_or_else(|| LogTimingsError::UnnamedRoute(url.to_string()))?;
        // Checked above, qualified_name() requires a non-empty url_name
        let url_name = matched.url_name.as_ref().map(String::as_str).unwrap_or_default();

        let handler = self.resolver.describe_handler(&matched.handler);
        self.check_decorator(url, url_name, &handler);

        let route = Rc::new(ResolvedRoute {
            route_name,
            arguments: matched.arguments,
        });

        if self.has_room(self.cached_urls.len()) {
            self.cached_urls.insert(url.to_string(), Rc::clone(&route));
        }

        Ok(Some(route))
    }

    fn has_room(&self, len: usize) -> bool {
        self.capacity.map(|cap| len < cap).unwrap_or(true)
    }

    /// Warn (once) when a route appears to be handled by a decorator's
    /// wrapper function instead of the view that was actually registered.
    fn check_decorator(&mut self, url: &str, url_name: &str, handler: &HandlerInfo) {
        let func_name = handler.qualified_name();
        if !is_possible_decorator(url_name) && !is_possible_decorator(&func_name) {
            return;
        }

        if self.warned_decorators.contains(url_name) && self.warned_decorators.contains(&func_name) {
            return;
        }

        match handler.location() {
            Some(location) => warn!(
                url_name = url_name,
                func_name = %func_name,
                location = %location,
                url = url,
                "possible decorator: preserve the identity of the wrapped function or patch the decorator out with --patch-out"
            ),
            None => warn!(
                url_name = url_name,
                func_name = %func_name,
                url = url,
                "possible decorator: preserve the identity of the wrapped function or patch the decorator out with --patch-out"
            ),
        }

        self.stats.decorator_warnings += 1;
        self.warned_decorators.insert(url_name.to_string());
        self.warned_decorators.insert(func_name);
    }
}

/// Return true if any dot separated segment of `name` is exactly
/// `decorator` or `decorators`.
pub fn is_possible_decorator(name: &str) -> bool {
    name.split('.').any(|part| DECORATOR_SEGMENTS.contains(&part))
}

#[cfg(test)]
mod tests {
    use super::{is_possible_decorator, RouteCache, RouteMatch, UrlResolver};
    use crate::types::{HandlerInfo, LogTimingsError, RouteArguments};
    use pretty_assertions::assert_eq;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    /// Resolver backed by a fixed map that records every URL it is asked about.
    #[derive(Default)]
    struct MapResolver {
        routes: HashMap<String, (Option<String>, HandlerInfo)>,
        calls: RefCell<Vec<String>>,
    }

    impl MapResolver {
        fn route(mut self, url: &str, name: &str, handler: HandlerInfo) -> Self {
            self.routes.insert(url.to_string(), (Some(name.to_string()), handler));
            self
        }

        fn unnamed(mut self, url: &str) -> Self {
            self.routes
                .insert(url.to_string(), (None, HandlerInfo::new("app.views", "anon")));
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.borrow().clone()
        }
    }

    impl UrlResolver for MapResolver {
        type Handler = HandlerInfo;

        fn resolve(&self, url: &str) -> Option<RouteMatch<HandlerInfo>> {
            self.calls.borrow_mut().push(url.to_string());
            self.routes.get(url).map(|(name, handler)| RouteMatch {
                url_name: name.clone(),
                app_name: None,
                arguments: RouteArguments::default(),
                handler: handler.clone(),
            })
        }

        fn describe_handler(&self, handler: &HandlerInfo) -> HandlerInfo {
            handler.clone()
        }
    }

    fn login_resolver() -> MapResolver {
        MapResolver::default().route("/accounts/login/", "login", HandlerInfo::new("accounts.views", "login"))
    }

    #[test]
    fn test_bad_url_not_resolved_twice() {
        let mut cache = RouteCache::new(login_resolver());

        assert_eq!(None, cache.resolve("/missing/").unwrap());
        assert_eq!(None, cache.resolve("/missing/").unwrap());
        assert_eq!(vec!["/missing/".to_string()], cache.resolver().calls());
        assert_eq!(1, cache.unresolved_count());
        assert_eq!(1, cache.stats().known_bad);
    }

    #[test]
    fn test_resolved_url_served_from_cache() {
        let mut cache = RouteCache::new(login_resolver());

        let first = cache.resolve("/accounts/login/").unwrap().unwrap();
        let second = cache.resolve("/accounts/login/").unwrap().unwrap();

        assert!(Rc::ptr_eq(&first, &second));
        assert_eq!("login", first.route_name);
        assert_eq!(1, cache.resolver().calls().len());
        assert_eq!(1, cache.stats().hits);
    }

    #[test]
    fn test_fallback_strips_leading_slash() {
        let mut cache = RouteCache::new(login_resolver());

        let route = cache.resolve_with_fallbacks("//accounts/login/").unwrap().unwrap();
        assert_eq!("login", route.route_name);
        assert_eq!(vec!["/accounts/login/".to_string()], cache.resolver().calls());
    }

    #[test]
    fn test_fallback_strips_query_string() {
        let mut cache = RouteCache::new(login_resolver());

        let route = cache
            .resolve_with_fallbacks("/accounts/login/?next=/home/&a=b")
            .unwrap()
            .unwrap();

        assert_eq!("login", route.route_name);
        assert_eq!(
            vec!["/accounts/login/?next=/home/&a=b".to_string(), "/accounts/login/".to_string()],
            cache.resolver().calls()
        );
    }

    #[test]
    fn test_fallback_slash_then_query() {
        let mut cache = RouteCache::new(login_resolver());

        let route = cache.resolve_with_fallbacks("//accounts/login/?x=1").unwrap().unwrap();
        assert_eq!("login", route.route_name);
    }

    #[test]
    fn test_fallback_unresolvable_single_call() {
        let mut cache = RouteCache::new(login_resolver());

        assert_eq!(None, cache.resolve_with_fallbacks("/nope/").unwrap());
        assert_eq!(None, cache.resolve_with_fallbacks("/nope/").unwrap());
        assert_eq!(vec!["/nope/".to_string()], cache.resolver().calls());
    }

    #[test]
    fn test_unnamed_route_is_fatal() {
        let mut cache = RouteCache::new(MapResolver::default().unnamed("/anon/"));

        match cache.resolve("/anon/") {
            Err(LogTimingsError::UnnamedRoute(url)) => assert_eq!("/anon/", url),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_namespace_prefix() {
        let m = RouteMatch {
            url_name: Some("index".to_string()),
            app_name: Some("admin".to_string()),
            arguments: RouteArguments::default(),
            handler: (),
        };
        assert_eq!(Some("admin.index".to_string()), m.qualified_name());

        let m = RouteMatch {
            url_name: Some(String::new()),
            app_name: None,
            arguments: RouteArguments::default(),
            handler: (),
        };
        assert_eq!(None, m.qualified_name());
    }

    #[test]
    fn test_decorator_warned_once() {
        let wrapper = HandlerInfo {
            module: "accounts.decorators".to_string(),
            function: "inner".to_string(),
            file: Some("accounts/decorators.py".to_string()),
            line: Some(12),
        };
        let resolver = MapResolver::default()
            .route("/a/", "profile", wrapper.clone())
            .route("/b/", "profile", wrapper);
        let mut cache = RouteCache::new(resolver);

        cache.resolve("/a/").unwrap().unwrap();
        cache.resolve("/b/").unwrap().unwrap();

        assert_eq!(1, cache.stats().decorator_warnings);
        assert!(cache.is_warned("profile"));
        assert!(cache.is_warned("accounts.decorators.inner"));
    }

    #[test]
    fn test_decorator_location() {
        let located = HandlerInfo {
            module: "news.decorators".to_string(),
            function: "_wrapped".to_string(),
            file: Some("news/decorators.py".to_string()),
            line: Some(14),
        };
        let unlocated = HandlerInfo::new("shop.decorators", "inner");
        assert_eq!(Some("news/decorators.py line 14".to_string()), located.location());
        assert_eq!(None, unlocated.location());

        let resolver = MapResolver::default()
            .route("/news/", "news-index", located)
            .route("/shop/", "shop-index", unlocated);
        let mut cache = RouteCache::new(resolver);

        cache.resolve("/news/").unwrap().unwrap();
        cache.resolve("/shop/").unwrap().unwrap();

        assert_eq!(2, cache.stats().decorator_warnings);
        assert!(cache.is_warned("news.decorators._wrapped"));
        assert!(cache.is_warned("shop-index"));
    }

    #[test]
    fn test_decorator_in_route_name() {
        let resolver = MapResolver::default()
            .route("/a/", "decorators.thing", HandlerInfo::new("app.views", "thing"))
            .route("/b/", "other", HandlerInfo::new("app.views", "other"));
        let mut cache = RouteCache::new(resolver);

        cache.resolve("/a/").unwrap().unwrap();
        cache.resolve("/b/").unwrap().unwrap();

        assert_eq!(1, cache.stats().decorator_warnings);
        assert!(!cache.is_warned("other"));
    }

    #[test]
    fn test_is_possible_decorator() {
        assert!(is_possible_decorator("app.decorators.inner"));
        assert!(is_possible_decorator("decorator"));
        assert!(!is_possible_decorator("app.decorated.inner"));
        assert!(!is_possible_decorator("app.Decorators.inner"));
        assert!(!is_possible_decorator("my_decorators.inner"));
    }

    #[test]
    fn test_capacity_stops_remembering() {
        let resolver = login_resolver().route("/other/", "other", HandlerInfo::new("app.views", "other"));
        let mut cache = RouteCache::with_capacity(resolver, Some(1));

        cache.resolve("/accounts/login/").unwrap().unwrap();
        cache.resolve("/other/").unwrap().unwrap();
        cache.resolve("/other/").unwrap().unwrap();

        assert_eq!(1, cache.resolved_count());
        assert_eq!(3, cache.resolver().calls().len());
    }
}
