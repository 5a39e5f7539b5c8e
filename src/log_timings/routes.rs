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

//! Routing table of a web application, declared in the settings file.
//!
//! Routes are written either as paths with typed placeholders
//! (`articles/<int:year>/<slug:title>/`) or as regular expressions
//! (`^articles/(?P<year>[0-9]{4})/$`). URLs are matched against each route
//! in the order they are declared and the first match wins.

use crate::resolve::{RouteMatch, UrlResolver};
use crate::types::{HandlerInfo, LogTimingsError, LogTimingsResult, RouteArguments};
use regex::Regex;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// A single route as declared in the settings file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RouteConfig {
    /// Path with `<converter:name>` placeholders, without a leading slash
    #[serde(default)]
    pub pattern: Option<String>,
    /// Regular expression, searched against the path without a leading slash
    #[serde(default)]
    pub regex: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    pub handler: HandlerInfo,
    /// Decorators applied to the handler, outermost first
    #[serde(default)]
    pub decorators: Vec<String>,
}

/// A decorator that may be applied to route handlers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DecoratorConfig {
    /// Fully qualified name of the decorator
    pub name: String,
    /// Function the decorator returns in place of the one it wraps
    pub wrapper: HandlerInfo,
    /// True if the wrapper copies the identity of the function it wraps
    #[serde(default)]
    pub preserves_identity: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Converter {
    Int,
    Str,
    Slug,
    Uuid,
    Path,
}

impl Converter {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "int" => Some(Converter::Int),
            "str" => Some(Converter::Str),
            "slug" => Some(Converter::Slug),
            "uuid" => Some(Converter::Uuid),
            "path" => Some(Converter::Path),
            _ => None,
        }
    }

    fn regex(self) -> &'static str {
        match self {
            Converter::Int => "[0-9]+",
            Converter::Str => "[^/]+",
            Converter::Slug => "[-a-zA-Z0-9_]+",
            Converter::Uuid => "[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}",
            Converter::Path => ".+",
        }
    }

    fn to_value(self, raw: &str) -> String {
        match self {
            Converter::Int => {
                let trimmed = raw.trim_start_matches('0');
                if trimmed.is_empty() {
                    "0".to_string()
                } else {
                    trimmed.to_string()
                }
            }
            _ => raw.to_string(),
        }
    }
}

#[derive(Debug)]
struct CompiledRoute {
    regex: Regex,
    converters: HashMap<String, Converter>,
    name: Option<String>,
    namespace: Option<String>,
    handler: HandlerInfo,
    decorators: Vec<String>,
}

impl CompiledRoute {
    fn new(config: &RouteConfig) -> LogTimingsResult<Self> {
        let (regex, converters) = match (&config.pattern, &config.regex) {
            (Some(p), None) => {
                let (re, converters) = compile_pattern(p)?;
                (Regex::new(&re)?, converters)
            }
            (None, Some(r)) => (Regex::new(r)?, HashMap::new()),
            _ => {
                return Err(LogTimingsError::ConfigError(format!(
                    "route for {} must have exactly one of 'pattern' or 'regex'",
                    config.handler
                )))
            }
        };

        Ok(CompiledRoute {
            regex,
            converters,
            name: config.name.clone(),
            namespace: config.namespace.clone(),
            handler: config.handler.clone(),
            decorators: config.decorators.clone(),
        })
    }

    fn arguments(&self, path: &str) -> Option<RouteArguments> {
        let caps = self.regex.captures(path)?;
        let mut arguments = RouteArguments::default();

        for name in self.regex.capture_names().flatten() {
            if let Some(m) = caps.name(name) {
                let value = match self.converters.get(name) {
                    Some(c) => c.to_value(m.as_str()),
                    None => m.as_str().to_string(),
                };
                arguments.kwargs.insert(name.to_string(), value);
            }
        }

        // Positional arguments are only used when there are no named ones
        if arguments.kwargs.is_empty() {
            arguments.args = caps
                .iter()
                .skip(1)
                .filter_map(|m| m.map(|m| m.as_str().to_string()))
                .collect();
        }

        Some(arguments)
    }
}

/// Convert a path with `<converter:name>` placeholders into an anchored regex
/// with a named group per placeholder.
fn compile_pattern(pattern: &str) -> LogTimingsResult<(String, HashMap<String, Converter>)> {
    let mut out = String::from("^");
    let mut converters = HashMap::new();
    let mut rest = pattern;

    while let Some(start) = rest.find('<') {
        out.push_str(&regex::escape(&rest[..start]));
        let end = rest[start..]
            .find('>')
            .map(|i| start + i)
            .ok_or_else(|| LogTimingsError::ConfigError(format!("unclosed '<' in route pattern '{}'", pattern)))?;

        let spec = &rest[start + 1..end];
        let (conv_name, name) = match spec.find(':') {
            Some(i) => (&spec[..i], &spec[i + 1..]),
            None => ("str", spec),
        };

        let converter = Converter::from_name(conv_name).ok_or_else(|| {
            LogTimingsError::ConfigError(format!(
                "unknown converter '{}' in route pattern '{}'",
                conv_name, pattern
            ))
        })?;

        if !is_identifier(name) || converters.insert(name.to_string(), converter).is_some() {
            return Err(LogTimingsError::ConfigError(format!(
                "invalid or duplicate parameter '{}' in route pattern '{}'",
                name, pattern
            )));
        }

        out.push_str(&format!("(?P<{}>{})", name, converter.regex()));
        rest = &rest[end + 1..];
    }

    out.push_str(&regex::escape(rest));
    out.push('$');
    Ok((out, converters))
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => chars.all(|c| c.is_ascii_alphanumeric() || c == '_'),
        _ => false,
    }
}

/// Routing table that resolves URLs the way the web application would.
///
/// Decorators that replace the identity of a handler can be "patched out",
/// after which the resolver describes the handler they wrap instead of the
/// wrapper function the decorator installs.
#[derive(Debug)]
pub struct RoutingTable {
    routes: Vec<CompiledRoute>,
    decorators: HashMap<String, DecoratorConfig>,
    patched_out: HashSet<String>,
}

impl RoutingTable {
    pub fn new(routes: &[RouteConfig], decorators: &[DecoratorConfig]) -> LogTimingsResult<Self> {
        let decorators: HashMap<String, DecoratorConfig> =
            decorators.iter().map(|d| (d.name.clone(), d.clone())).collect();

        let mut compiled = Vec::with_capacity(routes.len());
        for route in routes {
            if let Some(d) = route.decorators.iter().find(|d| !decorators.contains_key(*d)) {
                return Err(LogTimingsError::ConfigError(format!(
                    "route for {} uses undeclared decorator '{}'",
                    route.handler, d
                )));
            }

            compiled.push(CompiledRoute::new(route)?);
        }

        debug!(routes = compiled.len(), decorators = decorators.len(), "loaded routing table");
        Ok(RoutingTable {
            routes: compiled,
            decorators,
            patched_out: HashSet::new(),
        })
    }

    /// Register a decorator as unwrapped: routes it is applied to are
    /// described by the function it wraps.
    pub fn patch_out<S>(&mut self, name: S)
    where
        S: Into<String>,
    {
        let name = name.into();
        if !self.decorators.contains_key(&name) {
            warn!(decorator = %name, "cannot patch out unknown decorator");
            return;
        }

        debug!(decorator = %name, "patched out decorator");
        self.patched_out.insert(name);
    }

    pub fn is_patched_out(&self, name: &str) -> bool {
        self.patched_out.contains(name)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl UrlResolver for RoutingTable {
    type Handler = usize;

    fn resolve(&self, url: &str) -> Option<RouteMatch<usize>> {
        let path = if url.starts_with('/') { &url[1..] } else { return None };

        self.routes.iter().enumerate().find_map(|(i, route)| {
            route.arguments(path).map(|arguments| RouteMatch {
                url_name: route.name.clone(),
                app_name: route.namespace.clone(),
                arguments,
                handler: i,
            })
        })
    }

    fn describe_handler(&self, handler: &usize) -> HandlerInfo {
        let route = &self.routes[*handler];
        let mut identity = route.handler.clone();

        // Decorators are listed outermost first, apply them innermost first
        for name in route.decorators.iter().rev() {
            if self.patched_out.contains(name) {
                continue;
            }

            if let Some(d) = self.decorators.get(name) {
                if !d.preserves_identity {
                    identity = d.wrapper.clone();
                }
            }
        }

        identity
    }
}
