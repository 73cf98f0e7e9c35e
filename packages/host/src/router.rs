//! Maps request paths to route names.
//!
//! A pattern is literal text with `{var}` placeholders. Each placeholder
//! matches one non-empty path segment and is captured under its name.
//! Routes are tried in registration order.

use std::collections::BTreeMap;

use regex::Regex;

use crate::error::{HostError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    pub name: String,
    pub variables: BTreeMap<String, String>,
}

#[derive(Debug)]
struct Route {
    name: String,
    pattern: String,
    regex: Regex,
    method: Option<String>,
}

impl Route {
    fn accepts(&self, method: &str) -> bool {
        self.method
            .as_deref()
            .map_or(true, |allowed| allowed.eq_ignore_ascii_case(method))
    }

    fn capture(&self, path: &str) -> Option<RouteMatch> {
        let captures = self.regex.captures(path)?;
        let variables = self
            .regex
            .capture_names()
            .flatten()
            .filter_map(|var| {
                captures
                    .name(var)
                    .map(|value| (var.to_string(), value.as_str().to_string()))
            })
            .collect();
        Some(RouteMatch {
            name: self.name.clone(),
            variables,
        })
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    let mut source = String::from("^");
    let mut rest = pattern;
    while let Some(open) = rest.find('{') {
        let Some(len) = rest[open..].find('}') else {
            break;
        };
        source.push_str(&regex::escape(&rest[..open]));
        source.push_str(&format!("(?P<{}>[^/]+)", &rest[open + 1..open + len]));
        rest = &rest[open + len + 1..];
    }
    source.push_str(&regex::escape(rest));
    source.push('$');

    Regex::new(&source).map_err(|source| HostError::InvalidRoute {
        pattern: pattern.to_string(),
        source,
    })
}

#[derive(Debug, Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name`. Re-adding a name replaces its pattern and method.
    pub fn add(&mut self, name: impl Into<String>, pattern: &str, method: Option<&str>) -> Result<()> {
        let name = name.into();
        let route = Route {
            regex: compile(pattern)?,
            pattern: pattern.to_string(),
            method: method.map(str::to_ascii_uppercase),
            name,
        };
        match self.routes.iter_mut().find(|r| r.name == route.name) {
            Some(existing) => *existing = route,
            None => self.routes.push(route),
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Pattern registered for `name`.
    pub fn pattern(&self, name: &str) -> Option<&str> {
        self.routes
            .iter()
            .find(|r| r.name == name)
            .map(|r| r.pattern.as_str())
    }

    /// First route whose pattern matches `path`, whatever its method.
    pub fn resolve(&self, path: &str) -> Option<RouteMatch> {
        self.routes.iter().find_map(|route| route.capture(path))
    }

    /// First route matching both `method` and `path`.
    pub fn route(&self, method: &str, path: &str) -> Result<RouteMatch> {
        let mut refused = None;
        for route in &self.routes {
            let Some(found) = route.capture(path) else {
                continue;
            };
            if route.accepts(method) {
                return Ok(found);
            }
            refused.get_or_insert(found.name);
        }
        match refused {
            Some(route) => Err(HostError::MethodNotAllowed {
                route,
                method: method.to_string(),
            }),
            None => Err(HostError::RouteNotFound(path.to_string())),
        }
    }
}
