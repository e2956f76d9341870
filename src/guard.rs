//! Route authorization.
//!
//! `authorize` is a pure function of the session snapshot and the level a route
//! requires. It is applied the same way to every route; the decoded privilege
//! flag is the only thing it looks at beyond presence of an identity.

use crate::session::Session;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Access level a route requires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AccessLevel {
    Public,
    AuthenticatedOnly,
    PrivilegedOnly,
}

impl AccessLevel {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "public" => Some(Self::Public),
            "authenticated" | "authenticatedonly" | "authenticated-only" | "user" => {
                Some(Self::AuthenticatedOnly)
            }
            "privileged" | "privilegedonly" | "privileged-only" | "admin" => {
                Some(Self::PrivilegedOnly)
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::AuthenticatedOnly => "authenticated",
            Self::PrivilegedOnly => "privileged",
        }
    }
}

/// What the host should do with a navigation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardDecision {
    Render,
    RedirectToLogin,
    RedirectToHome,
    /// The session is not known yet; show nothing rather than redirect.
    Defer,
}

pub fn authorize(session: &Session, required: AccessLevel) -> GuardDecision {
    if required == AccessLevel::Public {
        return GuardDecision::Render;
    }
    if !session.is_resolved() {
        return GuardDecision::Defer;
    }
    match (session.identity(), required) {
        (None, _) => GuardDecision::RedirectToLogin,
        (Some(identity), AccessLevel::PrivilegedOnly) if !identity.is_privileged => {
            GuardDecision::RedirectToHome
        }
        (Some(_), _) => GuardDecision::Render,
    }
}

pub const LOGIN_PATH: &str = "/login";
pub const HOME_PATH: &str = "/";

/// Routes of the municipal services client
const BUILTIN_ROUTES: &[(&str, AccessLevel)] = &[
    ("/", AccessLevel::Public),
    ("/login", AccessLevel::Public),
    ("/register", AccessLevel::Public),
    ("/events", AccessLevel::Public),
    ("/facilities", AccessLevel::Public),
    ("/parking", AccessLevel::Public),
    ("/profile", AccessLevel::AuthenticatedOnly),
    ("/my-bookings", AccessLevel::AuthenticatedOnly),
    ("/facilities/:id/book", AccessLevel::AuthenticatedOnly),
    ("/parking/:id/book", AccessLevel::AuthenticatedOnly),
    ("/payment", AccessLevel::AuthenticatedOnly),
    ("/admin/create", AccessLevel::PrivilegedOnly),
    ("/admin/edit-event/:id", AccessLevel::PrivilegedOnly),
    ("/admin/live", AccessLevel::PrivilegedOnly),
    ("/admin/analytics", AccessLevel::PrivilegedOnly),
    ("/admin/scan", AccessLevel::PrivilegedOnly),
];

/// Result of resolving a path against the route table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteMatch {
    Found { pattern: String, level: AccessLevel },
    NotFound,
}

impl RouteMatch {
    /// Unknown paths render the not-found page, which anyone may see.
    pub fn level(&self) -> AccessLevel {
        match self {
            RouteMatch::Found { level, .. } => *level,
            RouteMatch::NotFound => AccessLevel::Public,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RouteTable {
    routes: Vec<(String, AccessLevel)>,
}

fn segments(path: &str) -> Vec<&str> {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    path.split('/').filter(|s| !s.is_empty()).collect()
}

impl RouteTable {
    pub fn builtin() -> Self {
        Self {
            routes: BUILTIN_ROUTES
                .iter()
                .map(|(pattern, level)| (pattern.to_string(), *level))
                .collect(),
        }
    }

    /// Add routes on top of the built-in table; a repeated pattern replaces
    /// the existing entry.
    pub fn with_overrides(mut self, overrides: &BTreeMap<String, AccessLevel>) -> Self {
        for (pattern, level) in overrides {
            match self.routes.iter_mut().find(|(p, _)| p == pattern) {
                Some(entry) => entry.1 = *level,
                None => self.routes.push((pattern.clone(), *level)),
            }
        }
        self
    }

    pub fn routes(&self) -> &[(String, AccessLevel)] {
        &self.routes
    }

    /// Check if a route pattern matches a concrete path.
    /// Pattern segments starting with `:` match any single segment.
    fn pattern_matches(pattern: &str, path: &str) -> bool {
        let pattern = segments(pattern);
        let path = segments(path);
        pattern.len() == path.len()
            && pattern
                .iter()
                .zip(&path)
                .all(|(p, s)| p.starts_with(':') || p == s)
    }

    /// Resolve a path. Literal patterns win over parameterised ones.
    pub fn resolve(&self, path: &str) -> RouteMatch {
        let mut candidates: Vec<&(String, AccessLevel)> = self
            .routes
            .iter()
            .filter(|(pattern, _)| Self::pattern_matches(pattern, path))
            .collect();
        candidates.sort_by_key(|(pattern, _)| pattern.matches(':').count());
        match candidates.first() {
            Some((pattern, level)) => RouteMatch::Found {
                pattern: pattern.clone(),
                level: *level,
            },
            None => RouteMatch::NotFound,
        }
    }

    pub fn decide(&self, session: &Session, path: &str) -> (RouteMatch, GuardDecision) {
        let found = self.resolve(path);
        let decision = authorize(session, found.level());
        (found, decision)
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::builtin()
    }
}
