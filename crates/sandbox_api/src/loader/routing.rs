//! Routing domain: local-first resolution with pattern-forced delegation.
//!
//! # Responsibility
//! - Resolve names matching a routing pattern from the routing's scope first,
//!   so shared contract units have exactly one definition.
//! - Resolve every other name from the private archive before the parent.
//!
//! # Invariants
//! - A routing miss falls through to the normal local-first order.
//! - Units defined by the private archive are cached per domain; resolution
//!   of one name is atomic with respect to concurrent requests.

use super::{Archive, ResolutionScope, ResolveError, Unit};
use log::debug;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::path::Path;
use std::sync::Arc;

/// Names matching any of `patterns` are routed to `scope`.
pub struct Routing {
    scope: Arc<dyn ResolutionScope>,
    patterns: Vec<Regex>,
}

impl Routing {
    pub fn new(scope: Arc<dyn ResolutionScope>, patterns: &[&str]) -> Result<Self, regex::Error> {
        let patterns = patterns
            .iter()
            .map(|pattern| Regex::new(pattern))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { scope, patterns })
    }

    pub fn is_hit(&self, name: &str) -> bool {
        self.patterns.iter().any(|pattern| pattern.is_match(name))
    }
}

/// Domain over a private archive with routing rules and a parent scope.
pub struct RoutingDomain {
    archive: Box<dyn Archive>,
    parent: Arc<dyn ResolutionScope>,
    routings: Vec<Routing>,
    defined: Mutex<HashMap<String, Unit>>,
}

impl RoutingDomain {
    pub fn new(
        archive: Box<dyn Archive>,
        parent: Arc<dyn ResolutionScope>,
        routings: Vec<Routing>,
    ) -> Self {
        Self {
            archive,
            parent,
            routings,
            defined: Mutex::new(HashMap::new()),
        }
    }

    pub fn archive_path(&self) -> &Path {
        self.archive.path()
    }

    /// Implementation names the private archive declares for `contract`.
    pub fn services(&self, contract: &str) -> Vec<String> {
        self.archive.services(contract)
    }

    /// Best-effort release of the archive's file handles.
    pub fn close_if_possible(&self) {
        self.defined.lock().clear();
        if let Err(err) = self.archive.close() {
            debug!(
                "event=domain_close module=loader status=skip domain={} error={}",
                self, err
            );
        }
    }
}

impl ResolutionScope for RoutingDomain {
    fn scope_name(&self) -> String {
        self.to_string()
    }

    fn resolve(&self, name: &str) -> Result<Unit, ResolveError> {
        for routing in self.routings.iter().filter(|routing| routing.is_hit(name)) {
            if let Ok(unit) = routing.scope.resolve(name) {
                return Ok(unit);
            }
        }

        let mut defined = self.defined.lock();
        if let Some(unit) = defined.get(name) {
            return Ok(unit.clone());
        }
        if let Some(unit) = self.archive.lookup(name) {
            defined.insert(name.to_string(), unit.clone());
            return Ok(unit);
        }
        drop(defined);
        self.parent.resolve(name)
    }
}

impl Display for RoutingDomain {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "RoutingDomain[path={};]", self.archive.path().display())
    }
}
