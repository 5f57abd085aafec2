//! Per-namespace isolation domains.
//!
//! # Responsibility
//! - Own the process-wide namespace -> domain registry.
//! - Open the core runtime archive into a domain that resolves its own units
//!   before asking the host.
//!
//! # Invariants
//! - At most one domain exists per namespace.
//! - A reused domain ignores the archive path of later requests.
//! - A disposed domain is never handed out again.
//! - Disposing destroys the domain's control server before its archive is
//!   released.
//!
//! # See also
//! - `sandbox_api::loader::routing` for the resolution order.

use crate::guest::GuestArchiveOpener;
use log::{debug, info};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use sandbox_api::loader::routing::RoutingDomain;
use sandbox_api::{
    resolve_as, ArchiveError, ArchiveOpener, HostScope, ResolutionScope, ResolveError,
    ServerSingleton, Unit, PROXY_CORE_SERVER,
};
use sandbox_spy::GlobalSpy;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::Path;
use std::sync::Arc;

static GLOBAL: OnceCell<Arc<DomainManager>> = OnceCell::new();

/// Isolation domain of one namespace.
pub struct SandboxDomain {
    namespace: String,
    inner: RoutingDomain,
}

impl SandboxDomain {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn archive_path(&self) -> &Path {
        self.inner.archive_path()
    }

    /// Releases the archive. Failures are logged by the routing domain.
    pub fn close_if_possible(&self) {
        self.inner.close_if_possible();
    }

    /// Tears down the control server this domain hands out, if it has one.
    pub fn destroy_server(&self) {
        match resolve_as::<ServerSingleton>(self, PROXY_CORE_SERVER) {
            Ok(singleton) => singleton.instance().destroy(),
            Err(err) => debug!(
                "event=server_destroy module=domain status=skip namespace={} error={}",
                self.namespace, err
            ),
        }
    }
}

impl ResolutionScope for SandboxDomain {
    fn scope_name(&self) -> String {
        self.to_string()
    }

    fn resolve(&self, name: &str) -> Result<Unit, ResolveError> {
        self.inner.resolve(name)
    }
}

impl Display for SandboxDomain {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SandboxDomain[namespace={};path={};]",
            self.namespace,
            self.inner.archive_path().display()
        )
    }
}

/// Registry of live isolation domains keyed by namespace.
pub struct DomainManager {
    opener: Arc<dyn ArchiveOpener>,
    parent: Arc<dyn ResolutionScope>,
    domains: Mutex<BTreeMap<String, Arc<SandboxDomain>>>,
}

impl DomainManager {
    pub fn new(opener: Arc<dyn ArchiveOpener>, parent: Arc<dyn ResolutionScope>) -> Self {
        Self {
            opener,
            parent,
            domains: Mutex::new(BTreeMap::new()),
        }
    }

    /// Process-wide manager opening core libraries under an empty host scope.
    ///
    /// Cores install their spy handlers into [`sandbox_spy::global`].
    pub fn global() -> Arc<Self> {
        GLOBAL
            .get_or_init(|| {
                Arc::new(Self::new(
                    Arc::new(GuestArchiveOpener::new(Arc::new(GlobalSpy))),
                    Arc::new(HostScope::empty()),
                ))
            })
            .clone()
    }

    /// Returns the namespace's domain, opening `archive` if there is none.
    pub fn get_or_create(
        &self,
        namespace: &str,
        archive: &Path,
    ) -> Result<Arc<SandboxDomain>, DomainError> {
        let mut domains = self.domains.lock();
        if let Some(domain) = domains.get(namespace) {
            return Ok(domain.clone());
        }

        let opened = self.opener.open(archive).map_err(|source| DomainError::Open {
            namespace: namespace.to_string(),
            source,
        })?;
        let domain = Arc::new(SandboxDomain {
            namespace: namespace.to_string(),
            inner: RoutingDomain::new(opened, self.parent.clone(), Vec::new()),
        });
        domains.insert(namespace.to_string(), domain.clone());
        info!(
            "event=domain_create module=domain status=ok namespace={} path={}",
            namespace,
            archive.display()
        );
        Ok(domain)
    }

    pub fn get(&self, namespace: &str) -> Option<Arc<SandboxDomain>> {
        self.domains.lock().get(namespace).cloned()
    }

    /// Removes the namespace's domain, destroys its server and releases its
    /// archive.
    pub fn dispose(&self, namespace: &str) -> Option<Arc<SandboxDomain>> {
        let domain = self.domains.lock().remove(namespace)?;
        domain.destroy_server();
        domain.close_if_possible();
        info!(
            "event=domain_dispose module=domain status=ok namespace={} outstanding_refs={}",
            namespace,
            Arc::strong_count(&domain) - 1
        );
        Some(domain)
    }

    /// Namespaces with a live domain, sorted.
    pub fn namespaces(&self) -> Vec<String> {
        self.domains.lock().keys().cloned().collect()
    }
}

/// Domain creation failures.
#[derive(Debug)]
pub enum DomainError {
    Open {
        namespace: String,
        source: ArchiveError,
    },
}

impl Display for DomainError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open { namespace, source } => {
                write!(f, "cannot open domain for namespace `{namespace}`: {source}")
            }
        }
    }
}

impl Error for DomainError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Open { source, .. } => Some(source),
        }
    }
}
