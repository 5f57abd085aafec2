//! Attach coordinator.
//!
//! # Responsibility
//! - Drive one attach: feature -> isolation domain -> core configure ->
//!   control server -> bound endpoint.
//! - Record the endpoint of dynamic attaches in the result file.
//!
//! # Invariants
//! - Attaches are serialised process-wide.
//! - A server that reports itself bound is never bound again.
//! - A failed bind is torn down before the failure is returned.
//! - Every failure names its namespace and the phase it happened in.
//!
//! # See also
//! - `crate::domain` for domain reuse, `sandbox_api::boundary` for the
//!   contract resolved inside the domain.

use crate::domain::{DomainError, DomainManager};
use crate::feature::FeatureMap;
use crate::layout::{SandboxLayout, DEFAULT_DATA_ROOT};
use crate::result::{append_attach_result, AttachResult, ResultFileError};
use log::{debug, error, info};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use sandbox_api::{
    resolve_as, BoundaryError, Configure, ConfigureFactory, CoreServer, Instrumentation,
    LaunchMode, ResolveError, ServerSingleton, CORE_CONFIGURE, PROXY_CORE_SERVER,
};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

static BOOTSTRAP_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Steps of one attach attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachPhase {
    Parse,
    ResolveDomain,
    ResolveConfig,
    ResolveServer,
    Bound,
    Bind,
    Done,
    WriteResult,
}

impl AttachPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Parse => "parse",
            Self::ResolveDomain => "resolve_domain",
            Self::ResolveConfig => "resolve_config",
            Self::ResolveServer => "resolve_server",
            Self::Bound => "bound",
            Self::Bind => "bind",
            Self::Done => "done",
            Self::WriteResult => "write_result",
        }
    }
}

impl Display for AttachPhase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bootstraps isolation domains and their control servers.
pub struct AgentLauncher {
    domains: Arc<DomainManager>,
    data_root: PathBuf,
}

impl AgentLauncher {
    pub fn new(domains: Arc<DomainManager>) -> Self {
        Self {
            domains,
            data_root: PathBuf::from(DEFAULT_DATA_ROOT),
        }
    }

    pub fn with_data_root(mut self, data_root: impl Into<PathBuf>) -> Self {
        self.data_root = data_root.into();
        self
    }

    pub fn domains(&self) -> &Arc<DomainManager> {
        &self.domains
    }

    /// Layout of the installation `feature` points at.
    pub fn layout(&self, feature: &FeatureMap) -> Option<SandboxLayout> {
        feature
            .home()
            .map(|home| SandboxLayout::new(home).with_data_root(&self.data_root))
    }

    /// Static load at process startup.
    pub fn premain(
        &self,
        feature: &FeatureMap,
        inst: Arc<dyn Instrumentation>,
    ) -> Result<SocketAddr, AttachError> {
        self.main(feature, LaunchMode::Agent, inst)
    }

    /// Dynamic attach; records the endpoint in the result file.
    pub fn agentmain(
        &self,
        feature: &FeatureMap,
        inst: Arc<dyn Instrumentation>,
    ) -> Result<AttachResult, AttachError> {
        let namespace = feature.namespace();
        let local = self.main(feature, LaunchMode::Attach, inst)?;
        let result = AttachResult::new(namespace, feature.token(), local);

        let layout = self.layout(feature).ok_or_else(|| {
            AttachError::new(namespace, AttachPhase::WriteResult, AttachCause::MissingHome)
        })?;
        let result_file = layout.result_file();
        append_attach_result(&result_file, &result)
            .map_err(|cause| AttachError::new(namespace, AttachPhase::WriteResult, cause))?;
        info!(
            "event=attach_result module=launcher status=ok namespace={} path={}",
            namespace,
            result_file.display()
        );
        Ok(result)
    }

    /// Runs one attach and returns the control server's endpoint.
    pub fn main(
        &self,
        feature: &FeatureMap,
        mode: LaunchMode,
        inst: Arc<dyn Instrumentation>,
    ) -> Result<SocketAddr, AttachError> {
        let _bootstrap = BOOTSTRAP_LOCK.lock();
        let namespace = feature.namespace();
        info!(
            "event=attach module=launcher status=start namespace={} mode={}",
            namespace,
            mode.as_str()
        );

        match self.attach(feature, mode, inst) {
            Ok(local) => {
                info!(
                    "event=attach module=launcher status=ok namespace={} local={}",
                    namespace, local
                );
                Ok(local)
            }
            Err(err) => {
                error!(
                    "event=attach module=launcher status=error namespace={} phase={} error={}",
                    namespace, err.phase, err.cause
                );
                Err(err)
            }
        }
    }

    fn attach(
        &self,
        feature: &FeatureMap,
        mode: LaunchMode,
        inst: Arc<dyn Instrumentation>,
    ) -> Result<SocketAddr, AttachError> {
        let namespace = feature.namespace();
        let fail = |phase: AttachPhase| {
            move |cause: AttachCause| AttachError::new(namespace, phase, cause)
        };

        enter(namespace, AttachPhase::Parse);
        let layout = self
            .layout(feature)
            .ok_or_else(|| fail(AttachPhase::Parse)(AttachCause::MissingHome))?;

        enter(namespace, AttachPhase::ResolveDomain);
        let spy_archive = layout.spy_archive();
        inst.append_to_bootstrap_search(&spy_archive).map_err(|source| {
            fail(AttachPhase::ResolveDomain)(AttachCause::Io {
                path: spy_archive.clone(),
                source,
            })
        })?;
        let domain = self
            .domains
            .get_or_create(namespace, &layout.core_archive())
            .map_err(|cause| fail(AttachPhase::ResolveDomain)(cause.into()))?;

        enter(namespace, AttachPhase::ResolveConfig);
        let factory = resolve_as::<ConfigureFactory>(domain.as_ref(), CORE_CONFIGURE)
            .map_err(|cause| fail(AttachPhase::ResolveConfig)(cause.into()))?;
        let properties_path = feature.properties_path(&layout);
        let configure = factory
            .to_configure(
                &feature.to_core_feature(&layout, mode),
                &properties_path.to_string_lossy(),
            )
            .map_err(|cause| fail(AttachPhase::ResolveConfig)(cause.into()))?;

        enter(namespace, AttachPhase::ResolveServer);
        let server = resolve_as::<ServerSingleton>(domain.as_ref(), PROXY_CORE_SERVER)
            .map_err(|cause| fail(AttachPhase::ResolveServer)(cause.into()))?
            .instance();

        if server.is_bind() {
            enter(namespace, AttachPhase::Bound);
        } else {
            enter(namespace, AttachPhase::Bind);
            bind(server.as_ref(), configure, inst)
                .map_err(|cause| fail(AttachPhase::Bind)(cause.into()))?;
        }

        enter(namespace, AttachPhase::Done);
        server
            .local()
            .map_err(|cause| fail(AttachPhase::Done)(cause.into()))
    }
}

fn bind(
    server: &dyn CoreServer,
    configure: Configure,
    inst: Arc<dyn Instrumentation>,
) -> Result<(), BoundaryError> {
    if let Err(err) = server.bind(configure, inst) {
        server.destroy();
        return Err(err);
    }
    Ok(())
}

fn enter(namespace: &str, phase: AttachPhase) {
    debug!(
        "event=attach_phase module=launcher status=ok namespace={} phase={}",
        namespace, phase
    );
}

/// Why an attach failed.
#[derive(Debug)]
pub enum AttachCause {
    /// No `home` key and no derivable default.
    MissingHome,
    Io { path: PathBuf, source: io::Error },
    Domain(DomainError),
    Resolve(ResolveError),
    Boundary(BoundaryError),
    ResultFile(ResultFileError),
}

impl Display for AttachCause {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingHome => write!(f, "sandbox home is neither given nor derivable"),
            Self::Io { path, source } => write!(f, "`{}`: {source}", path.display()),
            Self::Domain(err) => write!(f, "{err}"),
            Self::Resolve(err) => write!(f, "{err}"),
            Self::Boundary(err) => write!(f, "{err}"),
            Self::ResultFile(err) => write!(f, "{err}"),
        }
    }
}

impl Error for AttachCause {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::MissingHome => None,
            Self::Io { source, .. } => Some(source),
            Self::Domain(err) => Some(err),
            Self::Resolve(err) => Some(err),
            Self::Boundary(err) => Some(err),
            Self::ResultFile(err) => Some(err),
        }
    }
}

impl From<DomainError> for AttachCause {
    fn from(value: DomainError) -> Self {
        Self::Domain(value)
    }
}

impl From<ResolveError> for AttachCause {
    fn from(value: ResolveError) -> Self {
        Self::Resolve(value)
    }
}

impl From<BoundaryError> for AttachCause {
    fn from(value: BoundaryError) -> Self {
        Self::Boundary(value)
    }
}

impl From<ResultFileError> for AttachCause {
    fn from(value: ResultFileError) -> Self {
        Self::ResultFile(value)
    }
}

/// An attach that did not complete.
#[derive(Debug)]
pub struct AttachError {
    pub namespace: String,
    pub phase: AttachPhase,
    pub cause: AttachCause,
}

impl AttachError {
    pub fn new(namespace: &str, phase: AttachPhase, cause: impl Into<AttachCause>) -> Self {
        Self {
            namespace: namespace.to_string(),
            phase,
            cause: cause.into(),
        }
    }
}

impl Display for AttachError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "attach failed for namespace `{}` during {}: {}",
            self.namespace, self.phase, self.cause
        )
    }
}

impl Error for AttachError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.cause)
    }
}
