//! Versioned contract between the agent and the core runtime archive.
//!
//! # Responsibility
//! - Name the units the agent resolves inside an isolation domain.
//! - Define the configuration factory and control-server lifecycle the agent
//!   drives without linking the core at compile time.
//!
//! # Invariants
//! - The agent only ever downcasts resolved units to types in this module.
//! - `CoreServer::bind` is attempted at most once while `is_bind()` is false.
//! - Every opened core archive hands out its own server; two domains never
//!   share one.
//!
//! # See also
//! - `crate::abi` for the C-ABI tables a separately built core is reached
//!   through.

use crate::instrumentation::Instrumentation;
use std::any::Any;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;

/// Unit name of the [`ConfigureFactory`] exported by the core archive.
pub const CORE_CONFIGURE: &str = "sandbox_core::CoreConfigure";
/// Unit name of the [`ServerSingleton`] exported by the core archive.
pub const PROXY_CORE_SERVER: &str = "sandbox_core::server::ProxyCoreServer";

/// Opaque configuration object; only the core knows its concrete type.
pub type Configure = Arc<dyn Any + Send + Sync>;

type ConfigureFn = dyn Fn(&str, &str) -> Result<Configure, BoundaryError> + Send + Sync;

/// Builds a configuration from the core feature string and properties path.
pub struct ConfigureFactory(Arc<ConfigureFn>);

impl ConfigureFactory {
    pub fn new(
        create: impl Fn(&str, &str) -> Result<Configure, BoundaryError> + Send + Sync + 'static,
    ) -> Self {
        Self(Arc::new(create))
    }

    pub fn to_configure(
        &self,
        feature: &str,
        properties_path: &str,
    ) -> Result<Configure, BoundaryError> {
        (self.0)(feature, properties_path)
    }
}

/// Hands out the control server of the isolation domain it was resolved from.
pub struct ServerSingleton(Arc<dyn Fn() -> Arc<dyn CoreServer> + Send + Sync>);

impl ServerSingleton {
    pub fn new(instance: impl Fn() -> Arc<dyn CoreServer> + Send + Sync + 'static) -> Self {
        Self(Arc::new(instance))
    }

    pub fn instance(&self) -> Arc<dyn CoreServer> {
        (self.0)()
    }
}

/// Lifecycle of the control server living inside an isolation domain.
pub trait CoreServer: Send + Sync {
    fn is_bind(&self) -> bool;

    /// Initialises the core runtime and binds the control endpoint.
    fn bind(
        &self,
        configure: Configure,
        inst: Arc<dyn Instrumentation>,
    ) -> Result<(), BoundaryError>;

    /// Tears down whatever `bind` managed to build. Safe to call repeatedly.
    fn destroy(&self);

    fn local(&self) -> Result<SocketAddr, BoundaryError>;
}

/// Failures reported across the agent/core boundary.
#[derive(Debug)]
pub enum BoundaryError {
    InvalidConfigure(String),
    IncompatibleConfigure(&'static str),
    NotBound,
    Bind {
        address: String,
        source: std::io::Error,
    },
    Runtime(String),
}

impl Display for BoundaryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidConfigure(message) => write!(f, "invalid core configure: {message}"),
            Self::IncompatibleConfigure(expected) => {
                write!(f, "configure object is not a {expected}")
            }
            Self::NotBound => write!(f, "control server is not bound"),
            Self::Bind { address, source } => write!(f, "bind {address} failed: {source}"),
            Self::Runtime(message) => write!(f, "core runtime failure: {message}"),
        }
    }
}

impl Error for BoundaryError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Bind { source, .. } => Some(source),
            _ => None,
        }
    }
}
