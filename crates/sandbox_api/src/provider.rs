//! Provider extension points wired into module installation.
//!
//! # Responsibility
//! - Define the two hook contracts provider archives implement.
//! - Define how provider archives declare implementations for discovery.
//!
//! # Invariants
//! - Hooks run in discovery order; the first failing hook stops the chain.
//!
//! # See also
//! - `sandbox_core::provider` for discovery and injection.

use crate::loader::ResolutionScope;
use crate::resource::Injectable;
use std::any::Any;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::Path;
use std::sync::Arc;

/// Service contract name for [`ModuleJarLoadingChain`] implementations.
pub const MODULE_JAR_LOADING_CHAIN: &str = "sandbox_provider::ModuleJarLoadingChain";
/// Service contract name for [`ModuleLoadingChain`] implementations.
pub const MODULE_LOADING_CHAIN: &str = "sandbox_provider::ModuleLoadingChain";

/// Runs before a module archive is loaded.
pub trait ModuleJarLoadingChain: Injectable + Send + Sync {
    fn loading(&self, module_archive: &Path) -> Result<(), ProviderError>;
}

/// Runs after a module's type, instance, archive and domain are known.
pub trait ModuleLoadingChain: Injectable + Send + Sync {
    fn loading(&self, module: &LoadedModule<'_>) -> Result<(), ProviderError>;
}

/// Everything known about a module once it has been instantiated.
pub struct LoadedModule<'a> {
    pub unique_id: &'a str,
    pub module_type: &'a str,
    pub instance: &'a (dyn Any + Send + Sync),
    pub archive: &'a Path,
    pub domain: &'a dyn ResolutionScope,
}

/// Factory unit a provider archive exports for each declared implementation.
pub struct ProviderFactory<T: ?Sized>(Arc<dyn Fn() -> Box<T> + Send + Sync>);

impl<T: ?Sized> ProviderFactory<T> {
    pub fn new(create: impl Fn() -> Box<T> + Send + Sync + 'static) -> Self {
        Self(Arc::new(create))
    }

    pub fn instantiate(&self) -> Box<T> {
        (self.0)()
    }
}

/// Failure raised by a provider hook.
#[derive(Debug)]
pub struct ProviderError {
    message: String,
    source: Option<Box<dyn Error + Send + Sync>>,
}

impl ProviderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl Into<Box<dyn Error + Send + Sync>>,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for ProviderError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.source {
            Some(source) => write!(f, "{}: {source}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl Error for ProviderError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source
            .as_deref()
            .map(|source| source as &(dyn Error + 'static))
    }
}
