//! Shared contracts of the sandbox runtime.
//! Everything that must have exactly one definition across isolation domains
//! lives here.

pub mod abi;
pub mod boundary;
pub mod filter;
pub mod instrumentation;
pub mod loader;
pub mod provider;
pub mod resource;
pub mod unit;

pub use boundary::{
    BoundaryError, Configure, ConfigureFactory, CoreServer, ServerSingleton, CORE_CONFIGURE,
    PROXY_CORE_SERVER,
};
pub use filter::Filter;
pub use instrumentation::Instrumentation;
pub use loader::{
    resolve_as, Archive, ArchiveError, ArchiveOpener, ExportTable, HostScope, ResolutionScope,
    ResolveError, Unit,
};
pub use provider::{
    LoadedModule, ModuleJarLoadingChain, ModuleLoadingChain, ProviderError, ProviderFactory,
    MODULE_JAR_LOADING_CHAIN, MODULE_LOADING_CHAIN,
};
pub use resource::{
    ConfigInfo, InjectError, Injectable, LaunchMode, Resource, ResourceField, ResourceKind,
};
pub use unit::{
    Access, BehaviorStructure, IntrospectionError, LoadedUnit, LoaderRef, UnitRef, UnitStructure,
    STEALTH_ANNOTATION,
};

/// Returns the api crate version.
pub fn api_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
