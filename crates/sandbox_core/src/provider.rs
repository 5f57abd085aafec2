//! Provider loading chain: discovery, injection and invocation of hooks.
//!
//! # Responsibility
//! - Open every provider archive of the provider directory in a routing
//!   domain parented to the isolation domain.
//! - Instantiate declared hook implementations and inject `ConfigInfo`.
//! - Run the hooks in discovery order around module installation.
//!
//! # Invariants
//! - Shared contract names always resolve through the isolation domain.
//! - A failing archive is skipped as a whole; others still load.
//! - Hooks of one archive run in declaration order; archives in path order.
//!
//! # See also
//! - `sandbox_api::provider` for the hook contracts.

use log::{info, warn};
use sandbox_api::loader::native::is_native_archive;
use sandbox_api::loader::routing::{Routing, RoutingDomain};
use sandbox_api::{
    resolve_as, ArchiveError, ArchiveOpener, ConfigInfo, InjectError, Injectable, LoadedModule,
    ModuleJarLoadingChain, ModuleLoadingChain, ProviderError, ProviderFactory, ResolutionScope,
    ResolveError, Resource, ResourceKind, MODULE_JAR_LOADING_CHAIN, MODULE_LOADING_CHAIN,
};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Name patterns a provider domain always delegates to the isolation domain.
pub const PROVIDER_ROUTING_PATTERNS: &[&str] = &["^sandbox_api::.*", "^sandbox_provider::.*"];

/// Hooks discovered from the provider directory.
pub struct ProviderManager {
    jar_chains: Vec<Box<dyn ModuleJarLoadingChain>>,
    module_chains: Vec<Box<dyn ModuleLoadingChain>>,
    domains: Vec<RoutingDomain>,
}

impl ProviderManager {
    /// Discovers providers under `cfg.provider_path()`.
    ///
    /// Never fails: unreadable directories and broken archives are logged
    /// and skipped.
    pub fn load(
        cfg: Arc<dyn ConfigInfo>,
        opener: &dyn ArchiveOpener,
        parent: Arc<dyn ResolutionScope>,
    ) -> Self {
        let mut manager = Self {
            jar_chains: Vec::new(),
            module_chains: Vec::new(),
            domains: Vec::new(),
        };

        let provider_dir = cfg.provider_path().to_path_buf();
        let archives = match list_provider_archives(&provider_dir) {
            Ok(archives) => archives,
            Err(err) => {
                warn!(
                    "event=provider_scan module=provider status=skip dir={} error={}",
                    provider_dir.display(),
                    err
                );
                return manager;
            }
        };

        for archive in archives {
            match load_archive(&archive, &cfg, opener, &parent) {
                Ok(loaded) => {
                    info!(
                        "event=provider_load module=provider status=ok archive={} jar_chains={} module_chains={}",
                        archive.display(),
                        loaded.jar_chains.len(),
                        loaded.module_chains.len()
                    );
                    manager.jar_chains.extend(loaded.jar_chains);
                    manager.module_chains.extend(loaded.module_chains);
                    manager.domains.push(loaded.domain);
                }
                Err(err) => warn!(
                    "event=provider_load module=provider status=skip archive={} error={}",
                    archive.display(),
                    err
                ),
            }
        }
        manager
    }

    /// Runs every pre-archive-load hook; the first failure stops the chain.
    pub fn loading_module_archive(&self, module_archive: &Path) -> Result<(), ProviderError> {
        for chain in &self.jar_chains {
            chain.loading(module_archive)?;
        }
        Ok(())
    }

    /// Runs every post-unit-load hook; the first failure stops the chain.
    pub fn loading_module(&self, module: &LoadedModule<'_>) -> Result<(), ProviderError> {
        for chain in &self.module_chains {
            chain.loading(module)?;
        }
        Ok(())
    }

    pub fn jar_chain_count(&self) -> usize {
        self.jar_chains.len()
    }

    pub fn module_chain_count(&self) -> usize {
        self.module_chains.len()
    }

    /// Drops every hook and releases provider archives.
    pub fn close(&mut self) {
        self.jar_chains.clear();
        self.module_chains.clear();
        for domain in self.domains.drain(..) {
            domain.close_if_possible();
        }
    }
}

impl Drop for ProviderManager {
    fn drop(&mut self) {
        self.close();
    }
}

struct LoadedArchive {
    jar_chains: Vec<Box<dyn ModuleJarLoadingChain>>,
    module_chains: Vec<Box<dyn ModuleLoadingChain>>,
    domain: RoutingDomain,
}

fn list_provider_archives(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut archives = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && is_native_archive(&path) {
            archives.push(path);
        }
    }
    archives.sort();
    Ok(archives)
}

fn load_archive(
    path: &Path,
    cfg: &Arc<dyn ConfigInfo>,
    opener: &dyn ArchiveOpener,
    parent: &Arc<dyn ResolutionScope>,
) -> Result<LoadedArchive, ProviderLoadError> {
    let routing = Routing::new(parent.clone(), PROVIDER_ROUTING_PATTERNS)
        .map_err(|err| ProviderLoadError::Routing(err.to_string()))?;
    let archive = opener.open(path)?;
    let domain = RoutingDomain::new(archive, parent.clone(), vec![routing]);

    let discovered = discover::<dyn ModuleJarLoadingChain>(&domain, MODULE_JAR_LOADING_CHAIN, cfg)
        .and_then(|jar_chains| {
            discover::<dyn ModuleLoadingChain>(&domain, MODULE_LOADING_CHAIN, cfg)
                .map(|module_chains| (jar_chains, module_chains))
        });
    match discovered {
        Ok((jar_chains, module_chains)) => Ok(LoadedArchive {
            jar_chains,
            module_chains,
            domain,
        }),
        Err(err) => {
            domain.close_if_possible();
            Err(err)
        }
    }
}

fn discover<T>(
    domain: &RoutingDomain,
    contract: &str,
    cfg: &Arc<dyn ConfigInfo>,
) -> Result<Vec<Box<T>>, ProviderLoadError>
where
    T: Injectable + ?Sized + 'static,
{
    let mut providers = Vec::new();
    for implementation in domain.services(contract) {
        let factory = resolve_as::<ProviderFactory<T>>(domain, &implementation)?;
        let mut provider = factory.instantiate();
        inject_resources(provider.as_mut(), cfg).map_err(|source| ProviderLoadError::Inject {
            implementation: implementation.clone(),
            source,
        })?;
        info!(
            "event=provider_discover module=provider status=ok contract={} impl={}",
            contract, implementation
        );
        providers.push(provider);
    }
    Ok(providers)
}

/// Injects the shared `ConfigInfo` into every field `provider` declares for it.
pub fn inject_resources<T: Injectable + ?Sized>(
    provider: &mut T,
    cfg: &Arc<dyn ConfigInfo>,
) -> Result<(), InjectError> {
    for field in provider.resource_fields() {
        if field.kind == ResourceKind::ConfigInfo {
            provider.inject(field.name, Resource::ConfigInfo(cfg.clone()))?;
        }
    }
    Ok(())
}

/// Reason one provider archive was skipped.
#[derive(Debug)]
pub enum ProviderLoadError {
    Routing(String),
    Archive(ArchiveError),
    Resolve(ResolveError),
    Inject {
        implementation: String,
        source: InjectError,
    },
}

impl Display for ProviderLoadError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Routing(message) => write!(f, "invalid provider routing: {message}"),
            Self::Archive(err) => write!(f, "{err}"),
            Self::Resolve(err) => write!(f, "provider resolution failed: {err}"),
            Self::Inject {
                implementation,
                source,
            } => write!(f, "inject resources into `{implementation}` failed: {source}"),
        }
    }
}

impl Error for ProviderLoadError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Routing(_) => None,
            Self::Archive(err) => Some(err),
            Self::Resolve(err) => Some(err),
            Self::Inject { source, .. } => Some(source),
        }
    }
}

impl From<ArchiveError> for ProviderLoadError {
    fn from(value: ArchiveError) -> Self {
        Self::Archive(value)
    }
}

impl From<ResolveError> for ProviderLoadError {
    fn from(value: ResolveError) -> Self {
        Self::Resolve(value)
    }
}

#[cfg(test)]
mod tests {
    use super::{inject_resources, list_provider_archives};
    use sandbox_api::loader::native::archive_file_name;
    use sandbox_api::{ConfigInfo, InjectError, Injectable, LaunchMode, Resource, ResourceField};
    use std::fs;
    use std::net::SocketAddr;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    struct Cfg(PathBuf);

    impl ConfigInfo for Cfg {
        fn namespace(&self) -> &str {
            "alpha"
        }
        fn mode(&self) -> LaunchMode {
            LaunchMode::Attach
        }
        fn home(&self) -> &Path {
            &self.0
        }
        fn system_module_path(&self) -> &Path {
            &self.0
        }
        fn user_module_path(&self) -> &Path {
            &self.0
        }
        fn provider_path(&self) -> &Path {
            &self.0
        }
        fn server_address(&self) -> SocketAddr {
            SocketAddr::from(([127, 0, 0, 1], 0))
        }
        fn is_enable_unsafe(&self) -> bool {
            false
        }
        fn version(&self) -> &str {
            "test"
        }
    }

    #[derive(Default)]
    struct Audited {
        config: Option<Arc<dyn ConfigInfo>>,
    }

    impl Injectable for Audited {
        fn resource_fields(&self) -> Vec<ResourceField> {
            vec![ResourceField::config_info("config")]
        }

        fn inject(&mut self, field: &str, resource: Resource) -> Result<(), InjectError> {
            match (field, resource) {
                ("config", Resource::ConfigInfo(config)) => {
                    self.config = Some(config);
                    Ok(())
                }
                (field, _) => Err(InjectError::UnknownField(field.to_string())),
            }
        }
    }

    #[test]
    fn injects_config_info_into_declared_fields() {
        let cfg: Arc<dyn ConfigInfo> = Arc::new(Cfg(PathBuf::from("/srv")));
        let mut provider = Audited::default();
        inject_resources(&mut provider, &cfg).expect("inject");
        assert_eq!(provider.config.expect("injected").namespace(), "alpha");
    }

    #[test]
    fn lists_only_archives_sorted_by_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join(archive_file_name("zeta")), b"").expect("write");
        fs::write(dir.path().join(archive_file_name("alpha")), b"").expect("write");
        fs::write(dir.path().join("README.txt"), b"").expect("write");
        fs::create_dir(dir.path().join(archive_file_name("nested"))).expect("mkdir");

        let archives = list_provider_archives(dir.path()).expect("list");
        let names = archives
            .iter()
            .filter_map(|path| path.file_name()?.to_str().map(str::to_string))
            .collect::<Vec<_>>();
        assert_eq!(
            names,
            vec![archive_file_name("alpha"), archive_file_name("zeta")]
        );
    }
}
