//! Control server living inside an isolation domain.
//!
//! # Responsibility
//! - Build the core runtime (catalog, providers, listener table) on bind.
//! - Reserve the control endpoint and report its local address.
//! - Install the listener table into the host's spy while bound.
//!
//! # Invariants
//! - Each opened core archive creates its own server; nothing here is
//!   process-global.
//! - At most one runtime exists per server; `bind` on a bound server is a
//!   no-op.
//! - A failed bind leaves the server unbound with nothing installed.
//! - `destroy` is idempotent.

use crate::catalog::LoadedUnitCatalog;
use crate::configure::CoreConfigure;
use crate::provider::ProviderManager;
use log::{debug, info, warn};
use parking_lot::Mutex;
use sandbox_api::{
    ArchiveOpener, BoundaryError, ConfigInfo, Configure, CoreServer, Instrumentation,
    ResolutionScope,
};
use sandbox_spy::{ListenerTable, SpyHandler, SpyInstaller};
use std::any::type_name;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;

/// Everything a bound server owns.
pub struct CoreRuntime {
    cfg: Arc<CoreConfigure>,
    catalog: LoadedUnitCatalog,
    providers: ProviderManager,
    listeners: Arc<ListenerTable>,
    endpoint: TcpListener,
    local: SocketAddr,
}

impl CoreRuntime {
    pub fn configure(&self) -> &CoreConfigure {
        &self.cfg
    }

    pub fn catalog(&self) -> &LoadedUnitCatalog {
        &self.catalog
    }

    pub fn providers(&self) -> &ProviderManager {
        &self.providers
    }

    pub fn listeners(&self) -> &Arc<ListenerTable> {
        &self.listeners
    }

    pub fn local(&self) -> SocketAddr {
        self.local
    }
}

/// Control server; only reserves its endpoint, no protocol is served.
pub struct ProxyCoreServer {
    opener: Arc<dyn ArchiveOpener>,
    spy: Arc<dyn SpyInstaller>,
    scope: Arc<dyn ResolutionScope>,
    runtime: Mutex<Option<CoreRuntime>>,
}

impl ProxyCoreServer {
    /// Creates an unbound server.
    ///
    /// Provider archives are opened with `opener` into domains parented by
    /// `scope`; the listener table goes into `spy` on bind.
    pub fn new(
        opener: Arc<dyn ArchiveOpener>,
        spy: Arc<dyn SpyInstaller>,
        scope: Arc<dyn ResolutionScope>,
    ) -> Self {
        Self {
            opener,
            spy,
            scope,
            runtime: Mutex::new(None),
        }
    }

    /// Runs `f` against the bound runtime.
    pub fn with_runtime<R>(&self, f: impl FnOnce(&CoreRuntime) -> R) -> Option<R> {
        self.runtime.lock().as_ref().map(f)
    }
}

impl CoreServer for ProxyCoreServer {
    fn is_bind(&self) -> bool {
        self.runtime.lock().is_some()
    }

    fn bind(
        &self,
        configure: Configure,
        inst: Arc<dyn Instrumentation>,
    ) -> Result<(), BoundaryError> {
        let cfg = configure
            .downcast::<CoreConfigure>()
            .map_err(|_| BoundaryError::IncompatibleConfigure(type_name::<CoreConfigure>()))?;

        let mut runtime = self.runtime.lock();
        if runtime.is_some() {
            debug!(
                "event=server_bind module=server status=skip namespace={} reason=already_bound",
                cfg.namespace()
            );
            return Ok(());
        }

        let catalog = LoadedUnitCatalog::new(inst, cfg.is_enable_unsafe());
        let providers = ProviderManager::load(
            cfg.clone() as Arc<dyn ConfigInfo>,
            self.opener.as_ref(),
            self.scope.clone(),
        );
        let address = cfg.server_address();
        let endpoint = TcpListener::bind(address).map_err(|source| BoundaryError::Bind {
            address: address.to_string(),
            source,
        })?;
        let local = endpoint.local_addr().map_err(|source| BoundaryError::Bind {
            address: address.to_string(),
            source,
        })?;

        let listeners = Arc::new(ListenerTable::new());
        self.spy
            .install(cfg.namespace(), listeners.clone())
            .map_err(|err| BoundaryError::Runtime(err.to_string()))?;
        info!(
            "event=server_bind module=server status=ok namespace={} local={} jar_chains={} module_chains={}",
            cfg.namespace(),
            local,
            providers.jar_chain_count(),
            providers.module_chain_count()
        );
        *runtime = Some(CoreRuntime {
            cfg,
            catalog,
            providers,
            listeners,
            endpoint,
            local,
        });
        Ok(())
    }

    fn destroy(&self) {
        let Some(mut runtime) = self.runtime.lock().take() else {
            return;
        };
        let handler: Arc<dyn SpyHandler> = runtime.listeners.clone();
        if !self.spy.uninstall(runtime.cfg.namespace(), &handler) {
            warn!(
                "event=server_destroy module=server status=skip namespace={} reason=handler_replaced",
                runtime.cfg.namespace()
            );
        }
        runtime.listeners.clear();
        runtime.providers.close();
        info!(
            "event=server_destroy module=server status=ok namespace={} local={}",
            runtime.cfg.namespace(),
            runtime.local
        );
        drop(runtime.endpoint);
    }

    fn local(&self) -> Result<SocketAddr, BoundaryError> {
        self.runtime
            .lock()
            .as_ref()
            .map(|runtime| runtime.local)
            .ok_or(BoundaryError::NotBound)
    }
}
