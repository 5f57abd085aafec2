//! Units this core publishes to the agent across the isolation boundary.
//!
//! Used when the core is linked into the host; a separately built core is
//! reached through [`crate::cabi`] instead.

use crate::configure::CoreConfigure;
use crate::server::ProxyCoreServer;
use sandbox_api::loader::native::NativeArchiveOpener;
use sandbox_api::{
    BoundaryError, Configure, ConfigureFactory, CoreServer, ExportTable, HostScope,
    ResolutionScope, ServerSingleton, CORE_CONFIGURE, PROXY_CORE_SERVER,
};
use sandbox_spy::GlobalSpy;
use std::sync::Arc;

/// Scope provider domains of this core fall back to.
pub(crate) fn core_scope() -> Arc<dyn ResolutionScope> {
    Arc::new(HostScope::named("sandbox_core", ExportTable::new()))
}

/// Registers the configure factory and a fresh server for this table.
///
/// The server installs into the process-wide spy, which a linked core shares
/// with the host.
pub fn register_exports(table: &mut ExportTable) {
    let server = ProxyCoreServer::new(Arc::new(NativeArchiveOpener), Arc::new(GlobalSpy), core_scope());
    register_exports_with(table, Arc::new(server));
}

/// Registers the configure factory and hands out `server` as the singleton.
pub fn register_exports_with(table: &mut ExportTable, server: Arc<ProxyCoreServer>) {
    table
        .export(
            CORE_CONFIGURE,
            ConfigureFactory::new(|feature, properties_path| {
                let cfg = CoreConfigure::to_configure(feature, properties_path)
                    .map_err(|err| BoundaryError::InvalidConfigure(err.to_string()))?;
                let cfg: Configure = Arc::new(cfg);
                Ok(cfg)
            }),
        )
        .export(
            PROXY_CORE_SERVER,
            ServerSingleton::new(move || {
                let server: Arc<dyn CoreServer> = server.clone();
                server
            }),
        );
}
