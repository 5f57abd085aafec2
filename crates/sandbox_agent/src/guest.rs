//! Host side of the core entry.
//!
//! # Responsibility
//! - Open a core archive through `sandbox_core_entry_v1` and publish its
//!   configure factory and control server as units of an [`Archive`].
//! - Serve the core's calls into the host: instrumentation queries, spy
//!   installs and log records.
//!
//! # Invariants
//! - Each opened archive owns one server of the core.
//! - The library stays mapped until the last object created from it drops.
//! - A value handle returned by the core is accepted only if the host handed
//!   it out in the same event.
//!
//! # See also
//! - `sandbox_api::abi` for the table layouts, `sandbox_core::cabi` for the
//!   other side.

use libloading::{Library, Symbol};
use log::{debug, info, warn, Level};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use sandbox_api::abi::{
    AbiBefore, AbiCallSite, AbiRet, AbiSocketAddr, AbiStatus, AbiStr, AbiValue, AbiWriter,
    CoreEntryV1, InstrumentationV1, SandboxCoreV1, SandboxHostV1, SpyHandlerV1, UnitSnapshot,
    CORE_ABI_VERSION, CORE_ENTRY_SYMBOL,
};
use sandbox_api::{
    Archive, ArchiveError, ArchiveOpener, BoundaryError, Configure, ConfigureFactory,
    CoreServer, ExportTable, Instrumentation, ServerSingleton, Unit, CORE_CONFIGURE,
    PROXY_CORE_SERVER,
};
use sandbox_spy::{
    CallSite, Invocation, Ret, SpyError, SpyHandler, SpyInstaller, SpyResult, Thrown, Value,
    RET_STATE_NONE, RET_STATE_RETURN, RET_STATE_THROWS,
};
use std::any::type_name;
use std::collections::HashMap;
use std::error::Error;
use std::ffi::c_void;
use std::fmt::{Display, Formatter};
use std::mem::MaybeUninit;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Opens core archives and wires their spy handlers into `spy`.
#[derive(Clone)]
pub struct GuestArchiveOpener {
    spy: Arc<dyn SpyInstaller>,
    linked: Option<CoreEntryV1>,
}

impl GuestArchiveOpener {
    /// Loads shared libraries exporting [`CORE_ENTRY_SYMBOL`].
    pub fn new(spy: Arc<dyn SpyInstaller>) -> Self {
        Self { spy, linked: None }
    }

    /// Calls `entry` in-process for every path instead of loading a library.
    pub fn linked(spy: Arc<dyn SpyInstaller>, entry: CoreEntryV1) -> Self {
        Self {
            spy,
            linked: Some(entry),
        }
    }
}

impl ArchiveOpener for GuestArchiveOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn Archive>, ArchiveError> {
        let library = match self.linked {
            Some(entry) => GuestLibrary::start(path, entry, self.spy.clone(), None)?,
            None => GuestLibrary::load(path, self.spy.clone())?,
        };
        Ok(Box::new(GuestArchive::new(library)?))
    }
}

/// State behind the host table's `ctx`.
struct HostContext {
    spy: Arc<dyn SpyInstaller>,
    // namespace -> (handler ctx owned by the host, installed handler)
    handlers: Mutex<HashMap<String, (usize, Weak<GuestSpyHandler>)>>,
    library: OnceCell<Weak<GuestLibrary>>,
}

/// One started core: its table plus whatever keeps its code mapped.
struct GuestLibrary {
    path: PathBuf,
    core: SandboxCoreV1,
    host: SandboxHostV1,
    context: Box<HostContext>,
    // Last, so the mapping outlives everything above.
    library: Option<Library>,
}

impl GuestLibrary {
    fn load(path: &Path, spy: Arc<dyn SpyInstaller>) -> Result<Arc<Self>, ArchiveError> {
        if !path.is_file() {
            return Err(ArchiveError::NotFound(path.to_path_buf()));
        }
        let load_error = |message: String| ArchiveError::Load {
            path: path.to_path_buf(),
            message,
        };

        // SAFETY: core archives are trusted sandbox components.
        let library = unsafe { Library::new(path) }.map_err(|err| load_error(err.to_string()))?;
        let entry = {
            let entry: Symbol<CoreEntryV1> = unsafe { library.get(CORE_ENTRY_SYMBOL) }
                .map_err(|err| load_error(format!("missing core entry: {err}")))?;
            *entry
        };
        Self::start(path, entry, spy, Some(library))
    }

    fn start(
        path: &Path,
        entry: CoreEntryV1,
        spy: Arc<dyn SpyInstaller>,
        library: Option<Library>,
    ) -> Result<Arc<Self>, ArchiveError> {
        let context = Box::new(HostContext {
            spy,
            handlers: Mutex::new(HashMap::new()),
            library: OnceCell::new(),
        });
        let host = SandboxHostV1 {
            abi_version: CORE_ABI_VERSION,
            ctx: &*context as *const HostContext as *const c_void,
            // A linked core already logs through the host's logger.
            log: library.is_some().then_some(host_log as extern "C" fn(u32, AbiStr, AbiStr)),
            spy_install: host_spy_install,
            spy_uninstall: host_spy_uninstall,
        };

        let mut core = MaybeUninit::<SandboxCoreV1>::uninit();
        let status = unsafe { entry(&host, core.as_mut_ptr()) };
        if status != AbiStatus::Ok {
            return Err(ArchiveError::Load {
                path: path.to_path_buf(),
                message: format!("core entry failed: {status:?}"),
            });
        }
        let core = unsafe { core.assume_init() };
        if core.abi_version != CORE_ABI_VERSION {
            return Err(ArchiveError::IncompatibleAbi {
                path: path.to_path_buf(),
                expected: CORE_ABI_VERSION,
                actual: core.abi_version,
            });
        }

        let started = Arc::new(Self {
            path: path.to_path_buf(),
            core,
            host,
            context,
            library,
        });
        let _ = started.context.library.set(Arc::downgrade(&started));
        Ok(started)
    }
}

impl Drop for GuestLibrary {
    fn drop(&mut self) {
        debug!(
            "event=core_unload module=guest status=ok path={} mapped={}",
            self.path.display(),
            self.library.is_some()
        );
    }
}

/// A core archive seen as an archive of two units.
pub struct GuestArchive {
    path: PathBuf,
    exports: Mutex<Option<ExportTable>>,
    library: Weak<GuestLibrary>,
}

impl GuestArchive {
    fn new(library: Arc<GuestLibrary>) -> Result<Self, ArchiveError> {
        let server = Arc::new(GuestServer::new(library.clone())?);
        let factory_library = library.clone();

        let mut exports = ExportTable::new();
        exports
            .export(
                CORE_CONFIGURE,
                ConfigureFactory::new(move |feature, properties_path| {
                    GuestConfigure::create(&factory_library, feature, properties_path)
                }),
            )
            .export(
                PROXY_CORE_SERVER,
                ServerSingleton::new(move || {
                    let server: Arc<dyn CoreServer> = server.clone();
                    server
                }),
            );

        info!(
            "event=archive_open module=guest status=ok path={} abi_version={}",
            library.path.display(),
            library.core.abi_version
        );
        Ok(Self {
            path: library.path.clone(),
            exports: Mutex::new(Some(exports)),
            library: Arc::downgrade(&library),
        })
    }
}

impl Archive for GuestArchive {
    fn path(&self) -> &Path {
        &self.path
    }

    fn lookup(&self, name: &str) -> Option<Unit> {
        self.exports
            .lock()
            .as_ref()
            .and_then(|exports| exports.get(name))
    }

    fn services(&self, _contract: &str) -> Vec<String> {
        Vec::new()
    }

    /// Drops the exported units; the library unmaps once nothing created from
    /// it is left.
    fn close(&self) -> Result<(), ArchiveError> {
        let Some(exports) = self.exports.lock().take() else {
            return Ok(());
        };
        let outstanding = exports.outstanding();
        drop(exports);
        debug!(
            "event=archive_close module=guest status=ok path={} outstanding_units={} mapped={}",
            self.path.display(),
            outstanding,
            self.library.strong_count() > 0
        );
        Ok(())
    }
}

fn boundary_error(status: AbiStatus, message: String) -> BoundaryError {
    match status {
        AbiStatus::InvalidConfigure => BoundaryError::InvalidConfigure(message),
        AbiStatus::Incompatible => {
            BoundaryError::IncompatibleConfigure(type_name::<GuestConfigure>())
        }
        AbiStatus::NotBound => BoundaryError::NotBound,
        _ => BoundaryError::Runtime(message),
    }
}

/// Configure object created by, and freed through, one core.
struct GuestConfigure {
    handle: usize,
    library: Arc<GuestLibrary>,
}

impl GuestConfigure {
    fn create(
        library: &Arc<GuestLibrary>,
        feature: &str,
        properties_path: &str,
    ) -> Result<Configure, BoundaryError> {
        let mut handle = ptr::null_mut();
        let mut message = String::new();
        let writer = AbiWriter::for_string(&mut message);
        let status = (library.core.configure_new)(
            AbiStr::new(feature),
            AbiStr::new(properties_path),
            &mut handle,
            &writer,
        );
        match status {
            AbiStatus::Ok if !handle.is_null() => Ok(Arc::new(Self {
                handle: handle as usize,
                library: library.clone(),
            })),
            AbiStatus::Ok => Err(BoundaryError::Runtime("core returned no configure".into())),
            status => Err(boundary_error(status, message)),
        }
    }
}

impl Drop for GuestConfigure {
    fn drop(&mut self) {
        (self.library.core.configure_free)(self.handle as *mut c_void);
    }
}

/// The control server of one opened core archive.
struct GuestServer {
    handle: usize,
    library: Arc<GuestLibrary>,
}

impl GuestServer {
    fn new(library: Arc<GuestLibrary>) -> Result<Self, ArchiveError> {
        let handle = (library.core.server_new)(&library.host);
        if handle.is_null() {
            return Err(ArchiveError::Load {
                path: library.path.clone(),
                message: "core created no server".to_string(),
            });
        }
        Ok(Self {
            handle: handle as usize,
            library,
        })
    }

    fn raw(&self) -> *const c_void {
        self.handle as *const c_void
    }
}

impl CoreServer for GuestServer {
    fn is_bind(&self) -> bool {
        (self.library.core.server_is_bind)(self.raw())
    }

    fn bind(
        &self,
        configure: Configure,
        inst: Arc<dyn Instrumentation>,
    ) -> Result<(), BoundaryError> {
        let configure = configure
            .downcast::<GuestConfigure>()
            .map_err(|_| BoundaryError::IncompatibleConfigure(type_name::<GuestConfigure>()))?;
        if !Arc::ptr_eq(&configure.library, &self.library) {
            return Err(BoundaryError::IncompatibleConfigure(type_name::<GuestConfigure>()));
        }

        let mut message = String::new();
        let writer = AbiWriter::for_string(&mut message);
        let status = (self.library.core.server_bind)(
            self.raw(),
            configure.handle as *const c_void,
            instrumentation_table(inst),
            &writer,
        );
        match status {
            AbiStatus::Ok => Ok(()),
            status => Err(boundary_error(status, message)),
        }
    }

    fn destroy(&self) {
        (self.library.core.server_destroy)(self.raw());
    }

    fn local(&self) -> Result<SocketAddr, BoundaryError> {
        let mut local = AbiSocketAddr::default();
        match (self.library.core.server_local)(self.raw(), &mut local) {
            AbiStatus::Ok => local.to_socket_addr().ok_or_else(|| {
                BoundaryError::Runtime(format!("unknown address family {}", local.family))
            }),
            status => Err(boundary_error(status, String::new())),
        }
    }
}

impl Drop for GuestServer {
    fn drop(&mut self) {
        (self.library.core.server_free)(self.handle as *mut c_void);
    }
}

fn instrumentation_table(inst: Arc<dyn Instrumentation>) -> InstrumentationV1 {
    InstrumentationV1 {
        ctx: Box::into_raw(Box::new(inst)) as *const c_void,
        loaded_units: host_loaded_units,
        append_to_bootstrap_search: host_append_to_bootstrap_search,
        release: host_release_instrumentation,
    }
}

unsafe fn instrumentation_of<'a>(ctx: *const c_void) -> &'a Arc<dyn Instrumentation> {
    &*(ctx as *const Arc<dyn Instrumentation>)
}

extern "C" fn host_loaded_units(ctx: *const c_void, out: *const AbiWriter) -> AbiStatus {
    catch_unwind(AssertUnwindSafe(|| {
        let inst = unsafe { instrumentation_of(ctx) };
        let snapshots: Vec<UnitSnapshot> = inst
            .all_loaded_units()
            .iter()
            .map(|unit| UnitSnapshot::capture(inst.as_ref(), unit))
            .collect();
        match UnitSnapshot::encode_all(&snapshots) {
            Ok(json) => {
                unsafe { AbiWriter::write_to(out, &json) };
                AbiStatus::Ok
            }
            Err(err) => {
                warn!("event=loaded_units module=guest status=fail error={err}");
                AbiStatus::Failed
            }
        }
    }))
    .unwrap_or(AbiStatus::Failed)
}

extern "C" fn host_append_to_bootstrap_search(
    ctx: *const c_void,
    archive: AbiStr,
    error: *const AbiWriter,
) -> AbiStatus {
    catch_unwind(AssertUnwindSafe(|| {
        let archive = unsafe { archive.to_str() };
        match unsafe { instrumentation_of(ctx) }.append_to_bootstrap_search(Path::new(&*archive)) {
            Ok(()) => AbiStatus::Ok,
            Err(err) => {
                unsafe { AbiWriter::write_to(error, &err.to_string()) };
                AbiStatus::Failed
            }
        }
    }))
    .unwrap_or(AbiStatus::Failed)
}

extern "C" fn host_release_instrumentation(ctx: *const c_void) {
    if ctx.is_null() {
        return;
    }
    // SAFETY: produced by `instrumentation_table` and released once.
    drop(unsafe { Box::from_raw(ctx as *mut Arc<dyn Instrumentation>) });
}

fn level_of(level: u32) -> Option<Level> {
    match level {
        1 => Some(Level::Error),
        2 => Some(Level::Warn),
        3 => Some(Level::Info),
        4 => Some(Level::Debug),
        5 => Some(Level::Trace),
        _ => None,
    }
}

extern "C" fn host_log(level: u32, target: AbiStr, message: AbiStr) {
    let Some(level) = level_of(level) else {
        return;
    };
    let target = unsafe { target.to_str() };
    let message = unsafe { message.to_str() };
    log::log!(target: &*target, level, "{message}");
}

unsafe fn context_of<'a>(ctx: *const c_void) -> &'a HostContext {
    &*(ctx as *const HostContext)
}

extern "C" fn host_spy_install(
    ctx: *const c_void,
    namespace: AbiStr,
    handler: *const SpyHandlerV1,
) -> AbiStatus {
    catch_unwind(AssertUnwindSafe(|| {
        let context = unsafe { context_of(ctx) };
        let Some(table) = (unsafe { handler.as_ref() }) else {
            return AbiStatus::Failed;
        };
        let Some(library) = context.library.get().and_then(Weak::upgrade) else {
            return AbiStatus::Failed;
        };
        let namespace = unsafe { namespace.to_str() }.into_owned();

        let installed = Arc::new(GuestSpyHandler {
            table: *table,
            owned: AtomicBool::new(true),
            _library: library,
        });
        let handler: Arc<dyn SpyHandler> = installed.clone();
        if let Err(err) = context.spy.install(&namespace, handler) {
            // The core keeps the table it could not hand over.
            installed.owned.store(false, Ordering::SeqCst);
            warn!("event=spy_install module=guest status=fail namespace={namespace} error={err}");
            return AbiStatus::Failed;
        }
        context
            .handlers
            .lock()
            .insert(namespace, (table.ctx as usize, Arc::downgrade(&installed)));
        AbiStatus::Ok
    }))
    .unwrap_or(AbiStatus::Failed)
}

extern "C" fn host_spy_uninstall(
    ctx: *const c_void,
    namespace: AbiStr,
    handler_ctx: *const c_void,
) -> bool {
    catch_unwind(AssertUnwindSafe(|| {
        let context = unsafe { context_of(ctx) };
        let namespace = unsafe { namespace.to_str() };
        let mut handlers = context.handlers.lock();
        match handlers.get(&*namespace) {
            Some((installed_ctx, _)) if *installed_ctx == handler_ctx as usize => {}
            _ => return false,
        }
        let Some((_, installed)) = handlers.remove(&*namespace) else {
            return false;
        };
        drop(handlers);
        let Some(installed) = installed.upgrade() else {
            return false;
        };
        let handler: Arc<dyn SpyHandler> = installed;
        context.spy.uninstall(&namespace, &handler)
    }))
    .unwrap_or(false)
}

/// Error a core substituted that the host never handed out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreThrown(pub String);

impl Display for CoreThrown {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Error for CoreThrown {}

fn value_handle(value: Option<&Value>) -> AbiValue {
    value.map_or(ptr::null(), |value| Arc::as_ptr(value) as *const c_void)
}

fn thrown_handle(thrown: &Thrown) -> AbiValue {
    Arc::as_ptr(thrown) as *const c_void
}

/// Maps a returned handle back to the value handed out in this event.
fn offered_value(handle: AbiValue, offered: &[Value]) -> Result<Option<Value>, SpyError> {
    if handle.is_null() {
        return Ok(None);
    }
    offered
        .iter()
        .find(|value| value_handle(Some(*value)) == handle)
        .cloned()
        .map(Some)
        .ok_or_else(|| SpyError::new("core returned a value it was never handed"))
}

/// Host spy handler dispatching into a core's listener table.
struct GuestSpyHandler {
    table: SpyHandlerV1,
    owned: AtomicBool,
    _library: Arc<GuestLibrary>,
}

impl GuestSpyHandler {
    fn call(
        &self,
        event: impl FnOnce(*mut AbiRet, *const AbiWriter) -> AbiStatus,
    ) -> Result<(AbiRet, String), SpyError> {
        let mut ret = AbiRet::none();
        let mut message = String::new();
        let writer = AbiWriter::for_string(&mut message);
        match event(&mut ret, &writer) {
            AbiStatus::Ok => Ok((ret, message)),
            _ => Err(SpyError::new(message)),
        }
    }

    fn decode(
        (ret, message): (AbiRet, String),
        offered: &[Value],
        thrown: Option<&Thrown>,
    ) -> SpyResult {
        match ret.state {
            RET_STATE_NONE => Ok(Ret::None),
            RET_STATE_RETURN => Ok(Ret::Return(offered_value(ret.value, offered)?)),
            RET_STATE_THROWS if ret.value.is_null() => {
                Ok(Ret::Throws(Arc::new(CoreThrown(message))))
            }
            RET_STATE_THROWS => match thrown {
                Some(thrown) if thrown_handle(thrown) == ret.value => {
                    Ok(Ret::Throws(thrown.clone()))
                }
                _ => Err(SpyError::new("core threw an error it was never handed")),
            },
            state => Err(SpyError::new(format!("unknown ret state {state}"))),
        }
    }
}

impl SpyHandler for GuestSpyHandler {
    fn routes(&self, listener_id: i32) -> bool {
        (self.table.routes)(self.table.ctx, listener_id)
    }

    fn on_before(&self, listener_id: i32, invocation: Invocation<'_>) -> SpyResult {
        let offered: Vec<Value> = invocation
            .target
            .into_iter()
            .chain(invocation.arguments.iter().flatten())
            .cloned()
            .collect();
        let mut handles: Vec<AbiValue> = invocation
            .arguments
            .iter()
            .map(|argument| value_handle(argument.as_ref()))
            .collect();
        let before = AbiBefore {
            target_loader_id: invocation.target_loader_id,
            class_name: AbiStr::new(invocation.class_name),
            method_name: AbiStr::new(invocation.method_name),
            method_desc: AbiStr::new(invocation.method_desc),
            target: value_handle(invocation.target),
            arguments: handles.as_mut_ptr(),
            argument_count: handles.len(),
        };

        let outcome = self.call(|ret, error| {
            (self.table.on_before)(self.table.ctx, listener_id, &before, ret, error)
        })?;
        let replaced = handles
            .iter()
            .map(|handle| offered_value(*handle, &offered))
            .collect::<Result<Vec<_>, _>>()?;
        for (slot, value) in invocation.arguments.iter_mut().zip(replaced) {
            *slot = value;
        }
        Self::decode(outcome, &offered, None)
    }

    fn on_return(&self, listener_id: i32, returned: Option<&Value>) -> SpyResult {
        let offered: Vec<Value> = returned.cloned().into_iter().collect();
        let outcome = self.call(|ret, error| {
            (self.table.on_return)(self.table.ctx, listener_id, value_handle(returned), ret, error)
        })?;
        Self::decode(outcome, &offered, None)
    }

    fn on_throws(&self, listener_id: i32, thrown: &Thrown) -> SpyResult {
        let message = thrown.to_string();
        let outcome = self.call(|ret, error| {
            (self.table.on_throws)(
                self.table.ctx,
                listener_id,
                thrown_handle(thrown),
                AbiStr::new(&message),
                ret,
                error,
            )
        })?;
        Self::decode(outcome, &[], Some(thrown))
    }

    fn on_line(&self, listener_id: i32, line_number: i32) -> SpyResult {
        let outcome = self.call(|ret, error| {
            (self.table.on_line)(self.table.ctx, listener_id, line_number, ret, error)
        })?;
        Self::decode(outcome, &[], None)
    }

    fn on_call_before(&self, listener_id: i32, call_site: CallSite<'_>) -> SpyResult {
        let call_site = AbiCallSite {
            line_number: call_site.line_number,
            owner: AbiStr::new(call_site.owner),
            name: AbiStr::new(call_site.name),
            desc: AbiStr::new(call_site.desc),
        };
        let outcome = self.call(|ret, error| {
            (self.table.on_call_before)(self.table.ctx, listener_id, call_site, ret, error)
        })?;
        Self::decode(outcome, &[], None)
    }

    fn on_call_return(&self, listener_id: i32) -> SpyResult {
        let outcome = self.call(|ret, error| {
            (self.table.on_call_return)(self.table.ctx, listener_id, ret, error)
        })?;
        Self::decode(outcome, &[], None)
    }

    fn on_call_throws(&self, listener_id: i32, thrown_type: &str) -> SpyResult {
        let outcome = self.call(|ret, error| {
            (self.table.on_call_throws)(
                self.table.ctx,
                listener_id,
                AbiStr::new(thrown_type),
                ret,
                error,
            )
        })?;
        Self::decode(outcome, &[], None)
    }
}

impl Drop for GuestSpyHandler {
    fn drop(&mut self) {
        if self.owned.load(Ordering::SeqCst) {
            (self.table.release)(self.table.ctx);
        }
    }
}
