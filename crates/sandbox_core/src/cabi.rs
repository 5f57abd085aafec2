//! C-ABI entry of a separately built core.
//!
//! # Responsibility
//! - Export `sandbox_core_entry_v1`, filling a [`SandboxCoreV1`] table.
//! - Adapt the host's instrumentation and spy tables to the core's traits.
//! - Hand the host a [`SpyHandlerV1`] over a core handler.
//!
//! # Invariants
//! - No panic unwinds through an `extern "C"` function.
//! - Values the host hands in stay host handles: listeners may pass them on,
//!   compare them or substitute them, never look inside.
//! - Every context received from the host is released exactly once.
//!
//! # See also
//! - `sandbox_api::abi` for the table layouts.

use crate::configure::CoreConfigure;
use crate::exports::core_scope;
use crate::server::ProxyCoreServer;
use log::{warn, LevelFilter, Log, Metadata, Record};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use sandbox_api::abi::{
    AbiBefore, AbiCallSite, AbiRet, AbiSocketAddr, AbiStatus, AbiStr, AbiValue, AbiWriter,
    InstrumentationV1, SandboxCoreV1, SandboxHostV1, SpyHandlerV1, UnitSnapshot,
    CORE_ABI_VERSION,
};
use sandbox_api::loader::native::NativeArchiveOpener;
use sandbox_api::{BoundaryError, Configure, CoreServer, Instrumentation, LoadedUnit, UnitRef};
use sandbox_spy::{
    CallSite, Invocation, Ret, SpyError, SpyHandler, SpyInstaller, SpyResult, Thrown, Value,
    RET_STATE_RETURN, RET_STATE_THROWS,
};
use std::collections::HashMap;
use std::error::Error;
use std::ffi::c_void;
use std::fmt::{Display, Formatter};
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::ptr;
use std::sync::Arc;

/// Fills `out` with this core's table.
///
/// # Safety
/// `host` must be null or point to a host table that outlives every server
/// created through `out`; `out` must be null or writable.
#[no_mangle]
pub unsafe extern "C" fn sandbox_core_entry_v1(
    host: *const SandboxHostV1,
    out: *mut SandboxCoreV1,
) -> AbiStatus {
    let Some(host) = host.as_ref() else {
        return AbiStatus::Failed;
    };
    if out.is_null() {
        return AbiStatus::Failed;
    }
    if host.abi_version != CORE_ABI_VERSION {
        return AbiStatus::Incompatible;
    }
    if let Some(log) = host.log {
        install_host_logger(log);
    }
    out.write(SandboxCoreV1 {
        abi_version: CORE_ABI_VERSION,
        configure_new,
        configure_free,
        server_new,
        server_free,
        server_is_bind,
        server_bind,
        server_destroy,
        server_local,
    });
    AbiStatus::Ok
}

struct HostLogger {
    log: extern "C" fn(level: u32, target: AbiStr, message: AbiStr),
}

static HOST_LOGGER: OnceCell<HostLogger> = OnceCell::new();

impl Log for HostLogger {
    fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &Record<'_>) {
        let message = record.args().to_string();
        (self.log)(
            record.level() as u32,
            AbiStr::new(record.target()),
            AbiStr::new(&message),
        );
    }

    fn flush(&self) {}
}

fn install_host_logger(log: extern "C" fn(u32, AbiStr, AbiStr)) {
    let logger = HOST_LOGGER.get_or_init(|| HostLogger { log });
    if log::set_logger(logger).is_ok() {
        log::set_max_level(LevelFilter::Trace);
    }
}

fn guarded(error: *const AbiWriter, call: impl FnOnce() -> AbiStatus) -> AbiStatus {
    catch_unwind(AssertUnwindSafe(call)).unwrap_or_else(|_| {
        unsafe { AbiWriter::write_to(error, "core panicked") };
        AbiStatus::Failed
    })
}

fn report(err: BoundaryError, error: *const AbiWriter) -> AbiStatus {
    let (status, message) = match err {
        BoundaryError::InvalidConfigure(message) => (AbiStatus::InvalidConfigure, message),
        BoundaryError::Runtime(message) => (AbiStatus::Failed, message),
        BoundaryError::IncompatibleConfigure(_) => (AbiStatus::Incompatible, err.to_string()),
        BoundaryError::NotBound => (AbiStatus::NotBound, err.to_string()),
        other => (AbiStatus::Failed, other.to_string()),
    };
    unsafe { AbiWriter::write_to(error, &message) };
    status
}

extern "C" fn configure_new(
    feature: AbiStr,
    properties_path: AbiStr,
    out: *mut *mut c_void,
    error: *const AbiWriter,
) -> AbiStatus {
    guarded(error, || {
        if out.is_null() {
            return report(BoundaryError::Runtime("null configure slot".into()), error);
        }
        let feature = unsafe { feature.to_str() };
        let properties_path = unsafe { properties_path.to_str() };
        match CoreConfigure::to_configure(&feature, &properties_path) {
            Ok(cfg) => {
                let configure: Configure = Arc::new(cfg);
                unsafe { out.write(Box::into_raw(Box::new(configure)) as *mut c_void) };
                AbiStatus::Ok
            }
            Err(err) => report(BoundaryError::InvalidConfigure(err.to_string()), error),
        }
    })
}

extern "C" fn configure_free(configure: *mut c_void) {
    if configure.is_null() {
        return;
    }
    // SAFETY: produced by `configure_new` and freed once by the host.
    drop(unsafe { Box::from_raw(configure as *mut Configure) });
}

unsafe fn server_ref<'a>(server: *const c_void) -> Option<&'a ProxyCoreServer> {
    (server as *const ProxyCoreServer).as_ref()
}

extern "C" fn server_new(host: *const SandboxHostV1) -> *mut c_void {
    let Some(host) = (unsafe { host.as_ref() }) else {
        return ptr::null_mut();
    };
    let host = *host;
    catch_unwind(AssertUnwindSafe(|| {
        let server = ProxyCoreServer::new(
            Arc::new(NativeArchiveOpener),
            Arc::new(HostSpy::new(host)),
            core_scope(),
        );
        Box::into_raw(Box::new(server)) as *mut c_void
    }))
    .unwrap_or(ptr::null_mut())
}

extern "C" fn server_free(server: *mut c_void) {
    if server.is_null() {
        return;
    }
    // SAFETY: produced by `server_new` and freed once by the host.
    let server = unsafe { Box::from_raw(server as *mut ProxyCoreServer) };
    let _ = catch_unwind(AssertUnwindSafe(move || {
        server.destroy();
        drop(server);
    }));
}

extern "C" fn server_is_bind(server: *const c_void) -> bool {
    catch_unwind(AssertUnwindSafe(|| {
        unsafe { server_ref(server) }.is_some_and(ProxyCoreServer::is_bind)
    }))
    .unwrap_or(false)
}

extern "C" fn server_bind(
    server: *const c_void,
    configure: *const c_void,
    inst: InstrumentationV1,
    error: *const AbiWriter,
) -> AbiStatus {
    let inst = Arc::new(HostInstrumentation { table: inst });
    guarded(error, move || {
        let Some(server) = (unsafe { server_ref(server) }) else {
            return report(BoundaryError::Runtime("null server".into()), error);
        };
        let Some(configure) = (unsafe { (configure as *const Configure).as_ref() }) else {
            return report(BoundaryError::InvalidConfigure("null configure".into()), error);
        };
        match server.bind(configure.clone(), inst) {
            Ok(()) => AbiStatus::Ok,
            Err(err) => report(err, error),
        }
    })
}

extern "C" fn server_destroy(server: *const c_void) {
    let _ = catch_unwind(AssertUnwindSafe(|| {
        if let Some(server) = unsafe { server_ref(server) } {
            server.destroy();
        }
    }));
}

extern "C" fn server_local(server: *const c_void, out: *mut AbiSocketAddr) -> AbiStatus {
    guarded(ptr::null(), || {
        let Some(server) = (unsafe { server_ref(server) }) else {
            return AbiStatus::Failed;
        };
        match server.local() {
            Ok(local) if !out.is_null() => {
                unsafe { out.write(local.into()) };
                AbiStatus::Ok
            }
            Ok(_) => AbiStatus::Failed,
            Err(err) => report(err, ptr::null()),
        }
    })
}

/// The host's instrumentation handle seen from inside the core.
struct HostInstrumentation {
    table: InstrumentationV1,
}

impl Instrumentation for HostInstrumentation {
    fn all_loaded_units(&self) -> Vec<UnitRef> {
        let mut json = String::new();
        let writer = AbiWriter::for_string(&mut json);
        let status = (self.table.loaded_units)(self.table.ctx, &writer);
        if status != AbiStatus::Ok {
            warn!("event=loaded_units module=cabi status=fail abi_status={status:?}");
            return Vec::new();
        }
        let snapshots = match UnitSnapshot::decode_all(&json) {
            Ok(snapshots) => snapshots,
            Err(err) => {
                warn!("event=loaded_units module=cabi status=fail error={err}");
                return Vec::new();
            }
        };

        // Repeated handles of one unit decode to one shared unit.
        let mut seen: HashMap<u64, UnitRef> = HashMap::new();
        snapshots
            .into_iter()
            .map(|snapshot| {
                seen.entry(snapshot.id)
                    .or_insert_with(|| Arc::new(snapshot) as UnitRef)
                    .clone()
            })
            .collect()
    }

    fn is_modifiable_unit(&self, unit: &dyn LoadedUnit) -> bool {
        unit.captured_modifiable().unwrap_or(false)
    }

    fn append_to_bootstrap_search(&self, archive: &Path) -> io::Result<()> {
        let archive = archive.to_string_lossy();
        let mut message = String::new();
        let writer = AbiWriter::for_string(&mut message);
        match (self.table.append_to_bootstrap_search)(
            self.table.ctx,
            AbiStr::new(&archive),
            &writer,
        ) {
            AbiStatus::Ok => Ok(()),
            _ => Err(io::Error::new(io::ErrorKind::Other, message)),
        }
    }
}

impl Drop for HostInstrumentation {
    fn drop(&mut self) {
        (self.table.release)(self.table.ctx);
    }
}

/// The host's spy seen from inside the core.
struct HostSpy {
    host: SandboxHostV1,
    // namespace -> (handler ctx handed to the host, handler identity)
    installed: Mutex<HashMap<String, (usize, usize)>>,
}

impl HostSpy {
    fn new(host: SandboxHostV1) -> Self {
        Self {
            host,
            installed: Mutex::new(HashMap::new()),
        }
    }
}

fn handler_identity(handler: &Arc<dyn SpyHandler>) -> usize {
    Arc::as_ptr(handler) as *const () as usize
}

impl SpyInstaller for HostSpy {
    fn install(&self, namespace: &str, handler: Arc<dyn SpyHandler>) -> Result<(), SpyError> {
        let identity = handler_identity(&handler);
        let table = spy_handler_table(handler);
        let status = (self.host.spy_install)(self.host.ctx, AbiStr::new(namespace), &table);
        if status != AbiStatus::Ok {
            (table.release)(table.ctx);
            return Err(SpyError::new(format!(
                "host refused handler for `{namespace}`: {status:?}"
            )));
        }
        self.installed
            .lock()
            .insert(namespace.to_string(), (table.ctx as usize, identity));
        Ok(())
    }

    fn uninstall(&self, namespace: &str, handler: &Arc<dyn SpyHandler>) -> bool {
        let mut installed = self.installed.lock();
        let Some(&(ctx, identity)) = installed.get(namespace) else {
            return false;
        };
        if identity != handler_identity(handler) {
            return false;
        }
        installed.remove(namespace);
        (self.host.spy_uninstall)(self.host.ctx, AbiStr::new(namespace), ctx as *const c_void)
    }
}

/// Host handle of a runtime value owned on the other side of the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForeignValue {
    handle: usize,
}

impl ForeignValue {
    pub fn handle(&self) -> usize {
        self.handle
    }
}

/// Error thrown on the host side, carried by handle and message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignThrown {
    handle: usize,
    message: String,
}

impl ForeignThrown {
    pub fn handle(&self) -> usize {
        self.handle
    }
}

impl Display for ForeignThrown {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl Error for ForeignThrown {}

fn foreign(handle: AbiValue) -> Option<Value> {
    (!handle.is_null()).then(|| {
        Arc::new(ForeignValue {
            handle: handle as usize,
        }) as Value
    })
}

fn to_handle(value: &Value) -> Result<AbiValue, SpyError> {
    value
        .downcast_ref::<ForeignValue>()
        .map(|value| value.handle as AbiValue)
        .ok_or_else(|| SpyError::new("value cannot cross the core boundary"))
}

fn encode_ret(ret: Ret, error: *const AbiWriter) -> Result<AbiRet, SpyError> {
    Ok(match ret {
        Ret::None => AbiRet::none(),
        Ret::Return(value) => AbiRet {
            state: RET_STATE_RETURN,
            value: match value {
                Some(value) => to_handle(&value)?,
                None => ptr::null(),
            },
        },
        Ret::Throws(thrown) => match thrown.downcast_ref::<ForeignThrown>() {
            Some(foreign) => AbiRet {
                state: RET_STATE_THROWS,
                value: foreign.handle as AbiValue,
            },
            None => {
                unsafe { AbiWriter::write_to(error, &thrown.to_string()) };
                AbiRet {
                    state: RET_STATE_THROWS,
                    value: ptr::null(),
                }
            }
        },
    })
}

fn deliver(
    ret: *mut AbiRet,
    error: *const AbiWriter,
    event: impl FnOnce() -> SpyResult,
) -> AbiStatus {
    let outcome = catch_unwind(AssertUnwindSafe(event))
        .unwrap_or_else(|_| Err(SpyError::new("listener panicked")))
        .and_then(|outcome| encode_ret(outcome, error));
    match outcome {
        Ok(encoded) => {
            if let Some(ret) = unsafe { ret.as_mut() } {
                *ret = encoded;
            }
            AbiStatus::Ok
        }
        Err(err) => {
            unsafe { AbiWriter::write_to(error, &err.to_string()) };
            AbiStatus::Failed
        }
    }
}

unsafe fn handler_of<'a>(ctx: *const c_void) -> &'a Arc<dyn SpyHandler> {
    &*(ctx as *const Arc<dyn SpyHandler>)
}

/// Table the host dispatches `handler`'s events through.
///
/// The table owns one reference to `handler` until `release` is called.
pub fn spy_handler_table(handler: Arc<dyn SpyHandler>) -> SpyHandlerV1 {
    SpyHandlerV1 {
        ctx: Box::into_raw(Box::new(handler)) as *const c_void,
        routes: handler_routes,
        on_before: handler_on_before,
        on_return: handler_on_return,
        on_throws: handler_on_throws,
        on_line: handler_on_line,
        on_call_before: handler_on_call_before,
        on_call_return: handler_on_call_return,
        on_call_throws: handler_on_call_throws,
        release: handler_release,
    }
}

extern "C" fn handler_routes(ctx: *const c_void, listener_id: i32) -> bool {
    catch_unwind(AssertUnwindSafe(|| unsafe { handler_of(ctx) }.routes(listener_id)))
        .unwrap_or(false)
}

extern "C" fn handler_on_before(
    ctx: *const c_void,
    listener_id: i32,
    before: *const AbiBefore,
    ret: *mut AbiRet,
    error: *const AbiWriter,
) -> AbiStatus {
    deliver(ret, error, || {
        let before =
            unsafe { before.as_ref() }.ok_or_else(|| SpyError::new("missing before event"))?;
        let slots: &mut [AbiValue] = if before.arguments.is_null() {
            &mut []
        } else {
            unsafe { std::slice::from_raw_parts_mut(before.arguments, before.argument_count) }
        };
        let class_name = unsafe { before.class_name.to_str() };
        let method_name = unsafe { before.method_name.to_str() };
        let method_desc = unsafe { before.method_desc.to_str() };
        let target = foreign(before.target);
        let mut arguments: Vec<Option<Value>> = slots.iter().map(|slot| foreign(*slot)).collect();

        let outcome = unsafe { handler_of(ctx) }.on_before(
            listener_id,
            Invocation {
                target_loader_id: before.target_loader_id,
                class_name: &class_name,
                method_name: &method_name,
                method_desc: &method_desc,
                target: target.as_ref(),
                arguments: &mut arguments,
            },
        );
        for (slot, argument) in slots.iter_mut().zip(&arguments) {
            *slot = match argument {
                Some(argument) => to_handle(argument)?,
                None => ptr::null(),
            };
        }
        outcome
    })
}

extern "C" fn handler_on_return(
    ctx: *const c_void,
    listener_id: i32,
    returned: AbiValue,
    ret: *mut AbiRet,
    error: *const AbiWriter,
) -> AbiStatus {
    deliver(ret, error, || {
        let returned = foreign(returned);
        unsafe { handler_of(ctx) }.on_return(listener_id, returned.as_ref())
    })
}

extern "C" fn handler_on_throws(
    ctx: *const c_void,
    listener_id: i32,
    thrown: AbiValue,
    message: AbiStr,
    ret: *mut AbiRet,
    error: *const AbiWriter,
) -> AbiStatus {
    deliver(ret, error, || {
        let thrown: Thrown = Arc::new(ForeignThrown {
            handle: thrown as usize,
            message: unsafe { message.to_str() }.into_owned(),
        });
        unsafe { handler_of(ctx) }.on_throws(listener_id, &thrown)
    })
}

extern "C" fn handler_on_line(
    ctx: *const c_void,
    listener_id: i32,
    line_number: i32,
    ret: *mut AbiRet,
    error: *const AbiWriter,
) -> AbiStatus {
    deliver(ret, error, || {
        unsafe { handler_of(ctx) }.on_line(listener_id, line_number)
    })
}

extern "C" fn handler_on_call_before(
    ctx: *const c_void,
    listener_id: i32,
    call_site: AbiCallSite,
    ret: *mut AbiRet,
    error: *const AbiWriter,
) -> AbiStatus {
    deliver(ret, error, || {
        let owner = unsafe { call_site.owner.to_str() };
        let name = unsafe { call_site.name.to_str() };
        let desc = unsafe { call_site.desc.to_str() };
        unsafe { handler_of(ctx) }.on_call_before(
            listener_id,
            CallSite {
                line_number: call_site.line_number,
                owner: &owner,
                name: &name,
                desc: &desc,
            },
        )
    })
}

extern "C" fn handler_on_call_return(
    ctx: *const c_void,
    listener_id: i32,
    ret: *mut AbiRet,
    error: *const AbiWriter,
) -> AbiStatus {
    deliver(ret, error, || {
        unsafe { handler_of(ctx) }.on_call_return(listener_id)
    })
}

extern "C" fn handler_on_call_throws(
    ctx: *const c_void,
    listener_id: i32,
    thrown_type: AbiStr,
    ret: *mut AbiRet,
    error: *const AbiWriter,
) -> AbiStatus {
    deliver(ret, error, || {
        let thrown_type = unsafe { thrown_type.to_str() };
        unsafe { handler_of(ctx) }.on_call_throws(listener_id, &thrown_type)
    })
}

extern "C" fn handler_release(ctx: *const c_void) {
    if ctx.is_null() {
        return;
    }
    // SAFETY: produced by `spy_handler_table` and released once.
    drop(unsafe { Box::from_raw(ctx as *mut Arc<dyn SpyHandler>) });
}
