//! C-ABI tables between the agent and a separately built core archive.
//!
//! # Responsibility
//! - Define the `#[repr(C)]` tables exchanged through `sandbox_core_entry_v1`.
//! - Carry the configure/server lifecycle, the instrumentation handle and the
//!   spy bridge using only C-representable data.
//!
//! # Invariants
//! - Only integers, borrowed UTF-8 slices, opaque pointers and `extern "C"`
//!   function pointers cross; no Rust type with a compiler-chosen layout does.
//! - An [`AbiStr`] is valid for the duration of the call it is passed to.
//! - Every context handed across travels with the function that releases it;
//!   the receiving side calls that function exactly once.
//! - Value handles are owned by the host and valid for one event only.
//!
//! # See also
//! - `sandbox_core::cabi` for the core side, `sandbox_agent::guest` for the
//!   host side.

use crate::instrumentation::Instrumentation;
use crate::unit::{IntrospectionError, LoadedUnit, UnitRef, UnitStructure};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::ffi::c_void;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

/// Version both sides of the core entry must agree on.
pub const CORE_ABI_VERSION: u32 = 1;

/// Symbol of the [`CoreEntryV1`] function exported by a core archive.
pub const CORE_ENTRY_SYMBOL: &[u8] = b"sandbox_core_entry_v1\0";

/// Outcome of every call across the boundary.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbiStatus {
    Ok = 0,
    Failed = 1,
    Incompatible = 2,
    InvalidConfigure = 3,
    NotBound = 4,
}

/// Borrowed UTF-8 slice.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AbiStr {
    pub ptr: *const u8,
    pub len: usize,
}

impl AbiStr {
    pub fn new(value: &str) -> Self {
        Self {
            ptr: value.as_ptr(),
            len: value.len(),
        }
    }

    pub const fn empty() -> Self {
        Self {
            ptr: std::ptr::null(),
            len: 0,
        }
    }

    /// Reads the slice, replacing invalid UTF-8.
    ///
    /// # Safety
    /// `ptr` must be null or point to `len` readable bytes that outlive `'a`.
    pub unsafe fn to_str<'a>(self) -> Cow<'a, str> {
        if self.ptr.is_null() {
            return Cow::Borrowed("");
        }
        String::from_utf8_lossy(std::slice::from_raw_parts(self.ptr, self.len))
    }
}

/// Sink for strings produced on the far side of a call.
#[repr(C)]
pub struct AbiWriter {
    pub ctx: *mut c_void,
    pub write: extern "C" fn(ctx: *mut c_void, value: AbiStr),
}

impl AbiWriter {
    /// Writer appending to `target`; valid while `target` is not moved.
    pub fn for_string(target: &mut String) -> Self {
        Self {
            ctx: target as *mut String as *mut c_void,
            write: append_to_string,
        }
    }

    /// Writes `value` through `writer`; a null writer discards it.
    ///
    /// # Safety
    /// `writer` must be null or point to a live writer.
    pub unsafe fn write_to(writer: *const AbiWriter, value: &str) {
        if let Some(writer) = writer.as_ref() {
            (writer.write)(writer.ctx, AbiStr::new(value));
        }
    }
}

extern "C" fn append_to_string(ctx: *mut c_void, value: AbiStr) {
    // SAFETY: `ctx` comes from `for_string` and the string outlives the call.
    let target = unsafe { &mut *(ctx as *mut String) };
    target.push_str(&unsafe { value.to_str() });
}

/// Socket address without Rust layout: family 4 or 6, big-endian octets.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AbiSocketAddr {
    pub family: u8,
    pub octets: [u8; 16],
    pub port: u16,
}

impl AbiSocketAddr {
    /// `None` for an unknown family.
    pub fn to_socket_addr(self) -> Option<SocketAddr> {
        let ip = match self.family {
            4 => {
                let [a, b, c, d, ..] = self.octets;
                IpAddr::V4(Ipv4Addr::new(a, b, c, d))
            }
            6 => IpAddr::V6(Ipv6Addr::from(self.octets)),
            _ => return None,
        };
        Some(SocketAddr::new(ip, self.port))
    }
}

impl From<SocketAddr> for AbiSocketAddr {
    fn from(value: SocketAddr) -> Self {
        let mut octets = [0_u8; 16];
        let family = match value.ip() {
            IpAddr::V4(ip) => {
                octets[..4].copy_from_slice(&ip.octets());
                4
            }
            IpAddr::V6(ip) => {
                octets = ip.octets();
                6
            }
        };
        Self {
            family,
            octets,
            port: value.port(),
        }
    }
}

/// Host handle of a runtime value or thrown error; null means none.
pub type AbiValue = *const c_void;

/// Handler verdict: a spy `RET_STATE_*` code plus the substituted handle.
///
/// `value` is null when nothing is substituted or when the core substituted
/// an error the host never handed out; its message then goes to the call's
/// writer.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AbiRet {
    pub state: i32,
    pub value: AbiValue,
}

impl AbiRet {
    pub const fn none() -> Self {
        Self {
            state: 0,
            value: std::ptr::null(),
        }
    }
}

/// Before-call event. The core may overwrite `arguments` with handles it
/// received in the same event, or with null.
#[repr(C)]
pub struct AbiBefore {
    pub target_loader_id: i32,
    pub class_name: AbiStr,
    pub method_name: AbiStr,
    pub method_desc: AbiStr,
    pub target: AbiValue,
    pub arguments: *mut AbiValue,
    pub argument_count: usize,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AbiCallSite {
    pub line_number: i32,
    pub owner: AbiStr,
    pub name: AbiStr,
    pub desc: AbiStr,
}

/// Event receiver a core installs into the host spy.
///
/// Each event function fills `ret` on [`AbiStatus::Ok`] and writes the
/// handler's failure to the writer otherwise.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SpyHandlerV1 {
    pub ctx: *const c_void,
    pub routes: extern "C" fn(ctx: *const c_void, listener_id: i32) -> bool,
    pub on_before: extern "C" fn(
        ctx: *const c_void,
        listener_id: i32,
        before: *const AbiBefore,
        ret: *mut AbiRet,
        error: *const AbiWriter,
    ) -> AbiStatus,
    pub on_return: extern "C" fn(
        ctx: *const c_void,
        listener_id: i32,
        returned: AbiValue,
        ret: *mut AbiRet,
        error: *const AbiWriter,
    ) -> AbiStatus,
    pub on_throws: extern "C" fn(
        ctx: *const c_void,
        listener_id: i32,
        thrown: AbiValue,
        message: AbiStr,
        ret: *mut AbiRet,
        error: *const AbiWriter,
    ) -> AbiStatus,
    pub on_line: extern "C" fn(
        ctx: *const c_void,
        listener_id: i32,
        line_number: i32,
        ret: *mut AbiRet,
        error: *const AbiWriter,
    ) -> AbiStatus,
    pub on_call_before: extern "C" fn(
        ctx: *const c_void,
        listener_id: i32,
        call_site: AbiCallSite,
        ret: *mut AbiRet,
        error: *const AbiWriter,
    ) -> AbiStatus,
    pub on_call_return: extern "C" fn(
        ctx: *const c_void,
        listener_id: i32,
        ret: *mut AbiRet,
        error: *const AbiWriter,
    ) -> AbiStatus,
    pub on_call_throws: extern "C" fn(
        ctx: *const c_void,
        listener_id: i32,
        thrown_type: AbiStr,
        ret: *mut AbiRet,
        error: *const AbiWriter,
    ) -> AbiStatus,
    pub release: extern "C" fn(ctx: *const c_void),
}

// SAFETY: `ctx` is a shared, thread-safe handler owned by the table.
unsafe impl Send for SpyHandlerV1 {}
unsafe impl Sync for SpyHandlerV1 {}

/// Instrumentation handle lent to a core for one bound server.
#[repr(C)]
pub struct InstrumentationV1 {
    pub ctx: *const c_void,
    /// Writes the loaded set as produced by [`UnitSnapshot::encode_all`].
    pub loaded_units: extern "C" fn(ctx: *const c_void, out: *const AbiWriter) -> AbiStatus,
    pub append_to_bootstrap_search:
        extern "C" fn(ctx: *const c_void, archive: AbiStr, error: *const AbiWriter) -> AbiStatus,
    pub release: extern "C" fn(ctx: *const c_void),
}

// SAFETY: `ctx` is a shared, thread-safe instrumentation handle.
unsafe impl Send for InstrumentationV1 {}
unsafe impl Sync for InstrumentationV1 {}

/// Services the host offers a core.
///
/// On [`AbiStatus::Ok`] from `spy_install` the host owns the handler table and
/// releases it once uninstalled and idle; on any other status the core keeps
/// it.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SandboxHostV1 {
    pub abi_version: u32,
    pub ctx: *const c_void,
    /// `log::Level` as `u32`; absent when the core shares the host's logger.
    pub log: Option<extern "C" fn(level: u32, target: AbiStr, message: AbiStr)>,
    pub spy_install: extern "C" fn(
        ctx: *const c_void,
        namespace: AbiStr,
        handler: *const SpyHandlerV1,
    ) -> AbiStatus,
    pub spy_uninstall:
        extern "C" fn(ctx: *const c_void, namespace: AbiStr, handler_ctx: *const c_void) -> bool,
}

// SAFETY: `ctx` is host state that outlives every server of the core and is
// only touched behind its own locks.
unsafe impl Send for SandboxHostV1 {}
unsafe impl Sync for SandboxHostV1 {}

/// Configure/server lifecycle a core offers the host.
///
/// `server_bind` takes ownership of `inst` whatever its outcome.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SandboxCoreV1 {
    pub abi_version: u32,
    pub configure_new: extern "C" fn(
        feature: AbiStr,
        properties_path: AbiStr,
        out: *mut *mut c_void,
        error: *const AbiWriter,
    ) -> AbiStatus,
    pub configure_free: extern "C" fn(configure: *mut c_void),
    pub server_new: extern "C" fn(host: *const SandboxHostV1) -> *mut c_void,
    pub server_free: extern "C" fn(server: *mut c_void),
    pub server_is_bind: extern "C" fn(server: *const c_void) -> bool,
    pub server_bind: extern "C" fn(
        server: *const c_void,
        configure: *const c_void,
        inst: InstrumentationV1,
        error: *const AbiWriter,
    ) -> AbiStatus,
    pub server_destroy: extern "C" fn(server: *const c_void),
    pub server_local: extern "C" fn(server: *const c_void, out: *mut AbiSocketAddr) -> AbiStatus,
}

/// Entry point exported by a core archive under [`CORE_ENTRY_SYMBOL`].
pub type CoreEntryV1 =
    unsafe extern "C" fn(host: *const SandboxHostV1, out: *mut SandboxCoreV1) -> AbiStatus;

/// Detached record of one loaded unit as it crosses the boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitSnapshot {
    /// Identity of the unit handle on the host; equal ids are one unit.
    pub id: u64,
    pub name: String,
    pub modifiable: bool,
    /// Introspection outcome; the error keeps only its message.
    pub structure: Result<UnitStructure, String>,
}

impl UnitSnapshot {
    pub fn capture(inst: &dyn Instrumentation, unit: &UnitRef) -> Self {
        Self {
            id: Arc::as_ptr(unit) as *const () as usize as u64,
            name: unit.name().to_string(),
            modifiable: inst.is_modifiable_unit(unit.as_ref()),
            structure: unit.structure().map_err(|err| err.message),
        }
    }

    pub fn encode_all(units: &[UnitSnapshot]) -> Result<String, serde_json::Error> {
        serde_json::to_string(units)
    }

    pub fn decode_all(json: &str) -> Result<Vec<UnitSnapshot>, serde_json::Error> {
        serde_json::from_str(json)
    }
}

impl LoadedUnit for UnitSnapshot {
    fn name(&self) -> &str {
        &self.name
    }

    fn structure(&self) -> Result<UnitStructure, IntrospectionError> {
        self.structure
            .clone()
            .map_err(|message| IntrospectionError::new(&self.name, message))
    }

    fn captured_modifiable(&self) -> Option<bool> {
        Some(self.modifiable)
    }
}
