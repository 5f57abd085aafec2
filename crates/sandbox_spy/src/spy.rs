//! Interception dispatch core.
//!
//! # Responsibility
//! - Route every augmented execution point to the installed handler.
//! - Suppress re-entry: code run by a handler never re-triggers dispatch on
//!   the same thread.
//!
//! # Invariants
//! - A thread already inside dispatch gets `Ret::None` without the handler
//!   being invoked.
//! - The barrier entry is released on every exit path, unwinding included.
//! - The hot path takes no lock other than one barrier bucket lock.
//! - Each namespace has at most one installed handler; installing or
//!   removing one namespace's handler never touches another's.

use crate::barrier::SelfCallBarrier;
use arc_swap::ArcSwap;
use once_cell::sync::Lazy;
use std::any::Any;
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;
use std::thread;

/// A runtime value crossing the interception boundary.
pub type Value = Arc<dyn Any + Send + Sync>;

/// An error thrown by augmented code or substituted by a listener.
pub type Thrown = Arc<dyn Error + Send + Sync>;

/// Numeric state codes understood by the call-site rewriting layer.
pub const RET_STATE_NONE: i32 = 0;
pub const RET_STATE_RETURN: i32 = 1;
pub const RET_STATE_THROWS: i32 = 2;

/// What the call site should do after dispatch.
#[derive(Clone)]
pub enum Ret {
    /// Observe only; keep the original flow.
    None,
    /// Return this value instead of the original result.
    Return(Option<Value>),
    /// Throw this error instead of the original result.
    Throws(Thrown),
}

impl Ret {
    pub fn state(&self) -> i32 {
        match self {
            Self::None => RET_STATE_NONE,
            Self::Return(_) => RET_STATE_RETURN,
            Self::Throws(_) => RET_STATE_THROWS,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

impl Debug for Ret {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "Ret::None"),
            Self::Return(Some(_)) => write!(f, "Ret::Return(..)"),
            Self::Return(None) => write!(f, "Ret::Return(null)"),
            Self::Throws(err) => write!(f, "Ret::Throws({err})"),
        }
    }
}

/// Context of a before-call event.
pub struct Invocation<'a> {
    pub target_loader_id: i32,
    pub class_name: &'a str,
    pub method_name: &'a str,
    pub method_desc: &'a str,
    pub target: Option<&'a Value>,
    /// Listeners may replace arguments in place.
    pub arguments: &'a mut [Option<Value>],
}

/// Source coordinates of an outgoing call inside augmented code.
#[derive(Debug, Clone, Copy)]
pub struct CallSite<'a> {
    pub line_number: i32,
    pub owner: &'a str,
    pub name: &'a str,
    pub desc: &'a str,
}

/// Failure propagated out of a handler.
#[derive(Debug)]
pub struct SpyError(Box<dyn Error + Send + Sync>);

impl SpyError {
    pub fn new(source: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        Self(source.into())
    }
}

impl Display for SpyError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "spy handler failed: {}", self.0)
    }
}

impl Error for SpyError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(self.0.as_ref())
    }
}

pub type SpyResult = Result<Ret, SpyError>;

/// Receiver of every dispatched event, keyed by listener id.
pub trait SpyHandler: Send + Sync {
    /// Whether events of `listener_id` belong to this handler.
    ///
    /// The spy offers each event to the first installed handler that routes
    /// its id.
    fn routes(&self, _listener_id: i32) -> bool {
        true
    }

    fn on_before(&self, listener_id: i32, invocation: Invocation<'_>) -> SpyResult;
    fn on_return(&self, listener_id: i32, returned: Option<&Value>) -> SpyResult;
    fn on_throws(&self, listener_id: i32, thrown: &Thrown) -> SpyResult;
    fn on_line(&self, listener_id: i32, line_number: i32) -> SpyResult;
    fn on_call_before(&self, listener_id: i32, call_site: CallSite<'_>) -> SpyResult;
    fn on_call_return(&self, listener_id: i32) -> SpyResult;
    fn on_call_throws(&self, listener_id: i32, thrown_type: &str) -> SpyResult;
}

/// Where a core runtime installs and removes its handler.
///
/// The host's spy is the only one augmented call sites dispatch through, so a
/// core never reaches for its own copy of [`global()`].
pub trait SpyInstaller: Send + Sync {
    /// Installs `handler` for `namespace`, replacing that namespace's previous
    /// handler.
    fn install(&self, namespace: &str, handler: Arc<dyn SpyHandler>) -> Result<(), SpyError>;

    /// Removes `handler` if it is the one installed for `namespace`.
    fn uninstall(&self, namespace: &str, handler: &Arc<dyn SpyHandler>) -> bool;
}

#[derive(Clone)]
struct Installed {
    namespace: String,
    handler: Arc<dyn SpyHandler>,
}

/// Dispatch core: per-namespace handler slots plus reentrancy barrier.
pub struct Spy {
    installed: ArcSwap<Vec<Installed>>,
    barrier: SelfCallBarrier,
}

static GLOBAL: Lazy<Spy> = Lazy::new(Spy::new);

/// The process-wide spy every rewritten call site dispatches through.
pub fn global() -> &'static Spy {
    &GLOBAL
}

/// [`SpyInstaller`] over [`global()`], for cores linked into the host binary.
#[derive(Debug, Default, Clone, Copy)]
pub struct GlobalSpy;

impl SpyInstaller for GlobalSpy {
    fn install(&self, namespace: &str, handler: Arc<dyn SpyHandler>) -> Result<(), SpyError> {
        global().install(namespace, handler)
    }

    fn uninstall(&self, namespace: &str, handler: &Arc<dyn SpyHandler>) -> bool {
        global().uninstall(namespace, handler)
    }
}

impl Spy {
    pub fn new() -> Self {
        Self {
            installed: ArcSwap::from_pointee(Vec::new()),
            barrier: SelfCallBarrier::new(),
        }
    }

    /// Installs `handler` for `namespace`, replacing that namespace's
    /// previous handler. Other namespaces keep theirs.
    pub fn init(&self, namespace: &str, handler: Arc<dyn SpyHandler>) {
        self.installed.rcu(|current| {
            let mut next: Vec<Installed> = current
                .iter()
                .filter(|installed| installed.namespace != namespace)
                .cloned()
                .collect();
            next.push(Installed {
                namespace: namespace.to_string(),
                handler: handler.clone(),
            });
            next
        });
    }

    /// Removes every handler; later events observe nothing.
    pub fn clean(&self) {
        self.installed.store(Arc::new(Vec::new()));
    }

    /// Removes `namespace`'s handler only if it is `handler`.
    ///
    /// Returns whether it was removed.
    pub fn clean_if_installed(&self, namespace: &str, handler: &Arc<dyn SpyHandler>) -> bool {
        let mut removed = false;
        self.installed.rcu(|current| {
            removed = false;
            current
                .iter()
                .filter(|installed| {
                    let is_same = installed.namespace == namespace
                        && same_handler(&installed.handler, handler);
                    removed |= is_same;
                    !is_same
                })
                .cloned()
                .collect::<Vec<_>>()
        });
        removed
    }

    /// Whether any namespace has a handler installed.
    pub fn is_initialized(&self) -> bool {
        !self.installed.load().is_empty()
    }

    pub fn is_installed(&self, namespace: &str) -> bool {
        self.installed
            .load()
            .iter()
            .any(|installed| installed.namespace == namespace)
    }

    pub fn barrier(&self) -> &SelfCallBarrier {
        &self.barrier
    }

    pub fn spy_method_on_before(
        &self,
        listener_id: i32,
        invocation: Invocation<'_>,
    ) -> SpyResult {
        self.dispatch(listener_id, |handler| {
            handler.on_before(listener_id, invocation)
        })
    }

    pub fn spy_method_on_return(&self, listener_id: i32, returned: Option<&Value>) -> SpyResult {
        self.dispatch(listener_id, |handler| handler.on_return(listener_id, returned))
    }

    pub fn spy_method_on_throws(&self, listener_id: i32, thrown: &Thrown) -> SpyResult {
        self.dispatch(listener_id, |handler| handler.on_throws(listener_id, thrown))
    }

    pub fn spy_method_on_line(&self, listener_id: i32, line_number: i32) -> SpyResult {
        self.dispatch(listener_id, |handler| handler.on_line(listener_id, line_number))
    }

    pub fn spy_method_on_call_before(
        &self,
        listener_id: i32,
        call_site: CallSite<'_>,
    ) -> SpyResult {
        self.dispatch(listener_id, |handler| {
            handler.on_call_before(listener_id, call_site)
        })
    }

    pub fn spy_method_on_call_return(&self, listener_id: i32) -> SpyResult {
        self.dispatch(listener_id, |handler| handler.on_call_return(listener_id))
    }

    pub fn spy_method_on_call_throws(&self, listener_id: i32, thrown_type: &str) -> SpyResult {
        self.dispatch(listener_id, |handler| {
            handler.on_call_throws(listener_id, thrown_type)
        })
    }

    fn dispatch(
        &self,
        listener_id: i32,
        call: impl FnOnce(&dyn SpyHandler) -> SpyResult,
    ) -> SpyResult {
        if self.barrier.is_entered(thread::current().id()) {
            return Ok(Ret::None);
        }
        let installed = self.installed.load_full();
        let Some(target) = installed
            .iter()
            .find(|installed| installed.handler.routes(listener_id))
        else {
            return Ok(Ret::None);
        };
        let _entered = self.barrier.guard();
        call(target.handler.as_ref())
    }
}

impl SpyInstaller for Spy {
    fn install(&self, namespace: &str, handler: Arc<dyn SpyHandler>) -> Result<(), SpyError> {
        self.init(namespace, handler);
        Ok(())
    }

    fn uninstall(&self, namespace: &str, handler: &Arc<dyn SpyHandler>) -> bool {
        self.clean_if_installed(namespace, handler)
    }
}

fn same_handler(left: &Arc<dyn SpyHandler>, right: &Arc<dyn SpyHandler>) -> bool {
    Arc::as_ptr(left) as *const () == Arc::as_ptr(right) as *const ()
}

impl Default for Spy {
    fn default() -> Self {
        Self::new()
    }
}
