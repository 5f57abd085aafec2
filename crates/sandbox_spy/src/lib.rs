//! Interception dispatch core of the sandbox.
//!
//! Every rewritten call site calls into [`global()`]; the spy consults the
//! [`SelfCallBarrier`] and forwards to the [`SpyHandler`] that routes the
//! event's listener id. Cores install their handler through a
//! [`SpyInstaller`] handed to them by the host.

pub mod barrier;
pub mod listener;
pub mod spy;

pub use barrier::{BarrierGuard, BarrierToken, SelfCallBarrier, BUCKET_COUNT};
pub use listener::{EventListener, ListenerTable};
pub use spy::{
    global, CallSite, GlobalSpy, Invocation, Ret, Spy, SpyError, SpyHandler, SpyInstaller,
    SpyResult, Thrown, Value, RET_STATE_NONE, RET_STATE_RETURN, RET_STATE_THROWS,
};
