//! Listener table: routes listener ids to event listeners.
//!
//! Reads are lock-free snapshot loads so routing never blocks the hot path;
//! writes copy the table.

use crate::spy::{CallSite, Invocation, Ret, SpyHandler, SpyResult, Thrown, Value};
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;

/// Observer bound to one listener id. Every event defaults to observing only.
pub trait EventListener: Send + Sync {
    fn before(&self, _invocation: Invocation<'_>) -> SpyResult {
        Ok(Ret::None)
    }

    fn returning(&self, _returned: Option<&Value>) -> SpyResult {
        Ok(Ret::None)
    }

    fn throwing(&self, _thrown: &Thrown) -> SpyResult {
        Ok(Ret::None)
    }

    fn line(&self, _line_number: i32) -> SpyResult {
        Ok(Ret::None)
    }

    fn call_before(&self, _call_site: CallSite<'_>) -> SpyResult {
        Ok(Ret::None)
    }

    fn call_returning(&self) -> SpyResult {
        Ok(Ret::None)
    }

    fn call_throwing(&self, _thrown_type: &str) -> SpyResult {
        Ok(Ret::None)
    }
}

/// Copy-on-write map of listener id to listener.
#[derive(Default)]
pub struct ListenerTable {
    listeners: ArcSwap<HashMap<i32, Arc<dyn EventListener>>>,
}

impl ListenerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `listener` to `listener_id`, returning the previous binding.
    pub fn register(
        &self,
        listener_id: i32,
        listener: Arc<dyn EventListener>,
    ) -> Option<Arc<dyn EventListener>> {
        let mut previous = None;
        self.listeners.rcu(|current| {
            let mut next = HashMap::clone(current);
            // rcu may retry; only the committed attempt's value survives.
            previous = next.insert(listener_id, listener.clone());
            next
        });
        previous
    }

    pub fn unregister(&self, listener_id: i32) -> Option<Arc<dyn EventListener>> {
        let mut previous = None;
        self.listeners.rcu(|current| {
            let mut next = HashMap::clone(current);
            previous = next.remove(&listener_id);
            next
        });
        previous
    }

    pub fn clear(&self) {
        self.listeners.store(Arc::new(HashMap::new()));
    }

    pub fn len(&self) -> usize {
        self.listeners.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.load().is_empty()
    }

    fn route(&self, listener_id: i32) -> Option<Arc<dyn EventListener>> {
        self.listeners.load().get(&listener_id).cloned()
    }
}

// Ids without a binding observe nothing: the augmentation layer may still
// route to listeners of a namespace that was just disposed.
impl SpyHandler for ListenerTable {
    fn routes(&self, listener_id: i32) -> bool {
        self.listeners.load().contains_key(&listener_id)
    }

    fn on_before(&self, listener_id: i32, invocation: Invocation<'_>) -> SpyResult {
        match self.route(listener_id) {
            Some(listener) => listener.before(invocation),
            None => Ok(Ret::None),
        }
    }

    fn on_return(&self, listener_id: i32, returned: Option<&Value>) -> SpyResult {
        match self.route(listener_id) {
            Some(listener) => listener.returning(returned),
            None => Ok(Ret::None),
        }
    }

    fn on_throws(&self, listener_id: i32, thrown: &Thrown) -> SpyResult {
        match self.route(listener_id) {
            Some(listener) => listener.throwing(thrown),
            None => Ok(Ret::None),
        }
    }

    fn on_line(&self, listener_id: i32, line_number: i32) -> SpyResult {
        match self.route(listener_id) {
            Some(listener) => listener.line(line_number),
            None => Ok(Ret::None),
        }
    }

    fn on_call_before(&self, listener_id: i32, call_site: CallSite<'_>) -> SpyResult {
        match self.route(listener_id) {
            Some(listener) => listener.call_before(call_site),
            None => Ok(Ret::None),
        }
    }

    fn on_call_return(&self, listener_id: i32) -> SpyResult {
        match self.route(listener_id) {
            Some(listener) => listener.call_returning(),
            None => Ok(Ret::None),
        }
    }

    fn on_call_throws(&self, listener_id: i32, thrown_type: &str) -> SpyResult {
        match self.route(listener_id) {
            Some(listener) => listener.call_throwing(thrown_type),
            None => Ok(Ret::None),
        }
    }
}
