//! Change notifier: the fan-out point between the store and its views.

use std::sync::Arc;

use crate::replica::DeliveryOrigin;

/// Emitted after the store's read model may have changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeEvent {
    pub origin: DeliveryOrigin,
}

pub type Listener = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Set of change listeners. Listeners are identified by the `Arc` they
/// were registered with.
#[derive(Default)]
pub struct ChangeNotifier {
    listeners: Vec<Listener>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, listener: Listener) {
        self.listeners.push(listener);
    }

    /// Remove a listener by reference. Unknown listeners are ignored.
    pub fn unsubscribe(&mut self, listener: &Listener) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|l| !same_listener(l, listener));
        self.listeners.len() != before
    }

    pub fn emit(&self, event: &ChangeEvent) {
        log::trace!("notifying {} listener(s) of {:?}", self.listeners.len(), event);
        for listener in &self.listeners {
            listener(event);
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

// Compares data pointers only; vtable pointers of the same closure may differ
// across codegen units.
fn same_listener(a: &Listener, b: &Listener) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}
