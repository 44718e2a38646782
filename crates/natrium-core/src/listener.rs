#![forbid(unsafe_code)]

//! Listener registry and the RAII [`Listener`] handle.
//!
//! # Invariants
//!
//! 1. Each registered callback runs at most once per delivery, in
//!    registration order.
//! 2. A callback deregistered during a delivery pass is not invoked for the
//!    remainder of that pass; its entry is removed once the pass ends.
//! 3. A panicking callback does not prevent later callbacks of the same pass
//!    from running (when isolation is enabled in [`RuntimeConfig`]).
//!
//! # Failure Modes
//!
//! - A callback that re-enters its own registry (for example by sending to
//!   the stream it observes) is skipped for the nested delivery instead of
//!   aliasing its `FnMut` state.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::error;

use crate::config::RuntimeConfig;
use crate::error::Error;
use crate::transaction;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

type Callback<T> = Rc<RefCell<dyn FnMut(&T)>>;

struct Entry<T> {
    id: u64,
    active: Rc<Cell<bool>>,
    callback: Callback<T>,
}

impl<T> Clone for Entry<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            active: Rc::clone(&self.active),
            callback: Rc::clone(&self.callback),
        }
    }
}

pub(crate) struct ListenerRegistry<T> {
    entries: RefCell<Vec<Entry<T>>>,
    /// Depth of nested delivery passes.
    delivering: Cell<u32>,
    /// Ids removed mid-delivery, pruned when the outermost pass ends.
    pending_removals: RefCell<Vec<u64>>,
}

impl<T> Default for ListenerRegistry<T> {
    fn default() -> Self {
        Self {
            entries: RefCell::new(Vec::new()),
            delivering: Cell::new(0),
            pending_removals: RefCell::new(Vec::new()),
        }
    }
}

impl<T: 'static> ListenerRegistry<T> {
    /// Register `callback`, returning its id and its liveness flag.
    pub(crate) fn add(&self, callback: impl FnMut(&T) + 'static) -> (u64, Rc<Cell<bool>>) {
        let id = NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed);
        let active = Rc::new(Cell::new(true));
        self.entries.borrow_mut().push(Entry {
            id,
            active: Rc::clone(&active),
            callback: Rc::new(RefCell::new(callback)),
        });
        (id, active)
    }

    pub(crate) fn remove(&self, id: u64) {
        if self.delivering.get() > 0 {
            self.pending_removals.borrow_mut().push(id);
            return;
        }
        self.entries.borrow_mut().retain(|entry| entry.id != id);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.borrow().iter().all(|entry| !entry.active.get())
    }

    /// Deliver `value` to every active callback.
    pub(crate) fn notify(&self, value: &T) {
        let snapshot: Vec<Entry<T>> = self.entries.borrow().clone();
        if snapshot.is_empty() {
            return;
        }
        let isolate = RuntimeConfig::current().isolate_listener_panics;
        let _pass = DeliveryPass::enter(self);
        for entry in &snapshot {
            if !entry.active.get() {
                continue;
            }
            let Ok(mut callback) = entry.callback.try_borrow_mut() else {
                continue;
            };
            if isolate {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| (&mut *callback)(value)));
                if let Err(payload) = outcome {
                    let message = panic_message(payload.as_ref());
                    error!(listener = entry.id, reason = %message, "listener panicked");
                    transaction::record_failure(Error::ListenerPanicked {
                        listener: entry.id,
                        message,
                    });
                }
            } else {
                (&mut *callback)(value);
            }
        }
    }

    fn finish_pass(&self) {
        self.delivering.set(self.delivering.get() - 1);
        if self.delivering.get() == 0 {
            let removals = std::mem::take(&mut *self.pending_removals.borrow_mut());
            if !removals.is_empty() {
                self.entries
                    .borrow_mut()
                    .retain(|entry| !removals.contains(&entry.id));
            }
        }
    }
}

/// Marks a delivery pass; removals requested during it apply on drop, even
/// when a callback unwinds.
struct DeliveryPass<'a, T: 'static>(&'a ListenerRegistry<T>);

impl<'a, T: 'static> DeliveryPass<'a, T> {
    fn enter(registry: &'a ListenerRegistry<T>) -> Self {
        registry.delivering.set(registry.delivering.get() + 1);
        Self(registry)
    }
}

impl<T: 'static> Drop for DeliveryPass<'_, T> {
    fn drop(&mut self) {
        self.0.finish_pass();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Registration handle returned by `listen`.
///
/// Dropping the handle deregisters the callback, as does calling
/// [`Listener::unlisten`]. Once either returns, the callback is never
/// invoked again; a delivery already in progress for another callback is
/// not interrupted.
#[must_use = "dropping a Listener deregisters its callback"]
pub struct Listener {
    id: u64,
    unlisten: RefCell<Option<Box<dyn FnOnce()>>>,
}

impl Listener {
    pub(crate) fn new<T: 'static>(
        registry: &Rc<ListenerRegistry<T>>,
        id: u64,
        active: Rc<Cell<bool>>,
        keep_alive: Box<dyn Any>,
    ) -> Self {
        let registry: Weak<ListenerRegistry<T>> = Rc::downgrade(registry);
        Self {
            id,
            unlisten: RefCell::new(Some(Box::new(move || {
                active.set(false);
                if let Some(registry) = registry.upgrade() {
                    registry.remove(id);
                }
                drop(keep_alive);
            }))),
        }
    }

    /// Combine two handles into one that deregisters both.
    pub fn append(self, other: Listener) -> Listener {
        let id = self.id;
        Self {
            id,
            unlisten: RefCell::new(Some(Box::new(move || {
                self.unlisten();
                other.unlisten();
            }))),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Deregister the callback. Idempotent.
    pub fn unlisten(&self) {
        let unlisten = self.unlisten.borrow_mut().take();
        if let Some(unlisten) = unlisten {
            unlisten();
        }
    }

    /// Keep the callback registered for the lifetime of the thread.
    pub fn forget(self) {
        let unlisten = self.unlisten.borrow_mut().take();
        if let Some(unlisten) = unlisten {
            std::mem::forget(unlisten);
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.unlisten();
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("active", &self.unlisten.borrow().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn recorder(registry: &Rc<ListenerRegistry<i32>>) -> (Listener, Rc<RefCell<Vec<i32>>>) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = Rc::clone(&seen);
        let (id, active) = registry.add(move |v: &i32| s.borrow_mut().push(*v));
        (Listener::new(registry, id, active, Box::new(())), seen)
    }

    #[test]
    fn delivers_in_registration_order() {
        let registry = Rc::new(ListenerRegistry::default());
        let order = Rc::new(RefCell::new(Vec::new()));
        let mut handles = Vec::new();
        for tag in 0..3 {
            let o = Rc::clone(&order);
            let (id, active) = registry.add(move |_: &i32| o.borrow_mut().push(tag));
            handles.push(Listener::new(&registry, id, active, Box::new(())));
        }
        registry.notify(&1);
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn drop_deregisters() {
        let registry = Rc::new(ListenerRegistry::default());
        let (handle, seen) = recorder(&registry);
        registry.notify(&1);
        drop(handle);
        registry.notify(&2);
        assert_eq!(*seen.borrow(), vec![1]);
        assert!(registry.is_empty());
    }

    #[test]
    fn unlisten_during_delivery_skips_later_entries() {
        let registry = Rc::new(ListenerRegistry::default());
        let slot: Rc<RefCell<Option<Listener>>> = Rc::new(RefCell::new(None));
        let s = Rc::clone(&slot);
        let (id, active) = registry.add(move |_: &i32| {
            if let Some(handle) = s.borrow().as_ref() {
                handle.unlisten();
            }
        });
        let first = Listener::new(&registry, id, active, Box::new(()));
        let (second, seen) = recorder(&registry);
        *slot.borrow_mut() = Some(second);
        registry.notify(&5);
        assert!(seen.borrow().is_empty());
        assert_eq!(registry.entries.borrow().len(), 1);
        drop(first);
    }

    #[traced_test]
    #[test]
    fn panicking_listener_does_not_block_others() {
        let registry = Rc::new(ListenerRegistry::default());
        let (id, active) = registry.add(|_: &i32| panic!("listener failure"));
        let _bad = Listener::new(&registry, id, active, Box::new(()));
        let (_good, seen) = recorder(&registry);
        registry.notify(&9);
        assert_eq!(*seen.borrow(), vec![9]);
        assert!(logs_contain("listener panicked"));
        assert!(logs_contain("listener failure"));
    }

    #[test]
    fn unwinding_listener_still_applies_removals() {
        RuntimeConfig {
            isolate_listener_panics: false,
            ..RuntimeConfig::default()
        }
        .install();
        let registry = Rc::new(ListenerRegistry::default());
        let (victim, seen) = recorder(&registry);
        let slot = Rc::new(RefCell::new(Some(victim)));
        let s = Rc::clone(&slot);
        let (id, active) = registry.add(move |_: &i32| {
            if let Some(victim) = s.borrow_mut().take() {
                victim.unlisten();
            }
            panic!("unisolated failure");
        });
        let _bad = Listener::new(&registry, id, active, Box::new(()));
        let result = panic::catch_unwind(AssertUnwindSafe(|| registry.notify(&4)));
        RuntimeConfig::default().install();

        assert!(result.is_err());
        assert_eq!(registry.delivering.get(), 0);
        assert!(registry.pending_removals.borrow().is_empty());
        assert_eq!(registry.entries.borrow().len(), 1);
        assert_eq!(*seen.borrow(), vec![4]);
    }

    #[test]
    fn append_deregisters_both() {
        let registry = Rc::new(ListenerRegistry::default());
        let (a, seen_a) = recorder(&registry);
        let (b, seen_b) = recorder(&registry);
        let both = a.append(b);
        both.unlisten();
        both.unlisten();
        registry.notify(&3);
        assert!(seen_a.borrow().is_empty());
        assert!(seen_b.borrow().is_empty());
    }

    #[test]
    fn panic_payloads_are_rendered() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42_u8), "non-string panic payload");
    }
}
