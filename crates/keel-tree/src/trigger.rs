//! Per-tree mutation triggers.
//!
//! Triggers fire after a store, exchange, or delete commits to the
//! node. Registration is a lock-free prepend onto a singly-linked
//! list whose tail node points at itself; firing walks the list
//! without locks. Unlinking splices under a removal guard, and spliced
//! nodes are kept alive until the list drops so concurrent walkers
//! never touch freed memory.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Observes committed mutations on one tree.
pub trait Trigger: Send + Sync {
    /// Called after a mutation commits to the node. `old` is the
    /// previous value, `new` the stored one; a delete passes `None`.
    fn on_store(&self, key: &[u8], old: Option<&[u8]>, new: Option<&[u8]>);
}

struct TriggerNode {
    trigger: Arc<dyn Trigger>,
    next: AtomicPtr<TriggerNode>,
}

/// Lock-free trigger list. The tail node's next pointer refers to the
/// node itself.
pub struct TriggerList {
    head: AtomicPtr<TriggerNode>,
    removal: Mutex<Vec<Box<TriggerNode>>>,
}

impl Default for TriggerList {
    fn default() -> Self {
        Self::new()
    }
}

impl TriggerList {
    /// Creates an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            removal: Mutex::new(Vec::new()),
        }
    }

    /// Registers a trigger.
    pub fn add(&self, trigger: Arc<dyn Trigger>) {
        let node = Box::into_raw(Box::new(TriggerNode {
            trigger,
            next: AtomicPtr::new(ptr::null_mut()),
        }));
        loop {
            let head = self.head.load(Ordering::Acquire);
            let next = if head.is_null() { node } else { head };
            unsafe { (*node).next.store(next, Ordering::Relaxed) };
            if self
                .head
                .compare_exchange(head, node, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Unregisters a trigger by identity. Returns true if found.
    ///
    /// The spliced node lands in a graveyard kept alive until the list
    /// drops, so a concurrent `fire` walking through it stays safe.
    pub fn remove(&self, trigger: &Arc<dyn Trigger>) -> bool {
        let mut graveyard = self.removal.lock();
        let mut prev: *mut TriggerNode = ptr::null_mut();
        let mut current = self.head.load(Ordering::Acquire);
        while !current.is_null() {
            let node = unsafe { &*current };
            let next = node.next.load(Ordering::Acquire);
            let at_tail = next == current;
            if Arc::ptr_eq(&node.trigger, trigger) {
                let replacement = if at_tail {
                    // The predecessor, if any, becomes the tail.
                    prev
                } else {
                    next
                };
                if prev.is_null() {
                    self.head.store(replacement, Ordering::Release);
                } else {
                    unsafe { (*prev).next.store(replacement, Ordering::Release) };
                }
                graveyard.push(unsafe { Box::from_raw(current) });
                return true;
            }
            if at_tail {
                break;
            }
            prev = current;
            current = next;
        }
        false
    }

    /// Returns true if no trigger is registered.
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    /// Fires every registered trigger.
    pub fn fire(&self, key: &[u8], old: Option<&[u8]>, new: Option<&[u8]>) {
        let mut current = self.head.load(Ordering::Acquire);
        while !current.is_null() {
            let node = unsafe { &*current };
            node.trigger.on_store(key, old, new);
            let next = node.next.load(Ordering::Acquire);
            if next == current {
                break;
            }
            current = next;
        }
    }
}

impl Drop for TriggerList {
    fn drop(&mut self) {
        let mut current = *self.head.get_mut();
        while !current.is_null() {
            let node = unsafe { Box::from_raw(current) };
            let next = node.next.load(Ordering::Relaxed);
            if next == current {
                break;
            }
            current = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counter {
        fired: AtomicUsize,
    }

    impl Trigger for Counter {
        fn on_store(&self, _key: &[u8], _old: Option<&[u8]>, _new: Option<&[u8]>) {
            self.fired.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counter() -> Arc<Counter> {
        Arc::new(Counter {
            fired: AtomicUsize::new(0),
        })
    }

    #[test]
    fn test_fire_empty_list() {
        let list = TriggerList::new();
        assert!(list.is_empty());
        list.fire(b"k", None, Some(b"v"));
    }

    #[test]
    fn test_fire_reaches_all() {
        let list = TriggerList::new();
        let a = counter();
        let b = counter();
        list.add(Arc::clone(&a) as Arc<dyn Trigger>);
        list.add(Arc::clone(&b) as Arc<dyn Trigger>);

        list.fire(b"k", None, Some(b"v"));
        list.fire(b"k", Some(b"v"), None);

        assert_eq!(a.fired.load(Ordering::SeqCst), 2);
        assert_eq!(b.fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_remove_splices_out() {
        let list = TriggerList::new();
        let a = counter();
        let b = counter();
        let a_dyn = Arc::clone(&a) as Arc<dyn Trigger>;
        list.add(Arc::clone(&a_dyn));
        list.add(Arc::clone(&b) as Arc<dyn Trigger>);

        assert!(list.remove(&a_dyn));
        list.fire(b"k", None, Some(b"v"));

        assert_eq!(a.fired.load(Ordering::SeqCst), 0);
        assert_eq!(b.fired.load(Ordering::SeqCst), 1);
        assert!(!list.remove(&a_dyn));
    }
}
