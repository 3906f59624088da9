//! Ordered callback lists and their disposers.
//!
//! DESIGN
//! ======
//! A `ListenerList` is shared (`Rc`) between its owner and every disposer it
//! hands out. Dispatch walks a snapshot of the entries, so a callback may add
//! or dispose listeners, its own or a sibling's, while the walk is running:
//! - a sibling disposed mid-dispatch is skipped (its `active` flag is cleared)
//! - a listener added mid-dispatch first fires on the next notification
//!
//! No `RefCell` borrow is held while a callback runs.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

// =============================================================================
// DISPOSER
// =============================================================================

/// Removes one registration. Cloneable; only the first `dispose` does work.
#[derive(Clone)]
pub struct Disposer {
    action: Rc<Cell<Option<Box<dyn FnOnce()>>>>,
}

impl Disposer {
    pub fn new(action: impl FnOnce() + 'static) -> Self {
        Self { action: Rc::new(Cell::new(Some(Box::new(action)))) }
    }

    /// A disposer with nothing to release.
    #[must_use]
    pub fn noop() -> Self {
        Self { action: Rc::new(Cell::new(None)) }
    }

    /// Run the removal. Subsequent calls, on this value or any clone, are no-ops.
    pub fn dispose(&self) {
        if let Some(action) = self.action.take() {
            action();
        }
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        let action = self.action.take();
        let disposed = action.is_none();
        self.action.set(action);
        disposed
    }

    /// Combine two disposers into one that releases both, in order.
    #[must_use]
    pub fn and(self, other: Disposer) -> Self {
        Self::new(move || {
            self.dispose();
            other.dispose();
        })
    }
}

impl fmt::Debug for Disposer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disposer")
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

// =============================================================================
// LISTENER LIST
// =============================================================================

struct Entry<F: ?Sized> {
    id: u64,
    active: Cell<bool>,
    callback: Rc<F>,
}

struct Inner<F: ?Sized> {
    next_id: u64,
    entries: Vec<Rc<Entry<F>>>,
}

/// Insertion-ordered callbacks. Clones share the same underlying list.
pub struct ListenerList<F: ?Sized> {
    inner: Rc<RefCell<Inner<F>>>,
}

impl<F: ?Sized> ListenerList<F> {
    #[must_use]
    pub fn new() -> Self {
        Self { inner: Rc::new(RefCell::new(Inner { next_id: 0, entries: Vec::new() })) }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.borrow().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.borrow().entries.is_empty()
    }

    /// True when both handles point at the same list.
    #[must_use]
    pub fn same_list(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Invoke `call` with every callback that is still registered, in
    /// registration order. Returns how many were invoked.
    pub fn for_each(&self, mut call: impl FnMut(&F)) -> usize {
        let snapshot = self.inner.borrow().entries.clone();
        let mut invoked = 0;
        for entry in snapshot {
            if !entry.active.get() {
                continue;
            }
            call(entry.callback.as_ref());
            invoked += 1;
        }
        invoked
    }

    /// Drop every registration. Outstanding disposers become no-ops.
    pub fn clear(&self) {
        let drained = std::mem::take(&mut self.inner.borrow_mut().entries);
        for entry in &drained {
            entry.active.set(false);
        }
    }
}

impl<F: ?Sized + 'static> ListenerList<F> {
    /// Append a callback. The returned disposer removes exactly this entry.
    pub fn push(&self, callback: Rc<F>) -> Disposer {
        let id = {
            let mut inner = self.inner.borrow_mut();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.entries.push(Rc::new(Entry { id, active: Cell::new(true), callback }));
            id
        };

        let weak = Rc::downgrade(&self.inner);
        Disposer::new(move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let removed = {
                let mut inner = inner.borrow_mut();
                let pos = inner.entries.iter().position(|e| e.id == id);
                pos.map(|pos| inner.entries.remove(pos))
            };
            if let Some(entry) = removed {
                entry.active.set(false);
            }
        })
    }
}

impl<F: ?Sized> Clone for ListenerList<F> {
    fn clone(&self) -> Self {
        Self { inner: Rc::clone(&self.inner) }
    }
}

impl<F: ?Sized> Default for ListenerList<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: ?Sized> fmt::Debug for ListenerList<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerList")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
#[path = "listeners_test.rs"]
mod tests;
