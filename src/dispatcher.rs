//! Dispatcher: demultiplexes broadcast comm notifications.
//!
//! DESIGN
//! ======
//! Three independent routing tables:
//! - `comm_id → message handlers`
//! - `comm_id → close handlers`
//! - `target_name → open handlers`
//!
//! Every notification fans out to the handlers registered under its key, in
//! registration order. A notification with no handlers is dropped; buffering
//! is the channel's job once it has subscribed, not the dispatcher's.
//!
//! Tables are mutated only through the disposers handed out at registration,
//! and those are safe to call from inside a dispatch (see `listeners`). An
//! emptied key is pruned so closed channels leave nothing behind.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use tracing::debug;

use crate::host::{CloseFn, MessageFn, OpenFn};
use crate::listeners::{Disposer, ListenerList};
use crate::message::CommMessage;

// =============================================================================
// NOTIFICATION
// =============================================================================

/// An inbound comm event taken off the shared broadcast stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Open { target_name: String, comm_id: String, message: CommMessage },
    Message { comm_id: String, message: CommMessage },
    Close { comm_id: String },
}

impl Notification {
    /// The comm this notification is about.
    #[must_use]
    pub fn comm_id(&self) -> &str {
        match self {
            Self::Open { comm_id, .. } | Self::Message { comm_id, .. } | Self::Close { comm_id } => comm_id,
        }
    }
}

// =============================================================================
// ROUTING TABLE
// =============================================================================

struct Table<F: ?Sized> {
    lists: RefCell<HashMap<String, ListenerList<F>>>,
}

impl<F: ?Sized> Table<F> {
    fn new() -> Self {
        Self { lists: RefCell::new(HashMap::new()) }
    }

    fn listeners(&self, key: &str) -> Option<ListenerList<F>> {
        self.lists.borrow().get(key).cloned()
    }

    fn count(&self, key: &str) -> usize {
        self.lists.borrow().get(key).map_or(0, ListenerList::len)
    }

    fn keys(&self) -> usize {
        self.lists.borrow().len()
    }

    fn key_list(&self) -> Vec<String> {
        self.lists.borrow().keys().cloned().collect()
    }

    fn prune(&self, key: &str, list: &ListenerList<F>) {
        let mut lists = self.lists.borrow_mut();
        if lists
            .get(key)
            .is_some_and(|current| current.same_list(list) && current.is_empty())
        {
            lists.remove(key);
        }
    }

    fn clear(&self) {
        let drained: Vec<ListenerList<F>> = self.lists.borrow_mut().drain().map(|(_, l)| l).collect();
        for list in drained {
            list.clear();
        }
    }
}

impl<F: ?Sized + 'static> Table<F> {
    fn add(this: &Rc<Self>, key: &str, handler: Rc<F>) -> Disposer {
        let list = this
            .lists
            .borrow_mut()
            .entry(key.to_owned())
            .or_default()
            .clone();
        let removal = list.push(handler);

        let table = Rc::downgrade(this);
        let key = key.to_owned();
        Disposer::new(move || {
            removal.dispose();
            if let Some(table) = table.upgrade() {
                table.prune(&key, &list);
            }
        })
    }
}

// =============================================================================
// DISPATCHER
// =============================================================================

/// Routing tables for one kernel session. Clones share the same tables.
#[derive(Clone)]
pub struct Dispatcher {
    messages: Rc<Table<MessageFn>>,
    closes: Rc<Table<CloseFn>>,
    opens: Rc<Table<OpenFn>>,
}

impl Dispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self { messages: Rc::new(Table::new()), closes: Rc::new(Table::new()), opens: Rc::new(Table::new()) }
    }

    pub fn add_message_listener(&self, comm_id: &str, handler: Box<MessageFn>) -> Disposer {
        Table::add(&self.messages, comm_id, Rc::from(handler))
    }

    pub fn add_close_listener(&self, comm_id: &str, handler: Box<CloseFn>) -> Disposer {
        Table::add(&self.closes, comm_id, Rc::from(handler))
    }

    pub fn add_open_listener(&self, target_name: &str, handler: Box<OpenFn>) -> Disposer {
        Table::add(&self.opens, target_name, Rc::from(handler))
    }

    /// Route one notification. Returns how many handlers were invoked.
    pub fn dispatch(&self, notification: &Notification) -> usize {
        match notification {
            Notification::Open { target_name, comm_id, message } => self.dispatch_open(target_name, comm_id, message),
            Notification::Message { comm_id, message } => self.dispatch_message(comm_id, message),
            Notification::Close { comm_id } => self.dispatch_close(comm_id),
        }
    }

    pub fn dispatch_open(&self, target_name: &str, comm_id: &str, message: &CommMessage) -> usize {
        let Some(listeners) = self.opens.listeners(target_name) else {
            debug!(%target_name, %comm_id, "dispatch: no target registered, open dropped");
            return 0;
        };
        listeners.for_each(|handler| handler(comm_id, message))
    }

    pub fn dispatch_message(&self, comm_id: &str, message: &CommMessage) -> usize {
        let Some(listeners) = self.messages.listeners(comm_id) else {
            debug!(%comm_id, "dispatch: no listener, message dropped");
            return 0;
        };
        listeners.for_each(|handler| handler(message))
    }

    pub fn dispatch_close(&self, comm_id: &str) -> usize {
        let Some(listeners) = self.closes.listeners(comm_id) else {
            debug!(%comm_id, "dispatch: no listener, close dropped");
            return 0;
        };
        listeners.for_each(|handler| handler())
    }

    #[must_use]
    pub fn message_listener_count(&self, comm_id: &str) -> usize {
        self.messages.count(comm_id)
    }

    #[must_use]
    pub fn close_listener_count(&self, comm_id: &str) -> usize {
        self.closes.count(comm_id)
    }

    #[must_use]
    pub fn open_listener_count(&self, target_name: &str) -> usize {
        self.opens.count(target_name)
    }

    /// True when no key in any table has a registration.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.keys() == 0 && self.closes.keys() == 0 && self.opens.keys() == 0
    }

    /// Session teardown: deliver a close to every comm that still has close
    /// handlers, exactly as a remote close would, then `clear`. Nothing is
    /// sent anywhere. Returns how many close handlers were invoked.
    pub fn close_all(&self) -> usize {
        let comm_ids = self.closes.key_list();
        debug!(comms = comm_ids.len(), "dispatch: closing every comm");
        let invoked: usize = comm_ids.iter().map(|comm_id| self.dispatch_close(comm_id)).sum();
        self.clear();
        invoked
    }

    /// Drop every registration in every table. Outstanding disposers become no-ops.
    pub fn clear(&self) {
        self.messages.clear();
        self.closes.clear();
        self.opens.clear();
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "dispatcher_test.rs"]
mod tests;
