//! Comm channel: one addressable, stateful link to the kernel.
//!
//! DESIGN
//! ======
//! A channel subscribes itself to its host the moment it is constructed, so
//! inbound messages are captured even before `open` resolves. Until a
//! consumer attaches with `on_message`, messages accumulate in a buffer;
//! each newly attached listener drains whatever is buffered, in arrival
//! order, exactly once. Module loading and message arrival are not ordered
//! relative to each other, and nothing may be lost in between.
//!
//! LIFECYCLE
//! =========
//! `Unopened → Open → Closed`. Kernel-initiated channels start `Open`.
//! `Closed` is terminal: listeners are dropped, dispatcher subscriptions
//! are released, and sends fail fast.
//!
//! ERROR HANDLING
//! ==============
//! - failed open: local teardown, then `ChannelError::Open`
//! - failed send: `ChannelError::Send`, channel stays `Open`
//! - failed close send: logged, never returned; teardown already happened
//!
//! Consumer callbacks are infallible. A panicking callback unwinds through
//! the dispatch and later listeners miss that notification; no borrow is
//! held across a callback, so channel state stays consistent.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::host::{CloseFn, CommHost, MessageFn, TransportError};
use crate::listeners::{Disposer, ListenerList};
use crate::message::CommMessage;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Unopened,
    Open,
    Closed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unopened => write!(f, "unopened"),
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("failed to open comm {comm_id}: {source}")]
    Open {
        comm_id: String,
        #[source]
        source: TransportError,
    },
    #[error("failed to send on comm {comm_id}: {source}")]
    Send {
        comm_id: String,
        #[source]
        source: TransportError,
    },
    #[error("cannot {op} comm {comm_id} while {state}")]
    InvalidState { comm_id: String, op: &'static str, state: ChannelState },
}

// =============================================================================
// SHARED STATE
// =============================================================================

/// State reachable from both the channel and the handlers it registered
/// with the host.
struct Shared {
    comm_id: String,
    state: Cell<ChannelState>,
    message_listeners: ListenerList<MessageFn>,
    close_listeners: ListenerList<CloseFn>,
    buffer: RefCell<Vec<CommMessage>>,
    subscriptions: RefCell<Option<Disposer>>,
    /// Set by a local `close` that found the channel `Unopened`. An open
    /// still in flight owes the kernel a close once it resolves.
    close_on_open: Cell<bool>,
}

impl Shared {
    fn deliver(&self, message: &CommMessage) {
        if self.message_listeners.is_empty() {
            self.buffer.borrow_mut().push(message.clone());
            debug!(comm_id = %self.comm_id, buffered = self.buffer.borrow().len(), "comm: message buffered");
            return;
        }
        self.message_listeners.for_each(|callback| callback(message));
    }

    /// Move to `Closed`: notify close listeners once, release host
    /// subscriptions, drop every listener and buffered message. Returns the
    /// state the channel was in; only the first call does any work.
    fn shutdown(&self) -> ChannelState {
        let previous = self.state.replace(ChannelState::Closed);
        if previous == ChannelState::Closed {
            return previous;
        }

        self.close_listeners.for_each(|callback| callback());

        let subscriptions = self.subscriptions.borrow_mut().take();
        if let Some(subscriptions) = subscriptions {
            subscriptions.dispose();
        }
        self.close_listeners.clear();
        self.message_listeners.clear();
        self.buffer.borrow_mut().clear();

        debug!(comm_id = %self.comm_id, from = %previous, "comm: closed");
        previous
    }
}

// =============================================================================
// CHANNEL
// =============================================================================

pub struct CommChannel {
    shared: Rc<Shared>,
    host: Rc<dyn CommHost>,
}

impl CommChannel {
    /// Create a locally initiated channel. It listens immediately but stays
    /// `Unopened` until `open` succeeds.
    pub fn new(comm_id: impl Into<String>, host: Rc<dyn CommHost>) -> Self {
        Self::subscribe(comm_id.into(), host, ChannelState::Unopened)
    }

    /// Wrap a channel the kernel has already opened.
    pub fn accept(comm_id: impl Into<String>, host: Rc<dyn CommHost>) -> Self {
        Self::subscribe(comm_id.into(), host, ChannelState::Open)
    }

    fn subscribe(comm_id: String, host: Rc<dyn CommHost>, state: ChannelState) -> Self {
        let shared = Rc::new(Shared {
            comm_id,
            state: Cell::new(state),
            message_listeners: ListenerList::new(),
            close_listeners: ListenerList::new(),
            buffer: RefCell::new(Vec::new()),
            subscriptions: RefCell::new(None),
            close_on_open: Cell::new(false),
        });

        let on_message = Rc::clone(&shared);
        let message_sub = host.add_message_listener(
            &shared.comm_id,
            Box::new(move |message: &CommMessage| on_message.deliver(message)),
        );
        let on_close = Rc::clone(&shared);
        let close_sub = host.add_close_listener(
            &shared.comm_id,
            Box::new(move || {
                debug!(comm_id = %on_close.comm_id, "comm: remote close");
                on_close.shutdown();
            }),
        );
        *shared.subscriptions.borrow_mut() = Some(message_sub.and(close_sub));

        Self { shared, host }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.shared.comm_id
    }

    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.shared.state.get()
    }

    /// Number of inbound messages waiting for a first listener.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.shared.buffer.borrow().len()
    }

    fn require(&self, expected: ChannelState, op: &'static str) -> Result<(), ChannelError> {
        let state = self.state();
        if state == expected {
            return Ok(());
        }
        Err(ChannelError::InvalidState { comm_id: self.id().to_owned(), op, state })
    }

    /// Send the open request. On transport failure the channel tears itself
    /// down before the error is returned, so no dispatcher registration
    /// outlives a failed open.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless `Unopened`; `Open` when the transport rejects.
    pub async fn open(&self, target_name: &str, data: Value, buffers: Vec<Vec<u8>>) -> Result<(), ChannelError> {
        self.require(ChannelState::Unopened, "open")?;

        let message = CommMessage { data, buffers };
        match self.host.send_open(target_name, self.id(), message).await {
            Ok(()) => {
                if self.state() == ChannelState::Unopened {
                    self.shared.state.set(ChannelState::Open);
                    debug!(comm_id = %self.id(), %target_name, "comm: opened");
                } else if self.shared.close_on_open.get() {
                    // Closed locally while the open was in flight: the kernel
                    // now holds a comm nobody will use.
                    debug!(comm_id = %self.id(), %target_name, "comm: closed during open");
                    self.send_close().await;
                }
                Ok(())
            }
            Err(source) => {
                warn!(comm_id = %self.id(), %target_name, error = %source, "comm: open failed");
                self.shared.shutdown();
                Err(ChannelError::Open { comm_id: self.id().to_owned(), source })
            }
        }
    }

    /// Send one message to the kernel.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless `Open`; `Send` when the transport rejects. The
    /// channel stays `Open` after a failed send.
    pub async fn send(&self, data: Value, buffers: Vec<Vec<u8>>) -> Result<(), ChannelError> {
        self.require(ChannelState::Open, "send")?;

        self.host
            .send_message(self.id(), CommMessage { data, buffers })
            .await
            .map_err(|source| ChannelError::Send { comm_id: self.id().to_owned(), source })
    }

    /// Attach a message consumer. Anything buffered is replayed into it
    /// synchronously, then the buffer is empty.
    pub fn on_message(&self, callback: impl Fn(&CommMessage) + 'static) -> Disposer {
        if self.state() == ChannelState::Closed {
            debug!(comm_id = %self.id(), "comm: on_message after close ignored");
            return Disposer::noop();
        }

        let callback: Rc<MessageFn> = Rc::new(callback);
        let disposer = self.shared.message_listeners.push(Rc::clone(&callback));

        let replay = std::mem::take(&mut *self.shared.buffer.borrow_mut());
        for message in &replay {
            callback(message);
        }
        disposer
    }

    /// Attach a close consumer, invoked once when the channel closes from
    /// either side.
    pub fn on_close(&self, callback: impl Fn() + 'static) -> Disposer {
        if self.state() == ChannelState::Closed {
            debug!(comm_id = %self.id(), "comm: on_close after close ignored");
            return Disposer::noop();
        }
        self.shared.close_listeners.push(Rc::new(callback))
    }

    /// Close locally. Listeners are notified and released first; the close
    /// notification is then sent best-effort. Calling again is a no-op.
    ///
    /// A channel that never opened sends nothing. If its open is still in
    /// flight, the close is sent once that open succeeds.
    pub async fn close(&self) {
        match self.shared.shutdown() {
            ChannelState::Open => self.send_close().await,
            ChannelState::Unopened => self.shared.close_on_open.set(true),
            ChannelState::Closed => {}
        }
    }

    async fn send_close(&self) {
        if let Err(e) = self.host.send_close(self.id()).await {
            warn!(comm_id = %self.id(), error = %e, "comm: close send failed");
        }
    }

    /// Narrow handle safe to give to rendering code.
    #[must_use]
    pub fn handle(self) -> Comm {
        Comm { channel: Rc::new(self) }
    }
}

impl fmt::Debug for CommChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommChannel")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("buffered", &self.buffered())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// RESTRICTED HANDLE
// =============================================================================

/// The comm surface exposed to output modules: send, listen, close.
#[derive(Clone)]
pub struct Comm {
    channel: Rc<CommChannel>,
}

impl Comm {
    /// # Errors
    ///
    /// See [`CommChannel::send`].
    pub async fn send(&self, data: Value, buffers: Vec<Vec<u8>>) -> Result<(), ChannelError> {
        self.channel.send(data, buffers).await
    }

    pub fn on_message(&self, callback: impl Fn(&CommMessage) + 'static) -> Disposer {
        self.channel.on_message(callback)
    }

    pub fn on_close(&self, callback: impl Fn() + 'static) -> Disposer {
        self.channel.on_close(callback)
    }

    pub async fn close(&self) {
        self.channel.close().await;
    }
}

#[cfg(test)]
#[path = "channel_test.rs"]
mod tests;
