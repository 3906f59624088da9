//! Kernel comm host: binds comm routing to one live kernel session.
//!
//! ARCHITECTURE
//! ============
//! `KernelCommHost` is the production `CommHost`. Outbound comm operations
//! become shell-channel kernel messages; inbound IOPub messages are turned
//! into dispatcher notifications by `handle_iopub`. The socket under the
//! kernel is not modeled here: a `KernelConnection` only needs to send a
//! shell message and resolve once the kernel has replied.
//!
//! LIFECYCLE
//! =========
//! Routing tables belong to a session, not to the host. Each
//! `kernel_changed` drops the previous session and starts a fresh one. Every
//! comm of the old session is closed as if the old kernel had closed it:
//! close callbacks run once, the channel becomes `Closed`, and nothing is
//! sent to either kernel. Remaining registrations are cleared and their
//! disposers become no-ops.
//! With no kernel bound, registrations are refused (no-op disposers) and
//! sends fail with `TransportError::NoKernel`.

pub mod message;

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::config::HostConfig;
use crate::dispatcher::Dispatcher;
use crate::host::{CloseFn, CommHost, MessageFn, OpenFn, TransportError};
use crate::listeners::Disposer;
use crate::message::CommMessage;
use message::{Identity, KernelMessage, to_notification};

// =============================================================================
// KERNEL CONNECTION
// =============================================================================

/// The slice of a kernel connection that comms need.
#[async_trait(?Send)]
pub trait KernelConnection {
    /// Stable id of the kernel, for logs.
    fn id(&self) -> String;

    /// Username stamped into outbound headers.
    fn username(&self) -> String;

    /// Client session id stamped into outbound headers.
    fn client_id(&self) -> String;

    /// Tell the kernel-side registry that this frontend handles
    /// `target_name`. Inbound opens still arrive over IOPub.
    fn register_comm_target(&self, target_name: &str);

    /// Send a shell message and wait for the kernel's reply.
    async fn send_shell(&self, message: KernelMessage) -> Result<(), TransportError>;
}

// =============================================================================
// HOST
// =============================================================================

struct Session {
    kernel: Rc<dyn KernelConnection>,
    dispatcher: Dispatcher,
}

pub struct KernelCommHost {
    config: HostConfig,
    session: RefCell<Option<Session>>,
}

impl KernelCommHost {
    #[must_use]
    pub fn new(config: HostConfig) -> Self {
        Self { config, session: RefCell::new(None) }
    }

    #[must_use]
    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Bind a new kernel (or none), discarding all comm state of the old one.
    pub fn kernel_changed(&self, kernel: Option<Rc<dyn KernelConnection>>) {
        let next = kernel.map(|kernel| Session { kernel, dispatcher: Dispatcher::new() });
        let next_id = next.as_ref().map(|s| s.kernel.id());
        let previous = self.session.replace(next);

        if let Some(previous) = previous {
            let closed = previous.dispatcher.close_all();
            info!(old_kernel = %previous.kernel.id(), closed, "kernel: session discarded");
        }
        match next_id {
            Some(kernel_id) => info!(%kernel_id, "kernel: session bound"),
            None => info!("kernel: no kernel bound"),
        }
    }

    #[must_use]
    pub fn has_kernel(&self) -> bool {
        self.session.borrow().is_some()
    }

    fn dispatcher(&self) -> Option<Dispatcher> {
        self.session.borrow().as_ref().map(|s| s.dispatcher.clone())
    }

    fn kernel(&self) -> Result<Rc<dyn KernelConnection>, TransportError> {
        self.session
            .borrow()
            .as_ref()
            .map(|s| Rc::clone(&s.kernel))
            .ok_or(TransportError::NoKernel)
    }

    fn identity(&self, kernel: &dyn KernelConnection) -> Identity {
        self.config.identity(kernel.username(), kernel.client_id())
    }

    /// Route one IOPub message. Non-comm and malformed messages are dropped.
    /// Returns how many handlers were invoked.
    pub fn handle_iopub(&self, message: &KernelMessage) -> usize {
        let notification = match to_notification(message) {
            Ok(Some(notification)) => notification,
            Ok(None) => return 0,
            Err(e) => {
                warn!(msg_id = %message.header.msg_id, error = %e, "kernel: dropping iopub message");
                return 0;
            }
        };
        let Some(dispatcher) = self.dispatcher() else {
            debug!(comm_id = %notification.comm_id(), "kernel: iopub with no session, dropped");
            return 0;
        };
        dispatcher.dispatch(&notification)
    }

    /// Feed every message of an IOPub stream through `handle_iopub` until
    /// the stream ends. Returns how many messages were consumed.
    pub async fn pump_iopub(&self, mut iopub: impl Stream<Item = KernelMessage> + Unpin) -> usize {
        let mut consumed = 0;
        while let Some(message) = iopub.next().await {
            self.handle_iopub(&message);
            consumed += 1;
        }
        debug!(consumed, "kernel: iopub stream ended");
        consumed
    }

    async fn send(&self, build: impl FnOnce(&Identity) -> KernelMessage) -> Result<(), TransportError> {
        let kernel = self.kernel()?;
        let message = build(&self.identity(kernel.as_ref()));
        debug!(msg_type = %message.msg_type(), msg_id = %message.header.msg_id, "kernel: shell send");
        kernel.send_shell(message).await
    }
}

#[async_trait(?Send)]
impl CommHost for KernelCommHost {
    fn add_message_listener(&self, comm_id: &str, handler: Box<MessageFn>) -> Disposer {
        let Some(dispatcher) = self.dispatcher() else {
            debug!(%comm_id, "kernel: no session, message listener refused");
            return Disposer::noop();
        };
        dispatcher.add_message_listener(comm_id, handler)
    }

    fn add_close_listener(&self, comm_id: &str, handler: Box<CloseFn>) -> Disposer {
        let Some(dispatcher) = self.dispatcher() else {
            debug!(%comm_id, "kernel: no session, close listener refused");
            return Disposer::noop();
        };
        dispatcher.add_close_listener(comm_id, handler)
    }

    fn register_target(&self, target_name: &str, handler: Box<OpenFn>) -> Disposer {
        let session = self
            .session
            .borrow()
            .as_ref()
            .map(|s| (Rc::clone(&s.kernel), s.dispatcher.clone()));
        let Some((kernel, dispatcher)) = session else {
            debug!(%target_name, "kernel: no session, target refused");
            return Disposer::noop();
        };
        kernel.register_comm_target(target_name);
        dispatcher.add_open_listener(target_name, handler)
    }

    async fn send_open(&self, target_name: &str, comm_id: &str, message: CommMessage) -> Result<(), TransportError> {
        self.send(|identity| KernelMessage::comm_open(identity, target_name, comm_id, message))
            .await
    }

    async fn send_message(&self, comm_id: &str, message: CommMessage) -> Result<(), TransportError> {
        self.send(|identity| KernelMessage::comm_msg(identity, comm_id, message))
            .await
    }

    async fn send_close(&self, comm_id: &str) -> Result<(), TransportError> {
        self.send(|identity| KernelMessage::comm_close(identity, comm_id))
            .await
    }
}

impl fmt::Debug for KernelCommHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelCommHost")
            .field("config", &self.config)
            .field("has_kernel", &self.has_kernel())
            .finish()
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
