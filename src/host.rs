//! Transport host: the seam between comm channels and a kernel connection.
//!
//! DESIGN
//! ======
//! Channels never touch a routing table or a socket directly. They register
//! handler closures through `CommHost` and send through its async primitives.
//! `KernelCommHost` is the production implementation; tests use
//! `test_helpers::RecordingHost`.

use async_trait::async_trait;

use crate::listeners::Disposer;
use crate::message::CommMessage;

/// Inbound message handler for one comm id.
pub type MessageFn = dyn Fn(&CommMessage);

/// Inbound close handler for one comm id.
pub type CloseFn = dyn Fn();

/// Inbound open handler for one target name: `(comm_id, message)`.
pub type OpenFn = dyn Fn(&str, &CommMessage);

/// Failure reported by the transport for an outbound operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("no kernel is connected")]
    NoKernel,
    #[error("kernel rejected message: {0}")]
    Rejected(String),
    #[error("kernel connection closed")]
    Disconnected,
}

#[async_trait(?Send)]
pub trait CommHost {
    /// Subscribe to inbound messages for `comm_id`.
    fn add_message_listener(&self, comm_id: &str, handler: Box<MessageFn>) -> Disposer;

    /// Subscribe to the inbound close of `comm_id`.
    fn add_close_listener(&self, comm_id: &str, handler: Box<CloseFn>) -> Disposer;

    /// Receive every future kernel-initiated open under `target_name`.
    fn register_target(&self, target_name: &str, handler: Box<OpenFn>) -> Disposer;

    /// Ask the kernel to open `comm_id` under `target_name`.
    async fn send_open(&self, target_name: &str, comm_id: &str, message: CommMessage) -> Result<(), TransportError>;

    async fn send_message(&self, comm_id: &str, message: CommMessage) -> Result<(), TransportError>;

    async fn send_close(&self, comm_id: &str) -> Result<(), TransportError>;
}

// =============================================================================
// TEST HELPERS
// =============================================================================
