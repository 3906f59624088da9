//! Render context: the capability object handed to output modules.
//!
//! DESIGN
//! ======
//! Output modules are untrusted. They receive a `RenderContext` whose only
//! reach into the kernel is `Comms`: open a comm, or listen for comms the
//! kernel opens. Both hand back `Comm` handles. Neither type exposes the
//! host, the dispatcher, or the channel internals. Without a live kernel
//! session there is no `Comms` at all.

use std::fmt;
use std::rc::Rc;

use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::channel::{ChannelError, Comm, CommChannel};
use crate::host::CommHost;
use crate::listeners::Disposer;
use crate::message::CommMessage;

#[derive(Clone, Default)]
pub struct RenderContext {
    comms: Option<Comms>,
}

impl RenderContext {
    pub fn new(host: Option<Rc<dyn CommHost>>) -> Self {
        Self { comms: host.map(|host| Comms { host }) }
    }

    /// Comm access, present only while a kernel session is bound.
    #[must_use]
    pub fn comms(&self) -> Option<&Comms> {
        self.comms.as_ref()
    }
}

impl fmt::Debug for RenderContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderContext")
            .field("comms", &self.comms.is_some())
            .finish()
    }
}

#[derive(Clone)]
pub struct Comms {
    host: Rc<dyn CommHost>,
}

impl Comms {
    /// Open a new comm to the kernel under `target_name`.
    ///
    /// # Errors
    ///
    /// Returns `ChannelError::Open` if the kernel cannot be reached; the
    /// half-built channel has already been torn down.
    pub async fn open(
        &self,
        target_name: &str,
        data: Option<Value>,
        buffers: Vec<Vec<u8>>,
    ) -> Result<Comm, ChannelError> {
        let comm_id = Uuid::new_v4().to_string();
        let channel = CommChannel::new(comm_id, Rc::clone(&self.host));
        channel
            .open(target_name, data.unwrap_or(Value::Null), buffers)
            .await?;
        Ok(channel.handle())
    }

    /// Call `callback` for every comm the kernel opens under `target_name`,
    /// with the comm and the open message's data and buffers. The
    /// registration lasts until the returned disposer runs.
    pub fn register_target(
        &self,
        target_name: &str,
        callback: impl Fn(Comm, Value, Vec<Vec<u8>>) + 'static,
    ) -> Disposer {
        let host = Rc::clone(&self.host);
        let target = target_name.to_owned();
        self.host.register_target(
            target_name,
            Box::new(move |comm_id: &str, message: &CommMessage| {
                debug!(%comm_id, target_name = %target, "comm: kernel opened comm");
                let comm = CommChannel::accept(comm_id, Rc::clone(&host)).handle();
                callback(comm, message.data.clone(), message.buffers.clone());
            }),
        )
    }
}

impl fmt::Debug for Comms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Comms").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[path = "context_test.rs"]
mod tests;
