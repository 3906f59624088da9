//! Rich output rendering with kernel comms.
//!
//! ARCHITECTURE
//! ============
//! Output modules render user content and may talk to the kernel over
//! comms: named, bidirectional channels multiplexed over the kernel's shell
//! and IOPub streams.
//!
//! ```text
//! KernelConnection ── KernelCommHost ── Dispatcher ── CommChannel ── Comm
//!                          │                                          │
//!                    RendererFactory ── OutputRenderer ── RenderContext/Comms
//! ```
//!
//! Everything is single-threaded. Listener delivery is synchronous and
//! re-entrant: callbacks may register, dispose, send, or close from inside
//! a dispatch.

pub mod channel;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod host;
pub mod kernel;
pub mod listeners;
pub mod message;
pub mod render;

pub use channel::{ChannelError, ChannelState, Comm, CommChannel};
pub use config::{ConfigError, HostConfig};
pub use context::{Comms, RenderContext};
pub use dispatcher::{Dispatcher, Notification};
pub use host::{CommHost, TransportError};
pub use kernel::message::KernelMessage;
pub use kernel::{KernelCommHost, KernelConnection};
pub use listeners::Disposer;
pub use message::CommMessage;
pub use render::{MimeModel, ModuleLoader, OutputModule, OutputRenderer, RenderError, RendererFactory};
