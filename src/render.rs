//! Output renderer: loads an output module and hands it a render context.
//!
//! DESIGN
//! ======
//! A rich output bundle names a module by specifier under `MIME_TYPE`. The
//! renderer resolves that specifier through a `ModuleLoader`, appends a fresh
//! `MountPoint` for the module to draw into, and calls the module's `render`
//! with the output data and a `RenderContext`. Comms are only offered while
//! the factory's host has a kernel bound.
//!
//! Loading and mounting are abstract here. A host application decides what a
//! specifier resolves to and what a mount point is attached to.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::context::RenderContext;
use crate::host::CommHost;
use crate::kernel::KernelCommHost;

pub const MIME_TYPE: &str = "application/vnd.jupyter.es6-rich-output";
pub const CLASS_NAME: &str = "mimerenderer-es6-rich-output";

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("output bundle has no string module specifier under {mime_type}")]
    MissingSpecifier { mime_type: String },
    #[error("failed to load module {specifier}: {reason}")]
    Load { specifier: String, reason: String },
    #[error("module {specifier} failed to render: {reason}")]
    Render { specifier: String, reason: String },
}

// =============================================================================
// MODEL
// =============================================================================

/// A MIME bundle as delivered by the output area.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MimeModel {
    pub data: Map<String, Value>,
    pub metadata: Map<String, Value>,
}

impl MimeModel {
    /// A bundle carrying one module specifier under `MIME_TYPE`.
    #[must_use]
    pub fn for_module(specifier: &str) -> Self {
        let mut data = Map::new();
        data.insert(MIME_TYPE.to_owned(), Value::String(specifier.to_owned()));
        Self { data, metadata: Map::new() }
    }
}

/// What a module receives as its output argument.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputData {
    pub data: Map<String, Value>,
    pub metadata: Map<String, Value>,
}

/// A slot appended to the renderer's node for one module render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendererOptions {
    pub mime_type: String,
}

impl Default for RendererOptions {
    fn default() -> Self {
        Self { mime_type: MIME_TYPE.to_owned() }
    }
}

// =============================================================================
// MODULE SEAMS
// =============================================================================

#[async_trait(?Send)]
pub trait OutputModule {
    /// Draw `output` into `mount`. Comms, if any, are on `context`.
    async fn render(&self, output: &OutputData, mount: &MountPoint, context: &RenderContext) -> Result<(), String>;
}

#[async_trait(?Send)]
pub trait ModuleLoader {
    /// Resolve a specifier. `Ok(None)` means the module loaded but exports
    /// no `render`.
    async fn load(&self, specifier: &str) -> Result<Option<Rc<dyn OutputModule>>, String>;
}

// =============================================================================
// FACTORY
// =============================================================================

pub struct RendererFactory {
    host: Option<Rc<KernelCommHost>>,
    loader: Rc<dyn ModuleLoader>,
    rank: i32,
}

impl RendererFactory {
    /// `host` is `None` for a factory not attached to any notebook session.
    pub fn new(host: Option<Rc<KernelCommHost>>, loader: Rc<dyn ModuleLoader>, rank: i32) -> Self {
        Self { host, loader, rank }
    }

    /// Modules run arbitrary code, so output is never trusted.
    #[must_use]
    pub fn safe(&self) -> bool {
        false
    }

    #[must_use]
    pub fn mime_types(&self) -> &'static [&'static str] {
        &[MIME_TYPE]
    }

    #[must_use]
    pub fn rank(&self) -> i32 {
        self.rank
    }

    pub fn create_renderer(&self, options: RendererOptions) -> OutputRenderer {
        OutputRenderer {
            mime_type: options.mime_type,
            host: self.host.clone(),
            loader: Rc::clone(&self.loader),
            mounts: RefCell::new(Vec::new()),
            next_mount: Cell::new(0),
        }
    }
}

impl fmt::Debug for RendererFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RendererFactory")
            .field("host", &self.host)
            .field("rank", &self.rank)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// RENDERER
// =============================================================================

pub struct OutputRenderer {
    mime_type: String,
    host: Option<Rc<KernelCommHost>>,
    loader: Rc<dyn ModuleLoader>,
    mounts: RefCell<Vec<MountPoint>>,
    next_mount: Cell<usize>,
}

impl OutputRenderer {
    #[must_use]
    pub fn class_name(&self) -> &'static str {
        CLASS_NAME
    }

    #[must_use]
    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    /// Mount points appended so far, oldest first.
    #[must_use]
    pub fn mounts(&self) -> Vec<MountPoint> {
        self.mounts.borrow().clone()
    }

    fn context(&self) -> RenderContext {
        let host = self
            .host
            .as_ref()
            .filter(|host| host.has_kernel())
            .map(|host| Rc::clone(host) as Rc<dyn CommHost>);
        RenderContext::new(host)
    }

    fn mount(&self) -> MountPoint {
        let n = self.next_mount.get();
        self.next_mount.set(n + 1);
        let mount = MountPoint { id: format!("{CLASS_NAME}-{n}") };
        self.mounts.borrow_mut().push(mount.clone());
        mount
    }

    /// Load the module named by `model` and let it render.
    ///
    /// # Errors
    ///
    /// `MissingSpecifier` when the bundle names no module. Loader and module
    /// failures are wrapped with the specifier.
    pub async fn render_model(&self, model: &MimeModel) -> Result<(), RenderError> {
        let Some(specifier) = model.data.get(&self.mime_type).and_then(Value::as_str) else {
            warn!(mime_type = %self.mime_type, "render: missing module specifier");
            return Err(RenderError::MissingSpecifier { mime_type: self.mime_type.clone() });
        };
        info!(%specifier, "render: loading module");

        let module = self
            .loader
            .load(specifier)
            .await
            .map_err(|reason| RenderError::Load { specifier: specifier.to_owned(), reason })?;
        let Some(module) = module else {
            debug!(%specifier, "render: module has no render export");
            return Ok(());
        };

        let context = self.context();
        let mount = self.mount();
        let output = OutputData { data: model.data.clone(), metadata: model.metadata.clone() };
        module
            .render(&output, &mount, &context)
            .await
            .map_err(|reason| RenderError::Render { specifier: specifier.to_owned(), reason })
    }
}

impl fmt::Debug for OutputRenderer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputRenderer")
            .field("mime_type", &self.mime_type)
            .field("mounts", &self.mounts.borrow().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[path = "render_test.rs"]
mod tests;
