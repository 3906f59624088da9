//! Demo: render one rich output against an in-process echo kernel.
//!
//! The kernel echoes every comm message back on IOPub and opens a `status`
//! comm as soon as a frontend registers that target. Run with
//! `RUST_LOG=debug` to see the dispatch traffic.

use std::cell::RefCell;
use std::rc::Rc;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::{FutureExt, StreamExt};
use serde_json::{Value, json};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use richoutput::host::TransportError;
use richoutput::kernel::message::{COMM_CLOSE, COMM_MSG, COMM_OPEN, CommContent, CommOpenContent, Identity, KernelChannel};
use richoutput::render::{MountPoint, OutputData, RendererOptions};
use richoutput::{
    Comm, HostConfig, KernelCommHost, KernelConnection, KernelMessage, MimeModel, ModuleLoader, OutputModule,
    RenderContext, RendererFactory,
};

const DEMO_SPECIFIER: &str = "demo://echo";

// =============================================================================
// ECHO KERNEL
// =============================================================================

struct EchoKernel {
    identity: Identity,
    iopub: mpsc::UnboundedSender<KernelMessage>,
}

impl EchoKernel {
    fn publish(&self, msg_type: &str, content: Value) {
        let message = KernelMessage::new(&self.identity, KernelChannel::Iopub, msg_type, content);
        if let Err(e) = self.iopub.unbounded_send(message) {
            warn!(error = %e, "kernel: iopub closed, message dropped");
        }
    }

    fn shutdown(&self) {
        self.iopub.close_channel();
    }
}

#[async_trait(?Send)]
impl KernelConnection for EchoKernel {
    fn id(&self) -> String {
        self.identity.session.clone()
    }

    fn username(&self) -> String {
        "demo".into()
    }

    fn client_id(&self) -> String {
        "demo-client".into()
    }

    fn register_comm_target(&self, target_name: &str) {
        if target_name == "status" {
            self.publish(
                COMM_OPEN,
                json!({ "comm_id": "status-1", "target_name": target_name, "data": { "execution_state": "idle" } }),
            );
        }
    }

    async fn send_shell(&self, message: KernelMessage) -> Result<(), TransportError> {
        let msg_type = message.msg_type().to_owned();
        match msg_type.as_str() {
            COMM_OPEN => {
                let content: CommOpenContent =
                    serde_json::from_value(message.content).map_err(|e| TransportError::Rejected(e.to_string()))?;
                self.publish(COMM_MSG, json!({ "comm_id": content.comm_id, "data": { "opened": content.target_name } }));
            }
            COMM_MSG => {
                let content: CommContent =
                    serde_json::from_value(message.content).map_err(|e| TransportError::Rejected(e.to_string()))?;
                self.publish(COMM_MSG, json!({ "comm_id": content.comm_id, "data": { "echo": content.data } }));
            }
            COMM_CLOSE => {}
            other => return Err(TransportError::Rejected(format!("unsupported {other}"))),
        }
        Ok(())
    }
}

// =============================================================================
// DEMO MODULE
// =============================================================================

#[derive(Default)]
struct EchoModule {
    comms: RefCell<Vec<Comm>>,
}

impl EchoModule {
    async fn close_all(&self) {
        let comms = std::mem::take(&mut *self.comms.borrow_mut());
        for comm in comms {
            comm.close().await;
        }
    }
}

#[async_trait(?Send)]
impl OutputModule for EchoModule {
    async fn render(&self, output: &OutputData, mount: &MountPoint, context: &RenderContext) -> Result<(), String> {
        info!(mount = %mount.id, keys = output.data.len(), "demo: rendering");
        let Some(comms) = context.comms() else {
            return Err("no kernel session".into());
        };

        let _status_target = comms.register_target("status", |comm, data, _| {
            info!(%data, "demo: kernel opened status comm");
            comm.on_message(|m| info!(data = %m.data, "demo: status update"));
        });

        let comm = comms
            .open("echo", Some(json!({ "greeting": "hello" })), Vec::new())
            .await
            .map_err(|e| e.to_string())?;
        comm.on_message(|m| info!(data = %m.data, "demo: echo received"));
        comm.on_close(|| info!("demo: echo comm closed"));
        comm.send(json!("ping"), Vec::new()).await.map_err(|e| e.to_string())?;
        comm.send(json!({ "n": 2 }), vec![vec![0xde, 0xad]])
            .await
            .map_err(|e| e.to_string())?;

        self.comms.borrow_mut().push(comm);
        Ok(())
    }
}

struct DemoLoader {
    module: Rc<EchoModule>,
}

#[async_trait(?Send)]
impl ModuleLoader for DemoLoader {
    async fn load(&self, specifier: &str) -> Result<Option<Rc<dyn OutputModule>>, String> {
        if specifier == DEMO_SPECIFIER {
            Ok(Some(Rc::clone(&self.module) as Rc<dyn OutputModule>))
        } else {
            Err(format!("unknown module {specifier}"))
        }
    }
}

// =============================================================================
// MAIN
// =============================================================================

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = HostConfig::from_env()?;
    let host = Rc::new(KernelCommHost::new(config.clone()));

    let (iopub_tx, mut iopub_rx) = mpsc::unbounded();
    let kernel = Rc::new(EchoKernel {
        identity: Identity {
            username: "kernel".into(),
            session: Uuid::new_v4().to_string(),
            version: config.protocol_version.clone(),
        },
        iopub: iopub_tx,
    });
    host.kernel_changed(Some(Rc::clone(&kernel) as Rc<dyn KernelConnection>));

    let module = Rc::new(EchoModule::default());
    let loader = Rc::new(DemoLoader { module: Rc::clone(&module) });
    let factory = RendererFactory::new(Some(Rc::clone(&host)), loader, config.renderer_rank);
    let renderer = factory.create_renderer(RendererOptions::default());

    renderer.render_model(&MimeModel::for_module(DEMO_SPECIFIER)).await?;

    while let Some(Some(message)) = iopub_rx.next().now_or_never() {
        host.handle_iopub(&message);
    }

    module.close_all().await;
    kernel.shutdown();
    let drained = host.pump_iopub(iopub_rx).await;
    host.kernel_changed(None);

    info!(mounts = renderer.mounts().len(), drained, "demo: done");
    Ok(())
}
