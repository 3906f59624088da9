//! End-to-end comm scenarios through `KernelCommHost` and a scripted kernel.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use async_trait::async_trait;
use serde_json::{Value, json};

use richoutput::kernel::message::{COMM_CLOSE, COMM_MSG, COMM_OPEN, Identity, KernelChannel};
use richoutput::{
    ChannelError, ChannelState, Comm, CommChannel, CommHost, CommMessage, HostConfig, KernelCommHost, KernelConnection,
    KernelMessage, RenderContext, TransportError,
};

// =============================================================================
// SCRIPTED KERNEL
// =============================================================================

/// Records shell traffic. Replies to `comm_open` by echoing `echo_on_open`
/// back on IOPub; replies are queued until the test flushes them.
#[derive(Default)]
struct ScriptedKernel {
    shell: RefCell<Vec<KernelMessage>>,
    iopub: RefCell<Vec<KernelMessage>>,
    echo_on_open: RefCell<Vec<Value>>,
    reject_open: Cell<bool>,
}

fn kernel_identity() -> Identity {
    Identity { username: "kernel".into(), session: "k-session".into(), version: "5.3".into() }
}

fn iopub(msg_type: &str, content: Value) -> KernelMessage {
    KernelMessage::new(&kernel_identity(), KernelChannel::Iopub, msg_type, content)
}

impl ScriptedKernel {
    fn shell_types(&self) -> Vec<String> {
        self.shell.borrow().iter().map(|m| m.msg_type().to_owned()).collect()
    }
}

#[async_trait(?Send)]
impl KernelConnection for ScriptedKernel {
    fn id(&self) -> String {
        "scripted".into()
    }

    fn username(&self) -> String {
        "tester".into()
    }

    fn client_id(&self) -> String {
        "client".into()
    }

    fn register_comm_target(&self, _target_name: &str) {}

    async fn send_shell(&self, message: KernelMessage) -> Result<(), TransportError> {
        let is_open = message.msg_type() == COMM_OPEN;
        let comm_id = message.content["comm_id"].clone();
        self.shell.borrow_mut().push(message);

        if is_open {
            if self.reject_open.get() {
                return Err(TransportError::Rejected("no such target".into()));
            }
            for data in self.echo_on_open.borrow().iter() {
                self.iopub
                    .borrow_mut()
                    .push(iopub(COMM_MSG, json!({ "comm_id": comm_id, "data": data })));
            }
        }
        Ok(())
    }
}

struct Fixture {
    kernel: Rc<ScriptedKernel>,
    host: Rc<KernelCommHost>,
}

impl Fixture {
    fn new() -> Self {
        let kernel = Rc::new(ScriptedKernel::default());
        let host = Rc::new(KernelCommHost::new(HostConfig::default()));
        host.kernel_changed(Some(Rc::clone(&kernel) as Rc<dyn KernelConnection>));
        Self { kernel, host }
    }

    fn comm_host(&self) -> Rc<dyn CommHost> {
        Rc::clone(&self.host) as Rc<dyn CommHost>
    }

    fn flush_iopub(&self) {
        let pending = std::mem::take(&mut *self.kernel.iopub.borrow_mut());
        for message in &pending {
            self.host.handle_iopub(message);
        }
    }
}

fn recorder() -> (Rc<RefCell<Vec<Value>>>, impl Fn(&CommMessage) + 'static) {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    (seen, move |m: &CommMessage| sink.borrow_mut().push(m.data.clone()))
}

// =============================================================================
// SCENARIOS
// =============================================================================

#[tokio::test]
async fn open_echo_attach_then_remote_close() {
    let fx = Fixture::new();
    fx.kernel.echo_on_open.replace(vec![json!("a"), json!("b")]);

    let channel = CommChannel::new("c1", fx.comm_host());
    channel.open("t", Value::Null, Vec::new()).await.unwrap();
    fx.flush_iopub();
    assert_eq!(channel.buffered(), 2);

    let (seen, record) = recorder();
    channel.on_message(record);
    let closes = Rc::new(Cell::new(0));
    let closes_in = Rc::clone(&closes);
    channel.on_close(move || closes_in.set(closes_in.get() + 1));

    assert_eq!(*seen.borrow(), vec![json!("a"), json!("b")]);
    assert_eq!(channel.buffered(), 0);

    fx.host.handle_iopub(&iopub(COMM_CLOSE, json!({ "comm_id": "c1", "data": {} })));
    fx.host.handle_iopub(&iopub(COMM_CLOSE, json!({ "comm_id": "c1", "data": {} })));

    assert_eq!(closes.get(), 1);
    assert_eq!(channel.state(), ChannelState::Closed);
    assert_eq!(fx.kernel.shell_types(), vec![COMM_OPEN]);
}

#[tokio::test]
async fn register_target_receives_kernel_open() {
    let fx = Fixture::new();
    let context = RenderContext::new(Some(fx.comm_host()));
    let received: Rc<RefCell<Vec<(Comm, Value)>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&received);

    context
        .comms()
        .unwrap()
        .register_target("echo", move |comm, data, _| sink.borrow_mut().push((comm, data)));
    fx.host.handle_iopub(&iopub(
        COMM_OPEN,
        json!({ "comm_id": "x1", "target_name": "echo", "data": 42 }),
    ));

    assert_eq!(received.borrow().len(), 1);
    let (comm, data) = received.borrow()[0].clone();
    assert_eq!(data, json!(42));

    comm.send(json!("hi"), Vec::new()).await.unwrap();
    let shell = fx.kernel.shell.borrow();
    assert_eq!(shell[0].msg_type(), COMM_MSG);
    assert_eq!(shell[0].content, json!({ "comm_id": "x1", "data": "hi" }));
}

#[tokio::test]
async fn local_close_then_echoed_remote_close_notifies_once() {
    let fx = Fixture::new();
    let context = RenderContext::new(Some(fx.comm_host()));
    let comm = context.comms().unwrap().open("t", None, Vec::new()).await.unwrap();
    let comm_id = fx.kernel.shell.borrow()[0].content["comm_id"].clone();

    let closes = Rc::new(Cell::new(0));
    let closes_in = Rc::clone(&closes);
    comm.on_close(move || closes_in.set(closes_in.get() + 1));

    comm.close().await;
    fx.host.handle_iopub(&iopub(COMM_CLOSE, json!({ "comm_id": comm_id, "data": {} })));
    comm.close().await;

    assert_eq!(closes.get(), 1);
    assert_eq!(fx.kernel.shell_types(), vec![COMM_OPEN, COMM_CLOSE]);
    assert!(matches!(
        comm.send(json!(1), Vec::new()).await,
        Err(ChannelError::InvalidState { state: ChannelState::Closed, .. })
    ));
}

#[tokio::test]
async fn rejected_open_releases_the_channel() {
    let fx = Fixture::new();
    fx.kernel.reject_open.set(true);

    let channel = CommChannel::new("c1", fx.comm_host());
    let err = channel.open("missing", json!({}), Vec::new()).await.unwrap_err();
    assert!(matches!(err, ChannelError::Open { source: TransportError::Rejected(_), .. }));

    let delivered = fx
        .host
        .handle_iopub(&iopub(COMM_MSG, json!({ "comm_id": "c1", "data": "late" })));
    channel.close().await;

    assert_eq!(delivered, 0);
    assert_eq!(channel.buffered(), 0);
    assert_eq!(fx.kernel.shell_types(), vec![COMM_OPEN]);
}

#[tokio::test]
async fn kernel_restart_orphans_existing_comms() {
    let fx = Fixture::new();
    let channel = CommChannel::new("c1", fx.comm_host());
    channel.open("t", Value::Null, Vec::new()).await.unwrap();
    let (seen, record) = recorder();
    channel.on_message(record);
    let closes = Rc::new(Cell::new(0));
    let sink = Rc::clone(&closes);
    channel.on_close(move || sink.set(sink.get() + 1));

    let replacement = Rc::new(ScriptedKernel::default());
    fx.host
        .kernel_changed(Some(Rc::clone(&replacement) as Rc<dyn KernelConnection>));
    fx.host.handle_iopub(&iopub(COMM_MSG, json!({ "comm_id": "c1", "data": "stale" })));
    let err = channel.send(json!("late"), Vec::new()).await.unwrap_err();

    assert!(seen.borrow().is_empty());
    assert_eq!(channel.state(), ChannelState::Closed);
    assert_eq!(closes.get(), 1);
    assert!(matches!(err, ChannelError::InvalidState { state: ChannelState::Closed, .. }));
    assert!(replacement.shell_types().is_empty());
    assert_eq!(fx.kernel.shell_types(), vec![COMM_OPEN]);
}

#[tokio::test]
async fn comms_unavailable_without_kernel() {
    let host = Rc::new(KernelCommHost::new(HostConfig::default()));
    let channel = CommChannel::new("c1", Rc::clone(&host) as Rc<dyn CommHost>);

    let err = channel.open("t", Value::Null, Vec::new()).await.unwrap_err();

    assert_eq!(err.to_string(), "failed to open comm c1: no kernel is connected");
    assert_eq!(channel.state(), ChannelState::Closed);
}
