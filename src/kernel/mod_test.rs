use std::cell::{Cell, RefCell};

use serde_json::json;

use super::message::{COMM_CLOSE, COMM_MSG, COMM_OPEN, KernelChannel};
use super::*;
use crate::channel::{ChannelState, CommChannel};
use crate::config::DEFAULT_PROTOCOL_VERSION;

// =============================================================================
// MOCK KERNEL
// =============================================================================

#[derive(Default)]
struct MockKernel {
    shell: RefCell<Vec<KernelMessage>>,
    targets: RefCell<Vec<String>>,
    reject: Cell<bool>,
}

#[async_trait(?Send)]
impl KernelConnection for MockKernel {
    fn id(&self) -> String {
        "kernel-1".into()
    }

    fn username(&self) -> String {
        "ada".into()
    }

    fn client_id(&self) -> String {
        "client-1".into()
    }

    fn register_comm_target(&self, target_name: &str) {
        self.targets.borrow_mut().push(target_name.to_owned());
    }

    async fn send_shell(&self, message: KernelMessage) -> Result<(), TransportError> {
        self.shell.borrow_mut().push(message);
        if self.reject.get() { Err(TransportError::Rejected("busy".into())) } else { Ok(()) }
    }
}

fn bound_host() -> (Rc<MockKernel>, KernelCommHost) {
    bound_host_with(HostConfig::default())
}

fn bound_host_with(config: HostConfig) -> (Rc<MockKernel>, KernelCommHost) {
    let kernel = Rc::new(MockKernel::default());
    let host = KernelCommHost::new(config);
    let conn: Rc<dyn KernelConnection> = kernel.clone();
    host.kernel_changed(Some(conn));
    (kernel, host)
}

fn iopub(msg_type: &str, content: serde_json::Value) -> KernelMessage {
    let identity = Identity { username: "kernel".into(), session: "k".into(), version: "5.3".into() };
    KernelMessage::new(&identity, KernelChannel::Iopub, msg_type, content)
}

// =============================================================================
// OUTBOUND
// =============================================================================

#[tokio::test]
async fn sends_fail_without_kernel() {
    let host = KernelCommHost::new(HostConfig::default());
    assert!(!host.has_kernel());
    assert_eq!(host.send_close("c1").await, Err(TransportError::NoKernel));
    assert_eq!(
        host.send_message("c1", CommMessage::default()).await,
        Err(TransportError::NoKernel)
    );
}

#[tokio::test]
async fn send_open_builds_shell_envelope() {
    let (kernel, host) = bound_host();

    host.send_open("t", "c1", CommMessage::new(json!({"x": 1})).with_buffers(vec![vec![7]]))
        .await
        .unwrap();

    let shell = kernel.shell.borrow();
    let msg = &shell[0];
    assert_eq!(msg.msg_type(), COMM_OPEN);
    assert_eq!(msg.channel, Some(KernelChannel::Shell));
    assert_eq!(msg.header.username, "ada");
    assert_eq!(msg.header.session, "client-1");
    assert_eq!(msg.header.version, DEFAULT_PROTOCOL_VERSION);
    assert_eq!(msg.content, json!({"comm_id": "c1", "target_name": "t", "data": {"x": 1}}));
    assert_eq!(msg.buffers, vec![vec![7]]);
}

#[tokio::test]
async fn configured_identity_overrides_kernel_values() {
    let config = HostConfig {
        username: Some("grace".into()),
        session_id: Some("pinned-session".into()),
        ..HostConfig::default()
    };
    let (kernel, host) = bound_host_with(config);

    host.send_message("c1", CommMessage::new(json!(1))).await.unwrap();

    let header = &kernel.shell.borrow()[0].header;
    assert_eq!(header.username, "grace");
    assert_eq!(header.session, "pinned-session");
}

#[tokio::test]
async fn send_close_carries_empty_data() {
    let (kernel, host) = bound_host();
    host.send_close("c1").await.unwrap();
    assert_eq!(kernel.shell.borrow()[0].content, json!({"comm_id": "c1", "data": {}}));
}

#[tokio::test]
async fn kernel_rejection_surfaces_as_error() {
    let (kernel, host) = bound_host();
    kernel.reject.set(true);
    let err = host.send_message("c1", CommMessage::new(json!(1))).await.unwrap_err();
    assert_eq!(err, TransportError::Rejected("busy".into()));
    assert_eq!(kernel.shell.borrow()[0].msg_type(), COMM_MSG);
}

#[test]
fn register_target_informs_kernel() {
    let (kernel, host) = bound_host();
    let _d = host.register_target("echo", Box::new(|_, _| {}));
    assert_eq!(*kernel.targets.borrow(), vec!["echo".to_owned()]);
}

// =============================================================================
// INBOUND
// =============================================================================

#[test]
fn iopub_comm_messages_reach_listeners() {
    let (_kernel, host) = bound_host();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    let _d = host.add_message_listener("c1", Box::new(move |m| sink.borrow_mut().push(m.data.clone())));

    let delivered = host.handle_iopub(&iopub(COMM_MSG, json!({"comm_id": "c1", "data": "a"})));

    assert_eq!(delivered, 1);
    assert_eq!(*seen.borrow(), vec![json!("a")]);
}

#[test]
fn iopub_open_and_close_are_routed() {
    let (_kernel, host) = bound_host();
    let opened = Rc::new(RefCell::new(Vec::new()));
    let closed = Rc::new(Cell::new(0));
    let open_sink = Rc::clone(&opened);
    let close_sink = Rc::clone(&closed);
    let _t = host.register_target(
        "t",
        Box::new(move |id, m| open_sink.borrow_mut().push((id.to_owned(), m.data.clone()))),
    );
    let _c = host.add_close_listener("k1", Box::new(move || close_sink.set(close_sink.get() + 1)));

    host.handle_iopub(&iopub(COMM_OPEN, json!({"comm_id": "k1", "target_name": "t", "data": 5})));
    host.handle_iopub(&iopub(COMM_CLOSE, json!({"comm_id": "k1", "data": {}})));

    assert_eq!(*opened.borrow(), vec![("k1".to_owned(), json!(5))]);
    assert_eq!(closed.get(), 1);
}

#[test]
fn non_comm_and_malformed_iopub_is_dropped() {
    let (_kernel, host) = bound_host();
    let count = Rc::new(Cell::new(0));
    let sink = Rc::clone(&count);
    let _d = host.add_message_listener("c1", Box::new(move |_| sink.set(sink.get() + 1)));

    assert_eq!(host.handle_iopub(&iopub("stream", json!({"name": "stdout", "text": "hi"}))), 0);
    assert_eq!(host.handle_iopub(&iopub(COMM_MSG, json!({"data": "no id"}))), 0);
    assert_eq!(count.get(), 0);
}

#[test]
fn kernel_change_discards_registrations() {
    let (_kernel, host) = bound_host();
    let count = Rc::new(Cell::new(0));
    let sink = Rc::clone(&count);
    let stale = host.add_message_listener("c1", Box::new(move |_| sink.set(sink.get() + 1)));

    let replacement: Rc<dyn KernelConnection> = Rc::new(MockKernel::default());
    host.kernel_changed(Some(replacement));
    host.handle_iopub(&iopub(COMM_MSG, json!({"comm_id": "c1", "data": 1})));
    stale.dispose();

    assert_eq!(count.get(), 0);
    assert!(host.has_kernel());
}

#[tokio::test]
async fn kernel_change_closes_live_channels_without_sending() {
    let (old_kernel, host) = bound_host();
    let host = Rc::new(host);
    let channel = CommChannel::new("c1", Rc::clone(&host) as Rc<dyn CommHost>);
    channel.open("t", json!({}), Vec::new()).await.unwrap();
    let closes = Rc::new(Cell::new(0));
    let sink = Rc::clone(&closes);
    let _d = channel.on_close(move || sink.set(sink.get() + 1));

    let replacement = Rc::new(MockKernel::default());
    host.kernel_changed(Some(Rc::clone(&replacement) as Rc<dyn KernelConnection>));

    assert_eq!(closes.get(), 1);
    assert_eq!(channel.state(), ChannelState::Closed);
    assert!(channel.send(json!("stale"), Vec::new()).await.is_err());
    assert_eq!(old_kernel.shell.borrow().len(), 1);
    assert!(replacement.shell.borrow().is_empty());
}

#[test]
fn registrations_are_refused_without_kernel() {
    let host = KernelCommHost::new(HostConfig::default());
    let d = host.add_message_listener("c1", Box::new(|_| {}));
    assert!(d.is_disposed());
    assert_eq!(host.handle_iopub(&iopub(COMM_MSG, json!({"comm_id": "c1", "data": 1}))), 0);
}

#[tokio::test]
async fn pump_drains_stream_in_order() {
    let (_kernel, host) = bound_host();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    let _d = host.add_message_listener("c1", Box::new(move |m| sink.borrow_mut().push(m.data.clone())));

    let stream = futures::stream::iter(vec![
        iopub(COMM_MSG, json!({"comm_id": "c1", "data": "a"})),
        iopub("status", json!({"execution_state": "idle"})),
        iopub(COMM_MSG, json!({"comm_id": "c1", "data": "b"})),
    ]);
    let consumed = host.pump_iopub(stream).await;

    assert_eq!(consumed, 3);
    assert_eq!(*seen.borrow(), vec![json!("a"), json!("b")]);
}
