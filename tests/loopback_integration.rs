use bytes::BytesMut;
use parking_lot::Mutex;
use rma_net::drivers::loopback::LoopbackFabric;
use rma_net::eq::{EventKind, EventSink};
use rma_net::{Client, ConnStatus, ConnectionRef, EqHandle, Error, Server, ServiceConfig};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config() -> ServiceConfig {
    ServiceConfig::new("127.0.0.1:18515".parse().unwrap())
        .with_buffer_num(4)
        .with_buffer_size(256)
        .with_pool_capacity(64)
        .with_poll_interval(Duration::from_millis(2))
}

fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

fn echo_server(fabric: &Arc<LoopbackFabric>, config: ServiceConfig) -> Server {
    let mut server = Server::new(fabric.clone(), config).unwrap();
    server.set_recv_callback(|ctx| {
        ctx.conn.send(ctx.data).unwrap();
    });
    server.start().unwrap();
    server
}

fn collecting_client(
    fabric: &Arc<LoopbackFabric>,
    config: ServiceConfig,
) -> (Client, flume::Receiver<Vec<u8>>) {
    let (tx, rx) = flume::unbounded();
    let mut client = Client::new(fabric.clone(), config).unwrap();
    client.set_recv_callback(move |ctx| {
        let _ = tx.send(ctx.data.to_vec());
    });
    client.start().unwrap();
    (client, rx)
}

#[test]
fn test_echo_round_trips() {
    init_tracing();
    let fabric = Arc::new(LoopbackFabric::new());
    let server = echo_server(&fabric, config());
    let (client, rx) = collecting_client(&fabric, config());

    let conn = client.connect().unwrap();
    assert_eq!(conn.status(), ConnStatus::Connected);
    assert_eq!(client.send_buffers(conn.handle()).unwrap().len(), 4);

    for i in 0..64u32 {
        let msg = format!("message {i}");
        conn.send(msg.as_bytes()).unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), msg.as_bytes());
    }
    assert!(wait_until(|| server.connections().len() == 1));
}

#[test]
fn test_send_errors() {
    let fabric = Arc::new(LoopbackFabric::new());
    let _server = echo_server(&fabric, config());
    let (client, _rx) = collecting_client(&fabric, config());
    let conn = client.connect().unwrap();

    assert!(matches!(
        conn.send(vec![0u8; 257]),
        Err(Error::PayloadTooLarge { len: 257, max: 256 })
    ));
    conn.shutdown().unwrap();
    conn.wait_down(WAIT).unwrap();
    assert!(matches!(conn.send(b"late"), Err(Error::InvalidState { .. })));
}

#[test]
fn test_send_limited_by_smaller_peer_slot() {
    let fabric = Arc::new(LoopbackFabric::new());
    let _server = echo_server(&fabric, config().with_buffer_size(64));
    let (client, rx) = collecting_client(&fabric, config());

    let conn = client.connect().unwrap();
    assert_eq!(conn.slot_size(), 64);
    assert!(matches!(
        conn.send(vec![0u8; 100]),
        Err(Error::PayloadTooLarge { len: 100, max: 64 })
    ));
    for i in 0..8u8 {
        conn.send([i; 10]).unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), vec![i; 10]);
    }
    assert_eq!(conn.status(), ConnStatus::Connected);
}

#[test]
fn test_peer_shutdown_runs_callback() {
    let fabric = Arc::new(LoopbackFabric::new());
    let (tx, rx) = flume::unbounded();
    let server = echo_server(&fabric, config());
    server.set_shutdown_callback(move |ctx| {
        let _ = tx.send(ctx.handle);
    });
    let (client, _rx) = collecting_client(&fabric, config());

    let conn = client.connect().unwrap();
    assert!(wait_until(|| server.connections().len() == 1));
    let server_handle = server.connections()[0].handle();

    conn.shutdown().unwrap();
    conn.shutdown().unwrap();
    conn.wait_down(WAIT).unwrap();

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), server_handle);
    assert!(wait_until(|| server.connections().is_empty()));
    assert!(matches!(
        server.connection(server_handle),
        Err(Error::NotFound { .. })
    ));
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
}

#[test]
fn test_manual_accept() {
    let fabric = Arc::new(LoopbackFabric::new());
    let server = echo_server(&fabric, config().with_auto_accept(false));
    let (client, rx) = collecting_client(&fabric, config());

    let conn = client.start_connect().unwrap();
    assert!(wait_until(|| !server.pending_requests().is_empty()));
    assert_eq!(conn.status(), ConnStatus::ConnectRequested);

    let pending = server.pending_requests()[0];
    let accepted = server.accept(pending).unwrap();
    assert_ne!(accepted.handle(), pending);
    assert!(server.pending_requests().is_empty());

    conn.wait_connected(WAIT).unwrap();
    accepted.wait_connected(WAIT).unwrap();
    conn.send(b"after accept").unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), b"after accept");
}

#[test]
fn test_manual_reject() {
    let fabric = Arc::new(LoopbackFabric::new());
    let server = echo_server(&fabric, config().with_auto_accept(false));
    let (client, _rx) = collecting_client(&fabric, config());

    let conn = client.start_connect().unwrap();
    assert!(wait_until(|| !server.pending_requests().is_empty()));
    server.reject(server.pending_requests()[0]).unwrap();

    assert!(matches!(
        conn.wait_connected(WAIT),
        Err(Error::InvalidState {
            status: ConnStatus::Down,
            ..
        })
    ));
    assert!(server.accept(EqHandle(9999)).is_err());
}

#[test]
fn test_connect_without_listener() {
    let fabric = Arc::new(LoopbackFabric::new());
    let (client, _rx) = collecting_client(&fabric, config());
    assert!(matches!(
        client.connect(),
        Err(Error::InvalidState {
            status: ConnStatus::Down,
            ..
        })
    ));
}

#[test]
fn test_not_started() {
    let fabric = Arc::new(LoopbackFabric::new());
    let client = Client::new(fabric.clone(), config()).unwrap();
    assert!(matches!(client.connect(), Err(Error::Closed)));
    let server = Server::new(fabric, config()).unwrap();
    assert!(matches!(server.listener(), Err(Error::Closed)));
}

#[test]
fn test_rma_read() {
    let fabric = Arc::new(LoopbackFabric::new());
    let server = echo_server(&fabric, config());
    let remote = server.reg_rma_buffer(BytesMut::zeroed(128), 3).unwrap();
    server
        .with_rma_buffer(3, |chunk| chunk.write(64, b"one-sided"))
        .unwrap();

    let (client, _rx) = collecting_client(&fabric, config());
    let (tx, rx) = flume::unbounded();
    client.set_read_callback(move |ctx| {
        let _ = tx.send((ctx.id, ctx.len, ctx.status));
    });
    client.reg_rma_buffer(BytesMut::zeroed(32), 11).unwrap();
    let conn = client.connect().unwrap();

    // The descriptor travels as ordinary payload.
    let advertised = rma_net::RemoteBuf::from_bytes(&remote.to_bytes()).unwrap();
    conn.read(11, 4, advertised.subrange(64, 9)).unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), (11, 9, 0));

    let mut out = [0u8; 9];
    client.with_rma_buffer(11, |chunk| chunk.read(4, &mut out)).unwrap();
    assert_eq!(&out, b"one-sided");

    assert!(matches!(conn.read(12, 0, advertised), Err(Error::NotFound { .. })));
}

#[test]
fn test_service_shutdown_forces_connections_down() {
    let fabric = Arc::new(LoopbackFabric::new());
    let mut server = echo_server(&fabric, config());
    let (client, _rx) = collecting_client(&fabric, config());
    let conn = client.connect().unwrap();
    assert!(wait_until(|| server.connections().len() == 1));
    let server_conn = server.connections()[0].clone();

    server.shutdown();
    server.wait();
    assert!(!server.is_running());
    assert_eq!(server_conn.status(), ConnStatus::Down);
    conn.wait_down(WAIT).unwrap();
}

#[test]
fn test_client_spreads_connections_over_workers() {
    let fabric = Arc::new(LoopbackFabric::new());
    let server = echo_server(&fabric, config());
    let (client, rx) = collecting_client(&fabric, config().with_worker_num(3));
    assert_eq!(client.worker_num(), 3);

    let conns: Vec<ConnectionRef> = (0..6).map(|_| client.connect().unwrap()).collect();
    assert!(wait_until(|| server.connections().len() == 6));
    for (i, conn) in conns.iter().enumerate() {
        conn.send([i as u8]).unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), vec![i as u8]);
    }
    assert_eq!(client.connections().len(), 6);
}

#[derive(Default)]
struct Events {
    seen: Mutex<Vec<(EqHandle, EventKind)>>,
    send_buffers: Mutex<Vec<u32>>,
}

impl EventSink for Events {
    fn on_send_buffer(&self, _handle: EqHandle, id: u32) {
        self.send_buffers.lock().push(id);
    }

    fn on_event(&self, handle: EqHandle, kind: EventKind, _status: i32) {
        self.seen.lock().push((handle, kind));
    }
}

#[test]
fn test_user_event_sink() {
    let fabric = Arc::new(LoopbackFabric::new());
    let server = echo_server(&fabric, config());
    let (client, _rx) = collecting_client(&fabric, config());
    let events = Arc::new(Events::default());
    client.set_event_sink(events.clone());

    let conn = client.connect().unwrap();
    let handle = conn.handle();
    assert_eq!(*events.send_buffers.lock(), client.send_buffers(handle).unwrap());

    conn.shutdown().unwrap();
    conn.wait_down(WAIT).unwrap();
    assert!(wait_until(|| events.seen.lock().len() == 2));
    assert_eq!(
        *events.seen.lock(),
        vec![(handle, EventKind::Connected), (handle, EventKind::Shutdown)]
    );
    assert!(wait_until(|| server.connections().is_empty()));
}
