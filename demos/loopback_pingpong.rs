//! Ping-pong between a client and a server in one process.
//!
//! cargo run --example loopback_pingpong -- [rounds]

use bytes::BytesMut;
use rma_net::drivers::loopback::LoopbackFabric;
use rma_net::{Client, Server, ServiceConfig};
use std::env;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

fn main() -> rma_net::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let rounds: usize = env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(10_000);

    let fabric = Arc::new(LoopbackFabric::new());
    let config = ServiceConfig::new("127.0.0.1:18515".parse().expect("valid addr"))
        .with_buffer_num(4)
        .with_buffer_size(4096);

    let mut server = Server::new(fabric.clone(), config.clone())?;
    server.set_recv_callback(|ctx| {
        if let Err(e) = ctx.conn.send(ctx.data) {
            eprintln!("echo failed: {e}");
        }
    });
    let table = server.reg_rma_buffer(BytesMut::zeroed(64), 1)?;
    server.with_rma_buffer(1, |chunk| chunk.write(0, b"served over rma"))?;
    server.start()?;

    let (tx, rx) = flume::unbounded::<Vec<u8>>();
    let mut client = Client::new(fabric, config)?;
    client.set_recv_callback(move |ctx| {
        let _ = tx.send(ctx.data.to_vec());
    });
    let (read_tx, read_rx) = flume::bounded::<i32>(1);
    client.set_read_callback(move |ctx| {
        let _ = read_tx.send(ctx.status);
    });
    client.reg_rma_buffer(BytesMut::zeroed(64), 7)?;
    client.start()?;

    let conn = client.connect()?;
    println!("connected as {} with {} send slots", conn.handle(), conn.free_send_slots());

    let start = Instant::now();
    for i in 0..rounds {
        let payload = (i as u64).to_le_bytes();
        loop {
            match conn.send(payload) {
                Ok(_) => break,
                Err(rma_net::Error::Empty) => std::thread::yield_now(),
                Err(e) => return Err(e),
            }
        }
        let pong = rx
            .recv_timeout(Duration::from_secs(5))
            .map_err(|_| rma_net::Error::Timeout)?;
        assert_eq!(pong, payload);
    }
    let elapsed = start.elapsed();
    println!(
        "{rounds} round trips in {elapsed:?} ({:.2} us/rtt)",
        elapsed.as_secs_f64() * 1e6 / rounds as f64
    );

    conn.read(7, 0, table.subrange(0, 15))?;
    let status = read_rx
        .recv_timeout(Duration::from_secs(5))
        .map_err(|_| rma_net::Error::Timeout)?;
    let mut out = [0u8; 15];
    client.with_rma_buffer(7, |chunk| chunk.read(0, &mut out))?;
    println!("rma read status {status}: {:?}", String::from_utf8_lossy(&out));

    conn.shutdown()?;
    conn.wait_down(Duration::from_secs(5))?;
    client.shutdown();
    server.shutdown();
    Ok(())
}
