#[cfg(not(feature = "rdma"))]
fn main() {
    eprintln!("This example requires the `rdma` feature.");
    eprintln!("Run: cargo run --example rdma_echo --features rdma -- server 0.0.0.0:18515");
    eprintln!(" or: cargo run --example rdma_echo --features rdma -- client 10.0.0.1:18515");
}

#[cfg(feature = "rdma")]
fn main() -> rma_net::Result<()> {
    use rma_net::drivers::rdma::RdmaFabric;
    use rma_net::{Client, Server, ServiceConfig};
    use std::env;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mode = env::args().nth(1).unwrap_or_else(|| "server".to_string());
    let addr: SocketAddr = env::args()
        .nth(2)
        .unwrap_or_else(|| "0.0.0.0:18515".to_string())
        .parse()
        .expect("addr must be a SocketAddr, e.g. 0.0.0.0:18515");

    let fabric = Arc::new(RdmaFabric::first_device()?);
    let config = ServiceConfig::new(addr).with_buffer_num(8);

    if mode == "server" {
        let mut server = Server::new(fabric, config)?;
        server.set_connected_callback(|ctx| println!("[server] {} connected", ctx.handle));
        server.set_recv_callback(|ctx| {
            if let Err(e) = ctx.conn.send(ctx.data) {
                eprintln!("[server] echo failed: {e}");
            }
        });
        server.set_shutdown_callback(|ctx| println!("[server] {} down", ctx.handle));
        server.start()?;
        println!("RDMA echo server listening on {addr}");
        server.wait();
        return Ok(());
    }

    let (tx, rx) = flume::unbounded::<Vec<u8>>();
    let mut client = Client::new(fabric, config)?;
    client.set_recv_callback(move |ctx| {
        let _ = tx.send(ctx.data.to_vec());
    });
    client.start()?;
    let conn = client.connect()?;
    for i in 0..16u32 {
        let msg = format!("hello rdma #{i}");
        conn.send(msg.as_bytes())?;
        let echo = rx
            .recv_timeout(Duration::from_secs(5))
            .map_err(|_| rma_net::Error::Timeout)?;
        println!("[client] echo: {}", String::from_utf8_lossy(&echo));
    }
    conn.shutdown()?;
    conn.wait_down(Duration::from_secs(5))?;
    Ok(())
}
