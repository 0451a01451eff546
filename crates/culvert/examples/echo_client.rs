//! Echo client example for culvert.
//!
//! Connects to a running echo_server, negotiates one tunnel with two
//! sockets, and calls both of its procedures by name.
//!
//! `cargo run --example echo_client -p culvert`

use bytes::Bytes;

use culvert::{Client, ClientConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = ClientConfig { socket_counts: vec![2], ..ClientConfig::default() };
    let client = Client::new(config);
    let conn = client.connect().await?;
    println!("Connected: {} tunnel(s)", conn.tunnel_count());

    let reply = conn.call_by_name("echo", Bytes::from_static(b"hello culvert"), 0).await?;
    println!("echo    -> {}", String::from_utf8_lossy(&reply));

    let reply = conn.call_by_name("reverse", Bytes::from_static(b"hello culvert"), 0).await?;
    println!("reverse -> {}", String::from_utf8_lossy(&reply));

    Ok(())
}
