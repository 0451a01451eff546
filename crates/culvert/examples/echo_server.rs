//! Echo server example for culvert.
//!
//! Binds the well-known control port, registers two procedures, and
//! negotiates with the first client that shows up.
//!
//! Run this before running the echo_client example:
//! `cargo run --example echo_server -p culvert`

use culvert::{Server, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = ServerConfig::default();
    let mut server = Server::bind(config).await?;
    println!("Echo server listening on {}", server.local_addr()?);

    server.subscribe("echo", |args| Ok(args));
    server.subscribe("reverse", |args| {
        let mut bytes = args.to_vec();
        bytes.reverse();
        Ok(bytes.into())
    });

    let conn = server.accept().await?;
    println!(
        "Client connected: {} tunnel(s), serving until interrupted",
        conn.tunnel_count()
    );

    // The receive loops run in the background; park the main task.
    loop {
        tokio::time::sleep(std::time::Duration::from_secs(60)).await;
    }
}
