//! Endpoint configuration.
//!
//! Defaults match the deployed application: control traffic on port 6942,
//! transfer ports handed out sequentially from just above 10000. Both can
//! be overridden per process through environment variables.

use std::net::IpAddr;

/// Well-known control port.
pub const DEFAULT_CONTROL_PORT: u16 = 6942;

/// Transfer ports are allocated scanning upward from just above this base.
pub const DEFAULT_TRANSFER_PORT_BASE: u16 = 10000;

fn env_port(var: &str, default: u16) -> u16 {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(default)
}

/// Server-side settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the control and transfer listeners bind to.
    pub bind_addr: IpAddr,
    pub control_port: u16,
    pub transfer_port_base: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::from([0, 0, 0, 0]),
            control_port: env_port("CULVERT_CONTROL_PORT", DEFAULT_CONTROL_PORT),
            transfer_port_base: env_port(
                "CULVERT_TRANSFER_PORT_BASE",
                DEFAULT_TRANSFER_PORT_BASE,
            ),
        }
    }
}

/// Client-side settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Address of the server; transfer connections go to the same host.
    pub server_addr: IpAddr,
    pub control_port: u16,
    /// How many sockets each tunnel should carry, in tunnel order. The
    /// server opens one transfer port per entry element sum.
    pub socket_counts: Vec<u8>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: IpAddr::from([127, 0, 0, 1]),
            control_port: env_port("CULVERT_CONTROL_PORT", DEFAULT_CONTROL_PORT),
            socket_counts: vec![1],
        }
    }
}
