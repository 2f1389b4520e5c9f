//! Config for the admin HTTP server.

use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, clap::Parser)]
pub struct ServerConfig {
    /// The address on which the admin API listens.
    #[clap(
        long = "http-bind",
        env = "REWIND_HTTP_BIND_ADDR",
        default_value = "127.0.0.1:8383",
        action
    )]
    pub http_bind_address: SocketAddr,

    /// How long in-flight requests may take to finish once shutdown has started.
    #[clap(
        long = "shutdown-grace-period",
        env = "REWIND_SHUTDOWN_GRACE_PERIOD",
        default_value = "30s",
        action
    )]
    pub shutdown_grace_period: humantime::Duration,
}
