//! The admin HTTP API.
//!
//! Operators and the platform create and list snapshots, restore tenants and undo single agent
//! operations through a small JSON API. See [`http`] for the routes.

pub mod http;

use std::{convert::Infallible, sync::Arc, time::Duration};

use hyper::server::conn::AddrStream;
use observability_deps::tracing::{info, warn};
use rewind_clap_blocks::server::ServerConfig;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use http::{HttpApi, HttpApiArgs};

#[derive(Debug, Error)]
pub enum Error {
    #[error("http server error: {0}")]
    Hyper(#[from] hyper::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Serve the API until `shutdown` is cancelled.
///
/// Requests in flight when shutdown starts get the configured grace period to finish; whatever is
/// still running after that is dropped.
pub async fn serve(
    api: Arc<HttpApi>,
    config: ServerConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let server = hyper::Server::try_bind(&config.http_bind_address)?.serve(
        hyper::service::make_service_fn(|_conn: &AddrStream| {
            let api = Arc::clone(&api);
            let service = hyper::service::service_fn(move |request| {
                http::route_request(Arc::clone(&api), request)
            });
            futures::future::ready(Ok::<_, Infallible>(service))
        }),
    );
    info!(address = %server.local_addr(), "admin API listening");

    let server = server.with_graceful_shutdown(shutdown.cancelled());
    tokio::pin!(server);
    let grace_period: Duration = config.shutdown_grace_period.into();
    tokio::select! {
        res = &mut server => res?,
        _ = async {
            shutdown.cancelled().await;
            tokio::time::sleep(grace_period).await;
        } => {
            warn!(?grace_period, "shutdown grace period elapsed, dropping in-flight requests");
        }
    }
    info!("admin API stopped");
    Ok(())
}
