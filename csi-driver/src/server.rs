//! gRPC transport for the CSI services.
//!
//! Binds a unix domain socket or TCP listener and serves Identity,
//! Controller, and Node until the shutdown future resolves.

use std::future::Future;
use std::io::ErrorKind;
use std::path::Path;

use thiserror::Error;
use tokio::net::{TcpListener, UnixListener};
use tokio_stream::wrappers::{TcpListenerStream, UnixListenerStream};
use tonic::transport::Server;
use tonic::transport::server::Router;
use tracing::{debug, error, info};

use crate::csi::controller_server::ControllerServer;
use crate::csi::identity_server::IdentityServer;
use crate::csi::node_server::NodeServer;
use crate::driver::Driver;
use crate::types::CsiEndpoint;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: CsiEndpoint,
        #[source]
        source: std::io::Error,
    },

    #[error("gRPC server error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

/// Register every CSI service of `driver` on a fresh server.
pub fn router(driver: &Driver) -> Router {
    Server::builder()
        .add_service(IdentityServer::new(driver.identity()))
        .add_service(ControllerServer::new(driver.controller()))
        .add_service(NodeServer::new(driver.node()))
}

/// Serve `driver` on `endpoint` until `shutdown` completes.
pub async fn serve<F>(endpoint: &CsiEndpoint, driver: &Driver, shutdown: F) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send,
{
    let bind_error = |source: std::io::Error| ServerError::Bind {
        endpoint: endpoint.clone(),
        source,
    };

    match endpoint {
        CsiEndpoint::Unix(path) => {
            remove_stale_socket(path).map_err(bind_error)?;
            let listener = UnixListener::bind(path).map_err(bind_error)?;
            info!(endpoint = %endpoint, "CSI gRPC server listening");

            let result = router(driver)
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown)
                .await;

            if let Err(e) = std::fs::remove_file(path) {
                debug!(path = %path.display(), error = %e, "Could not remove CSI socket");
            }
            result?;
        }
        CsiEndpoint::Tcp(addr) => {
            let listener = TcpListener::bind(addr.as_str()).await.map_err(bind_error)?;
            info!(endpoint = %endpoint, "CSI gRPC server listening");

            router(driver)
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
                .await?;
        }
    }

    Ok(())
}

/// Remove a socket file left behind by a previous process.
fn remove_stale_socket(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            info!(path = %path.display(), "Removed stale CSI socket");
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Wait for SIGTERM or SIGINT.
pub async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let wait_for = |kind: SignalKind, name: &'static str| async move {
        match signal(kind) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received {}", name);
            }
            Err(e) => {
                // Leave the other handler in charge
                error!("Failed to install {} handler: {}", name, e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = wait_for(SignalKind::terminate(), "SIGTERM") => {}
        _ = wait_for(SignalKind::interrupt(), "SIGINT") => {}
    }
}
