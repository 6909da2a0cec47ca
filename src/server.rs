//! TCP front end.
//!
//! Accepts connections and hands each one to the admission controller. The
//! accept loop never waits on the queue; a failed accept is logged and the
//! loop carries on.

use crate::admission::{AdmissionController, AdmissionStats};
use crate::config::Config;
use crate::connection::TcpConnection;
use crate::error::ServerError;
use crate::session::LineSession;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Pause after a failed accept, so a persistent error (e.g. out of file
/// descriptors) does not spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Server instance
pub struct Server {
    listener: TcpListener,
    controller: AdmissionController<TcpConnection, LineSession>,
}

impl Server {
    /// Bind the listener and start the admission controller.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(config: &Config) -> Result<Self, ServerError> {
        config.validate()?;

        let listener = create_listener(config.listen, config.backlog)
            .and_then(TcpListener::from_std)
            .map_err(|source| ServerError::Bind {
                addr: config.listen,
                source,
            })?;

        let session = LineSession::new(config.processing_delay);
        let controller = AdmissionController::new(config.admission, session);

        Ok(Server {
            listener,
            controller,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` resolves.
    ///
    /// On shutdown, waiting connections are evicted and the final counters
    /// are returned. Sessions already running are not interrupted here.
    pub async fn run_until<F>(self, shutdown: F) -> AdmissionStats
    where
        F: Future<Output = ()>,
    {
        if let Ok(addr) = self.local_addr() {
            info!(address = %addr, "Server listening");
        }

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, no longer accepting connections");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "New connection");
                        let admission = self.controller.admit(TcpConnection::new(stream, peer));
                        debug!(peer = %peer, ?admission, "Admission decided");
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                }
            }
        }

        self.controller.shutdown();
        self.controller.stats()
    }
}

/// Create a TCP listener with SO_REUSEADDR and the configured backlog.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}
