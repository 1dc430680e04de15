//! Listening side of the peer protocol

use super::{server_transport, ServerTransport, WireRequest, WireResponse};
use crate::error::FsError;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// What a server hands each decoded request to
///
/// An `Err` answers the peer with `Rejected` and closes the connection.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, request: WireRequest) -> Result<WireResponse, FsError>;
}

pub struct Server {
    listener: TcpListener,
}

impl Server {
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self, FsError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Server { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, FsError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept until `shutdown` flips to true
    pub async fn serve<H: RequestHandler>(self, handler: Arc<H>, mut shutdown: watch::Receiver<bool>) {
        let addr = self.listener.local_addr().ok();
        info!(?addr, "Listening for peers");
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(%remote, error = %e, "Could not set TCP_NODELAY");
                        }
                        let handler = Arc::clone(&handler);
                        tokio::spawn(async move {
                            handle_connection(server_transport(stream), remote, handler).await;
                        });
                    }
                    Err(e) => warn!(error = %e, "Accept failed"),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(?addr, "Listener stopped");
    }
}

async fn handle_connection<H: RequestHandler>(
    mut transport: ServerTransport,
    remote: SocketAddr,
    handler: Arc<H>,
) {
    debug!(%remote, "Peer connected");
    while let Some(frame) = transport.next().await {
        let request = match frame {
            Ok(request) => request,
            Err(e) => {
                warn!(%remote, error = %e, "Undecodable frame");
                let _ = transport.send(WireResponse::Rejected(e.to_string())).await;
                return;
            }
        };
        match handler.handle(request).await {
            Ok(response) => {
                if let Err(e) = transport.send(response).await {
                    debug!(%remote, error = %e, "Peer went away before the reply");
                    return;
                }
            }
            Err(e) => {
                error!(%remote, error = %e, "Rejecting request");
                let _ = transport.send(WireResponse::Rejected(e.to_string())).await;
                return;
            }
        }
    }
    debug!(%remote, "Peer disconnected");
}
