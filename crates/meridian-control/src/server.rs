//! Dual-protocol front door
//!
//! One listener serves both surfaces. HTTP/2 requests whose content type
//! names an RPC payload go to the RPC dispatcher; everything else goes to
//! the plain HTTP router.

use crate::error::ControlResult;
use crate::http::http_router;
use crate::metrics::ControlMetrics;
use crate::rpc::rpc_router;
use crate::service::ControlService;
use axum::body::Body;
use axum::http::{header, Request, Version};
use axum::response::Response;
use axum::Router;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use meridian_cert::CertStats;
use meridian_jobs::WorkerStats;
use meridian_proto::rpc::RPC_CONTENT_TYPE_PREFIX;
use meridian_proto::DiscoveryDocument;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::{debug, error, info, warn};

/// Shared state behind both routers
pub struct ControlState {
    pub service: ControlService,
    pub metrics: ControlMetrics,
    pub cert_stats: Option<Arc<CertStats>>,
    pub worker_stats: Option<Arc<WorkerStats>>,
    /// Served instead of the hub table when set
    pub static_discovery: Option<DiscoveryDocument>,
}

impl ControlState {
    pub fn new(service: ControlService) -> ControlResult<Self> {
        Ok(Self {
            service,
            metrics: ControlMetrics::new()?,
            cert_stats: None,
            worker_stats: None,
            static_discovery: None,
        })
    }

    pub fn with_cert_stats(mut self, stats: Arc<CertStats>) -> Self {
        self.cert_stats = Some(stats);
        self
    }

    pub fn with_worker_stats(mut self, stats: Arc<WorkerStats>) -> Self {
        self.worker_stats = Some(stats);
        self
    }

    pub fn with_static_discovery(mut self, doc: DiscoveryDocument) -> Self {
        self.static_discovery = Some(doc);
        self
    }
}

/// HTTP/2 with an `application/grpc*` content type
pub fn is_rpc_request<B>(request: &Request<B>) -> bool {
    request.version() == Version::HTTP_2
        && request
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with(RPC_CONTENT_TYPE_PREFIX))
}

#[derive(Clone)]
pub struct FrontDoor {
    rpc: Router,
    http: Router,
}

impl FrontDoor {
    pub fn new(state: Arc<ControlState>) -> Self {
        Self {
            rpc: rpc_router(state.clone()),
            http: http_router(state),
        }
    }

    pub async fn handle(self, request: Request<Body>) -> Response {
        let router = if is_rpc_request(&request) {
            self.rpc
        } else {
            self.http
        };
        match router.oneshot(request).await {
            Ok(response) => response,
            Err(never) => match never {},
        }
    }
}

/// Listener settings
#[derive(Clone)]
pub struct ServerConfig {
    /// `None` serves cleartext (h2c and HTTP/1.1)
    pub tls: Option<Arc<rustls::ServerConfig>>,
    /// Upper bound on TLS handshakes
    pub handshake_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tls: None,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

pub struct ControlServer {
    config: ServerConfig,
    front_door: FrontDoor,
}

impl ControlServer {
    pub fn new(config: ServerConfig, state: Arc<ControlState>) -> Self {
        Self {
            config,
            front_door: FrontDoor::new(state),
        }
    }

    /// Accept connections until `shutdown` fires, then let open connections
    /// finish. Cancelling `force` abandons them.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
        force: CancellationToken,
    ) -> ControlResult<()> {
        let local_addr = listener.local_addr()?;
        info!(
            addr = %local_addr,
            tls = self.config.tls.is_some(),
            "Control server listening"
        );

        let acceptor = self.config.tls.clone().map(TlsAcceptor::from);
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            continue;
                        }
                    };
                    let front_door = self.front_door.clone();
                    let acceptor = acceptor.clone();
                    let handshake_timeout = self.config.handshake_timeout;
                    let shutdown = shutdown.clone();
                    connections.spawn(async move {
                        match acceptor {
                            Some(acceptor) => {
                                let tls = match tokio::time::timeout(
                                    handshake_timeout,
                                    acceptor.accept(stream),
                                )
                                .await
                                {
                                    Ok(Ok(tls)) => tls,
                                    Ok(Err(e)) => {
                                        debug!(peer = %peer, error = %e, "TLS handshake failed");
                                        return;
                                    }
                                    Err(_) => {
                                        debug!(peer = %peer, "TLS handshake timed out");
                                        return;
                                    }
                                };
                                serve_connection(tls, peer, front_door, shutdown).await;
                            }
                            None => serve_connection(stream, peer, front_door, shutdown).await,
                        }
                    });
                }
            }
        }

        drop(listener);
        info!(open = connections.len(), "Control server draining connections");

        tokio::select! {
            _ = async { while connections.join_next().await.is_some() {} } => {
                info!("Control server stopped");
            }
            _ = force.cancelled() => {
                warn!(open = connections.len(), "Forcing open connections closed");
                connections.abort_all();
            }
        }
        Ok(())
    }
}

async fn serve_connection<I>(
    io: I,
    peer: SocketAddr,
    front_door: FrontDoor,
    shutdown: CancellationToken,
) where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = tower::service_fn(move |request: Request<Incoming>| {
        let front_door = front_door.clone();
        async move { Ok::<_, Infallible>(front_door.handle(request.map(Body::new)).await) }
    });

    let builder = auto::Builder::new(TokioExecutor::new());
    let connection = builder.serve_connection(TokioIo::new(io), TowerToHyperService::new(service));
    tokio::pin!(connection);

    let result = tokio::select! {
        result = connection.as_mut() => result,
        _ = shutdown.cancelled() => {
            connection.as_mut().graceful_shutdown();
            connection.as_mut().await
        }
    };
    if let Err(e) = result {
        debug!(peer = %peer, error = %e, "Connection closed with error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_detection() {
        let rpc = Request::builder()
            .version(Version::HTTP_2)
            .header(header::CONTENT_TYPE, "application/grpc+json")
            .body(())
            .unwrap();
        assert!(is_rpc_request(&rpc));

        let http1 = Request::builder()
            .version(Version::HTTP_11)
            .header(header::CONTENT_TYPE, "application/grpc")
            .body(())
            .unwrap();
        assert!(!is_rpc_request(&http1));

        let plain = Request::builder()
            .version(Version::HTTP_2)
            .header(header::CONTENT_TYPE, "application/json")
            .body(())
            .unwrap();
        assert!(!is_rpc_request(&plain));
    }
}
