//! Hub-facing TLS listener
//!
//! Terminates TLS with whatever material the agent currently holds and
//! authenticates each request against the Coordinator. The tunnel data path
//! lives elsewhere, so authenticated requests are answered with 404 once the
//! exchange is accounted for.

use crate::agent::Agent;
use crate::error::{AgentError, AgentResult};
use bytes::Bytes;
use chrono::Utc;
use http::{header, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use meridian_proto::{Capability, Code};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const ALPN_H2: &[u8] = b"h2";
const ALPN_HTTP11: &[u8] = b"http/1.1";

pub struct HubListener {
    agent: Arc<Agent>,
    handshake_timeout: Duration,
}

impl HubListener {
    pub fn new(agent: Arc<Agent>) -> Self {
        Self {
            agent,
            handshake_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// TLS settings resolving against the agent's hot-swapped material
    pub fn tls_config(&self) -> AgentResult<Arc<rustls::ServerConfig>> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| AgentError::InvalidConfig(format!("TLS protocol versions: {}", e)))?
            .with_no_client_auth()
            .with_cert_resolver(self.agent.resolver());
        config.alpn_protocols = vec![ALPN_H2.to_vec(), ALPN_HTTP11.to_vec()];
        Ok(Arc::new(config))
    }

    /// Accept until `shutdown` fires, then drain. `force` abandons open
    /// connections.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
        force: CancellationToken,
    ) -> AgentResult<()> {
        let acceptor = TlsAcceptor::from(self.tls_config()?);
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Hub listener started");

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!(error = %e, "Failed to accept hub connection");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            continue;
                        }
                    };
                    let acceptor = acceptor.clone();
                    let agent = self.agent.clone();
                    let handshake_timeout = self.handshake_timeout;
                    let shutdown = shutdown.clone();
                    connections.spawn(async move {
                        let accept = acceptor.accept(stream);
                        let tls = match tokio::time::timeout(handshake_timeout, accept).await {
                            Ok(Ok(tls)) => tls,
                            Ok(Err(e)) => {
                                debug!(peer = %peer, error = %e, "Hub TLS handshake failed");
                                return;
                            }
                            Err(_) => {
                                debug!(peer = %peer, "Hub TLS handshake timed out");
                                return;
                            }
                        };

                        let service = service_fn(move |request: Request<Incoming>| {
                            let agent = agent.clone();
                            async move { Ok::<_, Infallible>(handle(agent, peer, request).await) }
                        });
                        let builder = auto::Builder::new(TokioExecutor::new());
                        let connection = builder.serve_connection(TokioIo::new(tls), service);
                        tokio::pin!(connection);

                        let result = tokio::select! {
                            result = connection.as_mut() => result,
                            _ = shutdown.cancelled() => {
                                connection.as_mut().graceful_shutdown();
                                connection.as_mut().await
                            }
                        };
                        if let Err(e) = result {
                            debug!(peer = %peer, error = %e, "Hub connection closed with error");
                        }
                    });
                }
            }
        }

        drop(listener);
        tokio::select! {
            _ = async { while connections.join_next().await.is_some() {} } => {
                info!("Hub listener stopped");
            }
            _ = force.cancelled() => {
                warn!(open = connections.len(), "Forcing hub connections closed");
                connections.abort_all();
            }
        }
        Ok(())
    }
}

async fn handle(
    agent: Arc<Agent>,
    peer: SocketAddr,
    request: Request<Incoming>,
) -> Response<Full<Bytes>> {
    let host = request_host(&request);
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string());

    let Some(token) = token.filter(|t| !t.is_empty()) else {
        return plain(StatusCode::UNAUTHORIZED, "missing bearer token");
    };

    let verified = match agent.verify_token(&token).await {
        Ok(verified) => verified,
        Err(AgentError::Rpc(status))
            if matches!(
                status.code,
                Code::Unauthenticated | Code::NotFound | Code::PermissionDenied
            ) =>
        {
            debug!(peer = %peer, code = %status.code, "Rejected hub request");
            return plain(StatusCode::UNAUTHORIZED, "invalid token");
        }
        Err(e) => {
            warn!(peer = %peer, error = %e, "Token verification unavailable");
            return plain(StatusCode::SERVICE_UNAVAILABLE, "coordinator unavailable");
        }
    };

    if !verified.capabilities.contains(&Capability::Access) {
        return plain(StatusCode::FORBIDDEN, "token does not grant access");
    }

    let flows = agent.flows();
    let flow_id = flows.open(&host, verified.account.account_id, Utc::now());
    let received = match request.into_body().collect().await {
        Ok(body) => body.to_bytes().len() as u64,
        Err(e) => {
            debug!(peer = %peer, error = %e, "Failed to read request body");
            0
        }
    };

    let body = format!("no service for {}\n", host);
    flows.exchange(&flow_id, received, body.len() as u64);
    plain(StatusCode::NOT_FOUND, body)
}

fn request_host<B>(request: &Request<B>) -> String {
    request
        .uri()
        .host()
        .map(str::to_string)
        .or_else(|| {
            request
                .headers()
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(|h| h.split(':').next().unwrap_or(h).to_string())
        })
        .unwrap_or_default()
}

fn plain(status: StatusCode, body: impl Into<String>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.into())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_host() {
        let absolute = Request::builder()
            .uri("https://api.hub.example.com/x")
            .body(())
            .unwrap();
        assert_eq!(request_host(&absolute), "api.hub.example.com");

        let relative = Request::builder()
            .uri("/x")
            .header(header::HOST, "svc.hub.example.com:443")
            .body(())
            .unwrap();
        assert_eq!(request_host(&relative), "svc.hub.example.com");

        let bare = Request::builder().uri("/").body(()).unwrap();
        assert_eq!(request_host(&bare), "");
    }
}
