//! RPC client for the Coordinator
//!
//! Holds one HTTP/2 connection and re-dials it when it drops. Each call
//! carries the hub credential in the `authorization` metadata.

use crate::error::{AgentError, AgentResult};
use bytes::Bytes;
use http::{header, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http2::{self, SendRequest};
use hyper_util::rt::{TokioExecutor, TokioIo};
use meridian_proto::rpc::{MESSAGE_HEADER, STATUS_HEADER};
use meridian_proto::{
    decode_frame, encode_frame, Code, RpcStatus, AUTHORIZATION_METADATA, RPC_CONTENT_TYPE,
};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig as TlsClientConfig, RootCertStore};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::TlsConnector;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Coordinator address as `host:port`
    pub addr: String,
    /// Hub credential
    pub token: String,
    /// Cleartext HTTP/2 with prior knowledge instead of TLS
    pub insecure: bool,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl ClientConfig {
    pub fn new(addr: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            token: token.into(),
            insecure: false,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

pub struct ControlClient {
    config: ClientConfig,
    host: String,
    tls: Option<TlsConnector>,
    sender: Mutex<Option<SendRequest<Full<Bytes>>>>,
}

impl ControlClient {
    pub fn new(config: ClientConfig) -> AgentResult<Self> {
        let host = host_of(&config.addr)?;
        let tls = if config.insecure {
            None
        } else {
            Some(tls_connector()?)
        };
        Ok(Self {
            config,
            host,
            tls,
            sender: Mutex::new(None),
        })
    }

    pub fn addr(&self) -> &str {
        &self.config.addr
    }

    /// Unary call with the configured credential
    pub async fn call<Req, Resp>(&self, method: &str, request: &Req) -> AgentResult<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        self.call_as(&self.config.token, method, request).await
    }

    /// Unary call presenting `token` instead of the configured credential
    pub async fn call_as<Req, Resp>(
        &self,
        token: &str,
        method: &str,
        request: &Req,
    ) -> AgentResult<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let timeout = self.config.request_timeout;
        tokio::time::timeout(timeout, self.exchange(token, method, request))
            .await
            .map_err(|_| AgentError::Timeout(timeout))?
    }

    async fn exchange<Req, Resp>(
        &self,
        token: &str,
        method: &str,
        request: &Req,
    ) -> AgentResult<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let body = encode_frame(request)?;
        let scheme = if self.tls.is_some() { "https" } else { "http" };
        let request = Request::builder()
            .method(Method::POST)
            .uri(format!("{}://{}{}", scheme, self.config.addr, method))
            .header(header::CONTENT_TYPE, RPC_CONTENT_TYPE)
            .header(header::TE, "trailers")
            .header(AUTHORIZATION_METADATA, format!("Bearer {}", token))
            .body(Full::new(body))
            .map_err(|e| AgentError::Transport(e.to_string()))?;

        let mut sender = self.sender().await?;
        let response = match sender.send_request(request).await {
            Ok(response) => response,
            Err(e) => {
                self.sender.lock().await.take();
                return Err(e.into());
            }
        };
        read_response(response).await
    }

    async fn sender(&self) -> AgentResult<SendRequest<Full<Bytes>>> {
        let mut slot = self.sender.lock().await;
        if let Some(sender) = slot.as_ref() {
            if !sender.is_closed() {
                return Ok(sender.clone());
            }
        }
        let sender = self.connect().await?;
        *slot = Some(sender.clone());
        Ok(sender)
    }

    async fn connect(&self) -> AgentResult<SendRequest<Full<Bytes>>> {
        let timeout = self.config.connect_timeout;
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&self.config.addr))
            .await
            .map_err(|_| AgentError::Timeout(timeout))?
            .map_err(|e| AgentError::Transport(format!("connect {}: {}", self.config.addr, e)))?;
        stream.set_nodelay(true)?;

        match &self.tls {
            Some(connector) => {
                let name = ServerName::try_from(self.host.clone())
                    .map_err(|e| AgentError::InvalidConfig(format!("server name: {}", e)))?;
                let stream = connector
                    .connect(name, stream)
                    .await
                    .map_err(|e| AgentError::Transport(format!("TLS handshake: {}", e)))?;
                self.handshake(stream).await
            }
            None => self.handshake(stream).await,
        }
    }

    async fn handshake<I>(&self, io: I) -> AgentResult<SendRequest<Full<Bytes>>>
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sender, connection) = http2::handshake(TokioExecutor::new(), TokioIo::new(io)).await?;
        let addr = self.config.addr.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(addr = %addr, error = %e, "Control connection closed");
            }
        });
        debug!(addr = %self.config.addr, tls = self.tls.is_some(), "Connected to coordinator");
        Ok(sender)
    }
}

async fn read_response<Resp: DeserializeOwned>(response: Response<Incoming>) -> AgentResult<Resp> {
    if response.status() != StatusCode::OK {
        return Err(AgentError::Transport(format!(
            "unexpected HTTP status {}",
            response.status()
        )));
    }

    // Trailers-only responses carry the status in the headers
    if let Some(status) = status_from(response.headers()) {
        if status.code != Code::Ok {
            return Err(status.into());
        }
    }

    let collected = response.into_body().collect().await?;
    let status = collected
        .trailers()
        .and_then(status_from)
        .ok_or_else(|| AgentError::Transport("response without grpc-status".to_string()))?;
    if status.code != Code::Ok {
        return Err(status.into());
    }
    Ok(decode_frame(&collected.to_bytes())?)
}

fn status_from(headers: &http::HeaderMap) -> Option<RpcStatus> {
    let status = headers.get(STATUS_HEADER)?.to_str().ok()?;
    let message = headers.get(MESSAGE_HEADER).and_then(|v| v.to_str().ok());
    Some(RpcStatus::from_headers(status, message))
}

fn tls_connector() -> AgentResult<TlsConnector> {
    let roots = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let mut config = TlsClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| AgentError::InvalidConfig(e.to_string()))?
    .with_root_certificates(roots)
    .with_no_client_auth();
    config.alpn_protocols = vec![b"h2".to_vec()];
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Host part of `host:port`, without IPv6 brackets
fn host_of(addr: &str) -> AgentResult<String> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| AgentError::InvalidConfig(format!("missing port in {}", addr)))?;
    port.parse::<u16>()
        .map_err(|_| AgentError::InvalidConfig(format!("invalid port in {}", addr)))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(AgentError::InvalidConfig(format!("missing host in {}", addr)));
    }
    Ok(host.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("control.example.com:443").unwrap(), "control.example.com");
        assert_eq!(host_of("[::1]:24401").unwrap(), "::1");
        assert!(host_of("control.example.com").is_err());
        assert!(host_of(":443").is_err());
        assert!(host_of("host:http").is_err());
    }

    #[tokio::test]
    async fn test_unreachable_coordinator_is_transient() {
        let mut config = ClientConfig::new("127.0.0.1:1", "token");
        config.insecure = true;
        config.connect_timeout = Duration::from_millis(500);
        let client = ControlClient::new(config).unwrap();

        let err = client
            .call::<_, meridian_proto::Noop>(
                "/meridian.ControlServices/AllHubs",
                &meridian_proto::Noop {},
            )
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
