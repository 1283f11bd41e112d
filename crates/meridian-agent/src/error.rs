//! Agent errors

use meridian_cert::CertError;
use meridian_proto::{Code, FrameError, RpcStatus};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    /// The Coordinator answered with a non-OK status
    #[error("rpc failed: {0}")]
    Rpc(RpcStatus),

    /// The Coordinator could not be reached or the exchange broke off
    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed rpc message: {0}")]
    Frame(#[from] FrameError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("TLS material rejected: {0}")]
    Material(#[from] CertError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("cancelled")]
    Cancelled,
}

impl AgentError {
    /// Worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        match self {
            AgentError::Rpc(status) => status.code.is_transient(),
            AgentError::Transport(_) | AgentError::Timeout(_) | AgentError::Io(_) => true,
            _ => false,
        }
    }

    pub fn code(&self) -> Option<Code> {
        match self {
            AgentError::Rpc(status) => Some(status.code),
            _ => None,
        }
    }
}

impl From<RpcStatus> for AgentError {
    fn from(status: RpcStatus) -> Self {
        AgentError::Rpc(status)
    }
}

impl From<hyper::Error> for AgentError {
    fn from(err: hyper::Error) -> Self {
        AgentError::Transport(err.to_string())
    }
}

pub type AgentResult<T> = Result<T, AgentError>;
