//! Coordinator errors and their RPC status mapping

use crate::metrics::MetricsError;
use meridian_auth::TokenError;
use meridian_cert::CertError;
use meridian_proto::{Code, RpcStatus};
use meridian_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
    /// Caller credential missing, unknown or revoked
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// Valid credential without the required capability or namespace
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Cert(#[from] CertError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Metrics(#[from] MetricsError),
}

pub type ControlResult<T> = Result<T, ControlError>;

impl ControlError {
    pub fn status(&self) -> RpcStatus {
        match self {
            ControlError::Unauthenticated(msg) => RpcStatus::unauthenticated(msg.clone()),
            ControlError::PermissionDenied(msg) => RpcStatus::permission_denied(msg.clone()),
            ControlError::InvalidArgument(msg) => RpcStatus::invalid_argument(msg.clone()),
            ControlError::NotFound(msg) => RpcStatus::not_found(msg.clone()),
            ControlError::Unavailable(msg) => RpcStatus::unavailable(msg.clone()),
            ControlError::Token(e) => match e {
                TokenError::Unauthorized => RpcStatus::unauthenticated("unauthorized"),
                TokenError::InvalidArgument(msg) => RpcStatus::invalid_argument(msg.clone()),
                TokenError::NotFound => RpcStatus::not_found("token not found"),
                TokenError::Revoked => RpcStatus::permission_denied("token revoked"),
                TokenError::Store(_) => RpcStatus::unavailable("token store unavailable"),
                TokenError::Signing(_) => RpcStatus::internal("token signing failed"),
            },
            ControlError::Cert(CertError::NotIssued(domain)) => {
                RpcStatus::unavailable(format!("no certificate issued for {}", domain))
            }
            ControlError::Cert(CertError::InvalidMaterial(msg)) => {
                RpcStatus::invalid_argument(msg.clone())
            }
            ControlError::Store(_) | ControlError::Database(_) => {
                RpcStatus::new(Code::Unavailable, "store unavailable")
            }
            ControlError::Cert(_)
            | ControlError::Tls(_)
            | ControlError::Io(_)
            | ControlError::Metrics(_) => RpcStatus::internal(self.to_string()),
        }
    }
}

impl From<ControlError> for RpcStatus {
    fn from(err: ControlError) -> Self {
        err.status()
    }
}
