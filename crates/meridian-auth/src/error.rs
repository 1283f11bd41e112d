//! Token errors

use meridian_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TokenError {
    /// Administrative credential missing or wrong
    #[error("unauthorized")]
    Unauthorized,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Not a token minted by this issuer
    #[error("token not found")]
    NotFound,

    /// Minted here, but its backing record has been removed
    #[error("token revoked")]
    Revoked,

    #[error("token signing error: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

pub type TokenResult<T> = Result<T, TokenError>;
