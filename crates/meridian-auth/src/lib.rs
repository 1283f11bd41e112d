//! Capability tokens for the Meridian control plane
//!
//! Tokens are HS256-signed JWTs naming an account, a namespace and a set of
//! capabilities. The signature only proves the token was minted here; every
//! verification also looks up the backing record, so deleting the record
//! revokes the token immediately on all replicas.

pub mod claims;
pub mod error;
pub mod issuer;
pub mod secret;
pub mod store;

pub use claims::TokenClaims;
pub use error::{TokenError, TokenResult};
pub use issuer::{AdminGrant, CapabilityTokenIssuer, IssuerConfig, VerifiedToken};
pub use secret::BootstrapSecret;
pub use store::{DbTokenStore, MemoryTokenStore, TokenRecord, TokenStore};
