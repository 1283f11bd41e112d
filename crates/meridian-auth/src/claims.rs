//! JWT claims carried by capability tokens

use jsonwebtoken::{
    decode, decode_header, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use meridian_proto::{Capability, StableId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenClaims {
    /// Token id; key of the backing record
    pub jti: String,
    /// Account id
    pub sub: StableId,
    /// Namespace
    pub ns: String,
    /// Capabilities in issuance order
    pub caps: Vec<Capability>,
    /// Issued at (timestamp)
    pub iat: i64,
}

/// HS256 signer/verifier for one key id
pub(crate) struct TokenSigner {
    key_id: String,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenSigner {
    pub(crate) fn new(key_id: &str, secret: &[u8]) -> Self {
        // Tokens carry no expiry; revocation is the only removal path
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.validate_nbf = false;
        validation.required_spec_claims.clear();

        Self {
            key_id: key_id.to_string(),
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    pub(crate) fn sign(&self, claims: &TokenClaims) -> Result<String, jsonwebtoken::errors::Error> {
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(self.key_id.clone());
        encode(&header, claims, &self.encoding_key)
    }

    /// Claims of a token signed by this key, or `None` for anything else
    pub(crate) fn verify(&self, token: &str) -> Option<TokenClaims> {
        let header = decode_header(token).ok()?;
        if header.kid.as_deref() != Some(self.key_id.as_str()) {
            return None;
        }
        decode::<TokenClaims>(token, &self.decoding_key, &self.validation)
            .ok()
            .map(|data| data.claims)
    }
}
