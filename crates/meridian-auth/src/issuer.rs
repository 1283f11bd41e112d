//! Capability token issuer

use crate::claims::{TokenClaims, TokenSigner};
use crate::error::{TokenError, TokenResult};
use crate::secret::BootstrapSecret;
use crate::store::{TokenRecord, TokenStore};
use chrono::{DateTime, Utc};
use meridian_proto::{is_valid_namespace, Account, Capability};
use meridian_store::{SecretStore, SharedClock};
use rand::RngCore;
use std::sync::Arc;
use tracing::{debug, info};

/// Length of a freshly generated signing key
const SIGNING_KEY_LEN: usize = 32;

#[derive(Debug, Clone)]
pub struct IssuerConfig {
    /// Secrets-store prefix for signing material
    pub vault_path: String,
    pub key_id: String,
}

impl Default for IssuerConfig {
    fn default() -> Self {
        Self {
            vault_path: "meridian-k1".to_string(),
            key_id: "k1".to_string(),
        }
    }
}

impl IssuerConfig {
    pub fn signing_key_path(&self) -> String {
        format!("{}/signing-key/{}", self.vault_path, self.key_id)
    }
}

/// Proof that the caller presented the administrative credential.
///
/// Only [`CapabilityTokenIssuer::admin_grant`] constructs one, so holding a
/// capability token is never enough to mint another.
#[derive(Debug)]
pub struct AdminGrant {
    _private: (),
}

/// Result of a successful verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedToken {
    pub jti: String,
    pub account: Account,
    pub capabilities: Vec<Capability>,
    pub issued_at: DateTime<Utc>,
}

impl VerifiedToken {
    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

pub struct CapabilityTokenIssuer {
    signer: TokenSigner,
    key_id: String,
    admin: BootstrapSecret,
    tokens: Arc<dyn TokenStore>,
    clock: SharedClock,
}

impl CapabilityTokenIssuer {
    /// Load (or create on first start) the signing key and build the issuer.
    ///
    /// All replicas sharing a secrets store converge on the same key because
    /// creation is a write-if-absent.
    pub async fn load(
        config: &IssuerConfig,
        admin_secret: &str,
        secrets: &dyn SecretStore,
        tokens: Arc<dyn TokenStore>,
        clock: SharedClock,
    ) -> TokenResult<Self> {
        let mut fresh = [0u8; SIGNING_KEY_LEN];
        rand::thread_rng().fill_bytes(&mut fresh);

        let path = config.signing_key_path();
        let key = secrets.write_if_absent(&path, &fresh).await?;
        info!(key_id = %config.key_id, version = key.version, "Loaded token signing key");

        Ok(Self::with_key(
            &config.key_id,
            &key.data,
            admin_secret,
            tokens,
            clock,
        ))
    }

    pub fn with_key(
        key_id: &str,
        key: &[u8],
        admin_secret: &str,
        tokens: Arc<dyn TokenStore>,
        clock: SharedClock,
    ) -> Self {
        Self {
            signer: TokenSigner::new(key_id, key),
            key_id: key_id.to_string(),
            admin: BootstrapSecret::new(admin_secret),
            tokens,
            clock,
        }
    }

    /// Exchange the administrative credential for a grant
    pub fn admin_grant(&self, presented: &str) -> TokenResult<AdminGrant> {
        if self.admin.matches(presented) {
            Ok(AdminGrant { _private: () })
        } else {
            Err(TokenError::Unauthorized)
        }
    }

    /// Mint a token bound to `account` and `capabilities`.
    ///
    /// Duplicate capabilities are collapsed, keeping first-seen order.
    pub async fn issue(
        &self,
        _grant: &AdminGrant,
        account: &Account,
        capabilities: &[Capability],
    ) -> TokenResult<String> {
        if account.namespace.is_empty() {
            return Err(TokenError::InvalidArgument("namespace is empty".into()));
        }
        if !is_valid_namespace(&account.namespace) {
            return Err(TokenError::InvalidArgument(format!(
                "invalid namespace: {}",
                account.namespace
            )));
        }
        if capabilities.is_empty() {
            return Err(TokenError::InvalidArgument("no capabilities".into()));
        }

        let mut caps: Vec<Capability> = Vec::with_capacity(capabilities.len());
        for cap in capabilities {
            if !caps.contains(cap) {
                caps.push(*cap);
            }
        }

        let issued_at = self.clock.now();
        let record = TokenRecord {
            jti: uuid::Uuid::new_v4().simple().to_string(),
            account: account.clone(),
            capabilities: caps,
            key_id: self.key_id.clone(),
            issued_at,
        };

        let claims = TokenClaims {
            jti: record.jti.clone(),
            sub: account.account_id,
            ns: account.namespace.clone(),
            caps: record.capabilities.clone(),
            iat: issued_at.timestamp(),
        };
        let token = self.signer.sign(&claims)?;

        self.tokens.insert(&record).await?;

        debug!(
            account_id = %account.account_id,
            namespace = %account.namespace,
            jti = %record.jti,
            "Issued capability token"
        );

        Ok(token)
    }

    /// Authoritative lookup of a token's binding.
    ///
    /// `NotFound` means the string was never minted by this issuer;
    /// `Revoked` means it was, but its record is gone.
    pub async fn verify(&self, token: &str) -> TokenResult<VerifiedToken> {
        let claims = self.signer.verify(token).ok_or(TokenError::NotFound)?;

        let record = self
            .tokens
            .get(&claims.jti)
            .await?
            .ok_or(TokenError::Revoked)?;

        if record.account.account_id != claims.sub || record.account.namespace != claims.ns {
            return Err(TokenError::NotFound);
        }

        Ok(VerifiedToken {
            jti: record.jti,
            account: record.account,
            capabilities: record.capabilities,
            issued_at: record.issued_at,
        })
    }

    /// Remove the token's backing record; unknown tokens are ignored
    pub async fn revoke(&self, token: &str) -> TokenResult<()> {
        let Some(claims) = self.signer.verify(token) else {
            return Ok(());
        };
        if self.tokens.delete(&claims.jti).await? {
            info!(jti = %claims.jti, account_id = %claims.sub, "Revoked capability token");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryTokenStore;
    use meridian_proto::StableId;
    use meridian_store::{system_clock, MemorySecretStore};

    async fn issuer() -> CapabilityTokenIssuer {
        let secrets = MemorySecretStore::new(system_clock());
        CapabilityTokenIssuer::load(
            &IssuerConfig::default(),
            "aabbcc",
            &secrets,
            Arc::new(MemoryTokenStore::new()),
            system_clock(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_admin_grant_requires_secret() {
        let issuer = issuer().await;
        assert!(issuer.admin_grant("aabbcc").is_ok());
        assert!(matches!(
            issuer.admin_grant("nope"),
            Err(TokenError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn test_issue_rejects_empty_inputs() {
        let issuer = issuer().await;
        let grant = issuer.admin_grant("aabbcc").unwrap();
        let id = StableId::new();

        let err = issuer
            .issue(&grant, &Account::new(id, ""), &[Capability::Serve])
            .await
            .unwrap_err();
        assert!(matches!(err, TokenError::InvalidArgument(_)));

        let err = issuer
            .issue(&grant, &Account::new(id, "/tenant1"), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, TokenError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_duplicate_capabilities_collapse() {
        let issuer = issuer().await;
        let grant = issuer.admin_grant("aabbcc").unwrap();
        let account = Account::new(StableId::new(), "/tenant1");

        let token = issuer
            .issue(
                &grant,
                &account,
                &[Capability::Access, Capability::Serve, Capability::Access],
            )
            .await
            .unwrap();
        let verified = issuer.verify(&token).await.unwrap();
        assert_eq!(
            verified.capabilities,
            vec![Capability::Access, Capability::Serve]
        );
    }

    #[tokio::test]
    async fn test_garbage_is_not_found() {
        let issuer = issuer().await;
        assert!(matches!(
            issuer.verify("garbage").await,
            Err(TokenError::NotFound)
        ));
        issuer.revoke("garbage").await.unwrap();
    }
}
