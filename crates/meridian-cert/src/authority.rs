//! Certificate authorities: ACME (DNS-01) and self-signed

use crate::error::{CertError, CertResult};
use crate::self_signed::{generate_self_signed, IssuedCertificate};
use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt,
    NewAccount, NewOrder, Order, OrderStatus, RetryPolicy,
};
use meridian_store::{Clock, SecretStore, SharedClock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// TXT record the authority expects before validating an order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsChallenge {
    pub record_name: String,
    pub value: String,
}

/// Name of the DNS-01 record for `domain`; wildcards validate on the base name
pub fn challenge_record_name(domain: &str) -> String {
    format!("_acme-challenge.{}", domain.trim_start_matches("*."))
}

#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Open an order for `domain` and return the challenges to publish
    async fn begin(&self, domain: &str) -> CertResult<Box<dyn PendingOrder>>;
}

#[async_trait]
pub trait PendingOrder: Send {
    fn challenges(&self) -> &[DnsChallenge];

    /// Signal readiness, wait for validation and download the chain.
    /// Callers bound this with their own timeout.
    async fn complete(self: Box<Self>) -> CertResult<IssuedCertificate>;
}

#[derive(Debug, Clone)]
pub struct AcmeConfig {
    pub directory_url: String,
    /// Contact addresses, with or without `mailto:`
    pub contact: Vec<String>,
    /// Secret path holding the account credentials
    pub account_path: String,
    /// Upper bound for instant-acme's own polling
    pub poll_timeout: Duration,
}

impl AcmeConfig {
    pub fn lets_encrypt(staging: bool, account_path: impl Into<String>) -> Self {
        let directory = if staging {
            LetsEncrypt::Staging
        } else {
            LetsEncrypt::Production
        };
        Self {
            directory_url: directory.url().to_string(),
            contact: Vec::new(),
            account_path: account_path.into(),
            poll_timeout: Duration::from_secs(360),
        }
    }
}

/// ACME issuer with the account persisted in the secret store, so every
/// replica shares one account
pub struct AcmeAuthority {
    config: AcmeConfig,
    secrets: Arc<dyn SecretStore>,
    account: tokio::sync::Mutex<Option<Account>>,
}

impl AcmeAuthority {
    pub fn new(config: AcmeConfig, secrets: Arc<dyn SecretStore>) -> Self {
        Self {
            config,
            secrets,
            account: tokio::sync::Mutex::new(None),
        }
    }

    async fn account(&self) -> CertResult<Account> {
        let mut slot = self.account.lock().await;
        if let Some(account) = slot.as_ref() {
            return Ok(account.clone());
        }

        let account = match self.secrets.read(&self.config.account_path).await? {
            Some(stored) => restore_account(&stored.data).await?,
            None => {
                let contact: Vec<String> = self
                    .config
                    .contact
                    .iter()
                    .map(|c| {
                        if c.starts_with("mailto:") {
                            c.clone()
                        } else {
                            format!("mailto:{}", c)
                        }
                    })
                    .collect();
                let contact: Vec<&str> = contact.iter().map(String::as_str).collect();

                let (account, credentials) = Account::builder()?
                    .create(
                        &NewAccount {
                            contact: &contact,
                            terms_of_service_agreed: true,
                            only_return_existing: false,
                        },
                        self.config.directory_url.clone(),
                        None,
                    )
                    .await?;
                let data = serde_json::to_vec(&credentials)
                    .map_err(|e| CertError::Acme(format!("encode account: {}", e)))?;

                // A concurrent replica may have registered first; adopt its account
                let stored = self
                    .secrets
                    .write_if_absent(&self.config.account_path, &data)
                    .await?;
                if stored.data == data {
                    info!(directory = %self.config.directory_url, "Registered ACME account");
                    account
                } else {
                    restore_account(&stored.data).await?
                }
            }
        };

        *slot = Some(account.clone());
        Ok(account)
    }
}

async fn restore_account(data: &[u8]) -> CertResult<Account> {
    let credentials: AccountCredentials = serde_json::from_slice(data)
        .map_err(|e| CertError::Acme(format!("decode account: {}", e)))?;
    Ok(Account::builder()?.from_credentials(credentials).await?)
}

#[async_trait]
impl CertificateAuthority for AcmeAuthority {
    async fn begin(&self, domain: &str) -> CertResult<Box<dyn PendingOrder>> {
        let account = self.account().await?;
        let identifiers = [Identifier::Dns(domain.to_string())];
        let mut order = account.new_order(&NewOrder::new(&identifiers)).await?;

        let mut challenges = Vec::new();
        {
            let mut authorizations = order.authorizations();
            while let Some(authz) = authorizations.next().await {
                let mut authz = authz?;
                match &authz.status {
                    AuthorizationStatus::Pending => {}
                    AuthorizationStatus::Valid => continue,
                    other => {
                        return Err(CertError::Acme(format!(
                            "authorization for {} is {:?}",
                            domain, other
                        )))
                    }
                }
                let challenge = authz
                    .challenge(ChallengeType::Dns01)
                    .ok_or_else(|| CertError::Acme(format!("no DNS-01 challenge for {}", domain)))?;
                challenges.push(DnsChallenge {
                    record_name: challenge_record_name(domain),
                    value: challenge.key_authorization().dns_value(),
                });
            }
        }

        debug!(domain = %domain, challenges = challenges.len(), "ACME order created");
        Ok(Box::new(AcmeOrder {
            order,
            challenges,
            poll_timeout: self.config.poll_timeout,
        }))
    }
}

struct AcmeOrder {
    order: Order,
    challenges: Vec<DnsChallenge>,
    poll_timeout: Duration,
}

#[async_trait]
impl PendingOrder for AcmeOrder {
    fn challenges(&self) -> &[DnsChallenge] {
        &self.challenges
    }

    async fn complete(self: Box<Self>) -> CertResult<IssuedCertificate> {
        let mut this = *self;
        {
            let mut authorizations = this.order.authorizations();
            while let Some(authz) = authorizations.next().await {
                let mut authz = authz?;
                if !matches!(authz.status, AuthorizationStatus::Pending) {
                    continue;
                }
                let mut challenge = authz
                    .challenge(ChallengeType::Dns01)
                    .ok_or_else(|| CertError::Acme("DNS-01 challenge disappeared".to_string()))?;
                challenge.set_ready().await?;
            }
        }

        let policy = RetryPolicy::new()
            .timeout(this.poll_timeout)
            .initial_delay(Duration::from_secs(2));
        match this.order.poll_ready(&policy).await? {
            OrderStatus::Ready | OrderStatus::Valid => {}
            other => {
                return Err(CertError::Acme(format!(
                    "order finished in state {:?}",
                    other
                )))
            }
        }

        let private_key = this.order.finalize().await?;
        let certificate_chain = this.order.poll_certificate(&policy).await?;
        Ok(IssuedCertificate {
            certificate_chain,
            private_key,
        })
    }
}

/// Issues self-signed material through the same order flow, for dev mode
/// and tests
pub struct SelfSignedAuthority {
    clock: SharedClock,
    validity: Duration,
    delay: Duration,
    never_validate: AtomicBool,
    orders: AtomicU64,
}

impl SelfSignedAuthority {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            validity: Duration::from_secs(90 * 24 * 3600),
            delay: Duration::ZERO,
            never_validate: AtomicBool::new(false),
            orders: AtomicU64::new(0),
        }
    }

    pub fn with_validity(mut self, validity: Duration) -> Self {
        self.validity = validity;
        self
    }

    /// Simulated validation latency
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Leave orders pending forever
    pub fn set_never_validate(&self, never: bool) {
        self.never_validate.store(never, Ordering::SeqCst);
    }

    /// Orders opened so far
    pub fn orders(&self) -> u64 {
        self.orders.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CertificateAuthority for SelfSignedAuthority {
    async fn begin(&self, domain: &str) -> CertResult<Box<dyn PendingOrder>> {
        self.orders.fetch_add(1, Ordering::SeqCst);
        let value = format!("{:032x}", rand::random::<u128>());
        Ok(Box::new(SelfSignedOrder {
            domain: domain.to_string(),
            challenges: vec![DnsChallenge {
                record_name: challenge_record_name(domain),
                value,
            }],
            clock: self.clock.clone(),
            validity: self.validity,
            delay: self.delay,
            never_validate: self.never_validate.load(Ordering::SeqCst),
        }))
    }
}

struct SelfSignedOrder {
    domain: String,
    challenges: Vec<DnsChallenge>,
    clock: SharedClock,
    validity: Duration,
    delay: Duration,
    never_validate: bool,
}

#[async_trait]
impl PendingOrder for SelfSignedOrder {
    fn challenges(&self) -> &[DnsChallenge] {
        &self.challenges
    }

    async fn complete(self: Box<Self>) -> CertResult<IssuedCertificate> {
        if self.never_validate {
            std::future::pending::<()>().await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        generate_self_signed(&self.domain, self.clock.now(), self.validity)
    }
}
