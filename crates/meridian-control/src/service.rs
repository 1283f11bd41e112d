//! Coordinator RPC operations
//!
//! Every method takes the caller's bearer credential as presented in the
//! `authorization` metadata and the decoded request.

use crate::error::{ControlError, ControlResult};
use crate::flows::FlowAggregator;
use crate::hubs::HubRegistry;
use crate::tls::HubTls;
use meridian_auth::{AdminGrant, BootstrapSecret, CapabilityTokenIssuer, TokenError, VerifiedToken};
use meridian_proto::{
    is_valid_namespace, namespace_contains, Account, Capability, ConfigRequest, ConfigResponse,
    CreateTokenRequest, FlowTopReport, HubDisconnectRequest, HubRegisterRequest, ListHubsResponse,
    ManagementTokenRequest, Noop, RevokeTokenRequest, ServiceTokenRequest, StableId,
    TokenResponse, VerifyTokenRequest, VerifyTokenResponse,
};
use meridian_store::{record_activity, Clock, SharedClock};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// Namespace hub accounts are created in
    pub hub_namespace: String,
    /// Namespace hubs request their service token for
    pub service_namespace: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            hub_namespace: "/meridian/hubs".to_string(),
            service_namespace: "/waypoint".to_string(),
        }
    }
}

pub struct ControlService {
    config: ControlConfig,
    issuer: Arc<CapabilityTokenIssuer>,
    grant: AdminGrant,
    register_secret: BootstrapSecret,
    ops_secret: BootstrapSecret,
    hubs: HubRegistry,
    tls: Arc<HubTls>,
    flows: Arc<FlowAggregator>,
    clock: SharedClock,
}

impl ControlService {
    /// `ops_token` is also the issuer's administrative credential; the grant
    /// it yields is only exercised after the caller's own credential checks
    /// out.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ControlConfig,
        issuer: Arc<CapabilityTokenIssuer>,
        register_token: &str,
        ops_token: &str,
        hubs: HubRegistry,
        tls: Arc<HubTls>,
        flows: Arc<FlowAggregator>,
        clock: SharedClock,
    ) -> ControlResult<Self> {
        let grant = issuer.admin_grant(ops_token)?;
        Ok(Self {
            config,
            issuer,
            grant,
            register_secret: BootstrapSecret::new(register_token),
            ops_secret: BootstrapSecret::new(ops_token),
            hubs,
            tls,
            flows,
            clock,
        })
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    pub fn hubs(&self) -> &HubRegistry {
        &self.hubs
    }

    pub fn tls(&self) -> &Arc<HubTls> {
        &self.tls
    }

    pub fn flows(&self) -> &Arc<FlowAggregator> {
        &self.flows
    }

    pub fn issuer(&self) -> &Arc<CapabilityTokenIssuer> {
        &self.issuer
    }

    // Management

    /// Mint a `HUB` token for a new hub account. Requires the register token.
    pub async fn issue_hub_token(
        &self,
        bearer: Option<&str>,
        _request: Noop,
    ) -> ControlResult<TokenResponse> {
        check_secret(&self.register_secret, bearer)?;

        let account = Account::new(StableId::new(), self.config.hub_namespace.clone());
        let token = self
            .issuer
            .issue(&self.grant, &account, &[Capability::Hub])
            .await?;

        info!(account_id = %account.account_id, "Issued hub token");
        self.activity("issue-hub-token", Some(&account.account_id.to_string()), "")
            .await;
        Ok(TokenResponse { token })
    }

    /// Mint a `MANAGE` token for a namespace. Requires the ops token.
    pub async fn get_management_token(
        &self,
        bearer: Option<&str>,
        request: ManagementTokenRequest,
    ) -> ControlResult<TokenResponse> {
        check_secret(&self.ops_secret, bearer)?;

        let account = Account::new(StableId::new(), request.namespace);
        let token = self
            .issuer
            .issue(&self.grant, &account, &[Capability::Manage])
            .await?;

        info!(namespace = %account.namespace, "Issued management token");
        self.activity("issue-management-token", None, &account.namespace)
            .await;
        Ok(TokenResponse { token })
    }

    /// Mint a token for an account inside the caller's namespace
    pub async fn create_token(
        &self,
        bearer: Option<&str>,
        request: CreateTokenRequest,
    ) -> ControlResult<TokenResponse> {
        let caller = self.authorize(bearer, Capability::Manage).await?;

        if !namespace_contains(&caller.account.namespace, &request.account.namespace) {
            return Err(ControlError::PermissionDenied(format!(
                "namespace {} is outside {}",
                request.account.namespace, caller.account.namespace
            )));
        }
        if request.capabilities.contains(&Capability::Hub) {
            return Err(ControlError::PermissionDenied(
                "HUB capability cannot be delegated".to_string(),
            ));
        }

        let token = self
            .issuer
            .issue(&self.grant, &request.account, &request.capabilities)
            .await?;

        debug!(
            account_id = %request.account.account_id,
            namespace = %request.account.namespace,
            capabilities = ?request.capabilities,
            "Created token"
        );
        self.activity(
            "create-token",
            Some(&request.account.account_id.to_string()),
            &request.account.namespace,
        )
        .await;
        Ok(TokenResponse { token })
    }

    /// Revoke a token inside the caller's namespace; unknown tokens are fine
    pub async fn revoke_token(
        &self,
        bearer: Option<&str>,
        request: RevokeTokenRequest,
    ) -> ControlResult<Noop> {
        let caller = self.authorize(bearer, Capability::Manage).await?;

        let target = match self.issuer.verify(&request.token).await {
            Ok(target) => target,
            Err(TokenError::NotFound | TokenError::Revoked) => return Ok(Noop {}),
            Err(e) => return Err(e.into()),
        };
        if !namespace_contains(&caller.account.namespace, &target.account.namespace) {
            return Err(ControlError::PermissionDenied(format!(
                "token belongs to {}",
                target.account.namespace
            )));
        }

        self.issuer.revoke(&request.token).await?;
        self.activity(
            "revoke-token",
            Some(&target.account.account_id.to_string()),
            &target.jti,
        )
        .await;
        Ok(Noop {})
    }

    // Services

    /// Current hub TLS material and serving configuration
    pub async fn fetch_config(
        &self,
        bearer: Option<&str>,
        request: ConfigRequest,
    ) -> ControlResult<ConfigResponse> {
        self.authorize(bearer, Capability::Hub).await?;

        let material = self
            .tls
            .current()
            .ok_or_else(|| ControlError::Unavailable("no TLS material installed".to_string()))?;

        if request.known_tls_version == Some(material.source_version) {
            debug!(hub_id = %request.stable_id, "Hub already holds current TLS material");
        }

        Ok(ConfigResponse {
            domain: self.tls.hub_domain().to_string(),
            tls_version: material.source_version,
            tls_cert_pem: material.certificate_chain.clone(),
            tls_key_pem: material.private_key.clone(),
            tls_not_after: material.not_after,
            service_namespace: self.config.service_namespace.clone(),
        })
    }

    pub async fn hub_register(
        &self,
        bearer: Option<&str>,
        request: HubRegisterRequest,
    ) -> ControlResult<Noop> {
        let caller = self.authorize(bearer, Capability::Hub).await?;

        if request.name.trim().is_empty() {
            return Err(ControlError::InvalidArgument("hub name is empty".to_string()));
        }

        let hub = self
            .hubs
            .register(&request, caller.account.account_id, self.clock.now())
            .await?;
        info!(
            hub_id = %hub.stable_id,
            name = %hub.name,
            labels = %hub.labels,
            "Hub connected"
        );
        self.activity("hub-register", Some(&hub.stable_id.to_string()), &hub.name)
            .await;
        Ok(Noop {})
    }

    pub async fn hub_disconnect(
        &self,
        bearer: Option<&str>,
        request: HubDisconnectRequest,
    ) -> ControlResult<Noop> {
        let caller = self.authorize(bearer, Capability::Hub).await?;

        if !self
            .hubs
            .disconnect(request.stable_id, caller.account.account_id, self.clock.now())
            .await?
        {
            return Err(ControlError::NotFound(format!(
                "hub {} is not registered",
                request.stable_id
            )));
        }
        self.flows.forget(request.stable_id);

        info!(hub_id = %request.stable_id, "Hub disconnected");
        self.activity("hub-disconnect", Some(&request.stable_id.to_string()), "")
            .await;
        Ok(Noop {})
    }

    /// Exchange the hub's credential for an `ACCESS`+`CONNECT` token in a
    /// namespace
    pub async fn request_service_token(
        &self,
        bearer: Option<&str>,
        request: ServiceTokenRequest,
    ) -> ControlResult<TokenResponse> {
        let caller = self.authorize(bearer, Capability::Hub).await?;

        let namespace = if request.namespace.is_empty() {
            self.config.service_namespace.clone()
        } else {
            request.namespace
        };
        if !is_valid_namespace(&namespace) {
            return Err(ControlError::InvalidArgument(format!(
                "invalid namespace: {}",
                namespace
            )));
        }

        let account = Account::new(caller.account.account_id, namespace);
        let token = self
            .issuer
            .issue(
                &self.grant,
                &account,
                &[Capability::Access, Capability::Connect],
            )
            .await?;

        debug!(
            account_id = %account.account_id,
            namespace = %account.namespace,
            "Issued service token"
        );
        Ok(TokenResponse { token })
    }

    /// Resolve a token presented to a hub by one of its clients
    pub async fn verify_token(
        &self,
        bearer: Option<&str>,
        request: VerifyTokenRequest,
    ) -> ControlResult<VerifyTokenResponse> {
        self.authorize(bearer, Capability::Hub).await?;

        let verified = self.issuer.verify(&request.token).await?;
        Ok(VerifyTokenResponse {
            account: verified.account,
            capabilities: verified.capabilities,
        })
    }

    /// Any valid token may list hubs
    pub async fn all_hubs(
        &self,
        bearer: Option<&str>,
        _request: Noop,
    ) -> ControlResult<ListHubsResponse> {
        self.authenticate(bearer).await?;
        Ok(ListHubsResponse {
            hubs: self.hubs.list().await?,
        })
    }

    // Flow reporting

    pub async fn current_flow_top(
        &self,
        bearer: Option<&str>,
        report: FlowTopReport,
    ) -> ControlResult<Noop> {
        self.authorize(bearer, Capability::Hub).await?;
        debug!(
            hub_id = %report.hub_id,
            flows = report.records.len(),
            "Flow report received"
        );
        self.flows.record(report, self.clock.now());
        Ok(Noop {})
    }

    async fn authenticate(&self, bearer: Option<&str>) -> ControlResult<VerifiedToken> {
        let token = bearer
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ControlError::Unauthenticated("missing bearer token".to_string()))?;

        match self.issuer.verify(token).await {
            Ok(verified) => Ok(verified),
            Err(e @ (TokenError::NotFound | TokenError::Revoked)) => {
                Err(ControlError::Unauthenticated(e.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn authorize(
        &self,
        bearer: Option<&str>,
        capability: Capability,
    ) -> ControlResult<VerifiedToken> {
        let verified = self.authenticate(bearer).await?;
        if !verified.has(capability) {
            return Err(ControlError::PermissionDenied(format!(
                "token lacks {} capability",
                capability
            )));
        }
        Ok(verified)
    }

    async fn activity(&self, kind: &str, subject: Option<&str>, detail: &str) {
        if let Err(e) =
            record_activity(self.hubs.db(), self.clock.now(), kind, subject, detail).await
        {
            warn!(kind, error = %e, "Failed to record activity");
        }
    }
}

fn check_secret(secret: &BootstrapSecret, bearer: Option<&str>) -> ControlResult<()> {
    match bearer {
        Some(presented) if secret.matches(presented) => Ok(()),
        Some(_) => Err(ControlError::Unauthenticated("invalid credential".to_string())),
        None => Err(ControlError::Unauthenticated("missing credential".to_string())),
    }
}
