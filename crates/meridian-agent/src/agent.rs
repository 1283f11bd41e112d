//! Hub-side lifecycle against the Coordinator
//!
//! learn locations → bootstrap configuration → service token → run loop,
//! with [`Agent::close`] releasing the registration on the way out.

use crate::backoff::{retry, sleep_or_cancel, Backoff};
use crate::cache::ConfigCache;
use crate::client::ControlClient;
use crate::error::{AgentError, AgentResult};
use crate::flows::FlowTracker;
use crate::locations::{learn_locations, LocationConfig};
use chrono::Utc;
use meridian_cert::{CertificateMaterial, HotSwapResolver};
use meridian_proto::{
    methods, ConfigRequest, ConfigResponse, FlowTopReport, HubDisconnectRequest,
    HubRegisterRequest, LabelSet, Location, Noop, ServiceTokenRequest, StableId, TokenResponse,
    VerifyTokenRequest, VerifyTokenResponse,
};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub stable_id: StableId,
    pub name: String,
    /// Labels describing the hub itself
    pub labels: LabelSet,
    pub locations: LocationConfig,
    /// How often the run loop re-pulls configuration
    pub sync_interval: Duration,
    /// Bound on deregistration during shutdown
    pub close_timeout: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl AgentConfig {
    pub fn new(stable_id: StableId, name: impl Into<String>) -> Self {
        Self {
            stable_id,
            name: name.into(),
            labels: LabelSet::new(),
            locations: LocationConfig::default(),
            sync_interval: Duration::from_secs(3600),
            close_timeout: Duration::from_secs(10),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Default)]
pub struct AgentStats {
    pub syncs: AtomicU64,
    pub sync_failures: AtomicU64,
    pub tls_updates: AtomicU64,
    pub tls_version: AtomicI64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AgentStatsSnapshot {
    pub syncs: u64,
    pub sync_failures: u64,
    pub tls_updates: u64,
    pub tls_version: i64,
    pub registered: bool,
}

pub struct Agent {
    config: AgentConfig,
    client: ControlClient,
    cache: ConfigCache,
    resolver: Arc<HotSwapResolver>,
    flows: Arc<FlowTracker>,
    locations: RwLock<Vec<Location>>,
    current: RwLock<Option<ConfigResponse>>,
    registered: AtomicBool,
    stats: AgentStats,
}

impl Agent {
    pub fn new(config: AgentConfig, client: ControlClient, cache: ConfigCache) -> Self {
        Self {
            config,
            client,
            cache,
            resolver: Arc::new(HotSwapResolver::new()),
            flows: Arc::new(FlowTracker::new()),
            locations: RwLock::new(Vec::new()),
            current: RwLock::new(None),
            registered: AtomicBool::new(false),
            stats: AgentStats::default(),
        }
    }

    pub fn stable_id(&self) -> StableId {
        self.config.stable_id
    }

    /// Serving certificate, kept in step with the Coordinator
    pub fn resolver(&self) -> Arc<HotSwapResolver> {
        self.resolver.clone()
    }

    pub fn flows(&self) -> Arc<FlowTracker> {
        self.flows.clone()
    }

    pub fn current_config(&self) -> Option<ConfigResponse> {
        read(&self.current).clone()
    }

    pub fn locations(&self) -> Vec<Location> {
        read(&self.locations).clone()
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> AgentStatsSnapshot {
        AgentStatsSnapshot {
            syncs: self.stats.syncs.load(Ordering::Relaxed),
            sync_failures: self.stats.sync_failures.load(Ordering::Relaxed),
            tls_updates: self.stats.tls_updates.load(Ordering::Relaxed),
            tls_version: self.stats.tls_version.load(Ordering::Relaxed),
            registered: self.is_registered(),
        }
    }

    /// Resolve the addresses this hub is reachable on
    pub fn learn_locations(&self) -> AgentResult<Vec<Location>> {
        let locations = learn_locations(&self.config.locations)?;
        self.set_locations(locations.clone());
        Ok(locations)
    }

    /// Advertise a fixed set of locations instead of probing
    pub fn set_locations(&self, locations: Vec<Location>) {
        for loc in &locations {
            info!(
                labels = %loc.labels,
                addresses = ?loc.addresses,
                "Learned network location"
            );
        }
        *write(&self.locations) = locations;
    }

    /// Pull the initial configuration and register.
    ///
    /// When the Coordinator cannot be reached and a cached configuration is
    /// usable, the cache is served and registration is left to the run loop.
    pub async fn bootstrap_config(
        &self,
        cancel: &CancellationToken,
    ) -> AgentResult<ConfigResponse> {
        let fetched = match self.fetch_config().await {
            Ok(config) => config,
            Err(e) if e.is_transient() => {
                if let Some(cached) = self.cache.load().await {
                    match self.apply_config(cached.clone(), false).await {
                        Ok(_) => {
                            warn!(
                                error = %e,
                                version = cached.tls_version,
                                "Coordinator unreachable, serving cached configuration"
                            );
                            return Ok(cached);
                        }
                        Err(cache_err) => {
                            warn!(error = %cache_err, "Cached configuration unusable");
                        }
                    }
                }
                retry("fetch config", self.backoff(), cancel, || self.fetch_config()).await?
            }
            Err(e) => return Err(e),
        };

        self.apply_config(fetched.clone(), true).await?;
        retry("register hub", self.backoff(), cancel, || self.register()).await?;
        Ok(fetched)
    }

    /// Exchange the hub credential for a token scoped to `namespace`
    pub async fn request_service_token(
        &self,
        cancel: &CancellationToken,
        namespace: &str,
    ) -> AgentResult<String> {
        let request = ServiceTokenRequest {
            namespace: namespace.to_string(),
        };
        let response: TokenResponse = retry("request service token", self.backoff(), cancel, || {
            self.client.call(methods::REQUEST_SERVICE_TOKEN, &request)
        })
        .await?;
        info!(namespace, "Obtained service token");
        Ok(response.token)
    }

    /// Resolve a token presented by a client of this hub
    pub async fn verify_token(&self, token: &str) -> AgentResult<VerifyTokenResponse> {
        self.client
            .call(
                methods::VERIFY_TOKEN,
                &VerifyTokenRequest {
                    token: token.to_string(),
                },
            )
            .await
    }

    /// Re-sync until cancelled. Transient failures keep the last good
    /// configuration and retry sooner; a rejected credential ends the loop.
    pub async fn run(&self, cancel: CancellationToken) -> AgentResult<()> {
        let mut backoff = self.backoff();
        let mut delay = self.config.sync_interval;

        loop {
            if sleep_or_cancel(delay, &cancel).await.is_err() {
                debug!("Agent run loop stopped");
                return Ok(());
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                result = self.sync_once() => result,
            };

            match result {
                Ok(_) => {
                    backoff.reset();
                    delay = self.config.sync_interval;
                }
                Err(e) if e.is_transient() => {
                    self.stats.sync_failures.fetch_add(1, Ordering::Relaxed);
                    delay = backoff.next_delay().min(self.config.sync_interval);
                    warn!(
                        error = %e,
                        retry_in = ?delay,
                        "Sync failed, keeping last-known-good configuration"
                    );
                }
                Err(e) => {
                    self.stats.sync_failures.fetch_add(1, Ordering::Relaxed);
                    error!(error = %e, "Sync rejected by coordinator");
                    return Err(e);
                }
            }
        }
    }

    /// One pass of the run loop: configuration, registration, flow report.
    /// Returns whether new TLS material was installed.
    pub async fn sync_once(&self) -> AgentResult<bool> {
        let config = self.fetch_config().await?;
        let changed = self.apply_config(config, true).await?;
        self.register().await?;
        self.report_flows().await?;
        self.stats.syncs.fetch_add(1, Ordering::Relaxed);
        Ok(changed)
    }

    /// Deregister. Runs under its own deadline and only `abort` can cut it
    /// short, so an already-cancelled run loop does not prevent it.
    pub async fn close(&self, abort: &CancellationToken) -> AgentResult<()> {
        if !self.registered.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let timeout = self.config.close_timeout;
        let request = HubDisconnectRequest {
            stable_id: self.config.stable_id,
        };
        let disconnect = tokio::time::timeout(
            timeout,
            self.client.call::<_, Noop>(methods::HUB_DISCONNECT, &request),
        );

        tokio::select! {
            _ = abort.cancelled() => {
                warn!("Deregistration aborted");
                Err(AgentError::Cancelled)
            }
            result = disconnect => match result {
                Ok(Ok(_)) => {
                    info!(hub_id = %self.config.stable_id, "Deregistered from coordinator");
                    Ok(())
                }
                Ok(Err(e)) => Err(e),
                Err(_) => Err(AgentError::Timeout(timeout)),
            },
        }
    }

    async fn fetch_config(&self) -> AgentResult<ConfigResponse> {
        let known = read(&self.current).as_ref().map(|c| c.tls_version);
        self.client
            .call(
                methods::FETCH_CONFIG,
                &ConfigRequest {
                    stable_id: self.config.stable_id,
                    known_tls_version: known,
                },
            )
            .await
    }

    async fn register(&self) -> AgentResult<()> {
        let request = HubRegisterRequest {
            stable_id: self.config.stable_id,
            name: self.config.name.clone(),
            labels: self.config.labels.clone(),
            locations: self.locations(),
        };
        let _: Noop = self.client.call(methods::HUB_REGISTER, &request).await?;
        if !self.registered.swap(true, Ordering::SeqCst) {
            info!(hub_id = %self.config.stable_id, "Registered with coordinator");
        }
        Ok(())
    }

    /// Send flow counters accumulated since the last report. Counters of a
    /// report that fails stay in the tracker for the next one.
    pub async fn report_flows(&self) -> AgentResult<()> {
        let records = self.flows.drain();
        if records.is_empty() {
            return Ok(());
        }
        let report = FlowTopReport {
            hub_id: self.config.stable_id,
            records,
        };
        match self
            .client
            .call::<_, Noop>(methods::CURRENT_FLOW_TOP, &report)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                self.flows.restore(report.records);
                Err(e)
            }
        }
    }

    /// Install the TLS material in `config` when its version differs from
    /// what is served. Returns whether material was installed.
    async fn apply_config(&self, config: ConfigResponse, persist: bool) -> AgentResult<bool> {
        let served = self.resolver.current().map(|m| m.source_version);
        let changed = served != Some(config.tls_version);

        if changed {
            let material = CertificateMaterial::from_pem(
                &config.domain,
                config.tls_cert_pem.clone(),
                config.tls_key_pem.clone(),
                config.tls_version,
            )?;
            if material.is_expired(Utc::now()) {
                return Err(AgentError::InvalidConfig(format!(
                    "TLS material version {} expired at {}",
                    config.tls_version, material.not_after
                )));
            }
            self.resolver.install(Arc::new(material))?;
            self.stats.tls_updates.fetch_add(1, Ordering::Relaxed);
            self.stats
                .tls_version
                .store(config.tls_version, Ordering::Relaxed);
            info!(
                domain = %config.domain,
                version = config.tls_version,
                not_after = %config.tls_not_after,
                "Installed TLS material"
            );
        }

        if persist {
            if let Err(e) = self.cache.store(&config).await {
                warn!(error = %e, "Failed to store config cache");
            }
        }
        *write(&self.current) = Some(config);
        Ok(changed)
    }

    fn backoff(&self) -> Backoff {
        Backoff::new(self.config.backoff_initial, self.config.backoff_max)
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Hub name when none is configured: the machine's host name
pub fn default_hub_name() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "hub".to_string())
}
