//! `meridian control`

use anyhow::{Context, Result};
use clap::Args;
use meridian_auth::{CapabilityTokenIssuer, DbTokenStore, IssuerConfig};
use meridian_cert::{
    check_job_lease, register_renewal_job, AcmeAuthority, AcmeConfig, CertManagerConfig,
    CertificateLifecycleManager, HttpDnsProvider,
};
use meridian_control::{
    register_activity_cleanup, run_tls_refresh, ControlConfig, ControlServer, ControlService,
    ControlState, FlowAggregator, HubRegistry, HubTls, ServerConfig,
};
use meridian_jobs::{DbJobStore, HandlerRegistry, Worker, WorkerConfig};
use meridian_store::{system_clock, DbLeaseStore, DbSecretStore, Leases, SecretStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Activity rows older than this are purged hourly
pub const ACTIVITY_RETENTION: Duration = Duration::from_secs(30 * 24 * 3600);

#[derive(Args, Debug)]
pub struct ControlArgs {
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Secret-store prefix for signing keys, ACME account and certificates
    #[arg(long, env = "S3_BUCKET")]
    pub s3_bucket: String,

    /// Domain hubs serve under; `*.example.com` is issued as a wildcard
    #[arg(long, env = "HUB_DOMAIN")]
    pub hub_domain: String,

    /// Shared secret accepted by IssueHubToken
    #[arg(long, env = "REGISTER_TOKEN")]
    pub register_token: String,

    /// Operator secret accepted by GetManagementToken
    #[arg(long, env = "OPS_TOKEN")]
    pub ops_token: String,

    /// DNS zone holding the ACME challenge records
    #[arg(long, env = "ZONE_ID")]
    pub zone_id: String,

    /// Scope of the renewal leases
    #[arg(long, env = "LOCK_TABLE")]
    pub lock_table: String,

    #[arg(long, env = "PORT")]
    pub port: u16,

    #[arg(long, env = "LETSENCRYPT_STAGING")]
    pub letsencrypt_staging: bool,

    /// ACME directory, overriding Let's Encrypt
    #[arg(long, env = "ACME_DIRECTORY_URL")]
    pub acme_directory_url: Option<String>,

    #[arg(long, env = "ACME_CONTACT", value_delimiter = ',')]
    pub acme_contact: Vec<String>,

    /// DNS management endpoint for challenge records
    #[arg(long, env = "DNS_API_URL")]
    pub dns_api_url: String,

    #[arg(long, env = "WORKER_QUEUES", value_delimiter = ',', default_value = "default")]
    pub worker_queues: Vec<String>,

    /// Job claim lease; must exceed the renewal lease plus challenge timeout
    #[arg(long, env = "JOB_LEASE_SECS", default_value = "900")]
    pub job_lease_secs: u64,

    #[arg(long, env = "RENEW_LEASE_SECS", default_value = "600")]
    pub renew_lease_secs: u64,

    #[arg(long, env = "CHALLENGE_TIMEOUT_SECS", default_value = "180")]
    pub challenge_timeout_secs: u64,

    #[arg(long, env = "TLS_REFRESH_SECS", default_value = "3600")]
    pub tls_refresh_secs: u64,

    /// Period of the certificate renewal check
    #[arg(long, env = "RENEW_INTERVAL_SECS", default_value = "43200")]
    pub renew_interval_secs: u64,
}

pub async fn run(
    args: ControlArgs,
    shutdown: CancellationToken,
    force: CancellationToken,
) -> Result<()> {
    let cert_config = CertManagerConfig {
        vault_path: args.s3_bucket.clone(),
        dns_zone_id: args.zone_id.clone(),
        lock_scope: args.lock_table.clone(),
        challenge_timeout: Duration::from_secs(args.challenge_timeout_secs),
        renew_lease: Duration::from_secs(args.renew_lease_secs),
        ..Default::default()
    };
    let job_lease = Duration::from_secs(args.job_lease_secs);
    check_job_lease(job_lease, &cert_config)?;

    let db = meridian_store::connect(&args.database_url)
        .await
        .context("Failed to connect to database")?;
    meridian_store::migrate(&db)
        .await
        .context("Failed to run migrations")?;

    let clock = system_clock();
    let secrets: Arc<dyn SecretStore> = Arc::new(DbSecretStore::new(db.clone(), clock.clone()));

    let issuer = CapabilityTokenIssuer::load(
        &IssuerConfig {
            vault_path: args.s3_bucket.clone(),
            ..Default::default()
        },
        &args.ops_token,
        secrets.as_ref(),
        Arc::new(DbTokenStore::new(db.clone())),
        clock.clone(),
    )
    .await
    .context("Failed to load signing key")?;

    let mut acme = AcmeConfig::lets_encrypt(
        args.letsencrypt_staging,
        format!("{}/acme-account", args.s3_bucket),
    );
    if let Some(url) = &args.acme_directory_url {
        acme.directory_url = url.clone();
    }
    acme.contact = args.acme_contact.clone();

    let manager = Arc::new(CertificateLifecycleManager::new(
        cert_config,
        Arc::new(AcmeAuthority::new(acme, secrets.clone())),
        Arc::new(HttpDnsProvider::new(&args.dns_api_url)?),
        secrets,
        Leases::new(Arc::new(DbLeaseStore::new(db.clone())), clock.clone()),
    ));

    info!(domain = %args.hub_domain, "Obtaining hub certificate");
    let material = manager
        .obtain(&args.hub_domain)
        .await
        .context("Failed to obtain hub certificate")?;
    let tls = Arc::new(HubTls::new(args.hub_domain.clone(), clock.clone()));
    tls.set_hub_tls(material)?;

    let mut registry = HandlerRegistry::new();
    register_renewal_job(
        &mut registry,
        manager.clone(),
        &args.hub_domain,
        "default",
        Duration::from_secs(args.renew_interval_secs),
    )?;
    register_activity_cleanup(
        &mut registry,
        db.clone(),
        clock.clone(),
        ACTIVITY_RETENTION,
        "default",
    )?;

    let worker = Worker::new(
        WorkerConfig {
            queues: args.worker_queues.clone(),
            lease_duration: job_lease,
            ..Default::default()
        },
        Arc::new(registry),
        Arc::new(DbJobStore::new(db.clone())),
        clock.clone(),
    );

    let service = ControlService::new(
        ControlConfig::default(),
        Arc::new(issuer),
        &args.register_token,
        &args.ops_token,
        HubRegistry::new(db),
        tls.clone(),
        Arc::new(FlowAggregator::new()),
        clock.clone(),
    )?;
    let state = ControlState::new(service)?
        .with_cert_stats(manager.stats())
        .with_worker_stats(worker.stats());

    let server_config = ServerConfig {
        tls: Some(tls.server_config()?),
        ..Default::default()
    };
    let listener = TcpListener::bind(("0.0.0.0", args.port))
        .await
        .with_context(|| format!("Failed to bind port {}", args.port))?;

    let background = CancellationToken::new();
    let tasks = spawn_background(
        worker,
        manager,
        tls,
        Duration::from_secs(args.tls_refresh_secs),
        background.clone(),
    );

    let result = ControlServer::new(server_config, Arc::new(state))
        .serve(listener, shutdown, force)
        .await;

    background.cancel();
    join_background(tasks).await;
    result?;
    Ok(())
}

/// Job worker plus the TLS refresh loop, both stopped by `cancel`
pub fn spawn_background(
    worker: Worker,
    manager: Arc<CertificateLifecycleManager>,
    tls: Arc<HubTls>,
    refresh_interval: Duration,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let worker_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = worker.run(cancel).await {
                error!(error = %e, "Job worker stopped");
            }
        })
    };
    let refresh_task = tokio::spawn(run_tls_refresh(manager, tls, refresh_interval, cancel));
    vec![worker_task, refresh_task]
}

pub async fn join_background(tasks: Vec<JoinHandle<()>>) {
    for task in tasks {
        if let Err(e) = task.await {
            error!(error = %e, "Background task panicked");
        }
    }
}
