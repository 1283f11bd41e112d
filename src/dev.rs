//! `meridian dev`: Coordinator and hub in one process

use crate::control::{join_background, spawn_background, ACTIVITY_RETENTION};
use anyhow::{Context, Result};
use chrono::Utc;
use clap::Args;
use meridian_agent::{
    serve_hub, Agent, AgentConfig, ClientConfig, ConfigCache, ControlClient, HubPorts,
};
use meridian_auth::{CapabilityTokenIssuer, DbTokenStore, IssuerConfig};
use meridian_cert::{
    register_renewal_job, CertManagerConfig, CertificateLifecycleManager, MemoryDns,
    SelfSignedAuthority,
};
use meridian_control::{
    register_activity_cleanup, ControlConfig, ControlServer, ControlService, ControlState,
    FlowAggregator, HubRegistry, HubTls, ServerConfig,
};
use meridian_jobs::{DbJobStore, HandlerRegistry, Worker, WorkerConfig};
use meridian_proto::{
    Account, Capability, CreateTokenRequest, DiscoveryDocument, HubInfo, LabelSet, Location,
    ManagementTokenRequest, Noop, StableId,
};
use meridian_store::{system_clock, DbSecretStore, Leases, MemoryLeaseStore, SecretStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

const DEV_HUB_ID: &str = "01ECNJBS294ESNMG913SVX893F";
const DEV_HUB_ADDR: &str = "127.0.0.1:24403";
const DEV_JOB_LEASE_MARGIN: Duration = Duration::from_secs(120);

#[derive(Args, Debug)]
pub struct DevArgs {
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite::memory:")]
    pub database_url: String,

    #[arg(long, env = "HUB_DOMAIN", default_value = "*.meridian.localhost")]
    pub hub_domain: String,

    #[arg(long, env = "REGISTER_TOKEN", default_value = "aabbcc")]
    pub register_token: String,

    #[arg(long, env = "OPS_TOKEN", default_value = "dev-ops-token")]
    pub ops_token: String,

    /// Coordinator port, cleartext HTTP/2 and HTTP/1.1
    #[arg(long, env = "PORT", default_value = "24400")]
    pub port: u16,

    #[arg(long, env = "HEALTHZ_PORT", default_value = "17001")]
    pub healthz_port: u16,

    #[arg(long, env = "WEB_NAMESPACE", default_value = "/waypoint")]
    pub web_namespace: String,

    /// Where the dev token files are written
    #[arg(long, env = "DEV_OUT_DIR", default_value = ".")]
    pub out_dir: PathBuf,
}

pub async fn run(
    args: DevArgs,
    shutdown: CancellationToken,
    force: CancellationToken,
) -> Result<()> {
    let db = meridian_store::connect(&args.database_url)
        .await
        .context("Failed to connect to database")?;
    meridian_store::migrate(&db).await?;

    let clock = system_clock();
    let secrets: Arc<dyn SecretStore> = Arc::new(DbSecretStore::new(db.clone(), clock.clone()));
    let issuer = CapabilityTokenIssuer::load(
        &IssuerConfig::default(),
        &args.ops_token,
        secrets.as_ref(),
        Arc::new(DbTokenStore::new(db.clone())),
        clock.clone(),
    )
    .await?;

    let cert_config = CertManagerConfig::default();
    let job_lease = cert_config.renewal_budget() + DEV_JOB_LEASE_MARGIN;
    let manager = Arc::new(CertificateLifecycleManager::new(
        cert_config,
        Arc::new(SelfSignedAuthority::new(clock.clone())),
        Arc::new(MemoryDns::new()),
        secrets,
        Leases::new(Arc::new(MemoryLeaseStore::new()), clock.clone()),
    ));
    let material = manager.obtain(&args.hub_domain).await?;
    let tls = Arc::new(HubTls::new(args.hub_domain.clone(), clock.clone()));
    tls.set_hub_tls(material)?;

    let mut registry = HandlerRegistry::new();
    register_renewal_job(
        &mut registry,
        manager.clone(),
        &args.hub_domain,
        "default",
        Duration::from_secs(3600),
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
            lease_duration: job_lease,
            ..Default::default()
        },
        Arc::new(registry),
        Arc::new(DbJobStore::new(db.clone())),
        clock.clone(),
    );

    let service = ControlService::new(
        ControlConfig {
            service_namespace: args.web_namespace.clone(),
            ..Default::default()
        },
        Arc::new(issuer),
        &args.register_token,
        &args.ops_token,
        HubRegistry::new(db),
        tls.clone(),
        Arc::new(FlowAggregator::new()),
        clock.clone(),
    )?;

    let hub_id: StableId = DEV_HUB_ID.parse()?;
    let hub_token = service
        .issue_hub_token(Some(args.register_token.as_str()), Noop {})
        .await?
        .token;
    let tokens = dev_tokens(&service, &args).await?;
    tokens.write(&args.out_dir).await?;

    let state = ControlState::new(service)?
        .with_cert_stats(manager.stats())
        .with_worker_stats(worker.stats())
        .with_static_discovery(static_discovery(hub_id));

    let listener = TcpListener::bind(("127.0.0.1", args.port))
        .await
        .with_context(|| format!("Failed to bind port {}", args.port))?;
    let control_addr = listener.local_addr()?;

    let background = CancellationToken::new();
    let tasks = spawn_background(
        worker,
        manager,
        tls,
        Duration::from_secs(3600),
        background.clone(),
    );

    let server = {
        let shutdown = shutdown.clone();
        let force = force.clone();
        tokio::spawn(async move {
            ControlServer::new(ServerConfig::default(), Arc::new(state))
                .serve(listener, shutdown, force)
                .await
        })
    };
    info!(addr = %control_addr, "Dev coordinator listening (h2c)");

    let mut client = ClientConfig::new(control_addr.to_string(), hub_token);
    client.insecure = true;
    let mut config = AgentConfig::new(hub_id, "dev-hub");
    config.labels = LabelSet::from_pairs([("env", "dev")]);
    let agent = Arc::new(Agent::new(
        config,
        ControlClient::new(client)?,
        ConfigCache::disabled(),
    ));
    agent.set_locations(dev_locations());

    let (host, port) = DEV_HUB_ADDR
        .rsplit_once(':')
        .context("malformed dev hub address")?;
    let hub_result = serve_hub(
        agent,
        HubPorts {
            bind_host: host.to_string(),
            port: port.parse()?,
            http_port: None,
            healthz_port: args.healthz_port,
        },
        &args.web_namespace,
        shutdown.clone(),
        force,
    )
    .await;

    // The hub deregisters before the coordinator goes away
    shutdown.cancel();
    let server_result = server.await?;
    background.cancel();
    join_background(tasks).await;

    hub_result?;
    server_result?;
    Ok(())
}

struct DevTokens {
    management: String,
    agent_id: StableId,
    agent: String,
}

impl DevTokens {
    async fn write(&self, dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(dir).await?;
        for (name, contents) in [
            ("dev-mgmt-token.txt", self.management.clone()),
            ("dev-agent-id.txt", self.agent_id.to_string()),
            ("dev-agent-token.txt", self.agent.clone()),
        ] {
            let path = dir.join(name);
            tokio::fs::write(&path, format!("{}\n", contents))
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!(path = %path.display(), "Wrote dev credential");
        }
        Ok(())
    }
}

/// Management token for the web namespace and a `SERVE` token for a fresh
/// account inside it
async fn dev_tokens(service: &ControlService, args: &DevArgs) -> Result<DevTokens> {
    let management = service
        .get_management_token(
            Some(args.ops_token.as_str()),
            ManagementTokenRequest {
                namespace: args.web_namespace.clone(),
            },
        )
        .await?
        .token;

    let agent_id = StableId::new();
    let agent = service
        .create_token(
            Some(management.as_str()),
            CreateTokenRequest {
                account: Account::new(agent_id, args.web_namespace.clone()),
                capabilities: vec![Capability::Serve],
            },
        )
        .await?
        .token;

    Ok(DevTokens {
        management,
        agent_id,
        agent,
    })
}

fn dev_locations() -> Vec<Location> {
    vec![Location {
        labels: LabelSet::from_pairs([("type", "public")]),
        addresses: vec![DEV_HUB_ADDR.to_string()],
    }]
}

fn static_discovery(hub_id: StableId) -> DiscoveryDocument {
    let hub = HubInfo {
        stable_id: hub_id,
        name: "dev-hub".to_string(),
        labels: LabelSet::from_pairs([("env", "dev")]),
        locations: dev_locations(),
        connected: true,
        last_seen: Utc::now(),
    };
    DiscoveryDocument::from_hubs([&hub])
}
