//! `meridian hub`

use anyhow::{Context, Result};
use clap::Args;
use meridian_agent::{
    default_hub_name, serve_hub, Agent, AgentConfig, ClientConfig, ConfigCache, ControlClient,
    HubPorts, LocationConfig,
};
use meridian_proto::{LabelSet, StableId};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Args, Debug)]
pub struct HubArgs {
    /// Hub credential issued by IssueHubToken
    #[arg(long, env = "TOKEN")]
    pub token: String,

    /// Coordinator address as `host:port`
    #[arg(long, env = "CONTROL_ADDR")]
    pub control_addr: String,

    #[arg(long, env = "STABLE_ID")]
    pub stable_id: StableId,

    /// Advertised name, defaults to the host name
    #[arg(long, env = "HUB_NAME")]
    pub name: Option<String>,

    /// Labels describing the hub, `k=v,k=v`
    #[arg(long, env = "HUB_LABELS", default_value = "")]
    pub hub_labels: LabelSet,

    /// Advertise only locations matching these labels, `k=v,k=v`
    #[arg(long, env = "LOCATION_LABELS")]
    pub location_labels: Option<LabelSet>,

    /// Externally reachable addresses, `ip` or `ip:port`
    #[arg(long, env = "PUBLIC_ADDRS", value_delimiter = ',')]
    pub public_addrs: Vec<String>,

    #[arg(long, env = "PORT", default_value = "443")]
    pub port: u16,

    /// Plain HTTP port redirecting to HTTPS
    #[arg(long, env = "HTTP_PORT")]
    pub http_port: Option<u16>,

    #[arg(long, env = "HEALTHZ_PORT", default_value = "17001")]
    pub healthz_port: u16,

    /// Namespace the hub's service token is scoped to
    #[arg(long, env = "WEB_NAMESPACE", default_value = "/waypoint")]
    pub web_namespace: String,

    /// Talk to the Coordinator over cleartext HTTP/2
    #[arg(long, env = "INSECURE")]
    pub insecure: bool,

    #[arg(long, env = "SYNC_INTERVAL_SECS", default_value = "3600")]
    pub sync_interval_secs: u64,

    /// Last-known-good configuration, used when the Coordinator is unreachable
    #[arg(long, env = "CONFIG_CACHE")]
    pub config_cache: Option<String>,
}

pub async fn run(
    args: HubArgs,
    shutdown: CancellationToken,
    force: CancellationToken,
) -> Result<()> {
    let mut client = ClientConfig::new(args.control_addr.clone(), args.token.clone());
    client.insecure = args.insecure;
    if args.insecure {
        warn!("Coordinator connection is not encrypted (insecure mode)");
    }

    let mut config = AgentConfig::new(
        args.stable_id,
        args.name.clone().unwrap_or_else(default_hub_name),
    );
    config.labels = args.hub_labels.clone();
    config.locations = LocationConfig {
        port: args.port,
        public_addrs: args.public_addrs.clone(),
        filter: args.location_labels.clone(),
    };
    config.sync_interval = Duration::from_secs(args.sync_interval_secs);

    let cache = match &args.config_cache {
        Some(path) => ConfigCache::new(path),
        None => ConfigCache::disabled(),
    };
    let agent = Arc::new(Agent::new(config, ControlClient::new(client)?, cache));
    agent.learn_locations().context("Failed to learn network locations")?;

    let ports = HubPorts {
        bind_host: "0.0.0.0".to_string(),
        port: args.port,
        http_port: args.http_port,
        healthz_port: args.healthz_port,
    };
    serve_hub(agent, ports, &args.web_namespace, shutdown, force).await
}
