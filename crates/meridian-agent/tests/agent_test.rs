//! Agent lifecycle against an in-process Coordinator over h2c

use chrono::Utc;
use meridian_agent::{
    healthz_router, serve_hub, Agent, AgentConfig, AgentError, ClientConfig, ConfigCache,
    ControlClient, HubPorts,
};
use meridian_auth::{CapabilityTokenIssuer, DbTokenStore, IssuerConfig};
use meridian_cert::generate_self_signed;
use meridian_control::{
    ControlConfig, ControlServer, ControlService, ControlState, FlowAggregator, HubRegistry,
    HubTls, ServerConfig,
};
use meridian_proto::{methods, Capability, Code, LabelSet, Location, Noop, StableId, TokenResponse};
use meridian_store::{system_clock, DbSecretStore};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

const REGISTER_TOKEN: &str = "aabbcc";
const OPS_TOKEN: &str = "ops-secret";
const CERT_DOMAIN: &str = "*.hub.example.com";

struct Coordinator {
    addr: SocketAddr,
    state: Arc<ControlState>,
    shutdown: CancellationToken,
    handle: JoinHandle<meridian_control::ControlResult<()>>,
}

impl Coordinator {
    async fn start() -> Self {
        let db = meridian_store::connect("sqlite::memory:").await.unwrap();
        meridian_store::migrate(&db).await.unwrap();
        let clock = system_clock();

        let secrets = DbSecretStore::new(db.clone(), clock.clone());
        let issuer = CapabilityTokenIssuer::load(
            &IssuerConfig::default(),
            OPS_TOKEN,
            &secrets,
            Arc::new(DbTokenStore::new(db.clone())),
            clock.clone(),
        )
        .await
        .unwrap();

        let tls = Arc::new(HubTls::new(CERT_DOMAIN, clock.clone()));
        let issued =
            generate_self_signed(CERT_DOMAIN, Utc::now(), Duration::from_secs(24 * 3600)).unwrap();
        tls.set_hub_tls_pem(issued.certificate_chain, issued.private_key, CERT_DOMAIN, 1)
            .unwrap();

        let service = ControlService::new(
            ControlConfig::default(),
            Arc::new(issuer),
            REGISTER_TOKEN,
            OPS_TOKEN,
            HubRegistry::new(db),
            tls,
            Arc::new(FlowAggregator::new()),
            clock,
        )
        .unwrap();
        let state = Arc::new(ControlState::new(service).unwrap());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = ControlServer::new(ServerConfig::default(), state.clone());
        let handle = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { server.serve(listener, shutdown.clone(), shutdown).await })
        };

        Self {
            addr,
            state,
            shutdown,
            handle,
        }
    }

    fn client(&self, token: &str) -> ControlClient {
        let mut config = ClientConfig::new(self.addr.to_string(), token);
        config.insecure = true;
        config.connect_timeout = Duration::from_secs(2);
        config.request_timeout = Duration::from_secs(5);
        ControlClient::new(config).unwrap()
    }

    async fn hub_token(&self) -> String {
        let response: TokenResponse = self
            .client(REGISTER_TOKEN)
            .call(methods::ISSUE_HUB_TOKEN, &Noop {})
            .await
            .unwrap();
        response.token
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.handle.await.unwrap().unwrap();
    }
}

fn agent_config(stable_id: StableId) -> AgentConfig {
    let mut config = AgentConfig::new(stable_id, "hub-a");
    config.labels = LabelSet::from_pairs([("region", "test")]);
    config.backoff_initial = Duration::from_millis(10);
    config.backoff_max = Duration::from_millis(50);
    config.close_timeout = Duration::from_secs(2);
    config
}

fn public_location() -> Vec<Location> {
    vec![Location {
        labels: LabelSet::from_pairs([("type", "public")]),
        addresses: vec!["127.0.0.1:443".to_string()],
    }]
}

#[tokio::test]
async fn test_bootstrap_registers_and_installs_tls() {
    let coordinator = Coordinator::start().await;
    let token = coordinator.hub_token().await;
    let stable_id = StableId::new();

    let agent = Agent::new(
        agent_config(stable_id),
        coordinator.client(&token),
        ConfigCache::disabled(),
    );
    agent.set_locations(public_location());

    let cancel = CancellationToken::new();
    let config = agent.bootstrap_config(&cancel).await.unwrap();
    assert_eq!(config.domain, "hub.example.com");
    assert_eq!(config.tls_version, 1);
    assert_eq!(config.service_namespace, "/waypoint");
    assert!(agent.is_registered());
    assert_eq!(agent.resolver().current().unwrap().source_version, 1);

    let hub = coordinator
        .state
        .service
        .hubs()
        .get(stable_id)
        .await
        .unwrap()
        .unwrap();
    assert!(hub.connected);
    assert_eq!(hub.name, "hub-a");
    assert_eq!(hub.labels.get("region"), Some("test"));
    assert_eq!(hub.locations, public_location());

    // Nothing changed, so a sync installs nothing new
    assert!(!agent.sync_once().await.unwrap());
    assert_eq!(agent.stats().tls_updates, 1);
    assert_eq!(agent.stats().syncs, 1);

    coordinator.stop().await;
}

#[tokio::test]
async fn test_service_token_is_accepted_by_verify() {
    let coordinator = Coordinator::start().await;
    let token = coordinator.hub_token().await;
    let agent = Agent::new(
        agent_config(StableId::new()),
        coordinator.client(&token),
        ConfigCache::disabled(),
    );

    let cancel = CancellationToken::new();
    let service_token = agent
        .request_service_token(&cancel, "/waypoint/team-a")
        .await
        .unwrap();

    let verified = agent.verify_token(&service_token).await.unwrap();
    assert_eq!(verified.account.namespace, "/waypoint/team-a");
    assert!(verified.capabilities.contains(&Capability::Access));
    assert!(verified.capabilities.contains(&Capability::Connect));
    assert!(!verified.capabilities.contains(&Capability::Hub));

    match agent.verify_token("not-a-token").await {
        Err(AgentError::Rpc(status)) => assert_eq!(status.code, Code::NotFound),
        other => panic!("expected not found, got {:?}", other.map(|_| ())),
    }

    coordinator.stop().await;
}

#[tokio::test]
async fn test_bad_credential_fails_without_retrying() {
    let coordinator = Coordinator::start().await;
    let agent = Agent::new(
        agent_config(StableId::new()),
        coordinator.client("bogus"),
        ConfigCache::disabled(),
    );

    let cancel = CancellationToken::new();
    let err = tokio::time::timeout(Duration::from_secs(5), agent.bootstrap_config(&cancel))
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err.code(), Some(Code::Unauthenticated));
    assert!(!agent.is_registered());

    coordinator.stop().await;
}

#[tokio::test]
async fn test_close_deregisters_once() {
    let coordinator = Coordinator::start().await;
    let token = coordinator.hub_token().await;
    let stable_id = StableId::new();
    let agent = Agent::new(
        agent_config(stable_id),
        coordinator.client(&token),
        ConfigCache::disabled(),
    );

    let cancel = CancellationToken::new();
    agent.bootstrap_config(&cancel).await.unwrap();

    // The run loop's token is already gone; close has its own scope
    cancel.cancel();
    agent.run(cancel.clone()).await.unwrap();

    let abort = CancellationToken::new();
    agent.close(&abort).await.unwrap();
    assert!(!agent.is_registered());

    let hub = coordinator
        .state
        .service
        .hubs()
        .get(stable_id)
        .await
        .unwrap()
        .unwrap();
    assert!(!hub.connected);

    // Second close has nothing to release
    agent.close(&abort).await.unwrap();

    coordinator.stop().await;
}

#[tokio::test]
async fn test_cached_config_serves_when_coordinator_is_down() {
    let dir = tempfile::tempdir().unwrap();
    let cache_path = dir.path().join("hub-config.json");

    let coordinator = Coordinator::start().await;
    let token = coordinator.hub_token().await;
    let stable_id = StableId::new();

    let first = Agent::new(
        agent_config(stable_id),
        coordinator.client(&token),
        ConfigCache::new(&cache_path),
    );
    first
        .bootstrap_config(&CancellationToken::new())
        .await
        .unwrap();
    assert!(cache_path.exists());

    let addr = coordinator.addr;
    coordinator.stop().await;

    let mut config = ClientConfig::new(addr.to_string(), token);
    config.insecure = true;
    config.connect_timeout = Duration::from_millis(500);
    let offline = Agent::new(
        agent_config(stable_id),
        ControlClient::new(config).unwrap(),
        ConfigCache::new(&cache_path),
    );

    let served = offline
        .bootstrap_config(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(served.tls_version, 1);
    assert_eq!(offline.resolver().current().unwrap().source_version, 1);
    assert!(!offline.is_registered());
}

#[tokio::test]
async fn test_sync_reports_flows() {
    let coordinator = Coordinator::start().await;
    let token = coordinator.hub_token().await;
    let stable_id = StableId::new();
    let agent = Agent::new(
        agent_config(stable_id),
        coordinator.client(&token),
        ConfigCache::disabled(),
    );
    agent
        .bootstrap_config(&CancellationToken::new())
        .await
        .unwrap();

    let flows = agent.flows();
    let flow = flows.open("api.hub.example.com", StableId::new(), Utc::now());
    flows.exchange(&flow, 100, 2048);
    agent.sync_once().await.unwrap();

    let totals = coordinator
        .state
        .service
        .flows()
        .totals(stable_id)
        .unwrap();
    assert_eq!(totals.flows, 1);
    assert_eq!(totals.received_bytes, 100);
    assert_eq!(totals.transmitted_bytes, 2048);

    coordinator.stop().await;
}

#[tokio::test]
async fn test_failed_report_keeps_flow_counts() {
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = closed.local_addr().unwrap();
    drop(closed);

    let mut config = ClientConfig::new(addr.to_string(), "hub-token");
    config.insecure = true;
    config.connect_timeout = Duration::from_millis(500);
    let agent = Agent::new(
        agent_config(StableId::new()),
        ControlClient::new(config).unwrap(),
        ConfigCache::disabled(),
    );

    let flows = agent.flows();
    let flow = flows.open("api.hub.example.com", StableId::new(), Utc::now());
    flows.exchange(&flow, 100, 2048);
    assert!(agent.report_flows().await.is_err());

    let kept = flows.drain();
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].received_bytes, 100);
    assert_eq!(kept[0].transmitted_bytes, 2048);
}

#[tokio::test]
async fn test_startup_failure_after_registration_deregisters() {
    let coordinator = Coordinator::start().await;
    let token = coordinator.hub_token().await;
    let stable_id = StableId::new();
    let agent = Arc::new(Agent::new(
        agent_config(stable_id),
        coordinator.client(&token),
        ConfigCache::disabled(),
    ));
    agent.set_locations(public_location());

    let ports = HubPorts {
        bind_host: "127.0.0.1".to_string(),
        port: 0,
        http_port: None,
        healthz_port: 0,
    };
    // Registration succeeds, then the service token request is rejected
    let err = serve_hub(
        agent.clone(),
        ports,
        "no-leading-slash",
        CancellationToken::new(),
        CancellationToken::new(),
    )
    .await
    .unwrap_err();
    assert!(format!("{:#}", err).contains("service token"));
    assert!(!agent.is_registered());

    let hub = coordinator
        .state
        .service
        .hubs()
        .get(stable_id)
        .await
        .unwrap()
        .unwrap();
    assert!(!hub.connected);

    coordinator.stop().await;
}

#[tokio::test]
async fn test_healthz_and_metrics() {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;

    let coordinator = Coordinator::start().await;
    let token = coordinator.hub_token().await;
    let agent = Arc::new(Agent::new(
        agent_config(StableId::new()),
        coordinator.client(&token),
        ConfigCache::disabled(),
    ));
    agent
        .bootstrap_config(&CancellationToken::new())
        .await
        .unwrap();

    let router = healthz_router(agent.clone()).unwrap();
    let response = router
        .clone()
        .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = router
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains(&format!(
        "meridian_hub_registered{{hub=\"{}\"}} 1",
        agent.stable_id()
    )));
    assert!(text.contains("meridian_hub_tls_version"));

    coordinator.stop().await;
}
