//! Coordinator RPC and HTTP surfaces over an in-memory database

use axum::body::Body;
use axum::http::{header, Request, StatusCode, Version};
use bytes::Bytes;
use chrono::Utc;
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use meridian_auth::{CapabilityTokenIssuer, DbTokenStore, IssuerConfig};
use meridian_cert::generate_self_signed;
use meridian_control::{
    register_activity_cleanup, ControlConfig, ControlServer, ControlService, ControlState,
    FlowAggregator, FrontDoor, HubRegistry, HubTls, ServerConfig, CLEANUP_ACTIVITY_JOB,
};
use meridian_jobs::HandlerRegistry;
use meridian_proto::rpc::{MESSAGE_HEADER, STATUS_HEADER};
use meridian_proto::{
    decode_frame, encode_frame, methods, Account, Capability, Code, ConfigRequest,
    ConfigResponse, CreateTokenRequest, DiscoveryDocument, FlowRecord, FlowTopReport,
    HubDisconnectRequest, HubRegisterRequest, LabelSet, ListHubsResponse, Location,
    ManagementTokenRequest, Noop, RevokeTokenRequest, RpcStatus, ServiceTokenRequest, StableId,
    TokenResponse, VerifyTokenRequest, VerifyTokenResponse, DISCOVERY_PATH, RPC_CONTENT_TYPE,
};
use meridian_store::entities::activity_log;
use meridian_store::{record_activity, system_clock, DbSecretStore};
use sea_orm::EntityTrait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const REGISTER_TOKEN: &str = "aabbcc";
const OPS_TOKEN: &str = "ops-secret";
const CERT_DOMAIN: &str = "*.hub.example.com";

async fn fixture() -> Arc<ControlState> {
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
    Arc::new(ControlState::new(service).unwrap())
}

async fn call<Req, Resp>(
    state: &Arc<ControlState>,
    method: &str,
    token: Option<&str>,
    request: &Req,
) -> Result<Resp, RpcStatus>
where
    Req: Serialize,
    Resp: DeserializeOwned,
{
    let mut builder = Request::builder()
        .method("POST")
        .uri(method)
        .version(Version::HTTP_2)
        .header(header::CONTENT_TYPE, RPC_CONTENT_TYPE);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {}", token));
    }
    let request = builder
        .body(Body::from(encode_frame(request).unwrap()))
        .unwrap();

    let response = FrontDoor::new(state.clone()).handle(request).await;
    assert_eq!(response.status(), StatusCode::OK);

    if let Some(status) = response.headers().get(STATUS_HEADER) {
        let message = response
            .headers()
            .get(MESSAGE_HEADER)
            .and_then(|v| v.to_str().ok());
        return Err(RpcStatus::from_headers(status.to_str().unwrap(), message));
    }

    let collected = response.into_body().collect().await.unwrap();
    let trailers = collected.trailers().cloned().expect("trailers");
    assert_eq!(trailers[STATUS_HEADER], "0");
    Ok(decode_frame(&collected.to_bytes()).unwrap())
}

async fn get(state: &Arc<ControlState>, path: &str) -> (StatusCode, Bytes) {
    let request = Request::builder().uri(path).body(Body::empty()).unwrap();
    let response = FrontDoor::new(state.clone()).handle(request).await;
    let status = response.status();
    (status, response.into_body().collect().await.unwrap().to_bytes())
}

async fn hub_token(state: &Arc<ControlState>) -> String {
    let response: TokenResponse =
        call(state, methods::ISSUE_HUB_TOKEN, Some(REGISTER_TOKEN), &Noop {})
            .await
            .unwrap();
    response.token
}

async fn management_token(state: &Arc<ControlState>, namespace: &str) -> String {
    let response: TokenResponse = call(
        state,
        methods::GET_MANAGEMENT_TOKEN,
        Some(OPS_TOKEN),
        &ManagementTokenRequest {
            namespace: namespace.to_string(),
        },
    )
    .await
    .unwrap();
    response.token
}

fn register_request(id: StableId, name: &str) -> HubRegisterRequest {
    HubRegisterRequest {
        stable_id: id,
        name: name.to_string(),
        labels: LabelSet::from_pairs([("region", "eu")]),
        locations: vec![Location {
            labels: LabelSet::from_pairs([("type", "public")]),
            addresses: vec!["203.0.113.7:443".to_string()],
        }],
    }
}

#[tokio::test]
async fn test_healthz_is_empty_ok() {
    let state = fixture().await;
    let (status, body) = get(&state, "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_empty());
}

#[tokio::test]
async fn test_hub_token_requires_register_token() {
    let state = fixture().await;

    let err = call::<_, TokenResponse>(&state, methods::ISSUE_HUB_TOKEN, Some("wrong"), &Noop {})
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::Unauthenticated);

    let err = call::<_, TokenResponse>(&state, methods::ISSUE_HUB_TOKEN, None, &Noop {})
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::Unauthenticated);

    let token = hub_token(&state).await;
    let verified = state.service.issuer().verify(&token).await.unwrap();
    assert_eq!(verified.capabilities, vec![Capability::Hub]);
    assert_eq!(verified.account.namespace, "/meridian/hubs");
}

#[tokio::test]
async fn test_management_token_scopes_create_and_revoke() {
    let state = fixture().await;
    let manage = management_token(&state, "/tenant1").await;

    // The ops token is not a capability token
    let err = call::<_, TokenResponse>(
        &state,
        methods::CREATE_TOKEN,
        Some(OPS_TOKEN),
        &CreateTokenRequest {
            account: Account::new(StableId::new(), "/tenant1"),
            capabilities: vec![Capability::Serve],
        },
    )
    .await
    .unwrap_err();
    assert_eq!(err.code, Code::Unauthenticated);

    let account = Account::new(StableId::new(), "/tenant1/app");
    let created: TokenResponse = call(
        &state,
        methods::CREATE_TOKEN,
        Some(&manage),
        &CreateTokenRequest {
            account: account.clone(),
            capabilities: vec![Capability::Serve],
        },
    )
    .await
    .unwrap();

    let outside = call::<_, TokenResponse>(
        &state,
        methods::CREATE_TOKEN,
        Some(&manage),
        &CreateTokenRequest {
            account: Account::new(StableId::new(), "/tenant10"),
            capabilities: vec![Capability::Serve],
        },
    )
    .await
    .unwrap_err();
    assert_eq!(outside.code, Code::PermissionDenied);

    let escalation = call::<_, TokenResponse>(
        &state,
        methods::CREATE_TOKEN,
        Some(&manage),
        &CreateTokenRequest {
            account: Account::new(StableId::new(), "/tenant1"),
            capabilities: vec![Capability::Hub],
        },
    )
    .await
    .unwrap_err();
    assert_eq!(escalation.code, Code::PermissionDenied);

    let empty = call::<_, TokenResponse>(
        &state,
        methods::CREATE_TOKEN,
        Some(&manage),
        &CreateTokenRequest {
            account: Account::new(StableId::new(), "/tenant1"),
            capabilities: vec![],
        },
    )
    .await
    .unwrap_err();
    assert_eq!(empty.code, Code::InvalidArgument);

    // A hub resolves the new token
    let hub = hub_token(&state).await;
    let verified: VerifyTokenResponse = call(
        &state,
        methods::VERIFY_TOKEN,
        Some(&hub),
        &VerifyTokenRequest {
            token: created.token.clone(),
        },
    )
    .await
    .unwrap();
    assert_eq!(verified.account, account);
    assert_eq!(verified.capabilities, vec![Capability::Serve]);

    let _: Noop = call(
        &state,
        methods::REVOKE_TOKEN,
        Some(&manage),
        &RevokeTokenRequest {
            token: created.token.clone(),
        },
    )
    .await
    .unwrap();

    // Revoking again is not an error
    let _: Noop = call(
        &state,
        methods::REVOKE_TOKEN,
        Some(&manage),
        &RevokeTokenRequest {
            token: created.token.clone(),
        },
    )
    .await
    .unwrap();

    let revoked = call::<_, VerifyTokenResponse>(
        &state,
        methods::VERIFY_TOKEN,
        Some(&hub),
        &VerifyTokenRequest {
            token: created.token,
        },
    )
    .await
    .unwrap_err();
    assert_eq!(revoked, RpcStatus::permission_denied("token revoked"));

    let unknown = call::<_, VerifyTokenResponse>(
        &state,
        methods::VERIFY_TOKEN,
        Some(&hub),
        &VerifyTokenRequest {
            token: "not-a-token".to_string(),
        },
    )
    .await
    .unwrap_err();
    assert_eq!(unknown.code, Code::NotFound);
}

#[tokio::test]
async fn test_revoke_outside_namespace_is_denied() {
    let state = fixture().await;
    let tenant1 = management_token(&state, "/tenant1").await;
    let tenant2 = management_token(&state, "/tenant2").await;

    let created: TokenResponse = call(
        &state,
        methods::CREATE_TOKEN,
        Some(&tenant2),
        &CreateTokenRequest {
            account: Account::new(StableId::new(), "/tenant2"),
            capabilities: vec![Capability::Access],
        },
    )
    .await
    .unwrap();

    let err = call::<_, Noop>(
        &state,
        methods::REVOKE_TOKEN,
        Some(&tenant1),
        &RevokeTokenRequest {
            token: created.token.clone(),
        },
    )
    .await
    .unwrap_err();
    assert_eq!(err.code, Code::PermissionDenied);
    assert!(state.service.issuer().verify(&created.token).await.is_ok());
}

#[tokio::test]
async fn test_fetch_config_returns_current_material() {
    let state = fixture().await;
    let hub = hub_token(&state).await;

    let config: ConfigResponse = call(
        &state,
        methods::FETCH_CONFIG,
        Some(&hub),
        &ConfigRequest {
            stable_id: StableId::new(),
            known_tls_version: None,
        },
    )
    .await
    .unwrap();
    assert_eq!(config.domain, "hub.example.com");
    assert_eq!(config.tls_version, 1);
    assert!(config.tls_cert_pem.contains("BEGIN CERTIFICATE"));
    assert_eq!(config.service_namespace, "/waypoint");

    // A management token is not a hub credential
    let manage = management_token(&state, "/tenant1").await;
    let err = call::<_, ConfigResponse>(
        &state,
        methods::FETCH_CONFIG,
        Some(&manage),
        &ConfigRequest {
            stable_id: StableId::new(),
            known_tls_version: None,
        },
    )
    .await
    .unwrap_err();
    assert_eq!(err.code, Code::PermissionDenied);
}

#[tokio::test]
async fn test_register_is_idempotent_and_feeds_discovery() {
    let state = fixture().await;
    let hub = hub_token(&state).await;
    let id = StableId::new();

    for name in ["edge-1", "edge-1-renamed"] {
        let _: Noop = call(
            &state,
            methods::HUB_REGISTER,
            Some(&hub),
            &register_request(id, name),
        )
        .await
        .unwrap();
    }

    let listed: ListHubsResponse = call(&state, methods::ALL_HUBS, Some(&hub), &Noop {})
        .await
        .unwrap();
    assert_eq!(listed.hubs.len(), 1);
    assert_eq!(listed.hubs[0].stable_id, id);
    assert_eq!(listed.hubs[0].name, "edge-1-renamed");
    assert!(listed.hubs[0].connected);

    let (status, body) = get(&state, DISCOVERY_PATH).await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(
        json,
        serde_json::json!({
            "hubs": [{
                "addresses": ["203.0.113.7:443"],
                "labels": {"labels": [{"name": "region", "value": "eu"}]},
                "name": "edge-1-renamed"
            }]
        })
    );

    let _: Noop = call(
        &state,
        methods::HUB_DISCONNECT,
        Some(&hub),
        &HubDisconnectRequest { stable_id: id },
    )
    .await
    .unwrap();

    let (_, body) = get(&state, DISCOVERY_PATH).await;
    let doc: DiscoveryDocument = serde_json::from_slice(&body).unwrap();
    assert!(doc.hubs.is_empty());

    let err = call::<_, Noop>(
        &state,
        methods::HUB_DISCONNECT,
        Some(&hub),
        &HubDisconnectRequest {
            stable_id: StableId::new(),
        },
    )
    .await
    .unwrap_err();
    assert_eq!(err.code, Code::NotFound);
}

#[tokio::test]
async fn test_hub_cannot_take_over_another_hubs_registration() {
    let state = fixture().await;
    let owner = hub_token(&state).await;
    let intruder = hub_token(&state).await;
    let id = StableId::new();

    let _: Noop = call(
        &state,
        methods::HUB_REGISTER,
        Some(&owner),
        &register_request(id, "edge-1"),
    )
    .await
    .unwrap();

    let err = call::<_, Noop>(
        &state,
        methods::HUB_REGISTER,
        Some(&intruder),
        &register_request(id, "hijacked"),
    )
    .await
    .unwrap_err();
    assert_eq!(err.code, Code::PermissionDenied);

    let err = call::<_, Noop>(
        &state,
        methods::HUB_DISCONNECT,
        Some(&intruder),
        &HubDisconnectRequest { stable_id: id },
    )
    .await
    .unwrap_err();
    assert_eq!(err.code, Code::PermissionDenied);

    let info = state.service.hubs().get(id).await.unwrap().unwrap();
    assert_eq!(info.name, "edge-1");
    assert!(info.connected);

    // The owner can still refresh and disconnect its own row
    let _: Noop = call(
        &state,
        methods::HUB_DISCONNECT,
        Some(&owner),
        &HubDisconnectRequest { stable_id: id },
    )
    .await
    .unwrap();
    assert!(!state.service.hubs().get(id).await.unwrap().unwrap().connected);
}

#[tokio::test]
async fn test_service_token_is_namespace_scoped() {
    let state = fixture().await;
    let hub = hub_token(&state).await;
    let hub_account = state.service.issuer().verify(&hub).await.unwrap().account;

    let response: TokenResponse = call(
        &state,
        methods::REQUEST_SERVICE_TOKEN,
        Some(&hub),
        &ServiceTokenRequest {
            namespace: "/waypoint".to_string(),
        },
    )
    .await
    .unwrap();

    let verified = state
        .service
        .issuer()
        .verify(&response.token)
        .await
        .unwrap();
    assert_eq!(verified.account.account_id, hub_account.account_id);
    assert_eq!(verified.account.namespace, "/waypoint");
    assert_eq!(
        verified.capabilities,
        vec![Capability::Access, Capability::Connect]
    );

    // The service token cannot act as a hub
    let err = call::<_, TokenResponse>(
        &state,
        methods::REQUEST_SERVICE_TOKEN,
        Some(&response.token),
        &ServiceTokenRequest {
            namespace: "/waypoint".to_string(),
        },
    )
    .await
    .unwrap_err();
    assert_eq!(err.code, Code::PermissionDenied);

    let err = call::<_, TokenResponse>(
        &state,
        methods::REQUEST_SERVICE_TOKEN,
        Some(&hub),
        &ServiceTokenRequest {
            namespace: "no-slash".to_string(),
        },
    )
    .await
    .unwrap_err();
    assert_eq!(err.code, Code::InvalidArgument);
}

#[tokio::test]
async fn test_flow_reports_show_in_metrics() {
    let state = fixture().await;
    let hub = hub_token(&state).await;
    let hub_id = StableId::new();

    let _: Noop = call(
        &state,
        methods::CURRENT_FLOW_TOP,
        Some(&hub),
        &FlowTopReport {
            hub_id,
            records: vec![FlowRecord {
                flow_id: "f1".to_string(),
                service_id: "web".to_string(),
                account_id: StableId::new(),
                transmitted_bytes: 1200,
                received_bytes: 300,
                transmitted_messages: 4,
                received_messages: 2,
                started_at: Utc::now(),
            }],
        },
    )
    .await
    .unwrap();

    let (status, body) = get(&state, "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains(&format!(
        "meridian_flow_transmitted_bytes_total{{hub_id=\"{}\"}} 1200",
        hub_id
    )));
    let method = format!("method=\"{}\"", methods::ISSUE_HUB_TOKEN);
    assert!(text.lines().any(|line| line.starts_with("meridian_rpc_calls_total{")
        && line.contains(&method)
        && line.contains("code=\"Ok\"")
        && line.ends_with(" 1")));
    assert!(text.contains("meridian_tls_version{domain=\"*.hub.example.com\"} 1"));
    assert!(text.contains("# TYPE meridian_flow_transmitted_bytes_total counter"));
    assert!(text.contains(&format!(
        "meridian_flow_last_report_timestamp_seconds{{hub_id=\"{}\"}}",
        hub_id
    )));
    assert!(text.contains("meridian_hubs_registered 0"));
}

#[tokio::test]
async fn test_rpc_content_type_over_http1_is_not_dispatched() {
    let state = fixture().await;
    let request = Request::builder()
        .method("POST")
        .uri(methods::ISSUE_HUB_TOKEN)
        .version(Version::HTTP_11)
        .header(header::CONTENT_TYPE, RPC_CONTENT_TYPE)
        .body(Body::from(encode_frame(&Noop {}).unwrap()))
        .unwrap();
    let response = FrontDoor::new(state).handle(request).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unknown_method_is_unimplemented() {
    let state = fixture().await;
    let err = call::<_, Noop>(&state, "/meridian.ControlServices/Nope", None, &Noop {})
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::Unimplemented);
}

#[tokio::test]
async fn test_activity_cleanup_purges_old_entries() {
    let state = fixture().await;
    let db = state.service.hubs().db().clone();
    let now = Utc::now();

    record_activity(&db, now - chrono::Duration::days(40), "old", None, "")
        .await
        .unwrap();
    record_activity(&db, now, "new", None, "").await.unwrap();

    let mut registry = HandlerRegistry::new();
    register_activity_cleanup(
        &mut registry,
        db.clone(),
        system_clock(),
        Duration::from_secs(30 * 24 * 3600),
        "default",
    )
    .unwrap();
    assert_eq!(registry.periodic_jobs().len(), 1);
    assert_eq!(registry.periodic_jobs()[0].interval, Duration::from_secs(3600));

    let handler = registry.handler(CLEANUP_ACTIVITY_JOB).unwrap();
    (**handler)(Vec::new()).await.unwrap();

    let left = activity_log::Entity::find().all(&db).await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].kind, "new");
}

#[tokio::test]
async fn test_listener_serves_h2c_and_http1() {
    let state = fixture().await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let shutdown = CancellationToken::new();
    let force = CancellationToken::new();
    let server = ControlServer::new(ServerConfig::default(), state);
    let handle = {
        let shutdown = shutdown.clone();
        let force = force.clone();
        tokio::spawn(async move { server.serve(listener, shutdown, force).await })
    };

    // Plain HTTP/1.1
    let http1 = Client::builder(TokioExecutor::new()).build_http::<Full<Bytes>>();
    let response = http1
        .get(format!("http://{}/healthz", addr).parse().unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // RPC over prior-knowledge HTTP/2
    let h2 = Client::builder(TokioExecutor::new())
        .http2_only(true)
        .build_http::<Full<Bytes>>();
    let request = Request::builder()
        .method("POST")
        .uri(format!("http://{}{}", addr, methods::ISSUE_HUB_TOKEN))
        .header(header::CONTENT_TYPE, RPC_CONTENT_TYPE)
        .header("authorization", REGISTER_TOKEN)
        .body(Full::new(encode_frame(&Noop {}).unwrap()))
        .unwrap();
    let response = h2.request(request).await.unwrap();
    assert_eq!(response.version(), Version::HTTP_2);
    let collected = response.into_body().collect().await.unwrap();
    assert_eq!(collected.trailers().unwrap()[STATUS_HEADER], "0");
    let token: TokenResponse = decode_frame(&collected.to_bytes()).unwrap();
    assert!(!token.token.is_empty());

    drop(http1);
    drop(h2);
    shutdown.cancel();
    let force_later = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        force.cancel();
    });
    handle.await.unwrap().unwrap();
    force_later.abort();
}

#[tokio::test]
async fn test_tls_refresh_installs_new_versions_only() {
    use meridian_cert::{
        CertManagerConfig, CertificateLifecycleManager, MemoryDns, SelfSignedAuthority,
    };
    use meridian_control::refresh_once;
    use meridian_store::{Leases, MemoryLeaseStore, MemorySecretStore};

    let clock = system_clock();
    let manager = CertificateLifecycleManager::new(
        CertManagerConfig {
            dns_zone_id: "zone-1".to_string(),
            ..Default::default()
        },
        Arc::new(SelfSignedAuthority::new(clock.clone())),
        Arc::new(MemoryDns::new()),
        Arc::new(MemorySecretStore::new(clock.clone())),
        Leases::new(Arc::new(MemoryLeaseStore::new()), clock.clone()),
    );
    let tls = HubTls::new(CERT_DOMAIN, clock);

    // Nothing issued yet
    assert!(!refresh_once(&manager, &tls).await.unwrap());
    assert!(tls.current().is_none());

    let issued = manager.obtain(CERT_DOMAIN).await.unwrap();
    assert!(refresh_once(&manager, &tls).await.unwrap());
    assert_eq!(tls.current_version(), Some(issued.source_version));

    assert!(!refresh_once(&manager, &tls).await.unwrap());
}
