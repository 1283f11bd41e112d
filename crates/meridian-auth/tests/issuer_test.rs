//! Issue / verify / revoke against the database-backed stores

use meridian_auth::{CapabilityTokenIssuer, DbTokenStore, IssuerConfig, TokenError};
use meridian_proto::{Account, Capability, StableId};
use meridian_store::{connect, migrate, system_clock, DbSecretStore};
use sea_orm::DatabaseConnection;
use std::sync::Arc;

const ADMIN: &str = "register-secret";

async fn setup() -> DatabaseConnection {
    let db = connect("sqlite::memory:").await.unwrap();
    migrate(&db).await.unwrap();
    db
}

async fn issuer(db: &DatabaseConnection) -> CapabilityTokenIssuer {
    let secrets = DbSecretStore::new(db.clone(), system_clock());
    CapabilityTokenIssuer::load(
        &IssuerConfig::default(),
        ADMIN,
        &secrets,
        Arc::new(DbTokenStore::new(db.clone())),
        system_clock(),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn test_issue_verify_revoke_scenario() {
    let db = setup().await;
    let issuer = issuer(&db).await;
    let grant = issuer.admin_grant(ADMIN).unwrap();

    let a1 = StableId::new();
    let account = Account::new(a1, "/tenant1");
    let token = issuer
        .issue(&grant, &account, &[Capability::Serve])
        .await
        .unwrap();

    let verified = issuer.verify(&token).await.unwrap();
    assert_eq!(verified.account.account_id, a1);
    assert_eq!(verified.account.namespace, "/tenant1");
    assert_eq!(verified.capabilities, vec![Capability::Serve]);

    issuer.revoke(&token).await.unwrap();
    assert!(matches!(issuer.verify(&token).await, Err(TokenError::Revoked)));
    assert!(matches!(issuer.verify(&token).await, Err(TokenError::Revoked)));

    // Idempotent
    issuer.revoke(&token).await.unwrap();
}

#[tokio::test]
async fn test_round_trip_capability_sets() {
    let db = setup().await;
    let issuer = issuer(&db).await;
    let grant = issuer.admin_grant(ADMIN).unwrap();

    let sets: Vec<Vec<Capability>> = vec![
        vec![Capability::Serve],
        vec![Capability::Access, Capability::Connect],
        vec![Capability::Manage, Capability::Serve, Capability::Hub],
        Capability::ALL.to_vec(),
    ];

    for (i, caps) in sets.iter().enumerate() {
        let account = Account::new(StableId::new(), format!("/tenant{}/app", i));
        let token = issuer.issue(&grant, &account, caps).await.unwrap();
        let verified = issuer.verify(&token).await.unwrap();
        assert_eq!(verified.account, account);
        assert_eq!(&verified.capabilities, caps);
    }
}

#[tokio::test]
async fn test_replicas_share_signing_key() {
    let db = setup().await;
    let first = issuer(&db).await;
    let second = issuer(&db).await;

    let grant = first.admin_grant(ADMIN).unwrap();
    let account = Account::new(StableId::new(), "/shared");
    let token = first
        .issue(&grant, &account, &[Capability::Access])
        .await
        .unwrap();

    // Verification on another replica hits the same records
    assert_eq!(second.verify(&token).await.unwrap().account, account);
    second.revoke(&token).await.unwrap();
    assert!(matches!(first.verify(&token).await, Err(TokenError::Revoked)));
}

#[tokio::test]
async fn test_concurrent_issuance_same_account() {
    let db = setup().await;
    let issuer = Arc::new(issuer(&db).await);
    let account = Account::new(StableId::new(), "/busy");

    let mut handles = Vec::new();
    for _ in 0..16 {
        let issuer = issuer.clone();
        let account = account.clone();
        handles.push(tokio::spawn(async move {
            let grant = issuer.admin_grant(ADMIN).unwrap();
            issuer
                .issue(&grant, &account, &[Capability::Serve])
                .await
                .unwrap()
        }));
    }

    let mut tokens = Vec::new();
    for handle in handles {
        tokens.push(handle.await.unwrap());
    }
    tokens.sort();
    tokens.dedup();
    assert_eq!(tokens.len(), 16);

    for token in &tokens {
        assert_eq!(issuer.verify(token).await.unwrap().account, account);
    }
}

#[tokio::test]
async fn test_token_from_other_issuer_is_not_found() {
    let db_a = setup().await;
    let db_b = setup().await;
    let a = issuer(&db_a).await;
    let b = issuer(&db_b).await;

    let grant = a.admin_grant(ADMIN).unwrap();
    let token = a
        .issue(&grant, &Account::new(StableId::new(), "/x"), &[Capability::Serve])
        .await
        .unwrap();

    assert!(matches!(b.verify(&token).await, Err(TokenError::NotFound)));
}
