//! Database-backed collaborators against in-memory SQLite

use chrono::Duration as ChronoDuration;
use meridian_store::entities::activity_log;
use meridian_store::{
    connect, migrate, purge_activity_before, record_activity, DbLeaseStore, DbSecretStore,
    LeaseStore, SecretStore, SystemClock,
};
use sea_orm::{DatabaseConnection, EntityTrait};
use std::sync::Arc;

async fn setup() -> DatabaseConnection {
    let db = connect("sqlite::memory:").await.unwrap();
    migrate(&db).await.unwrap();
    db
}

#[tokio::test]
async fn test_secret_versions() {
    let db = setup().await;
    let store = DbSecretStore::new(db, Arc::new(SystemClock));

    assert!(store.read("certs/example.com").await.unwrap().is_none());

    let v1 = store.write("certs/example.com", b"first").await.unwrap();
    let v2 = store.write("certs/example.com", b"second").await.unwrap();
    assert_eq!(v1.version, 1);
    assert_eq!(v2.version, 2);

    let latest = store.read("certs/example.com").await.unwrap().unwrap();
    assert_eq!(latest.version, 2);
    assert_eq!(latest.data, b"second");

    let old = store.read_version("certs/example.com", 1).await.unwrap().unwrap();
    assert_eq!(old.data, b"first");
}

#[tokio::test]
async fn test_secret_write_if_absent() {
    let db = setup().await;
    let store = DbSecretStore::new(db, Arc::new(SystemClock));

    let a = store.write_if_absent("signing-key/k1", &[1, 2, 3]).await.unwrap();
    let b = store.write_if_absent("signing-key/k1", &[9, 9, 9]).await.unwrap();
    assert_eq!(a.data, vec![1, 2, 3]);
    assert_eq!(b.data, vec![1, 2, 3]);
    assert_eq!(b.version, 1);
}

#[tokio::test]
async fn test_lease_conditional_acquire() {
    let db = setup().await;
    let store = DbLeaseStore::new(db);
    let now = chrono::Utc::now();
    let ttl = ChronoDuration::seconds(30);

    assert_eq!(
        store.try_acquire("renew", "a", now + ttl, now).await.unwrap(),
        Some(1)
    );
    assert_eq!(store.try_acquire("renew", "b", now + ttl, now).await.unwrap(), None);

    // Holder a crashes; b takes over after expiry
    let later = now + ChronoDuration::seconds(31);
    assert_eq!(
        store.try_acquire("renew", "b", later + ttl, later).await.unwrap(),
        Some(2)
    );
    assert!(!store.renew("renew", "a", later + ttl, later).await.unwrap());
    assert!(!store.release("renew", "a").await.unwrap());

    let current = store.current("renew", later).await.unwrap().unwrap();
    assert_eq!(current.holder, "b");

    assert!(store.release("renew", "b").await.unwrap());
    assert!(store.current("renew", later).await.unwrap().is_none());
}

#[tokio::test]
async fn test_activity_retention() {
    let db = setup().await;
    let now = chrono::Utc::now();

    record_activity(&db, now - ChronoDuration::days(40), "hub.register", Some("h1"), "old")
        .await
        .unwrap();
    record_activity(&db, now, "hub.register", Some("h1"), "new")
        .await
        .unwrap();

    let removed = purge_activity_before(&db, now - ChronoDuration::days(30))
        .await
        .unwrap();
    assert_eq!(removed, 1);

    let remaining = activity_log::Entity::find().all(&db).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].detail, "new");
}
