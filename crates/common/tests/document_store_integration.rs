#![cfg(feature = "integration-tests")]

use chrono::{TimeZone, Utc};
use common::domain::{
    ArchivedMetaUserRepository, ArchivedUserRepository, DomainError, EmailSnapshot, MetaUser,
    MetaUserRepository, Provenance, User, UserRepository, Versioned,
};
use common::postgres::{
    DocumentWrite, PostgresClient, PostgresConfig, PostgresDocumentStore,
    PostgresMetaUserRepository, PostgresUserRepository, StoreError, METAUSERS, OLD_METAUSERS,
    OLD_USERS, USERS,
};
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};

async fn setup_test_store() -> (ContainerAsync<GenericImage>, PostgresDocumentStore) {
    let postgres = GenericImage::new("postgres", "16-alpine")
        .with_wait_for(testcontainers::core::WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_exposed_port(5432.into())
        .with_env_var("POSTGRES_PASSWORD", "postgres")
        .start()
        .await
        .unwrap();
    let host = postgres.get_host().await.unwrap();
    let port = postgres.get_host_port_ipv4(5432).await.unwrap();

    let client = PostgresClient::new(&PostgresConfig {
        host: host.to_string(),
        port,
        database: "postgres".to_string(),
        username: "postgres".to_string(),
        password: "postgres".to_string(),
        max_pool_size: 5,
    })
    .expect("Failed to create client");

    // The server restarts once during init; retry until it accepts queries
    let mut ready = false;
    for _ in 0..30 {
        if client.ping().await.is_ok() {
            ready = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    assert!(ready, "postgres never became ready");

    let store = PostgresDocumentStore::new(client, Duration::from_secs(5));
    store
        .ensure_collections(&[USERS, OLD_USERS, METAUSERS, OLD_METAUSERS])
        .await
        .unwrap();

    (postgres, store)
}

fn meta_user(id: &str, email: &str) -> MetaUser {
    MetaUser {
        id: id.to_string(),
        email: Some(Versioned::observed(EmailSnapshot {
            email: email.to_string(),
            provenance: Provenance::new(
                Some("web"),
                Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap(),
            ),
        })),
        updated_at: Some(Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_ensure_collections_is_idempotent() {
    let (_container, store) = setup_test_store().await;

    store
        .ensure_collections(&[USERS, OLD_USERS, METAUSERS, OLD_METAUSERS])
        .await
        .unwrap();
}

#[tokio::test]
async fn test_find_one_missing_is_not_found() {
    let (_container, store) = setup_test_store().await;

    let result = store.find_one::<MetaUser>(METAUSERS, "nobody").await;

    assert!(matches!(result, Err(StoreError::NotFound { .. })));
}

#[tokio::test]
async fn test_meta_user_insert_find_update() {
    let (_container, store) = setup_test_store().await;
    let repository = PostgresMetaUserRepository::new(store);

    let id = repository
        .insert_meta_user(meta_user("u1", "ana@example.com"))
        .await
        .unwrap();
    assert_eq!(id, "u1");

    let stored = repository.get_meta_user("u1").await.unwrap();
    assert_eq!(stored, meta_user("u1", "ana@example.com"));

    repository
        .update_meta_user(meta_user("u1", "ana@new.example.com"))
        .await
        .unwrap();
    let stored = repository.get_meta_user("u1").await.unwrap();
    assert_eq!(
        stored.email.unwrap().new_value.email,
        "ana@new.example.com"
    );
}

#[tokio::test]
async fn test_duplicate_insert_is_rejected() {
    let (_container, store) = setup_test_store().await;
    let repository = PostgresMetaUserRepository::new(store);

    repository
        .insert_meta_user(meta_user("u1", "ana@example.com"))
        .await
        .unwrap();
    let result = repository
        .insert_meta_user(meta_user("u1", "ana@example.com"))
        .await;

    assert!(matches!(
        result,
        Err(DomainError::DocumentAlreadyExists { .. })
    ));
}

#[tokio::test]
async fn test_update_and_remove_missing_are_not_found() {
    let (_container, store) = setup_test_store().await;
    let repository = PostgresUserRepository::new(store);

    let update = repository
        .update_user(User {
            id: "ghost".to_string(),
            ..Default::default()
        })
        .await;
    assert!(matches!(update, Err(ref e) if e.is_not_found()));

    let remove = repository.remove_user("ghost").await;
    assert!(matches!(remove, Err(ref e) if e.is_not_found()));
}

#[tokio::test]
async fn test_archive_is_idempotent_and_stamps_updated_at() {
    let (_container, store) = setup_test_store().await;
    let repository = PostgresMetaUserRepository::new(store.clone());
    let original = meta_user("u1", "ana@example.com");

    repository.archive_meta_user(original.clone()).await.unwrap();
    repository.archive_meta_user(original.clone()).await.unwrap();

    let archived: MetaUser = store.find_one(OLD_METAUSERS, "u1").await.unwrap();
    assert_eq!(archived.email, original.email);
    assert!(archived.updated_at > original.updated_at);
}

#[tokio::test]
async fn test_flat_user_archive_then_remove() {
    let (_container, store) = setup_test_store().await;
    let repository = PostgresUserRepository::new(store.clone());
    let user = User {
        id: "u2".to_string(),
        email: "bo@example.com".to_string(),
        ..Default::default()
    };

    repository.insert_user(user.clone()).await.unwrap();
    repository.archive_user(user).await.unwrap();
    repository.remove_user("u2").await.unwrap();

    assert!(repository.get_user("u2").await.unwrap_err().is_not_found());
    let archived: User = store.find_one(OLD_USERS, "u2").await.unwrap();
    assert_eq!(archived.email, "bo@example.com");
}

#[tokio::test]
async fn test_transaction_rolls_back_on_failure() {
    let (_container, store) = setup_test_store().await;
    let document = serde_json::to_value(meta_user("u3", "cy@example.com")).unwrap();

    let result = store
        .with_transaction(vec![
            DocumentWrite::Upsert {
                collection: OLD_METAUSERS.to_string(),
                id: "u3".to_string(),
                document,
            },
            DocumentWrite::Remove {
                collection: METAUSERS.to_string(),
                id: "u3".to_string(),
            },
        ])
        .await;

    assert!(matches!(result, Err(StoreError::NotFound { .. })));
    let archived = store.find_one::<MetaUser>(OLD_METAUSERS, "u3").await;
    assert!(matches!(archived, Err(StoreError::NotFound { .. })));
}
