use crate::domain::{TopicAction, UserSyncService};
use crate::nats::{ConsumeRequest, ConsumeResponse};
use common::domain::{PayloadFormat, UserEvent};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::Service;
use tracing::{debug, error, warn};

/// Tower service for user lifecycle deliveries.
///
/// Decodes the payload, runs the handler for the delivery's topic and maps
/// the result onto an ack or a redelivery. Undecodable payloads and
/// permanently invalid users are acked and dropped; retrying them cannot help.
#[derive(Clone)]
pub struct UserEventConsumerService {
    sync_service: Arc<UserSyncService>,
    payload_format: PayloadFormat,
}

impl UserEventConsumerService {
    pub fn new(sync_service: Arc<UserSyncService>, payload_format: PayloadFormat) -> Self {
        Self {
            sync_service,
            payload_format,
        }
    }
}

impl Service<ConsumeRequest> for UserEventConsumerService {
    type Response = ConsumeResponse;
    type Error = anyhow::Error;
    type Future = BoxFuture<'static, Result<ConsumeResponse, anyhow::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ConsumeRequest) -> Self::Future {
        let sync_service = Arc::clone(&self.sync_service);
        let payload_format = self.payload_format;

        Box::pin(async move {
            let event = match UserEvent::decode(payload_format, &req.payload) {
                Ok(event) => event,
                Err(e) => {
                    error!(
                        error = %e,
                        subject = %req.subject,
                        topic = %req.topic,
                        "dropping undecodable message"
                    );
                    return Ok(ConsumeResponse::Ack);
                }
            };

            let user_id = event.user_id().to_string();
            let result = match req.topic.action() {
                TopicAction::Sync => sync_service.sync_user(event).await.map(|outcome| {
                    debug!(user_id = %user_id, outcome = ?outcome, "sync handled");
                }),
                TopicAction::Remove => sync_service.remove_user(&user_id).await,
            };

            match result {
                Ok(()) => Ok(ConsumeResponse::Ack),
                Err(e) if !e.is_transient() => {
                    warn!(
                        error = %e,
                        user_id = %user_id,
                        topic = %req.topic,
                        "dropping message that can never succeed"
                    );
                    Ok(ConsumeResponse::Ack)
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        user_id = %user_id,
                        topic = %req.topic,
                        attempt = req.attempts,
                        "handler failed"
                    );
                    Ok(ConsumeResponse::redeliver(e.to_string()))
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{SyncStore, Topic};
    use bytes::Bytes;
    use common::domain::{
        DomainError, MetaUser, MockArchivedMetaUserRepository, MockMetaUserRepository,
        MockUserClient, User,
    };
    use tower::ServiceExt;

    fn request(topic: Topic, payload: &'static [u8]) -> ConsumeRequest {
        ConsumeRequest {
            topic,
            subject: topic.subject("VirtualTopic"),
            payload: Bytes::from_static(payload),
            attempts: 1,
            headers: None,
            subscription_id: None,
        }
    }

    fn service(
        client: MockUserClient,
        live: MockMetaUserRepository,
        archive: MockArchivedMetaUserRepository,
    ) -> UserEventConsumerService {
        let sync_service = UserSyncService::new(
            Arc::new(client),
            SyncStore::Versioned {
                live: Arc::new(live),
                archive: Arc::new(archive),
            },
        );
        UserEventConsumerService::new(Arc::new(sync_service), PayloadFormat::Reference)
    }

    fn untouched() -> (MockUserClient, MockMetaUserRepository, MockArchivedMetaUserRepository) {
        let mut client = MockUserClient::new();
        client.expect_get_user().times(0);
        let mut live = MockMetaUserRepository::new();
        live.expect_get_meta_user().times(0);
        live.expect_insert_meta_user().times(0);
        live.expect_update_meta_user().times(0);
        live.expect_remove_meta_user().times(0);
        let mut archive = MockArchivedMetaUserRepository::new();
        archive.expect_archive_meta_user().times(0);
        (client, live, archive)
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_acked_without_handler() {
        for topic in Topic::ALL {
            let (client, live, archive) = untouched();
            let response = service(client, live, archive)
                .oneshot(request(topic, b"\x00garbage"))
                .await
                .unwrap();

            assert_eq!(response, ConsumeResponse::Ack);
        }
    }

    #[tokio::test]
    async fn test_missing_id_is_acked_without_handler() {
        let (client, live, archive) = untouched();

        let response = service(client, live, archive)
            .oneshot(request(Topic::UserCreate, br#"{"enqueuedAt":"2024-03-01T10:00:00Z"}"#))
            .await
            .unwrap();

        assert_eq!(response, ConsumeResponse::Ack);
    }

    #[tokio::test]
    async fn test_successful_sync_is_acked() {
        let mut client = MockUserClient::new();
        client.expect_get_user().returning(|id| {
            Ok(User {
                id: id.to_string(),
                email: "ana@example.com".to_string(),
                ..Default::default()
            })
        });
        let mut live = MockMetaUserRepository::new();
        live.expect_get_meta_user().returning(|id| {
            Err(DomainError::DocumentNotFound {
                collection: "metausers".to_string(),
                id: id.to_string(),
            })
        });
        live.expect_insert_meta_user()
            .times(1)
            .returning(|m| Ok(m.id));

        let response = service(client, live, MockArchivedMetaUserRepository::new())
            .oneshot(request(Topic::UserCreate, br#"{"id":"u1"}"#))
            .await
            .unwrap();

        assert_eq!(response, ConsumeResponse::Ack);
    }

    #[tokio::test]
    async fn test_transient_failure_requests_redelivery() {
        let mut client = MockUserClient::new();
        client
            .expect_get_user()
            .returning(|_| Err(DomainError::Upstream("connection refused".to_string())));

        let response = service(
            client,
            MockMetaUserRepository::new(),
            MockArchivedMetaUserRepository::new(),
        )
        .oneshot(request(Topic::UserUpdate, br#"{"id":"u1"}"#))
        .await
        .unwrap();

        assert!(matches!(response, ConsumeResponse::Redeliver(ref reason) if reason.contains("connection refused")));
    }

    #[tokio::test]
    async fn test_remove_topic_runs_archive_path() {
        let mut live = MockMetaUserRepository::new();
        live.expect_get_meta_user().returning(|id| {
            Ok(MetaUser {
                id: id.to_string(),
                ..Default::default()
            })
        });
        live.expect_remove_meta_user()
            .times(1)
            .returning(|_| Ok(()));
        let mut archive = MockArchivedMetaUserRepository::new();
        archive
            .expect_archive_meta_user()
            .times(1)
            .returning(|m| Ok(m.id));
        let mut client = MockUserClient::new();
        client.expect_get_user().times(0);

        let response = service(client, live, archive)
            .oneshot(request(Topic::UserRemove, br#"{"id":"u1"}"#))
            .await
            .unwrap();

        assert_eq!(response, ConsumeResponse::Ack);
    }

    #[tokio::test]
    async fn test_invalid_user_is_dropped() {
        let mut client = MockUserClient::new();
        client.expect_get_user().returning(|_| {
            Ok(User {
                id: "someone-else".to_string(),
                ..Default::default()
            })
        });
        let mut live = MockMetaUserRepository::new();
        live.expect_get_meta_user().times(0);

        let response = service(client, live, MockArchivedMetaUserRepository::new())
            .oneshot(request(Topic::UserCreate, br#"{"id":"u1"}"#))
            .await
            .unwrap();

        assert_eq!(response, ConsumeResponse::Ack);
    }
}
