use crate::dispatcher::Dispatcher;
use crate::domain::{TopicSet, UserSyncService};
use crate::nats::{ConsumeLoggingLayer, ConsumeLoggingService, UserEventConsumerService};
use common::domain::PayloadFormat;
use common::nats::BrokerConnector;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tracing::info;

pub struct SyncWorkerConfig {
    pub topics: TopicSet,
    pub subject_prefix: String,
    pub payload_format: PayloadFormat,
}

pub struct SyncWorker {
    dispatcher: Dispatcher<ConsumeLoggingService<UserEventConsumerService>>,
}

impl SyncWorker {
    /// Subscribe to every configured topic and wire the consumer stack.
    ///
    /// Listener tasks stop when `ctx` is cancelled, which closes their
    /// channels and lets the dispatcher drain.
    pub async fn new(
        connector: Arc<BrokerConnector>,
        sync_service: Arc<UserSyncService>,
        config: SyncWorkerConfig,
        ctx: CancellationToken,
    ) -> anyhow::Result<Self> {
        info!(topics = config.topics.len(), "initializing sync worker");

        let service = ServiceBuilder::new()
            .layer(ConsumeLoggingLayer::new())
            .service(UserEventConsumerService::new(
                sync_service,
                config.payload_format,
            ));

        let mut dispatcher = Dispatcher::new(service, connector.clone());
        for topic in config.topics.iter() {
            let subject = topic.subject(&config.subject_prefix);
            let subscription = connector
                .subscribe(topic.name(), &subject, ctx.clone())
                .await?;
            dispatcher.add_topic(topic, subscription.receiver);
        }

        info!("sync worker initialized");
        Ok(Self { dispatcher })
    }

    pub fn into_runner_process(
        self,
    ) -> impl FnOnce(CancellationToken) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>
    {
        let dispatcher = self.dispatcher;
        move |ctx| Box::pin(async move { dispatcher.run(ctx).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SyncStore;
    use common::domain::{MockArchivedMetaUserRepository, MockMetaUserRepository, MockUserClient};
    use common::nats::{
        MockJetStreamConsumer, MockJetStreamPublisher, MockPullConsumer, RedeliveryPolicy,
        SubscriptionConfig,
    };

    fn sync_service() -> Arc<UserSyncService> {
        Arc::new(UserSyncService::new(
            Arc::new(MockUserClient::new()),
            SyncStore::Versioned {
                live: Arc::new(MockMetaUserRepository::new()),
                archive: Arc::new(MockArchivedMetaUserRepository::new()),
            },
        ))
    }

    #[tokio::test]
    async fn test_subscribes_to_each_configured_topic() {
        let mut consumer_client = MockJetStreamConsumer::new();
        consumer_client
            .expect_create_consumer()
            .withf(|config, _| {
                config.filter_subject == "VirtualTopic.user-create"
                    || config.filter_subject == "VirtualTopic.user-remove"
            })
            .times(2)
            .returning(|_, _| {
                let mut pull = MockPullConsumer::new();
                pull.expect_fetch_deliveries()
                    .returning(|_, _| Err(anyhow::anyhow!("no messages")));
                Ok(Box::new(pull))
            });
        let mut publisher = MockJetStreamPublisher::new();
        publisher.expect_flush().returning(|| Ok(()));

        let connector = Arc::new(BrokerConnector::new(
            Arc::new(consumer_client),
            Arc::new(publisher),
            RedeliveryPolicy::default(),
            SubscriptionConfig::default(),
        ));
        let ctx = CancellationToken::new();

        let worker = SyncWorker::new(
            connector.clone(),
            sync_service(),
            SyncWorkerConfig {
                topics: TopicSet::parse("user-create,user-remove").unwrap(),
                subject_prefix: "VirtualTopic".to_string(),
                payload_format: PayloadFormat::Reference,
            },
            ctx.clone(),
        )
        .await
        .unwrap();

        assert_eq!(worker.dispatcher.topic_count(), 2);

        // Cancelling stops the listeners, which closes every channel
        ctx.cancel();
        worker.into_runner_process()(ctx).await.unwrap();
        connector.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_failure_is_fatal() {
        let mut consumer_client = MockJetStreamConsumer::new();
        consumer_client
            .expect_create_consumer()
            .returning(|_, _| Err(anyhow::anyhow!("stream not found")));

        let connector = Arc::new(BrokerConnector::new(
            Arc::new(consumer_client),
            Arc::new(MockJetStreamPublisher::new()),
            RedeliveryPolicy::default(),
            SubscriptionConfig::default(),
        ));

        let result = SyncWorker::new(
            connector,
            sync_service(),
            SyncWorkerConfig {
                topics: TopicSet::all(),
                subject_prefix: "VirtualTopic".to_string(),
                payload_format: PayloadFormat::Reference,
            },
            CancellationToken::new(),
        )
        .await;

        assert!(result.is_err());
    }
}
