use crate::nats::client::{NatsClient, NatsConnectConfig};
use crate::nats::traits::{JetStreamConsumer, JetStreamPublisher};
use crate::nats::{inject_trace_context, Delivery, ATTEMPTS_HEADER};
use anyhow::{Context, Result};
use async_nats::jetstream;
use async_nats::HeaderMap;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// How failed deliveries are retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedeliveryPolicy {
    /// Highest attempt number that is still resent
    pub max_redeliveries: u32,
    /// Wait before a failed delivery is published again
    pub delay: Duration,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            max_redeliveries: 10,
            delay: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    pub stream: String,
    pub consumer_prefix: String,
    pub batch_size: usize,
    pub batch_wait: Duration,
    pub channel_capacity: usize,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            stream: "USERS".to_string(),
            consumer_prefix: "user-sync".to_string(),
            batch_size: 10,
            batch_wait: Duration::from_secs(5),
            channel_capacity: 16,
        }
    }
}

/// A live subscription: deliveries for one topic arrive on `receiver`
#[derive(Debug)]
pub struct Subscription {
    /// Unique per process instance
    pub id: String,
    pub receiver: mpsc::Receiver<Delivery>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedeliveryOutcome {
    /// The original was acked and a copy carrying `attempt` is scheduled
    Redelivered { attempt: u32 },
    /// Retries exhausted; the original was terminated and nothing is resent
    DeadLettered { attempt: u32 },
}

/// Settles processed deliveries with the broker
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait DeliverySettler: Send + Sync {
    async fn ack(&self, delivery: Delivery) -> Result<()>;

    async fn redeliver(&self, delivery: Delivery) -> Result<RedeliveryOutcome>;
}

/// Owns the broker session shared by every topic subscription.
///
/// Listener tasks pull from durable consumers and feed per-topic channels;
/// resends scheduled by [`BrokerConnector::redeliver`] run on their own tasks
/// and never block the caller.
pub struct BrokerConnector {
    consumer_client: Arc<dyn JetStreamConsumer>,
    publisher: Arc<dyn JetStreamPublisher>,
    policy: RedeliveryPolicy,
    subscriptions: SubscriptionConfig,
    listeners: TaskTracker,
    resends: TaskTracker,
}

impl BrokerConnector {
    pub fn new(
        consumer_client: Arc<dyn JetStreamConsumer>,
        publisher: Arc<dyn JetStreamPublisher>,
        policy: RedeliveryPolicy,
        subscriptions: SubscriptionConfig,
    ) -> Self {
        Self {
            consumer_client,
            publisher,
            policy,
            subscriptions,
            listeners: TaskTracker::new(),
            resends: TaskTracker::new(),
        }
    }

    /// Open the broker session and make sure the stream exists.
    pub async fn connect(
        config: &NatsConnectConfig,
        subject_prefix: &str,
        policy: RedeliveryPolicy,
        subscriptions: SubscriptionConfig,
    ) -> Result<Self> {
        let client = NatsClient::connect(config).await?;
        client
            .ensure_stream(&subscriptions.stream, subject_prefix)
            .await?;

        Ok(Self::new(
            client.create_consumer_client(),
            client.create_publisher_client(),
            policy,
            subscriptions,
        ))
    }

    /// Bind a durable, explicitly acknowledged consumer for `topic` and start
    /// forwarding its deliveries until `ctx` is cancelled.
    pub async fn subscribe(
        &self,
        topic: &str,
        subject: &str,
        ctx: CancellationToken,
    ) -> Result<Subscription> {
        let durable_name = format!("{}-{}", self.subscriptions.consumer_prefix, topic);
        let id = format!("{}-{:08x}", durable_name, rand::random::<u32>());

        let config = jetstream::consumer::pull::Config {
            name: Some(durable_name.clone()),
            durable_name: Some(durable_name.clone()),
            description: Some(id.clone()),
            filter_subject: subject.to_string(),
            ack_policy: jetstream::consumer::AckPolicy::Explicit,
            ..Default::default()
        };

        let consumer = self
            .consumer_client
            .create_consumer(config, &self.subscriptions.stream)
            .await
            .with_context(|| format!("failed to subscribe to {subject}"))?;

        let (tx, receiver) = mpsc::channel(self.subscriptions.channel_capacity.max(1));
        let batch_size = self.subscriptions.batch_size;
        let batch_wait = self.subscriptions.batch_wait;
        let subscription_id = id.clone();

        self.listeners.spawn(async move {
            debug!(subscription = %subscription_id, "listener started");
            loop {
                let batch = tokio::select! {
                    _ = ctx.cancelled() => break,
                    batch = consumer.fetch_deliveries(batch_size, batch_wait) => batch,
                };

                let deliveries = match batch {
                    Ok(deliveries) => deliveries,
                    Err(e) => {
                        warn!(subscription = %subscription_id, error = %e, "fetch failed");
                        tokio::select! {
                            _ = ctx.cancelled() => break,
                            _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                        }
                    }
                };

                for mut delivery in deliveries {
                    delivery.subscription_id = Some(subscription_id.clone());
                    if tx.send(delivery).await.is_err() {
                        debug!(subscription = %subscription_id, "receiver closed");
                        return;
                    }
                }
            }
            debug!(subscription = %subscription_id, "listener stopped");
        });

        info!(subscription = %id, subject = %subject, "subscribed");
        Ok(Subscription { id, receiver })
    }

    /// Wait for scheduled resends to be published, giving up after `timeout`
    pub async fn wait_pending_resends(&self, timeout: Duration) -> bool {
        self.resends.close();
        let drained = tokio::time::timeout(timeout, self.resends.wait())
            .await
            .is_ok();
        self.resends.reopen();
        drained
    }

    /// Best-effort teardown: drain listeners and pending resends, then flush.
    pub async fn disconnect(&self) -> Result<()> {
        info!(pending_resends = self.resends.len(), "disconnecting from broker");

        self.listeners.close();
        let grace = self.policy.delay + Duration::from_secs(5);
        if tokio::time::timeout(grace, self.listeners.wait())
            .await
            .is_err()
        {
            warn!("listeners still running at disconnect");
        }

        if !self.wait_pending_resends(grace).await {
            warn!(
                pending_resends = self.resends.len(),
                "gave up waiting for pending resends"
            );
        }

        self.publisher
            .flush()
            .await
            .context("failed to flush broker connection")?;

        info!("disconnected from broker");
        Ok(())
    }

    fn schedule_resend(&self, subject: String, payload: bytes::Bytes, attempt: u32) {
        let mut headers = HeaderMap::new();
        headers.insert(ATTEMPTS_HEADER, attempt.to_string().as_str());
        inject_trace_context(&mut headers);

        let publisher = Arc::clone(&self.publisher);
        let delay = self.policy.delay;

        self.resends.spawn(async move {
            tokio::time::sleep(delay).await;
            match publisher
                .publish_with_headers(subject.clone(), headers, payload)
                .await
            {
                Ok(()) => debug!(subject = %subject, attempt, "resent message"),
                Err(e) => error!(subject = %subject, attempt, error = %e, "failed to resend message"),
            }
        });
    }
}

#[async_trait]
impl DeliverySettler for BrokerConnector {
    async fn ack(&self, delivery: Delivery) -> Result<()> {
        if !delivery.handle.requires_ack() {
            debug!(subject = %delivery.subject, "delivery needs no ack");
            return Ok(());
        }
        delivery.handle.ack().await
    }

    async fn redeliver(&self, delivery: Delivery) -> Result<RedeliveryOutcome> {
        let attempt = delivery.attempts.saturating_add(1);

        if attempt > self.policy.max_redeliveries {
            warn!(
                subject = %delivery.subject,
                attempt,
                max_redeliveries = self.policy.max_redeliveries,
                "retries exhausted, dead-lettering message"
            );
            delivery.handle.dead_letter().await?;
            return Ok(RedeliveryOutcome::DeadLettered { attempt });
        }

        let Delivery {
            subject,
            payload,
            handle,
            ..
        } = delivery;

        if handle.requires_ack() {
            handle.ack().await?;
        }

        info!(
            subject = %subject,
            attempt,
            delay_ms = self.policy.delay.as_millis(),
            "scheduling redelivery"
        );
        self.schedule_resend(subject, payload, attempt);

        Ok(RedeliveryOutcome::Redelivered { attempt })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nats::{MockAckHandle, MockJetStreamConsumer, MockJetStreamPublisher, MockPullConsumer};
    use bytes::Bytes;

    const SUBJECT: &str = "VirtualTopic.user-remove";

    fn delivery_with_attempts(attempts: Option<u32>, handle: MockAckHandle) -> Delivery {
        let headers = attempts.map(|n| {
            let mut headers = HeaderMap::new();
            headers.insert(ATTEMPTS_HEADER, n.to_string().as_str());
            headers
        });
        Delivery::new(
            SUBJECT,
            Bytes::from_static(br#"{"id":"u1"}"#),
            headers,
            Box::new(handle),
        )
    }

    fn acking_handle() -> MockAckHandle {
        let mut handle = MockAckHandle::new();
        handle.expect_requires_ack().return_const(true);
        handle.expect_ack().times(1).returning(|| Ok(()));
        handle.expect_dead_letter().times(0);
        handle
    }

    fn dead_lettering_handle() -> MockAckHandle {
        let mut handle = MockAckHandle::new();
        handle.expect_requires_ack().return_const(true);
        handle.expect_ack().times(0);
        handle.expect_dead_letter().times(1).returning(|| Ok(()));
        handle
    }

    fn publisher_expecting(attempt: &'static str, times: usize) -> MockJetStreamPublisher {
        let mut publisher = MockJetStreamPublisher::new();
        publisher
            .expect_publish_with_headers()
            .withf(move |subject, headers, payload| {
                subject == SUBJECT
                    && headers.get(ATTEMPTS_HEADER).map(|v| v.as_str()) == Some(attempt)
                    && payload.as_ref() == br#"{"id":"u1"}"#
            })
            .times(times)
            .returning(|_, _, _| Ok(()));
        publisher.expect_flush().returning(|| Ok(()));
        publisher
    }

    fn connector(publisher: MockJetStreamPublisher) -> BrokerConnector {
        BrokerConnector::new(
            Arc::new(MockJetStreamConsumer::new()),
            Arc::new(publisher),
            RedeliveryPolicy::default(),
            SubscriptionConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_ack_settles_delivery() {
        let connector = connector(MockJetStreamPublisher::new());

        let result = connector.ack(delivery_with_attempts(None, acking_handle())).await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_ack_is_noop_without_reply_subject() {
        let connector = connector(MockJetStreamPublisher::new());
        let mut handle = MockAckHandle::new();
        handle.expect_requires_ack().return_const(false);
        handle.expect_ack().times(0);

        let result = connector.ack(delivery_with_attempts(None, handle)).await;

        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_failure_resends_with_attempt_two() {
        let connector = connector(publisher_expecting("2", 1));

        let outcome = connector
            .redeliver(delivery_with_attempts(None, acking_handle()))
            .await
            .unwrap();

        assert_eq!(outcome, RedeliveryOutcome::Redelivered { attempt: 2 });
        assert!(connector.disconnect().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resend_waits_for_delay() {
        let connector = connector(publisher_expecting("4", 1));

        connector
            .redeliver(delivery_with_attempts(Some(3), acking_handle()))
            .await
            .unwrap();

        // Nothing published before the delay elapses
        assert!(!connector.wait_pending_resends(Duration::from_millis(999)).await);
        assert!(connector.wait_pending_resends(Duration::from_millis(10)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tenth_attempt_is_still_resent() {
        let connector = connector(publisher_expecting("10", 1));

        let outcome = connector
            .redeliver(delivery_with_attempts(Some(9), acking_handle()))
            .await
            .unwrap();

        assert_eq!(outcome, RedeliveryOutcome::Redelivered { attempt: 10 });
        assert!(connector.disconnect().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_eleventh_attempt_is_dead_lettered_not_resent() {
        let connector = connector(publisher_expecting("11", 0));

        let outcome = connector
            .redeliver(delivery_with_attempts(Some(10), dead_lettering_handle()))
            .await
            .unwrap();

        assert_eq!(outcome, RedeliveryOutcome::DeadLettered { attempt: 11 });
        assert!(connector.disconnect().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_ack_does_not_resend() {
        let connector = connector(publisher_expecting("2", 0));
        let mut handle = MockAckHandle::new();
        handle.expect_requires_ack().return_const(true);
        handle
            .expect_ack()
            .times(1)
            .returning(|| Err(anyhow::anyhow!("connection closed")));

        let result = connector
            .redeliver(delivery_with_attempts(None, handle))
            .await;

        assert!(result.is_err());
        assert!(connector.disconnect().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_binds_durable_consumer_and_forwards_deliveries() {
        let mut consumer_client = MockJetStreamConsumer::new();
        consumer_client
            .expect_create_consumer()
            .withf(|config, stream| {
                stream == "USERS"
                    && config.durable_name.as_deref() == Some("user-sync-user-remove")
                    && config.filter_subject == SUBJECT
                    && config.ack_policy == jetstream::consumer::AckPolicy::Explicit
                    && config
                        .description
                        .as_deref()
                        .is_some_and(|d| d.starts_with("user-sync-user-remove-"))
            })
            .times(1)
            .returning(|_, _| {
                let mut pull = MockPullConsumer::new();
                let mut served = false;
                pull.expect_fetch_deliveries().returning(move |_, _| {
                    if served {
                        return Err(anyhow::anyhow!("no messages"));
                    }
                    served = true;
                    let mut handle = MockAckHandle::new();
                    handle.expect_requires_ack().return_const(true);
                    Ok(vec![delivery_with_attempts(Some(2), handle)])
                });
                Ok(Box::new(pull))
            });

        let mut publisher = MockJetStreamPublisher::new();
        publisher.expect_flush().returning(|| Ok(()));

        let connector = BrokerConnector::new(
            Arc::new(consumer_client),
            Arc::new(publisher),
            RedeliveryPolicy::default(),
            SubscriptionConfig::default(),
        );
        let ctx = CancellationToken::new();

        let mut subscription = connector
            .subscribe("user-remove", SUBJECT, ctx.clone())
            .await
            .unwrap();

        assert!(subscription.id.starts_with("user-sync-user-remove-"));
        assert_eq!(subscription.id.len(), "user-sync-user-remove-".len() + 8);

        let delivery = subscription.receiver.recv().await.unwrap();
        assert_eq!(delivery.attempts, 2);
        assert_eq!(delivery.subject, SUBJECT);
        assert_eq!(delivery.subscription_id.as_deref(), Some(subscription.id.as_str()));

        ctx.cancel();
        assert!(connector.disconnect().await.is_ok());
    }

    #[tokio::test]
    async fn test_subscription_ids_are_unique() {
        let mut consumer_client = MockJetStreamConsumer::new();
        consumer_client.expect_create_consumer().returning(|_, _| {
            let mut pull = MockPullConsumer::new();
            pull.expect_fetch_deliveries()
                .returning(|_, _| Err(anyhow::anyhow!("no messages")));
            Ok(Box::new(pull))
        });

        let connector = BrokerConnector::new(
            Arc::new(consumer_client),
            Arc::new(MockJetStreamPublisher::new()),
            RedeliveryPolicy::default(),
            SubscriptionConfig::default(),
        );
        let ctx = CancellationToken::new();

        let first = connector.subscribe("user-create", "a", ctx.clone()).await.unwrap();
        let second = connector.subscribe("user-create", "a", ctx.clone()).await.unwrap();
        ctx.cancel();

        assert_ne!(first.id, second.id);
    }
}
