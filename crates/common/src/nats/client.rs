use crate::nats::traits::{JetStreamConsumer, JetStreamPublisher, PullConsumer};
use crate::nats::Delivery;
use anyhow::{Context, Result};
use async_nats::jetstream::{self, stream::Config as StreamConfig};
use async_nats::HeaderMap;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument};

/// Connection settings for the broker
#[derive(Debug, Clone)]
pub struct NatsConnectConfig {
    pub url: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub connection_timeout: Duration,
}

pub struct NatsClient {
    client: async_nats::Client,
    jetstream: jetstream::Context,
}

impl NatsClient {
    /// Establish one authenticated session. Callers treat failure as fatal.
    pub async fn connect(config: &NatsConnectConfig) -> Result<Self> {
        info!(
            url = %config.url,
            timeout_ms = config.connection_timeout.as_millis(),
            authenticated = config.user.is_some(),
            "connecting to NATS"
        );

        let options = match (&config.user, &config.password) {
            (Some(user), Some(password)) => {
                async_nats::ConnectOptions::with_user_and_password(user.clone(), password.clone())
            }
            _ => async_nats::ConnectOptions::new(),
        };

        let client = options
            .name("user-sync")
            .connection_timeout(config.connection_timeout)
            .connect(config.url.as_str())
            .await
            .context("failed to connect to NATS")?;

        let jetstream = jetstream::new(client.clone());

        info!("connected to NATS");
        Ok(Self { client, jetstream })
    }

    /// Create the stream capturing `<subject_prefix>.*` unless it already exists
    pub async fn ensure_stream(&self, stream_name: &str, subject_prefix: &str) -> Result<()> {
        info!(stream = %stream_name, subject_prefix = %subject_prefix, "ensuring stream exists");

        match self.jetstream.get_stream(stream_name).await {
            Ok(_) => {
                info!(stream = %stream_name, "stream already exists");
            }
            Err(_) => {
                self.jetstream
                    .create_stream(StreamConfig {
                        name: stream_name.to_string(),
                        subjects: vec![format!("{}.*", subject_prefix)],
                        description: Some("User lifecycle events".to_string()),
                        ..Default::default()
                    })
                    .await
                    .context("failed to create stream")?;
                info!(stream = %stream_name, "created stream");
            }
        }

        Ok(())
    }

    pub fn create_consumer_client(&self) -> Arc<dyn JetStreamConsumer> {
        Arc::new(NatsJetStreamConsumer::new(self.jetstream.clone()))
    }

    pub fn create_publisher_client(&self) -> Arc<dyn JetStreamPublisher> {
        Arc::new(NatsJetStreamPublisher::new(
            self.client.clone(),
            self.jetstream.clone(),
        ))
    }
}

/// Concrete implementation of JetStreamConsumer using async-nats
pub struct NatsJetStreamConsumer {
    context: jetstream::Context,
}

impl NatsJetStreamConsumer {
    pub fn new(context: jetstream::Context) -> Self {
        Self { context }
    }
}

#[async_trait]
impl JetStreamConsumer for NatsJetStreamConsumer {
    async fn create_consumer(
        &self,
        config: jetstream::consumer::pull::Config,
        stream_name: &str,
    ) -> Result<Box<dyn PullConsumer>> {
        let consumer = self
            .context
            .create_consumer_on_stream(config, stream_name)
            .await
            .context("failed to create consumer")?;

        Ok(Box::new(NatsPullConsumer { consumer }))
    }
}

/// Concrete implementation of PullConsumer using async-nats
pub struct NatsPullConsumer {
    consumer: jetstream::consumer::PullConsumer,
}

#[async_trait]
impl PullConsumer for NatsPullConsumer {
    async fn fetch_deliveries(
        &self,
        max_messages: usize,
        expires: Duration,
    ) -> Result<Vec<Delivery>> {
        use futures::StreamExt;

        let mut messages = self
            .consumer
            .fetch()
            .max_messages(max_messages)
            .expires(expires)
            .messages()
            .await
            .context("failed to fetch messages")?;

        let mut deliveries = Vec::new();
        while let Some(message) = messages.next().await {
            match message {
                Ok(message) => deliveries.push(Delivery::from_jetstream(message)),
                Err(e) => {
                    error!(error = %e, "error receiving message");
                }
            }
        }
        Ok(deliveries)
    }
}

/// Concrete implementation of JetStreamPublisher using async-nats
pub struct NatsJetStreamPublisher {
    client: async_nats::Client,
    context: jetstream::Context,
}

impl NatsJetStreamPublisher {
    pub fn new(client: async_nats::Client, context: jetstream::Context) -> Self {
        Self { client, context }
    }
}

#[async_trait]
impl JetStreamPublisher for NatsJetStreamPublisher {
    #[instrument(skip(self, headers, payload), fields(subject = %subject, payload_size = payload.len()))]
    async fn publish_with_headers(
        &self,
        subject: String,
        headers: HeaderMap,
        payload: bytes::Bytes,
    ) -> Result<()> {
        let ack = self
            .context
            .publish_with_headers(subject, headers, payload)
            .await
            .context("failed to publish message to JetStream")?;

        ack.await
            .context("failed to receive JetStream acknowledgment")?;
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.client
            .flush()
            .await
            .context("failed to flush NATS connection")?;
        Ok(())
    }
}
