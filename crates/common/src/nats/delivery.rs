use anyhow::Result;
use async_nats::jetstream::{self, AckKind};
use async_nats::HeaderMap;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;

/// Header carrying the delivery attempt of a resent message
pub const ATTEMPTS_HEADER: &str = "attempts";

/// Attempt number used when a message carries no (or an unreadable) attempts header
pub const FIRST_ATTEMPT: u32 = 1;

/// Settles one delivery with the broker
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait AckHandle: Send + Sync {
    /// False for messages published without a reply subject (nothing to settle)
    fn requires_ack(&self) -> bool;

    /// Remove the delivery from the consumer's pending set
    async fn ack(&self) -> Result<()>;

    /// Terminally reject the delivery; the server will not redeliver it
    async fn dead_letter(&self) -> Result<()>;
}

/// One hand-off of a message to this consumer
pub struct Delivery {
    pub subject: String,
    pub payload: Bytes,
    pub headers: Option<HeaderMap>,
    /// Redelivery attempt, starting at 1
    pub attempts: u32,
    /// Set by the listener of the subscription that received it
    pub subscription_id: Option<String>,
    pub handle: Box<dyn AckHandle>,
}

impl Delivery {
    pub fn new(
        subject: impl Into<String>,
        payload: Bytes,
        headers: Option<HeaderMap>,
        handle: Box<dyn AckHandle>,
    ) -> Self {
        let attempts = attempts_from_headers(headers.as_ref());
        Self {
            subject: subject.into(),
            payload,
            headers,
            attempts,
            subscription_id: None,
            handle,
        }
    }

    pub fn from_jetstream(message: jetstream::Message) -> Self {
        let subject = message.subject.to_string();
        let payload = message.payload.clone();
        let headers = message.headers.clone();
        Self::new(subject, payload, headers, Box::new(NatsAckHandle { message }))
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("subject", &self.subject)
            .field("payload_bytes", &self.payload.len())
            .field("attempts", &self.attempts)
            .field("subscription_id", &self.subscription_id)
            .finish_non_exhaustive()
    }
}

/// Read the attempt counter from message headers, defaulting to the first attempt
pub fn attempts_from_headers(headers: Option<&HeaderMap>) -> u32 {
    headers
        .and_then(|h| h.get(ATTEMPTS_HEADER))
        .and_then(|value| value.as_str().trim().parse::<u32>().ok())
        .filter(|attempts| *attempts >= FIRST_ATTEMPT)
        .unwrap_or(FIRST_ATTEMPT)
}

/// AckHandle backed by a JetStream message
struct NatsAckHandle {
    message: jetstream::Message,
}

#[async_trait]
impl AckHandle for NatsAckHandle {
    fn requires_ack(&self) -> bool {
        self.message.reply.is_some()
    }

    async fn ack(&self) -> Result<()> {
        self.message
            .ack()
            .await
            .map_err(|e| anyhow::anyhow!("failed to acknowledge message: {e}"))
    }

    async fn dead_letter(&self) -> Result<()> {
        self.message
            .ack_with(AckKind::Term)
            .await
            .map_err(|e| anyhow::anyhow!("failed to terminate message: {e}"))
    }
}
