use crate::domain::Topic;
use async_nats::HeaderMap;
use bytes::Bytes;
use common::nats::Delivery;

/// One delivery, owned, as it travels through the consumer service stack
#[derive(Debug, Clone)]
pub struct ConsumeRequest {
    pub topic: Topic,
    pub subject: String,
    pub payload: Bytes,
    /// Delivery attempt, starting at 1
    pub attempts: u32,
    /// Carries the trace context of the publisher
    pub headers: Option<HeaderMap>,
    /// Subscription the delivery arrived on, when it came from the broker
    pub subscription_id: Option<String>,
}

impl ConsumeRequest {
    pub fn from_delivery(topic: Topic, delivery: &Delivery) -> Self {
        Self {
            topic,
            subject: delivery.subject.clone(),
            payload: delivery.payload.clone(),
            attempts: delivery.attempts,
            headers: delivery.headers.clone(),
            subscription_id: delivery.subscription_id.clone(),
        }
    }
}

/// What the broker should do with the delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeResponse {
    /// Done with it, successfully or as a poison message
    Ack,
    /// Processing failed transiently; retry later
    Redeliver(String),
}

impl ConsumeResponse {
    pub fn redeliver(reason: impl Into<String>) -> Self {
        Self::Redeliver(reason.into())
    }
}
