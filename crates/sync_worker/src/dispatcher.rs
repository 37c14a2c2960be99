use crate::domain::Topic;
use crate::nats::{ConsumeRequest, ConsumeResponse};
use common::nats::{set_parent_from_headers, Delivery, DeliverySettler, RedeliveryOutcome};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{StreamExt, StreamMap};
use tokio_util::sync::CancellationToken;
use tower::{Service, ServiceExt};
use tracing::{debug, error, info, info_span, Instrument};

/// How a delivery was settled with the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Acked,
    Redelivered { attempt: u32 },
    DeadLettered { attempt: u32 },
    /// The broker rejected the ack or redelivery; the server will redeliver
    /// on its own once the ack wait expires
    SettleFailed,
}

/// Routes deliveries from every subscribed topic through one service stack.
///
/// Deliveries are handled one at a time, in arrival order per topic. Each is
/// settled before the next one is pulled.
pub struct Dispatcher<S> {
    topics: StreamMap<Topic, ReceiverStream<Delivery>>,
    service: S,
    settler: Arc<dyn DeliverySettler>,
}

impl<S> Dispatcher<S>
where
    S: Service<ConsumeRequest, Response = ConsumeResponse, Error = anyhow::Error> + Send,
    S::Future: Send,
{
    pub fn new(service: S, settler: Arc<dyn DeliverySettler>) -> Self {
        Self {
            topics: StreamMap::new(),
            service,
            settler,
        }
    }

    pub fn add_topic(&mut self, topic: Topic, receiver: mpsc::Receiver<Delivery>) {
        self.topics.insert(topic, ReceiverStream::new(receiver));
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    /// Dispatch until cancelled or until every topic channel has closed
    pub async fn run(mut self, ctx: CancellationToken) -> anyhow::Result<()> {
        info!(topics = self.topics.len(), "dispatcher started");

        loop {
            let next = tokio::select! {
                biased;
                _ = ctx.cancelled() => {
                    info!("received shutdown signal, stopping dispatcher");
                    break;
                }
                next = self.topics.next() => next,
            };

            let Some((topic, delivery)) = next else {
                info!("all subscriptions closed, stopping dispatcher");
                break;
            };

            let outcome = self.dispatch_one(topic, delivery).await;
            debug!(topic = %topic, outcome = ?outcome, "delivery settled");
        }

        Ok(())
    }

    /// Run one delivery through the service and settle it with the broker
    pub async fn dispatch_one(&mut self, topic: Topic, delivery: Delivery) -> DispatchOutcome {
        let span = info_span!(
            "dispatch",
            topic = %topic,
            subject = %delivery.subject,
            attempt = delivery.attempts
        );
        self.dispatch_inner(topic, delivery).instrument(span).await
    }

    async fn dispatch_inner(&mut self, topic: Topic, delivery: Delivery) -> DispatchOutcome {
        set_parent_from_headers(delivery.headers.as_ref());

        let request = ConsumeRequest::from_delivery(topic, &delivery);
        let response = match self.service.ready().await {
            Ok(service) => service.call(request).await,
            Err(e) => Err(e),
        };
        let response = response.unwrap_or_else(|e| {
            error!(error = %e, "service error processing delivery");
            ConsumeResponse::redeliver(e.to_string())
        });

        match response {
            ConsumeResponse::Ack => match self.settler.ack(delivery).await {
                Ok(()) => DispatchOutcome::Acked,
                Err(e) => {
                    error!(error = %e, "failed to acknowledge delivery");
                    DispatchOutcome::SettleFailed
                }
            },
            ConsumeResponse::Redeliver(_) => match self.settler.redeliver(delivery).await {
                Ok(RedeliveryOutcome::Redelivered { attempt }) => {
                    DispatchOutcome::Redelivered { attempt }
                }
                Ok(RedeliveryOutcome::DeadLettered { attempt }) => {
                    DispatchOutcome::DeadLettered { attempt }
                }
                Err(e) => {
                    error!(error = %e, "failed to schedule redelivery");
                    DispatchOutcome::SettleFailed
                }
            },
        }
    }
}
