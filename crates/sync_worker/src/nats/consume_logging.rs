use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use crate::domain::Topic;
use crate::nats::{ConsumeRequest, ConsumeResponse};
use tower::{Layer, Service};
use tracing::{error, info, warn, Instrument, Span};

/// Tower layer that logs how each user event was settled: the topic and
/// subscription it came from, the attempt, and why it is being retried.
#[derive(Clone, Default)]
pub struct ConsumeLoggingLayer;

impl ConsumeLoggingLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for ConsumeLoggingLayer {
    type Service = ConsumeLoggingService<S>;

    fn layer(&self, service: S) -> Self::Service {
        ConsumeLoggingService { inner: service }
    }
}

#[derive(Clone)]
pub struct ConsumeLoggingService<S> {
    inner: S,
}

/// What the log line reports for a handled delivery
#[derive(Debug, PartialEq, Eq)]
enum Settlement {
    Acked,
    Retry(String),
    Failed(String),
}

impl Settlement {
    fn of<E: Display>(result: &Result<ConsumeResponse, E>) -> Self {
        match result {
            Ok(ConsumeResponse::Ack) => Self::Acked,
            Ok(ConsumeResponse::Redeliver(reason)) => Self::Retry(reason.clone()),
            // The dispatcher redelivers on service errors too
            Err(e) => Self::Failed(e.to_string()),
        }
    }
}

/// Request fields captured before the request moves into the inner service
struct EventContext {
    topic: Topic,
    subscription: String,
    attempt: u32,
    payload_bytes: usize,
}

impl EventContext {
    fn capture(req: &ConsumeRequest) -> Self {
        Self {
            topic: req.topic,
            subscription: req
                .subscription_id
                .clone()
                .unwrap_or_else(|| "-".to_string()),
            attempt: req.attempts,
            payload_bytes: req.payload.len(),
        }
    }

    fn log(&self, settlement: &Settlement, duration_ms: u128) {
        let topic = self.topic.name();
        let action = self.topic.action();
        match settlement {
            Settlement::Acked if self.attempt > 1 => info!(
                topic,
                action = ?action,
                subscription = %self.subscription,
                attempt = self.attempt,
                payload_bytes = self.payload_bytes,
                duration_ms = %duration_ms,
                "{topic} event settled on attempt {}", self.attempt
            ),
            Settlement::Acked => info!(
                topic,
                action = ?action,
                subscription = %self.subscription,
                attempt = self.attempt,
                payload_bytes = self.payload_bytes,
                duration_ms = %duration_ms,
                "{topic} event settled in {duration_ms}ms"
            ),
            Settlement::Retry(reason) => warn!(
                topic,
                action = ?action,
                subscription = %self.subscription,
                attempt = self.attempt,
                reason = %reason,
                duration_ms = %duration_ms,
                "{topic} event will be retried: {reason}"
            ),
            Settlement::Failed(e) => error!(
                topic,
                action = ?action,
                subscription = %self.subscription,
                attempt = self.attempt,
                error = %e,
                duration_ms = %duration_ms,
                "{topic} event failed: {e}"
            ),
        }
    }
}

impl<S> Service<ConsumeRequest> for ConsumeLoggingService<S>
where
    S: Service<ConsumeRequest, Response = ConsumeResponse> + Clone + Send + 'static,
    S::Error: Display + Send,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: ConsumeRequest) -> Self::Future {
        let event = EventContext::capture(&req);
        let start = Instant::now();
        let mut inner = self.inner.clone();

        Box::pin(
            async move {
                let result = inner.call(req).await;
                event.log(&Settlement::of(&result), start.elapsed().as_millis());
                result
            }
            .instrument(Span::current()),
        )
    }
}
