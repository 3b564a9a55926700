//! Registry event notifications
//!
//! Requests never block on endpoint delivery: events go into a bounded queue
//! and a worker drains it, posting to each configured endpoint with
//! exponential backoff. When the queue is full the event is dropped and
//! counted; saturation never back-pressures the request path.

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::descriptor::Descriptor;

/// What happened to a target in a repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventAction {
    Push,
    Pull,
    Delete,
    Mount,
}

/// One registry event
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub action: EventAction,
    pub repository: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<Descriptor>,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(action: EventAction, repository: impl Into<String>, target: Option<Descriptor>) -> Self {
        Self {
            action,
            repository: repository.into(),
            target,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    events: [&'a Event; 1],
}

/// A notification endpoint
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub name: String,
    pub url: String,
    /// Per-request delivery timeout
    pub timeout: Duration,
    /// Delivery attempts before the event is abandoned for this endpoint
    pub threshold: u32,
    /// Initial backoff, doubled per retry
    pub backoff: Duration,
}

/// Non-blocking producer handle given to request handlers
#[derive(Clone)]
pub struct Broadcaster {
    tx: mpsc::Sender<Event>,
}

impl Broadcaster {
    /// Build the broadcaster and the receiver its worker drains
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Enqueue an event; a saturated queue drops it with a metric.
    pub fn dispatch(&self, event: Event) {
        if let Err(e) = self.tx.try_send(event) {
            counter!("drydock_events_dropped_total").increment(1);
            warn!("event queue saturated, dropping event: {}", e);
        }
    }
}

/// Drain the queue, delivering each event to every endpoint.
pub fn spawn_delivery_worker(
    mut rx: mpsc::Receiver<Event>,
    endpoints: Vec<Endpoint>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let client = reqwest::Client::new();
        while let Some(event) = rx.recv().await {
            for endpoint in &endpoints {
                deliver(&client, endpoint, &event).await;
            }
        }
        debug!("event delivery worker stopped");
    })
}

async fn deliver(client: &reqwest::Client, endpoint: &Endpoint, event: &Event) {
    let mut backoff = endpoint.backoff;
    for attempt in 1..=endpoint.threshold.max(1) {
        let result = client
            .post(&endpoint.url)
            .timeout(endpoint.timeout)
            .json(&Envelope { events: [event] })
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                counter!("drydock_events_delivered_total", "endpoint" => endpoint.name.clone())
                    .increment(1);
                return;
            }
            Ok(response) => warn!(
                "endpoint {} returned {} (attempt {}/{})",
                endpoint.name,
                response.status(),
                attempt,
                endpoint.threshold
            ),
            Err(e) => warn!(
                "delivery to {} failed (attempt {}/{}): {}",
                endpoint.name, attempt, endpoint.threshold, e
            ),
        }
        if attempt < endpoint.threshold {
            tokio::time::sleep(backoff).await;
            backoff *= 2;
        }
    }
    counter!("drydock_events_failed_total", "endpoint" => endpoint.name.clone()).increment(1);
}
