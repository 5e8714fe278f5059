use anyhow::Context;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use nostr::{Event, EventId, Filter, Keys};
use nostr_sdk::{Client, RelayPoolNotification};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

/// Inbound events matching a subscription, in arrival order.
pub type EventStream = BoxStream<'static, Event>;

/// Publishes signed events to a relay and streams back the events matching a
/// subscription. Wire framing is up to the implementation.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Establish the relay connection.
    async fn connect(&self) -> anyhow::Result<()>;

    /// Publish a signed event.
    async fn publish(&self, event: Event) -> anyhow::Result<EventId>;

    /// Register `filter` with the relay. The stream ends when the connection
    /// is gone for good.
    async fn subscribe(&self, filter: Filter) -> anyhow::Result<EventStream>;

    /// Close the relay connection.
    async fn disconnect(&self) {}
}

/// A [`Transport`] over a single read+write relay, via [`nostr_sdk::Client`].
pub struct RelayTransport {
    client: Client,
    relay_url: String,
}

impl RelayTransport {
    pub fn new(keys: Keys, relay_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(keys),
            relay_url: relay_url.into(),
        }
    }

    pub fn relay_url(&self) -> &str {
        &self.relay_url
    }
}

#[async_trait]
impl Transport for RelayTransport {
    async fn connect(&self) -> anyhow::Result<()> {
        self.client
            .add_relay(self.relay_url.as_str())
            .await
            .with_context(|| format!("Invalid relay url: {}", self.relay_url))?;
        self.client.connect().await;
        info!(relay = %self.relay_url, "Connecting to relay");
        Ok(())
    }

    async fn publish(&self, event: Event) -> anyhow::Result<EventId> {
        let id = event.id;
        self.client
            .send_event(&event)
            .await
            .with_context(|| format!("Failed to publish event {id}"))?;
        debug!(%id, kind = %event.kind, "Published event");
        Ok(id)
    }

    async fn subscribe(&self, filter: Filter) -> anyhow::Result<EventStream> {
        // Listen before sending the REQ so that no early event slips through.
        let notifications = self.client.notifications();
        self.client
            .subscribe(filter, None)
            .await
            .context("Failed to subscribe")?;

        let events = futures::stream::unfold(notifications, next_event);
        Ok(events.boxed())
    }

    async fn disconnect(&self) {
        #[allow(clippy::let_unit_value)]
        let _ = self.client.shutdown().await;
    }
}

/// Next relay event out of the pool's notification channel.
async fn next_event(
    mut rx: broadcast::Receiver<RelayPoolNotification>,
) -> Option<(Event, broadcast::Receiver<RelayPoolNotification>)> {
    loop {
        match rx.recv().await {
            Ok(RelayPoolNotification::Event { event, .. }) =>
                return Some((*event, rx)),
            Ok(_) => continue,
            Err(RecvError::Lagged(skipped)) => {
                warn!(%skipped, "Relay notifications lagged");
                continue;
            }
            Err(RecvError::Closed) => return None,
        }
    }
}
