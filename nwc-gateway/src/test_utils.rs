use std::{
    sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use futures::StreamExt;
use nostr::{Event, EventBuilder, EventId, Filter, Keys, Kind, PublicKey, Tag};
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::{
    envelope::{Encryption, Envelope},
    nip47::{self, NwcNotificationPayload, NwcResponsePayload},
    transport::{EventStream, Transport},
};

/// How long [`MemoryTransport::next_published`] waits before panicking.
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// An in-memory [`Transport`]. Tests inject inbound events and read back
/// whatever the gateway published.
pub struct MemoryTransport {
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<Event>>>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    published_tx: mpsc::UnboundedSender<Event>,
    published_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Event>>,
    published: Mutex<Vec<Event>>,
    filters: Mutex<Vec<Filter>>,
    connected: AtomicBool,
}

impl MemoryTransport {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (published_tx, published_rx) = mpsc::unbounded_channel();
        Self {
            inbound_tx: Mutex::new(Some(inbound_tx)),
            inbound_rx: Mutex::new(Some(inbound_rx)),
            published_tx,
            published_rx: tokio::sync::Mutex::new(published_rx),
            published: Mutex::new(Vec::new()),
            filters: Mutex::new(Vec::new()),
            connected: AtomicBool::new(false),
        }
    }

    /// Deliver an event as if it came from the relay.
    pub fn inject(&self, event: Event) {
        let inbound_tx = self.inbound_tx.lock().unwrap();
        inbound_tx
            .as_ref()
            .expect("Inbound stream was closed")
            .send(event)
            .expect("Nobody subscribed");
    }

    /// End the inbound event stream, as if the relay went away for good.
    pub fn close_inbound(&self) {
        self.inbound_tx.lock().unwrap().take();
    }

    /// The next event published after the previous call, in publish order.
    pub async fn next_published(&self) -> Event {
        let mut published_rx = self.published_rx.lock().await;
        tokio::time::timeout(PUBLISH_TIMEOUT, published_rx.recv())
            .await
            .expect("Timed out waiting for a published event")
            .expect("Channel closed")
    }

    /// Everything published so far.
    pub fn published(&self) -> Vec<Event> {
        self.published.lock().unwrap().clone()
    }

    pub fn filters(&self) -> Vec<Filter> {
        self.filters.lock().unwrap().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> anyhow::Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, event: Event) -> anyhow::Result<EventId> {
        let id = event.id;
        self.published.lock().unwrap().push(event.clone());
        self.published_tx
            .send(event)
            .ok()
            .context("Test dropped the publish channel")?;
        Ok(id)
    }

    async fn subscribe(&self, filter: Filter) -> anyhow::Result<EventStream> {
        self.filters.lock().unwrap().push(filter);
        let inbound_rx = self
            .inbound_rx
            .lock()
            .unwrap()
            .take()
            .context("Already subscribed")?;
        let events =
            futures::stream::unfold(inbound_rx, |mut inbound_rx| async move {
                let event = inbound_rx.recv().await?;
                Some((event, inbound_rx))
            });
        Ok(events.boxed())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

/// A Wallet Connect client app, for building requests and reading responses.
pub struct TestClient {
    envelope: Envelope,
    service_pk: PublicKey,
}

impl TestClient {
    pub fn new(service_pk: PublicKey) -> Self {
        Self::with_keys(Keys::generate(), service_pk)
    }

    pub fn with_keys(keys: Keys, service_pk: PublicKey) -> Self {
        Self {
            envelope: Envelope::new(keys),
            service_pk,
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.envelope.public_key()
    }

    /// A NIP-44 encrypted request.
    pub fn request(&self, method: &str, params: Value) -> Event {
        let payload = json!({ "method": method, "params": params });
        self.request_raw(&payload.to_string(), Encryption::Nip44)
    }

    /// A NIP-04 encrypted request.
    pub fn request_nip04(&self, method: &str, params: Value) -> Event {
        let payload = json!({ "method": method, "params": params });
        self.request_raw(&payload.to_string(), Encryption::Nip04)
    }

    /// A request with an arbitrary plaintext payload.
    pub fn request_raw(
        &self,
        plaintext: &str,
        encryption: Encryption,
    ) -> Event {
        let content = self
            .envelope
            .encrypt(&self.service_pk, plaintext, encryption)
            .expect("Failed to encrypt");
        self.signed(nip47::REQUEST_KIND, content)
    }

    /// A request event whose content isn't encrypted to the service at all.
    pub fn request_undecryptable(&self) -> Event {
        self.signed(nip47::REQUEST_KIND, "bm90IGVuY3J5cHRlZA==".to_owned())
    }

    /// Decrypt and parse a response event.
    pub fn response(&self, event: &Event) -> NwcResponsePayload {
        assert_eq!(event.kind, Kind::from_u16(nip47::RESPONSE_KIND));
        serde_json::from_str(&self.decrypt(event)).expect("Bad response JSON")
    }

    /// Decrypt and parse a notification event.
    pub fn notification(&self, event: &Event) -> NwcNotificationPayload {
        serde_json::from_str(&self.decrypt(event))
            .expect("Bad notification JSON")
    }

    /// Decrypt an event from the service, checking it was addressed to us.
    pub fn decrypt(&self, event: &Event) -> String {
        assert_eq!(event.pubkey, self.service_pk);
        let recipient = tag_value(event, "p").expect("No p tag");
        assert_eq!(recipient, self.public_key().to_hex());
        let (plaintext, _) = self
            .envelope
            .decrypt(&event.pubkey, &event.content)
            .expect("Failed to decrypt");
        plaintext
    }

    fn signed(&self, kind: u16, content: String) -> Event {
        let builder = EventBuilder::new(Kind::from_u16(kind), content)
            .tag(Tag::public_key(self.service_pk));
        self.envelope.sign(builder).expect("Failed to sign")
    }
}

/// The first value of the first tag named `name`.
pub fn tag_value(event: &Event, name: &str) -> Option<String> {
    event
        .tags
        .iter()
        .map(|tag| tag.as_slice())
        .find(|tag| tag.first().map(String::as_str) == Some(name))
        .and_then(|tag| tag.get(1).cloned())
}
