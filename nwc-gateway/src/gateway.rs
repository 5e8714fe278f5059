use std::{borrow::Cow, sync::Arc};

use anyhow::Context;
use bridge_tokio::{notify_once::NotifyOnce, task::Task};
use futures::StreamExt;
use nostr::{
    Event, EventBuilder, EventId, Filter, Kind, PublicKey, Tag, TagKind,
    Timestamp,
};
use payments_client::PaymentsClient;
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, info, info_span, instrument, warn};

use crate::{
    balance::BalanceSource,
    config::GatewayConfig,
    envelope::{Encryption, Envelope},
    handlers::{self, RequestContext},
    nip47::{
        self, ERROR_RESULT_TYPE, NotificationType, NwcError, NwcMethod,
        NwcNotificationPayload, NwcRequestPayload, NwcResponsePayload,
    },
    transport::{EventStream, Transport},
};

/// The Wallet Connect service: answers encrypted NIP-47 requests arriving
/// over a [`Transport`] using the payments backend.
///
/// Cheap to clone; each in-flight request holds a clone.
#[derive(Clone)]
pub struct Gateway {
    payments: PaymentsClient,
    envelope: Arc<Envelope>,
    transport: Arc<dyn Transport>,
    balance: Arc<dyn BalanceSource>,
    config: Arc<GatewayConfig>,
    /// Bounds the number of requests handled at once.
    in_flight: Arc<Semaphore>,
}

impl Gateway {
    pub fn new(
        payments: PaymentsClient,
        envelope: Envelope,
        transport: Arc<dyn Transport>,
        balance: Arc<dyn BalanceSource>,
        config: GatewayConfig,
    ) -> Self {
        let in_flight = Arc::new(Semaphore::new(config.max_in_flight.max(1)));
        Self {
            payments,
            envelope: Arc::new(envelope),
            transport,
            balance,
            config: Arc::new(config),
            in_flight,
        }
    }

    /// The wallet service pubkey, which clients address requests to.
    #[inline]
    pub fn public_key(&self) -> PublicKey {
        self.envelope.public_key()
    }

    #[inline]
    pub(crate) fn payments(&self) -> &PaymentsClient {
        &self.payments
    }

    #[inline]
    pub(crate) fn balance(&self) -> &dyn BalanceSource {
        self.balance.as_ref()
    }

    #[inline]
    pub(crate) fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Connect, announce our capabilities, and subscribe to requests.
    /// The returned stream is meant for [`Gateway::serve`].
    pub async fn start(&self) -> anyhow::Result<EventStream> {
        self.transport
            .connect()
            .await
            .context("Failed to connect to relay")?;
        self.announce().await.context("Failed to announce")?;
        self.subscribe().await.context("Failed to subscribe")
    }

    /// Publish the (unencrypted) info event listing the supported methods
    /// and notification types.
    pub async fn announce(&self) -> anyhow::Result<EventId> {
        let methods = NwcMethod::supported_names().join(" ");
        let notifications = NotificationType::all_names().join(" ");
        let kind = Kind::from_u16(nip47::INFO_KIND);
        let builder = EventBuilder::new(kind, methods)
            .tag(custom_tag("notifications", notifications))
            .tag(custom_tag("encryption", Encryption::ADVERTISED));
        let event = self.envelope.sign(builder)?;
        let id = self.transport.publish(event).await?;
        info!(%id, "Announced wallet service");
        Ok(id)
    }

    /// Subscribe to requests addressed to us from now on.
    pub async fn subscribe(&self) -> anyhow::Result<EventStream> {
        let filter = Filter::new()
            .kind(Kind::from_u16(nip47::REQUEST_KIND))
            .pubkey(self.public_key())
            .since(Timestamp::now());
        self.transport.subscribe(filter).await
    }

    /// Handle inbound requests until shutdown or until the stream ends.
    ///
    /// Each request is handled in its own ephemeral task, so a slow payment
    /// doesn't hold up other requests. At most `max_in_flight` requests are
    /// handled at once; beyond that we stop pulling from the stream.
    pub async fn serve(
        self,
        mut events: EventStream,
        mut shutdown: NotifyOnce,
        eph_tasks_tx: mpsc::Sender<Task<()>>,
    ) {
        info!(pubkey = %self.public_key(), "Serving wallet connect requests");

        loop {
            let event = tokio::select! {
                () = shutdown.recv() => break,
                maybe_event = events.next() => match maybe_event {
                    Some(event) => event,
                    None => {
                        warn!("Relay event stream ended");
                        break;
                    }
                },
            };

            let in_flight = self.in_flight.clone();
            let permit = tokio::select! {
                () = shutdown.recv() => break,
                permit = in_flight.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let name = format!("nwc-request-{}", short_id(&event.id));
            let span = info_span!(
                parent: None,
                "(nwc-request)",
                id = %event.id,
                from = %event.pubkey
            );
            let gateway = self.clone();
            let task_eph_tasks_tx = eph_tasks_tx.clone();
            let task_shutdown = shutdown.clone();
            let task = Task::spawn_with_span(name, span, async move {
                let _permit = permit;
                gateway
                    .handle_event(event, &task_eph_tasks_tx, &task_shutdown)
                    .await;
            });

            if let Err(e) = eph_tasks_tx.send(task).await {
                warn!("Couldn't hand off request task; shutting down?");
                e.0.detach();
            }
        }

        info!("Stopped serving wallet connect requests");
    }

    /// Handle a single inbound event and publish the response.
    ///
    /// Returns the id of the published response, or [`None`] if the event
    /// couldn't be answered: it isn't a request, it fails verification, it
    /// can't be decrypted, or publishing failed.
    pub async fn handle_event(
        &self,
        event: Event,
        eph_tasks_tx: &mpsc::Sender<Task<()>>,
        shutdown: &NotifyOnce,
    ) -> Option<EventId> {
        if event.kind != Kind::from_u16(nip47::REQUEST_KIND) {
            debug!(kind = %event.kind, "Ignoring event of unexpected kind");
            return None;
        }
        if let Err(e) = event.verify() {
            warn!("Dropping request with bad signature: {e}");
            return None;
        }

        let (plaintext, encryption) =
            match self.envelope.decrypt(&event.pubkey, &event.content) {
                Ok(decrypted) => decrypted,
                Err(e) => {
                    warn!("Dropping undecryptable request: {e:#}");
                    return None;
                }
            };

        let ctx = RequestContext {
            requester: event.pubkey,
            encryption,
            eph_tasks_tx: eph_tasks_tx.clone(),
            shutdown: shutdown.clone(),
        };
        let response = self.respond_to(&ctx, &plaintext).await;

        match self.publish_response(&event, encryption, &response).await {
            Ok(id) => {
                debug!(%id, result_type = %response.result_type, "Responded");
                Some(id)
            }
            Err(e) => {
                warn!("Failed to publish response: {e:#}");
                None
            }
        }
    }

    /// Parse, authorize, and dispatch a decrypted request.
    async fn respond_to(
        &self,
        ctx: &RequestContext,
        plaintext: &str,
    ) -> NwcResponsePayload {
        let request = match serde_json::from_str::<NwcRequestPayload>(plaintext)
        {
            Ok(request) => request,
            Err(e) => {
                warn!("Malformed request payload: {e}");
                let error = NwcError::internal(format!("Invalid request: {e}"));
                return NwcResponsePayload::new(
                    ERROR_RESULT_TYPE.to_owned(),
                    Err(error),
                );
            }
        };

        let result_type = request.method.to_string();
        info!(method = %result_type, "Handling request");

        if !self.config.is_authorized(&ctx.requester) {
            warn!(requester = %ctx.requester, "Unknown client");
            let error = NwcError::unauthorized("unknown client");
            return NwcResponsePayload::new(result_type, Err(error));
        }

        let result = handlers::handle_nwc_request(self, ctx, &request).await;
        if let Err(e) = &result {
            warn!(method = %result_type, "Request failed: {e}");
        }
        NwcResponsePayload::new(result_type, result)
    }

    #[instrument(skip_all, name = "(publish-response)")]
    async fn publish_response(
        &self,
        request: &Event,
        encryption: Encryption,
        response: &NwcResponsePayload,
    ) -> anyhow::Result<EventId> {
        let json = serde_json::to_string(response)
            .context("Failed to serialize response")?;
        let content =
            self.envelope.encrypt(&request.pubkey, &json, encryption)?;
        let builder =
            EventBuilder::new(Kind::from_u16(nip47::RESPONSE_KIND), content)
                .tag(Tag::public_key(request.pubkey))
                .tag(Tag::event(request.id));
        let event = self.envelope.sign(builder)?;
        self.transport.publish(event).await
    }

    /// Publish a notification to a single client, encrypted with the scheme
    /// it used to talk to us.
    pub async fn publish_notification(
        &self,
        recipient: &PublicKey,
        encryption: Encryption,
        notification: &NwcNotificationPayload,
    ) -> anyhow::Result<EventId> {
        let json = serde_json::to_string(notification)
            .context("Failed to serialize notification")?;
        let content = self.envelope.encrypt(recipient, &json, encryption)?;
        let kind = Kind::from_u16(encryption.notification_kind());
        let builder =
            EventBuilder::new(kind, content).tag(Tag::public_key(*recipient));
        let event = self.envelope.sign(builder)?;
        let id = self.transport.publish(event).await?;
        info!(
            %id,
            notification_type = notification.notification_type.as_str(),
            "Sent notification",
        );
        Ok(id)
    }
}

fn custom_tag(name: &'static str, value: impl Into<String>) -> Tag {
    Tag::custom(TagKind::Custom(Cow::Borrowed(name)), [value.into()])
}

fn short_id(id: &EventId) -> String {
    let mut hex = id.to_hex();
    hex.truncate(8);
    hex
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use nostr::Keys;
    use payments_client::{
        RetryConfig,
        test_utils::{MockBackend, MockResponse},
    };
    use serde_json::{Value, json};

    use super::*;
    use crate::{
        balance::FixedBalance,
        invoice::test::{AMOUNTLESS_INVOICE, FIFTY_SAT_INVOICE},
        nip47::{NwcErrorCode, TransactionType},
        test_utils::{MemoryTransport, TestClient, tag_value},
    };

    const WALLET_ID: &str = "wallet-1";
    const BALANCE_MSATS: u64 = 21_000;
    const PREIMAGE: &str =
        "0101010101010101010101010101010101010101010101010101010101010101";

    /// A gateway serving an in-memory relay, backed by a mock backend.
    struct Harness {
        backend: MockBackend,
        transport: Arc<MemoryTransport>,
        gateway: Gateway,
        shutdown: NotifyOnce,
        _eph_tasks_rx: mpsc::Receiver<Task<()>>,
        serve_task: Option<Task<()>>,
    }

    impl Harness {
        async fn new() -> Self {
            Self::with_config(GatewayConfig::new(WALLET_ID.to_owned())).await
        }

        async fn with_config(config: GatewayConfig) -> Self {
            logger::init_for_testing();

            let backend = MockBackend::spawn().await;
            let retry = RetryConfig {
                max_retries: 20,
                retry_delay: Duration::from_millis(20),
                ..RetryConfig::default()
            };
            let transport = Arc::new(MemoryTransport::new());
            let gateway = Gateway::new(
                backend.client(retry),
                Envelope::new(Keys::generate()),
                transport.clone(),
                Arc::new(FixedBalance(BALANCE_MSATS)),
                config,
            );

            let events = gateway.subscribe().await.unwrap();
            let shutdown = NotifyOnce::new();
            let (eph_tasks_tx, eph_tasks_rx) =
                mpsc::channel(bridge_tokio::EPHEMERAL_TASKS_CHANNEL_SIZE);
            let serve_task = Task::spawn(
                "nwc-gateway",
                gateway.clone().serve(events, shutdown.clone(), eph_tasks_tx),
            );

            Self {
                backend,
                transport,
                gateway,
                shutdown,
                _eph_tasks_rx: eph_tasks_rx,
                serve_task: Some(serve_task),
            }
        }

        fn client(&self) -> TestClient {
            TestClient::new(self.gateway.public_key())
        }

        /// Send a request and wait for the next published event, which must
        /// be its response.
        async fn ask(
            &self,
            client: &TestClient,
            request: Event,
        ) -> NwcResponsePayload {
            let request_id = request.id;
            self.transport.inject(request);
            let event = self.transport.next_published().await;
            assert_eq!(tag_value(&event, "e"), Some(request_id.to_hex()));
            client.response(&event)
        }

        /// Wait for the next `n` published events, split into responses and
        /// notifications.
        async fn next_events(&self, n: usize) -> (Vec<Event>, Vec<Event>) {
            let mut responses = Vec::new();
            let mut notifications = Vec::new();
            for _ in 0..n {
                let event = self.transport.next_published().await;
                if event.kind == Kind::from_u16(nip47::RESPONSE_KIND) {
                    responses.push(event);
                } else {
                    notifications.push(event);
                }
            }
            (responses, notifications)
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.shutdown.send();
        }
    }

    fn error_code(response: &NwcResponsePayload) -> NwcErrorCode {
        assert!(response.result.is_none());
        response.error.clone().expect("No error").code
    }

    fn result(response: &NwcResponsePayload) -> Value {
        assert!(response.error.is_none(), "{:?}", response.error);
        response.result.clone().expect("No result")
    }

    #[tokio::test]
    async fn unsupported_methods_never_touch_the_backend() {
        let h = Harness::new().await;
        let client = h.client();

        for method in ["lookup_invoice", "pay_keysend", "teleport"] {
            let response =
                h.ask(&client, client.request(method, json!({}))).await;
            assert_eq!(response.result_type, method);
            assert_eq!(error_code(&response), NwcErrorCode::NotImplemented);
        }

        assert_eq!(h.backend.post_hits(), 0);
        assert_eq!(h.backend.get_hits(), 0);
    }

    #[tokio::test]
    async fn get_info_reports_identity() {
        let h = Harness::new().await;
        let client = h.client();

        let response =
            h.ask(&client, client.request("get_info", json!({}))).await;
        assert_eq!(response.result_type, "get_info");
        assert_eq!(
            result(&response),
            json!({
                "alias": "nwc-bridge",
                "color": "000000",
                "pubkey": h.gateway.public_key().to_hex(),
                "network": "mainnet",
                "methods":
                    ["pay_invoice", "make_invoice", "get_balance", "get_info"],
                "notifications": ["payment_received", "payment_sent"],
            })
        );
    }

    #[tokio::test]
    async fn get_balance_from_source() {
        let h = Harness::new().await;
        let client = h.client();

        let response =
            h.ask(&client, client.request("get_balance", Value::Null)).await;
        assert_eq!(response.result_type, "get_balance");
        assert_eq!(result(&response), json!({ "balance": BALANCE_MSATS }));
    }

    #[tokio::test]
    async fn undecryptable_request_is_dropped() {
        let h = Harness::new().await;
        let client = h.client();

        h.transport.inject(client.request_undecryptable());

        // The service keeps serving; the next thing published is the answer
        // to the next request.
        let response =
            h.ask(&client, client.request("get_info", json!({}))).await;
        assert_eq!(response.result_type, "get_info");
        assert_eq!(h.transport.published().len(), 1);
    }

    #[tokio::test]
    async fn events_of_other_kinds_are_ignored() {
        let h = Harness::new().await;
        let client = h.client();

        let note = EventBuilder::new(Kind::TextNote, "gm")
            .sign_with_keys(&Keys::generate())
            .unwrap();
        assert_eq!(
            h.gateway
                .handle_event(note, &mpsc::channel(1).0, &h.shutdown)
                .await,
            None,
        );

        let response =
            h.ask(&client, client.request("get_info", json!({}))).await;
        assert_eq!(response.result_type, "get_info");
        assert_eq!(h.transport.published().len(), 1);
    }

    #[tokio::test]
    async fn malformed_payload_gets_error_result_type() {
        let h = Harness::new().await;
        let client = h.client();

        let request = client.request_raw("this is not json", Encryption::Nip44);
        let response = h.ask(&client, request).await;
        assert_eq!(response.result_type, ERROR_RESULT_TYPE);
        assert_eq!(error_code(&response), NwcErrorCode::Internal);
    }

    #[tokio::test]
    async fn bad_params_are_internal_errors() {
        let h = Harness::new().await;
        let client = h.client();

        let request = client.request("make_invoice", json!({ "amount": "x" }));
        let response = h.ask(&client, request).await;
        assert_eq!(response.result_type, "make_invoice");
        assert_eq!(error_code(&response), NwcErrorCode::Internal);
        assert_eq!(h.backend.post_hits(), 0);
    }

    #[tokio::test]
    async fn unknown_clients_are_unauthorized() {
        let known = Keys::generate();
        let mut config = GatewayConfig::new(WALLET_ID.to_owned());
        config.authorized_clients = vec![known.public_key()];
        let h = Harness::with_config(config).await;

        let stranger = h.client();
        let response =
            h.ask(&stranger, stranger.request("get_balance", json!({}))).await;
        assert_eq!(response.result_type, "get_balance");
        assert_eq!(error_code(&response), NwcErrorCode::Unauthorized);

        let friend = TestClient::with_keys(known, h.gateway.public_key());
        let response =
            h.ask(&friend, friend.request("get_balance", json!({}))).await;
        assert_eq!(result(&response), json!({ "balance": BALANCE_MSATS }));
    }

    #[tokio::test]
    async fn nip04_requests_get_nip04_responses() {
        let h = Harness::new().await;
        let client = h.client();

        let request = client.request_nip04("get_info", json!({}));
        let request_id = request.id;
        h.transport.inject(request);

        let event = h.transport.next_published().await;
        assert_eq!(tag_value(&event, "e"), Some(request_id.to_hex()));
        assert_eq!(Encryption::detect(&event.content), Encryption::Nip04);
        assert_eq!(client.response(&event).result_type, "get_info");
    }

    #[tokio::test]
    async fn make_invoice_then_notify_when_paid() {
        let h = Harness::new().await;
        let client = h.client();

        h.backend.push_post(MockResponse::record(
            "receiving",
            json!({ "payment_request": FIFTY_SAT_INVOICE }),
        ));
        h.backend.push_gets([
            MockResponse::record("receiving", json!({})),
            MockResponse::record(
                "completed",
                json!({ "amount_msats": 50_000, "preimage": PREIMAGE }),
            ),
        ]);

        let request = client.request(
            "make_invoice",
            json!({ "amount": 50_000, "description": "coffee" }),
        );
        let request_id = request.id;
        h.transport.inject(request);

        let (responses, notifications) = h.next_events(2).await;
        let [response] = responses.as_slice() else {
            panic!("Expected one response, got {responses:?}");
        };
        assert_eq!(tag_value(response, "e"), Some(request_id.to_hex()));
        let response = client.response(response);
        assert_eq!(response.result_type, "make_invoice");
        let made = result(&response);
        assert_eq!(made["type"], "incoming");
        assert_eq!(made["invoice"], FIFTY_SAT_INVOICE);
        assert_eq!(made["description"], "coffee");
        assert_eq!(made["amount"], 50_000);
        assert_eq!(made["metadata"], json!({}));
        assert_eq!(made["payment_hash"].as_str().unwrap().len(), 64);

        let [notification] = notifications.as_slice() else {
            panic!("Expected one notification, got {notifications:?}");
        };
        assert_eq!(
            notification.kind,
            Kind::from_u16(nip47::NOTIFICATION_KIND)
        );
        assert_eq!(tag_value(notification, "e"), None);
        let notification = client.notification(notification);
        assert_eq!(
            notification.notification_type,
            NotificationType::PaymentReceived
        );
        assert_eq!(notification.notification.kind, TransactionType::Incoming);
        assert_eq!(notification.notification.preimage, PREIMAGE);
        assert_eq!(notification.notification.amount, 50_000);
        assert_eq!(
            notification.notification.payment_hash,
            made["payment_hash"]
        );

        let posted = h.backend.posted_bodies();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0]["amount_msats"], 50_000);
        assert_eq!(posted[0]["description"], "coffee");
        assert_eq!(posted[0]["wallet_id"], WALLET_ID);
    }

    #[tokio::test]
    async fn amountless_invoice_needs_an_amount() {
        let h = Harness::new().await;
        let client = h.client();

        let request = client
            .request("pay_invoice", json!({ "invoice": AMOUNTLESS_INVOICE }));
        let response = h.ask(&client, request).await;
        assert_eq!(response.result_type, "pay_invoice");
        assert_eq!(error_code(&response), NwcErrorCode::Internal);
        assert_eq!(h.backend.post_hits(), 0);
    }

    #[tokio::test]
    async fn pay_invoice_polls_until_completed() {
        let h = Harness::new().await;
        let client = h.client();

        h.backend.push_post(MockResponse::accepted());
        h.backend.push_gets([
            MockResponse::record("sending", json!({})),
            MockResponse::record("sending", json!({})),
            MockResponse::record(
                "completed",
                json!({ "preimage": PREIMAGE, "fees_msats": 1_000 }),
            ),
        ]);

        let request = client
            .request("pay_invoice", json!({ "invoice": FIFTY_SAT_INVOICE }));
        let request_id = request.id;
        h.transport.inject(request);

        let (responses, notifications) = h.next_events(2).await;
        let [response] = responses.as_slice() else {
            panic!("Expected one response, got {responses:?}");
        };
        assert_eq!(tag_value(response, "e"), Some(request_id.to_hex()));
        let response = client.response(response);
        assert_eq!(
            result(&response),
            json!({ "preimage": PREIMAGE, "fees_paid": 1_000 })
        );

        let [notification] = notifications.as_slice() else {
            panic!("Expected one notification, got {notifications:?}");
        };
        let notification = client.notification(notification);
        assert_eq!(
            notification.notification_type,
            NotificationType::PaymentSent
        );
        assert_eq!(notification.notification.kind, TransactionType::Outgoing);
        assert_eq!(notification.notification.amount, 50_000);
        assert_eq!(notification.notification.fees_paid, 1_000);

        // The invoice fixes the amount, so we don't send one.
        let posted = h.backend.posted_bodies();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0]["data"]["payment_request"], FIFTY_SAT_INVOICE);
        assert!(posted[0]["data"].get("amount_msats").is_none());
        assert_eq!(h.backend.get_hits(), 3);
    }

    #[tokio::test]
    async fn failed_payment_is_an_internal_error() {
        let h = Harness::new().await;
        let client = h.client();

        h.backend.push_post(MockResponse::Json(
            http::StatusCode::OK,
            json!({
                "id": "",
                "status": "failed",
                "error": "no route found",
                "data": {},
            }),
        ));

        let request = client.request(
            "pay_invoice",
            json!({ "invoice": AMOUNTLESS_INVOICE, "amount": 1_000 }),
        );
        let response = h.ask(&client, request).await;
        assert_eq!(error_code(&response), NwcErrorCode::Internal);
        let message = response.error.unwrap().message;
        assert!(message.contains("no route found"), "{message}");

        let posted = h.backend.posted_bodies();
        assert_eq!(posted[0]["data"]["amount_msats"], 1_000);
        assert_eq!(h.backend.get_hits(), 0);
    }

    #[tokio::test]
    async fn slow_payment_does_not_block_other_requests() {
        let h = Harness::new().await;
        let alice = h.client();
        let bob = h.client();

        // Alice's payment stays in flight for 10 polls.
        h.backend.push_post(MockResponse::accepted());
        let sending = MockResponse::record("sending", json!({}));
        h.backend.push_gets(std::iter::repeat_n(sending, 10));
        h.backend.push_get(MockResponse::record(
            "completed",
            json!({ "preimage": PREIMAGE, "fees_msats": 0 }),
        ));

        let alice_request = alice
            .request("pay_invoice", json!({ "invoice": FIFTY_SAT_INVOICE }));
        let alice_request_id = alice_request.id;
        h.transport.inject(alice_request);

        // Give alice's request a head start.
        tokio::time::sleep(Duration::from_millis(30)).await;
        let bob_request = bob.request("get_info", json!({}));
        let bob_request_id = bob_request.id;
        h.transport.inject(bob_request);

        let first = h.transport.next_published().await;
        assert_eq!(tag_value(&first, "e"), Some(bob_request_id.to_hex()));
        assert_eq!(bob.response(&first).result_type, "get_info");

        let (responses, _notifications) = h.next_events(2).await;
        let [alice_response] = responses.as_slice() else {
            panic!("Expected one response, got {responses:?}");
        };
        assert_eq!(
            tag_value(alice_response, "e"),
            Some(alice_request_id.to_hex())
        );
        let alice_response = alice.response(alice_response);
        assert_eq!(alice_response.result_type, "pay_invoice");
        assert_eq!(result(&alice_response)["preimage"], PREIMAGE);
    }

    #[tokio::test]
    async fn in_flight_cap_queues_requests() {
        let config = GatewayConfig {
            max_in_flight: 1,
            ..GatewayConfig::new(WALLET_ID.to_owned())
        };
        let h = Harness::with_config(config).await;
        let alice = h.client();
        let bob = h.client();

        h.backend.push_post(MockResponse::accepted());
        let sending = MockResponse::record("sending", json!({}));
        h.backend.push_gets(std::iter::repeat_n(sending, 5));
        h.backend.push_get(MockResponse::record(
            "completed",
            json!({ "preimage": PREIMAGE, "fees_msats": 0 }),
        ));

        let alice_request = alice
            .request("pay_invoice", json!({ "invoice": FIFTY_SAT_INVOICE }));
        let alice_request_id = alice_request.id;
        h.transport.inject(alice_request);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let bob_request = bob.request("get_info", json!({}));
        let bob_request_id = bob_request.id;
        h.transport.inject(bob_request);

        // Bob waits for alice's permit, so both get answered in order.
        let (responses, notifications) = h.next_events(3).await;
        assert_eq!(notifications.len(), 1);
        let [first, second] = responses.as_slice() else {
            panic!("Expected two responses, got {responses:?}");
        };
        assert_eq!(tag_value(first, "e"), Some(alice_request_id.to_hex()));
        assert_eq!(alice.response(first).result_type, "pay_invoice");
        assert_eq!(tag_value(second, "e"), Some(bob_request_id.to_hex()));
        assert_eq!(bob.response(second).result_type, "get_info");

        // The permit came back, so later requests still get through.
        let response = h.ask(&bob, bob.request("get_info", json!({}))).await;
        assert_eq!(response.result_type, "get_info");
    }

    #[tokio::test]
    async fn start_connects_announces_and_subscribes() {
        logger::init_for_testing();
        let backend = MockBackend::spawn().await;
        let transport = Arc::new(MemoryTransport::new());
        let gateway = Gateway::new(
            backend.client(RetryConfig::default()),
            Envelope::new(Keys::generate()),
            transport.clone(),
            Arc::new(FixedBalance(0)),
            GatewayConfig::new(WALLET_ID.to_owned()),
        );

        let _events = gateway.start().await.unwrap();
        assert!(transport.is_connected());
        assert_eq!(transport.filters().len(), 1);

        let info = transport.next_published().await;
        assert_eq!(info.kind, Kind::from_u16(nip47::INFO_KIND));
        assert_eq!(info.pubkey, gateway.public_key());
        assert!(info.verify().is_ok());
        assert_eq!(
            info.content,
            "pay_invoice make_invoice get_balance get_info"
        );
        assert_eq!(
            tag_value(&info, "notifications").as_deref(),
            Some("payment_received payment_sent")
        );
        assert_eq!(
            tag_value(&info, "encryption").as_deref(),
            Some("nip44_v2 nip04")
        );
    }

    #[tokio::test]
    async fn serve_returns_on_shutdown_or_stream_end() {
        let mut h = Harness::new().await;
        h.shutdown.send();
        let serve_task = h.serve_task.take().unwrap();
        tokio::time::timeout(Duration::from_secs(5), serve_task)
            .await
            .expect("Serve loop ignored shutdown")
            .unwrap();

        let mut h = Harness::new().await;
        h.transport.close_inbound();
        let serve_task = h.serve_task.take().unwrap();
        tokio::time::timeout(Duration::from_secs(5), serve_task)
            .await
            .expect("Serve loop outlived its event stream")
            .unwrap();
    }
}
