use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::{
    config::{BackendConfig, RetryConfig},
    error::PaymentsError,
    models::{
        CreateOutcome, PaymentId, PaymentRecord, PaymentStatus,
        ReceiveRequest, SendRequest, WalletRecord,
    },
    rest::RestClient,
};

/// The user agent we present to the backend.
const USER_AGENT: &str = concat!("nwc-bridge/", env!("CARGO_PKG_VERSION"));

/// The payment operations offered by the backend, on top of [`RestClient`].
///
/// Cheap to clone; clones share the underlying connection pool.
#[derive(Clone)]
pub struct PaymentsClient {
    rest: RestClient,
    payments_url: String,
    config: BackendConfig,
}

impl PaymentsClient {
    pub fn new(
        config: &BackendConfig,
        retry: RetryConfig,
    ) -> Result<Self, PaymentsError> {
        let rest = RestClient::new(
            USER_AGENT,
            "payments-backend",
            &config.api_key,
            retry,
        )?;
        Ok(Self {
            rest,
            payments_url: config.payments_url(),
            config: config.clone(),
        })
    }

    #[inline]
    pub fn retry_config(&self) -> &RetryConfig {
        self.rest.retry_config()
    }

    /// Asks the backend for a new BOLT11 invoice and returns the record once
    /// the invoice text is available.
    ///
    /// If the backend only accepts the request, the record is polled until
    /// `data.payment_request` is non-empty, giving up with
    /// [`PaymentsError::Timeout`] after `max_retries` fetches. A record which
    /// fails in the meantime is returned as is.
    #[instrument(skip_all, name = "(create-receive)")]
    pub async fn create_receive_request(
        &self,
        amount_msats: u64,
        wallet_id: &str,
        description: Option<&str>,
        max_fee_msats: Option<u64>,
    ) -> Result<PaymentRecord, PaymentsError> {
        let id = PaymentId::generate();
        info!(%id, %amount_msats, "Creating receive request");
        let body = ReceiveRequest::new(
            id,
            wallet_id,
            amount_msats,
            description,
            max_fee_msats,
        );

        match self.create(id, &body).await? {
            CreateOutcome::Ready(record)
                if record.payment_request().is_some() =>
                Ok(record),
            CreateOutcome::Ready(_) | CreateOutcome::Accepted =>
                self.resolve_invoice(id).await,
        }
    }

    /// Pays a BOLT11 invoice.
    ///
    /// `amount_msats` must be `0` if the invoice fixes the amount, in which
    /// case it is left out of the request. The returned record is usually not
    /// terminal yet; see [`PaymentsClient::poll_status`].
    #[instrument(skip_all, name = "(send-payment)")]
    pub async fn send_payment(
        &self,
        wallet_id: &str,
        invoice: &str,
        amount_msats: u64,
        max_fee_msats: Option<u64>,
    ) -> Result<PaymentRecord, PaymentsError> {
        let id = PaymentId::generate();
        info!(%id, %amount_msats, "Sending payment");
        let body = SendRequest::new(
            id,
            wallet_id,
            invoice,
            amount_msats,
            max_fee_msats,
        );

        match self.create(id, &body).await? {
            CreateOutcome::Ready(record) => Ok(record),
            CreateOutcome::Accepted => self.get_payment(id).await,
        }
    }

    /// Fetches a payment record. Only the transport-level retries apply.
    pub async fn get_payment(
        &self,
        id: PaymentId,
    ) -> Result<PaymentRecord, PaymentsError> {
        let request = self.rest.get(self.config.payment_url(id));
        let record = self.rest.send_json::<PaymentRecord>(request).await?;
        check_id(id, &record)?;
        Ok(record)
    }

    /// Polls a payment until it reaches a terminal status.
    ///
    /// `on_status` sees every fetched record (repeated statuses included) in
    /// fetch order, and is never called after this returns. Gives up with
    /// [`PaymentsError::Timeout`] after `max_retries` fetches.
    pub async fn poll_status(
        &self,
        id: PaymentId,
        on_status: impl FnMut(&PaymentRecord),
    ) -> Result<PaymentRecord, PaymentsError> {
        let bound = PollBound::fetches(self.retry_config().max_retries);
        self.poll_status_within(id, bound, on_status).await
    }

    /// [`PaymentsClient::poll_status`] with a custom [`PollBound`].
    #[instrument(skip_all, name = "(poll-status)", fields(%id))]
    pub async fn poll_status_within(
        &self,
        id: PaymentId,
        bound: PollBound,
        mut on_status: impl FnMut(&PaymentRecord),
    ) -> Result<PaymentRecord, PaymentsError> {
        let mut delays = self.retry_config().delays();
        let mut last_status: Option<PaymentStatus> = None;

        let mut fetch = 0;
        while bound.allows(fetch) {
            if fetch > 0 {
                self.sleep(&mut delays).await;
            }
            fetch += 1;

            let Some(record) = self.fetch_if_visible(id).await? else {
                continue;
            };
            on_status(&record);

            if let Some(last_status) = last_status {
                last_status.check_transition(record.status).inspect_err(
                    |e| warn!("Backend broke payment lifecycle: {e:#}"),
                )?;
            }
            if record.is_terminal() {
                info!(status = %record.status, "Payment finished");
                return Ok(record);
            }

            debug!(status = %record.status, fetch, "Payment in flight");
            last_status = Some(record.status);
        }

        Err(PaymentsError::Timeout {
            attempts: fetch,
            waiting_for: "terminal payment status",
        })
    }

    /// The spendable balance of a wallet, in msats.
    #[instrument(skip_all, name = "(wallet-balance)")]
    pub async fn get_wallet_balance(
        &self,
        wallet_id: &str,
    ) -> Result<u64, PaymentsError> {
        let request = self.rest.get(self.config.wallet_url(wallet_id));
        let wallet = self.rest.send_json::<WalletRecord>(request).await?;
        Ok(wallet.available_msats())
    }

    /// `POST`s a creation request and decodes the response shape once.
    async fn create(
        &self,
        id: PaymentId,
        body: &impl serde::Serialize,
    ) -> Result<CreateOutcome, PaymentsError> {
        let request = self.rest.post(&self.payments_url, body);
        let resp = self.rest.send(request).await?;
        let outcome = CreateOutcome::from_response(&resp)?;
        match &outcome {
            CreateOutcome::Ready(record) => check_id(id, record)?,
            CreateOutcome::Accepted => debug!(%id, "Accepted; fetching later"),
        }
        Ok(outcome)
    }

    /// Polls a just-created receive until its invoice text shows up.
    async fn resolve_invoice(
        &self,
        id: PaymentId,
    ) -> Result<PaymentRecord, PaymentsError> {
        let max_fetches = self.retry_config().max_retries;
        let mut delays = self.retry_config().delays();

        for fetch in 0..max_fetches {
            if fetch > 0 {
                self.sleep(&mut delays).await;
            }

            let Some(record) = self.fetch_if_visible(id).await? else {
                continue;
            };
            if record.payment_request().is_some() {
                return Ok(record);
            }
            if record.status == PaymentStatus::Failed {
                warn!(%id, error = ?record.error(), "Receive request failed");
                return Ok(record);
            }
            debug!(%id, fetch, "Invoice not generated yet");
        }

        Err(PaymentsError::Timeout {
            attempts: max_fetches,
            waiting_for: "invoice",
        })
    }

    /// [`PaymentsClient::get_payment`] for poll loops: a payment which the
    /// backend still can't find after the transport retries is `None`, so
    /// that the loop keeps going.
    async fn fetch_if_visible(
        &self,
        id: PaymentId,
    ) -> Result<Option<PaymentRecord>, PaymentsError> {
        match self.get_payment(id).await {
            Ok(record) => Ok(Some(record)),
            Err(PaymentsError::NotReady { attempts }) => {
                debug!(%id, %attempts, "Payment not visible yet");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn sleep(&self, delays: &mut impl Iterator<Item = Duration>) {
        let delay = delays.next().unwrap_or(self.retry_config().retry_delay);
        tokio::time::sleep(delay).await;
    }
}

/// When a poll loop gives up.
///
/// A loop always fetches at least `max_fetches` times, and keeps going after
/// that until `deadline`, if there is one.
#[derive(Copy, Clone, Debug)]
pub struct PollBound {
    pub max_fetches: usize,
    pub deadline: Option<Instant>,
}

impl PollBound {
    pub fn fetches(max_fetches: usize) -> Self {
        Self {
            max_fetches,
            deadline: None,
        }
    }

    fn allows(&self, fetch: usize) -> bool {
        fetch < self.max_fetches
            || self.deadline.is_some_and(|deadline| Instant::now() < deadline)
    }
}

/// The backend must echo the id we generated.
fn check_id(
    id: PaymentId,
    record: &PaymentRecord,
) -> Result<(), PaymentsError> {
    if record.id == id {
        Ok(())
    } else {
        Err(PaymentsError::Decode(format!(
            "Expected payment {id}, got {}",
            record.id
        )))
    }
}

#[cfg(test)]
mod test {
    use http::StatusCode;
    use serde_json::json;

    use super::*;
    use crate::{
        config::Backoff,
        test_utils::{MockBackend, MockResponse, TEST_API_KEY},
    };

    const INVOICE: &str = "lntbs10u1pnxyz";

    fn retry(max_retries: usize, delay_ms: u64) -> RetryConfig {
        RetryConfig {
            max_retries,
            retry_delay: Duration::from_millis(delay_ms),
            backoff: Backoff::Fixed,
        }
    }

    /// The id the client generated for the `n`th creation call.
    fn posted_id(backend: &MockBackend, n: usize) -> PaymentId {
        backend.posted_bodies()[n]["id"].as_str().unwrap().parse().unwrap()
    }

    #[tokio::test]
    async fn receive_accepted_resolves_on_third_fetch() {
        logger::init_for_testing();
        let backend = MockBackend::spawn().await;
        let client = backend.client(retry(5, 5));

        backend.push_post(MockResponse::accepted());
        backend.push_gets([
            MockResponse::record("receiving", json!({})),
            MockResponse::record("receiving", json!({ "payment_request": "" })),
            MockResponse::record(
                "receiving",
                json!({ "payment_request": INVOICE, "amount_msats": 10_000 }),
            ),
        ]);

        let record = client
            .create_receive_request(10_000, "w1", None, None)
            .await
            .unwrap();

        assert_eq!(record.id, posted_id(&backend, 0));
        assert_eq!(record.status, PaymentStatus::Receiving);
        assert_eq!(record.payment_request(), Some(INVOICE));
        assert_eq!(backend.get_hits(), 3);
        assert_eq!(backend.post_hits(), 1);

        let body = &backend.posted_bodies()[0];
        assert_eq!(body["wallet_id"], "w1");
        assert_eq!(body["amount_msats"], 10_000);
        assert_eq!(body["payment_kind"], "bolt11");
        assert_eq!(body["currency"], "btc");
        assert!(body.get("description").is_none());
    }

    #[tokio::test]
    async fn receive_not_found_yet_is_absorbed() {
        let backend = MockBackend::spawn().await;
        let client = backend.client(retry(5, 5));

        backend.push_gets([
            MockResponse::not_found(),
            MockResponse::not_found(),
            MockResponse::record(
                "receiving",
                json!({ "payment_request": INVOICE }),
            ),
        ]);

        let record = client
            .create_receive_request(10_000, "w1", Some("coffee"), None)
            .await
            .unwrap();
        assert_eq!(record.payment_request(), Some(INVOICE));
        assert_eq!(backend.get_hits(), 3);
        assert_eq!(backend.posted_bodies()[0]["description"], "coffee");
    }

    #[tokio::test]
    async fn receive_times_out_without_invoice() {
        let backend = MockBackend::spawn().await;
        let client = backend.client(retry(3, 5));
        backend.set_get_fallback(MockResponse::record("receiving", json!({})));

        let err = client
            .create_receive_request(10_000, "w1", None, None)
            .await
            .unwrap_err();

        assert!(
            matches!(err, PaymentsError::Timeout { attempts: 3, .. }),
            "{err:#}"
        );
        assert_eq!(backend.get_hits(), 3);
    }

    #[tokio::test]
    async fn receive_ready_record_needs_no_fetch() {
        let backend = MockBackend::spawn().await;
        let client = backend.client(retry(3, 5));
        backend.push_post(MockResponse::Json(
            StatusCode::CREATED,
            json!({
                "id": "",
                "status": "receiving",
                "direction": "receive",
                "data": { "payment_request": INVOICE },
            }),
        ));

        let record = client
            .create_receive_request(1_000, "w1", None, None)
            .await
            .unwrap();
        assert_eq!(record.id, posted_id(&backend, 0));
        assert_eq!(backend.get_hits(), 0);
    }

    #[tokio::test]
    async fn receive_failure_is_not_a_timeout() {
        let backend = MockBackend::spawn().await;
        let client = backend.client(retry(10, 5));
        backend.push_get(MockResponse::Json(
            StatusCode::OK,
            json!({ "id": "", "status": "failed", "error": "wallet locked" }),
        ));

        let record = client
            .create_receive_request(1_000, "w1", None, None)
            .await
            .unwrap();
        assert_eq!(record.status, PaymentStatus::Failed);
        assert_eq!(record.error(), Some("wallet locked"));
        assert_eq!(backend.get_hits(), 1);
    }

    #[tokio::test]
    async fn send_amount_only_when_not_fixed() {
        let backend = MockBackend::spawn().await;
        let client = backend.client(retry(3, 5));
        backend.set_get_fallback(MockResponse::record("sending", json!({})));

        // Amount-less invoice: caller passes the amount
        client.send_payment("w1", INVOICE, 21_000, None).await.unwrap();
        // Invoice fixes the amount: caller passes 0
        client
            .send_payment("w1", INVOICE, 0, Some(500))
            .await
            .unwrap();

        let bodies = backend.posted_bodies();
        assert_eq!(bodies[0]["type"], "bolt11");
        assert_eq!(bodies[0]["data"]["payment_request"], INVOICE);
        assert_eq!(bodies[0]["data"]["amount_msats"], 21_000);
        assert!(bodies[0]["data"].get("max_fee_msats").is_none());

        assert!(bodies[1]["data"].get("amount_msats").is_none());
        assert_eq!(bodies[1]["data"]["max_fee_msats"], 500);

        assert_ne!(bodies[0]["id"], bodies[1]["id"]);
    }

    #[tokio::test]
    async fn send_accepted_fetches_exactly_once() {
        let backend = MockBackend::spawn().await;
        let client = backend.client(retry(3, 5));
        backend.push_get(MockResponse::record("sending", json!({})));

        let record = client.send_payment("w1", INVOICE, 0, None).await.unwrap();
        assert_eq!(record.id, posted_id(&backend, 0));
        assert_eq!(record.status, PaymentStatus::Sending);
        assert_eq!(backend.get_hits(), 1);
        assert_eq!(backend.get_ids(), [record.id.to_string()]);
    }

    #[tokio::test]
    async fn poll_status_observes_every_fetch_in_order() {
        let backend = MockBackend::spawn().await;
        let client = backend.client(retry(10, 5));
        backend.push_gets([
            MockResponse::record("sending", json!({})),
            MockResponse::record("sending", json!({})),
            MockResponse::record("completed", json!({ "preimage": "00ff" })),
            // Never fetched
            MockResponse::record("failed", json!({})),
        ]);

        let id = PaymentId::generate();
        let mut observed = Vec::new();
        let record = client
            .poll_status(id, |record| observed.push(record.status))
            .await
            .unwrap();

        assert_eq!(record.id, id);
        assert_eq!(record.status, PaymentStatus::Completed);
        assert_eq!(record.data.preimage.as_deref(), Some("00ff"));
        assert_eq!(
            observed,
            [
                PaymentStatus::Sending,
                PaymentStatus::Sending,
                PaymentStatus::Completed,
            ]
        );
        assert_eq!(backend.get_hits(), 3);
    }

    #[tokio::test]
    async fn poll_status_times_out() {
        let backend = MockBackend::spawn().await;
        let client = backend.client(retry(4, 5));
        backend.set_get_fallback(MockResponse::record("sending", json!({})));

        let mut observed = 0;
        let err = client
            .poll_status(PaymentId::generate(), |_| observed += 1)
            .await
            .unwrap_err();

        assert!(
            matches!(err, PaymentsError::Timeout { attempts: 4, .. }),
            "{err:#}"
        );
        assert_eq!(observed, 4);
        assert_eq!(backend.get_hits(), 4);
    }

    #[tokio::test]
    async fn receive_never_visible_times_out() {
        let backend = MockBackend::spawn().await;
        let client = backend.client(retry(2, 5));
        backend.push_post(MockResponse::accepted());

        let err = client
            .create_receive_request(10_000, "w1", None, None)
            .await
            .unwrap_err();

        assert!(
            matches!(err, PaymentsError::Timeout { attempts: 2, .. }),
            "{err:#}"
        );
        // Each poll exhausts the transport retries on `404`.
        assert_eq!(backend.get_hits(), 6);
    }

    #[tokio::test]
    async fn poll_status_keeps_going_through_not_found() {
        let backend = MockBackend::spawn().await;
        let client = backend.client(retry(3, 5));
        backend.push_gets([
            MockResponse::not_found(),
            MockResponse::not_found(),
            MockResponse::not_found(),
            MockResponse::not_found(),
            MockResponse::record("completed", json!({})),
        ]);

        let mut observed = Vec::new();
        let record = client
            .poll_status(PaymentId::generate(), |record| {
                observed.push(record.status)
            })
            .await
            .unwrap();

        assert_eq!(record.status, PaymentStatus::Completed);
        assert_eq!(observed, [PaymentStatus::Completed]);
        assert_eq!(backend.get_hits(), 5);
    }

    #[tokio::test]
    async fn poll_status_never_visible_times_out() {
        let backend = MockBackend::spawn().await;
        let client = backend.client(retry(2, 5));

        let err = client
            .poll_status(PaymentId::generate(), |_| ())
            .await
            .unwrap_err();

        assert!(
            matches!(err, PaymentsError::Timeout { attempts: 2, .. }),
            "{err:#}"
        );
        assert_eq!(backend.get_hits(), 6);
    }

    #[tokio::test]
    async fn poll_deadline_outlasts_fetch_bound() {
        let backend = MockBackend::spawn().await;
        let client = backend.client(retry(2, 5));
        backend.set_get_fallback(MockResponse::record("receiving", json!({})));

        let bound = PollBound {
            max_fetches: 2,
            deadline: Some(Instant::now() + Duration::from_millis(100)),
        };
        let err = client
            .poll_status_within(PaymentId::generate(), bound, |_| ())
            .await
            .unwrap_err();

        let PaymentsError::Timeout { attempts, .. } = err else {
            panic!("Expected a timeout, got {err:#}");
        };
        assert!(attempts > 2, "{attempts}");
        assert_eq!(backend.get_hits(), attempts);
    }

    #[tokio::test]
    async fn mismatched_ids_are_decode_errors() {
        let backend = MockBackend::spawn().await;
        let client = backend.client(retry(3, 5));
        let other = PaymentId::generate().to_string();

        backend.push_post(MockResponse::Verbatim(
            StatusCode::OK,
            json!({ "id": other, "status": "sending" }),
        ));
        let err = client
            .send_payment("w1", INVOICE, 0, None)
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentsError::Decode(_)), "{err:#}");
        assert_eq!(backend.get_hits(), 0);

        backend.push_get(MockResponse::Verbatim(
            StatusCode::OK,
            json!({ "id": other, "status": "sending" }),
        ));
        let err = client.get_payment(PaymentId::generate()).await.unwrap_err();
        assert!(matches!(err, PaymentsError::Decode(_)), "{err:#}");
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn poll_status_surfaces_invalid_transition() {
        let backend = MockBackend::spawn().await;
        let client = backend.client(retry(10, 5));
        backend.push_gets([
            MockResponse::record("sending", json!({})),
            MockResponse::record("receiving", json!({})),
        ]);

        let err = client
            .poll_status(PaymentId::generate(), |_| ())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PaymentsError::InvalidTransition {
                from: PaymentStatus::Sending,
                to: PaymentStatus::Receiving,
            }
        ));
    }

    #[tokio::test]
    async fn not_found_is_retried_with_spacing() {
        let backend = MockBackend::spawn().await;
        let client = backend.client(retry(3, 20));

        let err = client.get_payment(PaymentId::generate()).await.unwrap_err();

        assert!(
            matches!(err, PaymentsError::NotReady { attempts: 4 }),
            "{err:#}"
        );
        assert!(err.is_retryable());
        // One attempt plus `max_retries` retries
        assert_eq!(backend.get_hits(), 4);
        let times = backend.get_times();
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(20));
        }
    }

    #[tokio::test]
    async fn forbidden_is_never_retried() {
        let backend = MockBackend::spawn().await;
        let client = backend.client(retry(5, 5));
        backend.set_get_fallback(MockResponse::Json(
            StatusCode::FORBIDDEN,
            json!({ "message": "invalid api key" }),
        ));
        backend.push_post(MockResponse::Status(StatusCode::FORBIDDEN));

        let err = client.get_payment(PaymentId::generate()).await.unwrap_err();
        assert_eq!(err.http_status(), Some(403));
        assert!(!err.is_retryable());
        match &err {
            PaymentsError::Http { body, .. } =>
                assert!(body.contains("invalid api key")),
            other => panic!("Unexpected error: {other:#}"),
        }
        assert_eq!(backend.get_hits(), 1);

        let err = client
            .send_payment("w1", INVOICE, 0, None)
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), Some(403));
        assert_eq!(backend.post_hits(), 1);
    }

    #[tokio::test]
    async fn transport_failures_are_retried_then_surfaced() {
        // Grab a free port, then close it so connections are refused.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = BackendConfig {
            api_url: format!("http://{addr}"),
            ..MockBackend::spawn().await.config()
        };
        let client = PaymentsClient::new(&config, retry(2, 5)).unwrap();

        let err = client.get_payment(PaymentId::generate()).await.unwrap_err();
        assert!(
            matches!(err, PaymentsError::Transport { attempts: 3, .. }),
            "{err:#}"
        );
    }

    #[tokio::test]
    async fn api_key_is_sent() {
        let backend = MockBackend::spawn().await;
        let client = backend.client(retry(0, 5));
        backend.push_get(MockResponse::record("sending", json!({})));

        client.get_payment(PaymentId::generate()).await.unwrap();
        assert_eq!(
            backend.api_keys_seen(),
            [Some(TEST_API_KEY.to_owned())]
        );
    }

    #[tokio::test]
    async fn wallet_balance() {
        let backend = MockBackend::spawn().await;
        let client = backend.client(retry(0, 5));
        backend.set_wallet(json!({
            "id": "",
            "balances": [
                { "available": { "amount": 42_000, "unit": "msats" } },
            ],
        }));

        assert_eq!(client.get_wallet_balance("w1").await.unwrap(), 42_000);
    }
}
