use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Instant,
};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use bridge_tokio::{notify_once::NotifyOnce, task::Task};
use http::StatusCode;
use secrecy::SecretString;
use serde_json::{Value, json};
use tokio::net::TcpListener;

use crate::{
    client::PaymentsClient,
    config::{BackendConfig, RetryConfig},
    rest::API_KEY_HEADER,
};

pub const TEST_API_KEY: &str = "test-api-key";
pub const TEST_ORG: &str = "org";
pub const TEST_ENV: &str = "env";

/// A scripted response of the [`MockBackend`].
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Respond with this status and JSON body. If the body is an object with
    /// an `"id"` field, it is replaced with the id of the payment that was
    /// requested, so scripts don't need to know generated ids.
    Json(StatusCode, Value),
    /// Like [`MockResponse::Json`], but the `"id"` field is sent as is.
    Verbatim(StatusCode, Value),
    /// Respond with this status and an empty body, e.g. `202` or `404`.
    Status(StatusCode),
}

impl MockResponse {
    /// `200` with a payment record in `status`, with the given `data`.
    pub fn record(status: &str, data: Value) -> Self {
        Self::Json(
            StatusCode::OK,
            json!({ "id": "", "status": status, "data": data }),
        )
    }

    /// `202` with an empty body.
    pub fn accepted() -> Self {
        Self::Status(StatusCode::ACCEPTED)
    }

    pub fn not_found() -> Self {
        Self::Status(StatusCode::NOT_FOUND)
    }

    fn into_response(self, id: Option<&str>) -> Response {
        match self {
            Self::Status(status) => status.into_response(),
            Self::Json(status, mut value) => {
                if let (Some(id), Some(object)) = (id, value.as_object_mut())
                    && object.contains_key("id")
                {
                    object.insert("id".to_owned(), Value::from(id));
                }
                (status, Json(value)).into_response()
            }
            Self::Verbatim(status, value) =>
                (status, Json(value)).into_response(),
        }
    }
}

#[derive(Default)]
struct MockState {
    post_script: Mutex<VecDeque<MockResponse>>,
    get_script: Mutex<VecDeque<MockResponse>>,
    /// Answers GETs once `get_script` is exhausted. Defaults to `404`.
    get_fallback: Mutex<Option<MockResponse>>,
    wallet: Mutex<Option<Value>>,

    post_hits: AtomicUsize,
    get_hits: AtomicUsize,
    posted_bodies: Mutex<Vec<Value>>,
    /// (payment id, time received) of every GET.
    gets: Mutex<Vec<(String, Instant)>>,
    api_keys_seen: Mutex<Vec<Option<String>>>,
}

impl MockState {
    fn record_api_key(&self, headers: &HeaderMap) {
        let api_key = headers
            .get(&API_KEY_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        self.api_keys_seen.lock().unwrap().push(api_key);
    }
}

/// An in-process payments backend on an ephemeral localhost port, answering
/// from per-route scripts and recording what it received.
///
/// - `POST .../payments`: next scripted response, else `202`.
/// - `GET .../payments/{id}`: next scripted response, else the fallback.
/// - `GET .../wallets/{id}`: the configured wallet, else `404`.
pub struct MockBackend {
    url: String,
    state: Arc<MockState>,
    shutdown: NotifyOnce,
    _server_task: Task<()>,
}

impl MockBackend {
    pub async fn spawn() -> Self {
        let state = Arc::new(MockState::default());
        let router = Router::new()
            .route(
                "/organizations/{org}/environments/{env}/payments",
                post(create_payment),
            )
            .route(
                "/organizations/{org}/environments/{env}/payments/{id}",
                get(get_payment),
            )
            .route(
                "/organizations/{org}/environments/{env}/wallets/{wallet_id}",
                get(get_wallet),
            )
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock backend");
        let addr = listener.local_addr().expect("No local addr");
        let shutdown = NotifyOnce::new();
        let server_task = Task::spawn("mock-backend", {
            let shutdown = shutdown.clone();
            async move {
                axum::serve(listener, router)
                    .with_graceful_shutdown(shutdown.recv_owned())
                    .await
                    .expect("Mock backend failed");
            }
        });

        Self {
            url: format!("http://{addr}"),
            state,
            shutdown,
            _server_task: server_task,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// A [`BackendConfig`] pointing at this backend.
    pub fn config(&self) -> BackendConfig {
        BackendConfig {
            api_url: self.url.clone(),
            api_key: SecretString::new(TEST_API_KEY.to_owned()),
            organization_id: TEST_ORG.to_owned(),
            environment_id: TEST_ENV.to_owned(),
        }
    }

    /// A [`PaymentsClient`] talking to this backend.
    pub fn client(&self, retry: RetryConfig) -> PaymentsClient {
        PaymentsClient::new(&self.config(), retry)
            .expect("Failed to build client")
    }

    // --- Scripting --- //

    pub fn push_post(&self, resp: MockResponse) {
        self.state.post_script.lock().unwrap().push_back(resp);
    }

    pub fn push_get(&self, resp: MockResponse) {
        self.state.get_script.lock().unwrap().push_back(resp);
    }

    pub fn push_gets(&self, resps: impl IntoIterator<Item = MockResponse>) {
        self.state.get_script.lock().unwrap().extend(resps);
    }

    pub fn set_get_fallback(&self, resp: MockResponse) {
        *self.state.get_fallback.lock().unwrap() = Some(resp);
    }

    pub fn set_wallet(&self, wallet: Value) {
        *self.state.wallet.lock().unwrap() = Some(wallet);
    }

    // --- Inspection --- //

    pub fn post_hits(&self) -> usize {
        self.state.post_hits.load(Ordering::SeqCst)
    }

    pub fn get_hits(&self) -> usize {
        self.state.get_hits.load(Ordering::SeqCst)
    }

    pub fn posted_bodies(&self) -> Vec<Value> {
        self.state.posted_bodies.lock().unwrap().clone()
    }

    /// The time each GET of a payment was received, in order.
    pub fn get_times(&self) -> Vec<Instant> {
        let gets = self.state.gets.lock().unwrap();
        gets.iter().map(|(_, time)| *time).collect()
    }

    /// The payment id of each GET, in order.
    pub fn get_ids(&self) -> Vec<String> {
        let gets = self.state.gets.lock().unwrap();
        gets.iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn api_keys_seen(&self) -> Vec<Option<String>> {
        self.state.api_keys_seen.lock().unwrap().clone()
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.shutdown.send();
    }
}

async fn create_payment(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    state.post_hits.fetch_add(1, Ordering::SeqCst);
    state.record_api_key(&headers);
    let id = body.get("id").and_then(Value::as_str).map(str::to_owned);
    state.posted_bodies.lock().unwrap().push(body);

    let resp = state
        .post_script
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or_else(MockResponse::accepted);
    resp.into_response(id.as_deref())
}

async fn get_payment(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Path((_org, _env, id)): Path<(String, String, String)>,
) -> Response {
    state.get_hits.fetch_add(1, Ordering::SeqCst);
    state.record_api_key(&headers);
    state.gets.lock().unwrap().push((id.clone(), Instant::now()));

    let scripted = state.get_script.lock().unwrap().pop_front();
    let resp = scripted
        .or_else(|| state.get_fallback.lock().unwrap().clone())
        .unwrap_or_else(MockResponse::not_found);
    resp.into_response(Some(&id))
}

async fn get_wallet(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Path((_org, _env, wallet_id)): Path<(String, String, String)>,
) -> Response {
    state.record_api_key(&headers);
    let wallet = state.wallet.lock().unwrap().clone();
    match wallet {
        Some(wallet) => MockResponse::Json(StatusCode::OK, wallet)
            .into_response(Some(&wallet_id)),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
