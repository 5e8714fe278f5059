use std::{borrow::Cow, time::Duration};

use bytes::Bytes;
use http::{
    Method, StatusCode,
    header::{HeaderMap, HeaderName, HeaderValue},
};
use reqwest::IntoUrl;
use secrecy::{ExposeSecret, SecretString};
use serde::{Serialize, de::DeserializeOwned};
use tokio::time::Instant;
use tracing::{Instrument, debug, field, info_span, warn};

use crate::{config::RetryConfig, error::PaymentsError};

/// Each individual attempt is bounded by this timeout.
pub const API_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The backend's credential header.
pub static API_KEY_HEADER: HeaderName = HeaderName::from_static("x-api-key");

// Avoid `Method::` prefix. Associated constants can't be imported
pub const GET: Method = Method::GET;
pub const POST: Method = Method::POST;

/// A JSON-over-HTTP client for the payments backend which applies the
/// transport-level retry policy to every request:
///
/// - `404` is retried: a just-created resource often isn't fetchable yet.
///   Still `404` after the last retry => [`PaymentsError::NotReady`].
/// - Network failures are retried the same way, then surface as
///   [`PaymentsError::Transport`].
/// - Any other non-2xx is logged and surfaces immediately as
///   [`PaymentsError::Http`], e.g. `403` for a bad credential.
#[derive(Clone)]
pub struct RestClient {
    client: reqwest::Client,
    /// The process that this [`RestClient`] is being called from.
    from: Cow<'static, str>,
    /// The service this [`RestClient`] is calling, e.g. "payments-backend".
    to: &'static str,
    retry: RetryConfig,
}

/// A successful response whose body has been read in full.
#[derive(Clone, Debug)]
pub struct RawResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

/// The result of a single attempt which reached the backend.
enum Attempt {
    Success(RawResponse),
    NotFound,
    Rejected { status: StatusCode, body: String },
}

impl RestClient {
    /// Builds a new [`RestClient`] which sends `api_key` with every request.
    pub fn new(
        from: impl Into<Cow<'static, str>>,
        to: &'static str,
        api_key: &SecretString,
        retry: RetryConfig,
    ) -> Result<Self, PaymentsError> {
        let from = from.into();

        let mut api_key_value = HeaderValue::from_str(api_key.expose_secret())
            .map_err(|_| {
                PaymentsError::Build("API key is not a valid header".to_owned())
            })?;
        api_key_value.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER.clone(), api_key_value);

        let client = reqwest::Client::builder()
            .user_agent(from.as_ref())
            .default_headers(headers)
            .timeout(API_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| PaymentsError::Build(format!("{e:#}")))?;

        Ok(Self {
            client,
            from,
            to,
            retry,
        })
    }

    #[inline]
    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    // --- RequestBuilder helpers --- //

    #[inline]
    pub fn get<U: IntoUrl>(&self, url: U) -> reqwest::RequestBuilder {
        self.client.request(GET, url)
    }

    #[inline]
    pub fn post<U, T>(&self, url: U, data: &T) -> reqwest::RequestBuilder
    where
        U: IntoUrl,
        T: Serialize + ?Sized,
    {
        self.client.request(POST, url).json(data)
    }

    // --- Request send/recv --- //

    /// Sends the request and JSON-deserializes the response body to `T`.
    pub async fn send_json<T: DeserializeOwned>(
        &self,
        request_builder: reqwest::RequestBuilder,
    ) -> Result<T, PaymentsError> {
        self.send(request_builder).await?.json()
    }

    /// Sends the request with the retry policy, returning the raw response.
    pub async fn send(
        &self,
        request_builder: reqwest::RequestBuilder,
    ) -> Result<RawResponse, PaymentsError> {
        let request = request_builder
            .build()
            .map_err(|e| PaymentsError::Build(format!("{e:#}")))?;
        let request_span = info_span!(
            "(http)",
            from = %self.from,
            to = self.to,
            method = %request.method(),
            path = %request.url().path(),
            attempts_left = field::Empty,
        );
        self.send_with_retries_inner(request)
            .instrument(request_span)
            .await
    }

    async fn send_with_retries_inner(
        &self,
        request: reqwest::Request,
    ) -> Result<RawResponse, PaymentsError> {
        let retries = self.retry.max_retries;
        let mut delays = self.retry.delays();
        let mut attempts = 0;

        // Do the 'retries' first.
        for _ in 0..retries {
            let attempts_left = retries + 1 - attempts;
            tracing::Span::current().record("attempts_left", attempts_left);

            // We only get None if the request body is streamed and not set up
            // front. In this case, we can't send more than once.
            let Some(request_clone) = request.try_clone() else {
                break;
            };

            attempts += 1;
            match self.send_inner(request_clone).await {
                Ok(Attempt::Success(resp)) => return Ok(resp),
                Ok(Attempt::Rejected { status, body }) =>
                    return Err(PaymentsError::Http {
                        status: status.as_u16(),
                        body,
                    }),
                // Not found yet, or couldn't reach the backend: retry.
                Ok(Attempt::NotFound) | Err(_) => (),
            }

            // sleep for a bit before next retry
            let delay = delays.next().unwrap_or(self.retry.retry_delay);
            tokio::time::sleep(delay).await;
        }

        // We ran out of retries; return the result of the 'main' attempt.
        tracing::Span::current().record("attempts_left", 1);
        attempts += 1;
        match self.send_inner(request).await {
            Ok(Attempt::Success(resp)) => Ok(resp),
            Ok(Attempt::NotFound) => Err(PaymentsError::NotReady { attempts }),
            Ok(Attempt::Rejected { status, body }) => Err(PaymentsError::Http {
                status: status.as_u16(),
                body,
            }),
            Err(e) => Err(PaymentsError::Transport {
                attempts,
                msg: format!("{e:#}"),
            }),
        }
    }

    /// A single attempt. Reads the full body so that body read failures count
    /// as transport failures.
    async fn send_inner(
        &self,
        request: reqwest::Request,
    ) -> Result<Attempt, reqwest::Error> {
        let start = Instant::now();
        debug!("New client request");

        // send the request, await the response headers
        let resp = self.client.execute(request).await.inspect_err(|e| {
            let req_time_ms = start.elapsed().as_millis();
            warn!(%req_time_ms, "Done (error)(sending) Error sending request: {e:#}");
        })?;

        let status = resp.status();
        let body = resp.bytes().await.inspect_err(|e| {
            let req_time_ms = start.elapsed().as_millis();
            warn!(
                %req_time_ms,
                %status,
                "Done (error)(receiving) Couldn't receive response body: {e:#}",
            );
        })?;
        let req_time_ms = start.elapsed().as_millis();

        if status.is_success() {
            debug!(%req_time_ms, %status, "Done (success)");
            Ok(Attempt::Success(RawResponse { status, body }))
        } else if status == StatusCode::NOT_FOUND {
            debug!(%req_time_ms, %status, "Done (not found)");
            Ok(Attempt::NotFound)
        } else {
            let body = String::from_utf8_lossy(&body).into_owned();
            warn!(
                %req_time_ms,
                %status,
                %body,
                "Done (error)(response) Backend returned error response",
            );
            Ok(Attempt::Rejected { status, body })
        }
    }
}

impl RawResponse {
    /// Whether the body is empty or whitespace.
    pub fn body_is_empty(&self) -> bool {
        self.body.iter().all(u8::is_ascii_whitespace)
    }

    /// JSON-deserializes the response body.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, PaymentsError> {
        serde_json::from_slice::<T>(&self.body).map_err(|err| {
            let mut msg = format!("JSON deserialization failed: {err:#}");

            // If we're in debug, append the response str to the error msg.
            if cfg!(any(debug_assertions, test, feature = "test-utils")) {
                let resp_msg = String::from_utf8_lossy(&self.body);
                msg.push_str(&format!(": '{resp_msg}'"));
            }

            PaymentsError::Decode(msg)
        })
    }
}
