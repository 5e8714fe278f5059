//! A client for the payments backend's HTTP API.
//!
//! The backend creates payments asynchronously: a creation call may return
//! the full record, or just `202 Accepted`, in which case the record has to be
//! fetched (and polled) by the id we generated. [`PaymentsClient`] hides this
//! behind a few high-level operations, while [`rest::RestClient`] handles the
//! transport-level retry policy shared by every request.

/// `PaymentsClient`, the payment operations.
pub mod client;
/// Backend location, credentials, and retry configuration.
pub mod config;
/// `PaymentsError`.
pub mod error;
/// Wire types for payment records and creation requests.
pub mod models;
/// `RestClient` and the transport-level retry policy.
pub mod rest;

/// An in-process fake of the payments backend.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use client::{PaymentsClient, PollBound};
pub use config::{Backoff, BackendConfig, RetryConfig};
pub use error::PaymentsError;
pub use models::{
    CreateOutcome, PaymentData, PaymentDirection, PaymentId, PaymentRecord,
    PaymentStatus,
};
