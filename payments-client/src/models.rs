use std::{fmt, str::FromStr};

use http::StatusCode;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{error::PaymentsError, rest::RawResponse};

/// A client-generated, random 128-bit payment identifier.
///
/// A fresh id is generated for every creation call and is then used to fetch
/// the record. Ids are never reused or deduplicated.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaymentId(Uuid);

impl PaymentId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for PaymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.hyphenated(), f)
    }
}

impl FromStr for PaymentId {
    type Err = uuid::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentDirection {
    Send,
    Receive,
}

/// The lifecycle of a payment as reported by the backend.
///
/// ```text
/// sending   --> completed | failed
/// receiving --> completed | failed
/// ```
///
/// `completed` and `failed` are terminal.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Sending,
    Receiving,
    Completed,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sending => "sending",
            Self::Receiving => "receiving",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Validates an observed change from `self` to `next`.
    ///
    /// Observing the same status again is fine. The only real transitions are
    /// from an in-flight status to a terminal one; anything else means the
    /// backend broke the payment lifecycle.
    pub fn check_transition(
        self,
        next: PaymentStatus,
    ) -> Result<(), PaymentsError> {
        if self == next || (!self.is_terminal() && next.is_terminal()) {
            Ok(())
        } else {
            Err(PaymentsError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A payment as returned by `GET .../payments/{id}`.
///
/// Only `id` and `status` are required; the backend omits most other fields
/// until they are known.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub id: PaymentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallet_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<PaymentDirection>,
    pub status: PaymentStatus,
    #[serde(default)]
    pub data: PaymentData,
    /// Human-readable failure reason. Only set when `status` is `failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PaymentData {
    /// The BOLT11 invoice. Generated by the backend for receives; echoed
    /// back for sends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_request: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount_msats: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_fee_msats: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
    /// Hex payment preimage, once a send completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preimage: Option<String>,
    /// Routing fees actually paid, once a send completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fees_msats: Option<u64>,
}

impl PaymentRecord {
    /// The payment amount, or `0` if it isn't fixed (yet).
    pub fn amount_msats(&self) -> u64 {
        self.data.amount_msats.unwrap_or(0)
    }

    /// The invoice text, if the backend has produced a non-empty one.
    pub fn payment_request(&self) -> Option<&str> {
        self.data
            .payment_request
            .as_deref()
            .filter(|invoice| !invoice.is_empty())
    }

    /// The failure reason, if any.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

// --- Creation requests --- //

const CURRENCY_BTC: &str = "btc";
const KIND_BOLT11: &str = "bolt11";

/// `POST .../payments` body requesting a new BOLT11 invoice.
#[derive(Clone, Debug, Serialize)]
pub struct ReceiveRequest<'a> {
    pub id: PaymentId,
    pub wallet_id: &'a str,
    pub currency: &'static str,
    pub amount_msats: u64,
    pub payment_kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_fee_msats: Option<u64>,
}

impl<'a> ReceiveRequest<'a> {
    pub fn new(
        id: PaymentId,
        wallet_id: &'a str,
        amount_msats: u64,
        description: Option<&'a str>,
        max_fee_msats: Option<u64>,
    ) -> Self {
        Self {
            id,
            wallet_id,
            currency: CURRENCY_BTC,
            amount_msats,
            payment_kind: KIND_BOLT11,
            description,
            max_fee_msats,
        }
    }
}

/// `POST .../payments` body paying a BOLT11 invoice.
#[derive(Clone, Debug, Serialize)]
pub struct SendRequest<'a> {
    pub id: PaymentId,
    pub wallet_id: &'a str,
    pub currency: &'static str,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub data: SendRequestData<'a>,
}

#[derive(Clone, Debug, Serialize)]
pub struct SendRequestData<'a> {
    pub payment_request: &'a str,
    /// `0` means the invoice fixes the amount, so the field is omitted.
    #[serde(skip_serializing_if = "is_zero")]
    pub amount_msats: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_fee_msats: Option<u64>,
}

impl<'a> SendRequest<'a> {
    pub fn new(
        id: PaymentId,
        wallet_id: &'a str,
        payment_request: &'a str,
        amount_msats: u64,
        max_fee_msats: Option<u64>,
    ) -> Self {
        Self {
            id,
            wallet_id,
            currency: CURRENCY_BTC,
            kind: KIND_BOLT11,
            data: SendRequestData {
                payment_request,
                amount_msats,
                max_fee_msats,
            },
        }
    }
}

fn is_zero(amount: &u64) -> bool {
    *amount == 0
}

// --- Creation responses --- //

/// The two shapes a creation call can answer with.
#[derive(Clone, Debug)]
pub enum CreateOutcome {
    /// `200`/`201` with the full record.
    Ready(PaymentRecord),
    /// `202` (or any success without a body): fetch the record later.
    Accepted,
}

impl CreateOutcome {
    pub(crate) fn from_response(
        resp: &RawResponse,
    ) -> Result<Self, PaymentsError> {
        if resp.status == StatusCode::ACCEPTED || resp.body_is_empty() {
            return Ok(Self::Accepted);
        }
        resp.json::<PaymentRecord>().map(Self::Ready)
    }
}

/// A wallet as returned by `GET .../wallets/{id}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WalletRecord {
    pub id: String,
    #[serde(default)]
    pub balances: Vec<WalletBalance>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WalletBalance {
    pub available: Amount,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Amount {
    pub amount: u64,
    /// "msats" or "sats". Missing means msats.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl Amount {
    pub fn as_msats(&self) -> u64 {
        match self.unit.as_deref() {
            Some("sat" | "sats") => self.amount.saturating_mul(1000),
            _ => self.amount,
        }
    }
}

impl WalletRecord {
    /// The spendable balance across all of this wallet's balance entries.
    pub fn available_msats(&self) -> u64 {
        self.balances
            .iter()
            .map(|balance| balance.available.as_msats())
            .fold(0, u64::saturating_add)
    }
}
