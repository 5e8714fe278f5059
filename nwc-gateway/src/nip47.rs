//! NIP-47 (Nostr Wallet Connect) protocol structures.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Replaceable event advertising the methods a wallet service supports.
pub const INFO_KIND: u16 = 13194;
/// Encrypted request from a client app to the wallet service.
pub const REQUEST_KIND: u16 = 23194;
/// Encrypted response from the wallet service, tagged with the request id.
pub const RESPONSE_KIND: u16 = 23195;
/// Encrypted notification, NIP-04 flavor.
pub const NOTIFICATION_KIND_NIP04: u16 = 23196;
/// Encrypted notification, NIP-44 flavor.
pub const NOTIFICATION_KIND: u16 = 23197;

/// NWC request method.
///
/// Methods we don't know about are kept verbatim so the response can still
/// echo them in `result_type`.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum NwcMethod {
    PayInvoice,
    MultiPayInvoice,
    PayKeysend,
    MultiPayKeysend,
    MakeInvoice,
    LookupInvoice,
    ListTransactions,
    GetBalance,
    GetInfo,
    SignMessage,
    Unknown(String),
}

impl NwcMethod {
    /// The methods this wallet service actually handles.
    pub const SUPPORTED: [NwcMethod; 4] = [
        Self::PayInvoice,
        Self::MakeInvoice,
        Self::GetBalance,
        Self::GetInfo,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            Self::PayInvoice => "pay_invoice",
            Self::MultiPayInvoice => "multi_pay_invoice",
            Self::PayKeysend => "pay_keysend",
            Self::MultiPayKeysend => "multi_pay_keysend",
            Self::MakeInvoice => "make_invoice",
            Self::LookupInvoice => "lookup_invoice",
            Self::ListTransactions => "list_transactions",
            Self::GetBalance => "get_balance",
            Self::GetInfo => "get_info",
            Self::SignMessage => "sign_message",
            Self::Unknown(method) => method,
        }
    }

    pub fn is_supported(&self) -> bool {
        Self::SUPPORTED.contains(self)
    }

    /// The supported method names, e.g. for the info event.
    pub fn supported_names() -> Vec<String> {
        Self::SUPPORTED
            .iter()
            .map(|method| method.as_str().to_owned())
            .collect()
    }
}

impl From<&str> for NwcMethod {
    fn from(s: &str) -> Self {
        match s {
            "pay_invoice" => Self::PayInvoice,
            "multi_pay_invoice" => Self::MultiPayInvoice,
            "pay_keysend" => Self::PayKeysend,
            "multi_pay_keysend" => Self::MultiPayKeysend,
            "make_invoice" => Self::MakeInvoice,
            "lookup_invoice" => Self::LookupInvoice,
            "list_transactions" => Self::ListTransactions,
            "get_balance" => Self::GetBalance,
            "get_info" => Self::GetInfo,
            "sign_message" => Self::SignMessage,
            other => Self::Unknown(other.to_owned()),
        }
    }
}

impl fmt::Display for NwcMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for NwcMethod {
    fn serialize<S: Serializer>(
        &self,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for NwcMethod {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Self, D::Error> {
        let method = String::deserialize(deserializer)?;
        Ok(Self::from(method.as_str()))
    }
}

/// NWC request payload (decrypted).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NwcRequestPayload {
    pub method: NwcMethod,
    #[serde(default)]
    pub params: Value,
}

/// Parameters for `pay_invoice` command.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PayInvoiceParams {
    /// BOLT11 invoice string.
    pub invoice: String,
    /// Amount in millisats. Only used for amount-less invoices.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<u64>,
}

/// Parameters for `make_invoice` command.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MakeInvoiceParams {
    /// Amount in millisats.
    #[serde(rename = "amount")]
    pub amount_msat: u64,
    /// Invoice description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Invoice description hash (32 bytes hex).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description_hash: Option<String>,
    /// Invoice expiry in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<u32>,
    /// Generic metadata (e.g., zap/boostagram details). Echoed back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Result for `pay_invoice` command.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PayInvoiceResult {
    /// Payment preimage (hex).
    pub preimage: String,
    /// Routing fees paid, in millisats.
    pub fees_paid: u64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Incoming,
    Outgoing,
}

/// Result for `make_invoice` command.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MakeInvoiceResult {
    #[serde(rename = "type")]
    pub kind: TransactionType,
    /// BOLT11 invoice string.
    pub invoice: String,
    pub description: Option<String>,
    pub description_hash: Option<String>,
    /// Payment hash (hex).
    pub payment_hash: String,
    /// Amount in millisats.
    pub amount: u64,
    /// Unix timestamp, seconds.
    pub created_at: u64,
    /// Unix timestamp, seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    pub metadata: Value,
}

/// Result for `get_balance` command.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GetBalanceResult {
    /// Spendable balance in millisats.
    pub balance: u64,
}

/// Result for `get_info` command.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GetInfoResult {
    pub alias: String,
    pub color: String,
    pub pubkey: String,
    pub network: String,
    pub methods: Vec<String>,
    pub notifications: Vec<String>,
}

/// NWC error codes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NwcErrorCode {
    RateLimited,
    NotImplemented,
    InsufficientBalance,
    QuotaExceeded,
    Restricted,
    Unauthorized,
    Internal,
    Other,
}

/// NWC error response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NwcError {
    pub code: NwcErrorCode,
    pub message: String,
}

impl NwcError {
    pub fn new(code: NwcErrorCode, message: String) -> Self {
        Self { code, message }
    }

    pub fn not_implemented(message: impl fmt::Display) -> Self {
        let message = format!("Not implemented: {message:#}");
        Self {
            code: NwcErrorCode::NotImplemented,
            message,
        }
    }

    pub fn unauthorized(message: impl fmt::Display) -> Self {
        let message = format!("Unauthorized: {message:#}");
        Self {
            code: NwcErrorCode::Unauthorized,
            message,
        }
    }

    pub fn internal(message: impl fmt::Display) -> Self {
        let message = format!("Internal error: {message:#}");
        Self {
            code: NwcErrorCode::Internal,
            message,
        }
    }
}

impl fmt::Display for NwcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

/// `result_type` of responses to requests we couldn't even parse.
pub const ERROR_RESULT_TYPE: &str = "error";

/// NWC response payload (to be encrypted).
///
/// Exactly one of `result` and `error` is set, but both are always
/// serialized; the unset one as `null`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NwcResponsePayload {
    pub result_type: String,
    pub error: Option<NwcError>,
    pub result: Option<Value>,
}

impl NwcResponsePayload {
    pub fn new(result_type: String, result: Result<Value, NwcError>) -> Self {
        match result {
            Ok(result) => Self {
                result_type,
                error: None,
                result: Some(result),
            },
            Err(error) => Self {
                result_type,
                error: Some(error),
                result: None,
            },
        }
    }
}

/// NWC notification types.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    PaymentReceived,
    PaymentSent,
}

impl NotificationType {
    pub const ALL: [NotificationType; 2] =
        [Self::PaymentReceived, Self::PaymentSent];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PaymentReceived => "payment_received",
            Self::PaymentSent => "payment_sent",
        }
    }

    pub fn all_names() -> Vec<String> {
        Self::ALL.iter().map(|t| t.as_str().to_owned()).collect()
    }
}

/// NWC notification payload (to be encrypted).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NwcNotificationPayload {
    pub notification_type: NotificationType,
    pub notification: PaymentNotification,
}

/// A settled payment, as described in notifications.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PaymentNotification {
    #[serde(rename = "type")]
    pub kind: TransactionType,
    pub invoice: String,
    pub description: Option<String>,
    pub description_hash: Option<String>,
    pub preimage: String,
    pub payment_hash: String,
    /// Millisats.
    pub amount: u64,
    /// Millisats.
    pub fees_paid: u64,
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    pub settled_at: u64,
    pub metadata: Value,
}
