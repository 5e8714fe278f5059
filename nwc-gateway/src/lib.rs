//! A Nostr Wallet Connect (NIP-47) wallet service backed by the payments
//! backend.
//!
//! Client apps send encrypted requests to the service pubkey over a relay.
//! The [`Gateway`] decrypts each one, runs the matching payment operation
//! through a [`payments_client::PaymentsClient`], and publishes an encrypted
//! response tagged with the request id. Settled payments are also pushed to
//! the client as notifications.

/// `BalanceSource`, where `get_balance` answers come from.
pub mod balance;
/// Wallet service identity and limits.
pub mod config;
/// `nostr+walletconnect://` URIs for client apps.
pub mod connection;
/// NIP-44 / NIP-04 payload encryption and event signing.
pub mod envelope;
/// `Gateway`, the request/response loop.
pub mod gateway;
/// BOLT11 invoice fields reported to clients.
pub mod invoice;
/// NIP-47 wire types.
pub mod nip47;
/// `Transport`, the relay seam.
pub mod transport;

mod handlers;

/// An in-memory relay and a fake client app.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use balance::{BalanceSource, FixedBalance, WalletBalance};
pub use config::GatewayConfig;
pub use connection::ConnectionString;
pub use envelope::{Encryption, Envelope};
pub use gateway::Gateway;
pub use transport::{RelayTransport, Transport};
