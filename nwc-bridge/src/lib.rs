//! # nwc-bridge
//!
//! Runs a Nostr Wallet Connect (NIP-47) wallet service for a wallet held by
//! a hosted Lightning payments backend. Client apps pair with the service by
//! pasting the connection string logged at startup, then pay and create
//! invoices through the backend wallet.
//!
//! The service is stateless: nothing is stored on disk, and payment ids are
//! generated fresh for every request.

pub mod cli;
pub mod or_env;
pub mod run;
