//! nwc-bridge CLI

use std::time::Duration;

use anyhow::{anyhow, ensure};
use nostr::PublicKey;
use nwc_gateway::{
    GatewayConfig,
    config::{DEFAULT_MAX_IN_FLIGHT, NETWORKS},
};
use payments_client::{
    Backoff, BackendConfig, RetryConfig,
    config::{DEFAULT_API_URL, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY},
};
use secrecy::SecretString;

use crate::or_env::OrEnvExt as _;

pub const DEFAULT_RELAY_URL: &str = "wss://relay.getalby.com/v1";

/// Nostr Wallet Connect service for a hosted Lightning payments backend.
///
/// Every option can also be set with the env var named in its description,
/// or in a `.env` file.
// NOTE: Keep `.env.example` in sync with any changes here.
#[derive(argh::FromArgs, Debug, Default)]
pub struct BridgeArgs {
    /// the payments backend base url.
    /// Default: "https://voltageapi.com/v1".
    /// Env: `PAYMENTS_API_URL`.
    #[argh(option)]
    pub api_url: Option<String>,

    /// required: the payments backend API key.
    /// Env: `PAYMENTS_API_KEY`.
    #[argh(option)]
    pub api_key: Option<String>,

    /// required: the backend organization id.
    /// Env: `PAYMENTS_ORGANIZATION_ID`.
    #[argh(option)]
    pub organization_id: Option<String>,

    /// required: the backend environment id.
    /// Env: `PAYMENTS_ENVIRONMENT_ID`.
    #[argh(option)]
    pub environment_id: Option<String>,

    /// required: the backend wallet which pays and receives.
    /// Env: `PAYMENTS_WALLET_ID`.
    #[argh(option)]
    pub wallet_id: Option<String>,

    /// how many times to retry a not-yet-available or unreachable backend
    /// resource, and how many polls to wait for a payment to settle.
    /// Default: 30.
    /// Env: `PAYMENTS_MAX_RETRIES`.
    #[argh(option)]
    pub max_retries: Option<usize>,

    /// milliseconds between retries and polls.
    /// Default: 2000.
    /// Env: `PAYMENTS_RETRY_DELAY_MS`.
    #[argh(option)]
    pub retry_delay_ms: Option<u64>,

    /// double the delay after every retry (capped at 32 seconds).
    /// Env: `PAYMENTS_EXPONENTIAL_BACKOFF`.
    #[argh(switch)]
    pub exponential_backoff: bool,

    /// the relay which carries wallet connect requests.
    /// Default: "wss://relay.getalby.com/v1".
    /// Env: `NWC_RELAY_URL`.
    #[argh(option)]
    pub relay_url: Option<String>,

    /// the wallet service secret key (hex or nsec). A fresh key is generated
    /// if unset, which invalidates existing connections on restart.
    /// Env: `NWC_SERVICE_SECRET`.
    #[argh(option)]
    pub service_secret: Option<String>,

    /// the secret key handed to the client app in the connection string (hex
    /// or nsec). Only this client is served. Generated if unset.
    /// Env: `NWC_CLIENT_SECRET`.
    #[argh(option)]
    pub client_secret: Option<String>,

    /// how many requests to handle at once.
    /// Default: 16.
    /// Env: `NWC_MAX_IN_FLIGHT`.
    #[argh(option)]
    pub max_in_flight: Option<usize>,

    /// the Bitcoin network reported to clients.
    /// Options: ["mainnet", "testnet", "signet", "regtest"].
    /// Default: "mainnet".
    /// Env: `NWC_NETWORK`.
    #[argh(option)]
    pub network: Option<String>,

    /// the wallet name reported to clients.
    /// Default: "nwc-bridge".
    /// Env: `NWC_ALIAS`.
    #[argh(option)]
    pub alias: Option<String>,

    /// the wallet color reported to clients, as hex RGB.
    /// Default: "000000".
    /// Env: `NWC_COLOR`.
    #[argh(option)]
    pub color: Option<String>,
}

impl BridgeArgs {
    /// Parse the command line, then fill in unset args from env.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut args = argh::from_env::<Self>();
        args.or_env_mut()?;
        Ok(args)
    }

    /// Fill in unset args from their env vars.
    pub fn or_env_mut(&mut self) -> anyhow::Result<()> {
        self.api_url.or_env_mut("PAYMENTS_API_URL")?;
        self.api_key.or_env_mut("PAYMENTS_API_KEY")?;
        self.organization_id.or_env_mut("PAYMENTS_ORGANIZATION_ID")?;
        self.environment_id.or_env_mut("PAYMENTS_ENVIRONMENT_ID")?;
        self.wallet_id.or_env_mut("PAYMENTS_WALLET_ID")?;
        self.max_retries.or_env_mut("PAYMENTS_MAX_RETRIES")?;
        self.retry_delay_ms.or_env_mut("PAYMENTS_RETRY_DELAY_MS")?;
        self.exponential_backoff
            .or_env_mut("PAYMENTS_EXPONENTIAL_BACKOFF")?;
        self.relay_url.or_env_mut("NWC_RELAY_URL")?;
        self.service_secret.or_env_mut("NWC_SERVICE_SECRET")?;
        self.client_secret.or_env_mut("NWC_CLIENT_SECRET")?;
        self.max_in_flight.or_env_mut("NWC_MAX_IN_FLIGHT")?;
        self.network.or_env_mut("NWC_NETWORK")?;
        self.alias.or_env_mut("NWC_ALIAS")?;
        self.color.or_env_mut("NWC_COLOR")?;
        Ok(())
    }

    pub(crate) fn backend_config(&self) -> anyhow::Result<BackendConfig> {
        let api_key = required(&self.api_key, "api-key", "PAYMENTS_API_KEY")?;
        let organization_id = required(
            &self.organization_id,
            "organization-id",
            "PAYMENTS_ORGANIZATION_ID",
        )?;
        let environment_id = required(
            &self.environment_id,
            "environment-id",
            "PAYMENTS_ENVIRONMENT_ID",
        )?;
        let api_url = self.api_url.as_deref().unwrap_or(DEFAULT_API_URL);
        ensure!(
            api_url.starts_with("http://") || api_url.starts_with("https://"),
            "`--api-url` must be an http(s) url: {api_url}"
        );

        Ok(BackendConfig {
            api_url: api_url.to_owned(),
            api_key: SecretString::new(api_key.to_owned()),
            organization_id: organization_id.to_owned(),
            environment_id: environment_id.to_owned(),
        })
    }

    pub(crate) fn retry_config(&self) -> RetryConfig {
        let backoff = if self.exponential_backoff {
            Backoff::Exponential
        } else {
            Backoff::Fixed
        };
        RetryConfig {
            max_retries: self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            retry_delay: self
                .retry_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_RETRY_DELAY),
            backoff,
        }
    }

    /// The wallet service config, serving only `client_pk`.
    pub(crate) fn gateway_config(
        &self,
        client_pk: PublicKey,
    ) -> anyhow::Result<GatewayConfig> {
        let wallet_id =
            required(&self.wallet_id, "wallet-id", "PAYMENTS_WALLET_ID")?;
        let mut config = GatewayConfig::new(wallet_id.to_owned());

        if let Some(network) = &self.network {
            ensure!(
                NETWORKS.contains(&network.as_str()),
                "Unknown network '{network}'; expected one of {NETWORKS:?}"
            );
            config.network = network.clone();
        }
        if let Some(alias) = &self.alias {
            config.alias = alias.clone();
        }
        if let Some(color) = &self.color {
            let color = color.trim_start_matches('#');
            let is_rgb_hex = color.len() == 6
                && color.chars().all(|c| c.is_ascii_hexdigit());
            ensure!(is_rgb_hex, "`--color` must be 6 hex digits: {color}");
            config.color = color.to_ascii_lowercase();
        }
        let max_in_flight = self.max_in_flight.unwrap_or(DEFAULT_MAX_IN_FLIGHT);
        ensure!(max_in_flight > 0, "`--max-in-flight` must be at least 1");
        config.max_in_flight = max_in_flight;
        config.authorized_clients = vec![client_pk];

        Ok(config)
    }

    pub(crate) fn relay_url(&self) -> anyhow::Result<&str> {
        let relay_url = self.relay_url.as_deref().unwrap_or(DEFAULT_RELAY_URL);
        ensure!(
            relay_url.starts_with("wss://") || relay_url.starts_with("ws://"),
            "`--relay-url` must be a websocket url: {relay_url}"
        );
        Ok(relay_url)
    }
}

fn required<'a>(
    value: &'a Option<String>,
    flag: &str,
    env_var: &str,
) -> anyhow::Result<&'a str> {
    value
        .as_deref()
        .ok_or_else(|| anyhow!("Missing `--{flag}` (or `${env_var}`)"))
}
