use std::{sync::Arc, time::Duration};

use anyhow::Context;
use bridge_tokio::{
    EPHEMERAL_TASKS_CHANNEL_SIZE,
    notify_once::NotifyOnce,
    task::{self, Task},
};
use nostr::Keys;
use nwc_gateway::{
    ConnectionString, Envelope, Gateway, RelayTransport, Transport,
    WalletBalance,
};
use payments_client::PaymentsClient;
use secrecy::SecretString;
use tokio::sync::mpsc;
use tracing::{error, info, info_span, instrument, warn};

use crate::cli::BridgeArgs;

/// How long tasks get to finish after a shutdown signal.
const SHUTDOWN_TIME_LIMIT: Duration = Duration::from_secs(10);

/// The wired up service: a [`Gateway`] on a relay, backed by the payments
/// backend.
pub struct Bridge {
    gateway: Gateway,
    transport: Arc<RelayTransport>,
    /// Holds the client secret, so it never goes to the logs.
    connection_string: SecretString,
    shutdown: NotifyOnce,
}

impl Bridge {
    /// Validate the config and build everything. Doesn't touch the network.
    #[instrument(skip_all, name = "(bridge)")]
    pub fn init(args: BridgeArgs) -> anyhow::Result<Self> {
        let backend_config = args.backend_config()?;
        let retry_config = args.retry_config();
        let relay_url = args.relay_url()?.to_owned();

        let service_keys = load_or_generate(
            args.service_secret.as_deref(),
            "service",
            "NWC_SERVICE_SECRET",
        )?;
        let client_keys = load_or_generate(
            args.client_secret.as_deref(),
            "client",
            "NWC_CLIENT_SECRET",
        )?;
        let gateway_config = args.gateway_config(client_keys.public_key())?;
        info!(
            api_url = %backend_config.api_url,
            wallet_id = %gateway_config.wallet_id,
            network = %gateway_config.network,
            max_retries = retry_config.max_retries,
            retry_delay_ms = %retry_config.retry_delay.as_millis(),
            "Configured",
        );

        let payments = PaymentsClient::new(&backend_config, retry_config)
            .context("Failed to build payments client")?;
        let balance = Arc::new(WalletBalance::new(
            payments.clone(),
            gateway_config.wallet_id.clone(),
        ));
        let transport =
            Arc::new(RelayTransport::new(service_keys.clone(), &relay_url));

        let service_pk = service_keys.public_key();
        let connection_string = SecretString::new(
            ConnectionString {
                service_pk,
                relay_url: &relay_url,
                client_secret: client_keys.secret_key(),
            }
            .to_string(),
        );

        let gateway = Gateway::new(
            payments,
            Envelope::new(service_keys),
            transport.clone(),
            balance,
            gateway_config,
        );

        info!(
            %service_pk,
            relay = %relay_url,
            client_pk = %client_keys.public_key(),
            "Wallet connect service ready",
        );

        Ok(Self {
            gateway,
            transport,
            connection_string,
            shutdown: NotifyOnce::new(),
        })
    }

    /// The `nostr+walletconnect://` URI to paste into the client app.
    pub fn connection_string(&self) -> &SecretString {
        &self.connection_string
    }

    /// Call [`NotifyOnce::send`] on the returned channel to shut down.
    pub fn shutdown_channel(&self) -> NotifyOnce {
        self.shutdown.clone()
    }

    /// Connect to the relay and serve requests until shutdown.
    ///
    /// - Set `spawn_ctrlc_handler` to shut down on Ctrl+C.
    #[instrument(skip_all, name = "(bridge)")]
    pub async fn run(self, spawn_ctrlc_handler: bool) -> anyhow::Result<()> {
        let events = self.gateway.start().await?;

        if spawn_ctrlc_handler {
            spawn_ctrlc_handler_task(self.shutdown.clone()).detach();
        }

        let (eph_tasks_tx, eph_tasks_rx) =
            mpsc::channel(EPHEMERAL_TASKS_CHANNEL_SIZE);
        let gateway_task = Task::spawn_with_span(
            "nwc-gateway",
            info_span!("(gateway)"),
            self.gateway
                .clone()
                .serve(events, self.shutdown.clone(), eph_tasks_tx),
        );

        let result = task::try_join_tasks_and_shutdown(
            vec![gateway_task],
            eph_tasks_rx,
            self.shutdown,
            SHUTDOWN_TIME_LIMIT,
        )
        .await
        .context("Error awaiting tasks");

        self.transport.disconnect().await;
        info!("Disconnected from relay");
        result
    }
}

/// Parse a secret key given as hex or nsec, or generate a fresh one.
fn load_or_generate(
    secret: Option<&str>,
    which: &str,
    env_var: &str,
) -> anyhow::Result<Keys> {
    match secret {
        Some(secret) => Keys::parse(secret.trim())
            .with_context(|| format!("Invalid {which} secret (`${env_var}`)")),
        None => {
            warn!(
                "No {which} secret configured; generated a new one. \
                 Set `${env_var}` to keep the connection across restarts."
            );
            Ok(Keys::generate())
        }
    }
}

fn spawn_ctrlc_handler_task(shutdown: NotifyOnce) -> Task<()> {
    Task::spawn("ctrlc-handler", async move {
        use tokio::signal::ctrl_c;

        info!("Ctrl+C handler ready, press Ctrl+C to shut down.");
        if let Err(e) = ctrl_c().await {
            return error!("Error receiving first CTRL+C: {e}");
        }

        info!(
            "CTRL+C received, starting graceful shutdown. \
             Hit CTRL+C again to quit immediately."
        );
        shutdown.send();
        if let Err(e) = ctrl_c().await {
            return error!("Error receiving second CTRL+C: {e}");
        }
        std::process::exit(1);
    })
}
