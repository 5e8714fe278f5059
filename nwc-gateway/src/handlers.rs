use std::time::Duration;

use anyhow::{Context, bail};
use bridge_tokio::{notify_once::NotifyOnce, task::Task};
use nostr::PublicKey;
use payments_client::{PaymentId, PaymentRecord, PaymentStatus, PollBound};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, info, info_span, warn};

use crate::{
    envelope::Encryption,
    gateway::Gateway,
    invoice::DecodedInvoice,
    nip47::{
        GetBalanceResult, GetInfoResult, MakeInvoiceParams, MakeInvoiceResult,
        NotificationType, NwcError, NwcMethod, NwcNotificationPayload,
        NwcRequestPayload, PayInvoiceParams, PayInvoiceResult,
        PaymentNotification, TransactionType,
    },
};

/// Everything a handler needs to know about who asked, plus handles for work
/// which outlives the request.
#[derive(Clone)]
pub(crate) struct RequestContext {
    pub requester: PublicKey,
    pub encryption: Encryption,
    pub eph_tasks_tx: mpsc::Sender<Task<()>>,
    pub shutdown: NotifyOnce,
}

/// Handle an NWC request by routing to the appropriate command handler.
pub(crate) async fn handle_nwc_request(
    gateway: &Gateway,
    ctx: &RequestContext,
    request_payload: &NwcRequestPayload,
) -> Result<Value, NwcError> {
    match &request_payload.method {
        NwcMethod::PayInvoice => {
            let params: PayInvoiceParams =
                parse_params(&request_payload.params, "pay_invoice")?;
            let result = handle_pay_invoice(gateway, ctx, params)
                .await
                .map_err(NwcError::internal)?;
            to_value(result, "pay_invoice")
        }
        NwcMethod::MakeInvoice => {
            let params: MakeInvoiceParams =
                parse_params(&request_payload.params, "make_invoice")?;
            let result = handle_make_invoice(gateway, ctx, params)
                .await
                .map_err(NwcError::internal)?;
            to_value(result, "make_invoice")
        }
        NwcMethod::GetBalance => {
            let result = handle_get_balance(gateway)
                .await
                .map_err(NwcError::internal)?;
            to_value(result, "get_balance")
        }
        NwcMethod::GetInfo => to_value(handle_get_info(gateway), "get_info"),
        method => Err(NwcError::not_implemented(method)),
    }
}

fn parse_params<T: DeserializeOwned>(
    params: &Value,
    method: &str,
) -> Result<T, NwcError> {
    serde_json::from_value(params.clone())
        .with_context(|| format!("Invalid {method} params"))
        .map_err(NwcError::internal)
}

fn to_value(result: impl Serialize, method: &str) -> Result<Value, NwcError> {
    serde_json::to_value(result)
        .with_context(|| format!("Failed to serialize {method} result"))
        .map_err(NwcError::internal)
}

async fn handle_pay_invoice(
    gateway: &Gateway,
    ctx: &RequestContext,
    params: PayInvoiceParams,
) -> anyhow::Result<PayInvoiceResult> {
    let invoice = DecodedInvoice::decode(&params.invoice)?;

    // The backend wants an amount only if the invoice doesn't fix one.
    let amount_msats = match (invoice.amount_msats, params.amount) {
        (Some(_), _) => 0,
        (None, Some(amount)) if amount > 0 => amount,
        (None, _) => bail!("Invoice has no amount and no `amount` was given"),
    };

    let payments = gateway.payments();
    let sent = payments
        .send_payment(
            &gateway.config().wallet_id,
            &params.invoice,
            amount_msats,
            None,
        )
        .await
        .context("Failed to send payment")?;

    let record = if sent.is_terminal() {
        sent
    } else {
        let record = payments
            .poll_status(sent.id, |record| {
                debug!(status = %record.status, "Outgoing payment status")
            })
            .await
            .context("Failed to confirm payment")?;
        sent.status.check_transition(record.status)?;
        record
    };

    match record.status {
        PaymentStatus::Completed => (),
        PaymentStatus::Failed => bail!(
            "Payment failed: {}",
            record.error().unwrap_or("no reason given")
        ),
        status => bail!("Payment ended up {status}"),
    }

    let preimage = record.data.preimage.clone().unwrap_or_else(|| {
        warn!(id = %record.id, "Completed payment has no preimage");
        String::new()
    });
    let fees_paid = record.data.fees_msats.unwrap_or_else(|| {
        warn!(id = %record.id, "Completed payment has no fee info");
        0
    });
    info!(id = %record.id, %fees_paid, "Payment completed");

    let notification = PaymentNotification {
        kind: TransactionType::Outgoing,
        invoice: params.invoice,
        description: invoice.description,
        description_hash: invoice.description_hash,
        preimage: preimage.clone(),
        payment_hash: invoice.payment_hash,
        amount: invoice.amount_msats.unwrap_or(amount_msats),
        fees_paid,
        created_at: invoice.created_at,
        expires_at: invoice.expires_at,
        settled_at: unix_now_secs(),
        metadata: json!({}),
    };
    spawn_notification(
        gateway,
        ctx,
        NotificationType::PaymentSent,
        notification,
    )
    .await;

    Ok(PayInvoiceResult {
        preimage,
        fees_paid,
    })
}

async fn handle_make_invoice(
    gateway: &Gateway,
    ctx: &RequestContext,
    params: MakeInvoiceParams,
) -> anyhow::Result<MakeInvoiceResult> {
    if params.description_hash.is_some() || params.expiry.is_some() {
        debug!("Backend picks description hash and expiry; ignoring params");
    }

    let record = gateway
        .payments()
        .create_receive_request(
            params.amount_msat,
            &gateway.config().wallet_id,
            params.description.as_deref(),
            None,
        )
        .await
        .context("Failed to create invoice")?;

    if record.status == PaymentStatus::Failed {
        bail!(
            "Invoice creation failed: {}",
            record.error().unwrap_or("no reason given")
        );
    }
    let invoice_str = record
        .payment_request()
        .context("Backend returned no invoice")?
        .to_owned();
    let invoice = DecodedInvoice::decode(&invoice_str)
        .context("Backend returned an invalid invoice")?;

    let result = MakeInvoiceResult {
        kind: TransactionType::Incoming,
        invoice: invoice_str,
        description: params.description.or(invoice.description),
        description_hash: params.description_hash.or(invoice.description_hash),
        payment_hash: invoice.payment_hash,
        amount: invoice.amount_msats.unwrap_or(params.amount_msat),
        created_at: invoice.created_at,
        expires_at: invoice.expires_at,
        metadata: params.metadata.unwrap_or_else(|| json!({})),
    };

    spawn_receive_watcher(gateway, ctx, record.id, result.clone()).await;

    Ok(result)
}

async fn handle_get_balance(
    gateway: &Gateway,
) -> anyhow::Result<GetBalanceResult> {
    let balance = gateway.balance().balance_msats().await?;
    Ok(GetBalanceResult { balance })
}

fn handle_get_info(gateway: &Gateway) -> GetInfoResult {
    let config = gateway.config();
    GetInfoResult {
        alias: config.alias.clone(),
        color: config.color.clone(),
        pubkey: gateway.public_key().to_hex(),
        network: config.network.clone(),
        methods: NwcMethod::supported_names(),
        notifications: NotificationType::all_names(),
    }
}

/// Publish a notification from an ephemeral task, so the response doesn't
/// wait on it.
async fn spawn_notification(
    gateway: &Gateway,
    ctx: &RequestContext,
    notification_type: NotificationType,
    notification: PaymentNotification,
) {
    let gateway = gateway.clone();
    let requester = ctx.requester;
    let encryption = ctx.encryption;
    let payload = NwcNotificationPayload {
        notification_type,
        notification,
    };
    let task = Task::spawn("nwc-notify", async move {
        if let Err(e) = gateway
            .publish_notification(&requester, encryption, &payload)
            .await
        {
            warn!("Failed to publish notification: {e:#}");
        }
    });
    send_eph_task(ctx, task).await;
}

/// How long past its expiry we keep watching an invoice, for payments which
/// settle right at the end.
const WATCH_GRACE: Duration = Duration::from_secs(60);

/// Watch a new invoice and notify the requester once it's paid. Gives up
/// once the invoice expired and `max_retries` polls are done, or on shutdown.
async fn spawn_receive_watcher(
    gateway: &Gateway,
    ctx: &RequestContext,
    id: PaymentId,
    invoice: MakeInvoiceResult,
) {
    let gateway = gateway.clone();
    let requester = ctx.requester;
    let encryption = ctx.encryption;
    let mut shutdown = ctx.shutdown.clone();
    let span = info_span!(parent: None, "(nwc-watch)", %id);

    let watch = async move {
        let max_fetches = gateway.payments().retry_config().max_retries;
        let bound =
            watch_bound(max_fetches, invoice.expires_at, unix_now_secs());
        let poll = gateway.payments().poll_status_within(id, bound, |_| ());
        let record = tokio::select! {
            () = shutdown.recv() => return,
            result = poll => match result {
                Ok(record) => record,
                Err(e) => return debug!("Stopped watching invoice: {e:#}"),
            },
        };
        if record.status != PaymentStatus::Completed {
            return info!(status = %record.status, "Invoice was not paid");
        }

        let payload = NwcNotificationPayload {
            notification_type: NotificationType::PaymentReceived,
            notification: received_notification(invoice, &record),
        };
        if let Err(e) = gateway
            .publish_notification(&requester, encryption, &payload)
            .await
        {
            warn!("Failed to publish notification: {e:#}");
        }
    };
    let task = Task::spawn_with_span(format!("nwc-watch-{id}"), span, watch);
    send_eph_task(ctx, task).await;
}

/// Poll at least `max_fetches` times, and until the invoice expired.
fn watch_bound(
    max_fetches: usize,
    expires_at: Option<u64>,
    now_secs: u64,
) -> PollBound {
    let deadline = expires_at
        .and_then(|expires_at| expires_at.checked_sub(now_secs))
        .map(|remaining| {
            Instant::now() + Duration::from_secs(remaining) + WATCH_GRACE
        });
    PollBound {
        max_fetches,
        deadline,
    }
}

fn received_notification(
    invoice: MakeInvoiceResult,
    record: &PaymentRecord,
) -> PaymentNotification {
    PaymentNotification {
        kind: TransactionType::Incoming,
        invoice: invoice.invoice,
        description: invoice.description,
        description_hash: invoice.description_hash,
        preimage: record.data.preimage.clone().unwrap_or_default(),
        payment_hash: invoice.payment_hash,
        amount: record.data.amount_msats.unwrap_or(invoice.amount),
        fees_paid: record.data.fees_msats.unwrap_or(0),
        created_at: invoice.created_at,
        expires_at: invoice.expires_at,
        settled_at: unix_now_secs(),
        metadata: invoice.metadata,
    }
}

async fn send_eph_task(ctx: &RequestContext, task: Task<()>) {
    if let Err(e) = ctx.eph_tasks_tx.send(task).await {
        // The task keeps running, we just can't wait on it at shutdown.
        let task = e.0;
        warn!("Couldn't hand off task '{}': shutting down?", task.name());
        task.detach();
    }
}

fn unix_now_secs() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
}
