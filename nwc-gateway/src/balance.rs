use anyhow::Context;
use async_trait::async_trait;
use payments_client::PaymentsClient;

/// Where `get_balance` gets its answer from.
#[async_trait]
pub trait BalanceSource: Send + Sync + 'static {
    /// The spendable balance, in millisats.
    async fn balance_msats(&self) -> anyhow::Result<u64>;
}

/// The available balance of a backend wallet.
pub struct WalletBalance {
    payments: PaymentsClient,
    wallet_id: String,
}

impl WalletBalance {
    pub fn new(payments: PaymentsClient, wallet_id: String) -> Self {
        Self {
            payments,
            wallet_id,
        }
    }
}

#[async_trait]
impl BalanceSource for WalletBalance {
    async fn balance_msats(&self) -> anyhow::Result<u64> {
        self.payments
            .get_wallet_balance(&self.wallet_id)
            .await
            .context("Failed to fetch wallet balance")
    }
}

/// Always reports the same balance.
pub struct FixedBalance(pub u64);

#[async_trait]
impl BalanceSource for FixedBalance {
    async fn balance_msats(&self) -> anyhow::Result<u64> {
        Ok(self.0)
    }
}
