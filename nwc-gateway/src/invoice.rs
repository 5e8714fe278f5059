use std::str::FromStr;

use anyhow::anyhow;
use lightning_invoice::{Bolt11Invoice, Bolt11InvoiceDescriptionRef};

/// The fields of a BOLT11 invoice that Wallet Connect responses report.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DecodedInvoice {
    /// Hex.
    pub payment_hash: String,
    /// `None` if the payer chooses the amount.
    pub amount_msats: Option<u64>,
    /// Non-empty inline description.
    pub description: Option<String>,
    /// Hex hash of a description committed to out of band.
    pub description_hash: Option<String>,
    /// Unix timestamp, seconds.
    pub created_at: u64,
    /// Unix timestamp, seconds.
    pub expires_at: Option<u64>,
}

impl DecodedInvoice {
    pub fn decode(text: &str) -> anyhow::Result<Self> {
        let invoice = Bolt11Invoice::from_str(text.trim())
            .map_err(|e| anyhow!("Failed to parse Lightning invoice: {e}"))?;

        let (description, description_hash) = match invoice.description() {
            Bolt11InvoiceDescriptionRef::Direct(description)
                if !description.as_inner().0.is_empty() =>
                (Some(description.as_inner().0.clone()), None),
            Bolt11InvoiceDescriptionRef::Direct(_) => (None, None),
            Bolt11InvoiceDescriptionRef::Hash(hash) =>
                (None, Some(hash.0.to_string())),
        };

        Ok(Self {
            payment_hash: invoice.payment_hash().to_string(),
            amount_msats: invoice.amount_milli_satoshis(),
            description,
            description_hash,
            created_at: invoice.duration_since_epoch().as_secs(),
            expires_at: invoice.expires_at().map(|at| at.as_secs()),
        })
    }
}
