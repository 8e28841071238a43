use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use parley_core::error::ParleyError;

use crate::invoice::{parse_invoice, verify_proof};
use crate::wallet::Wallet;

/// Payment front-end over one wallet. Payments are serialized: a Lightning
/// node may not tolerate concurrent operations over identical preimages, so
/// the wallet is exclusive while a payment is in flight.
pub struct PaymentClient {
    wallet: Arc<dyn Wallet>,
    lock: Mutex<()>,
}

impl PaymentClient {
    pub fn new(wallet: Arc<dyn Wallet>) -> Self {
        Self { wallet, lock: Mutex::new(()) }
    }

    pub fn wallet(&self) -> Arc<dyn Wallet> {
        self.wallet.clone()
    }

    /// Pay `bolt11` if its amount is within `max_amount_sats`. The preimage
    /// is checked against the payment hash before it is returned.
    pub async fn pay(&self, bolt11: &str, max_amount_sats: u64) -> Result<String, ParleyError> {
        let parsed = parse_invoice(bolt11)?;
        if parsed.amount_sats > max_amount_sats {
            return Err(ParleyError::AmountOverCap {
                amount: parsed.amount_sats,
                cap: max_amount_sats,
            });
        }

        let _guard = self.lock.lock().await;
        debug!(amount_sats = parsed.amount_sats, "paying invoice");
        let preimage = self.wallet.pay_invoice(bolt11).await?;

        if !verify_proof(bolt11, &preimage)? {
            return Err(ParleyError::PreimageMismatch);
        }
        info!(amount_sats = parsed.amount_sats, "invoice paid");
        Ok(preimage)
    }
}
