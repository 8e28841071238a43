use async_trait::async_trait;

use parley_core::error::ParleyError;

/// The external Lightning wallet contract (NWC-class). Implementations talk
/// to a node or wallet service; the engines only see this trait.
#[async_trait]
pub trait Wallet: Send + Sync {
    /// Pay a BOLT11 invoice; resolves to the hex preimage.
    async fn pay_invoice(&self, bolt11: &str) -> Result<String, ParleyError>;

    /// Create an invoice for `amount_sats`.
    async fn make_invoice(&self, amount_sats: u64, description: &str)
        -> Result<String, ParleyError>;

    /// Spendable balance in sats.
    async fn balance(&self) -> Result<u64, ParleyError>;
}
