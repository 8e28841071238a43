//! Test support: a deterministic in-memory wallet plus real signed BOLT11
//! invoices, so payment paths are exercised end to end without a node.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::{Secp256k1, SecretKey};
use lightning_invoice::{Currency, InvoiceBuilder, PaymentSecret};
use rand::RngCore;

use parley_core::error::ParleyError;

use crate::invoice::parse_invoice;
use crate::wallet::Wallet;

/// Build a real, signed BOLT11 invoice whose payment hash commits to
/// `preimage`.
pub fn fake_invoice(amount_sats: u64, preimage: &[u8; 32]) -> String {
    let payment_hash = sha256::Hash::hash(preimage);
    let secp = Secp256k1::new();
    let node_key = SecretKey::from_slice(&[41; 32]).expect("static test key is valid");

    InvoiceBuilder::new(Currency::Bitcoin)
        .description("parley test invoice".into())
        .payment_hash(payment_hash)
        .payment_secret(PaymentSecret([42; 32]))
        .amount_milli_satoshis(amount_sats * 1000)
        .current_timestamp()
        .min_final_cltv_expiry_delta(18)
        .build_signed(|hash| secp.sign_ecdsa_recoverable(hash, &node_key))
        .expect("test invoice construction is infallible")
        .to_string()
}

/// In-memory wallet: `make_invoice` mints an invoice with a random preimage,
/// `pay_invoice` settles any invoice this wallet (or a shared clone) minted.
/// Sharing one instance between a test's expert and client simulates the
/// Lightning network.
#[derive(Default)]
pub struct MockWallet {
    preimages: Mutex<HashMap<String, String>>,
    paid: AtomicUsize,
    corrupt: AtomicBool,
}

impl MockWallet {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many invoices were actually paid.
    pub fn payments_made(&self) -> usize {
        self.paid.load(Ordering::SeqCst)
    }

    /// Make every future payment return a wrong preimage.
    pub fn corrupt_preimages(&self) {
        self.corrupt.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Wallet for MockWallet {
    async fn pay_invoice(&self, bolt11: &str) -> Result<String, ParleyError> {
        let parsed = parse_invoice(bolt11)?;
        let preimage = self
            .preimages
            .lock()
            .expect("mock wallet mutex poisoned")
            .get(&parsed.payment_hash)
            .cloned()
            .ok_or_else(|| ParleyError::PayFailed("no route to unknown invoice".into()))?;
        self.paid.fetch_add(1, Ordering::SeqCst);

        if self.corrupt.load(Ordering::SeqCst) {
            return Ok(hex::encode([0u8; 32]));
        }
        Ok(preimage)
    }

    async fn make_invoice(
        &self,
        amount_sats: u64,
        _description: &str,
    ) -> Result<String, ParleyError> {
        let mut preimage = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut preimage);
        let bolt11 = fake_invoice(amount_sats, &preimage);
        let parsed = parse_invoice(&bolt11)?;
        self.preimages
            .lock()
            .expect("mock wallet mutex poisoned")
            .insert(parsed.payment_hash, hex::encode(preimage));
        Ok(bolt11)
    }

    async fn balance(&self) -> Result<u64, ParleyError> {
        Ok(1_000_000)
    }
}
