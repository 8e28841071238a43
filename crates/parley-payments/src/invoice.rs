use std::str::FromStr;

use lightning_invoice::Bolt11Invoice;

use parley_core::error::ParleyError;

/// The fields the protocol engines need from a BOLT11 invoice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedInvoice {
    pub amount_sats: u64,
    /// Hex-encoded payment hash.
    pub payment_hash: String,
    pub expiry_secs: u64,
}

/// Parse a BOLT11 string. Amountless invoices are rejected; the protocol
/// always quotes a concrete price.
pub fn parse_invoice(bolt11: &str) -> Result<ParsedInvoice, ParleyError> {
    let invoice = Bolt11Invoice::from_str(bolt11.trim())
        .map_err(|e| ParleyError::InvoiceParse(e.to_string()))?;

    let msats = invoice
        .amount_milli_satoshis()
        .ok_or_else(|| ParleyError::InvoiceParse("invoice carries no amount".into()))?;

    Ok(ParsedInvoice {
        amount_sats: msats / 1000,
        payment_hash: invoice.payment_hash().to_string(),
        expiry_secs: invoice.expiry_time().as_secs(),
    })
}

/// Whether `preimage_hex` settles `bolt11`: sha256(preimage) must equal the
/// invoice payment hash.
pub fn verify_proof(bolt11: &str, preimage_hex: &str) -> Result<bool, ParleyError> {
    let parsed = parse_invoice(bolt11)?;
    let preimage = hex::decode(preimage_hex.trim())
        .map_err(|e| ParleyError::InvoiceParse(format!("preimage hex: {e}")))?;

    use sha2::{Digest, Sha256};
    let hash = hex::encode(Sha256::digest(&preimage));
    Ok(hash == parsed.payment_hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fake_invoice;

    #[test]
    fn parse_extracts_amount_and_hash() {
        let preimage = [7u8; 32];
        let bolt11 = fake_invoice(10, &preimage);
        let parsed = parse_invoice(&bolt11).unwrap();
        assert_eq!(parsed.amount_sats, 10);

        use sha2::{Digest, Sha256};
        assert_eq!(parsed.payment_hash, hex::encode(Sha256::digest(preimage)));
    }

    #[test]
    fn verify_proof_accepts_the_right_preimage_only() {
        let preimage = [9u8; 32];
        let bolt11 = fake_invoice(21, &preimage);
        assert!(verify_proof(&bolt11, &hex::encode(preimage)).unwrap());
        assert!(!verify_proof(&bolt11, &hex::encode([8u8; 32])).unwrap());
    }

    #[test]
    fn garbage_is_an_invoice_parse_error() {
        let err = parse_invoice("lightning? never heard of it").unwrap_err();
        assert_eq!(err.code(), "invoice-parse");
        assert_eq!(err.kind(), "payment");
    }
}
