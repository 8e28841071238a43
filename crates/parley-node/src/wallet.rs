//! Relay-transported wallet client (NWC-style): requests are encrypted
//! events addressed to the wallet service pubkey, responses reference the
//! request id. The connection string carries the service pubkey, the relay,
//! and the client secret:
//! `nostr+walletconnect://<service_pubkey>?relay=<url>&secret=<hex>`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use parley_core::error::ParleyError;
use parley_core::event::UnsignedEvent;
use parley_core::filter::Filter;
use parley_core::types::Pubkey;
use parley_crypto::{decrypt, encrypt, sign_event, Keys};
use parley_payments::Wallet;
use parley_relay::{RelayPool, SubscriptionItem};

const KIND_WALLET_REQUEST: u32 = 23194;
const KIND_WALLET_RESPONSE: u32 = 23195;
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct RelayWallet {
    pool: Arc<RelayPool>,
    service: Pubkey,
    keys: Keys,
    relays: Vec<String>,
}

impl RelayWallet {
    /// Parse a wallet connection string and build the client.
    pub fn from_connection_string(pool: Arc<RelayPool>, nwc: &str) -> Result<Self, ParleyError> {
        let rest = nwc
            .strip_prefix("nostr+walletconnect://")
            .ok_or_else(|| ParleyError::BadKey("unrecognized wallet connection scheme".into()))?;
        let (service_hex, query) = rest
            .split_once('?')
            .ok_or_else(|| ParleyError::BadKey("wallet connection missing query".into()))?;

        let mut relay = None;
        let mut secret = None;
        for pair in query.split('&') {
            match pair.split_once('=') {
                Some(("relay", v)) => relay = Some(v.to_string()),
                Some(("secret", v)) => secret = Some(v.to_string()),
                _ => {}
            }
        }
        let relay = relay.ok_or_else(|| ParleyError::BadKey("wallet connection missing relay".into()))?;
        let secret =
            secret.ok_or_else(|| ParleyError::BadKey("wallet connection missing secret".into()))?;

        Ok(Self {
            pool,
            service: Pubkey::from_hex(service_hex)
                .map_err(|e| ParleyError::BadKey(format!("service pubkey: {e}")))?,
            keys: Keys::from_secret_hex(&secret)?,
            relays: vec![relay],
        })
    }

    async fn request(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value, ParleyError> {
        let body = json!({ "method": method, "params": params }).to_string();
        let content = encrypt(body.as_bytes(), &self.service, &self.keys)?;
        let request = sign_event(
            &self.keys,
            UnsignedEvent::new(
                self.keys.public(),
                KIND_WALLET_REQUEST,
                vec![vec!["p".into(), self.service.to_hex()]],
                content,
            ),
        );
        let request_id = request.id.to_hex();

        let filter = Filter::new()
            .kinds(vec![KIND_WALLET_RESPONSE])
            .authors(vec![self.service])
            .event_ref(&request_id);
        let mut sub = self.pool.subscribe(vec![filter], &self.relays).await?;
        self.pool
            .publish(&request, &self.relays, Duration::from_secs(10))
            .await?;

        let result = loop {
            let item = tokio::time::timeout(RESPONSE_TIMEOUT, sub.next())
                .await
                .map_err(|_| ParleyError::PayFailed(format!("wallet {method} timed out")))?;
            match item {
                Some(SubscriptionItem::Event(event)) => {
                    let plain = decrypt(&event.content, &event.pubkey, &self.keys)?;
                    let response: serde_json::Value = serde_json::from_slice(&plain)
                        .map_err(|e| ParleyError::Parse(format!("wallet response: {e}")))?;
                    if let Some(error) = response.get("error").filter(|e| !e.is_null()) {
                        break Err(ParleyError::PayFailed(error.to_string()));
                    }
                    break Ok(response.get("result").cloned().unwrap_or(serde_json::Value::Null));
                }
                Some(SubscriptionItem::Eose) => continue,
                None => break Err(ParleyError::Disconnected("wallet relay".into())),
            }
        };
        sub.close().await;
        result
    }
}

#[async_trait]
impl Wallet for RelayWallet {
    async fn pay_invoice(&self, bolt11: &str) -> Result<String, ParleyError> {
        let result = self.request("pay_invoice", json!({ "invoice": bolt11 })).await?;
        result
            .get("preimage")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| ParleyError::PayFailed("wallet returned no preimage".into()))
    }

    async fn make_invoice(
        &self,
        amount_sats: u64,
        description: &str,
    ) -> Result<String, ParleyError> {
        let result = self
            .request(
                "make_invoice",
                json!({ "amount": amount_sats * 1000, "description": description }),
            )
            .await?;
        result
            .get("invoice")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| ParleyError::PayFailed("wallet returned no invoice".into()))
    }

    async fn balance(&self) -> Result<u64, ParleyError> {
        let result = self.request("get_balance", json!({})).await?;
        result
            .get("balance")
            .and_then(|v| v.as_u64())
            .map(|msat| msat / 1000)
            .ok_or_else(|| ParleyError::PayFailed("wallet returned no balance".into()))
    }
}
